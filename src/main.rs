// ynab-bridge CLI - one-shot CSV inspection and import from the terminal.
// The recurring-sync surface lives in the API server binary.

use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ynab_bridge::{
    auto_detect_mapping, csv_import, db, engine, ledger, profiles, Settings, Source, YnabClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ynab_bridge=info".into()),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("init") => run_init(),
        Some("profiles") => run_profiles(),
        Some("detect") => run_detect(&args[2..]),
        Some("preview") => run_preview(&args[2..]),
        Some("import") => run_import(&args[2..]).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("ynab-bridge {}", ynab_bridge::VERSION);
    println!();
    println!("Usage:");
    println!("  ynab-bridge init");
    println!("  ynab-bridge profiles");
    println!("  ynab-bridge detect <file> [skip-rows]");
    println!("  ynab-bridge preview <file> <profile-key>");
    println!("  ynab-bridge import <file> <profile-key> <budget-id> <account-id>");
    println!();
    println!("Environment: DATABASE_PATH, YNAB_ACCESS_TOKEN");
}

fn run_init() -> Result<()> {
    let settings = Settings::from_env();
    db::open_database(&settings.database_path)?;
    println!("Database ready at {}", settings.database_path.display());
    Ok(())
}

fn run_profiles() -> Result<()> {
    for profile in profiles::all_profiles() {
        println!(
            "{:<10} {:<12} date={} amount={} payee={} memo={}",
            profile.key,
            profile.name,
            profile.date_column,
            profile.amount_column,
            profile.payee_column,
            profile.memo_column,
        );
    }
    Ok(())
}

fn run_detect(args: &[String]) -> Result<()> {
    let Some(file) = args.first() else {
        bail!("usage: ynab-bridge detect <file> [skip-rows]");
    };
    let skip_rows = args
        .get(1)
        .map(|v| v.parse::<usize>())
        .transpose()
        .context("skip-rows must be a number")?
        .unwrap_or(0);

    let content = read_file(file)?;
    let preview = csv_import::detect_columns(&content, skip_rows)?;

    println!("Columns: {}", preview.columns.join(", "));
    for row in &preview.preview_rows {
        println!("  {}", row.join(" | "));
    }

    let suggested = auto_detect_mapping(&preview.columns);
    println!();
    println!(
        "Suggested mapping: date={:?} amount={:?} payee={:?} memo={:?}",
        suggested.date, suggested.amount, suggested.payee, suggested.memo
    );
    Ok(())
}

fn run_preview(args: &[String]) -> Result<()> {
    let (Some(file), Some(key)) = (args.first(), args.get(1)) else {
        bail!("usage: ynab-bridge preview <file> <profile-key>");
    };
    let profile =
        profiles::profile(key).with_context(|| format!("unknown bank profile {key:?}"))?;

    let content = read_file(file)?;
    let outcome = csv_import::parse(&content, &profile.mapping())?;

    for candidate in &outcome.candidates {
        println!(
            "{}  {:>12.2}  {}",
            candidate.date,
            ynab_bridge::milliunits_to_decimal(candidate.amount_milliunits),
            candidate.payee,
        );
    }
    println!();
    println!(
        "{} candidates, {} rows failed to parse",
        outcome.candidates.len(),
        outcome.row_errors.len()
    );
    for error in &outcome.row_errors {
        println!("  row {}: {}", error.row, error.message);
    }
    Ok(())
}

async fn run_import(args: &[String]) -> Result<()> {
    let (Some(file), Some(key), Some(budget_id), Some(account_id)) =
        (args.first(), args.get(1), args.get(2), args.get(3))
    else {
        bail!("usage: ynab-bridge import <file> <profile-key> <budget-id> <account-id>");
    };
    let profile =
        profiles::profile(key).with_context(|| format!("unknown bank profile {key:?}"))?;

    let settings = Settings::from_env();
    let sink = Arc::new(YnabClient::new(&settings.ynab_access_token)?);
    let db = db::into_shared(db::open_database(&settings.database_path)?);

    let content = read_file(file)?;
    let outcome = csv_import::parse(&content, &profile.mapping())?;
    if !outcome.row_errors.is_empty() {
        println!("{} rows failed to parse and were skipped", outcome.row_errors.len());
    }

    let result = engine::import_batch(
        &db,
        &outcome.candidates,
        budget_id,
        account_id,
        Source::Csv,
        sink.as_ref(),
    )
    .await?;

    println!(
        "Imported {}, skipped {} duplicates, {} failed",
        result.imported, result.skipped_duplicates, result.failed
    );
    for error in &result.errors {
        println!("  {}: {}", error.payee, error.message);
    }

    let conn = db.lock().await;
    let stats = ledger::stats(&conn)?;
    println!("Ledger now holds {} imported transactions", stats.total);
    Ok(())
}

fn read_file(path: &str) -> Result<String> {
    std::fs::read_to_string(Path::new(path)).with_context(|| format!("Failed to read {path}"))
}
