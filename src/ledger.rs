// Duplicate Ledger - persisted set of imported-transaction fingerprints.
//
// The fingerprint covers (account_id, date, amount, payee). Memo is excluded
// on purpose: memos vary benignly across CSV exports of the same transaction.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::db::parse_timestamp;
use crate::error::{BridgeError, Result};

/// Where an imported transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Csv,
    Akahu,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Csv => "csv",
            Source::Akahu => "akahu",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "csv" => Some(Source::Csv),
            "akahu" => Some(Source::Akahu),
            _ => None,
        }
    }
}

/// A not-yet-imported transaction awaiting dedup check and submission.
/// Sign convention: negative = outflow, positive = inflow, in YNAB
/// milliunits, regardless of source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub date: NaiveDate,
    pub amount_milliunits: i64,
    pub payee: String,
    pub memo: String,
    #[serde(default)]
    pub source_id: Option<String>,
}

/// Candidate annotated with its fingerprint and an advisory duplicate flag
/// for preview highlighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedCandidate {
    #[serde(flatten)]
    pub candidate: Candidate,
    pub fingerprint: String,
    pub is_duplicate: bool,
}

/// Deterministic dedup key. The same logical transaction from any source
/// (CSV re-upload, repeated sync window) hashes identically.
pub fn fingerprint(account_id: &str, date: NaiveDate, amount_milliunits: i64, payee: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}:{}:{}:{}",
        account_id,
        date.format("%Y-%m-%d"),
        amount_milliunits,
        payee
    ));
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(32);
    hex
}

pub fn candidate_fingerprint(candidate: &Candidate, account_id: &str) -> String {
    fingerprint(
        account_id,
        candidate.date,
        candidate.amount_milliunits,
        &candidate.payee,
    )
}

pub fn is_recorded(conn: &Connection, fp: &str, account_id: &str) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT 1 FROM imported_transactions WHERE fingerprint = ?1 AND account_id = ?2",
    )?;
    Ok(stmt.exists(params![fp, account_id])?)
}

/// Annotates each candidate against the persisted ledger. Advisory only:
/// nothing is removed or written.
pub fn tag(conn: &Connection, candidates: &[Candidate], account_id: &str) -> Result<Vec<TaggedCandidate>> {
    let mut tagged = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let fp = candidate_fingerprint(candidate, account_id);
        let is_duplicate = is_recorded(conn, &fp, account_id)?;
        tagged.push(TaggedCandidate {
            candidate: candidate.clone(),
            fingerprint: fp,
            is_duplicate,
        });
    }
    Ok(tagged)
}

/// Outcome of a ledger insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Inserted,
    /// The fingerprint was already present; the insert was a no-op.
    Duplicate,
}

/// Records a successfully imported transaction. Idempotent: a conflicting
/// insert on (fingerprint, account_id) is reported as `Duplicate`, never as
/// an error, so retried imports and racing sync paths are safe.
pub fn record(
    conn: &Connection,
    candidate: &Candidate,
    account_id: &str,
    source: Source,
    ynab_transaction_id: Option<&str>,
) -> Result<Recorded> {
    match insert_imported(conn, candidate, account_id, source, ynab_transaction_id) {
        Ok(()) => Ok(Recorded::Inserted),
        Err(BridgeError::DuplicateConflict) => Ok(Recorded::Duplicate),
        Err(e) => Err(e),
    }
}

/// The raw unique-constraint insert: losing the race surfaces as
/// `DuplicateConflict`, which `record` swallows.
fn insert_imported(
    conn: &Connection,
    candidate: &Candidate,
    account_id: &str,
    source: Source,
    ynab_transaction_id: Option<&str>,
) -> Result<()> {
    let fp = candidate_fingerprint(candidate, account_id);
    let result = conn.execute(
        "INSERT INTO imported_transactions (
            fingerprint, account_id, date, amount_milliunits, payee, memo,
            source, source_transaction_id, ynab_transaction_id, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            fp,
            account_id,
            candidate.date.format("%Y-%m-%d").to_string(),
            candidate.amount_milliunits,
            candidate.payee,
            candidate.memo,
            source.as_str(),
            candidate.source_id,
            ynab_transaction_id,
            Utc::now().to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(BridgeError::DuplicateConflict)
        }
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// HISTORY & STATS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedTransaction {
    pub id: i64,
    pub fingerprint: String,
    pub account_id: String,
    pub date: NaiveDate,
    pub amount_milliunits: i64,
    pub payee: String,
    pub memo: String,
    pub source: Source,
    pub source_transaction_id: Option<String>,
    pub ynab_transaction_id: Option<String>,
    pub imported_at: DateTime<Utc>,
}

/// Most recent imports first, optionally filtered by source.
pub fn history(conn: &Connection, limit: usize, source: Option<Source>) -> Result<Vec<ImportedTransaction>> {
    let mut sql = String::from(
        "SELECT id, fingerprint, account_id, date, amount_milliunits, payee, memo,
                source, source_transaction_id, ynab_transaction_id, imported_at
         FROM imported_transactions",
    );
    if source.is_some() {
        sql.push_str(" WHERE source = ?1");
    }
    sql.push_str(" ORDER BY imported_at DESC, id DESC LIMIT ");
    sql.push_str(&limit.to_string());

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = match source {
        Some(s) => stmt.query([s.as_str()])?,
        None => stmt.query([])?,
    };

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(map_imported_row(row)?);
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportStats {
    pub total: i64,
    pub by_source: HashMap<String, i64>,
}

pub fn stats(conn: &Connection) -> Result<ImportStats> {
    let total: i64 = conn.query_row("SELECT count(*) FROM imported_transactions", [], |r| r.get(0))?;

    let mut stmt = conn.prepare_cached(
        "SELECT source, count(*) FROM imported_transactions GROUP BY source",
    )?;
    let mut by_source = HashMap::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let source: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        by_source.insert(source, count);
    }

    Ok(ImportStats { total, by_source })
}

fn map_imported_row(row: &rusqlite::Row<'_>) -> Result<ImportedTransaction> {
    let date_raw: String = row.get(3)?;
    let source_raw: String = row.get(7)?;
    let imported_at_raw: String = row.get(10)?;

    let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
        .map_err(|e| BridgeError::Format(format!("bad date {date_raw:?}: {e}")))?;
    let source = Source::from_str(&source_raw)
        .ok_or_else(|| BridgeError::Format(format!("unknown source {source_raw:?}")))?;

    Ok(ImportedTransaction {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        account_id: row.get(2)?,
        date,
        amount_milliunits: row.get(4)?,
        payee: row.get(5)?,
        memo: row.get(6)?,
        source,
        source_transaction_id: row.get(8)?,
        ynab_transaction_id: row.get(9)?,
        imported_at: parse_timestamp(&imported_at_raw)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================
