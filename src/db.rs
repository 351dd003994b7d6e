// Storage layer - SQLite schema and mapping-profile persistence.
//
// All tables live in one database file. The imported-transactions unique
// constraint on (fingerprint, account_id) is what makes ledger inserts
// idempotent; everything else is plain CRUD.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::csv_import::{ColumnMappings, DateFormat, MappingConfig};
use crate::error::{BridgeError, Result};

/// Connection handle shared between the HTTP layer, the scheduler loop and
/// spawned sync tasks. Tokio's mutex so the guard can be held by tasks that
/// also await collaborator calls.
pub type SharedConnection = Arc<tokio::sync::Mutex<Connection>>;

pub fn into_shared(conn: Connection) -> SharedConnection {
    Arc::new(tokio::sync::Mutex::new(conn))
}

/// Opens (creating if needed) the database and applies the schema.
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS imported_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL,
            account_id TEXT NOT NULL,
            date TEXT NOT NULL,
            amount_milliunits INTEGER NOT NULL,
            payee TEXT NOT NULL,
            memo TEXT NOT NULL,
            source TEXT NOT NULL,
            source_transaction_id TEXT,
            ynab_transaction_id TEXT,
            imported_at TEXT NOT NULL,
            UNIQUE(fingerprint, account_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mapping_profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            column_mappings TEXT NOT NULL,
            date_format TEXT NOT NULL,
            skip_rows INTEGER NOT NULL DEFAULT 0,
            amount_inverted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS account_links (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            akahu_account_id TEXT UNIQUE NOT NULL,
            ynab_budget_id TEXT NOT NULL,
            ynab_account_id TEXT NOT NULL,
            auto_sync INTEGER NOT NULL DEFAULT 0,
            interval_hours INTEGER,
            days_to_sync INTEGER,
            last_sync_at TEXT,
            last_sync_status TEXT,
            last_sync_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT UNIQUE NOT NULL,
            akahu_account_id TEXT NOT NULL,
            trigger_kind TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            status TEXT NOT NULL,
            found INTEGER NOT NULL DEFAULT 0,
            imported INTEGER NOT NULL DEFAULT 0,
            skipped_duplicates INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_imported_at ON imported_transactions(imported_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_imported_source ON imported_transactions(source)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_logs_account ON sync_logs(akahu_account_id, started_at)",
        [],
    )?;

    Ok(())
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BridgeError::Format(format!("bad timestamp {raw:?}: {e}")))
}

// ============================================================================
// MAPPING PROFILES
// ============================================================================

/// A persisted, user-named CSV mapping. Lifecycle is independent from
/// transactions; the normalizer reads it at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingProfileRecord {
    pub id: i64,
    pub name: String,
    #[serde(flatten)]
    pub config: MappingConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert-or-update by name.
pub fn save_mapping_profile(
    conn: &Connection,
    name: &str,
    config: &MappingConfig,
) -> Result<MappingProfileRecord> {
    if name.trim().is_empty() {
        return Err(BridgeError::Configuration(
            "mapping profile name must not be empty".to_string(),
        ));
    }
    let now = Utc::now().to_rfc3339();
    let mappings_json = serde_json::to_string(&config.columns)?;

    conn.execute(
        "INSERT INTO mapping_profiles
            (name, column_mappings, date_format, skip_rows, amount_inverted, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(name) DO UPDATE SET
            column_mappings = excluded.column_mappings,
            date_format = excluded.date_format,
            skip_rows = excluded.skip_rows,
            amount_inverted = excluded.amount_inverted,
            updated_at = excluded.updated_at",
        params![
            name.trim(),
            mappings_json,
            config.date_format.key(),
            config.skip_rows as i64,
            config.amount_inverted,
            now,
        ],
    )?;

    get_mapping_profile(conn, name.trim())?
        .ok_or_else(|| BridgeError::Configuration(format!("profile {name:?} vanished after save")))
}

pub fn get_mapping_profile(conn: &Connection, name: &str) -> Result<Option<MappingProfileRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, column_mappings, date_format, skip_rows, amount_inverted, created_at, updated_at
         FROM mapping_profiles WHERE name = ?1",
    )?;
    match stmt.query_row([name], map_profile_row).optional()? {
        Some(record) => Ok(Some(record?)),
        None => Ok(None),
    }
}

pub fn list_mapping_profiles(conn: &Connection) -> Result<Vec<MappingProfileRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, column_mappings, date_format, skip_rows, amount_inverted, created_at, updated_at
         FROM mapping_profiles ORDER BY name",
    )?;
    let rows = stmt.query_map([], map_profile_row)?;

    let mut profiles = Vec::new();
    for row in rows {
        profiles.push(row??);
    }
    Ok(profiles)
}

/// Returns true when a profile was deleted.
pub fn delete_mapping_profile(conn: &Connection, name: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM mapping_profiles WHERE name = ?1", [name])?;
    Ok(changed > 0)
}

fn map_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<MappingProfileRecord>> {
    let id: i64 = row.get(0)?;
    let name: String = row.get(1)?;
    let mappings_json: String = row.get(2)?;
    let date_format_key: String = row.get(3)?;
    let skip_rows: i64 = row.get(4)?;
    let amount_inverted: bool = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;

    Ok(build_profile_record(
        id,
        name,
        mappings_json,
        date_format_key,
        skip_rows,
        amount_inverted,
        created_at,
        updated_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_profile_record(
    id: i64,
    name: String,
    mappings_json: String,
    date_format_key: String,
    skip_rows: i64,
    amount_inverted: bool,
    created_at: String,
    updated_at: String,
) -> Result<MappingProfileRecord> {
    let columns: ColumnMappings = serde_json::from_str(&mappings_json)?;
    let date_format = DateFormat::from_key(&date_format_key).ok_or_else(|| {
        BridgeError::Configuration(format!("unknown date format {date_format_key:?}"))
    })?;

    Ok(MappingProfileRecord {
        id,
        name,
        config: MappingConfig {
            columns,
            date_format,
            skip_rows: skip_rows as usize,
            amount_inverted,
        },
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> MappingConfig {
        MappingConfig {
            columns: ColumnMappings {
                date: "Date".to_string(),
                amount: "Amount".to_string(),
                payee: Some("Payee".to_string()),
                memo: None,
            },
            date_format: DateFormat::DayMonthYear,
            skip_rows: 1,
            amount_inverted: true,
        }
    }

    #[test]
    fn setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();
    }

    #[test]
    fn open_database_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");
        let conn = open_database(&path).unwrap();
        drop(conn);
        assert!(path.exists());
    }

    #[test]
    fn mapping_profile_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let saved = save_mapping_profile(&conn, "my-bank", &sample_config()).unwrap();
        assert_eq!(saved.name, "my-bank");
        assert_eq!(saved.config.skip_rows, 1);
        assert!(saved.config.amount_inverted);

        let loaded = get_mapping_profile(&conn, "my-bank").unwrap().unwrap();
        assert_eq!(loaded.config.columns.date, "Date");
        assert_eq!(loaded.config.columns.payee.as_deref(), Some("Payee"));
        assert_eq!(loaded.config.date_format, DateFormat::DayMonthYear);
    }

    #[test]
    fn save_mapping_profile_upserts_by_name() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        save_mapping_profile(&conn, "my-bank", &sample_config()).unwrap();

        let mut changed = sample_config();
        changed.skip_rows = 4;
        let updated = save_mapping_profile(&conn, "my-bank", &changed).unwrap();
        assert_eq!(updated.config.skip_rows, 4);
        assert_eq!(list_mapping_profiles(&conn).unwrap().len(), 1);
    }

    #[test]
    fn delete_mapping_profile_reports_outcome() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        save_mapping_profile(&conn, "my-bank", &sample_config()).unwrap();
        assert!(delete_mapping_profile(&conn, "my-bank").unwrap());
        assert!(!delete_mapping_profile(&conn, "my-bank").unwrap());
        assert!(get_mapping_profile(&conn, "my-bank").unwrap().is_none());
    }

    #[test]
    fn empty_profile_name_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let err = save_mapping_profile(&conn, "  ", &sample_config());
        assert!(matches!(err, Err(BridgeError::Configuration(_))));
    }
}
