// Account Link Registry - maps an Akahu account to a YNAB (budget, account)
// pair, optionally carrying a recurring-sync schedule.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::db::parse_timestamp;
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(SyncStatus::Running),
            "success" => Some(SyncStatus::Success),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Recurring-sync settings for one linked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_hours: i64,
    /// How many days back each sync window reaches.
    pub days_to_sync: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLink {
    pub id: i64,
    pub akahu_account_id: String,
    pub ynab_budget_id: String,
    pub ynab_account_id: String,
    pub auto_sync: bool,
    pub schedule: Option<ScheduleConfig>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: Option<SyncStatus>,
    pub last_sync_message: Option<String>,
}

/// Upsert keyed by `akahu_account_id`: relinking overwrites the YNAB pair
/// and leaves schedule and sync status untouched. Ledger history is keyed by
/// YNAB account, so a relink never resets dedup state.
pub fn link(
    conn: &Connection,
    akahu_account_id: &str,
    ynab_budget_id: &str,
    ynab_account_id: &str,
) -> Result<AccountLink> {
    if akahu_account_id.trim().is_empty() {
        return Err(BridgeError::Configuration("no bank account given".to_string()));
    }
    if ynab_budget_id.trim().is_empty() || ynab_account_id.trim().is_empty() {
        return Err(BridgeError::Configuration(
            "link needs both a budget and an account".to_string(),
        ));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO account_links
            (akahu_account_id, ynab_budget_id, ynab_account_id, auto_sync, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)
         ON CONFLICT(akahu_account_id) DO UPDATE SET
            ynab_budget_id = excluded.ynab_budget_id,
            ynab_account_id = excluded.ynab_account_id,
            updated_at = excluded.updated_at",
        params![akahu_account_id.trim(), ynab_budget_id, ynab_account_id, now],
    )?;

    get(conn, akahu_account_id.trim())?
        .ok_or_else(|| BridgeError::Configuration("link vanished after upsert".to_string()))
}

/// Returns true when a link was removed. Imported-transaction history is
/// intentionally left behind.
pub fn unlink(conn: &Connection, akahu_account_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM account_links WHERE akahu_account_id = ?1",
        [akahu_account_id],
    )?;
    Ok(changed > 0)
}

/// Sets or clears the recurring schedule. `None` clears it and disables
/// auto-sync.
pub fn set_schedule(
    conn: &Connection,
    akahu_account_id: &str,
    schedule: Option<ScheduleConfig>,
) -> Result<AccountLink> {
    if let Some(cfg) = &schedule {
        if cfg.interval_hours <= 0 {
            return Err(BridgeError::Configuration(
                "sync interval must be at least one hour".to_string(),
            ));
        }
        if cfg.days_to_sync <= 0 {
            return Err(BridgeError::Configuration(
                "days to sync must be positive".to_string(),
            ));
        }
    }

    let now = Utc::now().to_rfc3339();
    let changed = match schedule {
        Some(cfg) => conn.execute(
            "UPDATE account_links
             SET interval_hours = ?2, days_to_sync = ?3, auto_sync = 1, updated_at = ?4
             WHERE akahu_account_id = ?1",
            params![akahu_account_id, cfg.interval_hours, cfg.days_to_sync, now],
        )?,
        None => conn.execute(
            "UPDATE account_links
             SET interval_hours = NULL, days_to_sync = NULL, auto_sync = 0, updated_at = ?2
             WHERE akahu_account_id = ?1",
            params![akahu_account_id, now],
        )?,
    };

    if changed == 0 {
        return Err(BridgeError::Configuration(format!(
            "no link for account {akahu_account_id:?}"
        )));
    }
    get(conn, akahu_account_id)?
        .ok_or_else(|| BridgeError::Configuration("link vanished after update".to_string()))
}

pub fn get(conn: &Connection, akahu_account_id: &str) -> Result<Option<AccountLink>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, akahu_account_id, ynab_budget_id, ynab_account_id, auto_sync,
                interval_hours, days_to_sync, last_sync_at, last_sync_status, last_sync_message
         FROM account_links WHERE akahu_account_id = ?1",
    )?;
    match stmt.query_row([akahu_account_id], map_link_row).optional()? {
        Some(link) => Ok(Some(link?)),
        None => Ok(None),
    }
}

pub fn list(conn: &Connection) -> Result<Vec<AccountLink>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, akahu_account_id, ynab_budget_id, ynab_account_id, auto_sync,
                interval_hours, days_to_sync, last_sync_at, last_sync_status, last_sync_message
         FROM account_links ORDER BY akahu_account_id",
    )?;
    let rows = stmt.query_map([], map_link_row)?;

    let mut links = Vec::new();
    for row in rows {
        links.push(row??);
    }
    Ok(links)
}

/// Stamps the outcome of a sync attempt onto the link. Called on success and
/// on failure alike: advancing `last_sync_at` is what stops a failing
/// account from re-triggering on every scheduler tick.
pub fn record_sync_result(
    conn: &Connection,
    akahu_account_id: &str,
    attempted_at: DateTime<Utc>,
    status: SyncStatus,
    message: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE account_links
         SET last_sync_at = ?2, last_sync_status = ?3, last_sync_message = ?4, updated_at = ?5
         WHERE akahu_account_id = ?1",
        params![
            akahu_account_id,
            attempted_at.to_rfc3339(),
            status.as_str(),
            message,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn map_link_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<AccountLink>> {
    let interval_hours: Option<i64> = row.get(5)?;
    let days_to_sync: Option<i64> = row.get(6)?;
    let last_sync_at: Option<String> = row.get(7)?;
    let last_sync_status: Option<String> = row.get(8)?;

    let link = AccountLink {
        id: row.get(0)?,
        akahu_account_id: row.get(1)?,
        ynab_budget_id: row.get(2)?,
        ynab_account_id: row.get(3)?,
        auto_sync: row.get(4)?,
        schedule: match (interval_hours, days_to_sync) {
            (Some(interval_hours), Some(days_to_sync)) => Some(ScheduleConfig {
                interval_hours,
                days_to_sync,
            }),
            _ => None,
        },
        last_sync_at: None,
        last_sync_status: last_sync_status.as_deref().and_then(SyncStatus::from_str),
        last_sync_message: row.get(9)?,
    };

    Ok(finish_link(link, last_sync_at))
}

fn finish_link(mut link: AccountLink, last_sync_at: Option<String>) -> Result<AccountLink> {
    if let Some(raw) = last_sync_at {
        link.last_sync_at = Some(parse_timestamp(&raw)?);
    }
    Ok(link)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn link_creates_then_upserts() {
        let conn = memory_db();
        let first = link(&conn, "acc_1", "budget-a", "acct-a").unwrap();
        assert_eq!(first.ynab_budget_id, "budget-a");
        assert!(!first.auto_sync);

        let relinked = link(&conn, "acc_1", "budget-b", "acct-b").unwrap();
        assert_eq!(relinked.ynab_budget_id, "budget-b");
        assert_eq!(relinked.ynab_account_id, "acct-b");

        // At most one link per bank account.
        assert_eq!(list(&conn).unwrap().len(), 1);
    }

    #[test]
    fn relink_preserves_schedule() {
        let conn = memory_db();
        link(&conn, "acc_1", "budget-a", "acct-a").unwrap();
        set_schedule(
            &conn,
            "acc_1",
            Some(ScheduleConfig {
                interval_hours: 6,
                days_to_sync: 7,
            }),
        )
        .unwrap();

        let relinked = link(&conn, "acc_1", "budget-b", "acct-b").unwrap();
        assert!(relinked.auto_sync);
        assert_eq!(
            relinked.schedule,
            Some(ScheduleConfig {
                interval_hours: 6,
                days_to_sync: 7
            })
        );
    }

    #[test]
    fn set_schedule_none_disables_auto_sync() {
        let conn = memory_db();
        link(&conn, "acc_1", "budget-a", "acct-a").unwrap();

        let scheduled = set_schedule(
            &conn,
            "acc_1",
            Some(ScheduleConfig {
                interval_hours: 12,
                days_to_sync: 3,
            }),
        )
        .unwrap();
        assert!(scheduled.auto_sync);

        let cleared = set_schedule(&conn, "acc_1", None).unwrap();
        assert!(!cleared.auto_sync);
        assert!(cleared.schedule.is_none());
    }

    #[test]
    fn set_schedule_validates_input() {
        let conn = memory_db();
        link(&conn, "acc_1", "budget-a", "acct-a").unwrap();

        let bad_interval = set_schedule(
            &conn,
            "acc_1",
            Some(ScheduleConfig {
                interval_hours: 0,
                days_to_sync: 7,
            }),
        );
        assert!(matches!(bad_interval, Err(BridgeError::Configuration(_))));

        let missing = set_schedule(
            &conn,
            "acc_missing",
            Some(ScheduleConfig {
                interval_hours: 6,
                days_to_sync: 7,
            }),
        );
        assert!(matches!(missing, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn unlink_removes_only_the_link() {
        let conn = memory_db();
        link(&conn, "acc_1", "budget-a", "acct-a").unwrap();
        assert!(unlink(&conn, "acc_1").unwrap());
        assert!(!unlink(&conn, "acc_1").unwrap());
        assert!(get(&conn, "acc_1").unwrap().is_none());
    }

    #[test]
    fn sync_result_round_trips() {
        let conn = memory_db();
        link(&conn, "acc_1", "budget-a", "acct-a").unwrap();

        let at = Utc::now();
        record_sync_result(&conn, "acc_1", at, SyncStatus::Failed, "Akahu unreachable").unwrap();

        let loaded = get(&conn, "acc_1").unwrap().unwrap();
        assert_eq!(loaded.last_sync_status, Some(SyncStatus::Failed));
        assert_eq!(loaded.last_sync_message.as_deref(), Some("Akahu unreachable"));
        let recorded_at = loaded.last_sync_at.unwrap();
        assert!((recorded_at - at).num_seconds().abs() <= 1);
    }

    #[test]
    fn empty_link_fields_rejected() {
        let conn = memory_db();
        assert!(matches!(
            link(&conn, "", "budget-a", "acct-a"),
            Err(BridgeError::Configuration(_))
        ));
        assert!(matches!(
            link(&conn, "acc_1", "", "acct-a"),
            Err(BridgeError::Configuration(_))
        ));
    }
}
