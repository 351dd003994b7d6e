// Scheduler - one background loop that, per linked account with auto-sync
// enabled, pulls the recent Akahu window and hands it to the import engine
// when the account's interval has elapsed.
//
// Accounts are evaluated independently; each due account runs in its own
// task, and a per-account in-progress marker keeps scheduled and manual
// syncs mutually exclusive without a global lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::akahu::BankFeed;
use crate::db::{parse_timestamp, SharedConnection};
use crate::engine::{self, ImportOutcome};
use crate::error::{BridgeError, Result};
use crate::ledger::Source;
use crate::links::{self, AccountLink, SyncStatus};
use crate::ynab::TransactionSink;

/// Window to pull when a link has no schedule (manual sync with no override).
pub const DEFAULT_DAYS_TO_SYNC: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(Trigger::Manual),
            "scheduled" => Some(Trigger::Scheduled),
            _ => None,
        }
    }
}

// ============================================================================
// PER-ACCOUNT IN-PROGRESS MARKER
// ============================================================================

/// Tracks which accounts have a sync in flight. A permit is held for the
/// duration of a run and released on drop, including early returns.
#[derive(Default)]
pub struct SyncGuard {
    in_progress: Mutex<HashSet<String>>,
}

impl SyncGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(SyncGuard::default())
    }

    /// Claims the account, or returns None when a sync is already running.
    pub fn try_begin(self: &Arc<Self>, account_id: &str) -> Option<SyncPermit> {
        let mut set = self.in_progress.lock().unwrap();
        if !set.insert(account_id.to_string()) {
            return None;
        }
        Some(SyncPermit {
            guard: Arc::clone(self),
            account_id: account_id.to_string(),
        })
    }

    pub fn is_busy(&self, account_id: &str) -> bool {
        self.in_progress.lock().unwrap().contains(account_id)
    }
}

pub struct SyncPermit {
    guard: Arc<SyncGuard>,
    account_id: String,
}

impl Drop for SyncPermit {
    fn drop(&mut self) {
        self.guard
            .in_progress
            .lock()
            .unwrap()
            .remove(&self.account_id);
    }
}

// ============================================================================
// SYNC LOG
// ============================================================================

/// Append-only record of one sync attempt, immutable once finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: i64,
    pub run_id: String,
    pub akahu_account_id: String,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub found: i64,
    pub imported: i64,
    pub skipped_duplicates: i64,
    pub error_message: Option<String>,
}

pub fn start_sync_log(
    conn: &Connection,
    akahu_account_id: &str,
    trigger: Trigger,
    started_at: DateTime<Utc>,
) -> Result<String> {
    let run_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sync_logs (run_id, akahu_account_id, trigger_kind, started_at, status)
         VALUES (?1, ?2, ?3, ?4, 'running')",
        params![
            run_id,
            akahu_account_id,
            trigger.as_str(),
            started_at.to_rfc3339()
        ],
    )?;
    Ok(run_id)
}

pub fn finish_sync_log(
    conn: &Connection,
    run_id: &str,
    status: SyncStatus,
    found: i64,
    imported: i64,
    skipped_duplicates: i64,
    error_message: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE sync_logs
         SET status = ?2, found = ?3, imported = ?4, skipped_duplicates = ?5,
             error_message = ?6, finished_at = ?7
         WHERE run_id = ?1",
        params![
            run_id,
            status.as_str(),
            found,
            imported,
            skipped_duplicates,
            error_message,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Most recent runs first, optionally filtered to one account.
pub fn list_sync_logs(
    conn: &Connection,
    limit: usize,
    akahu_account_id: Option<&str>,
) -> Result<Vec<SyncLogEntry>> {
    let mut sql = String::from(
        "SELECT id, run_id, akahu_account_id, trigger_kind, started_at, finished_at,
                status, found, imported, skipped_duplicates, error_message
         FROM sync_logs",
    );
    if akahu_account_id.is_some() {
        sql.push_str(" WHERE akahu_account_id = ?1");
    }
    sql.push_str(" ORDER BY started_at DESC, id DESC LIMIT ");
    sql.push_str(&limit.to_string());

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = match akahu_account_id {
        Some(id) => stmt.query([id])?,
        None => stmt.query([])?,
    };

    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(map_log_row(row)?);
    }
    Ok(entries)
}

fn map_log_row(row: &rusqlite::Row<'_>) -> Result<SyncLogEntry> {
    let trigger_raw: String = row.get(3)?;
    let started_raw: String = row.get(4)?;
    let finished_raw: Option<String> = row.get(5)?;
    let status_raw: String = row.get(6)?;

    Ok(SyncLogEntry {
        id: row.get(0)?,
        run_id: row.get(1)?,
        akahu_account_id: row.get(2)?,
        trigger: Trigger::from_str(&trigger_raw)
            .ok_or_else(|| BridgeError::Format(format!("unknown trigger {trigger_raw:?}")))?,
        started_at: parse_timestamp(&started_raw)?,
        finished_at: finished_raw.as_deref().map(parse_timestamp).transpose()?,
        status: SyncStatus::from_str(&status_raw)
            .ok_or_else(|| BridgeError::Format(format!("unknown status {status_raw:?}")))?,
        found: row.get(7)?,
        imported: row.get(8)?,
        skipped_duplicates: row.get(9)?,
        error_message: row.get(10)?,
    })
}

// ============================================================================
// DUE EVALUATION & SYNC RUN
// ============================================================================

/// Everything a sync run needs. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct SyncDeps {
    pub db: SharedConnection,
    pub feed: Arc<dyn BankFeed>,
    pub sink: Arc<dyn TransactionSink>,
    pub guard: Arc<SyncGuard>,
}

/// A link is due when auto-sync is on, a schedule exists, and a full
/// interval has passed since the last attempt (successful or not). A link
/// never synced before is due immediately.
pub fn is_due(link: &AccountLink, now: DateTime<Utc>) -> bool {
    if !link.auto_sync {
        return false;
    }
    let Some(schedule) = link.schedule else {
        return false;
    };
    match link.last_sync_at {
        None => true,
        Some(last) => now - last >= chrono::Duration::hours(schedule.interval_hours),
    }
}

/// Runs one pull-and-import cycle for a linked account.
///
/// Both the scheduler and the manual sync endpoint land here, so the two are
/// mutually exclusive per account and both advance `last_sync_at` — after a
/// manual pull the scheduled one has nothing new to fetch anyway. On any
/// failure the attempt time still advances: a failing account waits a full
/// interval instead of hammering the upstream every tick.
pub async fn sync_account(
    deps: &SyncDeps,
    akahu_account_id: &str,
    days_override: Option<i64>,
    trigger: Trigger,
) -> Result<ImportOutcome> {
    let _permit = deps
        .guard
        .try_begin(akahu_account_id)
        .ok_or_else(|| BridgeError::SyncInProgress(akahu_account_id.to_string()))?;

    let link = {
        let conn = deps.db.lock().await;
        links::get(&conn, akahu_account_id)?
    }
    .ok_or_else(|| BridgeError::Configuration(format!("no link for account {akahu_account_id:?}")))?;

    let days = days_override
        .or_else(|| link.schedule.map(|s| s.days_to_sync))
        .unwrap_or(DEFAULT_DAYS_TO_SYNC);
    let attempted_at = Utc::now();
    let since = attempted_at.date_naive() - chrono::Duration::days(days);

    info!(account = akahu_account_id, trigger = trigger.as_str(), days, "sync started");
    let run_id = {
        let conn = deps.db.lock().await;
        start_sync_log(&conn, akahu_account_id, trigger, attempted_at)?
    };

    let candidates = match deps.feed.transactions_since(akahu_account_id, since).await {
        Ok(candidates) => candidates,
        Err(e) => {
            let message = e.to_string();
            let conn = deps.db.lock().await;
            finish_sync_log(&conn, &run_id, SyncStatus::Failed, 0, 0, 0, Some(&message))?;
            links::record_sync_result(&conn, akahu_account_id, attempted_at, SyncStatus::Failed, &message)?;
            error!(account = akahu_account_id, error = %message, "bank feed pull failed");
            return Err(e);
        }
    };

    let found = candidates.len() as i64;
    let outcome = match engine::import_batch(
        &deps.db,
        &candidates,
        &link.ynab_budget_id,
        &link.ynab_account_id,
        Source::Akahu,
        deps.sink.as_ref(),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = e.to_string();
            let conn = deps.db.lock().await;
            finish_sync_log(&conn, &run_id, SyncStatus::Failed, found, 0, 0, Some(&message))?;
            links::record_sync_result(&conn, akahu_account_id, attempted_at, SyncStatus::Failed, &message)?;
            error!(account = akahu_account_id, error = %message, "import failed");
            return Err(e);
        }
    };

    // A batch where every submission failed marks the run failed; partial
    // success is success, with the per-item errors kept in the outcome.
    let full_failure = outcome.failed > 0 && outcome.imported == 0;
    let (status, message) = if full_failure {
        let message = outcome
            .errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "all submissions failed".to_string());
        (SyncStatus::Failed, message)
    } else {
        (
            SyncStatus::Success,
            format!(
                "Imported {} transactions ({} duplicates skipped)",
                outcome.imported, outcome.skipped_duplicates
            ),
        )
    };

    {
        let conn = deps.db.lock().await;
        finish_sync_log(
            &conn,
            &run_id,
            status,
            found,
            outcome.imported as i64,
            outcome.skipped_duplicates as i64,
            if full_failure { Some(&message) } else { None },
        )?;
        links::record_sync_result(&conn, akahu_account_id, attempted_at, status, &message)?;
    }

    info!(
        account = akahu_account_id,
        found,
        imported = outcome.imported,
        skipped = outcome.skipped_duplicates,
        failed = outcome.failed,
        "sync finished"
    );
    Ok(outcome)
}

// ============================================================================
// BACKGROUND LOOP
// ============================================================================

/// Scans every link once and spawns a sync task per due account. Returns how
/// many syncs were started. Busy accounts are skipped, not queued; they will
/// be re-evaluated on the next tick.
pub async fn scan_once(deps: &SyncDeps, now: DateTime<Utc>) -> Result<usize> {
    let all_links = {
        let conn = deps.db.lock().await;
        links::list(&conn)?
    };

    let mut started = 0;
    for link in all_links {
        if !is_due(&link, now) {
            continue;
        }
        if deps.guard.is_busy(&link.akahu_account_id) {
            debug!(account = %link.akahu_account_id, "previous sync still running, skipping");
            continue;
        }

        let task_deps = deps.clone();
        let account_id = link.akahu_account_id.clone();
        tokio::spawn(async move {
            match sync_account(&task_deps, &account_id, None, Trigger::Scheduled).await {
                Ok(_) => {}
                // Lost the claim to a manual sync between the busy check and
                // the task starting; the next tick re-evaluates.
                Err(BridgeError::SyncInProgress(_)) => {}
                Err(e) => error!(account = %account_id, error = %e, "scheduled sync failed"),
            }
        });
        started += 1;
    }
    Ok(started)
}

/// The long-lived loop. Failures are logged and isolated; the loop itself
/// never exits.
pub async fn run_scheduler(deps: SyncDeps, tick: Duration) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(tick_secs = tick.as_secs(), "scheduler started");

    loop {
        interval.tick().await;
        match scan_once(&deps, Utc::now()).await {
            Ok(0) => {}
            Ok(n) => info!(due = n, "triggered scheduled syncs"),
            Err(e) => error!(error = %e, "scheduler scan failed"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{into_shared, setup_database};
    use crate::ledger::Candidate;
    use crate::links::ScheduleConfig;
    use crate::ynab::{NewTransaction, SubmitReceipt};
    use async_trait::async_trait;
    use chrono::NaiveDate;

    struct MockFeed {
        candidates: Vec<Candidate>,
        fail: bool,
        calls: Mutex<Vec<(String, NaiveDate)>>,
    }

    impl MockFeed {
        fn with(candidates: Vec<Candidate>) -> Self {
            MockFeed {
                candidates,
                fail: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            MockFeed {
                candidates: Vec::new(),
                fail: true,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BankFeed for MockFeed {
        async fn list_accounts(&self) -> Result<Vec<crate::akahu::BankAccount>> {
            Ok(Vec::new())
        }

        async fn transactions_since(&self, account_id: &str, since: NaiveDate) -> Result<Vec<Candidate>> {
            self.calls.lock().unwrap().push((account_id.to_string(), since));
            if self.fail {
                return Err(BridgeError::Upstream("Akahu unreachable".to_string()));
            }
            Ok(self.candidates.clone())
        }
    }

    #[derive(Default)]
    struct MockSink {
        fail_all: bool,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl TransactionSink for MockSink {
        async fn create_transaction(
            &self,
            _budget_id: &str,
            _account_id: &str,
            _transaction: &NewTransaction,
        ) -> Result<SubmitReceipt> {
            *self.calls.lock().unwrap() += 1;
            if self.fail_all {
                return Err(BridgeError::Upstream("YNAB rejected".to_string()));
            }
            Ok(SubmitReceipt {
                transaction_id: Some("t-1".to_string()),
                duplicate: false,
            })
        }
    }

    fn deps(feed: MockFeed, sink: MockSink) -> SyncDeps {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        SyncDeps {
            db: into_shared(conn),
            feed: Arc::new(feed),
            sink: Arc::new(sink),
            guard: SyncGuard::new(),
        }
    }

    async fn linked(deps: &SyncDeps, schedule: Option<ScheduleConfig>) {
        let conn = deps.db.lock().await;
        links::link(&conn, "acc_1", "budget-1", "acct-1").unwrap();
        if schedule.is_some() {
            links::set_schedule(&conn, "acc_1", schedule).unwrap();
        }
    }

    fn candidate(payee: &str, amount: i64) -> Candidate {
        Candidate {
            date: NaiveDate::from_ymd_opt(2024, 2, 10).unwrap(),
            amount_milliunits: amount,
            payee: payee.to_string(),
            memo: String::new(),
            source_id: Some(format!("txn_{payee}")),
        }
    }

    fn schedule() -> Option<ScheduleConfig> {
        Some(ScheduleConfig {
            interval_hours: 6,
            days_to_sync: 7,
        })
    }

    #[test]
    fn due_evaluation() {
        let mut link = AccountLink {
            id: 1,
            akahu_account_id: "acc_1".to_string(),
            ynab_budget_id: "b".to_string(),
            ynab_account_id: "a".to_string(),
            auto_sync: true,
            schedule: Some(ScheduleConfig {
                interval_hours: 6,
                days_to_sync: 7,
            }),
            last_sync_at: None,
            last_sync_status: None,
            last_sync_message: None,
        };
        let now = Utc::now();

        // Never synced: due immediately.
        assert!(is_due(&link, now));

        link.last_sync_at = Some(now - chrono::Duration::hours(7));
        assert!(is_due(&link, now));

        link.last_sync_at = Some(now - chrono::Duration::hours(5));
        assert!(!is_due(&link, now));

        link.auto_sync = false;
        link.last_sync_at = None;
        assert!(!is_due(&link, now));

        link.auto_sync = true;
        link.schedule = None;
        assert!(!is_due(&link, now));
    }

    #[test]
    fn guard_allows_one_permit_per_account() {
        let guard = SyncGuard::new();
        let permit = guard.try_begin("acc_1").unwrap();
        assert!(guard.try_begin("acc_1").is_none());
        assert!(guard.is_busy("acc_1"));

        // Unrelated accounts are unaffected.
        assert!(guard.try_begin("acc_2").is_some());

        drop(permit);
        assert!(!guard.is_busy("acc_1"));
        assert!(guard.try_begin("acc_1").is_some());
    }

    #[tokio::test]
    async fn manual_sync_rejected_while_one_is_running() {
        let deps = deps(MockFeed::with(vec![candidate("A", -1000)]), MockSink::default());
        linked(&deps, schedule()).await;

        let _held = deps.guard.try_begin("acc_1").unwrap();
        let err = sync_account(&deps, "acc_1", None, Trigger::Manual).await;
        assert!(matches!(err, Err(BridgeError::SyncInProgress(_))));

        // The rejected attempt left no trace.
        let conn = deps.db.lock().await;
        assert!(list_sync_logs(&conn, 10, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_sync_imports_and_logs() {
        let deps = deps(
            MockFeed::with(vec![candidate("A", -1000), candidate("B", -2000)]),
            MockSink::default(),
        );
        linked(&deps, schedule()).await;

        let outcome = sync_account(&deps, "acc_1", None, Trigger::Scheduled).await.unwrap();
        assert_eq!(outcome.imported, 2);
        assert_eq!(outcome.failed, 0);

        let conn = deps.db.lock().await;
        let logs = list_sync_logs(&conn, 10, Some("acc_1")).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncStatus::Success);
        assert_eq!(logs[0].trigger, Trigger::Scheduled);
        assert_eq!(logs[0].found, 2);
        assert_eq!(logs[0].imported, 2);
        assert!(logs[0].finished_at.is_some());

        let link = links::get(&conn, "acc_1").unwrap().unwrap();
        assert_eq!(link.last_sync_status, Some(SyncStatus::Success));
        assert!(link.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn manual_sync_advances_last_sync_at() {
        let deps = deps(MockFeed::with(vec![candidate("A", -1000)]), MockSink::default());
        linked(&deps, schedule()).await;

        let before = Utc::now();
        sync_account(&deps, "acc_1", None, Trigger::Manual).await.unwrap();

        let conn = deps.db.lock().await;
        let link = links::get(&conn, "acc_1").unwrap().unwrap();
        let last = link.last_sync_at.unwrap();
        assert!(last >= before - chrono::Duration::seconds(1));
        // The account is no longer due: the manual run pushed the schedule.
        assert!(!is_due(&link, Utc::now()));

        let logs = list_sync_logs(&conn, 10, None).unwrap();
        assert_eq!(logs[0].trigger, Trigger::Manual);
    }

    #[tokio::test]
    async fn failed_feed_still_advances_last_sync_at() {
        let deps = deps(MockFeed::failing(), MockSink::default());
        linked(&deps, schedule()).await;

        let err = sync_account(&deps, "acc_1", None, Trigger::Scheduled).await;
        assert!(matches!(err, Err(BridgeError::Upstream(_))));

        let conn = deps.db.lock().await;
        let link = links::get(&conn, "acc_1").unwrap().unwrap();
        assert_eq!(link.last_sync_status, Some(SyncStatus::Failed));
        // A failed sync waits a full interval instead of retrying every tick.
        assert!(link.last_sync_at.is_some());
        assert!(!is_due(&link, Utc::now()));

        let logs = list_sync_logs(&conn, 10, Some("acc_1")).unwrap();
        assert_eq!(logs[0].status, SyncStatus::Failed);
        assert_eq!(logs[0].error_message.as_deref(), Some("Upstream request failed: Akahu unreachable"));
    }

    #[tokio::test]
    async fn full_batch_failure_marks_run_failed() {
        let deps = deps(
            MockFeed::with(vec![candidate("A", -1000), candidate("B", -2000)]),
            MockSink {
                fail_all: true,
                ..Default::default()
            },
        );
        linked(&deps, schedule()).await;

        let outcome = sync_account(&deps, "acc_1", None, Trigger::Scheduled).await.unwrap();
        assert_eq!(outcome.imported, 0);
        assert_eq!(outcome.failed, 2);

        let conn = deps.db.lock().await;
        let logs = list_sync_logs(&conn, 10, None).unwrap();
        assert_eq!(logs[0].status, SyncStatus::Failed);
        assert!(logs[0].error_message.is_some());

        let link = links::get(&conn, "acc_1").unwrap().unwrap();
        assert_eq!(link.last_sync_status, Some(SyncStatus::Failed));
    }

    #[tokio::test]
    async fn sync_window_matches_schedule_days() {
        let feed = Arc::new(MockFeed::with(Vec::new()));
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let deps = SyncDeps {
            db: into_shared(conn),
            feed: feed.clone(),
            sink: Arc::new(MockSink::default()),
            guard: SyncGuard::new(),
        };
        linked(&deps, schedule()).await;

        sync_account(&deps, "acc_1", None, Trigger::Scheduled).await.unwrap();
        sync_account(&deps, "acc_1", Some(30), Trigger::Manual).await.unwrap();

        let calls = feed.calls.lock().unwrap();
        let today = Utc::now().date_naive();
        assert_eq!(calls[0].1, today - chrono::Duration::days(7));
        assert_eq!(calls[1].1, today - chrono::Duration::days(30));
    }

    #[tokio::test]
    async fn scan_skips_accounts_without_schedules() {
        let deps = deps(MockFeed::with(Vec::new()), MockSink::default());
        linked(&deps, None).await;

        let started = scan_once(&deps, Utc::now()).await.unwrap();
        assert_eq!(started, 0);
    }

    #[tokio::test]
    async fn scan_triggers_due_accounts_independently() {
        let deps = deps(MockFeed::with(Vec::new()), MockSink::default());
        {
            let conn = deps.db.lock().await;
            links::link(&conn, "acc_due", "budget-1", "acct-1").unwrap();
            links::set_schedule(&conn, "acc_due", schedule()).unwrap();
            links::link(&conn, "acc_fresh", "budget-1", "acct-2").unwrap();
            links::set_schedule(&conn, "acc_fresh", schedule()).unwrap();
            links::record_sync_result(&conn, "acc_fresh", Utc::now(), SyncStatus::Success, "ok").unwrap();
        }

        let started = scan_once(&deps, Utc::now()).await.unwrap();
        assert_eq!(started, 1);
    }
}
