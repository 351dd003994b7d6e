// ynab-bridge - Core Library
// CSV normalization, duplicate ledger, import engine, account links and the
// background sync scheduler; consumed by the CLI, the API server and tests.

pub mod akahu;
pub mod config;
pub mod csv_import;
pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod links;
pub mod profiles;
pub mod scheduler;
pub mod ynab;

// Re-export commonly used types
pub use akahu::{AkahuClient, BankAccount, BankFeed};
pub use config::Settings;
pub use csv_import::{
    auto_detect_mapping, detect_columns, parse, ColumnMappings, CsvPreview, DateFormat,
    MappingConfig, ParseOutcome, RowError,
};
pub use db::{
    delete_mapping_profile, get_mapping_profile, into_shared, list_mapping_profiles,
    open_database, save_mapping_profile, setup_database, MappingProfileRecord, SharedConnection,
};
pub use engine::{import_batch, import_id, ImportItemError, ImportOutcome};
pub use error::{BridgeError, Result};
pub use ledger::{
    candidate_fingerprint, fingerprint, history, record, stats, tag, Candidate,
    ImportStats, ImportedTransaction, Recorded, Source, TaggedCandidate,
};
pub use links::{AccountLink, ScheduleConfig, SyncStatus};
pub use profiles::{all_profiles, profile, BankProfile};
pub use scheduler::{
    is_due, list_sync_logs, run_scheduler, sync_account, SyncDeps, SyncGuard, SyncLogEntry,
    Trigger, DEFAULT_DAYS_TO_SYNC,
};
pub use ynab::{
    milliunits_from_decimal, milliunits_to_decimal, Budget, BudgetAccount, NewTransaction,
    SubmitReceipt, TransactionSink, YnabClient,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
