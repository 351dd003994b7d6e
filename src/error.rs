use thiserror::Error;

/// Error taxonomy for the import pipeline.
///
/// Row-level parse failures (`FieldParse`) are collected per file and never
/// abort a batch; `DuplicateConflict` is swallowed by the ledger and reported
/// as a skip, not a failure.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Unparsable file: {0}")]
    Format(String),

    #[error("Row {row}: {message}")]
    FieldParse { row: usize, message: String },

    #[error("Transaction already recorded")]
    DuplicateConflict,

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sync already in progress for account {0}")]
    SyncInProgress(String),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
