use std::path::PathBuf;

/// Runtime settings, loaded from environment variables.
///
/// Tokens may be empty; the clients reject an empty token at construction
/// time so CSV-only deployments work without any API credentials.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub ynab_access_token: String,
    pub akahu_app_token: String,
    pub akahu_user_token: String,
    /// Seconds between scheduler scans of the account links.
    pub scheduler_tick_secs: u64,
}

impl Settings {
    /// Loads settings from env vars:
    /// - `DATABASE_PATH`        (default: `ynab_bridge.db`)
    /// - `YNAB_ACCESS_TOKEN`
    /// - `AKAHU_APP_TOKEN`
    /// - `AKAHU_USER_TOKEN`
    /// - `SCHEDULER_TICK_SECS`  (default: 300)
    pub fn from_env() -> Self {
        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "ynab_bridge.db".to_string())
            .into();
        let scheduler_tick_secs = std::env::var("SCHEDULER_TICK_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300);

        Settings {
            database_path,
            ynab_access_token: std::env::var("YNAB_ACCESS_TOKEN").unwrap_or_default(),
            akahu_app_token: std::env::var("AKAHU_APP_TOKEN").unwrap_or_default(),
            akahu_user_token: std::env::var("AKAHU_USER_TOKEN").unwrap_or_default(),
            scheduler_tick_secs,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: "ynab_bridge.db".into(),
            ynab_access_token: String::new(),
            akahu_app_token: String::new(),
            akahu_user_token: String::new(),
            scheduler_tick_secs: 300,
        }
    }
}
