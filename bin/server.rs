// ynab-bridge - API Server
// JSON surface over the core: CSV detect/parse/import, mapping profiles,
// account links, manual sync and the sync/import history, with the
// background scheduler running alongside.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use ynab_bridge::{
    akahu::AkahuClient,
    csv_import, db, engine, ledger, links, profiles, scheduler,
    scheduler::{SyncDeps, SyncGuard, Trigger},
    BankFeed, BridgeError, Candidate, ColumnMappings, MappingConfig, ScheduleConfig, Settings,
    SharedConnection, Source, TaggedCandidate, YnabClient,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: SharedConnection,
    guard: Arc<SyncGuard>,
    ynab: Option<Arc<YnabClient>>,
    akahu: Option<Arc<AkahuClient>>,
}

impl AppState {
    fn ynab(&self) -> Result<Arc<YnabClient>, BridgeError> {
        self.ynab.clone().ok_or_else(|| {
            BridgeError::Configuration("YNAB access token is not set".to_string())
        })
    }

    fn akahu(&self) -> Result<Arc<AkahuClient>, BridgeError> {
        self.akahu.clone().ok_or_else(|| {
            BridgeError::Configuration("Akahu tokens are not set".to_string())
        })
    }

    fn sync_deps(&self) -> Result<SyncDeps, BridgeError> {
        Ok(SyncDeps {
            db: self.db.clone(),
            feed: self.akahu()?,
            sink: self.ynab()?,
            guard: self.guard.clone(),
        })
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

fn respond<T: Serialize>(result: Result<T, BridgeError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            let status = match &e {
                BridgeError::Format(_)
                | BridgeError::FieldParse { .. }
                | BridgeError::Configuration(_)
                | BridgeError::Csv(_) => StatusCode::BAD_REQUEST,
                BridgeError::SyncInProgress(_) => StatusCode::CONFLICT,
                BridgeError::Upstream(_) | BridgeError::Http(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ApiResponse::<()>::err(e.to_string()))).into_response()
        }
    }
}

// ============================================================================
// CSV Handlers
// ============================================================================

#[derive(Deserialize)]
struct DetectRequest {
    content: String,
    #[serde(default)]
    skip_rows: usize,
}

#[derive(Serialize)]
struct DetectResponse {
    columns: Vec<String>,
    preview_rows: Vec<Vec<String>>,
    suggested_mapping: ColumnMappings,
}

/// POST /api/csv/detect - header names, sample rows and a mapping suggestion
async fn csv_detect(Json(req): Json<DetectRequest>) -> Response {
    let result = csv_import::detect_columns(&req.content, req.skip_rows).map(|preview| {
        let suggested_mapping = csv_import::auto_detect_mapping(&preview.columns);
        DetectResponse {
            columns: preview.columns,
            preview_rows: preview.preview_rows,
            suggested_mapping,
        }
    });
    respond(result)
}

#[derive(Deserialize)]
struct ParseRequest {
    content: String,
    mapping: MappingConfig,
    /// When present, candidates are tagged against this account's ledger.
    #[serde(default)]
    ynab_account_id: Option<String>,
}

#[derive(Serialize)]
struct ParseResponse {
    candidates: Vec<TaggedCandidate>,
    parse_errors: Vec<csv_import::RowError>,
}

/// POST /api/csv/parse - candidates plus per-row error count
async fn csv_parse(State(state): State<AppState>, Json(req): Json<ParseRequest>) -> Response {
    let result = async {
        let outcome = csv_import::parse(&req.content, &req.mapping)?;
        let candidates = match req.ynab_account_id.as_deref() {
            Some(account_id) if !account_id.trim().is_empty() => {
                let conn = state.db.lock().await;
                ledger::tag(&conn, &outcome.candidates, account_id)?
            }
            _ => outcome
                .candidates
                .into_iter()
                .map(|candidate| TaggedCandidate {
                    candidate,
                    fingerprint: String::new(),
                    is_duplicate: false,
                })
                .collect(),
        };
        Ok(ParseResponse {
            candidates,
            parse_errors: outcome.row_errors,
        })
    }
    .await;
    respond(result)
}

#[derive(Deserialize)]
struct ImportRequest {
    candidates: Vec<Candidate>,
    budget_id: String,
    account_id: String,
}

/// POST /api/csv/import - submit a candidate batch to YNAB
async fn csv_import_batch(State(state): State<AppState>, Json(req): Json<ImportRequest>) -> Response {
    let result = async {
        let sink = state.ynab()?;
        engine::import_batch(
            &state.db,
            &req.candidates,
            &req.budget_id,
            &req.account_id,
            Source::Csv,
            sink.as_ref(),
        )
        .await
    }
    .await;
    respond(result)
}

// ============================================================================
// Mapping Profile Handlers
// ============================================================================

/// GET /api/profiles - static bank presets
async fn bank_profiles() -> Response {
    respond(Ok(profiles::all_profiles()))
}

/// GET /api/mappings - saved mapping profiles
async fn mappings_list(State(state): State<AppState>) -> Response {
    let conn = state.db.lock().await;
    respond(db::list_mapping_profiles(&conn))
}

#[derive(Deserialize)]
struct SaveMappingRequest {
    name: String,
    #[serde(flatten)]
    config: MappingConfig,
}

/// POST /api/mappings - create or update a mapping profile
async fn mappings_save(State(state): State<AppState>, Json(req): Json<SaveMappingRequest>) -> Response {
    let conn = state.db.lock().await;
    respond(db::save_mapping_profile(&conn, &req.name, &req.config))
}

/// DELETE /api/mappings/:name
async fn mappings_delete(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let conn = state.db.lock().await;
    respond(db::delete_mapping_profile(&conn, &name))
}

// ============================================================================
// Account Link Handlers
// ============================================================================

/// GET /api/links
async fn links_list(State(state): State<AppState>) -> Response {
    let conn = state.db.lock().await;
    respond(links::list(&conn))
}

#[derive(Deserialize)]
struct LinkRequest {
    akahu_account_id: String,
    ynab_budget_id: String,
    ynab_account_id: String,
}

/// POST /api/links - link (or relink) an Akahu account to a YNAB account
async fn links_create(State(state): State<AppState>, Json(req): Json<LinkRequest>) -> Response {
    let conn = state.db.lock().await;
    respond(links::link(
        &conn,
        &req.akahu_account_id,
        &req.ynab_budget_id,
        &req.ynab_account_id,
    ))
}

/// DELETE /api/links/:id
async fn links_delete(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let conn = state.db.lock().await;
    respond(links::unlink(&conn, &id))
}

#[derive(Deserialize)]
struct ScheduleRequest {
    schedule: Option<ScheduleConfig>,
}

/// PUT /api/links/:id/schedule - set or clear the recurring sync
async fn links_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ScheduleRequest>,
) -> Response {
    let conn = state.db.lock().await;
    respond(links::set_schedule(&conn, &id, req.schedule))
}

#[derive(Deserialize, Default)]
struct SyncRequest {
    days: Option<i64>,
}

/// POST /api/links/:id/sync - manual sync, mutually exclusive with the
/// scheduler per account
async fn links_sync_now(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<SyncRequest>>,
) -> Response {
    let days = body.and_then(|Json(req)| req.days);
    let result = async {
        let deps = state.sync_deps()?;
        scheduler::sync_account(&deps, &id, days, Trigger::Manual).await
    }
    .await;
    respond(result)
}

#[derive(Deserialize)]
struct LogsQuery {
    account: Option<String>,
    limit: Option<usize>,
}

/// GET /api/sync-logs
async fn sync_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> Response {
    let conn = state.db.lock().await;
    respond(scheduler::list_sync_logs(
        &conn,
        query.limit.unwrap_or(50),
        query.account.as_deref(),
    ))
}

// ============================================================================
// History & Passthrough Handlers
// ============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    source: Option<String>,
}

/// GET /api/history - recent imports
async fn import_history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> Response {
    let source = query.source.as_deref().and_then(Source::from_str);
    let conn = state.db.lock().await;
    respond(ledger::history(&conn, query.limit.unwrap_or(100), source))
}

/// GET /api/stats - totals by source
async fn import_stats(State(state): State<AppState>) -> Response {
    let conn = state.db.lock().await;
    respond(ledger::stats(&conn))
}

/// GET /api/ynab/budgets
async fn ynab_budgets(State(state): State<AppState>) -> Response {
    let result = async {
        let client = state.ynab()?;
        client.list_budgets().await
    }
    .await;
    respond(result)
}

/// GET /api/ynab/budgets/:id/accounts
async fn ynab_accounts(State(state): State<AppState>, Path(budget_id): Path<String>) -> Response {
    let result = async {
        let client = state.ynab()?;
        client.list_accounts(&budget_id).await
    }
    .await;
    respond(result)
}

/// GET /api/akahu/accounts
async fn akahu_accounts(State(state): State<AppState>) -> Response {
    let result = async {
        let client = state.akahu()?;
        client.list_accounts().await
    }
    .await;
    respond(result)
}

/// GET /api/health
async fn health_check() -> Response {
    respond(Ok("OK"))
}

// ============================================================================
// Main Server
// ============================================================================

fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/csv/detect", post(csv_detect))
        .route("/csv/parse", post(csv_parse))
        .route("/csv/import", post(csv_import_batch))
        .route("/profiles", get(bank_profiles))
        .route("/mappings", get(mappings_list).post(mappings_save))
        .route("/mappings/:name", axum::routing::delete(mappings_delete))
        .route("/links", get(links_list).post(links_create))
        .route("/links/:id", axum::routing::delete(links_delete))
        .route("/links/:id/schedule", put(links_schedule))
        .route("/links/:id/sync", post(links_sync_now))
        .route("/sync-logs", get(sync_logs))
        .route("/history", get(import_history))
        .route("/stats", get(import_stats))
        .route("/ynab/budgets", get(ynab_budgets))
        .route("/ynab/budgets/:id/accounts", get(ynab_accounts))
        .route("/akahu/accounts", get(akahu_accounts))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ynab_bridge=info,tower_http=warn".into()),
        )
        .init();

    let settings = Settings::from_env();
    let conn = db::open_database(&settings.database_path)?;
    info!(path = %settings.database_path.display(), "database opened");

    let ynab = match YnabClient::new(&settings.ynab_access_token) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "YNAB client unavailable, import endpoints disabled");
            None
        }
    };
    let akahu = match AkahuClient::new(&settings.akahu_app_token, &settings.akahu_user_token) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!(error = %e, "Akahu client unavailable, sync endpoints disabled");
            None
        }
    };

    let state = AppState {
        db: db::into_shared(conn),
        guard: SyncGuard::new(),
        ynab,
        akahu,
    };

    // The scheduler only runs when both collaborators are configured; CSV
    // imports keep working either way.
    match state.sync_deps() {
        Ok(deps) => {
            let tick = std::time::Duration::from_secs(settings.scheduler_tick_secs);
            tokio::spawn(scheduler::run_scheduler(deps, tick));
        }
        Err(e) => warn!(error = %e, "scheduler disabled"),
    }

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "server listening");

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
