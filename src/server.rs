//! HTTP API.
//!
//! Exposes the batch entry points over JSON so a UI, or an external
//! scheduler, can drive them. Interactive and scheduled calls share the
//! same [`SyncOrchestrator`] methods.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/accounts/{id}/sync` | Fetch (capped) then quick parse |
//! | `POST` | `/accounts/{id}/parse` | Body `{"mode": "smart-full"}` |
//! | `POST` | `/accounts/{id}/dry-run` | Optional body `{"message_ids": [...]}` |
//! | `GET`  | `/accounts/{id}/audit` | Integrity audit |
//! | `POST` | `/cron/sync` | Scheduler trigger, `Authorization: Bearer <secret>` |
//!
//! Interactive user authentication is expected upstream (reverse proxy).
//! The scheduler trigger authenticates on its own with a shared secret.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "reauthorization_required", "message": "account 'work' must be reconnected: ..." } }
//! ```
//!
//! A batch that started and then stopped for reauthorization also carries
//! its partial `summary`, so progress committed before the failure is
//! still reported.
//!
//! Error codes: `bad_request` (400), `unauthorized` (401),
//! `reauthorization_required` (401), `not_found` (404), `conflict` (409),
//! `external_api_failure` (502), `internal` (500).

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use inbox_ledger_core::{AuditReport, LedgerError, ParseMode, RunSummary};

use crate::config::Config;
use crate::ingest::{DryRunReport, FetchScope, SyncOrchestrator};
use crate::progress::NoProgress;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<SyncOrchestrator>,
    config: Arc<Config>,
    cron_secret: Option<Arc<String>>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<SyncOrchestrator>,
        config: Config,
        cron_secret: Option<String>,
    ) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            cron_secret: cron_secret.map(Arc::new),
        }
    }
}

/// Build the router. Exposed separately so tests can serve it on an
/// ephemeral port with fake external clients.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/accounts/{id}/sync", post(handle_sync))
        .route("/accounts/{id}/parse", post(handle_parse))
        .route("/accounts/{id}/dry-run", post(handle_dry_run))
        .route("/accounts/{id}/audit", get(handle_audit))
        .route("/cron/sync", post(handle_cron_sync))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `[server].bind` until the process is terminated.
pub async fn run_server(config: &Config, orchestrator: Arc<SyncOrchestrator>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let cron_secret = config.server.cron_secret();
    if cron_secret.is_none() {
        warn!(
            env = %config.server.cron_secret_env,
            "no scheduler secret set; /cron/sync will reject every call"
        );
    }

    let app = router(AppState::new(orchestrator, config.clone(), cron_secret));

    println!("Inbox Ledger API listening on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<RunSummary>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    summary: Option<Box<RunSummary>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
            summary: self.summary.map(|s| *s),
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
        summary: None,
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
        summary: None,
    }
}


/// Map an orchestrator error onto the HTTP error contract.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let (status, code) = match LedgerError::find(&err) {
            Some(LedgerError::AccountNotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Some(LedgerError::BatchInProgress(_)) | Some(LedgerError::AccountDisconnected(_)) => {
                (StatusCode::CONFLICT, "conflict")
            }
            Some(LedgerError::ReauthorizationRequired { .. }) => {
                (StatusCode::UNAUTHORIZED, "reauthorization_required")
            }
            Some(LedgerError::ExternalApi(_)) => (StatusCode::BAD_GATEWAY, "external_api_failure"),
            Some(LedgerError::InvalidRulePattern { .. }) => (StatusCode::BAD_REQUEST, "bad_request"),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(error = %message, "request failed");
        }
        AppError {
            status,
            code,
            message,
            summary: None,
        }
    }
}

/// A run that stopped on a reauthorization failure is reported as an
/// error, with its partial summary attached, so the caller prompts the user
/// to reconnect. Other aborts come back as a normal summary with `aborted`
/// set.
fn summary_response(summary: RunSummary) -> Result<Json<RunSummary>, AppError> {
    if summary.needs_reauthorization() {
        let message = summary
            .aborted
            .as_ref()
            .map(|a| a.message().to_string())
            .unwrap_or_default();
        return Err(AppError {
            status: StatusCode::UNAUTHORIZED,
            code: "reauthorization_required",
            message,
            summary: Some(Box::new(summary)),
        });
    }
    Ok(Json(summary))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Account batches ============

async fn handle_sync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunSummary>, AppError> {
    info!(account = %id, "sync requested");
    let summary = state
        .orchestrator
        .sync(
            &id,
            FetchScope::Capped(state.config.mailbox.fetch_cap),
            &CancellationToken::new(),
            &NoProgress,
        )
        .await?;
    summary_response(summary)
}

#[derive(Deserialize)]
struct ParseRequest {
    mode: ParseMode,
}

async fn handle_parse(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ParseRequest>, JsonRejection>,
) -> Result<Json<RunSummary>, AppError> {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;
    info!(account = %id, mode = %req.mode, "parse requested");
    let summary = state
        .orchestrator
        .parse(&id, req.mode, &CancellationToken::new(), &NoProgress)
        .await?;
    summary_response(summary)
}

#[derive(Deserialize, Default)]
struct DryRunRequest {
    #[serde(default)]
    message_ids: Option<Vec<String>>,
}

async fn handle_dry_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<DryRunReport>, AppError> {
    let req: DryRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        DryRunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?
    };
    let report = state.orchestrator.dry_run(&id, req.message_ids).await?;
    Ok(Json(report))
}

async fn handle_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AuditReport>, AppError> {
    let report = state
        .orchestrator
        .audit(&id, state.config.audit.sample_limit)
        .await?;
    Ok(Json(report))
}

// ============ POST /cron/sync ============

#[derive(Serialize)]
struct CronResponse {
    accounts: Vec<RunSummary>,
    /// Accounts whose owner must reconnect before the next run.
    reauthorization_required: Vec<String>,
}

/// Constant-time comparison of the presented token against the secret.
///
/// Both sides are MACed under the secret and compared with `verify_slice`,
/// so neither timing nor length leaks how much of the token matched.
fn secret_matches(secret: &str, presented: &str) -> bool {
    let Ok(mut expected) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    expected.update(secret.as_bytes());
    let expected = expected.finalize().into_bytes();

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(presented.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn authorize_cron(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let secret = state
        .cron_secret
        .as_ref()
        .ok_or_else(|| unauthorized("scheduler secret is not configured"))?;
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| unauthorized("missing bearer token"))?;
    if !secret_matches(secret, presented.trim()) {
        return Err(unauthorized("invalid scheduler token"));
    }
    Ok(())
}

async fn handle_cron_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CronResponse>, AppError> {
    authorize_cron(&state, &headers)?;

    let summaries = state
        .orchestrator
        .sync_all_connected(
            FetchScope::AllPages,
            CancellationToken::new(),
            Arc::new(NoProgress),
        )
        .await?;
    let reauthorization_required = summaries
        .iter()
        .filter(|s| s.needs_reauthorization())
        .map(|s| s.account_id.clone())
        .collect();

    Ok(Json(CronResponse {
        accounts: summaries,
        reauthorization_required,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_comparison() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "s3cret "));
        assert!(!secret_matches("s3cret", "s3cre"));
        assert!(!secret_matches("s3cret", ""));
    }
}
