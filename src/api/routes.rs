use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::config::PnlRounding;
use crate::error::{ReconcileError, ReconcileResult};
use crate::middleware::request_logging_simple;
use crate::models::AuditRunLogEntry;
use crate::reconcile::{
    AuditReport, FixRequest, FixResult, Reconciler, RollbackResult, UserAuditResult,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

/// Create the admin API router
pub fn create_router(reconciler: Arc<Reconciler>) -> Router {
    let state = AppState { reconciler };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/admin/config", get(get_config))
        .route("/api/admin/audit", post(run_audit))
        .route("/api/admin/audit/user/:identifier", get(audit_user))
        .route("/api/admin/fix", post(apply_fix))
        .route("/api/admin/history", get(list_history))
        .route("/api/admin/rollback/:fix_log_id", post(rollback))
        .with_state(state)
        .layer(middleware::from_fn(request_logging_simple))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Run blocking ledger work off the async runtime
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Reconciler) -> ReconcileResult<T> + Send + 'static,
{
    let reconciler = state.reconciler.clone();
    tokio::task::spawn_blocking(move || f(&reconciler))
        .await
        .map_err(|e| ApiError::Join(e.to_string()))?
        .map_err(ApiError::from)
}

// ===== Route Handlers =====

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = state.reconciler.config();
    Json(ConfigResponse {
        starting_grant_cents: config.starting_grant_cents,
        pnl_rounding: config.pnl_rounding,
    })
}

/// POST /api/admin/audit
async fn run_audit(
    State(state): State<AppState>,
    Json(body): Json<TriggerBody>,
) -> Result<Json<AuditReport>, ApiError> {
    let triggered_by = body.triggered_by()?;
    blocking(&state, move |r| r.run_full_audit(&triggered_by))
        .await
        .map(Json)
}

/// GET /api/admin/audit/user/:identifier?price=
async fn audit_user(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(params): Query<AuditUserQuery>,
) -> Result<Json<UserAuditResult>, ApiError> {
    let triggered_by = params
        .triggered_by
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "admin_api".to_string());
    blocking(&state, move |r| {
        r.audit_user(&identifier, params.price, &triggered_by)
    })
    .await
    .map(Json)
}

/// POST /api/admin/fix
async fn apply_fix(
    State(state): State<AppState>,
    Json(request): Json<FixRequest>,
) -> Result<Json<FixResult>, ApiError> {
    blocking(&state, move |r| r.apply_fix(&request))
        .await
        .map(Json)
}

/// GET /api/admin/history?limit=
async fn list_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let runs = blocking(&state, move |r| r.list_history(params.limit)).await?;
    Ok(Json(HistoryResponse {
        count: runs.len(),
        runs,
    }))
}

/// POST /api/admin/rollback/:fix_log_id
async fn rollback(
    State(state): State<AppState>,
    Path(fix_log_id): Path<i64>,
    Json(body): Json<TriggerBody>,
) -> Result<Json<RollbackResult>, ApiError> {
    let triggered_by = body.triggered_by()?;
    blocking(&state, move |r| r.rollback(fix_log_id, &triggered_by))
        .await
        .map(Json)
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct TriggerBody {
    triggered_by: String,
}

impl TriggerBody {
    fn triggered_by(self) -> Result<String, ApiError> {
        if self.triggered_by.trim().is_empty() {
            return Err(ReconcileError::InvalidRequest("triggered_by is required".into()).into());
        }
        Ok(self.triggered_by)
    }
}

#[derive(Deserialize)]
struct AuditUserQuery {
    /// Current market price, for display-only unrealized P&L
    price: Option<Decimal>,
    triggered_by: Option<String>,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ConfigResponse {
    starting_grant_cents: i64,
    pnl_rounding: PnlRounding,
}

#[derive(Serialize)]
struct HistoryResponse {
    count: usize,
    runs: Vec<AuditRunLogEntry>,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Reconcile(ReconcileError),
    Join(String),
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        ApiError::Reconcile(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Reconcile(err) => {
                let status = match err {
                    ReconcileError::NotFound(_) => StatusCode::NOT_FOUND,
                    ReconcileError::AlreadyRolledBack(_) => StatusCode::CONFLICT,
                    ReconcileError::WrongLogType { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    ReconcileError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                    ReconcileError::Persistence(_) => {
                        error!("Ledger persistence error: {}", err);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
            ApiError::Join(msg) => {
                error!("Blocking task failed: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
