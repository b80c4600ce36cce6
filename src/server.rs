use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::daemon::{SharedCore, StartRequest, StopReason};
use crate::error::FenceError;
use crate::models::{ApprovedSchedule, BlockEntry, BlockSettings};

/// IPC surface between the unprivileged agent/CLI and the daemon.
///
/// Authorized routes require the control token. `start` under
/// /v1/schedules is deliberately unauthenticated: consent was captured at
/// registration time, and the daemon only honors ids present in its
/// approved-schedules store.
#[derive(Clone)]
pub struct AppState {
    pub core: SharedCore,
    pub control_token: String,
}

pub fn build_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/v1/version", get(version_handler))
        .route("/v1/block/start", post(start_block_handler))
        .route("/v1/block/blocklist", post(update_blocklist_handler))
        .route("/v1/block/end-date", post(update_end_date_handler))
        .route("/v1/block/stop-test", post(stop_test_handler))
        .route("/v1/block/clear-expired", post(clear_expired_handler))
        .route("/v1/block/status", get(status_handler))
        .route("/v1/schedules/register", post(register_schedule_handler))
        .route("/v1/schedules/start", post(start_scheduled_handler))
        .route("/v1/schedules/unregister", post(unregister_schedule_handler))
        .route("/v1/schedules/cleanup-stale", post(cleanup_stale_handler));

    #[cfg(debug_assertions)]
    let router = router.route("/v1/block/clear-debug", post(clear_debug_handler));

    router.with_state(state)
}

/// Validate the control token: bearer, or the password of HTTP basic
/// auth. Comparison is constant-time.
pub fn authenticate(control_token: &str, headers: &HeaderMap) -> bool {
    let Some(auth_header) = headers.get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(auth_str) = auth_header.to_str() else {
        return false;
    };

    if let Some(token) = auth_str.strip_prefix("Bearer ")
        && constant_time_eq(token.trim(), control_token)
    {
        debug!("authenticated via bearer token");
        return true;
    }

    if let Some(encoded) = auth_str.strip_prefix("Basic ") {
        use base64::Engine;
        if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim())
            && let Ok(credentials) = String::from_utf8(decoded)
            && let Some((_user, password)) = credentials.split_once(':')
            && constant_time_eq(password, control_token)
        {
            debug!("authenticated via basic auth");
            return true;
        }
    }

    false
}

/// Constant-time string comparison to prevent timing attacks on token
/// validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn error_response(error: FenceError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, error.to_string()).into_response()
}

fn unauthorized() -> Response {
    error_response(FenceError::AuthorizationDenied)
}

fn ok() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

// ── Request bodies ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StartBlockBody {
    pub controlling_uid: u32,
    pub blocklist: Vec<BlockEntry>,
    #[serde(default)]
    pub is_allowlist: bool,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub settings: BlockSettings,
    #[serde(default)]
    pub is_test: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlocklistBody {
    pub blocklist: Vec<BlockEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndDateBody {
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleIdBody {
    pub schedule_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartScheduledBody {
    pub schedule_id: String,
    pub end_date: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: String,
}

// ── Handlers ───────────────────────────────────────────────────────────

async fn version_handler() -> Response {
    axum::Json(VersionReply {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
    .into_response()
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let core = state.core.lock().await;
    axum::Json(core.status().await).into_response()
}

async fn start_block_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<StartBlockBody>,
) -> Response {
    if !authenticate(&state.control_token, &headers) {
        return unauthorized();
    }
    let request = StartRequest {
        controlling_uid: body.controlling_uid,
        blocklist: body.blocklist,
        is_allowlist: body.is_allowlist,
        end_date: body.end_date,
        settings: body.settings,
        is_test: body.is_test,
    };
    match state.core.lock().await.start(request, Utc::now()).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn update_blocklist_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<BlocklistBody>,
) -> Response {
    if !authenticate(&state.control_token, &headers) {
        return unauthorized();
    }
    match state.core.lock().await.update_blocklist(body.blocklist).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn update_end_date_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<EndDateBody>,
) -> Response {
    if !authenticate(&state.control_token, &headers) {
        return unauthorized();
    }
    match state.core.lock().await.update_end_date(body.end_date, Utc::now()).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn stop_test_handler(State(state): State<AppState>) -> Response {
    match state.core.lock().await.stop(StopReason::Test, Utc::now()).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn clear_expired_handler(State(state): State<AppState>) -> Response {
    match state.core.lock().await.stop(StopReason::Expired, Utc::now()).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn register_schedule_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ApprovedSchedule>,
) -> Response {
    if !authenticate(&state.control_token, &headers) {
        return unauthorized();
    }
    match state.core.lock().await.register_schedule(body).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn start_scheduled_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<StartScheduledBody>,
) -> Response {
    match state
        .core
        .lock()
        .await
        .start_scheduled(&body.schedule_id, body.end_date, Utc::now())
        .await
    {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn unregister_schedule_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<ScheduleIdBody>,
) -> Response {
    if !authenticate(&state.control_token, &headers) {
        return unauthorized();
    }
    match state.core.lock().await.unregister_schedule(&body.schedule_id).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

async fn cleanup_stale_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<ScheduleIdBody>,
) -> Response {
    match state
        .core
        .lock()
        .await
        .cleanup_stale_schedule(&body.schedule_id, Utc::now())
        .await
    {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}

#[cfg(debug_assertions)]
async fn clear_debug_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authenticate(&state.control_token, &headers) {
        return unauthorized();
    }
    match state.core.lock().await.stop(StopReason::Debug, Utc::now()).await {
        Ok(()) => ok(),
        Err(e) => error_response(e),
    }
}
