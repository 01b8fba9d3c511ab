//! HTTP face of the compute engine. Holds no state between requests.

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{WorkResult, WorkTask},
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, warn};

pub const EXECUTE_TURN_ROUTE: &str = "/execute_turn";
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn build_router(max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(EXECUTE_TURN_ROUTE, post(execute_turn))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn execute_turn(
    Json(task): Json<WorkTask>,
) -> Result<Json<WorkResult>, (StatusCode, Json<ApiError>)> {
    let turn = task.turn;
    let range = task.range;
    debug!(turn, band_start = range.start, band_end = range.end, "worker: task received");

    let outcome = tokio::task::spawn_blocking(move || engine::execute_turn(&task))
        .await
        .map_err(|e| {
            error!(turn, %e, "worker: compute task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;

    match outcome {
        Ok(result) => {
            debug!(turn, band_start = range.start, band_end = range.end, "worker: task complete");
            Ok(Json(result))
        }
        Err(e) => {
            warn!(turn, band = %range, error = %e, "worker: rejected malformed task");
            Err((
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(ErrorCode::Validation, e.to_string())),
            ))
        }
    }
}
