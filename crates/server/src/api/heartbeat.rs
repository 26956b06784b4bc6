//! Manual sweep triggers and fleet liveness overview

use super::{ActionResponse, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fleet_lib::{
    error::FleetError,
    monitor::FleetStatus,
    scheduler::{SweepKind, SweepOutcome},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Window for the status view's stale list
const STATUS_STALE_WINDOW_MINUTES: i64 = 10;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/heartbeat/check", post(check_now))
        .route("/heartbeat/check-async", post(check_async))
        .route("/heartbeat/cleanup", post(cleanup_now))
        .route("/heartbeat/cleanup-async", post(cleanup_async))
        .route("/heartbeat/status", get(fleet_status))
        .route("/heartbeat/tasks/:task_id", get(task_status))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupQuery {
    pub threshold_minutes: Option<i64>,
}

impl CleanupQuery {
    fn threshold(&self) -> Result<Option<chrono::Duration>, FleetError> {
        match self.threshold_minutes {
            Some(minutes) if minutes < 1 => Err(FleetError::Validation(
                "threshold_minutes must be at least 1".to_string(),
            )),
            Some(minutes) => Ok(Some(chrono::Duration::minutes(minutes))),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Queued {
    pub task_id: Uuid,
}

async fn check_now(
    State(state): State<AppState>,
) -> ApiResult<Json<ActionResponse<SweepOutcome>>> {
    let outcome = state.scheduler.run_now(SweepKind::Liveness, None).await?;
    Ok(ActionResponse::ok("liveness sweep completed", outcome))
}

async fn check_async(State(state): State<AppState>) -> Json<ActionResponse<Queued>> {
    let task_id = state.scheduler.trigger(SweepKind::Liveness, None);
    ActionResponse::ok("liveness sweep queued", Queued { task_id })
}

async fn cleanup_now(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<ActionResponse<SweepOutcome>>> {
    let outcome = state
        .scheduler
        .run_now(SweepKind::Staleness, query.threshold()?)
        .await?;
    Ok(ActionResponse::ok("staleness sweep completed", outcome))
}

async fn cleanup_async(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> ApiResult<Json<ActionResponse<Queued>>> {
    let task_id = state
        .scheduler
        .trigger(SweepKind::Staleness, query.threshold()?);
    Ok(ActionResponse::ok("staleness sweep queued", Queued { task_id }))
}

async fn fleet_status(State(state): State<AppState>) -> ApiResult<Json<FleetStatus>> {
    let status = state
        .monitor
        .fleet_status(chrono::Duration::minutes(STATUS_STALE_WINDOW_MINUTES))
        .await?;
    Ok(Json(status))
}

async fn task_status(State(state): State<AppState>, Path(task_id): Path<Uuid>) -> Response {
    match state.scheduler.task_status(&task_id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ActionResponse::<()> {
                success: false,
                message: format!("task {} not found", task_id),
                data: None,
            }),
        )
            .into_response(),
    }
}
