//! Execution endpoints

use super::{ActionResponse, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fleet_lib::{
    models::{AgentId, Execution, ExecutionId, PlanId, StrategyId, TaskId},
    store::ExecutionFilter,
};
use serde::Deserialize;

const DEFAULT_STOP_REASON: &str = "stopped by user";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/executions", get(list_executions).post(create_execution))
        .route(
            "/executions/:id",
            get(get_execution).delete(delete_execution),
        )
        .route("/executions/:id/start", post(start_execution))
        .route("/executions/:id/stop", post(stop_execution))
}

#[derive(Debug, Deserialize)]
pub struct CreateExecutionRequest {
    pub name: Option<String>,
    pub task_id: TaskId,
    pub strategy_id: StrategyId,
    pub agent_id: AgentId,
    pub plan_id: PlanId,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopRequest {
    pub reason: Option<String>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<Json<Vec<Execution>>> {
    Ok(Json(state.orchestrator.list(&filter).await?))
}

async fn create_execution(
    State(state): State<AppState>,
    Json(request): Json<CreateExecutionRequest>,
) -> ApiResult<(StatusCode, Json<Execution>)> {
    let mut execution = Execution::new(
        request.task_id,
        request.strategy_id,
        request.agent_id,
        request.plan_id,
    );
    execution.name = request.name;

    let execution = state.orchestrator.create(execution).await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(state.orchestrator.status(id).await?))
}

async fn delete_execution(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    state.orchestrator.delete(id).await?;
    Ok(ActionResponse::done(format!("execution {} deleted", id)))
}

async fn start_execution(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
) -> ApiResult<Json<ActionResponse<Execution>>> {
    let execution = state.orchestrator.start(id).await?;
    Ok(ActionResponse::ok(
        format!("execution {} started", id),
        execution,
    ))
}

async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<ExecutionId>,
    request: Option<Json<StopRequest>>,
) -> ApiResult<Json<ActionResponse<Execution>>> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());

    let execution = state.orchestrator.stop(id, &reason).await?;
    Ok(ActionResponse::ok(
        format!("execution {} stopped", id),
        execution,
    ))
}
