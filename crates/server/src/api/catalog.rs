//! Test catalog endpoints: tasks, scripts, strategies, interface scenarios
//! and their uploaded files

use super::{ActionResponse, ApiResult, AppState};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use fleet_lib::{
    error::FleetError,
    models::{
        FileId, InterfaceScenario, RunStrategy, ScenarioFile, ScenarioId, ScenarioType, ScriptId,
        StrategyId, StrategyType, TaskId, TestScript, TestTask,
    },
    objects::FileUpload,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Headroom above the file size limit for the rest of the request
const BODY_LIMIT_SLACK: usize = 64 * 1024;

pub fn routes(max_file_size: usize) -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route(
            "/tasks/:id/scenarios",
            get(list_scenarios).post(create_scenario),
        )
        .route("/scripts", get(list_scripts).post(create_script))
        .route("/scripts/:id", get(get_script).delete(delete_script))
        .route("/strategies", get(list_strategies).post(create_strategy))
        .route(
            "/strategies/:id",
            get(get_strategy).delete(delete_strategy),
        )
        .route("/scenarios/:id", delete(delete_scenario))
        .route(
            "/scenarios/:id/files",
            get(list_files)
                .post(upload_file)
                .layer(DefaultBodyLimit::max(max_file_size + BODY_LIMIT_SLACK)),
        )
        .route("/files/:id", get(get_file).delete(delete_file))
        .route(
            "/files/:id/content",
            get(file_content)
                .put(update_file_content)
                .layer(DefaultBodyLimit::max(max_file_size + BODY_LIMIT_SLACK)),
        )
        .route("/files/:id/verify", post(verify_file))
}

fn require_text(field: &str, value: &str) -> Result<(), FleetError> {
    if value.trim().is_empty() {
        return Err(FleetError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

// Tasks

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub scenario_type: ScenarioType,
    pub target_host: Option<String>,
    pub script_id: Option<ScriptId>,
}

async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Vec<TestTask>>> {
    Ok(Json(state.store.list_tasks().await?))
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<TestTask>)> {
    require_text("name", &request.name)?;
    if let Some(script_id) = request.script_id {
        state.store.get_script(script_id).await?;
    }

    let mut task = TestTask::new(request.name, request.target_host);
    task.description = request.description;
    task.scenario_type = request.scenario_type;
    task.script_id = request.script_id;

    Ok((StatusCode::CREATED, Json(state.store.insert_task(task).await?)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<TestTask>> {
    Ok(Json(state.store.get_task(id).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    state.store.deactivate_task(id).await?;
    Ok(ActionResponse::done(format!("task {} deactivated", id)))
}

// Interface scenarios

#[derive(Debug, Deserialize)]
pub struct CreateScenarioRequest {
    pub interface_name: String,
    pub interface_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub order: Option<u32>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_timeout() -> u64 {
    30
}

async fn list_scenarios(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Json<Vec<InterfaceScenario>>> {
    state.store.get_task(task_id).await?;
    Ok(Json(state.store.list_scenarios(task_id).await?))
}

async fn create_scenario(
    State(state): State<AppState>,
    Path(task_id): Path<TaskId>,
    Json(request): Json<CreateScenarioRequest>,
) -> ApiResult<(StatusCode, Json<InterfaceScenario>)> {
    state.store.get_task(task_id).await?;
    require_text("interface_name", &request.interface_name)?;
    require_text("interface_url", &request.interface_url)?;

    let existing = state.store.list_scenarios(task_id).await?;
    let mut scenario = InterfaceScenario::new(
        task_id,
        request.interface_name,
        request.interface_url,
        request.method,
    );
    scenario.weight = request.weight;
    scenario.order = request
        .order
        .unwrap_or_else(|| existing.iter().map(|s| s.order).max().unwrap_or(0) + 1);
    scenario.headers = request.headers;
    scenario.body = request.body;
    scenario.timeout_secs = request.timeout_secs;

    Ok((
        StatusCode::CREATED,
        Json(state.store.insert_scenario(scenario).await?),
    ))
}

async fn delete_scenario(
    State(state): State<AppState>,
    Path(id): Path<ScenarioId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    for file in state.files.list(id).await? {
        state.files.delete(file.id).await?;
    }
    state.store.delete_scenario(id).await?;
    Ok(ActionResponse::done(format!("scenario {} deleted", id)))
}

// Scripts

#[derive(Debug, Deserialize)]
pub struct CreateScriptRequest {
    pub name: String,
    pub content: String,
    pub description: Option<String>,
    pub target_host: Option<String>,
}

async fn list_scripts(State(state): State<AppState>) -> ApiResult<Json<Vec<TestScript>>> {
    Ok(Json(state.store.list_scripts().await?))
}

async fn create_script(
    State(state): State<AppState>,
    Json(request): Json<CreateScriptRequest>,
) -> ApiResult<(StatusCode, Json<TestScript>)> {
    require_text("name", &request.name)?;
    require_text("content", &request.content)?;

    let mut script = TestScript::new(request.name, request.content);
    script.description = request.description;
    script.target_host = request.target_host;

    Ok((StatusCode::CREATED, Json(state.store.insert_script(script).await?)))
}

async fn get_script(
    State(state): State<AppState>,
    Path(id): Path<ScriptId>,
) -> ApiResult<Json<TestScript>> {
    Ok(Json(state.store.get_script(id).await?))
}

async fn delete_script(
    State(state): State<AppState>,
    Path(id): Path<ScriptId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    state.store.deactivate_script(id).await?;
    Ok(ActionResponse::done(format!("script {} deactivated", id)))
}

// Strategies

#[derive(Debug, Deserialize)]
pub struct CreateStrategyRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub strategy_type: StrategyType,
    pub user_count: u32,
    pub spawn_rate: u32,
    pub run_time_secs: u64,
    pub ramp_up_secs: Option<u64>,
}

async fn list_strategies(State(state): State<AppState>) -> ApiResult<Json<Vec<RunStrategy>>> {
    Ok(Json(state.store.list_strategies().await?))
}

async fn create_strategy(
    State(state): State<AppState>,
    Json(request): Json<CreateStrategyRequest>,
) -> ApiResult<(StatusCode, Json<RunStrategy>)> {
    require_text("name", &request.name)?;
    if request.user_count == 0 || request.spawn_rate == 0 || request.run_time_secs == 0 {
        return Err(FleetError::Validation(
            "user_count, spawn_rate and run_time_secs must be positive".to_string(),
        )
        .into());
    }

    let mut strategy = RunStrategy::new(
        request.name,
        request.user_count,
        request.spawn_rate,
        request.run_time_secs,
    );
    strategy.description = request.description;
    strategy.strategy_type = request.strategy_type;
    if let Some(ramp_up) = request.ramp_up_secs {
        strategy.ramp_up_secs = ramp_up;
    }

    Ok((
        StatusCode::CREATED,
        Json(state.store.insert_strategy(strategy).await?),
    ))
}

async fn get_strategy(
    State(state): State<AppState>,
    Path(id): Path<StrategyId>,
) -> ApiResult<Json<RunStrategy>> {
    Ok(Json(state.store.get_strategy(id).await?))
}

async fn delete_strategy(
    State(state): State<AppState>,
    Path(id): Path<StrategyId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    state.store.deactivate_strategy(id).await?;
    Ok(ActionResponse::done(format!("strategy {} deactivated", id)))
}

// Scenario files

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub file_name: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Integrity {
    pub intact: bool,
}

async fn list_files(
    State(state): State<AppState>,
    Path(scenario_id): Path<ScenarioId>,
) -> ApiResult<Json<Vec<ScenarioFile>>> {
    Ok(Json(state.files.list(scenario_id).await?))
}

/// Raw body upload; the name comes from the query string
async fn upload_file(
    State(state): State<AppState>,
    Path(scenario_id): Path<ScenarioId>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ScenarioFile>)> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let file = state
        .files
        .upload(
            scenario_id,
            FileUpload {
                file_name: query.file_name,
                content_type,
                bytes: body.to_vec(),
                description: query.description,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
) -> ApiResult<Json<ScenarioFile>> {
    Ok(Json(state.files.get(id).await?))
}

async fn file_content(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
) -> ApiResult<impl IntoResponse> {
    let file = state.files.get(id).await?;
    let bytes = state.files.read(id).await?;
    Ok(([(header::CONTENT_TYPE, file.content_type)], bytes))
}

async fn update_file_content(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
    content: String,
) -> ApiResult<Json<ScenarioFile>> {
    Ok(Json(state.files.update_content(id, content).await?))
}

async fn verify_file(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
) -> ApiResult<Json<ActionResponse<Integrity>>> {
    let intact = state.files.verify(id).await?;
    let message = if intact {
        "content hash matches"
    } else {
        "content hash mismatch"
    };
    Ok(Json(ActionResponse {
        success: intact,
        message: message.to_string(),
        data: Some(Integrity { intact }),
    }))
}

async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<FileId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    state.files.delete(id).await?;
    Ok(ActionResponse::done(format!("file {} deleted", id)))
}
