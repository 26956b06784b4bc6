//! Agent registry endpoints

use super::{ActionResponse, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use fleet_lib::{
    error::FleetError,
    models::{Agent, AgentId, AgentStatus, Capacity, Utilization},
    monitor::ConnectionReport,
    store::AgentFilter,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/agents", get(list_agents).post(create_agent))
        .route(
            "/agents/:id",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route("/agents/:id/test", post(test_connection))
}

/// Agent as exposed over the API; credentials are never echoed back
#[derive(Debug, Serialize)]
pub struct AgentView {
    pub id: AgentId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub has_password: bool,
    pub ssh_key_path: Option<PathBuf>,
    pub capacity: Capacity,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub utilization: Utilization,
    pub locust_version: Option<String>,
    pub python_version: Option<String>,
    pub system_info: Option<serde_json::Value>,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Agent> for AgentView {
    fn from(agent: Agent) -> Self {
        Self {
            id: agent.id,
            has_password: agent.password.is_some(),
            name: agent.name,
            host: agent.host,
            port: agent.port,
            username: agent.username,
            ssh_key_path: agent.ssh_key_path,
            capacity: agent.capacity,
            status: agent.status,
            last_heartbeat: agent.last_heartbeat,
            utilization: agent.utilization,
            locust_version: agent.locust_version,
            python_version: agent.python_version,
            system_info: agent.system_info,
            description: agent.description,
            active: agent.active,
            created_at: agent.created_at,
            updated_at: agent.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default)]
    pub capacity: Capacity,
    pub description: Option<String>,
}

fn default_port() -> u16 {
    22
}

/// Partial update. Liveness status is owned by the monitor; only the
/// maintenance flag can be set here.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateAgentRequest {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub capacity: Option<Capacity>,
    pub description: Option<String>,
    pub maintenance: Option<bool>,
}

fn require_text(field: &str, value: &str) -> Result<(), FleetError> {
    if value.trim().is_empty() {
        return Err(FleetError::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

async fn list_agents(
    State(state): State<AppState>,
    Query(filter): Query<AgentFilter>,
) -> ApiResult<Json<Vec<AgentView>>> {
    let agents = state.store.list_agents(&filter).await?;
    Ok(Json(agents.into_iter().map(AgentView::from).collect()))
}

async fn create_agent(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentView>)> {
    require_text("name", &request.name)?;
    require_text("host", &request.host)?;
    require_text("username", &request.username)?;

    let mut agent = Agent::new(request.name, request.host, request.username, request.capacity);
    agent.port = request.port;
    agent.password = request.password;
    agent.ssh_key_path = request.ssh_key_path;
    agent.description = request.description;

    let agent = state.store.insert_agent(agent).await?;
    Ok((StatusCode::CREATED, Json(agent.into())))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> ApiResult<Json<AgentView>> {
    Ok(Json(state.store.get_agent(id).await?.into()))
}

async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
    Json(request): Json<UpdateAgentRequest>,
) -> ApiResult<Json<AgentView>> {
    let mut agent = state.store.get_agent(id).await?;
    let capacity_changed = request.capacity.is_some_and(|c| c != agent.capacity);

    if let Some(name) = request.name {
        require_text("name", &name)?;
        agent.name = name;
    }
    if let Some(host) = request.host {
        require_text("host", &host)?;
        agent.host = host;
    }
    if let Some(port) = request.port {
        agent.port = port;
    }
    if let Some(username) = request.username {
        agent.username = username;
    }
    if request.password.is_some() {
        agent.password = request.password;
    }
    if request.ssh_key_path.is_some() {
        agent.ssh_key_path = request.ssh_key_path;
    }
    if let Some(capacity) = request.capacity {
        agent.capacity = capacity;
    }
    if request.description.is_some() {
        agent.description = request.description;
    }
    match request.maintenance {
        Some(true) => agent.status = AgentStatus::Maintenance,
        Some(false) if agent.status == AgentStatus::Maintenance => {
            agent.status = AgentStatus::Offline
        }
        _ => {}
    }

    let agent = state.store.update_agent(agent).await?;
    if capacity_changed {
        state.plans.revalidate_agent(id).await?;
    }
    Ok(Json(agent.into()))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    state.store.deactivate_agent(id).await?;
    Ok(ActionResponse::done(format!("agent {} deactivated", id)))
}

async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<AgentId>,
) -> ApiResult<Json<ActionResponse<ConnectionReport>>> {
    let report = state.monitor.test_connection(id).await?;
    Ok(Json(ActionResponse {
        success: report.success,
        message: report.message.clone(),
        data: Some(report),
    }))
}
