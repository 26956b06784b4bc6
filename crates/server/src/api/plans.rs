//! Allocation plan endpoints

use super::{ActionResponse, ApiResult, AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use fleet_lib::{
    capacity::CapacityReport,
    models::{AgentId, AllocationPlan, PlanId, ResourceRequest},
};
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/plans", get(list_plans).post(create_plan))
        .route(
            "/plans/:id",
            get(get_plan).put(update_plan).delete(delete_plan),
        )
        .route("/plans/:id/validate", post(validate_plan))
}

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    pub agent_id: Option<AgentId>,
}

/// Plan fields a client may set; omitted ones keep their defaults (on
/// create) or current values (on update)
#[derive(Debug, Default, Deserialize)]
pub struct PlanRequest {
    pub agent_id: Option<AgentId>,
    pub name: Option<String>,
    pub master_enabled: Option<bool>,
    pub master: Option<ResourceRequest>,
    pub worker_count: Option<u32>,
    pub worker: Option<ResourceRequest>,
    pub reserved: Option<ResourceRequest>,
    pub description: Option<String>,
}

impl PlanRequest {
    fn apply(self, plan: &mut AllocationPlan) {
        if let Some(name) = self.name {
            plan.name = name;
        }
        if let Some(enabled) = self.master_enabled {
            plan.master_enabled = enabled;
        }
        if let Some(master) = self.master {
            plan.master = master;
        }
        if let Some(count) = self.worker_count {
            plan.worker_count = count;
        }
        if let Some(worker) = self.worker {
            plan.worker = worker;
        }
        if let Some(reserved) = self.reserved {
            plan.reserved = reserved;
        }
        if self.description.is_some() {
            plan.description = self.description;
        }
    }
}

async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlanQuery>,
) -> ApiResult<Json<Vec<AllocationPlan>>> {
    Ok(Json(state.store.list_plans(query.agent_id).await?))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(request): Json<PlanRequest>,
) -> ApiResult<(StatusCode, Json<AllocationPlan>)> {
    let agent_id = request.agent_id.ok_or_else(|| {
        fleet_lib::FleetError::Validation("agent_id is required".to_string())
    })?;
    let mut plan = AllocationPlan::new(agent_id, "default");
    request.apply(&mut plan);

    let plan = state.plans.create(plan).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<PlanId>,
) -> ApiResult<Json<AllocationPlan>> {
    Ok(Json(state.store.get_plan(id).await?))
}

async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<PlanId>,
    Json(request): Json<PlanRequest>,
) -> ApiResult<Json<AllocationPlan>> {
    let mut plan = state.store.get_plan(id).await?;
    if let Some(agent_id) = request.agent_id {
        plan.agent_id = agent_id;
    }
    request.apply(&mut plan);
    Ok(Json(state.plans.update(plan).await?))
}

async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<PlanId>,
) -> ApiResult<Json<ActionResponse<()>>> {
    state.plans.delete(id).await?;
    Ok(ActionResponse::done(format!("plan {} deactivated", id)))
}

async fn validate_plan(
    State(state): State<AppState>,
    Path(id): Path<PlanId>,
) -> ApiResult<Json<ActionResponse<CapacityReport>>> {
    let report = state.plans.validate(id).await?;
    Ok(Json(ActionResponse {
        success: report.valid,
        message: report.message.clone(),
        data: Some(report),
    }))
}
