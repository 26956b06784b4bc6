//! Allocation plan commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ActionResponse, ApiClient, CapacityReport, Plan};
use crate::output::{
    color_status, print_json, print_rows, print_success, print_warning, OutputFormat,
};

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Agent")]
    agent_id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Master")]
    master: String,
    #[tabled(rename = "Workers")]
    workers: u32,
    #[tabled(rename = "Valid")]
    valid: String,
    #[tabled(rename = "Message")]
    message: String,
}

impl From<&Plan> for PlanRow {
    fn from(plan: &Plan) -> Self {
        Self {
            id: plan.id,
            agent_id: plan.agent_id,
            name: plan.name.clone(),
            master: if plan.master_enabled { "yes" } else { "no" }.to_string(),
            workers: plan.worker_count,
            valid: color_status(if plan.is_valid { "valid" } else { "invalid" }),
            message: plan.validation_message.clone().unwrap_or_default(),
        }
    }
}

pub async fn list_plans(
    client: &ApiClient,
    agent_id: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let path = match agent_id {
        Some(agent_id) => format!("plans?agent_id={}", agent_id),
        None => "plans".to_string(),
    };
    let plans: Vec<Plan> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&plans)?,
        OutputFormat::Table => print_rows(plans.iter().map(PlanRow::from).collect(), "No plans found"),
    }
    Ok(())
}

/// Re-check a plan against its agent's current capacity
pub async fn validate_plan(client: &ApiClient, id: u64, format: OutputFormat) -> Result<()> {
    let response: ActionResponse<CapacityReport> =
        client.post_empty(&format!("plans/{}/validate", id)).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if response.success {
                print_success(&response.message);
            } else {
                print_warning(&response.message);
            }
        }
    }
    Ok(())
}
