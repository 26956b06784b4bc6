//! Agent registry commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ActionResponse, Agent, ApiClient, ConnectionReport};
use crate::output::{
    color_status, format_optional_timestamp, format_percent, print_field, print_json,
    print_rows, print_success, print_warning, OutputFormat,
};

/// Row for agents table
#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Last Heartbeat")]
    last_heartbeat: String,
}

impl From<&Agent> for AgentRow {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            name: agent.name.clone(),
            host: format!("{}:{}", agent.host, agent.port),
            status: color_status(&agent.status),
            cpu: format_percent(agent.utilization.cpu_percent),
            memory: format_percent(agent.utilization.memory_percent),
            last_heartbeat: format_optional_timestamp(agent.last_heartbeat.as_deref()),
        }
    }
}

/// List agents, optionally by status
pub async fn list_agents(
    client: &ApiClient,
    status: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let path = match &status {
        Some(status) => format!("agents?status={}", status.to_lowercase()),
        None => "agents".to_string(),
    };
    let agents: Vec<Agent> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&agents)?,
        OutputFormat::Table => {
            print_rows(agents.iter().map(AgentRow::from).collect(), "No agents found")
        }
    }
    Ok(())
}

/// Show one agent in detail
pub async fn show_agent(client: &ApiClient, id: u64, format: OutputFormat) -> Result<()> {
    let agent: Agent = client.get(&format!("agents/{}", id)).await?;

    match format {
        OutputFormat::Json => print_json(&agent)?,
        OutputFormat::Table => {
            println!("{}", format!("Agent {}", agent.name).bold());
            println!("{}", "=".repeat(40));
            print_field("ID", agent.id);
            print_field("Address", format!("{}@{}:{}", agent.username, agent.host, agent.port));
            print_field("Status", color_status(&agent.status));
            print_field(
                "Last heartbeat",
                format_optional_timestamp(agent.last_heartbeat.as_deref()),
            );
            print_field(
                "Capacity",
                format!(
                    "{} cores, {:.1} GB, {} Mbps, {:.1} GB disk",
                    agent.capacity.cpu_cores,
                    agent.capacity.memory_gb,
                    agent.capacity.network_mbps,
                    agent.capacity.disk_gb
                ),
            );
            print_field(
                "Utilization",
                format!(
                    "cpu {}, memory {}, network {}",
                    format_percent(agent.utilization.cpu_percent),
                    format_percent(agent.utilization.memory_percent),
                    format_percent(agent.utilization.network_percent)
                ),
            );
            if let Some(version) = &agent.locust_version {
                print_field("Locust", version);
            }
            if let Some(version) = &agent.python_version {
                print_field("Python", version);
            }
            if let Some(description) = &agent.description {
                print_field("Description", description);
            }
        }
    }
    Ok(())
}

/// Open a session to the agent and refresh its hardware facts
pub async fn test_agent(client: &ApiClient, id: u64, format: OutputFormat) -> Result<()> {
    let response: ActionResponse<ConnectionReport> =
        client.post_empty(&format!("agents/{}/test", id)).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if response.success {
                print_success(&response.message);
            } else {
                print_warning(&response.message);
            }
            if let Some(info) = response.data.and_then(|r| r.system_info) {
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
        }
    }
    Ok(())
}
