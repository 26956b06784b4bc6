//! Execution commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ActionResponse, ApiClient, Execution, StopRequest};
use crate::output::{
    color_status, format_duration, format_optional_timestamp, format_percent, print_field,
    print_json, print_rows, print_success, OutputFormat,
};

#[derive(Tabled)]
struct ExecutionRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Agent")]
    agent_id: u64,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Started")]
    started_at: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Requests")]
    requests: u64,
    #[tabled(rename = "Errors")]
    error_rate: String,
}

impl From<&Execution> for ExecutionRow {
    fn from(execution: &Execution) -> Self {
        Self {
            id: execution.id,
            name: execution.name.clone().unwrap_or_else(|| "-".to_string()),
            agent_id: execution.agent_id,
            status: color_status(&execution.status),
            started_at: format_optional_timestamp(execution.started_at.as_deref()),
            duration: execution
                .duration_secs
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string()),
            requests: execution.metrics.total_requests,
            error_rate: format_percent(execution.metrics.error_rate),
        }
    }
}

pub async fn list_executions(
    client: &ApiClient,
    status: Option<String>,
    agent_id: Option<u64>,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let mut query = Vec::new();
    if let Some(status) = status {
        query.push(format!("status={}", status.to_lowercase()));
    }
    if let Some(agent_id) = agent_id {
        query.push(format!("agent_id={}", agent_id));
    }
    if let Some(limit) = limit {
        query.push(format!("limit={}", limit));
    }
    let path = if query.is_empty() {
        "executions".to_string()
    } else {
        format!("executions?{}", query.join("&"))
    };

    let executions: Vec<Execution> = client.get(&path).await?;
    match format {
        OutputFormat::Json => print_json(&executions)?,
        OutputFormat::Table => print_rows(
            executions.iter().map(ExecutionRow::from).collect(),
            "No executions found",
        ),
    }
    Ok(())
}

pub async fn show_execution(client: &ApiClient, id: u64, format: OutputFormat) -> Result<()> {
    let execution: Execution = client.get(&format!("executions/{}", id)).await?;

    match format {
        OutputFormat::Json => print_json(&execution)?,
        OutputFormat::Table => print_execution(&execution),
    }
    Ok(())
}

fn print_execution(execution: &Execution) {
    let title = match &execution.name {
        Some(name) => format!("Execution {} ({})", execution.id, name),
        None => format!("Execution {}", execution.id),
    };
    println!("{}", title.bold());
    println!("{}", "=".repeat(40));
    print_field("Status", color_status(&execution.status));
    print_field(
        "References",
        format!(
            "task {}, strategy {}, agent {}, plan {}",
            execution.task_id, execution.strategy_id, execution.agent_id, execution.plan_id
        ),
    );
    print_field(
        "Started",
        format_optional_timestamp(execution.started_at.as_deref()),
    );
    print_field(
        "Completed",
        format_optional_timestamp(execution.completed_at.as_deref()),
    );
    if let Some(secs) = execution.duration_secs {
        print_field("Duration", format_duration(secs));
    }
    if let Some(error) = &execution.error_message {
        print_field("Error", error.red());
    }

    let m = &execution.metrics;
    if m.total_requests > 0 {
        println!();
        print_field("Requests", m.total_requests);
        print_field("Failures", format!("{} ({})", m.total_failures, format_percent(m.error_rate)));
        print_field("RPS", format!("{:.2}", m.requests_per_second));
        print_field(
            "Response ms",
            format!(
                "avg {:.1}, median {:.1}, min {:.1}, max {:.1}",
                m.avg_response_time, m.median_response_time, m.min_response_time, m.max_response_time
            ),
        );
    }
}

pub async fn start_execution(client: &ApiClient, id: u64, format: OutputFormat) -> Result<()> {
    let response: ActionResponse<Execution> =
        client.post_empty(&format!("executions/{}/start", id)).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => print_success(&response.message),
    }
    Ok(())
}

pub async fn stop_execution(
    client: &ApiClient,
    id: u64,
    reason: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let response: ActionResponse<Execution> = client
        .post(&format!("executions/{}/stop", id), &StopRequest { reason })
        .await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => print_success(&response.message),
    }
    Ok(())
}
