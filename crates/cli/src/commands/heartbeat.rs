//! Liveness sweep commands

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{
    ActionResponse, AgentCheck, ApiClient, CleanupReport, FleetStatus, Queued, SweepReport,
    TaskRecord,
};
use crate::output::{
    color_status, format_optional_timestamp, format_timestamp, print_field, print_info,
    print_json, print_rows, print_success, print_warning, OutputFormat,
};

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "ID")]
    id: u64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&AgentCheck> for CheckRow {
    fn from(check: &AgentCheck) -> Self {
        Self {
            id: check.agent_id,
            name: check.name.clone(),
            host: check.host.clone(),
            status: color_status(&check.status),
            detail: check.message.clone().unwrap_or_default(),
        }
    }
}

fn cleanup_path(base: &str, threshold_minutes: Option<i64>) -> String {
    match threshold_minutes {
        Some(minutes) => format!("{}?threshold_minutes={}", base, minutes),
        None => base.to_string(),
    }
}

/// Run a liveness sweep and wait for its report
pub async fn check(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: ActionResponse<SweepReport> = client.post_empty("heartbeat/check").await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            let Some(report) = response.data else {
                print_warning(&response.message);
                return Ok(());
            };
            print_success(&format!(
                "Checked {} agents: {} online, {} failed",
                report.total_checked, report.successful, report.failed
            ));
            print_rows(
                report.details.iter().map(CheckRow::from).collect(),
                "No active agents",
            );
        }
    }
    Ok(())
}

/// Queue a liveness sweep and print its task id
pub async fn check_async(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: ActionResponse<Queued> = client.post_empty("heartbeat/check-async").await?;
    print_queued(response, format)
}

/// Mark stale agents offline
pub async fn cleanup(
    client: &ApiClient,
    threshold_minutes: Option<i64>,
    background: bool,
    format: OutputFormat,
) -> Result<()> {
    if background {
        let response: ActionResponse<Queued> = client
            .post_empty(&cleanup_path("heartbeat/cleanup-async", threshold_minutes))
            .await?;
        return print_queued(response, format);
    }

    let response: ActionResponse<CleanupReport> = client
        .post_empty(&cleanup_path("heartbeat/cleanup", threshold_minutes))
        .await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => match response.data {
            Some(report) => print_success(&format!(
                "Marked {} agents offline (threshold {} minutes)",
                report.marked_offline, report.threshold_minutes
            )),
            None => print_warning(&response.message),
        },
    }
    Ok(())
}

fn print_queued(response: ActionResponse<Queued>, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            print_success(&response.message);
            if let Some(queued) = response.data {
                print_info(&format!("Track with: fleetctl heartbeat task {}", queued.task_id));
            }
        }
    }
    Ok(())
}

/// Fleet-wide liveness counts and stale agents
pub async fn status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: FleetStatus = client.get("heartbeat/status").await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("{}", "Fleet Status".bold());
            println!("{}", "=".repeat(40));
            print_field("Agents", status.total);
            print_field("Online", status.online.to_string().green());
            print_field("Offline", status.offline.to_string().red());
            print_field("Maintenance", status.maintenance.to_string().yellow());
            print_field("Checked at", format_timestamp(&status.checked_at));

            if status.stale.is_empty() {
                return Ok(());
            }
            println!();
            print_warning(&format!("{} stale agents", status.stale.len()));
            for agent in &status.stale {
                println!(
                    "  {} {} ({}), last heartbeat {}",
                    agent.id,
                    agent.name,
                    agent.host,
                    format_optional_timestamp(agent.last_heartbeat.as_deref())
                );
            }
        }
    }
    Ok(())
}

/// Look up a queued sweep
pub async fn task(client: &ApiClient, task_id: &str, format: OutputFormat) -> Result<()> {
    let record: TaskRecord = client.get(&format!("heartbeat/tasks/{}", task_id)).await?;

    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Table => {
            print_field("Task", &record.task_id);
            print_field("Kind", &record.kind);
            print_field("Status", color_status(&record.status));
            print_field("Submitted", format_timestamp(&record.submitted_at));
            print_field(
                "Finished",
                format_optional_timestamp(record.finished_at.as_deref()),
            );
            if let Some(error) = &record.error {
                print_field("Error", error.red());
            }
            if let Some(result) = &record.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_path() {
        assert_eq!(cleanup_path("heartbeat/cleanup", None), "heartbeat/cleanup");
        assert_eq!(
            cleanup_path("heartbeat/cleanup", Some(45)),
            "heartbeat/cleanup?threshold_minutes=45"
        );
    }

    #[tokio::test]
    async fn test_check_hits_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/heartbeat/check")
            .with_status(200)
            .with_body(
                r#"{"success":true,"message":"liveness sweep completed","data":{"total_checked":1,"successful":1,"failed":0,"details":[{"agent_id":1,"name":"gen","host":"10.0.0.1","status":"online"}]}}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        check(&client, OutputFormat::Json).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cleanup_sends_threshold() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/heartbeat/cleanup")
            .match_query(mockito::Matcher::UrlEncoded(
                "threshold_minutes".into(),
                "15".into(),
            ))
            .with_status(200)
            .with_body(r#"{"success":true,"message":"staleness sweep completed","data":{"marked_offline":2,"threshold_minutes":15}}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        cleanup(&client, Some(15), false, OutputFormat::Table)
            .await
            .unwrap();
        mock.assert_async().await;
    }
}
