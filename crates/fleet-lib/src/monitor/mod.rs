//! Agent liveness monitoring
//!
//! A liveness sweep probes every active agent (TCP reachability, then a
//! heartbeat command over the control channel, then utilization probes),
//! buffers the observations and commits them in one store call. The
//! staleness sweep forces agents whose heartbeat went quiet offline.

pub mod probes;


use crate::capacity::PlanService;
use crate::channel::{RemoteConnector, RemoteSession, RemoteTarget};
use crate::error::Result;
use crate::models::{
    Agent, AgentId, AgentObservation, AgentStatus, ConnectionFacts, Utilization,
};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::store::{AgentFilter, FleetStore};
use chrono::{DateTime, Utc};
use probes::{
    NetworkProbe, ProbeChain, Reachability, UtilizationProbe, CPU_CORES_COMMAND,
    HEARTBEAT_COMMAND, HEARTBEAT_REPLY, LOCUST_VERSION_COMMAND, MEMORY_MB_COMMAND,
    PYTHON_VERSION_COMMAND,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Monitor timeouts and limits
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub reachability_timeout: Duration,
    pub probe_connect_timeout: Duration,
    pub manual_check_timeout: Duration,
    pub probe_concurrency: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reachability_timeout: Duration::from_secs(3),
            probe_connect_timeout: Duration::from_secs(5),
            manual_check_timeout: Duration::from_secs(10),
            probe_concurrency: 8,
        }
    }
}

/// Outcome of probing one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentCheck {
    pub agent_id: AgentId,
    pub name: String,
    pub host: String,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization: Option<Utilization>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub total_checked: usize,
    pub successful: usize,
    pub failed: usize,
    pub details: Vec<AgentCheck>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaleAgent {
    pub id: AgentId,
    pub name: String,
    pub host: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl From<&Agent> for StaleAgent {
    fn from(agent: &Agent) -> Self {
        Self {
            id: agent.id,
            name: agent.name.clone(),
            host: agent.host.clone(),
            last_heartbeat: agent.last_heartbeat,
        }
    }
}

/// Fleet-wide liveness overview
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
    pub maintenance: usize,
    pub stale: Vec<StaleAgent>,
    pub checked_at: DateTime<Utc>,
}

/// Hardware and tooling found by a manual connectivity test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareInfo {
    pub python_version: String,
    pub locust_version: String,
    pub cpu_cores: u32,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info: Option<HardwareInfo>,
}

/// Everything a per-agent probe task needs, shared across the sweep
struct Prober {
    connector: Arc<dyn RemoteConnector>,
    reachability: Arc<dyn Reachability>,
    cpu: ProbeChain,
    memory: ProbeChain,
    config: MonitorConfig,
}

impl Prober {
    async fn check(&self, agent: &Agent) -> (AgentCheck, AgentObservation) {
        match self.probe(agent).await {
            Ok(utilization) => (
                AgentCheck {
                    agent_id: agent.id,
                    name: agent.name.clone(),
                    host: agent.host.clone(),
                    status: AgentStatus::Online,
                    message: None,
                    utilization: Some(utilization),
                },
                AgentObservation::online(agent.id, utilization),
            ),
            Err(message) => {
                debug!(agent_id = agent.id, host = %agent.host, reason = %message, "Agent probe failed");
                (
                    AgentCheck {
                        agent_id: agent.id,
                        name: agent.name.clone(),
                        host: agent.host.clone(),
                        status: AgentStatus::Offline,
                        message: Some(message),
                        utilization: None,
                    },
                    AgentObservation::offline(agent.id),
                )
            }
        }
    }

    async fn probe(&self, agent: &Agent) -> std::result::Result<Utilization, String> {
        if !self
            .reachability
            .is_reachable(&agent.host, agent.port, self.config.reachability_timeout)
            .await
        {
            return Err(format!("{}:{} is not reachable", agent.host, agent.port));
        }

        let target =
            RemoteTarget::for_agent(agent).ok_or_else(|| "no credentials configured".to_string())?;

        let session = self
            .connector
            .connect(&target, self.config.probe_connect_timeout)
            .await
            .map_err(|e| e.to_string())?;

        let result = self.heartbeat_and_measure(agent, &*session).await;

        if let Err(e) = session.close().await {
            debug!(agent_id = agent.id, error = %e, "Error closing probe session");
        }
        result
    }

    async fn heartbeat_and_measure(
        &self,
        agent: &Agent,
        session: &dyn RemoteSession,
    ) -> std::result::Result<Utilization, String> {
        let reply = session
            .run(HEARTBEAT_COMMAND)
            .await
            .map_err(|e| e.to_string())?;
        if reply.stdout.trim() != HEARTBEAT_REPLY {
            return Err(format!("unexpected heartbeat reply: {:?}", reply.stdout.trim()));
        }

        let cpu_percent = match self.cpu.measure(session).await {
            Some((probe, value)) => {
                debug!(agent_id = agent.id, probe, value, "CPU utilization measured");
                value
            }
            None => {
                warn!(agent_id = agent.id, host = %agent.host, "All CPU probes failed, recording 0");
                0.0
            }
        };

        let memory_percent = match self.memory.measure(session).await {
            Some((_, value)) => value,
            None => {
                warn!(agent_id = agent.id, host = %agent.host, "Memory probe failed, recording 0");
                0.0
            }
        };

        let network_percent = NetworkProbe::new(agent.capacity.network_mbps)
            .measure(session)
            .await
            .unwrap_or(0.0);

        Ok(Utilization {
            cpu_percent,
            memory_percent,
            network_percent,
        })
    }
}

/// Maintains agent liveness state
pub struct HealthMonitor {
    store: Arc<dyn FleetStore>,
    plans: PlanService,
    prober: Arc<Prober>,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn FleetStore>,
        connector: Arc<dyn RemoteConnector>,
        reachability: Arc<dyn Reachability>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            plans: PlanService::new(store.clone()),
            store,
            prober: Arc::new(Prober {
                connector,
                reachability,
                cpu: ProbeChain::cpu(),
                memory: ProbeChain::memory(),
                config,
            }),
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("health-monitor"),
        }
    }

    /// Probe every active agent and commit the observations together
    pub async fn sweep(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let agents = self.store.list_agents(&AgentFilter::active()).await?;

        let semaphore = Arc::new(Semaphore::new(self.prober.config.probe_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for agent in agents {
            let prober = self.prober.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let (check, observation) = prober.check(&agent).await;
                (agent.status, check, observation)
            });
        }

        let mut report = SweepReport::default();
        let mut observations = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            let (previous, check, observation) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Agent probe task aborted");
                    report.total_checked += 1;
                    report.failed += 1;
                    continue;
                }
            };

            report.total_checked += 1;
            if check.status == AgentStatus::Online {
                report.successful += 1;
            } else {
                report.failed += 1;
            }

            if previous != check.status {
                self.logger.log_agent_status_change(
                    check.agent_id,
                    &check.host,
                    previous,
                    check.status,
                    check.message.as_deref(),
                );
            }

            observations.push(observation);
            report.details.push(check);
        }

        report.details.sort_by_key(|c| c.agent_id);
        self.store.apply_observations(observations).await?;

        let elapsed = started.elapsed();
        self.metrics.observe_sweep_duration(elapsed.as_secs_f64());
        self.metrics.set_agent_counts(report.successful, report.failed);
        self.metrics.inc_probe_failures(report.failed);
        self.logger.log_sweep(
            report.total_checked,
            report.successful,
            report.failed,
            elapsed.as_millis(),
        );

        Ok(report)
    }

    /// Force online agents with a heartbeat older than `threshold` offline.
    /// Returns how many agents changed.
    pub async fn mark_stale_offline(&self, threshold: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - threshold;
        let changed = self.store.mark_offline_before(cutoff).await?;

        self.metrics.inc_stale_marked(changed.len());
        self.logger
            .log_stale_marked(&changed, threshold.num_minutes());

        Ok(changed.len())
    }

    /// Active online agents whose heartbeat is older than `threshold`
    pub async fn stale_agents(&self, threshold: chrono::Duration) -> Result<Vec<Agent>> {
        let now = Utc::now();
        let filter = AgentFilter {
            status: Some(AgentStatus::Online),
            ..Default::default()
        };
        Ok(self
            .store
            .list_agents(&filter)
            .await?
            .into_iter()
            .filter(|agent| agent.is_stale(now, threshold))
            .collect())
    }

    /// Counts by status plus the agents that are stale within `stale_window`
    pub async fn fleet_status(&self, stale_window: chrono::Duration) -> Result<FleetStatus> {
        let now = Utc::now();
        let agents = self.store.list_agents(&AgentFilter::active()).await?;

        let count = |status: AgentStatus| agents.iter().filter(|a| a.status == status).count();
        let stale = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Online && a.is_stale(now, stale_window))
            .map(StaleAgent::from)
            .collect();

        Ok(FleetStatus {
            total: agents.len(),
            online: count(AgentStatus::Online),
            offline: count(AgentStatus::Offline),
            maintenance: count(AgentStatus::Maintenance),
            stale,
            checked_at: now,
        })
    }

    /// Manual connectivity test. Records tooling versions, overwrites the
    /// declared CPU and memory with what the host reports and re-validates
    /// the agent's plans. A failed test marks the agent offline.
    pub async fn test_connection(&self, agent_id: AgentId) -> Result<ConnectionReport> {
        let agent = self.store.get_agent(agent_id).await?;
        let budget = self.prober.config.manual_check_timeout;

        let outcome = match tokio::time::timeout(budget, self.probe_hardware(&agent)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("timed out after {}s", budget.as_secs())),
        };

        let previous = agent.status;

        let report = match outcome {
            Ok(info) => {
                let facts = ConnectionFacts {
                    python_version: info.python_version.clone(),
                    locust_version: info.locust_version.clone(),
                    cpu_cores: info.cpu_cores,
                    memory_gb: info.memory_gb,
                    system_info: serde_json::to_value(&info).ok(),
                    checked_at: Utc::now(),
                };
                self.store.record_connection_test(agent_id, Some(facts)).await?;
                self.plans.revalidate_agent(agent_id).await?;

                info!(agent_id, cpu_cores = info.cpu_cores, memory_gb = info.memory_gb, "Connection test succeeded");
                ConnectionReport {
                    success: true,
                    message: "connection succeeded".to_string(),
                    system_info: Some(info),
                }
            }
            Err(message) => {
                self.store.record_connection_test(agent_id, None).await?;

                warn!(agent_id, reason = %message, "Connection test failed");
                ConnectionReport {
                    success: false,
                    message: format!("connection failed: {}", message),
                    system_info: None,
                }
            }
        };

        let now_status = if report.success {
            AgentStatus::Online
        } else {
            AgentStatus::Offline
        };
        if previous != now_status {
            self.logger.log_agent_status_change(
                agent_id,
                &agent.host,
                previous,
                now_status,
                (!report.success).then_some(report.message.as_str()),
            );
        }

        Ok(report)
    }

    async fn probe_hardware(&self, agent: &Agent) -> std::result::Result<HardwareInfo, String> {
        let target =
            RemoteTarget::for_agent(agent).ok_or_else(|| "no credentials configured".to_string())?;
        let session = self
            .prober
            .connector
            .connect(&target, self.prober.config.manual_check_timeout)
            .await
            .map_err(|e| e.to_string())?;

        let result = read_hardware(&*session).await;

        if let Err(e) = session.close().await {
            debug!(agent_id = agent.id, error = %e, "Error closing session");
        }
        result
    }
}

async fn read_hardware(session: &dyn RemoteSession) -> std::result::Result<HardwareInfo, String> {
    let run = |command: &'static str| async move {
        session.run(command).await.map_err(|e| e.to_string())
    };

    // Older interpreters print the version on stderr
    let python = run(PYTHON_VERSION_COMMAND).await?;
    let python_version = if python.stdout.trim().is_empty() {
        python.stderr.trim().to_string()
    } else {
        python.stdout.trim().to_string()
    };

    let locust_version = run(LOCUST_VERSION_COMMAND).await?.stdout.trim().to_string();

    let cpu_cores = run(CPU_CORES_COMMAND)
        .await?
        .stdout
        .trim()
        .parse::<u32>()
        .map_err(|_| "could not read CPU core count".to_string())?;

    let memory_mb = run(MEMORY_MB_COMMAND)
        .await?
        .stdout
        .trim()
        .parse::<f64>()
        .map_err(|_| "could not read total memory".to_string())?;

    Ok(HardwareInfo {
        python_version,
        locust_version,
        cpu_cores,
        memory_gb: (memory_mb / 1024.0 * 100.0).round() / 100.0,
    })
}
