//! Core data models for the load fleet
//!
//! Entities reference each other by opaque ids only. Lookups go through
//! the [`FleetStore`](crate::store::FleetStore).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub type AgentId = u64;
pub type PlanId = u64;
pub type ExecutionId = u64;
pub type TaskId = u64;
pub type ScriptId = u64;
pub type StrategyId = u64;
pub type ScenarioId = u64;
pub type FileId = u64;

/// Liveness status of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
    Maintenance,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hardware an agent declares (or a connectivity test probed)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Capacity {
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub network_mbps: u32,
    pub disk_gb: f64,
}

/// Last observed resource utilization, in percent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Utilization {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub network_percent: f64,
}

/// Authentication material for the remote control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    PrivateKey(PathBuf),
}

/// A remote load-generation machine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
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

impl Agent {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        capacity: Capacity,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            host: host.into(),
            port: 22,
            username: username.into(),
            password: None,
            ssh_key_path: None,
            capacity,
            status: AgentStatus::Offline,
            last_heartbeat: None,
            utilization: Utilization::default(),
            locust_version: None,
            python_version: None,
            system_info: None,
            description: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credentials to open a channel with. A key path wins over a password.
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(path) = &self.ssh_key_path {
            return Some(Credentials::PrivateKey(path.clone()));
        }
        self.password.clone().map(Credentials::Password)
    }

    /// Whether the heartbeat is older than `threshold` (or was never recorded)
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match self.last_heartbeat {
            Some(at) => now.signed_duration_since(at) > threshold,
            None => true,
        }
    }
}

/// What a successful manual connection test learned about a host
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionFacts {
    pub python_version: String,
    pub locust_version: String,
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub system_info: Option<serde_json::Value>,
    pub checked_at: DateTime<Utc>,
}

/// Result of probing one agent, buffered until a sweep commits
#[derive(Debug, Clone, PartialEq)]
pub struct AgentObservation {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    /// Only set for successful probes
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub utilization: Option<Utilization>,
    pub observed_at: DateTime<Utc>,
}

impl AgentObservation {
    pub fn online(agent_id: AgentId, utilization: Utilization) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            status: AgentStatus::Online,
            heartbeat_at: Some(now),
            utilization: Some(utilization),
            observed_at: now,
        }
    }

    pub fn offline(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            status: AgentStatus::Offline,
            heartbeat_at: None,
            utilization: None,
            observed_at: Utc::now(),
        }
    }
}

/// Resources requested by one unit of an allocation plan
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub network_mbps: u32,
}

impl ResourceRequest {
    pub const fn new(cpu_cores: u32, memory_gb: f64, network_mbps: u32) -> Self {
        Self {
            cpu_cores,
            memory_gb,
            network_mbps,
        }
    }
}

/// Resource partitioning proposal for running a test on one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub id: PlanId,
    pub agent_id: AgentId,
    pub name: String,
    pub master_enabled: bool,
    pub master: ResourceRequest,
    pub worker_count: u32,
    pub worker: ResourceRequest,
    pub reserved: ResourceRequest,
    pub is_valid: bool,
    pub validation_message: Option<String>,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AllocationPlan {
    pub fn new(agent_id: AgentId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            agent_id,
            name: name.into(),
            master_enabled: true,
            master: ResourceRequest::new(1, 2.0, 100),
            worker_count: 1,
            worker: ResourceRequest::new(1, 2.0, 100),
            reserved: ResourceRequest::new(1, 1.0, 50),
            is_valid: false,
            validation_message: None,
            description: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle of an execution. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {}", other)),
        }
    }
}

/// Canonical metrics of a finished run. Latencies are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResultMetrics {
    pub total_requests: u64,
    pub total_failures: u64,
    pub avg_response_time: f64,
    pub max_response_time: f64,
    pub min_response_time: f64,
    pub median_response_time: f64,
    pub p95_response_time: f64,
    pub p99_response_time: f64,
    pub requests_per_second: f64,
    pub failures_per_second: f64,
    pub error_rate: f64,
}

/// One concrete run of a task under a strategy on an agent and plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub name: Option<String>,
    pub task_id: TaskId,
    pub strategy_id: StrategyId,
    pub agent_id: AgentId,
    pub plan_id: PlanId,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub metrics: ResultMetrics,
    pub error_message: Option<String>,
}

impl Execution {
    pub fn new(
        task_id: TaskId,
        strategy_id: StrategyId,
        agent_id: AgentId,
        plan_id: PlanId,
    ) -> Self {
        Self {
            id: 0,
            name: None,
            task_id,
            strategy_id,
            agent_id,
            plan_id,
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_secs: None,
            metrics: ResultMetrics::default(),
            error_message: None,
        }
    }

    /// Apply a transition, stamping timestamps and the derived duration.
    /// The caller is responsible for checking the guard first.
    pub fn apply(&mut self, transition: &ExecutionTransition) {
        self.status = transition.to;
        match transition.to {
            ExecutionStatus::Running => {
                self.started_at = Some(transition.at);
            }
            status if status.is_terminal() => {
                self.completed_at = Some(transition.at);
                self.duration_secs = self
                    .started_at
                    .map(|started| (transition.at - started).num_seconds().max(0));
            }
            _ => {}
        }
        if let Some(metrics) = transition.metrics {
            self.metrics = metrics;
        }
        if let Some(message) = &transition.error_message {
            self.error_message = Some(message.clone());
        }
    }
}

/// A requested status change, applied atomically by the store
#[derive(Debug, Clone)]
pub struct ExecutionTransition {
    pub to: ExecutionStatus,
    pub at: DateTime<Utc>,
    pub metrics: Option<ResultMetrics>,
    pub error_message: Option<String>,
}

impl ExecutionTransition {
    pub fn to(status: ExecutionStatus) -> Self {
        Self {
            to: status,
            at: Utc::now(),
            metrics: None,
            error_message: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ResultMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioType {
    #[default]
    Single,
    Multi,
}

/// Lightweight test definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTask {
    pub id: TaskId,
    pub name: String,
    pub description: Option<String>,
    pub scenario_type: ScenarioType,
    pub target_host: Option<String>,
    pub script_id: Option<ScriptId>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl TestTask {
    pub fn new(name: impl Into<String>, target_host: Option<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: None,
            scenario_type: ScenarioType::Single,
            target_host,
            script_id: None,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// A stored load script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestScript {
    pub id: ScriptId,
    pub name: String,
    pub description: Option<String>,
    pub content: String,
    pub script_type: String,
    pub target_host: Option<String>,
    pub wait_time_min: f64,
    pub wait_time_max: f64,
    pub version: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl TestScript {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: None,
            content: content.into(),
            script_type: "locust".to_string(),
            target_host: None,
            wait_time_min: 1.0,
            wait_time_max: 2.0,
            version: "1.0.0".to_string(),
            active: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    #[default]
    Linear,
    Step,
    Adaptive,
}

/// How hard and how long to drive the target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStrategy {
    pub id: StrategyId,
    pub name: String,
    pub description: Option<String>,
    pub strategy_type: StrategyType,
    pub user_count: u32,
    pub spawn_rate: u32,
    pub run_time_secs: u64,
    pub ramp_up_secs: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl RunStrategy {
    pub fn new(name: impl Into<String>, user_count: u32, spawn_rate: u32, run_time_secs: u64) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: None,
            strategy_type: StrategyType::Linear,
            user_count,
            spawn_rate,
            run_time_secs,
            ramp_up_secs: 10,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// One interface of a multi-interface scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceScenario {
    pub id: ScenarioId,
    pub task_id: TaskId,
    pub interface_name: String,
    pub interface_url: String,
    pub method: String,
    pub weight: u32,
    pub order: u32,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout_secs: u64,
}

impl InterfaceScenario {
    pub fn new(
        task_id: TaskId,
        interface_name: impl Into<String>,
        interface_url: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            task_id,
            interface_name: interface_name.into(),
            interface_url: interface_url.into(),
            method: method.into(),
            weight: 1,
            order: 1,
            headers: BTreeMap::new(),
            body: None,
            timeout_secs: 30,
        }
    }
}

/// Metadata of an uploaded scenario asset; bytes live in the object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub id: FileId,
    pub scenario_id: ScenarioId,
    pub file_name: String,
    pub object_key: String,
    pub file_size: u64,
    pub content_type: String,
    /// Hex-encoded SHA-256 of the stored bytes
    pub content_hash: String,
    /// Inline copy for small UTF-8 files
    pub content: Option<String>,
    pub description: Option<String>,
    pub is_script: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_is_monotonic() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));

        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_apply_stamps_duration() {
        let mut execution = Execution::new(1, 1, 1, 1);
        let start = ExecutionTransition::to(ExecutionStatus::Running);
        let started_at = start.at;
        execution.apply(&start);
        assert_eq!(execution.started_at, Some(started_at));

        let mut done = ExecutionTransition::to(ExecutionStatus::Failed).with_error("boom");
        done.at = started_at + chrono::Duration::seconds(42);
        execution.apply(&done);

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.duration_secs, Some(42));
        assert_eq!(execution.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_cancel_from_pending_has_no_duration() {
        let mut execution = Execution::new(1, 1, 1, 1);
        execution.apply(&ExecutionTransition::to(ExecutionStatus::Cancelled));
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.duration_secs, None);
    }

    #[test]
    fn test_agent_credentials_prefer_key() {
        let mut agent = Agent::new("a", "10.0.0.1", "root", Capacity::default());
        assert_eq!(agent.credentials(), None);

        agent.password = Some("secret".into());
        assert_eq!(agent.credentials(), Some(Credentials::Password("secret".into())));

        agent.ssh_key_path = Some(PathBuf::from("/keys/id_ed25519"));
        assert!(matches!(agent.credentials(), Some(Credentials::PrivateKey(_))));
    }

    #[test]
    fn test_agent_staleness() {
        let now = Utc::now();
        let mut agent = Agent::new("a", "10.0.0.1", "root", Capacity::default());
        assert!(agent.is_stale(now, chrono::Duration::minutes(30)));

        agent.last_heartbeat = Some(now - chrono::Duration::minutes(31));
        assert!(agent.is_stale(now, chrono::Duration::minutes(30)));

        agent.last_heartbeat = Some(now - chrono::Duration::minutes(5));
        assert!(!agent.is_stale(now, chrono::Duration::minutes(30)));
    }
}
