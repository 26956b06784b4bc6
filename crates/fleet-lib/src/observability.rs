//! Observability for the fleet orchestrator
//!
//! Provides:
//! - Prometheus metrics (sweep latency, agent counts, execution outcomes)
//! - Event-tagged structured logging with tracing

use crate::models::{AgentId, AgentStatus, ExecutionId, ExecutionStatus};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Buckets for sweep durations (seconds)
const SWEEP_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Buckets for pipeline durations (seconds)
const PIPELINE_BUCKETS: &[f64] = &[10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0];

static GLOBAL_METRICS: OnceLock<FleetMetricsInner> = OnceLock::new();

struct FleetMetricsInner {
    sweep_duration_seconds: Histogram,
    agents_by_status: IntGaugeVec,
    probe_failures: IntCounter,
    stale_agents_marked: IntCounter,
    executions_started: IntCounter,
    executions_finished: IntCounterVec,
    pipeline_duration_seconds: Histogram,
    active_pipelines: IntGauge,
}

impl FleetMetricsInner {
    fn new() -> Self {
        Self {
            sweep_duration_seconds: register_histogram!(
                "fleet_sweep_duration_seconds",
                "Time spent probing every active agent in one liveness sweep",
                SWEEP_BUCKETS.to_vec()
            )
            .expect("Failed to register sweep_duration_seconds"),

            agents_by_status: register_int_gauge_vec!(
                "fleet_agents",
                "Active agents by liveness status after the last sweep",
                &["status"]
            )
            .expect("Failed to register agents"),

            probe_failures: register_int_counter!(
                "fleet_probe_failures_total",
                "Agents found unreachable or failing the heartbeat probe"
            )
            .expect("Failed to register probe_failures"),

            stale_agents_marked: register_int_counter!(
                "fleet_stale_agents_marked_total",
                "Agents forced offline because their heartbeat went stale"
            )
            .expect("Failed to register stale_agents_marked"),

            executions_started: register_int_counter!(
                "fleet_executions_started_total",
                "Executions moved from pending to running"
            )
            .expect("Failed to register executions_started"),

            executions_finished: register_int_counter_vec!(
                "fleet_executions_finished_total",
                "Executions that reached a terminal status",
                &["status"]
            )
            .expect("Failed to register executions_finished"),

            pipeline_duration_seconds: register_histogram!(
                "fleet_pipeline_duration_seconds",
                "Wall time of execution pipelines",
                PIPELINE_BUCKETS.to_vec()
            )
            .expect("Failed to register pipeline_duration_seconds"),

            active_pipelines: register_int_gauge!(
                "fleet_active_pipelines",
                "Execution pipelines currently in flight"
            )
            .expect("Failed to register active_pipelines"),
        }
    }
}

/// Handle to the process-wide fleet metrics. Clones share the same series.
#[derive(Clone)]
pub struct FleetMetrics {
    _private: (),
}

impl Default for FleetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &FleetMetricsInner {
        GLOBAL_METRICS.get_or_init(FleetMetricsInner::new)
    }

    pub fn observe_sweep_duration(&self, duration_secs: f64) {
        self.inner().sweep_duration_seconds.observe(duration_secs);
    }

    pub fn set_agent_counts(&self, online: usize, offline: usize) {
        let gauge = &self.inner().agents_by_status;
        gauge
            .with_label_values(&[AgentStatus::Online.as_str()])
            .set(online as i64);
        gauge
            .with_label_values(&[AgentStatus::Offline.as_str()])
            .set(offline as i64);
    }

    pub fn inc_probe_failures(&self, count: usize) {
        self.inner().probe_failures.inc_by(count as u64);
    }

    pub fn inc_stale_marked(&self, count: usize) {
        self.inner().stale_agents_marked.inc_by(count as u64);
    }

    pub fn inc_executions_started(&self) {
        self.inner().executions_started.inc();
    }

    pub fn inc_executions_finished(&self, status: ExecutionStatus) {
        self.inner()
            .executions_finished
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn observe_pipeline_duration(&self, duration_secs: f64) {
        self.inner().pipeline_duration_seconds.observe(duration_secs);
    }

    pub fn pipeline_started(&self) {
        self.inner().active_pipelines.inc();
    }

    pub fn pipeline_finished(&self) {
        self.inner().active_pipelines.dec();
    }
}

/// Structured logger for fleet events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, api_port: u16) {
        info!(
            event = "service_started",
            instance = %self.instance,
            version = %version,
            api_port = api_port,
            "Fleet orchestrator started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "service_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Fleet orchestrator shutting down"
        );
    }

    pub fn log_sweep(&self, total: usize, successful: usize, failed: usize, duration_ms: u128) {
        info!(
            event = "sweep_completed",
            instance = %self.instance,
            total_checked = total,
            successful = successful,
            failed = failed,
            duration_ms = duration_ms as u64,
            "Liveness sweep completed"
        );
    }

    pub fn log_agent_status_change(
        &self,
        agent_id: AgentId,
        host: &str,
        from: AgentStatus,
        to: AgentStatus,
        reason: Option<&str>,
    ) {
        match to {
            AgentStatus::Offline => warn!(
                event = "agent_status_changed",
                instance = %self.instance,
                agent_id = agent_id,
                host = %host,
                from = %from,
                to = %to,
                reason = reason.unwrap_or(""),
                "Agent went offline"
            ),
            _ => info!(
                event = "agent_status_changed",
                instance = %self.instance,
                agent_id = agent_id,
                host = %host,
                from = %from,
                to = %to,
                "Agent status changed"
            ),
        }
    }

    pub fn log_stale_marked(&self, agent_ids: &[AgentId], threshold_minutes: i64) {
        if agent_ids.is_empty() {
            return;
        }
        warn!(
            event = "stale_agents_marked",
            instance = %self.instance,
            count = agent_ids.len(),
            agent_ids = ?agent_ids,
            threshold_minutes = threshold_minutes,
            "Stale agents forced offline"
        );
    }

    pub fn log_execution_transition(
        &self,
        execution_id: ExecutionId,
        from: ExecutionStatus,
        to: ExecutionStatus,
        detail: Option<&str>,
    ) {
        match to {
            ExecutionStatus::Failed => warn!(
                event = "execution_transition",
                instance = %self.instance,
                execution_id = execution_id,
                from = %from,
                to = %to,
                detail = detail.unwrap_or(""),
                "Execution failed"
            ),
            _ => info!(
                event = "execution_transition",
                instance = %self.instance,
                execution_id = execution_id,
                from = %from,
                to = %to,
                detail = detail.unwrap_or(""),
                "Execution status changed"
            ),
        }
    }
}
