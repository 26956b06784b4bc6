//! Periodic sweep scheduling
//!
//! Two independent loops drive the [`HealthMonitor`]: the liveness sweep and
//! the staleness sweep. A kind never overlaps itself: a tick that finds the
//! previous run still in flight is skipped, while manual triggers queue
//! behind it. A failed scheduled run is retried with capped exponential
//! backoff.

mod tasks;

pub use tasks::{TaskRecord, TaskRegistry, TaskState};

use crate::error::Result;
use crate::health::{components, HealthRegistry};
use crate::monitor::{HealthMonitor, SweepReport};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    Liveness,
    Staleness,
}

impl SweepKind {
    fn component(&self) -> &'static str {
        match self {
            SweepKind::Liveness => components::LIVENESS_SWEEP,
            SweepKind::Staleness => components::STALENESS_SWEEP,
        }
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepKind::Liveness => f.write_str("liveness"),
            SweepKind::Staleness => f.write_str("staleness"),
        }
    }
}

/// Capped exponential backoff for a failed sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn liveness() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(600),
        }
    }

    pub fn staleness() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_secs(300),
            max_backoff: Duration::from_secs(1200),
        }
    }

    /// Delay before retry number `retry` (zero based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub liveness_interval: Duration,
    pub staleness_interval: Duration,
    pub stale_threshold: chrono::Duration,
    pub liveness_retry: RetryPolicy,
    pub staleness_retry: RetryPolicy,
    /// How long finished async trigger records stay queryable
    pub task_retention: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(120),
            staleness_interval: Duration::from_secs(600),
            stale_threshold: chrono::Duration::minutes(30),
            liveness_retry: RetryPolicy::liveness(),
            staleness_retry: RetryPolicy::staleness(),
            task_retention: chrono::Duration::hours(1),
        }
    }
}

/// Result of one sweep run
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SweepOutcome {
    Liveness(SweepReport),
    Staleness {
        marked_offline: usize,
        threshold_minutes: i64,
    },
}

#[derive(Clone)]
pub struct SweepScheduler {
    monitor: Arc<HealthMonitor>,
    health: HealthRegistry,
    config: SchedulerConfig,
    liveness_lock: Arc<Mutex<()>>,
    staleness_lock: Arc<Mutex<()>>,
    tasks: TaskRegistry,
}

impl SweepScheduler {
    pub fn new(monitor: Arc<HealthMonitor>, health: HealthRegistry, config: SchedulerConfig) -> Self {
        Self {
            monitor,
            health,
            tasks: TaskRegistry::new(config.task_retention),
            config,
            liveness_lock: Arc::new(Mutex::new(())),
            staleness_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lock_for(&self, kind: SweepKind) -> &Arc<Mutex<()>> {
        match kind {
            SweepKind::Liveness => &self.liveness_lock,
            SweepKind::Staleness => &self.staleness_lock,
        }
    }

    fn retry_for(&self, kind: SweepKind) -> RetryPolicy {
        match kind {
            SweepKind::Liveness => self.config.liveness_retry,
            SweepKind::Staleness => self.config.staleness_retry,
        }
    }

    /// Run both loops until `shutdown` fires
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) {
        info!(
            liveness_interval_secs = self.config.liveness_interval.as_secs(),
            staleness_interval_secs = self.config.staleness_interval.as_secs(),
            stale_threshold_minutes = self.config.stale_threshold.num_minutes(),
            "Starting sweep scheduler"
        );

        tokio::join!(
            self.run_loop(
                SweepKind::Liveness,
                self.config.liveness_interval,
                shutdown.resubscribe()
            ),
            self.run_loop(SweepKind::Staleness, self.config.staleness_interval, shutdown),
        );

        info!("Sweep scheduler stopped");
    }

    async fn run_loop(
        &self,
        kind: SweepKind,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Ok(_guard) = self.lock_for(kind).clone().try_lock_owned() else {
                        debug!(kind = %kind, "Previous sweep still running, skipping tick");
                        continue;
                    };
                    if !self.run_with_retry(kind, &mut shutdown).await {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        info!(kind = %kind, "Shutting down sweep loop");
    }

    /// Returns `false` when shutdown arrived during a backoff
    async fn run_with_retry(&self, kind: SweepKind, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let policy = self.retry_for(kind);
        let mut retry = 0;

        loop {
            match self.execute(kind, None).await {
                Ok(_) => return true,
                Err(e) if retry < policy.max_retries => {
                    let delay = policy.backoff(retry);
                    retry += 1;
                    warn!(
                        kind = %kind,
                        error = %e,
                        retry,
                        max_retries = policy.max_retries,
                        backoff_secs = delay.as_secs(),
                        "Sweep failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => return false,
                    }
                }
                Err(e) => {
                    error!(kind = %kind, error = %e, "Sweep failed, retries exhausted");
                    return true;
                }
            }
        }
    }

    /// One run of `kind`, reported to the health registry. `threshold`
    /// overrides the configured staleness threshold.
    async fn execute(
        &self,
        kind: SweepKind,
        threshold: Option<chrono::Duration>,
    ) -> Result<SweepOutcome> {
        let started = Instant::now();
        let outcome = match kind {
            SweepKind::Liveness => self.monitor.sweep().await.map(SweepOutcome::Liveness),
            SweepKind::Staleness => {
                let threshold = threshold.unwrap_or(self.config.stale_threshold);
                self.monitor
                    .mark_stale_offline(threshold)
                    .await
                    .map(|marked_offline| SweepOutcome::Staleness {
                        marked_offline,
                        threshold_minutes: threshold.num_minutes(),
                    })
            }
        };

        match &outcome {
            Ok(_) => {
                self.health.record_success(kind.component()).await;
                debug!(kind = %kind, elapsed_ms = started.elapsed().as_millis(), "Sweep finished");
            }
            Err(e) => {
                self.health
                    .record_failure(kind.component(), e.to_string())
                    .await;
            }
        }
        outcome
    }

    /// Manual synchronous trigger. Waits for an in-flight run of the same
    /// kind, then runs once without retries.
    pub async fn run_now(
        &self,
        kind: SweepKind,
        threshold: Option<chrono::Duration>,
    ) -> Result<SweepOutcome> {
        let _guard = self.lock_for(kind).lock().await;
        self.execute(kind, threshold).await
    }

    /// Manual asynchronous trigger. The returned id resolves through
    /// [`task_status`](Self::task_status).
    pub fn trigger(&self, kind: SweepKind, threshold: Option<chrono::Duration>) -> Uuid {
        let task_id = self.tasks.register(kind);
        let scheduler = self.clone();

        tokio::spawn(async move {
            let _guard = scheduler.lock_for(kind).lock().await;
            scheduler.tasks.mark_running(task_id);

            let outcome = scheduler
                .execute(kind, threshold)
                .await
                .map_err(|e| e.to_string())
                .and_then(|outcome| serde_json::to_value(outcome).map_err(|e| e.to_string()));
            scheduler.tasks.complete(task_id, outcome);
        });

        info!(kind = %kind, task_id = %task_id, "Sweep queued");
        task_id
    }

    pub fn task_status(&self, task_id: &Uuid) -> Option<TaskRecord> {
        self.tasks.get(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::scripted::{HostScript, ScriptedConnector};
    use crate::health::ComponentStatus;
    use crate::models::{Agent, AgentStatus, Capacity};
    use crate::monitor::probes::StaticReachability;
    use crate::monitor::MonitorConfig;
    use crate::store::{FleetStore, MemoryStore};
    use chrono::Utc;

    async fn setup(config: SchedulerConfig) -> (Arc<dyn FleetStore>, SweepScheduler, HealthRegistry) {
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let connector = ScriptedConnector::new().with_host("10.0.0.1", HostScript::healthy());

        let mut agent = Agent::new("gen", "10.0.0.1", "locust", Capacity::default());
        agent.password = Some("pw".into());
        store.insert_agent(agent).await.unwrap();

        let mut quiet = Agent::new("quiet", "10.0.0.9", "locust", Capacity::default());
        quiet.status = AgentStatus::Online;
        quiet.last_heartbeat = Some(Utc::now() - chrono::Duration::hours(2));
        store.insert_agent(quiet).await.unwrap();

        let monitor = Arc::new(HealthMonitor::new(
            store.clone(),
            Arc::new(connector),
            Arc::new(StaticReachability::new()),
            MonitorConfig::default(),
        ));
        let health = HealthRegistry::new();
        health.register_all().await;
        let scheduler = SweepScheduler::new(monitor, health.clone(), config);
        (store, scheduler, health)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::liveness();
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(2), Duration::from_secs(240));
        assert_eq!(policy.backoff(10), Duration::from_secs(600));

        let policy = RetryPolicy::staleness();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff(0), Duration::from_secs(300));
        assert_eq!(policy.backoff(1), Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_reports_and_records_health() {
        let (store, scheduler, health) = setup(SchedulerConfig::default()).await;

        let outcome = scheduler.run_now(SweepKind::Liveness, None).await.unwrap();
        let SweepOutcome::Liveness(report) = outcome else {
            panic!("expected a liveness report");
        };
        assert_eq!(report.total_checked, 2);
        assert_eq!(report.successful, 1);

        let agents = store.list_agents(&Default::default()).await.unwrap();
        assert_eq!(agents[0].status, AgentStatus::Online);
        assert_eq!(agents[1].status, AgentStatus::Offline);

        let health = health.health().await;
        assert_eq!(
            health.components[components::LIVENESS_SWEEP].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_run_now() {
        let (store, scheduler, _) = setup(SchedulerConfig::default()).await;

        let outcome = scheduler
            .run_now(SweepKind::Staleness, Some(chrono::Duration::hours(3)))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SweepOutcome::Staleness {
                marked_offline: 0,
                threshold_minutes: 180
            }
        ));

        let outcome = scheduler.run_now(SweepKind::Staleness, None).await.unwrap();
        assert!(matches!(
            outcome,
            SweepOutcome::Staleness {
                marked_offline: 1,
                threshold_minutes: 30
            }
        ));
        let quiet = store.get_agent(2).await.unwrap();
        assert_eq!(quiet.status, AgentStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_trigger_resolves_to_result() {
        let (_, scheduler, _) = setup(SchedulerConfig::default()).await;

        let task_id = scheduler.trigger(SweepKind::Liveness, None);
        assert!(scheduler.task_status(&task_id).is_some());

        let mut record = scheduler.task_status(&task_id).unwrap();
        for _ in 0..100 {
            if record.status.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            record = scheduler.task_status(&task_id).unwrap();
        }

        assert_eq!(record.status, TaskState::Succeeded);
        assert_eq!(record.kind, SweepKind::Liveness);
        assert_eq!(record.result.unwrap()["total_checked"], 2);
        assert!(scheduler.task_status(&Uuid::new_v4()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loops_run_on_cadence_until_shutdown() {
        let config = SchedulerConfig {
            liveness_interval: Duration::from_secs(10),
            staleness_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let (store, scheduler, _) = setup(config).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(15)).await;
        let agent = store.get_agent(1).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert!(agent.last_heartbeat.is_some());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
