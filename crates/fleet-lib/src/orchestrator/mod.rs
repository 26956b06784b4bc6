//! Execution orchestration
//!
//! `start` validates an execution and moves it `pending → running` with a
//! compare-and-set in the store, then hands the pipeline to a supervised
//! worker and returns. The worker always leaves the record in a terminal
//! state, including when the pipeline task panics.

mod pipeline;
pub mod script;


pub use pipeline::{launch_command, RemoteLayout};

use crate::channel::RemoteConnector;
use crate::error::{FleetError, Result};
use crate::models::{
    Execution, ExecutionId, ExecutionStatus, ExecutionTransition, ResultMetrics,
};
use crate::observability::{FleetMetrics, StructuredLogger};
use crate::store::{ExecutionFilter, FleetStore};
use dashmap::DashMap;
use pipeline::{PipelineContext, PipelineOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Remote layout, timeouts and pool size
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub remote_dir: String,
    pub deploy_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Extra wait past the declared run time
    pub run_grace: Duration,
    /// Pause after launching before the run clock starts
    pub launch_settle: Duration,
    pub max_concurrent_pipelines: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            remote_dir: "/tmp".to_string(),
            deploy_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
            run_grace: Duration::from_secs(5),
            launch_settle: Duration::from_secs(2),
            max_concurrent_pipelines: 16,
        }
    }
}

pub struct Orchestrator {
    ctx: Arc<PipelineContext>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    tokens: Arc<DashMap<ExecutionId, CancellationToken>>,
    shutdown: CancellationToken,
    metrics: FleetMetrics,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn FleetStore>,
        connector: Arc<dyn RemoteConnector>,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_pipelines.max(1)));
        Self {
            ctx: Arc::new(PipelineContext {
                store,
                connector,
                config,
            }),
            tracker: TaskTracker::new(),
            permits,
            tokens: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            metrics: FleetMetrics::new(),
            logger: StructuredLogger::new("orchestrator"),
        }
    }

    fn store(&self) -> &Arc<dyn FleetStore> {
        &self.ctx.store
    }

    /// Persist a new pending execution after checking its references
    pub async fn create(&self, execution: Execution) -> Result<Execution> {
        let task = self.store().get_task(execution.task_id).await?;
        let strategy = self.store().get_strategy(execution.strategy_id).await?;
        let agent = self.store().get_agent(execution.agent_id).await?;
        let plan = self.store().get_plan(execution.plan_id).await?;
        require_active("task", task.id, task.active)?;
        require_active("strategy", strategy.id, strategy.active)?;
        require_active("agent", agent.id, agent.active)?;
        require_active("plan", plan.id, plan.active)?;

        let execution = Execution {
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_secs: None,
            metrics: ResultMetrics::default(),
            error_message: None,
            ..execution
        };
        self.store().insert_execution(execution).await
    }

    /// Validate and start a pending execution. Returns once the record is
    /// `running`; the pipeline continues in the background.
    pub async fn start(&self, execution_id: ExecutionId) -> Result<Execution> {
        let execution = self.store().get_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Pending {
            return Err(FleetError::Guard(format!(
                "execution {} is {}; only pending executions can be started",
                execution_id, execution.status
            )));
        }

        let task = self.store().get_task(execution.task_id).await?;
        let strategy = self.store().get_strategy(execution.strategy_id).await?;
        let agent = self.store().get_agent(execution.agent_id).await?;
        let plan = self.store().get_plan(execution.plan_id).await?;
        require_active("task", task.id, task.active)?;
        require_active("strategy", strategy.id, strategy.active)?;
        require_active("agent", agent.id, agent.active)?;
        require_active("plan", plan.id, plan.active)?;

        if plan.agent_id != agent.id {
            return Err(FleetError::Validation(format!(
                "plan {} belongs to agent {}, not agent {}",
                plan.id, plan.agent_id, agent.id
            )));
        }
        if !plan.is_valid {
            return Err(FleetError::Validation(format!(
                "plan {} is not valid: {}",
                plan.id,
                plan.validation_message.as_deref().unwrap_or("not validated")
            )));
        }
        if agent.status != crate::models::AgentStatus::Online {
            return Err(FleetError::AgentUnavailable {
                agent_id: agent.id,
                status: agent.status,
            });
        }
        if self.tracker.is_closed() {
            return Err(FleetError::Guard("orchestrator is shutting down".to_string()));
        }

        let running = self
            .store()
            .transition_execution(execution_id, ExecutionTransition::to(ExecutionStatus::Running))
            .await?;

        // Only the caller that won the CAS owns the token
        let token = self.shutdown.child_token();
        self.tokens.insert(execution_id, token.clone());

        // A stop that landed between the CAS and the insert found no token
        let current = match self.store().get_execution(execution_id).await {
            Ok(current) => current,
            Err(e) => {
                self.tokens.remove(&execution_id);
                return Err(e);
            }
        };
        if current.status != ExecutionStatus::Running {
            self.tokens.remove(&execution_id);
            token.cancel();
            return Ok(current);
        }

        self.metrics.inc_executions_started();
        self.logger.log_execution_transition(
            execution_id,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            None,
        );

        self.spawn_pipeline(execution_id, token);
        Ok(running)
    }

    fn spawn_pipeline(&self, execution_id: ExecutionId, token: CancellationToken) {
        let ctx = self.ctx.clone();
        let permits = self.permits.clone();
        let tokens = self.tokens.clone();
        let metrics = self.metrics.clone();
        let logger = self.logger.clone();

        self.tracker.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            metrics.pipeline_started();
            let started = Instant::now();

            // Inner task so a panic surfaces as a JoinError instead of
            // taking the supervisor down with it
            let worker = tokio::spawn({
                let ctx = ctx.clone();
                let token = token.clone();
                async move { ctx.run(execution_id, token).await }
            });
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FleetError::Internal(format!("pipeline worker aborted: {}", e))),
            };

            finish(&ctx.store, &metrics, &logger, execution_id, outcome).await;

            metrics.pipeline_finished();
            metrics.observe_pipeline_duration(started.elapsed().as_secs_f64());
            tokens.remove(&execution_id);
        });
    }

    /// Cancel a pending or running execution, recording `reason`. The
    /// remote load process is left to end on its own run time.
    pub async fn stop(&self, execution_id: ExecutionId, reason: &str) -> Result<Execution> {
        let before = self.store().get_execution(execution_id).await?;
        let cancelled = self
            .store()
            .transition_execution(
                execution_id,
                ExecutionTransition::to(ExecutionStatus::Cancelled).with_error(reason),
            )
            .await?;

        if let Some((_, token)) = self.tokens.remove(&execution_id) {
            token.cancel();
        }

        self.metrics.inc_executions_finished(ExecutionStatus::Cancelled);
        self.logger.log_execution_transition(
            execution_id,
            before.status,
            ExecutionStatus::Cancelled,
            Some(reason),
        );
        Ok(cancelled)
    }

    pub async fn status(&self, execution_id: ExecutionId) -> Result<Execution> {
        self.store().get_execution(execution_id).await
    }

    pub async fn list(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        self.store().list_executions(filter).await
    }

    /// Refused while running
    pub async fn delete(&self, execution_id: ExecutionId) -> Result<()> {
        self.store().delete_execution(execution_id).await
    }

    /// Pipelines currently tracked
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every pipeline and wait up to `timeout` for them to record
    /// their final state. Returns whether all of them finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!("All execution pipelines drained");
                true
            }
            Err(_) => {
                warn!(remaining = self.tracker.len(), "Timed out draining execution pipelines");
                false
            }
        }
    }
}

fn require_active(kind: &'static str, id: u64, active: bool) -> Result<()> {
    if active {
        Ok(())
    } else {
        Err(FleetError::not_found(kind, id))
    }
}

/// Record the terminal state of a pipeline. A record that was already
/// moved on (typically cancelled by `stop`) is left as it is.
async fn finish(
    store: &Arc<dyn FleetStore>,
    metrics: &FleetMetrics,
    logger: &StructuredLogger,
    execution_id: ExecutionId,
    outcome: Result<PipelineOutcome>,
) {
    let (transition, detail) = match outcome {
        Ok(PipelineOutcome::Completed(result)) => (
            ExecutionTransition::to(ExecutionStatus::Completed).with_metrics(result),
            None,
        ),
        Ok(PipelineOutcome::Cancelled) => {
            let reason = "orchestrator shutting down";
            (
                ExecutionTransition::to(ExecutionStatus::Cancelled).with_error(reason),
                Some(reason.to_string()),
            )
        }
        Err(e) => {
            let message = e.to_string();
            (
                ExecutionTransition::to(ExecutionStatus::Failed).with_error(message.clone()),
                Some(message),
            )
        }
    };

    let target = transition.to;
    match store.transition_execution(execution_id, transition).await {
        Ok(_) => {
            metrics.inc_executions_finished(target);
            logger.log_execution_transition(
                execution_id,
                ExecutionStatus::Running,
                target,
                detail.as_deref(),
            );
        }
        Err(FleetError::Guard(_)) => {
            info!(
                execution_id,
                outcome = %target,
                "Execution already finalized, pipeline outcome dropped"
            );
        }
        Err(e) => {
            error!(execution_id, error = %e, "Failed to record execution outcome");
        }
    }
}
