//! The per-execution pipeline: materialize, deploy, launch, wait, collect

use super::{script, OrchestratorConfig};
use crate::channel::{shell_quote, ChannelError, RemoteConnector, RemoteSession, RemoteTarget};
use crate::error::{FleetError, PipelineStage, Result};
use crate::models::{
    Agent, AllocationPlan, Execution, ExecutionId, ResultMetrics, RunStrategy, TestTask,
};
use crate::results;
use crate::store::FleetStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a pipeline run ended, short of an error
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PipelineOutcome {
    Completed(ResultMetrics),
    Cancelled,
}

/// Remote file layout of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    pub script_path: String,
    pub csv_prefix: String,
    pub stats_path: String,
    pub log_path: String,
}

impl RemoteLayout {
    pub fn new(remote_dir: &str, execution_id: ExecutionId) -> Self {
        let dir = remote_dir.trim_end_matches('/');
        let csv_prefix = format!("{}/locust_results_{}", dir, execution_id);
        Self {
            script_path: format!("{}/locust_script_{}.py", dir, execution_id),
            stats_path: format!("{}_stats.csv", csv_prefix),
            log_path: format!("{}/locust_{}.log", dir, execution_id),
            csv_prefix,
        }
    }

    fn worker_log_path(&self, index: u32) -> String {
        format!("{}.worker{}.log", self.log_path.trim_end_matches(".log"), index)
    }
}

/// Headless launch command. Standalone unless the plan enables a master,
/// in which case one master and `worker_count` local workers are started.
pub fn launch_command(
    layout: &RemoteLayout,
    task: &TestTask,
    strategy: &RunStrategy,
    plan: &AllocationPlan,
) -> String {
    let script = shell_quote(&layout.script_path);
    let mut run_args = format!(
        "--headless --users {} --spawn-rate {} --run-time={}s --csv={}",
        strategy.user_count,
        strategy.spawn_rate,
        strategy.run_time_secs,
        shell_quote(&layout.csv_prefix)
    );
    if let Some(host) = task.target_host.as_deref().filter(|h| !h.is_empty()) {
        run_args.push_str(&format!(" --host {}", shell_quote(host)));
    }

    let background = |cmd: String, log: &str| {
        format!("nohup {} > {} 2>&1 < /dev/null &", cmd, shell_quote(log))
    };

    if !plan.master_enabled {
        return background(
            format!("locust -f {} {}", script, run_args),
            &layout.log_path,
        );
    }

    let mut commands = vec![background(
        format!(
            "locust -f {} --master --expect-workers {} {}",
            script, plan.worker_count, run_args
        ),
        &layout.log_path,
    )];
    for index in 1..=plan.worker_count {
        commands.push(background(
            format!("locust -f {} --worker --master-host 127.0.0.1", script),
            &layout.worker_log_path(index),
        ));
    }
    commands.join(" ")
}

/// Shared collaborators of every pipeline run
pub(crate) struct PipelineContext {
    pub store: Arc<dyn FleetStore>,
    pub connector: Arc<dyn RemoteConnector>,
    pub config: OrchestratorConfig,
}

struct Inputs {
    execution: Execution,
    task: TestTask,
    strategy: RunStrategy,
    agent: Agent,
    plan: AllocationPlan,
}

impl PipelineContext {
    pub async fn run(
        &self,
        execution_id: ExecutionId,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome> {
        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }

        let inputs = self.load(execution_id).await?;
        let target = RemoteTarget::for_agent(&inputs.agent).ok_or_else(|| {
            FleetError::pipeline(PipelineStage::Deploy, "agent has no credentials configured")
        })?;
        let layout = RemoteLayout::new(&self.config.remote_dir, execution_id);

        let script = self.materialize(&inputs.task).await?;
        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }
        self.deploy(&target, &layout, script.as_bytes()).await?;
        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }
        self.launch(&target, &layout, &inputs).await?;

        info!(
            execution_id,
            agent_id = inputs.agent.id,
            users = inputs.strategy.user_count,
            run_time_secs = inputs.strategy.run_time_secs,
            distributed = inputs.plan.master_enabled,
            "Load test launched"
        );

        let wait = self.config.launch_settle
            + Duration::from_secs(inputs.strategy.run_time_secs)
            + self.config.run_grace;
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(execution_id, "Pipeline cancelled while waiting for run to finish");
                return Ok(PipelineOutcome::Cancelled);
            }
            _ = tokio::time::sleep(wait) => {}
        }

        let artifact = self.collect(&target, &layout).await?;
        let metrics = results::ingest(artifact.as_deref());
        debug!(
            execution_id = inputs.execution.id,
            total_requests = metrics.total_requests,
            "Results collected"
        );
        Ok(PipelineOutcome::Completed(metrics))
    }

    async fn load(&self, execution_id: ExecutionId) -> Result<Inputs> {
        let execution = self.store.get_execution(execution_id).await?;
        let stage = |e: FleetError| FleetError::pipeline(PipelineStage::Materialize, e);
        Ok(Inputs {
            task: self.store.get_task(execution.task_id).await.map_err(stage)?,
            strategy: self
                .store
                .get_strategy(execution.strategy_id)
                .await
                .map_err(stage)?,
            agent: self.store.get_agent(execution.agent_id).await.map_err(stage)?,
            plan: self.store.get_plan(execution.plan_id).await.map_err(stage)?,
            execution,
        })
    }

    /// Stored script when the task references a usable one, otherwise a
    /// script synthesized from its interface scenarios
    async fn materialize(&self, task: &TestTask) -> Result<String> {
        if let Some(script_id) = task.script_id {
            match self.store.get_script(script_id).await {
                Ok(stored) if stored.active && !stored.content.trim().is_empty() => {
                    return Ok(stored.content);
                }
                Ok(_) => warn!(task_id = task.id, script_id, "Referenced script unusable, synthesizing"),
                Err(e) => warn!(task_id = task.id, script_id, error = %e, "Referenced script missing, synthesizing"),
            }
        }

        let scenarios = self
            .store
            .list_scenarios(task.id)
            .await
            .map_err(|e| FleetError::pipeline(PipelineStage::Materialize, e))?;
        Ok(script::synthesize(task, &scenarios))
    }

    async fn deploy(&self, target: &RemoteTarget, layout: &RemoteLayout, script: &[u8]) -> Result<()> {
        let session = self
            .open(target, self.config.deploy_timeout, PipelineStage::Deploy)
            .await?;
        let result = session.put_file(script, &layout.script_path).await;
        close_quietly(session).await;

        result.map_err(|e| FleetError::pipeline(PipelineStage::Deploy, e))
    }

    async fn launch(&self, target: &RemoteTarget, layout: &RemoteLayout, inputs: &Inputs) -> Result<()> {
        let command = launch_command(layout, &inputs.task, &inputs.strategy, &inputs.plan);
        let session = self
            .open(target, self.config.deploy_timeout, PipelineStage::Launch)
            .await?;
        let result = session.run(&command).await;
        close_quietly(session).await;

        let output = result.map_err(|e| FleetError::pipeline(PipelineStage::Launch, e))?;
        if !output.success() {
            return Err(FleetError::pipeline(
                PipelineStage::Launch,
                format!(
                    "launcher exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    /// `None` when the run left no stats file
    async fn collect(&self, target: &RemoteTarget, layout: &RemoteLayout) -> Result<Option<Vec<u8>>> {
        let session = self
            .open(target, self.config.fetch_timeout, PipelineStage::Collect)
            .await?;
        let result = session.get_file(&layout.stats_path).await;
        close_quietly(session).await;

        match result {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ChannelError::NotFound(path)) => {
                warn!(path = %path, "Stats file missing after run");
                Ok(None)
            }
            Err(e) => Err(FleetError::pipeline(PipelineStage::Collect, e)),
        }
    }

    async fn open(
        &self,
        target: &RemoteTarget,
        timeout: Duration,
        stage: PipelineStage,
    ) -> Result<Box<dyn RemoteSession>> {
        self.connector
            .connect(target, timeout)
            .await
            .map_err(|e| FleetError::pipeline(stage, e))
    }
}

async fn close_quietly(session: Box<dyn RemoteSession>) {
    if let Err(e) = session.close().await {
        debug!(error = %e, "Error closing session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_layout() {
        let layout = RemoteLayout::new("/tmp/", 7);
        assert_eq!(layout.script_path, "/tmp/locust_script_7.py");
        assert_eq!(layout.csv_prefix, "/tmp/locust_results_7");
        assert_eq!(layout.stats_path, "/tmp/locust_results_7_stats.csv");
        assert_eq!(layout.worker_log_path(2), "/tmp/locust_7.worker2.log");
    }

    #[test]
    fn test_standalone_launch_command() {
        let layout = RemoteLayout::new("/tmp", 3);
        let task = TestTask::new("t", Some("https://api.example".into()));
        let strategy = RunStrategy::new("s", 50, 5, 120);
        let mut plan = AllocationPlan::new(1, "p");
        plan.master_enabled = false;

        let cmd = launch_command(&layout, &task, &strategy, &plan);
        assert_eq!(
            cmd,
            "nohup locust -f '/tmp/locust_script_3.py' --headless --users 50 --spawn-rate 5 \
             --run-time=120s --csv='/tmp/locust_results_3' --host 'https://api.example' \
             > '/tmp/locust_3.log' 2>&1 < /dev/null &"
        );
    }

    #[test]
    fn test_distributed_launch_starts_master_and_workers() {
        let layout = RemoteLayout::new("/tmp", 3);
        let task = TestTask::new("t", None);
        let strategy = RunStrategy::new("s", 10, 1, 60);
        let mut plan = AllocationPlan::new(1, "p");
        plan.worker_count = 2;

        let cmd = launch_command(&layout, &task, &strategy, &plan);
        assert!(cmd.starts_with("nohup locust -f '/tmp/locust_script_3.py' --master --expect-workers 2"));
        assert_eq!(cmd.matches("--worker --master-host 127.0.0.1").count(), 2);
        assert!(!cmd.contains("--host"));
        assert!(cmd.ends_with('&'));
    }
}
