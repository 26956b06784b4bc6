//! Persistence seam
//!
//! Everything the fleet keeps lives behind [`FleetStore`]. Deletes of
//! agents, plans and catalog entities are soft (the `active` flag).
//! Executions are hard deleted but never while running.

mod memory;

pub use memory::MemoryStore;
pub(crate) use memory::write_atomically;

use crate::error::Result;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentFilter {
    pub status: Option<AgentStatus>,
    #[serde(default)]
    pub include_inactive: bool,
}

impl AgentFilter {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        (self.include_inactive || agent.active)
            && self.status.map_or(true, |status| agent.status == status)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub task_id: Option<TaskId>,
    pub agent_id: Option<AgentId>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn matches(&self, execution: &Execution) -> bool {
        self.status.map_or(true, |s| execution.status == s)
            && self.task_id.map_or(true, |t| execution.task_id == t)
            && self.agent_id.map_or(true, |a| execution.agent_id == a)
    }
}

#[async_trait]
pub trait FleetStore: Send + Sync {
    // Agents
    async fn insert_agent(&self, agent: Agent) -> Result<Agent>;
    async fn get_agent(&self, id: AgentId) -> Result<Agent>;
    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>>;
    async fn update_agent(&self, agent: Agent) -> Result<Agent>;
    async fn deactivate_agent(&self, id: AgentId) -> Result<()>;

    /// Commit a sweep's buffered observations in one step. Observations for
    /// agents that no longer exist are skipped. Returns how many were applied.
    async fn apply_observations(&self, observations: Vec<AgentObservation>) -> Result<usize>;

    /// Record a manual connection test. `Some` overwrites tool versions,
    /// CPU and memory capacity and marks the agent online; `None` marks it
    /// offline. Utilization and other fields are left alone.
    async fn record_connection_test(
        &self,
        id: AgentId,
        facts: Option<ConnectionFacts>,
    ) -> Result<Agent>;

    /// Force every active online agent whose heartbeat is older than `cutoff`
    /// (or missing) to offline. Returns the ids that changed.
    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentId>>;

    // Allocation plans
    async fn insert_plan(&self, plan: AllocationPlan) -> Result<AllocationPlan>;
    async fn get_plan(&self, id: PlanId) -> Result<AllocationPlan>;
    async fn list_plans(&self, agent_id: Option<AgentId>) -> Result<Vec<AllocationPlan>>;
    async fn update_plan(&self, plan: AllocationPlan) -> Result<AllocationPlan>;
    async fn deactivate_plan(&self, id: PlanId) -> Result<()>;

    // Executions
    async fn insert_execution(&self, execution: Execution) -> Result<Execution>;
    async fn get_execution(&self, id: ExecutionId) -> Result<Execution>;
    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>>;

    /// Atomically apply `transition` if the state machine allows it from the
    /// current status; otherwise fail with `FleetError::Guard`.
    async fn transition_execution(
        &self,
        id: ExecutionId,
        transition: ExecutionTransition,
    ) -> Result<Execution>;

    /// Refused with `FleetError::Guard` while the execution is running
    async fn delete_execution(&self, id: ExecutionId) -> Result<()>;

    // Catalog
    async fn insert_task(&self, task: TestTask) -> Result<TestTask>;
    async fn get_task(&self, id: TaskId) -> Result<TestTask>;
    async fn list_tasks(&self) -> Result<Vec<TestTask>>;
    async fn update_task(&self, task: TestTask) -> Result<TestTask>;
    async fn deactivate_task(&self, id: TaskId) -> Result<()>;

    async fn insert_script(&self, script: TestScript) -> Result<TestScript>;
    async fn get_script(&self, id: ScriptId) -> Result<TestScript>;
    async fn list_scripts(&self) -> Result<Vec<TestScript>>;
    async fn deactivate_script(&self, id: ScriptId) -> Result<()>;

    async fn insert_strategy(&self, strategy: RunStrategy) -> Result<RunStrategy>;
    async fn get_strategy(&self, id: StrategyId) -> Result<RunStrategy>;
    async fn list_strategies(&self) -> Result<Vec<RunStrategy>>;
    async fn deactivate_strategy(&self, id: StrategyId) -> Result<()>;

    async fn insert_scenario(&self, scenario: InterfaceScenario) -> Result<InterfaceScenario>;
    async fn get_scenario(&self, id: ScenarioId) -> Result<InterfaceScenario>;
    /// Scenarios of a task in execution order
    async fn list_scenarios(&self, task_id: TaskId) -> Result<Vec<InterfaceScenario>>;
    async fn delete_scenario(&self, id: ScenarioId) -> Result<()>;

    async fn insert_file(&self, file: ScenarioFile) -> Result<ScenarioFile>;
    async fn get_file(&self, id: FileId) -> Result<ScenarioFile>;
    async fn list_files(&self, scenario_id: ScenarioId) -> Result<Vec<ScenarioFile>>;
    async fn update_file(&self, file: ScenarioFile) -> Result<ScenarioFile>;
    async fn delete_file(&self, id: FileId) -> Result<()>;
}
