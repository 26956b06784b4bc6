//! In-memory store with optional JSON snapshot persistence

use super::{AgentFilter, ExecutionFilter, FleetStore};
use crate::error::{FleetError, Result};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Row type with a store-assigned id
trait Record: Clone {
    const KIND: &'static str;
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}

macro_rules! record {
    ($ty:ty, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;
            fn id(&self) -> u64 {
                self.id
            }
            fn set_id(&mut self, id: u64) {
                self.id = id;
            }
        }
    };
}

record!(Agent, "agent");
record!(AllocationPlan, "plan");
record!(Execution, "execution");
record!(TestTask, "task");
record!(TestScript, "script");
record!(RunStrategy, "strategy");
record!(InterfaceScenario, "scenario");
record!(ScenarioFile, "file");

struct Table<T> {
    rows: DashMap<u64, T>,
    next_id: AtomicU64,
}

impl<T: Record> Table<T> {
    fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert(&self, mut row: T) -> T {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        row.set_id(id);
        self.rows.insert(id, row.clone());
        row
    }

    fn get(&self, id: u64) -> Result<T> {
        self.rows
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| FleetError::not_found(T::KIND, id))
    }

    /// Mutate a row under its entry lock
    fn update<R>(&self, id: u64, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        match self.rows.get_mut(&id) {
            Some(mut row) => f(row.value_mut()),
            None => Err(FleetError::not_found(T::KIND, id)),
        }
    }

    fn replace(&self, row: T) -> Result<T> {
        let id = row.id();
        self.update(id, |existing| {
            *existing = row.clone();
            Ok(row)
        })
    }

    fn remove(&self, id: u64) -> Result<T> {
        self.rows
            .remove(&id)
            .map(|(_, row)| row)
            .ok_or_else(|| FleetError::not_found(T::KIND, id))
    }

    /// Rows matching `predicate`, ordered by id
    fn select(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let mut rows: Vec<T> = self
            .rows
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.id());
        rows
    }

    fn load(&self, rows: Vec<T>) {
        let max_id = rows.iter().map(Record::id).max().unwrap_or(0);
        for row in rows {
            self.rows.insert(row.id(), row);
        }
        self.next_id.fetch_max(max_id + 1, Ordering::SeqCst);
    }
}

#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    agents: Vec<Agent>,
    plans: Vec<AllocationPlan>,
    executions: Vec<Execution>,
    tasks: Vec<TestTask>,
    scripts: Vec<TestScript>,
    strategies: Vec<RunStrategy>,
    scenarios: Vec<InterfaceScenario>,
    files: Vec<ScenarioFile>,
}

/// DashMap-backed [`FleetStore`]
pub struct MemoryStore {
    agents: Table<Agent>,
    plans: Table<AllocationPlan>,
    executions: Table<Execution>,
    tasks: Table<TestTask>,
    scripts: Table<TestScript>,
    strategies: Table<RunStrategy>,
    scenarios: Table<InterfaceScenario>,
    files: Table<ScenarioFile>,
    snapshot_path: Option<PathBuf>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Purely in-memory store
    pub fn new() -> Self {
        Self {
            agents: Table::new(),
            plans: Table::new(),
            executions: Table::new(),
            tasks: Table::new(),
            scripts: Table::new(),
            strategies: Table::new(),
            scenarios: Table::new(),
            files: Table::new(),
            snapshot_path: None,
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Store that snapshots to `path` after every mutation, loading it first
    /// if it exists
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new();

        if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read(&path).await?;
            let snapshot: Snapshot = serde_json::from_slice(&data)?;
            store.restore(snapshot);
            info!(path = %path.display(), agents = store.agents.rows.len(), "Loaded store snapshot");
        }

        store.snapshot_path = Some(path);
        Ok(store)
    }

    fn restore(&self, snapshot: Snapshot) {
        self.agents.load(snapshot.agents);
        self.plans.load(snapshot.plans);
        self.executions.load(snapshot.executions);
        self.tasks.load(snapshot.tasks);
        self.scripts.load(snapshot.scripts);
        self.strategies.load(snapshot.strategies);
        self.scenarios.load(snapshot.scenarios);
        self.files.load(snapshot.files);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            agents: self.agents.select(|_| true),
            plans: self.plans.select(|_| true),
            executions: self.executions.select(|_| true),
            tasks: self.tasks.select(|_| true),
            scripts: self.scripts.select(|_| true),
            strategies: self.strategies.select(|_| true),
            scenarios: self.scenarios.select(|_| true),
            files: self.files.select(|_| true),
        }
    }

    /// Write the snapshot if persistence is enabled
    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let _guard = self.persist_lock.lock().await;
        let json = serde_json::to_vec(&self.snapshot())?;
        write_atomically(path, &json).await?;
        debug!(path = %path.display(), bytes = json.len(), "Store snapshot written");
        Ok(())
    }
}

pub(crate) async fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let temp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    tokio::fs::rename(&temp_path, path).await
}

#[async_trait]
impl FleetStore for MemoryStore {
    async fn insert_agent(&self, agent: Agent) -> Result<Agent> {
        let agent = self.agents.insert(agent);
        self.persist().await?;
        Ok(agent)
    }

    async fn get_agent(&self, id: AgentId) -> Result<Agent> {
        self.agents.get(id)
    }

    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        Ok(self.agents.select(|a| filter.matches(a)))
    }

    async fn update_agent(&self, mut agent: Agent) -> Result<Agent> {
        agent.updated_at = Utc::now();
        let agent = self.agents.replace(agent)?;
        self.persist().await?;
        Ok(agent)
    }

    async fn deactivate_agent(&self, id: AgentId) -> Result<()> {
        self.agents.update(id, |agent| {
            agent.active = false;
            agent.updated_at = Utc::now();
            Ok(())
        })?;
        self.persist().await
    }

    async fn apply_observations(&self, observations: Vec<AgentObservation>) -> Result<usize> {
        let mut applied = 0;
        for observation in observations {
            let result = self.agents.update(observation.agent_id, |agent| {
                agent.status = observation.status;
                if let Some(at) = observation.heartbeat_at {
                    agent.last_heartbeat = Some(at);
                }
                if let Some(utilization) = observation.utilization {
                    agent.utilization = utilization;
                }
                agent.updated_at = observation.observed_at;
                Ok(())
            });

            match result {
                Ok(()) => applied += 1,
                Err(_) => {
                    debug!(agent_id = observation.agent_id, "Skipping observation for removed agent")
                }
            }
        }

        self.persist().await?;
        Ok(applied)
    }

    async fn record_connection_test(
        &self,
        id: AgentId,
        facts: Option<ConnectionFacts>,
    ) -> Result<Agent> {
        let agent = self.agents.update(id, |agent| {
            match facts {
                Some(facts) => {
                    agent.python_version = Some(facts.python_version);
                    agent.locust_version = Some(facts.locust_version);
                    agent.capacity.cpu_cores = facts.cpu_cores;
                    agent.capacity.memory_gb = facts.memory_gb;
                    agent.system_info = facts.system_info;
                    agent.status = AgentStatus::Online;
                    agent.last_heartbeat = Some(facts.checked_at);
                }
                None => agent.status = AgentStatus::Offline,
            }
            agent.updated_at = Utc::now();
            Ok(agent.clone())
        })?;
        self.persist().await?;
        Ok(agent)
    }

    async fn mark_offline_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<AgentId>> {
        let now = Utc::now();
        let mut changed = Vec::new();

        for mut entry in self.agents.rows.iter_mut() {
            let agent = entry.value_mut();
            let stale = agent.last_heartbeat.map_or(true, |at| at < cutoff);
            if agent.active && agent.status == AgentStatus::Online && stale {
                agent.status = AgentStatus::Offline;
                agent.updated_at = now;
                changed.push(agent.id);
            }
        }

        changed.sort_unstable();
        if !changed.is_empty() {
            self.persist().await?;
        }
        Ok(changed)
    }

    async fn insert_plan(&self, plan: AllocationPlan) -> Result<AllocationPlan> {
        let plan = self.plans.insert(plan);
        self.persist().await?;
        Ok(plan)
    }

    async fn get_plan(&self, id: PlanId) -> Result<AllocationPlan> {
        self.plans.get(id)
    }

    async fn list_plans(&self, agent_id: Option<AgentId>) -> Result<Vec<AllocationPlan>> {
        Ok(self
            .plans
            .select(|p| p.active && agent_id.map_or(true, |id| p.agent_id == id)))
    }

    async fn update_plan(&self, mut plan: AllocationPlan) -> Result<AllocationPlan> {
        plan.updated_at = Utc::now();
        let plan = self.plans.replace(plan)?;
        self.persist().await?;
        Ok(plan)
    }

    async fn deactivate_plan(&self, id: PlanId) -> Result<()> {
        self.plans.update(id, |plan| {
            plan.active = false;
            plan.updated_at = Utc::now();
            Ok(())
        })?;
        self.persist().await
    }

    async fn insert_execution(&self, execution: Execution) -> Result<Execution> {
        let execution = self.executions.insert(execution);
        self.persist().await?;
        Ok(execution)
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Execution> {
        self.executions.get(id)
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        let mut executions = self.executions.select(|e| filter.matches(e));
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            executions.truncate(limit);
        }
        Ok(executions)
    }

    async fn transition_execution(
        &self,
        id: ExecutionId,
        transition: ExecutionTransition,
    ) -> Result<Execution> {
        let execution = self.executions.update(id, |execution| {
            if !execution.status.can_transition_to(transition.to) {
                return Err(FleetError::Guard(format!(
                    "execution {} cannot move from {} to {}",
                    id, execution.status, transition.to
                )));
            }
            execution.apply(&transition);
            Ok(execution.clone())
        })?;
        self.persist().await?;
        Ok(execution)
    }

    async fn delete_execution(&self, id: ExecutionId) -> Result<()> {
        let removed = self
            .executions
            .rows
            .remove_if(&id, |_, e| e.status != ExecutionStatus::Running);

        if removed.is_none() {
            // Either missing or running
            let execution = self.executions.get(id)?;
            return Err(FleetError::Guard(format!(
                "execution {} is {} and cannot be deleted",
                id, execution.status
            )));
        }

        self.persist().await
    }

    async fn insert_task(&self, task: TestTask) -> Result<TestTask> {
        let task = self.tasks.insert(task);
        self.persist().await?;
        Ok(task)
    }

    async fn get_task(&self, id: TaskId) -> Result<TestTask> {
        self.tasks.get(id)
    }

    async fn list_tasks(&self) -> Result<Vec<TestTask>> {
        Ok(self.tasks.select(|t| t.active))
    }

    async fn update_task(&self, task: TestTask) -> Result<TestTask> {
        let task = self.tasks.replace(task)?;
        self.persist().await?;
        Ok(task)
    }

    async fn deactivate_task(&self, id: TaskId) -> Result<()> {
        self.tasks.update(id, |task| {
            task.active = false;
            Ok(())
        })?;
        self.persist().await
    }

    async fn insert_script(&self, script: TestScript) -> Result<TestScript> {
        let script = self.scripts.insert(script);
        self.persist().await?;
        Ok(script)
    }

    async fn get_script(&self, id: ScriptId) -> Result<TestScript> {
        self.scripts.get(id)
    }

    async fn list_scripts(&self) -> Result<Vec<TestScript>> {
        Ok(self.scripts.select(|s| s.active))
    }

    async fn deactivate_script(&self, id: ScriptId) -> Result<()> {
        self.scripts.update(id, |script| {
            script.active = false;
            Ok(())
        })?;
        self.persist().await
    }

    async fn insert_strategy(&self, strategy: RunStrategy) -> Result<RunStrategy> {
        let strategy = self.strategies.insert(strategy);
        self.persist().await?;
        Ok(strategy)
    }

    async fn get_strategy(&self, id: StrategyId) -> Result<RunStrategy> {
        self.strategies.get(id)
    }

    async fn list_strategies(&self) -> Result<Vec<RunStrategy>> {
        Ok(self.strategies.select(|s| s.active))
    }

    async fn deactivate_strategy(&self, id: StrategyId) -> Result<()> {
        self.strategies.update(id, |strategy| {
            strategy.active = false;
            Ok(())
        })?;
        self.persist().await
    }

    async fn insert_scenario(&self, scenario: InterfaceScenario) -> Result<InterfaceScenario> {
        let scenario = self.scenarios.insert(scenario);
        self.persist().await?;
        Ok(scenario)
    }

    async fn get_scenario(&self, id: ScenarioId) -> Result<InterfaceScenario> {
        self.scenarios.get(id)
    }

    async fn list_scenarios(&self, task_id: TaskId) -> Result<Vec<InterfaceScenario>> {
        let mut scenarios = self.scenarios.select(|s| s.task_id == task_id);
        scenarios.sort_by_key(|s| (s.order, s.id));
        Ok(scenarios)
    }

    async fn delete_scenario(&self, id: ScenarioId) -> Result<()> {
        self.scenarios.remove(id)?;
        self.persist().await
    }

    async fn insert_file(&self, file: ScenarioFile) -> Result<ScenarioFile> {
        let file = self.files.insert(file);
        self.persist().await?;
        Ok(file)
    }

    async fn get_file(&self, id: FileId) -> Result<ScenarioFile> {
        self.files.get(id)
    }

    async fn list_files(&self, scenario_id: ScenarioId) -> Result<Vec<ScenarioFile>> {
        Ok(self.files.select(|f| f.scenario_id == scenario_id))
    }

    async fn update_file(&self, mut file: ScenarioFile) -> Result<ScenarioFile> {
        file.updated_at = Utc::now();
        let file = self.files.replace(file)?;
        self.persist().await?;
        Ok(file)
    }

    async fn delete_file(&self, id: FileId) -> Result<()> {
        self.files.remove(id)?;
        self.persist().await
    }
}
