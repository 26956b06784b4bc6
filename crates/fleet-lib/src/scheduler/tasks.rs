//! Bookkeeping for asynchronously triggered sweeps

use super::SweepKind;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

/// Status of one triggered sweep, looked up by its id
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: Uuid,
    pub kind: SweepKind,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Finished records are dropped once older than `retention`
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<Uuid, TaskRecord>>,
    retention: chrono::Duration,
}

impl TaskRegistry {
    pub fn new(retention: chrono::Duration) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            retention,
        }
    }

    pub fn register(&self, kind: SweepKind) -> Uuid {
        self.prune(Utc::now());

        let task_id = Uuid::new_v4();
        self.tasks.insert(
            task_id,
            TaskRecord {
                task_id,
                kind,
                status: TaskState::Pending,
                result: None,
                error: None,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );
        task_id
    }

    pub fn mark_running(&self, task_id: Uuid) {
        if let Some(mut record) = self.tasks.get_mut(&task_id) {
            record.status = TaskState::Running;
        }
    }

    pub fn complete(&self, task_id: Uuid, outcome: Result<serde_json::Value, String>) {
        if let Some(mut record) = self.tasks.get_mut(&task_id) {
            record.finished_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    record.status = TaskState::Succeeded;
                    record.result = Some(result);
                }
                Err(error) => {
                    record.status = TaskState::Failed;
                    record.error = Some(error);
                }
            }
        }
    }

    pub fn get(&self, task_id: &Uuid) -> Option<TaskRecord> {
        self.tasks.get(task_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn prune(&self, now: DateTime<Utc>) {
        let retention = self.retention;
        self.tasks.retain(|_, record| match record.finished_at {
            Some(at) => now.signed_duration_since(at) <= retention,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_lifecycle() {
        let registry = TaskRegistry::new(chrono::Duration::hours(1));
        let id = registry.register(SweepKind::Liveness);
        assert_eq!(registry.get(&id).unwrap().status, TaskState::Pending);

        registry.mark_running(id);
        registry.complete(id, Ok(json!({"total_checked": 2})));

        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, TaskState::Succeeded);
        assert!(record.status.is_finished());
        assert_eq!(record.result.unwrap()["total_checked"], 2);
        assert!(record.finished_at.is_some());

        assert!(registry.get(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_failure_keeps_error() {
        let registry = TaskRegistry::new(chrono::Duration::hours(1));
        let id = registry.register(SweepKind::Staleness);
        registry.complete(id, Err("storage error: disk full".into()));

        let record = registry.get(&id).unwrap();
        assert_eq!(record.status, TaskState::Failed);
        assert_eq!(record.error.as_deref(), Some("storage error: disk full"));
        assert!(record.result.is_none());
    }

    #[test]
    fn test_old_finished_tasks_are_pruned() {
        let registry = TaskRegistry::new(chrono::Duration::minutes(5));
        let old = registry.register(SweepKind::Liveness);
        let pending = registry.register(SweepKind::Liveness);
        registry.complete(old, Ok(json!({})));
        if let Some(mut record) = registry.tasks.get_mut(&old) {
            record.finished_at = Some(Utc::now() - chrono::Duration::minutes(10));
        }

        registry.register(SweepKind::Staleness);
        assert!(registry.get(&old).is_none());
        assert!(registry.get(&pending).is_some());
        assert_eq!(registry.len(), 2);
    }
}
