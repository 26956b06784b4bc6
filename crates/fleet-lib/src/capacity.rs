//! Capacity validation of allocation plans
//!
//! A plan is valid when the reserved system share, the master (if enabled)
//! and every worker fit inside the agent's declared hardware. Structural
//! checks run before the totals are compared.

use crate::error::{FleetError, Result};
use crate::models::{AgentId, AllocationPlan, Capacity, PlanId};
use crate::store::FleetStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Slack for accumulated floating point error in memory sums
const MEMORY_EPSILON_GB: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceTotals {
    pub cpu_cores: u64,
    pub memory_gb: f64,
    pub network_mbps: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceBreakdown {
    pub required: ResourceTotals,
    pub available: ResourceTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacityReport {
    pub valid: bool,
    pub message: String,
    /// Present when the totals were computed
    pub breakdown: Option<ResourceBreakdown>,
}

impl CapacityReport {
    fn rejected(message: impl Into<String>, breakdown: Option<ResourceBreakdown>) -> Self {
        Self {
            valid: false,
            message: message.into(),
            breakdown,
        }
    }
}

/// Resources the plan asks for in total
pub fn required_totals(plan: &AllocationPlan) -> ResourceTotals {
    let workers = u64::from(plan.worker_count);
    let mut totals = ResourceTotals {
        cpu_cores: u64::from(plan.reserved.cpu_cores) + workers * u64::from(plan.worker.cpu_cores),
        memory_gb: plan.reserved.memory_gb + workers as f64 * plan.worker.memory_gb,
        network_mbps: u64::from(plan.reserved.network_mbps)
            + workers * u64::from(plan.worker.network_mbps),
    };

    if plan.master_enabled {
        totals.cpu_cores += u64::from(plan.master.cpu_cores);
        totals.memory_gb += plan.master.memory_gb;
        totals.network_mbps += u64::from(plan.master.network_mbps);
    }

    totals
}

fn structural_error(plan: &AllocationPlan) -> Option<&'static str> {
    if plan.worker_count < 1 {
        return Some("worker count must be at least 1");
    }
    if plan.worker.cpu_cores < 1 || plan.master.cpu_cores < 1 {
        return Some("CPU cores per unit must be at least 1");
    }
    // Negated comparison also rejects NaN
    if !(plan.worker.memory_gb >= 1.0) || !(plan.master.memory_gb >= 1.0) {
        return Some("memory per unit must be at least 1 GB");
    }
    if !(plan.reserved.memory_gb >= 0.0) {
        return Some("reserved memory must not be negative");
    }
    None
}

/// Validate a plan against an agent's declared capacity
pub fn validate(plan: &AllocationPlan, capacity: &Capacity) -> CapacityReport {
    if let Some(message) = structural_error(plan) {
        return CapacityReport::rejected(message, None);
    }

    let required = required_totals(plan);
    let available = ResourceTotals {
        cpu_cores: u64::from(capacity.cpu_cores),
        memory_gb: capacity.memory_gb,
        network_mbps: u64::from(capacity.network_mbps),
    };
    let breakdown = Some(ResourceBreakdown {
        required,
        available,
    });

    if required.cpu_cores > available.cpu_cores {
        return CapacityReport::rejected(
            format!(
                "CPU cores exceed capacity: required {}, available {}",
                required.cpu_cores, available.cpu_cores
            ),
            breakdown,
        );
    }

    if required.memory_gb > available.memory_gb + MEMORY_EPSILON_GB {
        return CapacityReport::rejected(
            format!(
                "memory exceeds capacity: required {:.1} GB, available {:.1} GB",
                required.memory_gb, available.memory_gb
            ),
            breakdown,
        );
    }

    if required.network_mbps > available.network_mbps {
        return CapacityReport::rejected(
            format!(
                "network bandwidth exceeds capacity: required {} Mbps, available {} Mbps",
                required.network_mbps, available.network_mbps
            ),
            breakdown,
        );
    }

    CapacityReport {
        valid: true,
        message: "plan fits agent capacity".to_string(),
        breakdown,
    }
}

/// Plan CRUD that keeps `is_valid` in step with every mutation
pub struct PlanService {
    store: Arc<dyn FleetStore>,
}

impl PlanService {
    pub fn new(store: Arc<dyn FleetStore>) -> Self {
        Self { store }
    }

    /// Persist a plan; invalid plans are stored with the flag cleared
    pub async fn create(&self, plan: AllocationPlan) -> Result<AllocationPlan> {
        let agent = self.store.get_agent(plan.agent_id).await?;
        if !agent.active {
            return Err(FleetError::not_found("agent", agent.id));
        }

        let mut plan = plan;
        let report = validate(&plan, &agent.capacity);
        apply_report(&mut plan, &report);
        let plan = self.store.insert_plan(plan).await?;

        info!(
            plan_id = plan.id,
            agent_id = plan.agent_id,
            valid = plan.is_valid,
            "Allocation plan created"
        );
        Ok(plan)
    }

    pub async fn update(&self, plan: AllocationPlan) -> Result<AllocationPlan> {
        let existing = self.store.get_plan(plan.id).await?;
        if existing.agent_id != plan.agent_id {
            return Err(FleetError::Validation(
                "a plan cannot move to another agent".to_string(),
            ));
        }

        let agent = self.store.get_agent(plan.agent_id).await?;
        let mut plan = AllocationPlan {
            created_at: existing.created_at,
            ..plan
        };
        let report = validate(&plan, &agent.capacity);
        apply_report(&mut plan, &report);
        self.store.update_plan(plan).await
    }

    pub async fn delete(&self, id: PlanId) -> Result<()> {
        self.store.deactivate_plan(id).await
    }

    /// Re-run validation for a stored plan and persist the outcome
    pub async fn validate(&self, id: PlanId) -> Result<CapacityReport> {
        let mut plan = self.store.get_plan(id).await?;
        let agent = self.store.get_agent(plan.agent_id).await?;

        let report = validate(&plan, &agent.capacity);
        apply_report(&mut plan, &report);
        self.store.update_plan(plan).await?;

        debug!(plan_id = id, valid = report.valid, "Allocation plan validated");
        Ok(report)
    }

    /// Re-validate every active plan of an agent after its capacity changed.
    /// Returns the number of plans whose validity flipped.
    pub async fn revalidate_agent(&self, agent_id: AgentId) -> Result<usize> {
        let agent = self.store.get_agent(agent_id).await?;
        let mut flipped = 0;

        for mut plan in self.store.list_plans(Some(agent_id)).await? {
            let was_valid = plan.is_valid;
            let report = validate(&plan, &agent.capacity);
            apply_report(&mut plan, &report);
            if plan.is_valid != was_valid {
                flipped += 1;
            }
            self.store.update_plan(plan).await?;
        }

        if flipped > 0 {
            info!(agent_id, flipped, "Plans revalidated after capacity change");
        }
        Ok(flipped)
    }
}

fn apply_report(plan: &mut AllocationPlan, report: &CapacityReport) {
    plan.is_valid = report.valid;
    plan.validation_message = Some(report.message.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Agent, ResourceRequest};
    use crate::store::MemoryStore;

    fn capacity(cpu: u32, mem: f64, net: u32) -> Capacity {
        Capacity {
            cpu_cores: cpu,
            memory_gb: mem,
            network_mbps: net,
            disk_gb: 100.0,
        }
    }

    #[test]
    fn test_default_plan_fits_modest_agent() {
        let plan = AllocationPlan::new(1, "default");
        let report = validate(&plan, &capacity(4, 8.0, 1000));
        assert!(report.valid, "{}", report.message);

        let breakdown = report.breakdown.unwrap();
        assert_eq!(breakdown.required.cpu_cores, 3);
        assert_eq!(breakdown.required.memory_gb, 5.0);
        assert_eq!(breakdown.required.network_mbps, 250);
    }

    #[test]
    fn test_exact_fit_is_valid() {
        let plan = AllocationPlan::new(1, "tight");
        assert!(validate(&plan, &capacity(3, 5.0, 250)).valid);
    }

    #[test]
    fn test_cpu_overcommit_names_resource() {
        let mut plan = AllocationPlan::new(1, "big");
        plan.worker_count = 4;
        let report = validate(&plan, &capacity(4, 64.0, 10_000));

        assert!(!report.valid);
        assert_eq!(
            report.message,
            "CPU cores exceed capacity: required 6, available 4"
        );
    }

    #[test]
    fn test_memory_overcommit() {
        let mut plan = AllocationPlan::new(1, "hungry");
        plan.worker.memory_gb = 8.0;
        let report = validate(&plan, &capacity(16, 8.0, 10_000));
        assert!(!report.valid);
        assert!(report.message.starts_with("memory exceeds capacity"));
    }

    #[test]
    fn test_network_enforced_even_when_undeclared() {
        let plan = AllocationPlan::new(1, "net");
        let report = validate(&plan, &capacity(16, 64.0, 0));
        assert!(!report.valid);
        assert!(report.message.contains("network bandwidth"));
    }

    #[test]
    fn test_structural_checks_run_first() {
        let mut plan = AllocationPlan::new(1, "zero");
        plan.worker_count = 0;
        let report = validate(&plan, &capacity(0, 0.0, 0));
        assert_eq!(report.message, "worker count must be at least 1");
        assert!(report.breakdown.is_none());

        let mut plan = AllocationPlan::new(1, "tiny-worker");
        plan.worker.memory_gb = 0.5;
        assert!(!validate(&plan, &capacity(64, 256.0, 10_000)).valid);
    }

    #[test]
    fn test_disabled_master_is_not_counted() {
        let mut plan = AllocationPlan::new(1, "standalone");
        plan.master_enabled = false;

        let report = validate(&plan, &capacity(2, 3.0, 150));
        assert!(report.valid, "{}", report.message);
        assert_eq!(report.breakdown.unwrap().required.cpu_cores, 2);
    }

    #[test]
    fn test_master_minimums_apply_when_disabled() {
        let mut plan = AllocationPlan::new(1, "standalone");
        plan.master_enabled = false;
        plan.master = ResourceRequest::new(0, 2.0, 0);
        let report = validate(&plan, &capacity(64, 256.0, 10_000));
        assert_eq!(report.message, "CPU cores per unit must be at least 1");

        plan.master = ResourceRequest::new(1, 0.5, 0);
        let report = validate(&plan, &capacity(64, 256.0, 10_000));
        assert_eq!(report.message, "memory per unit must be at least 1 GB");
    }

    #[test]
    fn test_large_worker_counts_do_not_overflow() {
        let mut plan = AllocationPlan::new(1, "huge");
        plan.worker_count = u32::MAX;
        plan.worker.cpu_cores = u32::MAX;
        let report = validate(&plan, &capacity(u32::MAX, f64::MAX, u32::MAX));
        assert!(!report.valid);
    }

    #[tokio::test]
    async fn test_service_persists_flag_and_revalidates_on_capacity_change() {
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let agent = store
            .insert_agent(Agent::new("a", "10.0.0.1", "locust", capacity(4, 8.0, 1000)))
            .await
            .unwrap();
        let service = PlanService::new(store.clone());

        let plan = service.create(AllocationPlan::new(agent.id, "p")).await.unwrap();
        assert!(plan.is_valid);

        let mut shrunk = store.get_agent(agent.id).await.unwrap();
        shrunk.capacity = capacity(2, 8.0, 1000);
        store.update_agent(shrunk).await.unwrap();

        assert_eq!(service.revalidate_agent(agent.id).await.unwrap(), 1);
        let plan = store.get_plan(plan.id).await.unwrap();
        assert!(!plan.is_valid);
        assert!(plan.validation_message.unwrap().contains("CPU"));
    }

    #[tokio::test]
    async fn test_service_rejects_unknown_agent() {
        let store: Arc<dyn FleetStore> = Arc::new(MemoryStore::new());
        let service = PlanService::new(store);
        let err = tokio_test::assert_err!(service.create(AllocationPlan::new(9, "orphan")).await);
        assert!(matches!(err, FleetError::NotFound { kind: "agent", id: 9 }));
        tokio_test::assert_err!(service.validate(9).await);
    }
}
