//! Pre- and post-execution hooks for the engine.
//!
//! Hooks observe phase execution without owning it; the default pre-exec
//! hook turns the engine's position in the plan into operator progress
//! entries.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::errors::Result;
use crate::executors::ProgressReporter;
use crate::plan::query::{flatten_leaves, leaf_index};
use crate::plan::{OperationKey, OperationPhase, OperationPlan};
use crate::store::{ClusterOperator, ProgressEntry};

/// Observes a phase before or after its execution.
#[async_trait]
pub trait PhaseHook: Send + Sync {
    async fn on_phase(&self, plan: &OperationPlan, phase: &OperationPhase) -> Result<()>;
}

/// Default pre-exec hook: reports overall completion as
/// `100 * current_leaf_index / max(total_leaves, 1)`.
///
/// Progress writes are best effort; a failed write is logged and never
/// fails the phase.
pub struct ProgressHook {
    key: OperationKey,
    operator: Arc<dyn ClusterOperator>,
    reporter: Arc<dyn ProgressReporter>,
}

impl ProgressHook {
    pub fn new(
        key: OperationKey,
        operator: Arc<dyn ClusterOperator>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            key,
            operator,
            reporter,
        }
    }
}

#[async_trait]
impl PhaseHook for ProgressHook {
    async fn on_phase(&self, plan: &OperationPlan, phase: &OperationPhase) -> Result<()> {
        // Composite phases report through their leaves.
        let Some(index) = leaf_index(plan, &phase.id) else {
            return Ok(());
        };
        let total = flatten_leaves(plan).len().max(1);
        let completion = (100 * index / total) as u8;
        let message = format!("Executing phase {}", phase.id);

        self.reporter.report(completion, &message);
        let entry = ProgressEntry::new(completion, message);
        if let Err(err) = self.operator.create_progress_entry(&self.key, &entry).await {
            warn!(phase_id = %phase.id, error = %err, "progress write failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::SilentProgress;
    use crate::plan::model::{ExecutorKind, OperationType};
    use crate::store::InMemoryOperator;
    use chrono::Utc;

    fn plan_with_leaves(n: usize) -> OperationPlan {
        let phases = (0..n)
            .map(|i| {
                let mut phase = OperationPhase::new(format!("/phase-{i}"), format!("phase {i}"));
                phase.executor = Some(ExecutorKind::Bootstrap);
                phase
            })
            .collect();
        OperationPlan {
            key: OperationKey::new("acme", "prod", "op-1"),
            operation_type: OperationType::Install,
            cluster_name: "prod".to_string(),
            servers: Vec::new(),
            phases,
            offline_coordinator: None,
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_progress_hook_writes_completion_percentage() {
        let operator = Arc::new(InMemoryOperator::new());
        let plan = plan_with_leaves(4);
        let hook = ProgressHook::new(plan.key.clone(), operator.clone(), Arc::new(SilentProgress));

        hook.on_phase(&plan, &plan.phases[2]).await.unwrap();

        let entries = operator.progress_entries(&plan.key);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].completion, 50);
        assert!(entries[0].message.contains("/phase-2"));
    }

    #[tokio::test]
    async fn test_progress_hook_skips_composite_phases() {
        let operator = Arc::new(InMemoryOperator::new());
        let mut plan = plan_with_leaves(2);
        let mut composite = OperationPhase::new("/group", "group");
        composite.phases = std::mem::take(&mut plan.phases);
        plan.phases = vec![composite];

        let hook = ProgressHook::new(plan.key.clone(), operator.clone(), Arc::new(SilentProgress));
        hook.on_phase(&plan, &plan.phases[0]).await.unwrap();
        assert!(operator.progress_entries(&plan.key).is_empty());
    }
}
