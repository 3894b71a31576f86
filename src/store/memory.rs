//! In-memory cluster operator.
//!
//! Backs the engine's test harness and embedded single-process use. The
//! failure-injection counters let tests exercise the transient-retry and
//! follower-backoff paths without a real flaky store.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::errors::{OperationError, Result};
use crate::plan::{OperationKey, OperationPlan, PlanChange, PlanChangelog};
use crate::store::{ClusterOperator, ProgressEntry, SetOperationStateRequest};

#[derive(Default)]
struct State {
    plans: HashMap<OperationKey, OperationPlan>,
    changelogs: HashMap<OperationKey, PlanChangelog>,
    progress: HashMap<OperationKey, Vec<ProgressEntry>>,
    operation_states: HashMap<OperationKey, SetOperationStateRequest>,
    runtime_env: HashMap<OperationKey, BTreeMap<String, String>>,
    cluster_config: HashMap<OperationKey, serde_json::Value>,
}

/// A cluster operator backed by process memory.
#[derive(Default)]
pub struct InMemoryOperator {
    state: Mutex<State>,
    plan_read_failures: AtomicU32,
    append_failures: AtomicU32,
}

impl InMemoryOperator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` plan reads with a transient error.
    pub fn inject_plan_read_failures(&self, count: u32) {
        self.plan_read_failures.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` changelog appends with a transient error.
    pub fn inject_append_failures(&self, count: u32) {
        self.append_failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Recorded progress entries, in write order.
    pub fn progress_entries(&self, key: &OperationKey) -> Vec<ProgressEntry> {
        self.lock().progress.get(key).cloned().unwrap_or_default()
    }

    /// The last operation state set through the operator.
    pub fn operation_state(&self, key: &OperationKey) -> Option<SetOperationStateRequest> {
        self.lock().operation_states.get(key).cloned()
    }

    /// The last runtime environment rotated in, if any.
    pub fn runtime_env(&self, key: &OperationKey) -> Option<BTreeMap<String, String>> {
        self.lock().runtime_env.get(key).cloned()
    }

    /// The last cluster configuration applied, if any.
    pub fn cluster_config(&self, key: &OperationKey) -> Option<serde_json::Value> {
        self.lock().cluster_config.get(key).cloned()
    }
}

#[async_trait]
impl ClusterOperator for InMemoryOperator {
    async fn get_operation_plan(&self, key: &OperationKey) -> Result<OperationPlan> {
        if Self::take_failure(&self.plan_read_failures) {
            return Err(OperationError::transient("injected plan read failure"));
        }
        self.lock()
            .plans
            .get(key)
            .cloned()
            .ok_or_else(|| OperationError::not_found(format!("operation plan for {key}")))
    }

    async fn create_operation_plan(&self, key: &OperationKey, plan: &OperationPlan) -> Result<()> {
        let mut state = self.lock();
        if state.plans.contains_key(key) {
            return Err(OperationError::already_exists(format!(
                "operation plan for {key}"
            )));
        }
        state.plans.insert(key.clone(), plan.clone());
        Ok(())
    }

    async fn create_plan_change(&self, key: &OperationKey, change: &PlanChange) -> Result<()> {
        if Self::take_failure(&self.append_failures) {
            return Err(OperationError::transient("injected append failure"));
        }
        self.lock()
            .changelogs
            .entry(key.clone())
            .or_default()
            .append(change.clone());
        Ok(())
    }

    async fn get_plan_changelog(&self, key: &OperationKey) -> Result<PlanChangelog> {
        Ok(self.lock().changelogs.get(key).cloned().unwrap_or_default())
    }

    async fn create_progress_entry(&self, key: &OperationKey, entry: &ProgressEntry) -> Result<()> {
        self.lock()
            .progress
            .entry(key.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn set_operation_state(
        &self,
        key: &OperationKey,
        request: &SetOperationStateRequest,
    ) -> Result<()> {
        self.lock()
            .operation_states
            .insert(key.clone(), request.clone());
        Ok(())
    }

    async fn rotate_runtime_config(
        &self,
        key: &OperationKey,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.lock().runtime_env.insert(key.clone(), env.clone());
        Ok(())
    }

    async fn update_cluster_config(
        &self,
        key: &OperationKey,
        config: &serde_json::Value,
    ) -> Result<()> {
        self.lock()
            .cluster_config
            .insert(key.clone(), config.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::{OperationType, PhaseState};
    use crate::plan::{OperationPhase, resolve_plan};
    use crate::store::{RetryPolicy, retry_transient};
    use chrono::Utc;

    fn key() -> OperationKey {
        OperationKey::new("acme", "prod", "op-1")
    }

    fn plan() -> OperationPlan {
        let mut phase = OperationPhase::new("/init", "Initialize");
        phase.executor = Some(crate::plan::ExecutorKind::Bootstrap);
        OperationPlan {
            key: key(),
            operation_type: OperationType::Install,
            cluster_name: "prod".to_string(),
            servers: Vec::new(),
            phases: vec![phase],
            offline_coordinator: None,
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_plan_create_and_get() {
        let store = InMemoryOperator::new();
        let k = key();

        let missing = store.get_operation_plan(&k).await.unwrap_err();
        assert!(missing.is_not_found());

        store.create_operation_plan(&k, &plan()).await.unwrap();
        assert!(store.get_operation_plan(&k).await.is_ok());

        let dup = store.create_operation_plan(&k, &plan()).await.unwrap_err();
        assert!(dup.is_already_exists());
    }

    #[tokio::test]
    async fn test_changelog_append_resolves_into_plan() {
        let store = InMemoryOperator::new();
        let k = key();
        let p = plan();
        store.create_operation_plan(&k, &p).await.unwrap();

        let change = PlanChange::new(&p, "/init", PhaseState::Completed, None);
        store.create_plan_change(&k, &change).await.unwrap();
        // Replay with the same change ID is a no-op.
        store.create_plan_change(&k, &change).await.unwrap();

        let log = store.get_plan_changelog(&k).await.unwrap();
        assert_eq!(log.len(), 1);
        let resolved = resolve_plan(&p, &log);
        assert_eq!(resolved.phases[0].state, PhaseState::Completed);
    }

    #[tokio::test]
    async fn test_injected_append_failures_clear_with_retry() {
        let store = InMemoryOperator::new();
        let k = key();
        let p = plan();
        store.create_operation_plan(&k, &p).await.unwrap();
        store.inject_append_failures(2);

        let change = PlanChange::new(&p, "/init", PhaseState::InProgress, None);
        retry_transient(RetryPolicy::new(3), || {
            let change = change.clone();
            let k = k.clone();
            let store = &store;
            async move { store.create_plan_change(&k, &change).await }
        })
        .await
        .unwrap();

        assert_eq!(store.get_plan_changelog(&k).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_operation_state_helpers() {
        let store = InMemoryOperator::new();
        let k = key();
        store.complete_operation(&k).await.unwrap();
        assert_eq!(
            store.operation_state(&k).unwrap().state,
            crate::store::OperationState::Completed
        );

        store.fail_operation(&k, "phase /init failed").await.unwrap();
        let state = store.operation_state(&k).unwrap();
        assert_eq!(state.state, crate::store::OperationState::Failed);
        assert!(state.message.unwrap().contains("/init"));
    }
}
