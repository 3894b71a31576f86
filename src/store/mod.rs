//! Durable plan storage behind the cluster operator abstraction.
//!
//! The operator service owns the plan, its changelog, and operation state;
//! the engine only ever appends. The store may be eventually consistent
//! and transiently unavailable, so every caller goes through the bounded
//! retry helper with the same change ID on replay.
//!
//! Two implementations ship in-tree:
//! - `InMemoryOperator` - test harness and embedded use
//! - `FileOperator` - single-node file-backed operator for the CLI

mod file;
mod memory;

pub use file::FileOperator;
pub use memory::InMemoryOperator;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;
use crate::plan::{OperationKey, OperationPlan, PlanChange, PlanChangelog, resolve_plan};

/// Coarse operation state kept by the operator service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    #[default]
    Active,
    Completed,
    Failed,
}

/// Request to move an operation to a new state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetOperationStateRequest {
    pub state: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A single progress report written while a plan executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Completion percentage, 0-100
    pub completion: u8,
    /// Current coarse state
    pub state: OperationState,
    /// Human-readable progress message
    pub message: String,
    /// When the entry was written
    pub created: DateTime<Utc>,
}

impl ProgressEntry {
    pub fn new(completion: u8, message: impl Into<String>) -> Self {
        Self {
            completion: completion.min(100),
            state: OperationState::Active,
            message: message.into(),
            created: Utc::now(),
        }
    }
}

/// The cluster operator service surface the state machine depends on.
///
/// Implementations must make `create_plan_change` idempotent by change ID:
/// the engine retries appends with the same ID after transient failures.
#[async_trait]
pub trait ClusterOperator: Send + Sync {
    /// Fetch the stored plan for an operation.
    async fn get_operation_plan(&self, key: &OperationKey) -> Result<OperationPlan>;

    /// Store the initial plan for an operation.
    async fn create_operation_plan(&self, key: &OperationKey, plan: &OperationPlan) -> Result<()>;

    /// Append one state transition to the operation's changelog.
    async fn create_plan_change(&self, key: &OperationKey, change: &PlanChange) -> Result<()>;

    /// Read the operation's changelog.
    async fn get_plan_changelog(&self, key: &OperationKey) -> Result<PlanChangelog>;

    /// Record a progress report. Losing one is acceptable.
    async fn create_progress_entry(&self, key: &OperationKey, entry: &ProgressEntry) -> Result<()>;

    /// Move the operation to a new coarse state.
    async fn set_operation_state(
        &self,
        key: &OperationKey,
        request: &SetOperationStateRequest,
    ) -> Result<()>;

    /// Replace the cluster runtime configuration package contents.
    async fn rotate_runtime_config(
        &self,
        key: &OperationKey,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Apply a cluster configuration payload.
    async fn update_cluster_config(
        &self,
        key: &OperationKey,
        config: &serde_json::Value,
    ) -> Result<()>;

    /// Mark the operation successfully completed.
    async fn complete_operation(&self, key: &OperationKey) -> Result<()> {
        self.set_operation_state(
            key,
            &SetOperationStateRequest {
                state: OperationState::Completed,
                message: None,
            },
        )
        .await
    }

    /// Mark the operation failed with the given message.
    async fn fail_operation(&self, key: &OperationKey, message: &str) -> Result<()> {
        self.set_operation_state(
            key,
            &SetOperationStateRequest {
                state: OperationState::Failed,
                message: Some(message.to_string()),
            },
        )
        .await
    }
}

/// Fetch the plan with its changelog folded in.
pub async fn resolved_plan(
    operator: &Arc<dyn ClusterOperator>,
    key: &OperationKey,
) -> Result<OperationPlan> {
    let plan = operator.get_operation_plan(key).await?;
    let changelog = operator.get_plan_changelog(key).await?;
    Ok(resolve_plan(&plan, &changelog))
}

/// Bounded retry schedule for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for the exponentially growing delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            ..Default::default()
        }
    }

    /// No retries at all.
    pub fn once() -> Self {
        Self::new(1)
    }
}

/// Run an operation, retrying transient failures per the policy.
///
/// Non-transient errors are surfaced immediately. The operation must be
/// idempotent under replay; the store contract guarantees this for change
/// appends keyed by change ID.
pub async fn retry_transient<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.attempts.max(1) => {
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err,
                    "retrying transient store failure");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}
