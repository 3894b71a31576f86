//! The phase executor contract.
//!
//! Every leaf phase is implemented by a `PhaseExecutor` with four
//! entrypoints: `pre_check`, `execute`, `post_check`, and `rollback`.
//! Executors are created per phase by a factory registered for their tag
//! and own only their ephemeral working resources.
//!
//! Execute must be safe to re-run on the same input: operations are
//! re-entrant, and `AlreadyExists` outcomes count as success. Rollback is
//! only invoked on phases that have left Unstarted; executors that cannot
//! roll back return `BadParameter`.
//!
//! Executor bodies with OS-level side effects (drain, taint, restart, ...)
//! live with the embedding binary and are registered at startup. The two
//! operator-backed executors ship in-tree:
//! - `update-env` - rotates the cluster runtime environment
//! - `update-config` - applies a cluster configuration payload

mod update_config;
mod update_env;

pub use update_config::UpdateConfigExecutor;
pub use update_env::UpdateEnvExecutor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::agent::AgentRunner;
use crate::errors::{OperationError, Result};
use crate::plan::{ExecutorKind, OperationKey, OperationPhase, OperationPlan};
use crate::store::ClusterOperator;

/// Sink for phase-level progress messages.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, completion: u8, message: &str);

    /// A phase state transition observed while following the plan.
    fn transition(&self, change: &crate::plan::PlanChange) {
        let _ = change;
    }
}

/// Discards progress reports.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn report(&self, _completion: u8, _message: &str) {}
}

/// Everything an executor needs to do its work.
#[derive(Clone)]
pub struct ExecutorParams {
    /// Key of the operation being executed
    pub key: OperationKey,
    /// Snapshot of the plan at phase start
    pub plan: Arc<OperationPlan>,
    /// The phase to execute
    pub phase: OperationPhase,
    /// Progress sink for user-facing messages
    pub progress: Arc<dyn ProgressReporter>,
}

impl ExecutorParams {
    /// Span correlating executor output with the phase and its target.
    pub fn span(&self) -> Span {
        match self.phase.target_server() {
            Some(server) => tracing::info_span!(
                "phase",
                phase_id = %self.phase.id,
                server = %server.hostname,
            ),
            None => tracing::info_span!("phase", phase_id = %self.phase.id),
        }
    }
}

/// A per-leaf phase worker.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    /// Validate that the phase can run.
    async fn pre_check(&self, cancel: &CancellationToken) -> Result<()>;

    /// Do the phase's work. Must be re-entrant.
    async fn execute(&self, cancel: &CancellationToken) -> Result<()>;

    /// Validate the outcome.
    async fn post_check(&self, cancel: &CancellationToken) -> Result<()>;

    /// Undo the phase's work.
    async fn rollback(&self, cancel: &CancellationToken) -> Result<()>;

    /// Logging span tagged with the phase ID and target server.
    fn span(&self) -> Span;
}

impl std::fmt::Debug for dyn PhaseExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn PhaseExecutor")
    }
}

/// Capabilities handed to factories whose executors reach other nodes.
#[derive(Clone)]
pub struct RemoteCapability {
    pub runner: Option<Arc<AgentRunner>>,
}

impl RemoteCapability {
    pub fn none() -> Self {
        Self { runner: None }
    }

    pub fn with_runner(runner: Arc<AgentRunner>) -> Self {
        Self {
            runner: Some(runner),
        }
    }
}

/// Creates executors for one tag.
pub trait ExecutorFactory: Send + Sync {
    fn create(
        &self,
        params: ExecutorParams,
        remote: RemoteCapability,
    ) -> Result<Box<dyn PhaseExecutor>>;
}

impl<F> ExecutorFactory for F
where
    F: Fn(ExecutorParams, RemoteCapability) -> Result<Box<dyn PhaseExecutor>> + Send + Sync,
{
    fn create(
        &self,
        params: ExecutorParams,
        remote: RemoteCapability,
    ) -> Result<Box<dyn PhaseExecutor>> {
        self(params, remote)
    }
}

/// Registry of executor factories keyed by tag.
///
/// Requesting an unregistered tag is a `BadParameter`: plans referencing
/// executors this process cannot build fail before any work starts.
#[derive(Default)]
pub struct ExecutorRegistry {
    factories: HashMap<ExecutorKind, Arc<dyn ExecutorFactory>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the in-tree operator-backed executors.
    pub fn with_defaults(operator: Arc<dyn ClusterOperator>) -> Self {
        let mut registry = Self::new();
        let env_operator = operator.clone();
        registry.register(
            ExecutorKind::UpdateEnv,
            move |params: ExecutorParams, _remote: RemoteCapability| {
                Ok(Box::new(UpdateEnvExecutor::new(params, env_operator.clone()))
                    as Box<dyn PhaseExecutor>)
            },
        );
        registry.register(
            ExecutorKind::UpdateConfig,
            move |params: ExecutorParams, _remote: RemoteCapability| {
                Ok(Box::new(UpdateConfigExecutor::new(params, operator.clone()))
                    as Box<dyn PhaseExecutor>)
            },
        );
        registry
    }

    /// Register a factory for a tag, replacing any previous one.
    pub fn register<F>(&mut self, kind: ExecutorKind, factory: F)
    where
        F: ExecutorFactory + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn is_registered(&self, kind: ExecutorKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Build the executor for a phase.
    pub fn get(
        &self,
        params: ExecutorParams,
        remote: RemoteCapability,
    ) -> Result<Box<dyn PhaseExecutor>> {
        let Some(kind) = params.phase.executor else {
            return Err(OperationError::bad_parameter(format!(
                "phase {} is composite and has no executor",
                params.phase.id
            )));
        };
        let Some(factory) = self.factories.get(&kind) else {
            return Err(OperationError::bad_parameter(format!(
                "no executor registered for tag {kind} (phase {})",
                params.phase.id
            )));
        };
        factory.create(params, remote)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records lifecycle calls; optionally fails specific phases.
    pub struct RecordingExecutor {
        phase_id: String,
        log: Arc<Mutex<Vec<String>>>,
        fail_execute: bool,
        fail_rollback: bool,
    }

    #[async_trait]
    impl PhaseExecutor for RecordingExecutor {
        async fn pre_check(&self, _cancel: &CancellationToken) -> Result<()> {
            self.log.lock().unwrap().push(format!("pre_check {}", self.phase_id));
            Ok(())
        }

        async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
            self.log.lock().unwrap().push(format!("execute {}", self.phase_id));
            if self.fail_execute {
                return Err(OperationError::executor(&self.phase_id, "injected failure"));
            }
            Ok(())
        }

        async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
            self.log.lock().unwrap().push(format!("post_check {}", self.phase_id));
            Ok(())
        }

        async fn rollback(&self, _cancel: &CancellationToken) -> Result<()> {
            self.log.lock().unwrap().push(format!("rollback {}", self.phase_id));
            if self.fail_rollback {
                return Err(OperationError::executor(&self.phase_id, "injected rollback failure"));
            }
            Ok(())
        }

        fn span(&self) -> Span {
            tracing::info_span!("phase", phase_id = %self.phase_id)
        }
    }

    /// Factory producing `RecordingExecutor`s that share one call log.
    #[derive(Default, Clone)]
    pub struct RecordingFactory {
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_execute: Arc<Mutex<Vec<String>>>,
        pub fail_rollback: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingFactory {
        pub fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        pub fn fail_execute_of(&self, phase_id: &str) {
            self.fail_execute.lock().unwrap().push(phase_id.to_string());
        }

        pub fn register_everywhere(&self, registry: &mut ExecutorRegistry) {
            for kind in [
                ExecutorKind::Bootstrap,
                ExecutorKind::Runtime,
                ExecutorKind::UpdateEnv,
                ExecutorKind::Drain,
            ] {
                let this = self.clone();
                registry.register(kind, move |params: ExecutorParams, _remote: RemoteCapability| {
                    Ok(Box::new(RecordingExecutor {
                        phase_id: params.phase.id.clone(),
                        log: this.log.clone(),
                        fail_execute: this
                            .fail_execute
                            .lock()
                            .unwrap()
                            .contains(&params.phase.id),
                        fail_rollback: this
                            .fail_rollback
                            .lock()
                            .unwrap()
                            .contains(&params.phase.id),
                    }) as Box<dyn PhaseExecutor>)
                });
            }
        }
    }
}
