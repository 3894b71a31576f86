//! The operation updater: run one operation end to end.
//!
//! The updater ensures a plan exists, drives the engine while streaming
//! plan progress to the configured emitter, and settles the operation
//! state when execution ends. Single-phase entrypoints bound their work
//! with a per-phase timeout; the phase ID `/` addresses the whole plan.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentRunner;
use crate::builder;
use crate::engine::{Engine, PhaseParams, ProgressHook};
use crate::errors::{OperationError, Result};
use crate::executors::{ExecutorRegistry, ProgressReporter};
use crate::follow::{FollowConfig, PlanEvent, follow_operation_plan_with};
use crate::plan::{OperationKey, OperationPlan, Server, is_completed};
use crate::store::{ClusterOperator, RetryPolicy, resolved_plan, retry_transient};

/// Phase ID addressing the whole plan.
pub const WHOLE_PLAN: &str = "/";

/// What to build when the operation has no stored plan yet.
#[derive(Debug, Clone)]
pub enum OperationRequest {
    UpdateEnvars { env: BTreeMap<String, String> },
    UpdateConfig { config: serde_json::Value },
    RuntimeUpgrade { package: String },
    Install,
}

impl OperationRequest {
    fn build_plan(&self, key: OperationKey, servers: Vec<Server>) -> Result<OperationPlan> {
        match self {
            Self::UpdateEnvars { env } => builder::update_envars_plan(key, servers, env.clone()),
            Self::UpdateConfig { config } => {
                builder::update_config_plan(key, servers, config.clone())
            }
            Self::RuntimeUpgrade { package } => {
                builder::runtime_upgrade_plan(key, servers, package)
            }
            Self::Install => builder::install_plan(key, servers),
        }
    }
}

/// Prints progress lines to stdout, one per report.
pub struct StdoutProgress;

impl ProgressReporter for StdoutProgress {
    fn report(&self, completion: u8, message: &str) {
        println!("{completion:>3}%\t{message}");
    }

    fn transition(&self, change: &crate::plan::PlanChange) {
        println!("phase {} is now {}", change.phase_id, change.new_state);
    }
}

/// Runs one operation end to end.
pub struct Updater {
    key: OperationKey,
    operator: Arc<dyn ClusterOperator>,
    runner: Arc<AgentRunner>,
    registry: Arc<ExecutorRegistry>,
    emitter: Arc<dyn ProgressReporter>,
    servers: Vec<Server>,
    request: Option<OperationRequest>,
    retry: RetryPolicy,
    complete_retries: u32,
    follow: FollowConfig,
}

impl Updater {
    pub fn new(
        key: OperationKey,
        operator: Arc<dyn ClusterOperator>,
        runner: Arc<AgentRunner>,
        registry: Arc<ExecutorRegistry>,
    ) -> Self {
        Self {
            key,
            operator,
            runner,
            registry,
            emitter: Arc::new(StdoutProgress),
            servers: Vec::new(),
            request: None,
            retry: RetryPolicy::default(),
            complete_retries: 0,
            follow: FollowConfig::default(),
        }
    }

    /// Servers used when the plan has to be built first.
    pub fn with_servers(mut self, servers: Vec<Server>) -> Self {
        self.servers = servers;
        self
    }

    /// Operation description used when the plan has to be built first.
    pub fn with_request(mut self, request: OperationRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn ProgressReporter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Extra attempts for marking the operation complete. Zero keeps the
    /// single attempt and leaves retries to the outer orchestration.
    pub fn with_complete_retries(mut self, retries: u32) -> Self {
        self.complete_retries = retries;
        self
    }

    pub fn with_follow_config(mut self, follow: FollowConfig) -> Self {
        self.follow = follow;
        self
    }

    /// Fetch the stored plan, building and storing it on first use.
    pub async fn ensure_plan(&self) -> Result<OperationPlan> {
        match self.operator.get_operation_plan(&self.key).await {
            Ok(plan) => return Ok(plan),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let Some(request) = &self.request else {
            return Err(OperationError::not_found(format!(
                "no plan stored for operation {} and no operation request to build one",
                self.key.operation_id
            )));
        };
        let plan = request.build_plan(self.key.clone(), self.servers.clone())?;
        info!(operation_id = %self.key.operation_id, "storing newly built operation plan");

        match self.operator.create_operation_plan(&self.key, &plan).await {
            Ok(()) => Ok(plan),
            // Another driver won the race; their plan is authoritative.
            Err(err) if err.is_already_exists() => {
                self.operator.get_operation_plan(&self.key).await
            }
            Err(err) if err.is_not_found() => Err(OperationError::not_implemented(format!(
                "the cluster does not support storing plans for operation {}; \
                 upgrade the cluster before retrying",
                self.key.operation_id
            ))),
            Err(err) => Err(err),
        }
    }

    fn engine(&self) -> Engine {
        let hook = ProgressHook::new(
            self.key.clone(),
            self.operator.clone(),
            self.emitter.clone(),
        );
        Engine::new(
            self.key.clone(),
            self.operator.clone(),
            self.registry.clone(),
            self.runner.clone(),
        )
        .with_progress(self.emitter.clone())
        .with_retry(self.retry)
        .with_pre_exec_hook(Arc::new(hook))
    }

    /// Run the operation to completion: ensure the plan, drive the engine
    /// while streaming plan events, then settle the operation state.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_plan().await?;
        let engine = self.engine();

        let exec_cancel = cancel.clone();
        let exec = tokio::spawn(async move { engine.execute_plan(&exec_cancel).await });

        // Follow the plan concurrently and forward phase transitions.
        let follow_cancel = cancel.child_token();
        let operator = self.operator.clone();
        let key = self.key.clone();
        let mut events = follow_operation_plan_with(self.follow, follow_cancel.clone(), move || {
            let operator = operator.clone();
            let key = key.clone();
            async move { resolved_plan(&operator, &key).await }
        });
        let emitter = self.emitter.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let PlanEvent::Changed { change } = event {
                    emitter.transition(&change);
                }
            }
        });

        let result = match exec.await {
            Ok(result) => result,
            Err(join_err) => Err(OperationError::Other(anyhow::anyhow!(
                "engine task failed: {join_err}"
            ))),
        };
        follow_cancel.cancel();
        forwarder.await.ok();

        self.complete(cancel, result).await
    }

    /// Settle the operation state after a plan run: completed when every
    /// leaf finished, failed otherwise.
    pub async fn complete(
        &self,
        cancel: &CancellationToken,
        plan_result: Result<()>,
    ) -> Result<()> {
        let plan = resolved_plan(&self.operator, &self.key).await?;
        let policy = RetryPolicy::new(self.complete_retries + 1);

        if is_completed(&plan) {
            retry_transient(policy, || self.operator.complete_operation(&self.key)).await?;
            info!(operation_id = %self.key.operation_id, "operation completed");
            self.shutdown_agents(cancel, &plan).await;
            return Ok(());
        }

        let err = plan_result.err().unwrap_or_else(|| {
            OperationError::Other(anyhow::anyhow!(
                "plan for operation {} did not complete",
                self.key.operation_id
            ))
        });
        let message = err.changelog_message();
        if let Err(fail_err) =
            retry_transient(policy, || self.operator.fail_operation(&self.key, &message)).await
        {
            warn!(error = %fail_err, "could not mark the operation failed");
        }
        Err(err)
    }

    async fn shutdown_agents(&self, cancel: &CancellationToken, plan: &OperationPlan) {
        debug!("shutting down operation agents");
        self.runner.shutdown_agents(cancel, &plan.servers).await;
        self.runner.close().await;
    }

    /// Execute one phase (or the whole plan for `/`) under a timeout.
    pub async fn run_phase(
        &self,
        cancel: &CancellationToken,
        phase_id: &str,
        timeout: Option<Duration>,
        force: bool,
    ) -> Result<()> {
        let engine = self.engine();
        let work = async {
            if phase_id == WHOLE_PLAN {
                engine.execute_plan(cancel).await
            } else {
                engine
                    .execute_phase(cancel, PhaseParams::new(phase_id).with_force(force))
                    .await
            }
        };
        bounded(phase_id, timeout, work).await
    }

    /// Roll back one phase (or the whole plan for `/`) under a timeout.
    pub async fn rollback_phase(
        &self,
        cancel: &CancellationToken,
        phase_id: &str,
        timeout: Option<Duration>,
        force: bool,
    ) -> Result<()> {
        let engine = self.engine();
        let work = async {
            if phase_id == WHOLE_PLAN {
                engine.rollback_plan(cancel, force, false).await.map(|_| ())
            } else {
                engine
                    .rollback_phase(cancel, PhaseParams::new(phase_id).with_force(force))
                    .await
            }
        };
        bounded(phase_id, timeout, work).await
    }
}

async fn bounded<F>(phase_id: &str, timeout: Option<Duration>, work: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    match timeout {
        None => work.await,
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => Err(OperationError::Other(anyhow::anyhow!(
                "phase {phase_id} did not finish within {limit:?}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentCredentials, RunnerConfig, UnreachableDialer};
    use crate::executors::{
        ExecutorParams, PhaseExecutor, RemoteCapability, SilentProgress,
    };
    use crate::plan::model::{ExecutorKind, ServerRole};
    use crate::store::{InMemoryOperator, OperationState};
    use async_trait::async_trait;

    fn key() -> OperationKey {
        OperationKey::new("acme", "prod", "op-1")
    }

    fn servers() -> Vec<Server> {
        vec![Server::new(
            "node-1",
            "10.0.0.1".parse().unwrap(),
            ServerRole::Master,
        )]
    }

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([("NO_PROXY".to_string(), "localhost".to_string())])
    }

    fn runner() -> Arc<AgentRunner> {
        let config = RunnerConfig {
            local_addrs: ["10.0.0.1".parse().unwrap()].into_iter().collect(),
            binary: "anvil".into(),
            dial_timeout: Duration::from_millis(200),
        };
        let credentials = AgentCredentials {
            cert: Vec::new(),
            key: Vec::new(),
            ca: Vec::new(),
        };
        Arc::new(AgentRunner::new(config, credentials, Arc::new(UnreachableDialer)))
    }

    fn updater(operator: Arc<InMemoryOperator>) -> Updater {
        let registry = Arc::new(ExecutorRegistry::with_defaults(operator.clone()));
        Updater::new(key(), operator, runner(), registry)
            .with_servers(servers())
            .with_request(OperationRequest::UpdateEnvars { env: env() })
            .with_emitter(Arc::new(SilentProgress))
            .with_follow_config(FollowConfig {
                poll_interval: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                buffer: 16,
            })
    }

    #[tokio::test]
    async fn test_ensure_plan_builds_once() {
        let operator = Arc::new(InMemoryOperator::new());
        let updater = updater(operator.clone());

        let built = updater.ensure_plan().await.unwrap();
        assert!(!built.phases.is_empty());

        // The second call loads the stored plan instead of rebuilding.
        let loaded = updater.ensure_plan().await.unwrap();
        assert_eq!(built, loaded);
    }

    #[tokio::test]
    async fn test_ensure_plan_without_request_is_not_found() {
        let operator = Arc::new(InMemoryOperator::new());
        let registry = Arc::new(ExecutorRegistry::with_defaults(operator.clone()));
        let updater = Updater::new(key(), operator, runner(), registry)
            .with_emitter(Arc::new(SilentProgress));

        let err = updater.ensure_plan().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_run_completes_single_master_env_update() {
        let operator = Arc::new(InMemoryOperator::new());
        let updater = updater(operator.clone());

        updater.run(&CancellationToken::new()).await.unwrap();

        // The environment was rotated and the operation marked complete.
        assert_eq!(operator.runtime_env(&key()).unwrap(), env());
        assert_eq!(
            operator.operation_state(&key()).unwrap().state,
            OperationState::Completed
        );
    }

    struct FailingExecutor;

    #[async_trait]
    impl PhaseExecutor for FailingExecutor {
        async fn pre_check(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
            Err(OperationError::executor("/masters/node-1", "boom"))
        }
        async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
        async fn rollback(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
        fn span(&self) -> tracing::Span {
            tracing::info_span!("phase")
        }
    }

    #[tokio::test]
    async fn test_run_marks_operation_failed_on_phase_failure() {
        let operator = Arc::new(InMemoryOperator::new());
        let mut registry = ExecutorRegistry::new();
        registry.register(
            ExecutorKind::UpdateEnv,
            |_params: ExecutorParams, _remote: RemoteCapability| {
                Ok(Box::new(FailingExecutor) as Box<dyn PhaseExecutor>)
            },
        );
        let updater = Updater::new(key(), operator.clone(), runner(), Arc::new(registry))
            .with_servers(servers())
            .with_request(OperationRequest::UpdateEnvars { env: env() })
            .with_emitter(Arc::new(SilentProgress))
            .with_follow_config(FollowConfig {
                poll_interval: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                buffer: 16,
            });

        let err = updater.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, OperationError::Executor { .. }));

        let state = operator.operation_state(&key()).unwrap();
        assert_eq!(state.state, OperationState::Failed);
        assert!(state.message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_run_phase_addresses_whole_plan_with_slash() {
        let operator = Arc::new(InMemoryOperator::new());
        let updater = updater(operator.clone());
        updater.ensure_plan().await.unwrap();

        updater
            .run_phase(&CancellationToken::new(), WHOLE_PLAN, None, false)
            .await
            .unwrap();
        assert_eq!(operator.runtime_env(&key()).unwrap(), env());
    }

    #[tokio::test]
    async fn test_run_phase_times_out() {
        struct SlowExecutor;

        #[async_trait]
        impl PhaseExecutor for SlowExecutor {
            async fn pre_check(&self, _cancel: &CancellationToken) -> Result<()> {
                Ok(())
            }
            async fn execute(&self, _cancel: &CancellationToken) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            }
            async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
                Ok(())
            }
            async fn rollback(&self, _cancel: &CancellationToken) -> Result<()> {
                Ok(())
            }
            fn span(&self) -> tracing::Span {
                tracing::info_span!("phase")
            }
        }

        let operator = Arc::new(InMemoryOperator::new());
        let mut registry = ExecutorRegistry::new();
        registry.register(
            ExecutorKind::UpdateEnv,
            |_params: ExecutorParams, _remote: RemoteCapability| {
                Ok(Box::new(SlowExecutor) as Box<dyn PhaseExecutor>)
            },
        );
        let updater = Updater::new(key(), operator.clone(), runner(), Arc::new(registry))
            .with_servers(servers())
            .with_request(OperationRequest::UpdateEnvars { env: env() })
            .with_emitter(Arc::new(SilentProgress));
        updater.ensure_plan().await.unwrap();

        let err = updater
            .run_phase(
                &CancellationToken::new(),
                "/masters/node-1",
                Some(Duration::from_millis(50)),
                false,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not finish"));
    }

    #[tokio::test]
    async fn test_rollback_phase_requires_started_phase() {
        let operator = Arc::new(InMemoryOperator::new());
        let updater = updater(operator.clone());
        updater.ensure_plan().await.unwrap();

        let err = updater
            .rollback_phase(&CancellationToken::new(), "/masters/node-1", None, false)
            .await
            .unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
