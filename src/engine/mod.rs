//! The operation plan engine.
//!
//! Drives a plan phase by phase: re-reads the resolved plan between
//! phases, verifies prerequisites, decides where each leaf executes,
//! invokes the phase executor, and appends every observable state
//! transition to the changelog. The engine never mutates the stored plan
//! directly; the changelog is the only write path for phase state.
//!
//! Composite phases execute their children sequentially in declared order,
//! or concurrently when the phase is marked parallel. In parallel mode one
//! task per subphase is spawned, errors are collected through a bounded
//! channel, the first error observed becomes the operation's error, and
//! every child is awaited before returning.

mod hooks;

pub use hooks::{PhaseHook, ProgressHook};

use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

use crate::agent::{AgentRunner, ExecutionLocation};
use crate::errors::{OperationError, Result};
use crate::executors::{
    ExecutorParams, ExecutorRegistry, ProgressReporter, RemoteCapability, SilentProgress,
};
use crate::plan::query::{ancestor_ids, can_rollback, find_phase, flatten_leaves};
use crate::plan::{OperationKey, OperationPhase, OperationPlan, PhaseState, PlanChange, Server};
use crate::store::{ClusterOperator, RetryPolicy, resolved_plan, retry_transient};

/// Parameters for executing or rolling back a single phase.
#[derive(Debug, Clone)]
pub struct PhaseParams {
    /// Absolute ID of the phase
    pub phase_id: String,
    /// Re-run completed phases and ignore unmet prerequisites
    pub force: bool,
    /// Treat in-progress phases as resumable
    pub resume: bool,
}

impl PhaseParams {
    pub fn new(phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: phase_id.into(),
            force: false,
            resume: false,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Executes and rolls back operation plans.
///
/// Cheap to clone; every field is shared. A clone per spawned subphase
/// task keeps the parallel path free of lifetimes.
#[derive(Clone)]
pub struct Engine {
    key: OperationKey,
    operator: Arc<dyn ClusterOperator>,
    registry: Arc<ExecutorRegistry>,
    runner: Arc<AgentRunner>,
    progress: Arc<dyn ProgressReporter>,
    pre_exec: Option<Arc<dyn PhaseHook>>,
    post_exec: Option<Arc<dyn PhaseHook>>,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(
        key: OperationKey,
        operator: Arc<dyn ClusterOperator>,
        registry: Arc<ExecutorRegistry>,
        runner: Arc<AgentRunner>,
    ) -> Self {
        Self {
            key,
            operator,
            registry,
            runner,
            progress: Arc::new(SilentProgress),
            pre_exec: None,
            post_exec: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the sink for user-facing progress messages.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_pre_exec_hook(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.pre_exec = Some(hook);
        self
    }

    pub fn with_post_exec_hook(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.post_exec = Some(hook);
        self
    }

    /// Set the retry schedule for changelog appends and plan reads.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Execute the whole plan: top-level phases in order, resuming
    /// wherever a previous run stopped.
    pub async fn execute_plan(&self, cancel: &CancellationToken) -> Result<()> {
        let plan = self.load_plan().await?;
        self.check_coordinator(&plan)?;
        for phase in &plan.phases {
            self.execute_phase(
                cancel,
                PhaseParams::new(&phase.id).with_resume(true),
            )
            .await?;
        }
        Ok(())
    }

    /// Execute a single phase and its subphases.
    pub fn execute_phase<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        params: PhaseParams,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(OperationError::Cancelled);
            }
            let plan = self.load_plan().await?;
            let phase = find_phase(&plan, &params.phase_id)?.clone();

            // Completed phases are idempotent unless forced.
            if phase.state.is_completed() && !params.force {
                debug!(phase_id = %phase.id, "phase already completed");
                return Ok(());
            }
            if phase.state.is_in_progress() && !params.force && !params.resume && phase.is_leaf() {
                return Err(OperationError::bad_parameter(format!(
                    "phase {} is in progress; pass --force to re-run it",
                    phase.id
                )));
            }

            self.check_prerequisites(&plan, &phase.id, params.force)?;

            if let Some(hook) = &self.pre_exec {
                hook.on_phase(&plan, &phase).await?;
            }

            let result = if phase.is_leaf() {
                self.execute_leaf(cancel, &plan, &phase).await
            } else {
                if params.force {
                    return Err(OperationError::bad_parameter(format!(
                        "phase {} has subphases, force an individual subphase instead",
                        phase.id
                    )));
                }
                if phase.parallel {
                    self.execute_subphases_parallel(cancel, &phase, params.resume)
                        .await
                } else {
                    self.execute_subphases_sequential(cancel, &phase, params.resume)
                        .await
                }
            };
            result?;

            if let Some(hook) = &self.post_exec {
                let plan = self.load_plan().await?;
                let phase = find_phase(&plan, &params.phase_id)?.clone();
                hook.on_phase(&plan, &phase).await?;
            }
            Ok(())
        })
    }

    async fn execute_subphases_sequential(
        &self,
        cancel: &CancellationToken,
        phase: &OperationPhase,
        resume: bool,
    ) -> Result<()> {
        for child in &phase.phases {
            self.execute_phase(cancel, PhaseParams::new(&child.id).with_resume(resume))
                .await?;
        }
        Ok(())
    }

    /// Run subphases concurrently. The first error observed is surfaced;
    /// the remaining errors are logged with the composite phase ID. All
    /// children are awaited regardless of failures.
    async fn execute_subphases_parallel(
        &self,
        cancel: &CancellationToken,
        phase: &OperationPhase,
        resume: bool,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Result<()>>(phase.phases.len().max(1));
        let mut tasks = Vec::with_capacity(phase.phases.len());
        for child in &phase.phases {
            let engine = self.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let params = PhaseParams::new(&child.id).with_resume(resume);
            tasks.push(tokio::spawn(async move {
                let result = engine.execute_phase(&cancel, params).await;
                tx.send(result).await.ok();
            }));
        }
        drop(tx);

        let mut first_error = None;
        while let Some(result) = rx.recv().await {
            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    debug!(phase_id = %phase.id, error = %err, "additional subphase failure");
                }
            }
        }
        for task in tasks {
            task.await.ok();
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn execute_leaf(
        &self,
        cancel: &CancellationToken,
        plan: &OperationPlan,
        phase: &OperationPhase,
    ) -> Result<()> {
        // Cluster-level phases carry no target and run wherever the plan
        // is driven.
        let Some(server) = phase.target_server() else {
            return self.execute_leaf_locally(cancel, plan, phase).await;
        };
        match self.runner.execution_location(cancel, server).await? {
            ExecutionLocation::Local => self.execute_leaf_locally(cancel, plan, phase).await,
            ExecutionLocation::Remote => {
                self.execute_leaf_remotely(cancel, plan, phase, server).await
            }
            ExecutionLocation::RemoteRequired => Err(self.remote_required(phase)),
        }
    }

    async fn execute_leaf_locally(
        &self,
        cancel: &CancellationToken,
        plan: &OperationPlan,
        phase: &OperationPhase,
    ) -> Result<()> {
        let executor = self.registry.get(
            ExecutorParams {
                key: self.key.clone(),
                plan: Arc::new(plan.clone()),
                phase: phase.clone(),
                progress: self.progress.clone(),
            },
            RemoteCapability::with_runner(self.runner.clone()),
        )?;

        self.emit(plan, &phase.id, PhaseState::InProgress, None).await?;
        info!(phase_id = %phase.id, "executing phase");

        let span = executor.span();
        let result = async {
            executor.pre_check(cancel).await?;
            executor.execute(cancel).await?;
            executor.post_check(cancel).await
        }
        .instrument(span)
        .await;

        match result {
            Ok(()) => {
                // A cancelled context must not produce a Completed change.
                if cancel.is_cancelled() {
                    return Err(OperationError::Cancelled);
                }
                self.emit(plan, &phase.id, PhaseState::Completed, None).await?;
                Ok(())
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                self.emit(
                    plan,
                    &phase.id,
                    PhaseState::Failed,
                    Some(err.changelog_message()),
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn execute_leaf_remotely(
        &self,
        cancel: &CancellationToken,
        plan: &OperationPlan,
        phase: &OperationPhase,
        server: &Server,
    ) -> Result<()> {
        info!(phase_id = %phase.id, server = %server, "executing phase on remote agent");
        let args = self.phase_command("execute", &phase.id);
        self.runner.run(cancel, server, &args).await?;
        // The remote node appends to its own changelog view; mirror the
        // completion locally so this driver's snapshot converges.
        self.emit(plan, &phase.id, PhaseState::Completed, None).await
    }

    /// Roll the plan back: leaves in reverse order, skipping those that
    /// never started or were already rolled back. Returns the IDs that
    /// were (or, in dry-run mode, would be) rolled back.
    pub async fn rollback_plan(
        &self,
        cancel: &CancellationToken,
        force: bool,
        dry_run: bool,
    ) -> Result<Vec<String>> {
        let plan = self.load_plan().await?;
        self.check_coordinator(&plan)?;

        let targets: Vec<String> = flatten_leaves(&plan)
            .iter()
            .rev()
            .filter(|leaf| !leaf.state.is_rollback_exempt())
            .map(|leaf| leaf.id.clone())
            .collect();

        if dry_run {
            return Ok(targets);
        }
        for phase_id in &targets {
            self.rollback_phase(cancel, PhaseParams::new(phase_id).with_force(force))
                .await?;
        }
        Ok(targets)
    }

    /// Roll back a single phase. Composite phases roll their children
    /// back in reverse order; leaves validate against the dependent set
    /// first.
    pub fn rollback_phase<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        params: PhaseParams,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(OperationError::Cancelled);
            }
            let plan = self.load_plan().await?;
            let phase = find_phase(&plan, &params.phase_id)?.clone();

            if !phase.is_leaf() {
                for child in phase.phases.iter().rev() {
                    if child.state.is_rollback_exempt() {
                        continue;
                    }
                    self.rollback_phase(
                        cancel,
                        PhaseParams::new(&child.id).with_force(params.force),
                    )
                    .await?;
                }
                return Ok(());
            }

            can_rollback(&plan, &phase.id, params.force)?;

            let Some(server) = phase.target_server() else {
                return self.rollback_leaf_locally(cancel, &plan, &phase).await;
            };
            match self.runner.execution_location(cancel, server).await? {
                ExecutionLocation::Local => {
                    self.rollback_leaf_locally(cancel, &plan, &phase).await
                }
                ExecutionLocation::Remote => {
                    let args = self.phase_command("rollback", &phase.id);
                    self.runner.run(cancel, server, &args).await?;
                    self.emit(&plan, &phase.id, PhaseState::RolledBack, None).await
                }
                ExecutionLocation::RemoteRequired => Err(self.remote_required(&phase)),
            }
        })
    }

    async fn rollback_leaf_locally(
        &self,
        cancel: &CancellationToken,
        plan: &OperationPlan,
        phase: &OperationPhase,
    ) -> Result<()> {
        let executor = self.registry.get(
            ExecutorParams {
                key: self.key.clone(),
                plan: Arc::new(plan.clone()),
                phase: phase.clone(),
                progress: self.progress.clone(),
            },
            RemoteCapability::with_runner(self.runner.clone()),
        )?;

        self.emit(plan, &phase.id, PhaseState::InProgress, None).await?;
        info!(phase_id = %phase.id, "rolling back phase");

        match executor.rollback(cancel).instrument(executor.span()).await {
            Ok(()) => {
                if cancel.is_cancelled() {
                    return Err(OperationError::Cancelled);
                }
                self.emit(plan, &phase.id, PhaseState::RolledBack, None).await
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                self.emit(
                    plan,
                    &phase.id,
                    PhaseState::Failed,
                    Some(err.changelog_message()),
                )
                .await?;
                Err(err)
            }
        }
    }

    /// Verify that every requirement of the phase and of its ancestors is
    /// completed. Overridable with force.
    fn check_prerequisites(
        &self,
        plan: &OperationPlan,
        phase_id: &str,
        force: bool,
    ) -> Result<()> {
        if force {
            return Ok(());
        }
        let mut lineage = ancestor_ids(phase_id);
        lineage.push(phase_id.to_string());
        for id in lineage {
            let phase = find_phase(plan, &id)?;
            for requirement in &phase.requires {
                let required = find_phase(plan, requirement)?;
                if !required.state.is_completed() {
                    return Err(OperationError::precondition_failed(format!(
                        "phase {} requires {} which is {} (complete it first or use --force)",
                        phase.id, required.id, required.state
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_coordinator(&self, plan: &OperationPlan) -> Result<()> {
        let Some(coordinator) = &plan.offline_coordinator else {
            return Ok(());
        };
        if self.runner.is_local(coordinator) {
            return Ok(());
        }
        Err(OperationError::bad_parameter(format!(
            "operation {} must be driven from its coordinator {} ({}); \
             connect to that node and re-run the command there",
            self.key.operation_id, coordinator.hostname, coordinator.advertise_addr
        )))
    }

    fn remote_required(&self, phase: &OperationPhase) -> OperationError {
        let target = phase
            .target_server()
            .map(|s| format!("{} ({})", s.hostname, s.advertise_addr))
            .unwrap_or_else(|| "the target node".to_string());
        OperationError::not_found(format!(
            "phase {} can only run on {target}: connect to that node and run \
             `anvil plan execute --phase {} --operation-id {}` there",
            phase.id, phase.id, self.key.operation_id
        ))
    }

    fn phase_command(&self, verb: &str, phase_id: &str) -> Vec<String> {
        vec![
            "plan".to_string(),
            verb.to_string(),
            "--phase".to_string(),
            phase_id.to_string(),
            "--operation-id".to_string(),
            self.key.operation_id.clone(),
        ]
    }

    async fn load_plan(&self) -> Result<OperationPlan> {
        retry_transient(self.retry, || resolved_plan(&self.operator, &self.key)).await
    }

    /// Append one state transition, retrying transient store failures with
    /// the same change ID. A failed append is fatal for the phase.
    async fn emit(
        &self,
        plan: &OperationPlan,
        phase_id: &str,
        state: PhaseState,
        error: Option<String>,
    ) -> Result<()> {
        let change = PlanChange::new(plan, phase_id, state, error);
        retry_transient(self.retry, || {
            let change = change.clone();
            async move { self.operator.create_plan_change(&self.key, &change).await }
        })
        .await
    }
}
