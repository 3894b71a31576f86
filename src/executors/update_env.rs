//! Executor for the `update-env` phase: rotate the cluster runtime
//! environment to the variables carried in the phase data.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info};

use crate::errors::{OperationError, Result};
use crate::executors::{ExecutorParams, PhaseExecutor};
use crate::store::ClusterOperator;

pub struct UpdateEnvExecutor {
    params: ExecutorParams,
    operator: Arc<dyn ClusterOperator>,
}

impl UpdateEnvExecutor {
    pub fn new(params: ExecutorParams, operator: Arc<dyn ClusterOperator>) -> Self {
        Self { params, operator }
    }

    fn env(&self) -> Result<&BTreeMap<String, String>> {
        self.params
            .phase
            .data
            .as_ref()
            .and_then(|data| data.env.as_ref())
            .ok_or_else(|| {
                OperationError::bad_parameter(format!(
                    "phase {} carries no environment payload",
                    self.params.phase.id
                ))
            })
    }

    /// The environment in effect before this operation, when the builder
    /// recorded one. Without it the rotation cannot be undone.
    fn previous_env(&self) -> Option<BTreeMap<String, String>> {
        let params = self.params.phase.data.as_ref()?.params.as_ref()?;
        serde_json::from_value(params.get("previous")?.clone()).ok()
    }
}

#[async_trait]
impl PhaseExecutor for UpdateEnvExecutor {
    async fn pre_check(&self, _cancel: &CancellationToken) -> Result<()> {
        self.env()?;
        if let Some(server) = self.params.phase.target_server()
            && self.params.plan.server_by_addr(server.advertise_addr).is_none()
        {
            return Err(OperationError::bad_parameter(format!(
                "phase {} targets server {server} outside the plan",
                self.params.phase.id
            )));
        }
        Ok(())
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let env = self.env()?;
        self.params
            .progress
            .report(0, &format!("Updating runtime environment ({} variables)", env.len()));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OperationError::Cancelled),
            result = self.operator.rotate_runtime_config(&self.params.key, env) => result,
        };
        match result {
            Ok(()) => {
                info!(variables = env.len(), "runtime environment rotated");
                Ok(())
            }
            // The configuration is already in place from an earlier run.
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(OperationError::executor_with(
                &self.params.phase.id,
                "rotating the runtime environment",
                err.into(),
            )),
        }
    }

    async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(previous) = self.previous_env() else {
            return Err(OperationError::bad_parameter(format!(
                "phase {} has no previous environment recorded, cannot roll back",
                self.params.phase.id
            )));
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OperationError::Cancelled),
            result = self.operator.rotate_runtime_config(&self.params.key, &previous) => {
                result.map_err(|err| OperationError::executor_with(
                    &self.params.phase.id,
                    "restoring the previous runtime environment",
                    err.into(),
                ))
            }
        }
    }

    fn span(&self) -> Span {
        self.params.span()
    }
}
