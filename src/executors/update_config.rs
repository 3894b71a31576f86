//! Executor for the `update-config` phase: apply a cluster configuration
//! payload through the operator.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info};

use crate::errors::{OperationError, Result};
use crate::executors::{ExecutorParams, PhaseExecutor};
use crate::store::ClusterOperator;

pub struct UpdateConfigExecutor {
    params: ExecutorParams,
    operator: Arc<dyn ClusterOperator>,
}

impl UpdateConfigExecutor {
    pub fn new(params: ExecutorParams, operator: Arc<dyn ClusterOperator>) -> Self {
        Self { params, operator }
    }

    fn payload(&self) -> Result<&serde_json::Value> {
        self.params
            .phase
            .data
            .as_ref()
            .and_then(|data| data.params.as_ref())
            .ok_or_else(|| {
                OperationError::bad_parameter(format!(
                    "phase {} carries no configuration payload",
                    self.params.phase.id
                ))
            })
    }

    fn previous(&self) -> Option<&serde_json::Value> {
        self.payload().ok()?.get("previous")
    }

    fn desired(&self) -> Result<serde_json::Value> {
        let payload = self.payload()?;
        // Payloads recorded with rollback support keep the desired
        // configuration under "config"; bare payloads are applied as-is.
        Ok(payload.get("config").cloned().unwrap_or_else(|| payload.clone()))
    }
}

#[async_trait]
impl PhaseExecutor for UpdateConfigExecutor {
    async fn pre_check(&self, _cancel: &CancellationToken) -> Result<()> {
        self.payload().map(|_| ())
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<()> {
        let config = self.desired()?;
        self.params.progress.report(0, "Applying cluster configuration");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OperationError::Cancelled),
            result = self.operator.update_cluster_config(&self.params.key, &config) => result,
        };
        match result {
            Ok(()) => {
                info!("cluster configuration applied");
                Ok(())
            }
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(OperationError::executor_with(
                &self.params.phase.id,
                "applying the cluster configuration",
                err.into(),
            )),
        }
    }

    async fn post_check(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(previous) = self.previous().cloned() else {
            return Err(OperationError::bad_parameter(format!(
                "phase {} has no previous configuration recorded, cannot roll back",
                self.params.phase.id
            )));
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OperationError::Cancelled),
            result = self.operator.update_cluster_config(&self.params.key, &previous) => {
                result.map_err(|err| OperationError::executor_with(
                    &self.params.phase.id,
                    "restoring the previous cluster configuration",
                    err.into(),
                ))
            }
        }
    }

    fn span(&self) -> Span {
        self.params.span()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::SilentProgress;
    use crate::plan::model::{
        ExecutorKind, OperationKey, OperationPhase, OperationPlan, OperationType, PhaseData,
    };
    use crate::store::InMemoryOperator;
    use chrono::Utc;

    fn executor_with(
        params_json: Option<serde_json::Value>,
    ) -> (UpdateConfigExecutor, Arc<InMemoryOperator>) {
        let mut phase = OperationPhase::new("/masters/node-1", "Apply configuration");
        phase.executor = Some(ExecutorKind::UpdateConfig);
        phase.data = params_json.map(|p| PhaseData::default().with_params(p));
        let plan = OperationPlan {
            key: OperationKey::new("acme", "prod", "op-1"),
            operation_type: OperationType::UpdateConfig,
            cluster_name: "prod".to_string(),
            servers: Vec::new(),
            phases: vec![phase.clone()],
            offline_coordinator: None,
            created: Utc::now(),
        };
        let operator = Arc::new(InMemoryOperator::new());
        let params = ExecutorParams {
            key: plan.key.clone(),
            plan: Arc::new(plan),
            phase,
            progress: Arc::new(SilentProgress),
        };
        (UpdateConfigExecutor::new(params, operator.clone()), operator)
    }

    #[tokio::test]
    async fn test_execute_applies_bare_payload() {
        let payload = serde_json::json!({ "pods-cidr": "10.244.0.0/16" });
        let (executor, operator) = executor_with(Some(payload.clone()));

        executor.execute(&CancellationToken::new()).await.unwrap();

        let key = OperationKey::new("acme", "prod", "op-1");
        assert_eq!(operator.cluster_config(&key).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_execute_unwraps_config_envelope() {
        let payload = serde_json::json!({
            "config": { "pods-cidr": "10.244.0.0/16" },
            "previous": { "pods-cidr": "10.2.0.0/16" },
        });
        let (executor, operator) = executor_with(Some(payload));
        let cancel = CancellationToken::new();

        executor.execute(&cancel).await.unwrap();
        let key = OperationKey::new("acme", "prod", "op-1");
        assert_eq!(
            operator.cluster_config(&key).unwrap(),
            serde_json::json!({ "pods-cidr": "10.244.0.0/16" })
        );

        executor.rollback(&cancel).await.unwrap();
        assert_eq!(
            operator.cluster_config(&key).unwrap(),
            serde_json::json!({ "pods-cidr": "10.2.0.0/16" })
        );
    }

    #[tokio::test]
    async fn test_missing_payload_fails_pre_check() {
        let (executor, _) = executor_with(None);
        let err = executor.pre_check(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_bad_parameter());
    }

    #[tokio::test]
    async fn test_rollback_without_previous_is_bad_parameter() {
        let (executor, _) = executor_with(Some(serde_json::json!({ "a": 1 })));
        let err = executor.rollback(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
