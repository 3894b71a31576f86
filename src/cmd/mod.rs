//! CLI command implementations.
//!
//! Each submodule owns one group of `PlanCommands` variants:
//!
//! | Module   | Commands handled                          |
//! |----------|-------------------------------------------|
//! | `plan`   | `Display`, `Execute`, `Rollback`, `Complete` |
//! | `follow` | `Follow`                                  |

pub mod follow;
pub mod plan;

pub use follow::cmd_follow;
pub use plan::{cmd_complete, cmd_display, cmd_execute, cmd_rollback};

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use anvil::agent::{AgentCredentials, AgentRunner, UnreachableDialer};
use anvil::config::AnvilConfig;
use anvil::plan::OperationKey;
use anvil::store::{ClusterOperator, FileOperator};

/// Build the file-backed operator for this node's state directory.
pub fn operator(config: &AnvilConfig) -> Arc<FileOperator> {
    Arc::new(FileOperator::new(&config.node.state_dir))
}

/// Resolve the operation to act on: an explicit ID, or the most recently
/// touched operation in the state directory.
pub async fn operation_key(
    store: &Arc<FileOperator>,
    config: &AnvilConfig,
    operation_id: Option<&str>,
) -> Result<OperationKey> {
    let id = match operation_id {
        Some(id) => id.to_string(),
        None => latest_operation_id(&config.node.state_dir)?,
    };
    // The stored plan carries the authoritative key.
    let probe = OperationKey::new("local", "local", &id);
    let plan = store
        .get_operation_plan(&probe)
        .await
        .with_context(|| format!("no stored plan for operation {id}"))?;
    Ok(plan.key)
}

fn latest_operation_id(state_dir: &Path) -> Result<String> {
    let operations = state_dir.join("operations");
    if !operations.exists() {
        bail!(
            "no operations found under {}; pass --operation-id",
            state_dir.display()
        );
    }
    let mut candidates: Vec<(std::time::SystemTime, String)> = Vec::new();
    for entry in std::fs::read_dir(&operations)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        candidates.push((modified, entry.file_name().to_string_lossy().into_owned()));
    }
    candidates.sort();
    match candidates.pop() {
        Some((_, id)) => Ok(id),
        None => bail!(
            "no operations found under {}; pass --operation-id",
            operations.display()
        ),
    }
}

/// Build the agent runner from the node configuration. Missing agent
/// credentials only matter once a remote dial happens, so they degrade to
/// empty material here.
pub fn runner(config: &AnvilConfig) -> Arc<AgentRunner> {
    let credentials = match AgentCredentials::load(&config.secrets_path()) {
        Ok(credentials) => credentials,
        Err(err) => {
            debug!(error = %err, "agent credentials unavailable, remote dispatch disabled");
            AgentCredentials {
                cert: Vec::new(),
                key: Vec::new(),
                ca: Vec::new(),
            }
        }
    };
    Arc::new(AgentRunner::new(
        config.runner_config(),
        credentials,
        Arc::new(UnreachableDialer),
    ))
}

/// Cancellation token wired to Ctrl-C.
pub fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}
