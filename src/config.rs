//! Node-local configuration for the anvil orchestrator.
//!
//! Configuration is read from `anvil.toml` in the state directory, with
//! every field defaulted so a missing file yields a working single-node
//! setup. CLI flags override file values.
//!
//! # Configuration file format
//!
//! ```toml
//! [node]
//! state_dir = "/var/lib/anvil"
//! # Advertise addresses assigned to this host at install time. Phases
//! # targeting one of these run locally.
//! local_addrs = ["10.0.0.1"]
//!
//! [agents]
//! # Relative paths resolve against state_dir.
//! secrets_dir = "agents/secrets"
//! dial_timeout_secs = 5
//!
//! [store]
//! append_retries = 3
//!
//! [updater]
//! # Extra attempts for marking the operation complete; 0 leaves retries
//! # to the outer orchestration.
//! complete_retries = 0
//!
//! [follower]
//! poll_interval_ms = 1000
//! max_backoff_ms = 5000
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::RunnerConfig;
use crate::follow::FollowConfig;
use crate::store::RetryPolicy;

pub const CONFIG_FILE: &str = "anvil.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnvilConfig {
    pub node: NodeConfig,
    pub agents: AgentsConfig,
    pub store: StoreConfig,
    pub updater: UpdaterConfig,
    pub follower: FollowerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root of the node-local state
    pub state_dir: PathBuf,
    /// Advertise addresses belonging to this host
    pub local_addrs: Vec<IpAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/anvil"),
            local_addrs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Directory holding agent TLS material; relative to the state dir
    pub secrets_dir: PathBuf,
    /// Deadline for the agent dial probe
    pub dial_timeout_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            secrets_dir: PathBuf::from("agents/secrets"),
            dial_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Attempts for changelog appends and plan reads
    pub append_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { append_retries: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Extra attempts for completing the operation; 0 means a single try
    pub complete_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowerConfig {
    pub poll_interval_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_backoff_ms: 5_000,
        }
    }
}

impl AnvilConfig {
    /// Load the configuration from `<state_dir>/anvil.toml`, falling back
    /// to defaults when the file does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.node.state_dir = state_dir.to_path_buf();
        Ok(config)
    }

    /// Write the configuration to `<state_dir>/anvil.toml`.
    pub fn save(&self) -> Result<()> {
        let path = self.node.state_dir.join(CONFIG_FILE);
        std::fs::create_dir_all(&self.node.state_dir)
            .with_context(|| format!("failed to create {}", self.node.state_dir.display()))?;
        let content = toml::to_string_pretty(self).context("failed to encode configuration")?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Absolute path of the agent secrets directory.
    pub fn secrets_path(&self) -> PathBuf {
        if self.agents.secrets_dir.is_absolute() {
            self.agents.secrets_dir.clone()
        } else {
            self.node.state_dir.join(&self.agents.secrets_dir)
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            local_addrs: self.node.local_addrs.iter().copied().collect(),
            dial_timeout: Duration::from_secs(self.agents.dial_timeout_secs),
            ..RunnerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.store.append_retries.max(1))
    }

    pub fn follow_config(&self) -> FollowConfig {
        FollowConfig {
            poll_interval: Duration::from_millis(self.follower.poll_interval_ms),
            max_backoff: Duration::from_millis(self.follower.max_backoff_ms),
            ..FollowConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = AnvilConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.node.state_dir, dir.path());
        assert_eq!(config.store.append_retries, 3);
        assert_eq!(config.updater.complete_retries, 0);
        assert_eq!(config.follower.poll_interval_ms, 1_000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"
[node]
local_addrs = ["10.0.0.1"]

[updater]
complete_retries = 2
"#,
        )
        .unwrap();

        let config = AnvilConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.node.local_addrs, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.updater.complete_retries, 2);
        // Untouched sections fall back to defaults.
        assert_eq!(config.agents.dial_timeout_secs, 5);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempdir().unwrap();
        let mut config = AnvilConfig::load_or_default(dir.path()).unwrap();
        config.node.local_addrs = vec!["10.0.0.7".parse().unwrap()];
        config.save().unwrap();

        let loaded = AnvilConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.node.local_addrs, config.node.local_addrs);
    }

    #[test]
    fn test_relative_secrets_dir_resolves_under_state_dir() {
        let dir = tempdir().unwrap();
        let config = AnvilConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.secrets_path(), dir.path().join("agents/secrets"));
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "not [valid toml").unwrap();
        assert!(AnvilConfig::load_or_default(dir.path()).is_err());
    }
}
