//! Core entities of an operation plan.
//!
//! This module provides:
//! - `Server` - a cluster node, immutable for the lifetime of an operation
//! - `PhaseState` - the per-phase state machine states
//! - `ExecutorKind` - the closed set of phase executor tags
//! - `OperationPhase` / `OperationPlan` - the hierarchical plan tree
//!
//! Phases reference their prerequisites by sibling ID string, not by
//! pointer, which keeps the plan acyclic and trivially serializable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Cluster role of a server. Masters are updated before nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Master,
    Node,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// A cluster node participating in an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Operation-stable identifier
    pub id: String,
    /// Node hostname
    pub hostname: String,
    /// Advertised peer address, unique per cluster
    pub advertise_addr: IpAddr,
    /// Cluster role
    pub role: ServerRole,
    /// Local state directory on the node
    #[serde(default)]
    pub state_dir: PathBuf,
    /// Whether the node runs with SELinux enforcement
    #[serde(default)]
    pub selinux: bool,
    /// Docker device-mapper device, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_device: Option<String>,
}

impl Server {
    /// Create a server with the fields every operation needs.
    pub fn new(hostname: &str, advertise_addr: IpAddr, role: ServerRole) -> Self {
        Self {
            id: hostname.to_string(),
            hostname: hostname.to_string(),
            advertise_addr,
            role,
            state_dir: PathBuf::new(),
            selinux: false,
            docker_device: None,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == ServerRole::Master
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.hostname, self.advertise_addr)
    }
}

/// State of a single phase.
///
/// Allowed transitions:
/// Unstarted -> InProgress -> {Completed, Failed};
/// Failed -> InProgress (retry); Completed -> InProgress (forced re-run);
/// {Completed, Failed, InProgress} -> InProgress -> RolledBack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl PhaseState {
    /// Check whether the phase has ever been started.
    pub fn has_started(&self) -> bool {
        !matches!(self, Self::Unstarted)
    }

    /// Check whether the phase finished successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack)
    }

    /// States a rollback traversal skips over.
    pub fn is_rollback_exempt(&self) -> bool {
        matches!(self, Self::Unstarted | Self::RolledBack)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        write!(f, "{s}")
    }
}

/// The closed set of phase executor tags.
///
/// The tags are stable strings referenced by persisted plans and by
/// user-facing CLIs; adding a variant is backward compatible, renaming one
/// is an operator-visible change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    Bootstrap,
    Pull,
    System,
    Wait,
    Rbac,
    Resources,
    Export,
    Runtime,
    App,
    Election,
    Drain,
    UpdateConfig,
    RestartContainer,
    Taint,
    Untaint,
    Uncordon,
    Endpoints,
    Coredns,
    Openebs,
    UpdateEnv,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Pull => "pull",
            Self::System => "system",
            Self::Wait => "wait",
            Self::Rbac => "rbac",
            Self::Resources => "resources",
            Self::Export => "export",
            Self::Runtime => "runtime",
            Self::App => "app",
            Self::Election => "election",
            Self::Drain => "drain",
            Self::UpdateConfig => "update-config",
            Self::RestartContainer => "restart-container",
            Self::Taint => "taint",
            Self::Untaint => "untaint",
            Self::Uncordon => "uncordon",
            Self::Endpoints => "endpoints",
            Self::Coredns => "coredns",
            Self::Openebs => "openebs",
            Self::UpdateEnv => "update-env",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bootstrap" => Ok(Self::Bootstrap),
            "pull" => Ok(Self::Pull),
            "system" => Ok(Self::System),
            "wait" => Ok(Self::Wait),
            "rbac" => Ok(Self::Rbac),
            "resources" => Ok(Self::Resources),
            "export" => Ok(Self::Export),
            "runtime" => Ok(Self::Runtime),
            "app" => Ok(Self::App),
            "election" => Ok(Self::Election),
            "drain" => Ok(Self::Drain),
            "update-config" => Ok(Self::UpdateConfig),
            "restart-container" => Ok(Self::RestartContainer),
            "taint" => Ok(Self::Taint),
            "untaint" => Ok(Self::Untaint),
            "uncordon" => Ok(Self::Uncordon),
            "endpoints" => Ok(Self::Endpoints),
            "coredns" => Ok(Self::Coredns),
            "openebs" => Ok(Self::Openebs),
            "update-env" => Ok(Self::UpdateEnv),
            other => Err(format!("unknown executor tag: {other}")),
        }
    }
}

/// Operation-specific payload attached to a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseData {
    /// Target server for the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,
    /// Target package or artifact reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    /// Environment variables being rolled out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    /// Free-form operation parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl PhaseData {
    pub fn for_server(server: Server) -> Self {
        Self {
            server: Some(server),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package = Some(package.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// A node in the plan tree.
///
/// Leaf phases carry an executor tag; composite phases have children only
/// and derive their state from their leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPhase {
    /// Absolute hierarchical path, e.g. `/masters/node-1/restart`
    pub id: String,
    /// Human-readable description
    pub description: String,
    /// Executor tag; None iff the phase is composite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorKind>,
    /// Operation-specific payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PhaseData>,
    /// Sibling phase IDs that must be Completed before this phase starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Ordered child phases
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<OperationPhase>,
    /// Current state
    #[serde(default)]
    pub state: PhaseState,
    /// Timestamp of the last state change
    pub updated: DateTime<Utc>,
    /// Error report for a Failed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether children of this composite may run concurrently
    #[serde(default)]
    pub parallel: bool,
}

impl OperationPhase {
    /// Create an unstarted phase with the given ID and description.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            executor: None,
            data: None,
            requires: Vec::new(),
            phases: Vec::new(),
            state: PhaseState::Unstarted,
            updated: Utc::now(),
            error: None,
            parallel: false,
        }
    }

    /// Check whether this phase has no children.
    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty()
    }

    /// The target server named by this phase's data, if any.
    pub fn target_server(&self) -> Option<&Server> {
        self.data.as_ref().and_then(|d| d.server.as_ref())
    }

    /// The last path segment of the phase ID.
    pub fn name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// Type of a cluster lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    Install,
    UpdateEnvars,
    UpdateConfig,
    RuntimeUpgrade,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Install => "install",
            Self::UpdateEnvars => "update-envars",
            Self::UpdateConfig => "update-config",
            Self::RuntimeUpgrade => "runtime-upgrade",
        };
        write!(f, "{s}")
    }
}

/// Identifies one operation on one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub account: String,
    pub cluster: String,
    pub operation_id: String,
}

impl OperationKey {
    pub fn new(
        account: impl Into<String>,
        cluster: impl Into<String>,
        operation_id: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            cluster: cluster.into(),
            operation_id: operation_id.into(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.cluster, self.operation_id)
    }
}

/// Root container describing all work for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPlan {
    /// Operation key (account, cluster, operation ID)
    pub key: OperationKey,
    /// Type of the operation this plan drives
    pub operation_type: OperationType,
    /// Name of the cluster being operated on
    pub cluster_name: String,
    /// All servers participating in the operation
    pub servers: Vec<Server>,
    /// Ordered top-level phases
    pub phases: Vec<OperationPhase>,
    /// The server this plan must be driven from, when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_coordinator: Option<Server>,
    /// Plan creation time
    pub created: DateTime<Utc>,
}

impl OperationPlan {
    /// Look up a participating server by hostname.
    pub fn server_by_hostname(&self, hostname: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.hostname == hostname)
    }

    /// Look up a participating server by advertise address.
    pub fn server_by_addr(&self, addr: IpAddr) -> Option<&Server> {
        self.servers.iter().find(|s| s.advertise_addr == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(hostname: &str, addr: &str, role: ServerRole) -> Server {
        Server::new(hostname, addr.parse().unwrap(), role)
    }

    #[test]
    fn test_phase_state_predicates() {
        assert!(!PhaseState::Unstarted.has_started());
        assert!(PhaseState::InProgress.has_started());
        assert!(PhaseState::Completed.is_completed());
        assert!(PhaseState::Unstarted.is_rollback_exempt());
        assert!(PhaseState::RolledBack.is_rollback_exempt());
        assert!(!PhaseState::Failed.is_rollback_exempt());
    }

    #[test]
    fn test_executor_kind_round_trip() {
        for kind in [
            ExecutorKind::Bootstrap,
            ExecutorKind::UpdateEnv,
            ExecutorKind::RestartContainer,
            ExecutorKind::Coredns,
        ] {
            let parsed: ExecutorKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("not-a-tag".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn test_executor_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&ExecutorKind::UpdateEnv).unwrap();
        assert_eq!(json, "\"update-env\"");
        let json = serde_json::to_string(&ExecutorKind::RestartContainer).unwrap();
        assert_eq!(json, "\"restart-container\"");

        // Unknown tags fail at deserialization, not execution.
        let err = serde_json::from_str::<ExecutorKind>("\"fix-everything\"");
        assert!(err.is_err());
    }

    #[test]
    fn test_phase_serialization_round_trip() {
        let mut phase = OperationPhase::new("/masters/node-1", "Update node-1");
        phase.executor = Some(ExecutorKind::UpdateEnv);
        phase.data = Some(PhaseData::for_server(server(
            "node-1",
            "10.0.0.1",
            ServerRole::Master,
        )));
        phase.requires = vec!["/init".to_string()];

        let json = serde_json::to_string(&phase).unwrap();
        let parsed: OperationPhase = serde_json::from_str(&json).unwrap();
        assert_eq!(phase, parsed);
    }

    #[test]
    fn test_phase_deserialization_defaults() {
        let json = r#"{
            "id": "/init",
            "description": "Initialize the operation",
            "updated": "2026-07-01T12:00:00Z"
        }"#;
        let phase: OperationPhase = serde_json::from_str(json).unwrap();
        assert_eq!(phase.state, PhaseState::Unstarted);
        assert!(phase.requires.is_empty());
        assert!(phase.phases.is_empty());
        assert!(!phase.parallel);
        assert!(phase.is_leaf());
    }

    #[test]
    fn test_phase_name_is_last_segment() {
        let phase = OperationPhase::new("/masters/node-1/restart", "Restart node-1");
        assert_eq!(phase.name(), "restart");
        let root = OperationPhase::new("/init", "Initialize");
        assert_eq!(root.name(), "init");
    }

    #[test]
    fn test_server_lookup() {
        let plan = OperationPlan {
            key: OperationKey::new("acme", "prod", "op-1"),
            operation_type: OperationType::UpdateEnvars,
            cluster_name: "prod".to_string(),
            servers: vec![
                server("node-1", "10.0.0.1", ServerRole::Master),
                server("node-2", "10.0.0.2", ServerRole::Node),
            ],
            phases: Vec::new(),
            offline_coordinator: None,
            created: Utc::now(),
        };

        assert!(plan.server_by_hostname("node-2").is_some());
        assert!(plan.server_by_hostname("node-9").is_none());
        assert_eq!(
            plan.server_by_addr("10.0.0.1".parse().unwrap()).unwrap().hostname,
            "node-1"
        );
    }

    #[test]
    fn test_operation_key_display() {
        let key = OperationKey::new("acme", "prod", "op-1");
        assert_eq!(key.to_string(), "acme/prod/op-1");
    }
}
