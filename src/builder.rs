//! Construction of operation plans.
//!
//! Two layers:
//! - `PhaseBuilder` / `PlanBuilder` - fluent assembly of a phase tree with
//!   relative names, absolute-ID resolution, and structural validation
//! - operation-specific constructors (`update_envars_plan`,
//!   `update_config_plan`, `runtime_upgrade_plan`, `install_plan`) encoding
//!   the ordering policies: masters before nodes, sequential within a role
//!   group, leader-election stepdown around master restarts
//!
//! Building the same plan for the same input is deterministic: phase order
//! follows the server list order and IDs derive only from hostnames and
//! fixed segment names.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::errors::{OperationError, Result};
use crate::plan::model::{
    ExecutorKind, OperationKey, OperationPhase, OperationPlan, OperationType, PhaseData, Server,
};
use crate::plan::query::child_path;

/// Fluent builder for a single phase subtree.
///
/// Phases are assembled with relative segment names; absolute IDs are
/// assigned when the plan is built. A requirement that does not start with
/// `/` is resolved against the parent as a sibling name.
#[derive(Debug, Clone)]
pub struct PhaseBuilder {
    name: String,
    description: String,
    executor: Option<ExecutorKind>,
    data: Option<PhaseData>,
    requires: Vec<String>,
    children: Vec<PhaseBuilder>,
    parallel: bool,
}

impl PhaseBuilder {
    /// Create a phase with a relative segment name.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            executor: None,
            data: None,
            requires: Vec::new(),
            children: Vec::new(),
            parallel: false,
        }
    }

    /// Set the executor tag, making this a leaf phase.
    pub fn executor(mut self, kind: ExecutorKind) -> Self {
        self.executor = Some(kind);
        self
    }

    /// Attach operation-specific payload.
    pub fn data(mut self, data: PhaseData) -> Self {
        self.data = Some(data);
        self
    }

    /// Add an explicit requirement: a sibling name, or an absolute ID.
    pub fn require(mut self, requirement: impl Into<String>) -> Self {
        self.requires.push(requirement.into());
        self
    }

    /// Append children, each requiring its predecessor.
    pub fn add_sequential(mut self, subs: impl IntoIterator<Item = PhaseBuilder>) -> Self {
        for mut sub in subs {
            if let Some(previous) = self.children.last() {
                sub.requires.push(previous.name.clone());
            }
            self.children.push(sub);
        }
        self
    }

    /// Append children with no inter-sibling requirements and mark this
    /// composite as parallel.
    pub fn add_parallel(mut self, subs: impl IntoIterator<Item = PhaseBuilder>) -> Self {
        self.parallel = true;
        self.children.extend(subs);
        self
    }

    fn finalize(self, parent_id: &str) -> OperationPhase {
        let id = child_path(parent_id, &self.name);
        let requires = self
            .requires
            .iter()
            .map(|req| {
                if req.starts_with('/') {
                    req.clone()
                } else {
                    child_path(parent_id, req)
                }
            })
            .collect();
        let mut phase = OperationPhase::new(id.clone(), self.description);
        phase.executor = self.executor;
        phase.data = self.data;
        phase.requires = requires;
        phase.parallel = self.parallel;
        phase.phases = self
            .children
            .into_iter()
            .map(|child| child.finalize(&id))
            .collect();
        phase
    }
}

/// Builder for a whole operation plan.
pub struct PlanBuilder {
    key: OperationKey,
    operation_type: OperationType,
    cluster_name: String,
    servers: Vec<Server>,
    offline_coordinator: Option<Server>,
    phases: Vec<PhaseBuilder>,
}

impl PlanBuilder {
    pub fn new(key: OperationKey, operation_type: OperationType, servers: Vec<Server>) -> Self {
        let cluster_name = key.cluster.clone();
        Self {
            key,
            operation_type,
            cluster_name,
            servers,
            offline_coordinator: None,
            phases: Vec::new(),
        }
    }

    /// Pin the plan to a coordinator server; the engine will refuse to run
    /// it anywhere else.
    pub fn with_offline_coordinator(mut self, server: Server) -> Self {
        self.offline_coordinator = Some(server);
        self
    }

    /// Append top-level phases, each requiring its predecessor.
    pub fn add_sequential(mut self, subs: impl IntoIterator<Item = PhaseBuilder>) -> Self {
        for mut sub in subs {
            if let Some(previous) = self.phases.last() {
                sub.requires.push(previous.name.clone());
            }
            self.phases.push(sub);
        }
        self
    }

    /// Append a top-level phase with no implied requirement.
    pub fn add(mut self, sub: PhaseBuilder) -> Self {
        self.phases.push(sub);
        self
    }

    /// Resolve IDs, validate the structure, and produce the plan.
    pub fn build(self) -> Result<OperationPlan> {
        let plan = OperationPlan {
            key: self.key,
            operation_type: self.operation_type,
            cluster_name: self.cluster_name,
            servers: self.servers,
            phases: self
                .phases
                .into_iter()
                .map(|phase| phase.finalize(""))
                .collect(),
            offline_coordinator: self.offline_coordinator,
            created: Utc::now(),
        };
        validate_plan(&plan)?;
        Ok(plan)
    }
}

/// Validate the structural invariants of a plan.
///
/// Checks ID uniqueness, leaf/composite executor consistency,
/// sibling-only requirements, requirement cycles (Kahn's algorithm per
/// sibling group), and that phase data only references servers in the
/// plan's server list.
pub fn validate_plan(plan: &OperationPlan) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for phase in crate::plan::query::flatten(plan) {
        if !seen.insert(&phase.id) {
            return Err(OperationError::bad_parameter(format!(
                "duplicate phase ID {}",
                phase.id
            )));
        }
        match (&phase.executor, phase.is_leaf()) {
            (None, true) => {
                return Err(OperationError::bad_parameter(format!(
                    "phase {} has neither an executor nor subphases",
                    phase.id
                )));
            }
            (Some(executor), false) => {
                return Err(OperationError::bad_parameter(format!(
                    "composite phase {} cannot carry executor {executor}",
                    phase.id
                )));
            }
            _ => {}
        }
        if let Some(server) = phase.target_server()
            && plan.server_by_addr(server.advertise_addr).is_none()
        {
            return Err(OperationError::bad_parameter(format!(
                "phase {} references server {} missing from the plan",
                phase.id, server
            )));
        }
    }

    validate_sibling_group(&plan.phases)?;
    Ok(())
}

fn validate_sibling_group(siblings: &[OperationPhase]) -> Result<()> {
    let index: HashMap<&str, usize> = siblings
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.as_str(), i))
        .collect();

    // Requirements may only point at siblings.
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); siblings.len()];
    let mut in_degree: Vec<usize> = vec![0; siblings.len()];
    for (to, phase) in siblings.iter().enumerate() {
        for req in &phase.requires {
            let Some(&from) = index.get(req.as_str()) else {
                return Err(OperationError::bad_parameter(format!(
                    "phase {} requires {req} which is not a sibling phase",
                    phase.id
                )));
            };
            dependents[from].push(to);
            in_degree[to] += 1;
        }
    }

    // Kahn's algorithm: every sibling must be reachable without cycles.
    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();
    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }
    if processed != siblings.len() {
        let cycle: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| siblings[i].id.as_str())
            .collect();
        return Err(OperationError::bad_parameter(format!(
            "requirement cycle between phases: {}",
            cycle.join(", ")
        )));
    }

    for phase in siblings {
        validate_sibling_group(&phase.phases)?;
    }
    Ok(())
}

fn partition_roles(servers: &[Server]) -> (Vec<&Server>, Vec<&Server>) {
    let masters: Vec<&Server> = servers.iter().filter(|s| s.is_master()).collect();
    let nodes: Vec<&Server> = servers.iter().filter(|s| !s.is_master()).collect();
    (masters, nodes)
}

/// Plan for rolling cluster runtime environment variables out to every
/// node: masters first, then nodes, sequential within each role group.
pub fn update_envars_plan(
    key: OperationKey,
    servers: Vec<Server>,
    env: BTreeMap<String, String>,
) -> Result<OperationPlan> {
    let (masters, nodes) = partition_roles(&servers);
    if masters.is_empty() {
        return Err(OperationError::bad_parameter(
            "cannot update environment without at least one master server",
        ));
    }

    let per_server = |server: &Server| {
        PhaseBuilder::new(
            &server.hostname,
            format!("Update runtime environment on node {}", server.hostname),
        )
        .executor(ExecutorKind::UpdateEnv)
        .data(PhaseData::for_server(server.clone()).with_env(env.clone()))
    };

    let masters_phase = PhaseBuilder::new("masters", "Update master nodes")
        .add_sequential(masters.iter().map(|s| per_server(s)));

    let mut builder = PlanBuilder::new(key, OperationType::UpdateEnvars, servers.clone())
        .add(masters_phase);
    if !nodes.is_empty() {
        let nodes_phase = PhaseBuilder::new("nodes", "Update regular nodes")
            .require("/masters")
            .add_sequential(nodes.iter().map(|s| per_server(s)));
        builder = builder.add(nodes_phase);
    }
    builder.build()
}

/// Plan for applying a cluster configuration change on the masters.
pub fn update_config_plan(
    key: OperationKey,
    servers: Vec<Server>,
    config: serde_json::Value,
) -> Result<OperationPlan> {
    let (masters, _) = partition_roles(&servers);
    if masters.is_empty() {
        return Err(OperationError::bad_parameter(
            "cannot update configuration without at least one master server",
        ));
    }

    let masters_phase =
        PhaseBuilder::new("masters", "Apply configuration on master nodes").add_sequential(
            masters.iter().map(|server| {
                PhaseBuilder::new(
                    &server.hostname,
                    format!("Apply configuration on node {}", server.hostname),
                )
                .executor(ExecutorKind::UpdateConfig)
                .data(PhaseData::for_server((*server).clone()).with_params(config.clone()))
            }),
        );

    PlanBuilder::new(key, OperationType::UpdateConfig, servers)
        .add(masters_phase)
        .build()
}

/// The per-node subphase chain for runtime-affecting operations.
fn runtime_node_phases(server: &Server, package: &str) -> Vec<PhaseBuilder> {
    let data = || PhaseData::for_server(server.clone()).with_package(package);
    vec![
        PhaseBuilder::new("drain", format!("Drain node {}", server.hostname))
            .executor(ExecutorKind::Drain)
            .data(data()),
        PhaseBuilder::new(
            "update-config",
            format!("Update runtime configuration on node {}", server.hostname),
        )
        .executor(ExecutorKind::UpdateConfig)
        .data(data()),
        PhaseBuilder::new("restart", format!("Restart container on node {}", server.hostname))
            .executor(ExecutorKind::RestartContainer)
            .data(data()),
        PhaseBuilder::new("taint", format!("Taint node {}", server.hostname))
            .executor(ExecutorKind::Taint)
            .data(data()),
        PhaseBuilder::new("uncordon", format!("Uncordon node {}", server.hostname))
            .executor(ExecutorKind::Uncordon)
            .data(data()),
        PhaseBuilder::new(
            "endpoints",
            format!("Wait for endpoints on node {}", server.hostname),
        )
        .executor(ExecutorKind::Endpoints)
        .data(data()),
        PhaseBuilder::new("untaint", format!("Remove taint from node {}", server.hostname))
            .executor(ExecutorKind::Untaint)
            .data(data()),
    ]
}

/// Plan for upgrading the cluster runtime.
///
/// Each master is wrapped in leader-election handling: elections are
/// stepped down from the master before its restart chain and re-enabled
/// after it, so the cluster never loses its leader to an upgrade.
pub fn runtime_upgrade_plan(
    key: OperationKey,
    servers: Vec<Server>,
    package: &str,
) -> Result<OperationPlan> {
    let (masters, nodes) = partition_roles(&servers);
    if masters.is_empty() {
        return Err(OperationError::bad_parameter(
            "cannot upgrade the runtime without at least one master server",
        ));
    }

    let election = |server: &Server, enable: bool| {
        let (name, verb) = if enable {
            ("enable-elections", "Resume")
        } else {
            ("stepdown", "Step down")
        };
        PhaseBuilder::new(
            name,
            format!("{verb} leader election on node {}", server.hostname),
        )
        .executor(ExecutorKind::Election)
        .data(
            PhaseData::for_server(server.clone())
                .with_params(serde_json::json!({ "enable": enable })),
        )
    };

    let master_phase = |server: &Server| {
        let mut subs = vec![election(server, false)];
        subs.extend(runtime_node_phases(server, package));
        subs.push(election(server, true));
        PhaseBuilder::new(
            &server.hostname,
            format!("Upgrade runtime on master {}", server.hostname),
        )
        .add_sequential(subs)
    };

    let node_phase = |server: &Server| {
        PhaseBuilder::new(
            &server.hostname,
            format!("Upgrade runtime on node {}", server.hostname),
        )
        .add_sequential(runtime_node_phases(server, package))
    };

    let init = PhaseBuilder::new("init", "Initialize the upgrade operation")
        .executor(ExecutorKind::Bootstrap)
        .data(PhaseData::default().with_package(package));
    let masters_phase = PhaseBuilder::new("masters", "Upgrade master nodes")
        .require("/init")
        .add_sequential(masters.iter().map(|s| master_phase(s)));

    let mut builder = PlanBuilder::new(key, OperationType::RuntimeUpgrade, servers.clone())
        .add(init)
        .add(masters_phase);
    if !nodes.is_empty() {
        let nodes_phase = PhaseBuilder::new("nodes", "Upgrade regular nodes")
            .require("/masters")
            .add_sequential(nodes.iter().map(|s| node_phase(s)));
        builder = builder.add(nodes_phase);
    }

    let runtime = PhaseBuilder::new("runtime", "Update the cluster runtime application")
        .executor(ExecutorKind::Runtime)
        .data(PhaseData::default().with_package(package))
        .require("/masters");
    let app = PhaseBuilder::new("app", "Update the user application")
        .executor(ExecutorKind::App)
        .require("/runtime");
    builder.add(runtime).add(app).build()
}

/// Plan for a fresh cluster install.
///
/// Bootstrap and pull fan out across all servers in parallel; the
/// remaining cluster-level phases run sequentially on the first master.
pub fn install_plan(key: OperationKey, servers: Vec<Server>) -> Result<OperationPlan> {
    let (masters, _) = partition_roles(&servers);
    let Some(first_master) = masters.first() else {
        return Err(OperationError::bad_parameter(
            "cannot install without at least one master server",
        ));
    };

    let fan_out = |name: &str, verb: &str, kind: ExecutorKind| {
        PhaseBuilder::new(name, format!("{verb} on all nodes")).add_parallel(servers.iter().map(
            |server| {
                PhaseBuilder::new(&server.hostname, format!("{verb} on node {}", server.hostname))
                    .executor(kind)
                    .data(PhaseData::for_server(server.clone()))
            },
        ))
    };

    let on_master = |name: &str, description: &str, kind: ExecutorKind| {
        PhaseBuilder::new(name, description)
            .executor(kind)
            .data(PhaseData::for_server((*first_master).clone()))
    };

    PlanBuilder::new(key, OperationType::Install, servers.clone())
        .add_sequential(vec![
            fan_out("bootstrap", "Bootstrap system state", ExecutorKind::Bootstrap),
            fan_out("pull", "Pull configured packages", ExecutorKind::Pull),
            fan_out("system", "Install the system software", ExecutorKind::System),
            on_master("wait", "Wait for the cluster to come up", ExecutorKind::Wait),
            on_master("rbac", "Create base RBAC resources", ExecutorKind::Rbac),
            on_master("coredns", "Configure in-cluster DNS", ExecutorKind::Coredns),
            on_master("resources", "Create user-supplied resources", ExecutorKind::Resources),
            on_master("export", "Export the application layers", ExecutorKind::Export),
            on_master("app", "Install the user application", ExecutorKind::App),
        ])
        .build()
}
