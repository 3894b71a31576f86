//! Traversal and state predicates over an operation plan.
//!
//! The plan is a tree; every query here works on flattened DFS pre-order
//! views of it. Composite phase states are never stored authoritatively -
//! they are a pure function of the leaves, recomputed by
//! `derive_composite_states` after every changelog fold.

use crate::errors::{OperationError, Result};
use crate::plan::model::{OperationPhase, OperationPlan, PhaseState};

/// Flatten the plan in DFS pre-order, composites included.
pub fn flatten(plan: &OperationPlan) -> Vec<&OperationPhase> {
    let mut out = Vec::new();
    for phase in &plan.phases {
        flatten_into(phase, &mut out);
    }
    out
}

fn flatten_into<'a>(phase: &'a OperationPhase, out: &mut Vec<&'a OperationPhase>) {
    out.push(phase);
    for child in &phase.phases {
        flatten_into(child, out);
    }
}

/// Flatten the plan in DFS pre-order, keeping only leaf phases.
///
/// The position of a leaf in this view is its stable `phase_index` used by
/// changelog entries and progress math.
pub fn flatten_leaves(plan: &OperationPlan) -> Vec<&OperationPhase> {
    flatten(plan).into_iter().filter(|p| p.is_leaf()).collect()
}

/// Position of a leaf phase in the flattened leaf order.
pub fn leaf_index(plan: &OperationPlan, phase_id: &str) -> Option<usize> {
    flatten_leaves(plan).iter().position(|p| p.id == phase_id)
}

/// Find a phase by its absolute ID.
pub fn find_phase<'a>(plan: &'a OperationPlan, phase_id: &str) -> Result<&'a OperationPhase> {
    flatten(plan)
        .into_iter()
        .find(|p| p.id == phase_id)
        .ok_or_else(|| {
            OperationError::not_found(format!(
                "phase {phase_id} not found in plan for operation {}",
                plan.key.operation_id
            ))
        })
}

/// Join a parent phase ID and a child name into an absolute ID.
///
/// An empty parent yields `/<child>`; leading and trailing separators are
/// normalized away.
pub fn child_path(parent_id: &str, child: &str) -> String {
    let parent = parent_id.trim_end_matches('/');
    let child = child.trim_start_matches('/');
    if parent.is_empty() {
        format!("/{child}")
    } else if parent.starts_with('/') {
        format!("{parent}/{child}")
    } else {
        format!("/{parent}/{child}")
    }
}

/// All proper ancestor IDs of a phase ID, outermost first.
///
/// `/a/b/c` yields `["/a", "/a/b"]`.
pub fn ancestor_ids(phase_id: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    let segments: Vec<&str> = phase_id.trim_matches('/').split('/').collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        acc.push('/');
        acc.push_str(segment);
        out.push(acc.clone());
    }
    out
}

/// Derive the state of a composite phase from its leaves.
///
/// Completed iff all leaves Completed; RolledBack iff every leaf is either
/// RolledBack or Unstarted with at least one RolledBack; Failed iff any
/// leaf Failed; InProgress on any in-flight leaf or a mix of done and
/// undone leaves; otherwise Unstarted.
pub fn aggregate_state(leaves: &[PhaseState]) -> PhaseState {
    if leaves.is_empty() {
        return PhaseState::Unstarted;
    }
    if leaves.iter().all(|s| s.is_completed()) {
        return PhaseState::Completed;
    }
    if leaves.iter().all(|s| s.is_rollback_exempt()) && leaves.iter().any(|s| s.is_rolled_back()) {
        return PhaseState::RolledBack;
    }
    if leaves.iter().any(|s| s.is_failed()) {
        return PhaseState::Failed;
    }
    if leaves.iter().any(|s| s.is_in_progress()) || leaves.iter().any(|s| s.has_started()) {
        return PhaseState::InProgress;
    }
    PhaseState::Unstarted
}

/// Recompute every composite phase's state from its leaves, bottom-up.
pub fn derive_composite_states(plan: &mut OperationPlan) {
    for phase in &mut plan.phases {
        derive_phase_state(phase);
    }
}

fn derive_phase_state(phase: &mut OperationPhase) -> Vec<PhaseState> {
    if phase.is_leaf() {
        return vec![phase.state];
    }
    let mut leaves = Vec::new();
    for child in &mut phase.phases {
        leaves.extend(derive_phase_state(child));
    }
    phase.state = aggregate_state(&leaves);
    if let Some(latest) = phase
        .phases
        .iter()
        .map(|c| c.updated)
        .max()
        .filter(|latest| *latest > phase.updated)
    {
        phase.updated = latest;
    }
    leaves
}

/// Plan-level state, the aggregate over all leaves.
pub fn plan_state(plan: &OperationPlan) -> PhaseState {
    let leaves: Vec<PhaseState> = flatten_leaves(plan).iter().map(|p| p.state).collect();
    aggregate_state(&leaves)
}

/// Check whether every leaf phase completed.
pub fn is_completed(plan: &OperationPlan) -> bool {
    plan_state(plan) == PhaseState::Completed
}

/// Check whether the plan was rolled back.
pub fn is_rolled_back(plan: &OperationPlan) -> bool {
    plan_state(plan) == PhaseState::RolledBack
}

/// Check whether the plan is failed.
pub fn is_failed(plan: &OperationPlan) -> bool {
    plan_state(plan) == PhaseState::Failed
}

/// Check whether any leaf phase failed, regardless of overall state.
pub fn has_failed(plan: &OperationPlan) -> bool {
    flatten_leaves(plan).iter().any(|p| p.state.is_failed())
}

/// A dependent phase blocking a rollback.
#[derive(Debug, Clone)]
pub struct BlockingPhase {
    pub id: String,
    pub state: PhaseState,
}

/// Validate that a phase can be rolled back.
///
/// Fails if the phase is Unstarted or already RolledBack, if it has
/// subphases (rollback is leaf-only), or if any phase that transitively
/// requires it - or any of its ancestors - has started and was not rolled
/// back. The dependent check is overridable with `force`.
pub fn can_rollback(plan: &OperationPlan, phase_id: &str, force: bool) -> Result<()> {
    let phase = find_phase(plan, phase_id)?;

    if !phase.is_leaf() {
        return Err(OperationError::bad_parameter(format!(
            "phase {phase_id} has subphases, roll back its subphases individually"
        )));
    }
    if !phase.state.has_started() {
        return Err(OperationError::bad_parameter(format!(
            "phase {phase_id} has not been started, nothing to roll back"
        )));
    }
    if phase.state.is_rolled_back() {
        return Err(OperationError::bad_parameter(format!(
            "phase {phase_id} is already rolled back"
        )));
    }

    let blocking = dependents_blocking_rollback(plan, phase_id);
    if !blocking.is_empty() && !force {
        let names: Vec<String> = blocking
            .iter()
            .map(|b| format!("{} ({})", b.id, b.state))
            .collect();
        return Err(OperationError::precondition_failed(format!(
            "phases depending on {phase_id} must be rolled back first: {}; \
             use force to override",
            names.join(", ")
        )));
    }
    Ok(())
}

/// Phases transitively requiring the target (or one of its ancestors) that
/// have started and were not rolled back.
///
/// The required set is seeded with the target and its ancestors, then grown
/// to fixpoint by scanning all phases for `requires` references into the
/// set.
pub fn dependents_blocking_rollback(plan: &OperationPlan, phase_id: &str) -> Vec<BlockingPhase> {
    use std::collections::BTreeSet;

    let mut required: BTreeSet<String> = ancestor_ids(phase_id).into_iter().collect();
    required.insert(phase_id.to_string());

    let all = flatten(plan);
    let mut blocking: Vec<BlockingPhase> = Vec::new();
    loop {
        let mut grew = false;
        for phase in &all {
            if required.contains(&phase.id) {
                continue;
            }
            if phase.requires.iter().any(|req| required.contains(req)) {
                required.insert(phase.id.clone());
                if !phase.state.is_rollback_exempt() {
                    blocking.push(BlockingPhase {
                        id: phase.id.clone(),
                        state: phase.state,
                    });
                }
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    blocking
}

/// Render the plan as an indented tree for terminal display.
pub fn format_plan(plan: &OperationPlan) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Operation {} ({}) on cluster {}\n",
        plan.key.operation_id, plan.operation_type, plan.cluster_name
    ));
    for phase in &plan.phases {
        format_phase(phase, 0, &mut out);
    }
    out
}

fn format_phase(phase: &OperationPhase, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let requires = if phase.requires.is_empty() {
        String::new()
    } else {
        format!(" requires {}", phase.requires.join(","))
    };
    let error = phase
        .error
        .as_deref()
        .map(|e| format!(" error: {e}"))
        .unwrap_or_default();
    out.push_str(&format!(
        "{indent}{:<40} {:<12}{}{}\n",
        phase.id, phase.state, requires, error
    ));
    for child in &phase.phases {
        format_phase(child, depth + 1, out);
    }
}
