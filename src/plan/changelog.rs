//! Append-only changelog of phase state transitions.
//!
//! The changelog is the single source of truth about progress: phases are
//! never mutated in place outside the store. Reads fold the changelog into
//! a plan copy with `resolve_plan`, so in-memory and on-wire copies agree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::errors::{OperationError, Result};
use crate::plan::model::{OperationPlan, PhaseState};
use crate::plan::query::{derive_composite_states, flatten_leaves, leaf_index};

/// A single phase state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanChange {
    /// Unique change ID; appends are idempotent on it
    pub id: Uuid,
    /// Absolute ID of the phase that changed
    pub phase_id: String,
    /// Position of the phase in the flattened leaf order
    pub phase_index: usize,
    /// The state the phase moved to
    pub new_state: PhaseState,
    /// Server-side timestamp of the transition
    pub created: DateTime<Utc>,
    /// Error report accompanying a Failed transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanChange {
    /// Create a change for a phase of the given plan.
    ///
    /// Composite phases carry index 0; their state is derived, not logged.
    pub fn new(
        plan: &OperationPlan,
        phase_id: &str,
        new_state: PhaseState,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase_id: phase_id.to_string(),
            phase_index: leaf_index(plan, phase_id).unwrap_or(0),
            new_state,
            created: Utc::now(),
            error,
        }
    }
}

/// Ordered, append-only sequence of plan changes for one operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanChangelog {
    changes: Vec<PlanChange>,
}

impl PlanChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change. Replays of an already-appended change ID are no-ops
    /// so transient-failure retries stay idempotent.
    pub fn append(&mut self, change: PlanChange) {
        if self.contains(change.id) {
            return;
        }
        self.changes.push(change);
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.changes.iter().any(|c| c.id == id)
    }

    /// The most recent change for a phase, by timestamp with insertion
    /// order breaking ties.
    pub fn latest(&self, phase_id: &str) -> Option<&PlanChange> {
        let mut latest: Option<&PlanChange> = None;
        for change in self.changes.iter().filter(|c| c.phase_id == phase_id) {
            match latest {
                Some(current) if change.created < current.created => {}
                _ => latest = Some(change),
            }
        }
        latest
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlanChange> {
        self.changes.iter()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl FromIterator<PlanChange> for PlanChangelog {
    fn from_iter<T: IntoIterator<Item = PlanChange>>(iter: T) -> Self {
        let mut log = Self::new();
        for change in iter {
            log.append(change);
        }
        log
    }
}

/// Fold a changelog into a deep copy of the plan.
///
/// Each phase takes the state, timestamp, and error of its latest change;
/// composite states are then re-derived from the leaves. Idempotent:
/// resolving an already-resolved plan against the same changelog is a
/// no-op.
pub fn resolve_plan(plan: &OperationPlan, changelog: &PlanChangelog) -> OperationPlan {
    let mut resolved = plan.clone();
    for phase in &mut resolved.phases {
        apply_latest(phase, changelog);
    }
    derive_composite_states(&mut resolved);
    resolved
}

fn apply_latest(phase: &mut crate::plan::model::OperationPhase, changelog: &PlanChangelog) {
    if let Some(change) = changelog.latest(&phase.id) {
        phase.state = change.new_state;
        phase.updated = change.created;
        phase.error = change.error.clone();
    }
    for child in &mut phase.phases {
        apply_latest(child, changelog);
    }
}

/// Changes for every leaf that has left the Unstarted state, in leaf order.
pub fn plan_progress(plan: &OperationPlan) -> Vec<PlanChange> {
    flatten_leaves(plan)
        .iter()
        .enumerate()
        .filter(|(_, leaf)| leaf.state.has_started())
        .map(|(index, leaf)| PlanChange {
            id: Uuid::new_v4(),
            phase_id: leaf.id.clone(),
            phase_index: index,
            new_state: leaf.state,
            created: leaf.updated,
            error: leaf.error.clone(),
        })
        .collect()
}

/// Compute the changes that turn `prev` into `next`.
///
/// Both plans must describe the same operation with an identical leaf
/// order. With no previous plan this degenerates to `plan_progress(next)`.
pub fn diff_plan(prev: Option<&OperationPlan>, next: &OperationPlan) -> Result<Vec<PlanChange>> {
    let Some(prev) = prev else {
        return Ok(plan_progress(next));
    };

    if prev.key.operation_id != next.key.operation_id {
        return Err(OperationError::bad_parameter(format!(
            "cannot diff plans of different operations: {} vs {}",
            prev.key.operation_id, next.key.operation_id
        )));
    }

    let prev_leaves = flatten_leaves(prev);
    let next_leaves = flatten_leaves(next);
    if prev_leaves.len() != next_leaves.len()
        || prev_leaves
            .iter()
            .zip(next_leaves.iter())
            .any(|(a, b)| a.id != b.id)
    {
        return Err(OperationError::bad_parameter(format!(
            "plans for operation {} have diverging phase lists",
            next.key.operation_id
        )));
    }

    let mut changes = Vec::new();
    for (index, (prev_leaf, next_leaf)) in prev_leaves.iter().zip(next_leaves.iter()).enumerate() {
        if prev_leaf.state == next_leaf.state && prev_leaf.updated == next_leaf.updated {
            continue;
        }
        changes.push(PlanChange {
            id: Uuid::new_v4(),
            phase_id: next_leaf.id.clone(),
            phase_index: index,
            new_state: next_leaf.state,
            created: next_leaf.updated,
            error: next_leaf.error.clone(),
        });
    }
    Ok(changes)
}

/// Entries present in `local` but missing from `remote`, by change ID.
pub fn diff_changelog(local: &PlanChangelog, remote: &PlanChangelog) -> Vec<PlanChange> {
    let known: HashSet<Uuid> = remote.iter().map(|c| c.id).collect();
    local
        .iter()
        .filter(|c| !known.contains(&c.id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::{
        ExecutorKind, OperationKey, OperationPhase, OperationType, PhaseState,
    };
    use chrono::Duration;

    fn leaf(id: &str) -> OperationPhase {
        let mut phase = OperationPhase::new(id, format!("phase {id}"));
        phase.executor = Some(ExecutorKind::Bootstrap);
        phase
    }

    fn plan(phases: Vec<OperationPhase>) -> OperationPlan {
        OperationPlan {
            key: OperationKey::new("acme", "prod", "op-1"),
            operation_type: OperationType::RuntimeUpgrade,
            cluster_name: "prod".to_string(),
            servers: Vec::new(),
            phases,
            offline_coordinator: None,
            created: Utc::now(),
        }
    }

    fn change(plan: &OperationPlan, phase_id: &str, state: PhaseState) -> PlanChange {
        PlanChange::new(plan, phase_id, state, None)
    }

    #[test]
    fn test_append_is_idempotent_by_id() {
        let p = plan(vec![leaf("/init")]);
        let c = change(&p, "/init", PhaseState::InProgress);

        let mut log = PlanChangelog::new();
        log.append(c.clone());
        log.append(c.clone());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_latest_prefers_newer_timestamp_then_insertion_order() {
        let p = plan(vec![leaf("/init")]);
        let mut first = change(&p, "/init", PhaseState::InProgress);
        let mut second = change(&p, "/init", PhaseState::Completed);
        let now = Utc::now();
        first.created = now;
        second.created = now + Duration::seconds(1);

        let log: PlanChangelog = vec![first.clone(), second.clone()].into_iter().collect();
        assert_eq!(log.latest("/init").unwrap().new_state, PhaseState::Completed);

        // Equal timestamps: the later append wins.
        second.created = now;
        let log: PlanChangelog = vec![first, second].into_iter().collect();
        assert_eq!(log.latest("/init").unwrap().new_state, PhaseState::Completed);
    }

    #[test]
    fn test_resolve_plan_applies_latest_and_derives_composites() {
        let mut masters = OperationPhase::new("/masters", "Update masters");
        masters.phases = vec![leaf("/masters/node-1"), leaf("/masters/node-2")];
        let p = plan(vec![masters]);

        let mut log = PlanChangelog::new();
        let mut c1 = change(&p, "/masters/node-1", PhaseState::InProgress);
        let mut c2 = change(&p, "/masters/node-1", PhaseState::Completed);
        c1.created = Utc::now();
        c2.created = c1.created + Duration::seconds(2);
        log.append(c1);
        log.append(c2);

        let resolved = resolve_plan(&p, &log);
        assert_eq!(resolved.phases[0].phases[0].state, PhaseState::Completed);
        assert_eq!(resolved.phases[0].phases[1].state, PhaseState::Unstarted);
        // One leaf done, one not: the composite is in progress.
        assert_eq!(resolved.phases[0].state, PhaseState::InProgress);
        // The source plan is untouched.
        assert_eq!(p.phases[0].phases[0].state, PhaseState::Unstarted);
    }

    #[test]
    fn test_resolve_plan_is_idempotent() {
        let p = plan(vec![leaf("/init"), leaf("/upgrade")]);
        let log: PlanChangelog = vec![
            change(&p, "/init", PhaseState::Completed),
            change(&p, "/upgrade", PhaseState::InProgress),
        ]
        .into_iter()
        .collect();

        let once = resolve_plan(&p, &log);
        let twice = resolve_plan(&once, &log);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_plan_progress_skips_unstarted() {
        let mut p = plan(vec![leaf("/init"), leaf("/bootstrap"), leaf("/upgrade")]);
        p.phases[0].state = PhaseState::Completed;
        p.phases[1].state = PhaseState::InProgress;

        let progress = plan_progress(&p);
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].phase_id, "/init");
        assert_eq!(progress[0].phase_index, 0);
        assert_eq!(progress[1].phase_id, "/bootstrap");
        assert_eq!(progress[1].phase_index, 1);
    }

    #[test]
    fn test_diff_plan_of_identical_plans_is_empty() {
        let p = plan(vec![leaf("/init")]);
        assert!(diff_plan(Some(&p), &p).unwrap().is_empty());
    }

    #[test]
    fn test_diff_plan_without_previous_is_progress() {
        let mut p = plan(vec![leaf("/init"), leaf("/upgrade")]);
        p.phases[0].state = PhaseState::Completed;

        let diff = diff_plan(None, &p).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].phase_id, "/init");
        assert_eq!(diff[0].new_state, PhaseState::Completed);
    }

    #[test]
    fn test_diff_plan_reports_changed_leaves_in_order() {
        let prev = plan(vec![leaf("/init"), leaf("/upgrade")]);
        let mut next = prev.clone();
        next.phases[0].state = PhaseState::Completed;
        next.phases[0].updated = Utc::now() + Duration::seconds(1);
        next.phases[1].state = PhaseState::InProgress;
        next.phases[1].updated = Utc::now() + Duration::seconds(2);

        let diff = diff_plan(Some(&prev), &next).unwrap();
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0].phase_id, "/init");
        assert_eq!(diff[1].phase_id, "/upgrade");
    }

    #[test]
    fn test_diff_plan_rejects_mismatched_operations() {
        let a = plan(vec![leaf("/init")]);
        let mut b = a.clone();
        b.key.operation_id = "op-2".to_string();
        assert!(diff_plan(Some(&a), &b).unwrap_err().is_bad_parameter());

        let mut c = a.clone();
        c.phases = vec![leaf("/other")];
        assert!(diff_plan(Some(&a), &c).unwrap_err().is_bad_parameter());
    }

    #[test]
    fn test_diff_changelog_by_change_id() {
        let p = plan(vec![leaf("/init")]);
        let shared = change(&p, "/init", PhaseState::InProgress);
        let local_only = change(&p, "/init", PhaseState::Completed);

        let local: PlanChangelog = vec![shared.clone(), local_only.clone()]
            .into_iter()
            .collect();
        let remote: PlanChangelog = vec![shared].into_iter().collect();

        let missing = diff_changelog(&local, &remote);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, local_only.id);
    }
}
