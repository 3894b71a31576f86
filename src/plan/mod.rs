//! The operation plan data model.
//!
//! A plan is a hierarchical DAG of phases describing all work for one
//! cluster lifecycle operation. Three pieces make up the model:
//!
//! 1. **model** - the serializable entities (servers, phases, the plan)
//! 2. **query** - traversal, state predicates, and rollback validation
//! 3. **changelog** - the append-only transition log and its resolver

pub mod changelog;
pub mod model;
pub mod query;

pub use changelog::{PlanChange, PlanChangelog, diff_changelog, diff_plan, plan_progress, resolve_plan};
pub use model::{
    ExecutorKind, OperationKey, OperationPhase, OperationPlan, OperationType, PhaseData,
    PhaseState, Server, ServerRole,
};
pub use query::{
    can_rollback, child_path, find_phase, flatten, flatten_leaves, format_plan, has_failed,
    is_completed, is_failed, is_rolled_back, leaf_index, plan_state,
};
