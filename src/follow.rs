//! Plan follower: observe an operation plan as a stream of events.
//!
//! The follower polls the plan through a caller-supplied loader, diffs
//! each snapshot against the previous one, and forwards the resulting
//! changes in order. The stream ends with exactly one terminal event once
//! the plan completes or rolls back, or silently when the context is
//! cancelled.
//!
//! Polling runs at a constant happy-path interval and falls back to an
//! exponential backoff (capped) while the loader or the diff fails; the
//! first success resets the cadence. Events are never dropped: the
//! producer waits for channel capacity, and cancellation is the only way
//! to detach a slow consumer.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::plan::{OperationPlan, PlanChange, diff_plan, is_completed, is_rolled_back};

/// An observed plan event.
#[derive(Debug, Clone)]
pub enum PlanEvent {
    /// A phase changed state
    Changed { change: PlanChange },
    /// The plan completed; terminal
    Completed,
    /// The plan was rolled back; terminal
    RolledBack,
}

impl PlanEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

/// Polling cadence of the follower.
#[derive(Debug, Clone, Copy)]
pub struct FollowConfig {
    /// Interval between polls while the loader succeeds
    pub poll_interval: Duration,
    /// Ceiling for the failure backoff
    pub max_backoff: Duration,
    /// Event channel capacity
    pub buffer: usize,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            buffer: 64,
        }
    }
}

/// Follow an operation plan until it reaches a terminal state.
///
/// `get_plan` loads the current resolved plan; it is called once per
/// tick. The returned receiver yields `PlanEvent`s and closes after the
/// terminal event or when `cancel` fires.
pub fn follow_operation_plan<F, Fut>(
    cancel: CancellationToken,
    get_plan: F,
) -> mpsc::Receiver<PlanEvent>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OperationPlan>> + Send,
{
    follow_operation_plan_with(FollowConfig::default(), cancel, get_plan)
}

/// `follow_operation_plan` with an explicit polling cadence.
pub fn follow_operation_plan_with<F, Fut>(
    config: FollowConfig,
    cancel: CancellationToken,
    get_plan: F,
) -> mpsc::Receiver<PlanEvent>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<OperationPlan>> + Send,
{
    let (tx, rx) = mpsc::channel(config.buffer.max(1));
    tokio::spawn(async move {
        follow_loop(config, cancel, get_plan, tx).await;
    });
    rx
}

async fn follow_loop<F, Fut>(
    config: FollowConfig,
    cancel: CancellationToken,
    get_plan: F,
    tx: mpsc::Sender<PlanEvent>,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<OperationPlan>>,
{
    let mut previous: Option<OperationPlan> = None;
    let mut backoff = config.poll_interval;

    loop {
        let outcome = async {
            let next = get_plan().await?;
            let changes = diff_plan(previous.as_ref(), &next)?;
            Ok::<_, crate::errors::OperationError>((next, changes))
        }
        .await;

        match outcome {
            Ok((next, changes)) => {
                backoff = config.poll_interval;
                for change in changes {
                    if send(&cancel, &tx, PlanEvent::Changed { change }).await {
                        return;
                    }
                }
                if is_completed(&next) {
                    send(&cancel, &tx, PlanEvent::Completed).await;
                    return;
                }
                if is_rolled_back(&next) {
                    send(&cancel, &tx, PlanEvent::RolledBack).await;
                    return;
                }
                previous = Some(next);
            }
            Err(err) => {
                backoff = (backoff * 2).min(config.max_backoff);
                if err.is_transient() {
                    debug!(error = %err, backoff_ms = backoff.as_millis() as u64,
                        "plan reload failed, backing off");
                } else {
                    warn!(error = %err, backoff_ms = backoff.as_millis() as u64,
                        "plan reload failed, backing off");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Send one event; true means the follower should stop (consumer gone or
/// context cancelled).
async fn send(
    cancel: &CancellationToken,
    tx: &mpsc::Sender<PlanEvent>,
    event: PlanEvent,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        result = tx.send(event) => result.is_err(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OperationError;
    use crate::plan::model::{
        ExecutorKind, OperationKey, OperationPhase, OperationPlan, OperationType, PhaseState,
    };
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> FollowConfig {
        FollowConfig {
            poll_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            buffer: 16,
        }
    }

    fn plan_with_states(states: &[(&str, PhaseState)]) -> OperationPlan {
        let phases = states
            .iter()
            .map(|(id, state)| {
                let mut phase = OperationPhase::new(*id, format!("phase {id}"));
                phase.executor = Some(ExecutorKind::Bootstrap);
                phase.state = *state;
                phase
            })
            .collect();
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

    async fn collect(mut rx: mpsc::Receiver<PlanEvent>) -> Vec<PlanEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_completed_plan_emits_progress_then_terminal() {
        // S5: three completed phases observed from the start produce three
        // change events in phase order and exactly one terminal event.
        let plan = plan_with_states(&[
            ("/init", PhaseState::Completed),
            ("/bootstrap", PhaseState::Completed),
            ("/upgrade", PhaseState::Completed),
        ]);
        let rx = follow_operation_plan_with(fast_config(), CancellationToken::new(), move || {
            let plan = plan.clone();
            async move { Ok(plan) }
        });

        let events = collect(rx).await;
        assert_eq!(events.len(), 4);
        let ids: Vec<&str> = events[..3]
            .iter()
            .map(|e| match e {
                PlanEvent::Changed { change } => change.phase_id.as_str(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec!["/init", "/bootstrap", "/upgrade"]);
        assert!(matches!(events[3], PlanEvent::Completed));
    }

    #[tokio::test]
    async fn test_transient_load_failures_do_not_lose_events() {
        // S6: the first two loads fail, then a completed plan appears.
        let calls = Arc::new(AtomicU32::new(0));
        let plan = plan_with_states(&[("/init", PhaseState::Completed)]);
        let rx = follow_operation_plan_with(fast_config(), CancellationToken::new(), move || {
            let plan = plan.clone();
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(OperationError::transient("store hiccup"))
                } else {
                    Ok(plan)
                }
            }
        });

        let events = collect(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PlanEvent::Changed { change } if change.phase_id == "/init"));
        assert!(matches!(events[1], PlanEvent::Completed));
    }

    #[tokio::test]
    async fn test_incremental_changes_across_ticks() {
        let calls = Arc::new(AtomicU32::new(0));
        let rx = follow_operation_plan_with(fast_config(), CancellationToken::new(), move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let states: &[(&str, PhaseState)] = match n {
                    0 => &[
                        ("/init", PhaseState::InProgress),
                        ("/upgrade", PhaseState::Unstarted),
                    ],
                    _ => &[
                        ("/init", PhaseState::Completed),
                        ("/upgrade", PhaseState::Completed),
                    ],
                };
                Ok(plan_with_states(states))
            }
        });

        let events = collect(rx).await;
        // Tick 1: /init InProgress. Tick 2: both leaves changed + terminal.
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], PlanEvent::Changed { change }
            if change.phase_id == "/init" && change.new_state == PhaseState::InProgress));
        assert!(events[..3].iter().all(|e| !e.is_terminal()));
        assert!(matches!(events[3], PlanEvent::Completed));
    }

    #[tokio::test]
    async fn test_rolled_back_plan_emits_rollback_terminal() {
        let plan = plan_with_states(&[
            ("/init", PhaseState::RolledBack),
            ("/upgrade", PhaseState::Unstarted),
        ]);
        let rx = follow_operation_plan_with(fast_config(), CancellationToken::new(), move || {
            let plan = plan.clone();
            async move { Ok(plan) }
        });

        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(PlanEvent::RolledBack)));
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1,
            "exactly one terminal event"
        );
    }

    #[tokio::test]
    async fn test_cancellation_closes_the_stream_without_terminal() {
        let cancel = CancellationToken::new();
        let rx = follow_operation_plan_with(fast_config(), cancel.clone(), move || async move {
            // Never terminal: one phase stays in progress forever.
            Ok(plan_with_states(&[("/init", PhaseState::InProgress)]))
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let events = collect(rx).await;
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| !e.is_terminal()));
    }
}
