//! Typed error hierarchy for the anvil orchestrator.
//!
//! A single `OperationError` enum covers the error kinds the engine, store,
//! and agent layers need to branch on:
//! - `NotFound` / `AlreadyExists` - sometimes normal (first-time create,
//!   re-entrant executors), sometimes fatal (unknown phase ID)
//! - `BadParameter` - misconfiguration, unknown executor, rollback on a
//!   composite phase; never retried
//! - `PreconditionFailed` - a required predecessor phase is not complete;
//!   overridable with force
//! - `Transient` - network/store unavailability; retried with bounded backoff
//! - `Executor` - wrapped failure from a phase executor, recorded in the
//!   changelog as the phase's error
//! - `Cancelled` - context cancellation, surfaced unchanged

use thiserror::Error;

/// Errors produced while driving an operation plan.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("temporarily unavailable: {message}")]
    Transient {
        message: String,
        /// Underlying cause; folded into messages, not into `source()`
        source: Option<anyhow::Error>,
    },

    #[error("phase {phase_id} failed: {message}")]
    Executor {
        phase_id: String,
        message: String,
        /// Underlying cause; folded into messages, not into `source()`
        source: Option<anyhow::Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation is not supported by this cluster: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OperationError {
    /// A missing plan, phase, or package.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// A duplicate create; idempotent callers treat this as success.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists(message.into())
    }

    /// Misconfiguration or an invalid request; never retried.
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter(message.into())
    }

    /// A prerequisite phase has not completed.
    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    /// A failure expected to clear on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// A transient failure wrapping its cause.
    pub fn transient_with(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(source),
        }
    }

    /// An executor failure attributed to a phase.
    pub fn executor(phase_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Executor {
            phase_id: phase_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// An executor failure wrapping its cause.
    pub fn executor_with(
        phase_id: impl Into<String>,
        message: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Self::Executor {
            phase_id: phase_id.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::NotImplemented(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_bad_parameter(&self) -> bool {
        matches!(self, Self::BadParameter(_))
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The message recorded in the changelog for a failed phase.
    pub fn changelog_message(&self) -> String {
        match self {
            Self::Executor {
                message, source, ..
            } => match source {
                Some(src) => format!("{message}: {src:#}"),
                None => message.clone(),
            },
            other => other.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = OperationError> = std::result::Result<T, E>;
