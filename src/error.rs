//! Run Error Types
//!
//! Failures carried inside run states and the errors raised to callers
//! that ask a finished run for its result.
//!
//! # Taxonomy
//!
//! Every failure recorded on a run carries a [`FailureKind`]:
//!
//! - `Validation` - malformed parameters, never retried
//! - `Execution` - user code returned an error or panicked, retryable
//! - `Timeout` - the run exceeded its configured duration, retryable
//! - `Crash` - the engine's own infrastructure failed, never retried
//! - `Upstream` - an input future did not complete, never retried
//! - `Cancelled` - the run was cancelled cooperatively

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::StateType;

/// Category of a run failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Execution,
    Timeout,
    Crash,
    Upstream,
    Cancelled,
}

impl FailureKind {
    /// Returns true if the retry policy may be consulted for this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Execution | Self::Timeout)
    }
}

/// A failure raised by a run body or synthesized by the engine.
///
/// `type_name` mirrors the error type the body reported (for example
/// `"ValueError"`), so callers can match on it after the failure has
/// travelled through a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{type_name}: {message}")]
pub struct TaskError {
    pub kind: FailureKind,
    pub type_name: String,
    pub message: String,
}

impl TaskError {
    /// Creates an execution failure, the kind user code raises.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    /// Creates an execution failure with a generic type name.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Validation,
            type_name: "ValidationError".to_string(),
            message: message.into(),
        }
    }

    /// Creates the failure recorded when a run exceeds its timeout.
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            type_name: "TimeoutError".to_string(),
            message: timeout_message(timeout),
        }
    }

    pub fn crash(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Crash,
            type_name: "Crash".to_string(),
            message: message.into(),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Upstream,
            type_name: "UpstreamFailed".to_string(),
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            type_name: "Cancelled".to_string(),
            message: message.into(),
        }
    }

    /// Returns true if this failure came from a timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

/// Builds the message attached to timed-out states.
pub fn timeout_message(timeout: Duration) -> String {
    format!(
        "Run exceeded timeout of {} second(s)",
        format_seconds(timeout)
    )
}

fn format_seconds(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{}", secs)
    }
}

/// Errors raised to the caller of a run's result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    /// The run ended Failed; carries the stored failure.
    #[error("run failed: {0}")]
    Failed(TaskError),

    /// The run ended Crashed because of an infrastructure fault.
    #[error("run crashed: {0}")]
    Crashed(TaskError),

    /// The run ended Cancelled.
    #[error("run was cancelled: {0}")]
    Cancelled(String),

    /// The state is not terminal, so there is no result yet.
    #[error("run has not finished (current state: {0})")]
    NotFinished(StateType),

    /// Waiting for the run exceeded the caller's timeout.
    #[error("timed out after {0:?} waiting for run to finish")]
    WaitTimeout(Duration),

    /// An input tree nests lists, tuples or maps past the allowed depth.
    #[error("input nests deeper than {0} levels")]
    InputTooDeep(usize),
}

impl RunError {
    /// Returns the stored failure, if the run recorded one.
    pub fn failure(&self) -> Option<&TaskError> {
        match self {
            Self::Failed(e) | Self::Crashed(e) => Some(e),
            _ => None,
        }
    }
}

/// Lets a body propagate a nested run's failure with `?`.
impl From<RunError> for TaskError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Failed(e) | RunError::Crashed(e) => e,
            RunError::Cancelled(message) => TaskError::cancelled(message),
            other => TaskError::msg(other.to_string()),
        }
    }
}
