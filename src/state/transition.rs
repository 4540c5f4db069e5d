//! Legal State Transitions
//!
//! The transition table every orchestrator enforces. Leaving a
//! terminal state is a logic error and is never retried.

use thiserror::Error;

use super::types::StateType;

/// Reasons a proposed transition is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("cannot transition out of terminal state {from} to {to}")]
    FromTerminal { from: StateType, to: StateType },

    #[error("illegal transition from {from} to {to}")]
    Illegal { from: StateType, to: StateType },

    #[error("a new run must start as Scheduled or Pending, not {0}")]
    InvalidInitial(StateType),
}

/// Returns true if a run may move from `from` to `to`.
pub fn is_legal(from: StateType, to: StateType) -> bool {
    use StateType::*;

    if from.is_terminal() {
        return false;
    }

    // Any live run may crash or be cancelled.
    if matches!(to, Crashed | Cancelled) {
        return true;
    }
    if to == Cancelling {
        return from != Cancelling;
    }

    match from {
        Scheduled => matches!(to, Pending | Paused),
        Pending => matches!(to, Running | Completed | Failed | Paused),
        Running => matches!(
            to,
            Completed | Failed | Retrying | AwaitingRetry | Paused
        ),
        Retrying => matches!(to, Running | Failed),
        AwaitingRetry => matches!(to, Running | Failed),
        Paused => matches!(to, Pending | Running),
        Cancelling => false,
        Completed | Failed | Crashed | Cancelled => false,
    }
}

/// Validates a proposed transition.
///
/// `from` is `None` for a run that has no state yet.
pub fn validate(from: Option<StateType>, to: StateType) -> Result<(), TransitionError> {
    match from {
        None => match to {
            StateType::Scheduled | StateType::Pending => Ok(()),
            other => Err(TransitionError::InvalidInitial(other)),
        },
        Some(from) if from.is_terminal() => Err(TransitionError::FromTerminal { from, to }),
        Some(from) if is_legal(from, to) => Ok(()),
        Some(from) => Err(TransitionError::Illegal { from, to }),
    }
}
