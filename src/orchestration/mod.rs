//! Orchestration Client
//!
//! The engine never changes a run's state on its own. It proposes each
//! transition to an orchestrator and acts on whatever state comes back,
//! which may differ from the proposal.
//!
//! - [`OrchestrationClient`]: the transition contract
//! - [`RetryingClient`]: transient-error retries with backoff
//! - [`InMemoryOrchestrator`]: in-process reference orchestrator

mod memory;
mod retrying;

pub use memory::InMemoryOrchestrator;
pub use retrying::{ClientRetrySettings, RetryingClient};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::run::{Parameters, Run, RunKind};
use crate::state::{State, TransitionError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Network-level or overload failure; the call may be retried
    #[error("transient orchestration error: {0}")]
    Transient(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("transition rejected: {0}")]
    IllegalTransition(#[from] TransitionError),

    #[error("orchestration API error: {0}")]
    Api(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Request to create a run. The id is chosen by the caller, so sending
/// the same request twice creates one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCreate {
    pub id: Uuid,
    pub name: String,
    pub kind: RunKind,
    pub definition_ref: String,
    pub parameters: Parameters,
    pub retries: u32,
    pub parent_run_id: Option<Uuid>,
}

/// A proposed transition for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub run_id: Uuid,
    pub state: State,
    /// Identical keys get the original answer without reapplying it
    pub idempotency_key: Uuid,
}

impl TransitionRequest {
    pub fn new(run_id: Uuid, state: State) -> Self {
        Self {
            run_id,
            state,
            idempotency_key: Uuid::new_v4(),
        }
    }
}

/// Client for the orchestration API.
pub trait OrchestrationClient: Send + Sync + fmt::Debug {
    /// Creates a run, or returns the id of the existing run with the same id.
    fn create_run(&self, run: RunCreate) -> Result<Uuid, ClientError>;

    /// Proposes a transition and returns the accepted state.
    ///
    /// Proposals from a terminal state are answered with the current
    /// terminal state rather than an error.
    fn propose_transition(&self, request: &TransitionRequest) -> Result<State, ClientError>;

    /// Returns the run's current state, or `None` if it has none yet.
    fn read_state(&self, run_id: Uuid) -> Result<Option<State>, ClientError>;

    fn read_run(&self, run_id: Uuid) -> Result<Run, ClientError>;
}
