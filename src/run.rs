//! Run Records
//!
//! A [`Run`] is one tracked execution of a task or flow definition.
//! Runs are created by the orchestration client right before execution
//! and afterwards change only through accepted state transitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::State;

/// Named run parameters. Ordered so that hashing them is stable.
pub type Parameters = BTreeMap<String, Value>;

/// What kind of definition a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Task,
    Flow,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Flow => write!(f, "flow"),
        }
    }
}

/// A run as the orchestrator stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub name: String,
    pub kind: RunKind,
    /// Stable reference to the definition being executed
    pub definition_ref: String,
    pub parameters: Parameters,
    pub state: Option<State>,
    /// Number of times the run has entered Running
    pub run_count: u32,
    /// Maximum number of retries the orchestrator allows
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,
}

impl Run {
    /// Returns the run's current state type, if it has one.
    pub fn state_type(&self) -> Option<crate::state::StateType> {
        self.state.as_ref().map(|s| s.state_type())
    }

    pub fn is_finished(&self) -> bool {
        self.state.as_ref().map(|s| s.is_terminal()).unwrap_or(false)
    }
}
