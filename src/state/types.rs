//! Run State Values
//!
//! A [`State`] is an immutable snapshot of where a run is in its
//! lifecycle. A run's current state is replaced, never edited.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{timeout_message, RunError, TaskError};

/// Name given to completed states produced by a cache hit.
pub const CACHED: &str = "Cached";

/// Name given to failed states produced by a timeout.
pub const TIMED_OUT: &str = "TimedOut";

/// The fixed set of run state types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateType {
    Scheduled,
    Pending,
    Running,
    Retrying,
    AwaitingRetry,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Crashed,
    Cancelled,
}

impl StateType {
    /// Returns true for states that end a run's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Crashed | Self::Cancelled
        )
    }

    /// Default human-readable name for states of this type.
    pub fn default_name(self) -> &'static str {
        match self {
            Self::Scheduled => "Scheduled",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Retrying => "Retrying",
            Self::AwaitingRetry => "AwaitingRetry",
            Self::Paused => "Paused",
            Self::Cancelling => "Cancelling",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Crashed => "Crashed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_name())
    }
}

/// Data embedded in a state: the run's result or its failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StateData {
    Result(Value),
    Failure(TaskError),
}

/// What a finished run produced, when the caller asked not to raise.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Value(Value),
    Error(RunError),
}

impl Outcome {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RunError> {
        match self {
            Self::Value(_) => None,
            Self::Error(e) => Some(e),
        }
    }

    /// Converts back into a raising result.
    pub fn into_result(self) -> Result<Value, RunError> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Error(e) => Err(e),
        }
    }
}

/// Immutable snapshot of a run's lifecycle status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "type")]
    state_type: StateType,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<StateData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheduled_time: Option<DateTime<Utc>>,
}

impl State {
    /// Creates a state of the given type with its default name.
    pub fn new(state_type: StateType) -> Self {
        Self {
            state_type,
            name: state_type.default_name().to_string(),
            message: None,
            timestamp: Utc::now(),
            data: None,
            scheduled_time: None,
        }
    }

    pub fn scheduled(at: DateTime<Utc>) -> Self {
        let mut state = Self::new(StateType::Scheduled);
        state.scheduled_time = Some(at);
        state
    }

    pub fn pending() -> Self {
        Self::new(StateType::Pending)
    }

    pub fn running() -> Self {
        Self::new(StateType::Running)
    }

    pub fn paused() -> Self {
        Self::new(StateType::Paused)
    }

    pub fn cancelling() -> Self {
        Self::new(StateType::Cancelling)
    }

    /// Immediate retry; carries the failure that triggered it.
    pub fn retrying(failure: TaskError) -> Self {
        let message = failure.to_string();
        Self::new(StateType::Retrying)
            .with_message(message)
            .with_data(StateData::Failure(failure))
    }

    /// Delayed retry scheduled for `at`; carries the triggering failure.
    pub fn awaiting_retry(at: DateTime<Utc>, failure: TaskError) -> Self {
        let message = failure.to_string();
        let mut state = Self::new(StateType::AwaitingRetry)
            .with_message(message)
            .with_data(StateData::Failure(failure));
        state.scheduled_time = Some(at);
        state
    }

    pub fn completed(value: Value) -> Self {
        Self::new(StateType::Completed).with_data(StateData::Result(value))
    }

    /// Completed state produced by a cache hit.
    pub fn cached(value: Value) -> Self {
        Self::completed(value)
            .with_name(CACHED)
            .with_message("Result read from cache")
    }

    pub fn failed(failure: TaskError) -> Self {
        let message = failure.to_string();
        Self::new(StateType::Failed)
            .with_message(message)
            .with_data(StateData::Failure(failure))
    }

    /// Failed state produced by exceeding `timeout`.
    pub fn timed_out(timeout: std::time::Duration) -> Self {
        Self::new(StateType::Failed)
            .with_name(TIMED_OUT)
            .with_message(timeout_message(timeout))
            .with_data(StateData::Failure(TaskError::timeout(timeout)))
    }

    pub fn crashed(failure: TaskError) -> Self {
        let message = failure.to_string();
        Self::new(StateType::Crashed)
            .with_message(message)
            .with_data(StateData::Failure(failure))
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(StateType::Cancelled)
            .with_data(StateData::Failure(TaskError::cancelled(message.clone())))
            .with_message(message)
    }

    /// Returns this state with a different name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns this state with a message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn with_data(mut self, data: StateData) -> Self {
        self.data = Some(data);
        self
    }

    pub fn state_type(&self) -> StateType {
        self.state_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> Option<&StateData> {
        self.data.as_ref()
    }

    pub fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled_time
    }

    /// Returns the embedded failure, if any.
    pub fn failure(&self) -> Option<&TaskError> {
        match &self.data {
            Some(StateData::Failure(e)) => Some(e),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state_type.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        self.state_type == StateType::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state_type == StateType::Failed
    }

    pub fn is_crashed(&self) -> bool {
        self.state_type == StateType::Crashed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state_type == StateType::Cancelled
    }

    pub fn is_paused(&self) -> bool {
        self.state_type == StateType::Paused
    }

    /// Returns true for completed states produced by a cache hit.
    pub fn is_cached(&self) -> bool {
        self.is_completed() && self.name == CACHED
    }

    /// Returns the run's result.
    ///
    /// With `raise_on_failure`, a failed, crashed or cancelled state
    /// yields `Err`. Without it, the failure is returned as
    /// [`Outcome::Error`]. Non-terminal states always yield
    /// [`RunError::NotFinished`].
    pub fn result(&self, raise_on_failure: bool) -> Result<Outcome, RunError> {
        let outcome = match self.state_type {
            StateType::Completed => match &self.data {
                Some(StateData::Result(v)) => Outcome::Value(v.clone()),
                _ => Outcome::Value(Value::Null),
            },
            StateType::Failed => Outcome::Error(RunError::Failed(self.failure_or_message())),
            StateType::Crashed => Outcome::Error(RunError::Crashed(self.failure_or_message())),
            StateType::Cancelled => Outcome::Error(RunError::Cancelled(
                self.message.clone().unwrap_or_else(|| "cancelled".to_string()),
            )),
            other => return Err(RunError::NotFinished(other)),
        };

        match outcome {
            Outcome::Error(e) if raise_on_failure => Err(e),
            outcome => Ok(outcome),
        }
    }

    /// Shorthand for `result(true)` unwrapped into the value.
    pub fn value(&self) -> Result<Value, RunError> {
        self.result(true)?.into_result()
    }

    fn failure_or_message(&self) -> TaskError {
        self.failure().cloned().unwrap_or_else(|| {
            TaskError::msg(self.message.clone().unwrap_or_else(|| self.name.clone()))
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}({})", self.name, msg),
            None => write!(f, "{}", self.name),
        }
    }
}
