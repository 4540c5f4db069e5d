//! Transition History
//!
//! Records every accepted transition with its timestamp, for
//! run reports and for checking retry timing.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{State, StateType};

/// A single accepted transition.
#[derive(Debug, Clone)]
pub struct TransitionEvent {
    /// ID of the run
    pub run_id: Uuid,
    /// Type of the accepted state
    pub state_type: StateType,
    /// Name of the accepted state
    pub state_name: String,
    /// When the transition was accepted
    pub timestamp: DateTime<Utc>,
    /// Scheduled time carried by the state, if any
    pub scheduled_time: Option<DateTime<Utc>>,
}

/// Ordered log of accepted transitions across runs.
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    events: Vec<TransitionEvent>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted state for a run.
    pub fn record(&mut self, run_id: Uuid, state: &State) {
        self.events.push(TransitionEvent {
            run_id,
            state_type: state.state_type(),
            state_name: state.name().to_string(),
            timestamp: state.timestamp(),
            scheduled_time: state.scheduled_time(),
        });
    }

    /// Returns all recorded events.
    pub fn events(&self) -> &[TransitionEvent] {
        &self.events
    }

    /// Returns the events of one run, in order.
    pub fn events_for(&self, run_id: Uuid) -> Vec<&TransitionEvent> {
        self.events.iter().filter(|e| e.run_id == run_id).collect()
    }

    /// Returns the sequence of state types one run went through.
    pub fn state_types(&self, run_id: Uuid) -> Vec<StateType> {
        self.events_for(run_id)
            .into_iter()
            .map(|e| e.state_type)
            .collect()
    }

    /// Counts how often a run entered a state type.
    pub fn count(&self, run_id: Uuid, state_type: StateType) -> usize {
        self.events_for(run_id)
            .into_iter()
            .filter(|e| e.state_type == state_type)
            .count()
    }

    /// Returns the scheduled delay of each AwaitingRetry transition.
    pub fn retry_delays(&self, run_id: Uuid) -> Vec<Duration> {
        self.events_for(run_id)
            .into_iter()
            .filter(|e| e.state_type == StateType::AwaitingRetry)
            .filter_map(|e| {
                let scheduled = e.scheduled_time?;
                (scheduled - e.timestamp).to_std().ok()
            })
            .collect()
    }

    /// Returns the time each run spent between its first and last event.
    pub fn durations(&self) -> HashMap<Uuid, Duration> {
        let mut spans: HashMap<Uuid, (DateTime<Utc>, DateTime<Utc>)> = HashMap::new();
        for event in &self.events {
            spans
                .entry(event.run_id)
                .and_modify(|span| span.1 = event.timestamp)
                .or_insert((event.timestamp, event.timestamp));
        }
        spans
            .into_iter()
            .map(|(id, (start, end))| (id, (end - start).to_std().unwrap_or_default()))
            .collect()
    }

    /// Renders one run's transitions as an indented report.
    pub fn report(&self, run_id: Uuid) -> String {
        let events = self.events_for(run_id);
        let mut output = format!("\nRun {}:\n", run_id);

        let Some(first) = events.first() else {
            output.push_str("  (no transitions)\n");
            return output;
        };
        let start = first.timestamp;

        for event in events {
            let offset = (event.timestamp - start).num_milliseconds();
            output.push_str(&format!(
                "  +{:>6}ms  {:<14} {}\n",
                offset, event.state_type, event.state_name
            ));
        }
        output
    }
}
