//! Run Lifecycle Machine
//!
//! [`RunMachine`] holds the orchestration rules for a single run: which
//! state to propose next, when to consult the cache, when to invoke the
//! body, and how failures map onto retries. It performs no I/O. A driver
//! feeds it [`Event`]s and carries out the [`Effect`] each one returns,
//! so the blocking and the tokio drivers share one set of semantics.
//!
//! # Lifecycle
//!
//! ```text
//! Start -> propose Pending
//! Pending accepted -> check cache (if keyed) -> propose Running
//! Running accepted -> invoke body
//! body returned    -> propose Completed
//! body failed      -> propose AwaitingRetry / Retrying / Failed
//! AwaitingRetry    -> sleep until scheduled time -> propose Running
//! terminal state   -> finish
//! ```
//!
//! The orchestrator may answer any proposal with a different state. The
//! machine always adopts the answer, whatever was proposed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{FailureKind, TaskError};
use crate::retry::RetryPolicy;
use crate::state::{State, StateType};

/// Policies the machine applies to one run.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    /// The run has a cache key, so Pending is followed by a cache check
    pub cache_enabled: bool,
    /// Failure detected before the body could run, such as invalid
    /// parameters or a failed upstream run
    pub precondition: Option<TaskError>,
}

/// How one body invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyOutcome {
    Returned(Value),
    Raised(TaskError),
    TimedOut(Duration),
}

impl From<Result<Value, TaskError>> for BodyOutcome {
    fn from(result: Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Returned(value),
            Err(err) => Self::Raised(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    /// The orchestrator answered a proposal with this state
    Accepted(State),
    CacheChecked(Option<Value>),
    BodyFinished(BodyOutcome),
    DelayElapsed,
    CancelRequested,
    /// A cancelled body stopped, or its grace period ran out
    Drained,
    /// The driver itself failed, outside the body
    Crashed(TaskError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Propose(State),
    CheckCache,
    Invoke { attempt: u32 },
    Sleep(Duration),
    /// Poll the orchestrator until the run leaves Paused
    AwaitResume,
    /// Wait for the cancelled body to stop
    DrainBody,
    Finish(State),
    /// Nothing to do for this event
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Proposing,
    CheckingCache,
    Invoking,
    Sleeping { then: StateType },
    Paused,
    Cancelling { body_in_flight: bool },
    Draining,
    Finalizing,
    Crashing,
    Done,
}

/// Event-driven lifecycle of one run.
#[derive(Debug, Clone)]
pub struct RunMachine {
    config: MachineConfig,
    phase: Phase,
    attempts: u32,
    /// Whether the orchestrator has accepted any state for the run
    has_state: bool,
}

impl RunMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            attempts: 0,
            has_state: false,
        }
    }

    /// Body invocations so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Returns true if a cancellation request would be acted on now.
    ///
    /// Before the run has a state, and once a terminal state or a
    /// cancellation is being proposed, a new request is ignored.
    pub fn can_cancel(&self) -> bool {
        self.has_state
            && !matches!(
                self.phase,
                Phase::Idle
                    | Phase::Cancelling { .. }
                    | Phase::Draining
                    | Phase::Finalizing
                    | Phase::Crashing
                    | Phase::Done
            )
    }

    pub fn handle(&mut self, event: Event) -> Effect {
        if self.phase == Phase::Done {
            return Effect::Idle;
        }

        match event {
            Event::Start if self.phase == Phase::Idle => self.propose(State::pending()),
            Event::Accepted(state) => {
                self.has_state = true;
                self.adopt(state)
            }
            Event::CacheChecked(hit) if self.phase == Phase::CheckingCache => match hit {
                Some(value) => self.finalize(State::cached(value)),
                None => self.propose(State::running()),
            },
            Event::BodyFinished(outcome) if self.phase == Phase::Invoking => self.body_finished(outcome),
            Event::DelayElapsed => match self.phase {
                Phase::Sleeping { then } => self.propose(State::new(then)),
                _ => Effect::Idle,
            },
            Event::CancelRequested if self.can_cancel() => {
                self.phase = Phase::Cancelling {
                    body_in_flight: self.phase == Phase::Invoking,
                };
                Effect::Propose(State::cancelling())
            }
            Event::Drained if matches!(self.phase, Phase::Draining) => {
                self.finalize(State::cancelled("Run was cancelled"))
            }
            Event::Crashed(failure) => {
                if self.phase == Phase::Crashing {
                    // The crash itself could not be reported
                    self.phase = Phase::Done;
                    Effect::Finish(State::crashed(failure))
                } else {
                    self.phase = Phase::Crashing;
                    Effect::Propose(State::crashed(failure))
                }
            }
            _ => Effect::Idle,
        }
    }

    fn propose(&mut self, state: State) -> Effect {
        self.phase = Phase::Proposing;
        Effect::Propose(state)
    }

    /// Proposes a terminal state; cancellation is no longer possible.
    fn finalize(&mut self, state: State) -> Effect {
        self.phase = Phase::Finalizing;
        Effect::Propose(state)
    }

    fn adopt(&mut self, state: State) -> Effect {
        if state.is_terminal() {
            self.phase = Phase::Done;
            return Effect::Finish(state);
        }

        match state.state_type() {
            StateType::Pending => {
                if let Some(failure) = self.config.precondition.take() {
                    return match failure.kind {
                        FailureKind::Cancelled => self.finalize(State::cancelled(failure.message)),
                        _ => self.finalize(State::failed(failure)),
                    };
                }
                if self.config.cache_enabled {
                    self.phase = Phase::CheckingCache;
                    Effect::CheckCache
                } else {
                    self.propose(State::running())
                }
            }
            StateType::Running => {
                self.attempts += 1;
                self.phase = Phase::Invoking;
                Effect::Invoke {
                    attempt: self.attempts,
                }
            }
            StateType::Retrying => self.propose(State::running()),
            StateType::AwaitingRetry => self.sleep_until(&state, StateType::Running),
            StateType::Scheduled => self.sleep_until(&state, StateType::Pending),
            StateType::Paused => {
                self.phase = Phase::Paused;
                Effect::AwaitResume
            }
            StateType::Cancelling => match self.phase {
                Phase::Cancelling {
                    body_in_flight: true,
                } => {
                    self.phase = Phase::Draining;
                    Effect::DrainBody
                }
                _ => self.finalize(State::cancelled("Run was cancelled")),
            },
            // Terminal types returned above
            _ => self.finalize(State::crashed(TaskError::crash(format!(
                "Unexpected state {} from orchestrator",
                state
            )))),
        }
    }

    fn sleep_until(&mut self, state: &State, then: StateType) -> Effect {
        let delay = state
            .scheduled_time()
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.phase = Phase::Sleeping { then };
        Effect::Sleep(delay)
    }

    fn body_finished(&mut self, outcome: BodyOutcome) -> Effect {
        match outcome {
            BodyOutcome::Returned(value) => self.finalize(State::completed(value)),
            BodyOutcome::Raised(failure) => self.failed(failure, None),
            BodyOutcome::TimedOut(timeout) => self.failed(TaskError::timeout(timeout), Some(timeout)),
        }
    }

    fn failed(&mut self, failure: TaskError, timed_out: Option<Duration>) -> Effect {
        match failure.kind {
            FailureKind::Crash => return self.finalize(State::crashed(failure)),
            FailureKind::Cancelled => return self.finalize(State::cancelled(failure.message)),
            _ => {}
        }

        let retry = &self.config.retry;
        if retry.should_retry(&failure, self.attempts) {
            if retry.has_delay() {
                let delay = retry.delay_for(self.attempts.saturating_sub(1));
                return self.propose(State::awaiting_retry(after(delay), failure));
            }
            return self.propose(State::retrying(failure));
        }

        match timed_out {
            Some(timeout) => self.finalize(State::timed_out(timeout)),
            None => self.finalize(State::failed(failure)),
        }
    }
}

/// The time `delay` from now, saturating at the latest representable time.
fn after(delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryDelay;
    use crate::state::TIMED_OUT;
    use serde_json::json;

    fn machine(retries: u32) -> RunMachine {
        RunMachine::new(MachineConfig {
            retry: RetryPolicy::new(retries),
            ..MachineConfig::default()
        })
    }

    /// Accepts every proposal unchanged until the machine asks for something else.
    fn accept_all(m: &mut RunMachine, mut effect: Effect) -> Effect {
        while let Effect::Propose(state) = effect {
            effect = m.handle(Event::Accepted(state));
        }
        effect
    }

    fn proposed(effect: &Effect) -> StateType {
        match effect {
            Effect::Propose(state) => state.state_type(),
            other => panic!("expected a proposal, got {:?}", other),
        }
    }

    #[test]
    fn test_happy_path() {
        let mut m = machine(0);
        let effect = m.handle(Event::Start);
        assert_eq!(proposed(&effect), StateType::Pending);

        let effect = accept_all(&mut m, effect);
        assert_eq!(effect, Effect::Invoke { attempt: 1 });

        let effect = m.handle(Event::BodyFinished(BodyOutcome::Returned(json!(3))));
        assert_eq!(proposed(&effect), StateType::Completed);
        match accept_all(&mut m, effect) {
            Effect::Finish(state) => assert_eq!(state.value().unwrap(), json!(3)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(m.is_done());
    }

    #[test]
    fn test_cache_hit_skips_body() {
        let mut m = RunMachine::new(MachineConfig {
            cache_enabled: true,
            ..MachineConfig::default()
        });
        let effect = m.handle(Event::Start);
        let effect = accept_all(&mut m, effect);
        assert_eq!(effect, Effect::CheckCache);

        let effect = m.handle(Event::CacheChecked(Some(json!("hit"))));
        match accept_all(&mut m, effect) {
            Effect::Finish(state) => assert!(state.is_cached()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn test_retry_without_delay_goes_through_retrying() {
        let mut m = machine(1);
        let effect = accept_all(&mut m, Effect::Propose(State::pending()));
        assert_eq!(effect, Effect::Invoke { attempt: 1 });

        let effect = m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::msg("flaky"))));
        assert_eq!(proposed(&effect), StateType::Retrying);
        let effect = accept_all(&mut m, effect);
        assert_eq!(effect, Effect::Invoke { attempt: 2 });

        let effect = m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::msg("flaky"))));
        assert_eq!(proposed(&effect), StateType::Failed);
    }

    #[test]
    fn test_retry_with_delay_sleeps() {
        let mut m = RunMachine::new(MachineConfig {
            retry: RetryPolicy::new(2).with_delay(RetryDelay::Constant(Duration::from_secs(60))),
            ..MachineConfig::default()
        });
        accept_all(&mut m, Effect::Propose(State::pending()));

        let effect = m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::msg("x"))));
        assert_eq!(proposed(&effect), StateType::AwaitingRetry);
        match accept_all(&mut m, effect) {
            Effect::Sleep(d) => assert!(d > Duration::from_secs(50) && d <= Duration::from_secs(60)),
            other => panic!("unexpected {:?}", other),
        }

        let effect = m.handle(Event::DelayElapsed);
        assert_eq!(proposed(&effect), StateType::Running);
        assert_eq!(accept_all(&mut m, effect), Effect::Invoke { attempt: 2 });
    }

    #[test]
    fn test_validation_failure_is_not_retried() {
        let mut m = machine(5);
        accept_all(&mut m, Effect::Propose(State::pending()));
        let effect = m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::validation("bad"))));
        assert_eq!(proposed(&effect), StateType::Failed);
    }

    #[test]
    fn test_precondition_fails_without_running() {
        let mut m = RunMachine::new(MachineConfig {
            retry: RetryPolicy::new(3),
            precondition: Some(TaskError::upstream("upstream failed")),
            ..MachineConfig::default()
        });
        let effect = m.handle(Event::Start);
        let effect = m.handle(Event::Accepted(match effect {
            Effect::Propose(s) => s,
            other => panic!("unexpected {:?}", other),
        }));
        assert_eq!(proposed(&effect), StateType::Failed);
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn test_cancelled_precondition_finishes_cancelled() {
        let mut m = RunMachine::new(MachineConfig {
            precondition: Some(TaskError::cancelled("stopped while waiting")),
            ..MachineConfig::default()
        });
        let effect = m.handle(Event::Start);
        match accept_all(&mut m, effect) {
            Effect::Finish(state) => assert!(state.is_cancelled()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn test_cancel_waits_for_first_state() {
        let mut m = machine(0);
        let effect = m.handle(Event::Start);
        assert!(!m.can_cancel());
        assert_eq!(m.handle(Event::CancelRequested), Effect::Idle);

        let effect = m.handle(Event::Accepted(match effect {
            Effect::Propose(s) => s,
            other => panic!("unexpected {:?}", other),
        }));
        assert_eq!(proposed(&effect), StateType::Running);
        assert!(m.can_cancel());
        assert_eq!(proposed(&m.handle(Event::CancelRequested)), StateType::Cancelling);
    }

    #[test]
    fn test_retry_delay_past_calendar_saturates() {
        for delay in [Duration::from_secs(1 << 43), Duration::MAX] {
            let mut m = RunMachine::new(MachineConfig {
                retry: RetryPolicy::new(1).with_delay(RetryDelay::Constant(delay)),
                ..MachineConfig::default()
            });
            accept_all(&mut m, Effect::Propose(State::pending()));

            let effect = m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::msg("x"))));
            match &effect {
                Effect::Propose(state) => {
                    assert_eq!(state.state_type(), StateType::AwaitingRetry);
                    assert_eq!(state.scheduled_time(), Some(DateTime::<Utc>::MAX_UTC));
                }
                other => panic!("unexpected {:?}", other),
            }
            match accept_all(&mut m, effect) {
                Effect::Sleep(d) => assert!(d > Duration::from_secs(365 * 24 * 3600)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_timeout_is_named_timed_out() {
        let mut m = machine(0);
        accept_all(&mut m, Effect::Propose(State::pending()));
        let effect = m.handle(Event::BodyFinished(BodyOutcome::TimedOut(Duration::from_millis(100))));
        match effect {
            Effect::Propose(state) => {
                assert!(state.is_failed());
                assert_eq!(state.name(), TIMED_OUT);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timeout_counts_against_retries() {
        let mut m = machine(1);
        accept_all(&mut m, Effect::Propose(State::pending()));
        let effect = m.handle(Event::BodyFinished(BodyOutcome::TimedOut(Duration::from_millis(10))));
        assert_eq!(proposed(&effect), StateType::Retrying);
    }

    #[test]
    fn test_body_crash_is_not_retried() {
        let mut m = machine(3);
        accept_all(&mut m, Effect::Propose(State::pending()));
        let effect = m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::crash("lost"))));
        assert_eq!(proposed(&effect), StateType::Crashed);
    }

    #[test]
    fn test_orchestrator_answer_wins() {
        let mut m = machine(3);
        accept_all(&mut m, Effect::Propose(State::pending()));
        m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::msg("x"))));

        // The orchestrator turns the proposed retry into a failure
        let effect = m.handle(Event::Accepted(State::failed(TaskError::msg("x"))));
        assert!(matches!(effect, Effect::Finish(ref s) if s.is_failed()));
    }

    #[test]
    fn test_pause_and_resume() {
        let mut m = machine(0);
        let effect = m.handle(Event::Start);
        m.handle(Event::Accepted(match effect {
            Effect::Propose(s) => s,
            other => panic!("unexpected {:?}", other),
        }));
        assert_eq!(m.handle(Event::Accepted(State::paused())), Effect::AwaitResume);
        assert_eq!(
            m.handle(Event::Accepted(State::running())),
            Effect::Invoke { attempt: 1 }
        );
    }

    #[test]
    fn test_cancel_during_body_drains() {
        let mut m = machine(0);
        accept_all(&mut m, Effect::Propose(State::pending()));
        assert!(m.can_cancel());

        let effect = m.handle(Event::CancelRequested);
        assert_eq!(proposed(&effect), StateType::Cancelling);
        assert!(!m.can_cancel());

        assert_eq!(m.handle(Event::Accepted(State::cancelling())), Effect::DrainBody);
        let effect = m.handle(Event::Drained);
        assert_eq!(proposed(&effect), StateType::Cancelled);
    }

    #[test]
    fn test_cancel_while_sleeping_skips_drain() {
        let mut m = RunMachine::new(MachineConfig {
            retry: RetryPolicy::new(1).with_delay(RetryDelay::Constant(Duration::from_secs(30))),
            ..MachineConfig::default()
        });
        accept_all(&mut m, Effect::Propose(State::pending()));
        let effect = m.handle(Event::BodyFinished(BodyOutcome::Raised(TaskError::msg("x"))));
        accept_all(&mut m, effect);

        let effect = m.handle(Event::CancelRequested);
        let effect = m.handle(Event::Accepted(match effect {
            Effect::Propose(s) => s,
            other => panic!("unexpected {:?}", other),
        }));
        assert_eq!(proposed(&effect), StateType::Cancelled);
    }

    #[test]
    fn test_unreported_crash_finishes_locally() {
        let mut m = machine(0);
        m.handle(Event::Start);
        let effect = m.handle(Event::Crashed(TaskError::crash("unreachable")));
        assert_eq!(proposed(&effect), StateType::Crashed);

        match m.handle(Event::Crashed(TaskError::crash("still unreachable"))) {
            Effect::Finish(state) => assert!(state.is_crashed()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(m.is_done());
    }

    #[test]
    fn test_events_after_finish_are_ignored() {
        let mut m = machine(0);
        m.handle(Event::Start);
        m.handle(Event::Accepted(State::cancelled("gone")));
        assert_eq!(m.handle(Event::DelayElapsed), Effect::Idle);
        assert_eq!(m.handle(Event::Start), Effect::Idle);
    }
}
