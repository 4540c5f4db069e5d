use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::future::resolve_inputs_or_cancel;
use crate::state::{State, StateType};

use super::lifecycle::{invoke_blocking, Launch, LaunchGuard};
use super::machine::{BodyOutcome, Effect, Event, RunMachine};
use super::{Engine, RunRequest};

/// How often blocking waits wake up to check deadlines and cancellation.
const POLL_SLICE: Duration = Duration::from_millis(50);

type BodyResult = Result<Value, TaskError>;

/// Drives runs on the calling thread.
///
/// Each body attempt runs on a dedicated thread so the driver can enforce
/// the timeout and react to cancellation while the body is busy. A body
/// that outlives its timeout is left to finish on its own thread; its
/// cancellation token is fired so cooperative bodies can stop early.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    engine: Engine,
}

impl SyncEngine {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Runs `request` to a final state, blocking the current thread.
    pub fn run(&self, request: RunRequest) -> State {
        let resolved = resolve_inputs_or_cancel(&request.inputs, &request.cancel)
            .map(|p| request.merge_inputs(p));
        let guard = match Launch::prepare(&self.engine, &request, resolved) {
            Ok(launch) => LaunchGuard::new(launch),
            Err(state) => return state,
        };

        let state = self.drive(guard.launch(), &request.cancel);
        guard.disarm().finalize(&state);
        state
    }

    fn drive(&self, launch: &Launch, cancel: &CancellationToken) -> State {
        let settings = &self.engine.settings().engine;
        let config = launch.machine_config();
        let timeout = config.timeout;
        let mut machine = RunMachine::new(config);
        let mut effect = machine.handle(Event::Start);
        let mut current = State::pending();
        let mut in_flight: Option<Receiver<BodyResult>> = None;

        loop {
            if matches!(effect, Effect::Propose(_) | Effect::CheckCache)
                && cancel.is_cancelled()
                && machine.can_cancel()
            {
                effect = machine.handle(Event::CancelRequested);
            }

            effect = match effect {
                Effect::Propose(state) => match launch.propose(state) {
                    Ok(accepted) => {
                        current = accepted.clone();
                        machine.handle(Event::Accepted(accepted))
                    }
                    Err(e) => {
                        warn!("Could not propose state for run {}: {}", launch.run_id(), e);
                        machine.handle(Event::Crashed(TaskError::crash(e.to_string())))
                    }
                },

                Effect::CheckCache => machine.handle(Event::CacheChecked(launch.check_cache())),

                Effect::Invoke { attempt } => {
                    launch.fire_on_running(&current);
                    let attempt_cancel = cancel.child_token();
                    match spawn_body(launch, attempt, attempt_cancel.clone()) {
                        Err(e) => machine.handle(Event::Crashed(TaskError::crash(format!(
                            "Could not start body thread: {}",
                            e
                        )))),
                        Ok(rx) => {
                            let deadline = timeout.and_then(|t| {
                                Instant::now().checked_add(t).map(|at| (at, t))
                            });
                            loop {
                                match rx.recv_timeout(POLL_SLICE) {
                                    Ok(result) => {
                                        break machine.handle(Event::BodyFinished(result.into()))
                                    }
                                    Err(RecvTimeoutError::Disconnected) => {
                                        break machine.handle(Event::BodyFinished(
                                            BodyOutcome::Raised(TaskError::crash(
                                                "Body thread exited without a result",
                                            )),
                                        ))
                                    }
                                    Err(RecvTimeoutError::Timeout) => {}
                                }

                                if let Some((at, limit)) = deadline {
                                    if Instant::now() >= at {
                                        attempt_cancel.cancel();
                                        break machine
                                            .handle(Event::BodyFinished(BodyOutcome::TimedOut(limit)));
                                    }
                                }
                                if cancel.is_cancelled() && machine.can_cancel() {
                                    in_flight = Some(rx);
                                    break machine.handle(Event::CancelRequested);
                                }
                            }
                        }
                    }
                }

                Effect::Sleep(delay) => {
                    debug!("Run {} sleeping for {:?}", launch.run_id(), delay);
                    let until = Instant::now().checked_add(delay);
                    loop {
                        let now = Instant::now();
                        if matches!(until, Some(at) if now >= at) {
                            break machine.handle(Event::DelayElapsed);
                        }
                        if cancel.is_cancelled() && machine.can_cancel() {
                            break machine.handle(Event::CancelRequested);
                        }
                        let remaining = until.map_or(POLL_SLICE, |at| at - now);
                        thread::sleep(remaining.min(POLL_SLICE));
                    }
                }

                Effect::AwaitResume => loop {
                    thread::sleep(settings.pause_poll_interval());
                    if cancel.is_cancelled() && machine.can_cancel() {
                        break machine.handle(Event::CancelRequested);
                    }
                    match launch.read_state() {
                        Ok(Some(state)) if state.state_type() != StateType::Paused => {
                            debug!("Run {} left Paused as {}", launch.run_id(), state);
                            current = state.clone();
                            break machine.handle(Event::Accepted(state));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            break machine.handle(Event::Crashed(TaskError::crash(e.to_string())))
                        }
                    }
                },

                Effect::DrainBody => {
                    if let Some(rx) = in_flight.take() {
                        if rx.recv_timeout(settings.cancellation_grace()).is_err() {
                            warn!(
                                "Body of run {} did not stop within {:?} of cancellation",
                                launch.run_id(),
                                settings.cancellation_grace()
                            );
                        }
                    }
                    machine.handle(Event::Drained)
                }

                Effect::Finish(state) => return state,

                Effect::Idle => {
                    return State::crashed(TaskError::crash(format!(
                        "Run machine stalled after {}",
                        current
                    )))
                }
            };
        }
    }
}

fn spawn_body(
    launch: &Launch,
    attempt: u32,
    cancel: CancellationToken,
) -> std::io::Result<Receiver<BodyResult>> {
    let (tx, rx) = channel();
    let body = launch.definition().body().clone();
    let ctx = launch.attempt_context(cancel);
    let params = launch.parameters().clone();

    thread::Builder::new()
        .name(format!("{}-{}", launch.definition().name(), attempt))
        .spawn(move || {
            let result = invoke_blocking(&body, ctx, params);
            // The driver may have moved on after a timeout
            let _ = tx.send(result);
        })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::definition::TaskDefinition;
    use crate::orchestration::{InMemoryOrchestrator, OrchestrationClient, RunCreate};
    use crate::run::RunKind;
    use crate::retry::RetryDelay;
    use crate::future::{Backend, Completion, RunFuture};
    use crate::state::TIMED_OUT;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn engine() -> (Engine, InMemoryOrchestrator) {
        let orchestrator = InMemoryOrchestrator::new();
        let engine = Engine::builder()
            .client(Arc::new(orchestrator.clone()))
            .storage(Arc::new(MemoryStorage::new()))
            .build();
        (engine, orchestrator)
    }

    #[test]
    fn test_runs_to_completion() {
        let (engine, orchestrator) = engine();
        let def = TaskDefinition::new("add", |_, p| {
            Ok(json!(p["x"].as_i64().unwrap_or(0) + p["y"].as_i64().unwrap_or(0)))
        });
        let request = RunRequest::new(def)
            .with_param("x", json!(1))
            .with_param("y", json!(2));
        let run_id = request.run_id();

        let state = SyncEngine::new(engine).run(request);
        assert_eq!(state.value().unwrap(), json!(3));
        assert_eq!(
            orchestrator.history().state_types(run_id),
            vec![StateType::Pending, StateType::Running, StateType::Completed]
        );
    }

    #[test]
    fn test_panicking_body_fails() {
        let (engine, _) = engine();
        let def = TaskDefinition::new("boom", |_, _| panic!("kaboom"));
        let state = SyncEngine::new(engine).run(RunRequest::new(def));
        assert!(state.is_failed());
        assert_eq!(state.failure().unwrap().type_name, "Panic");
        assert_eq!(state.failure().unwrap().message, "kaboom");
    }

    #[test]
    fn test_retries_until_success() {
        let (engine, orchestrator) = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let def = TaskDefinition::new("flaky", move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TaskError::msg("not yet"))
            } else {
                Ok(json!("ok"))
            }
        })
        .with_retries(3);
        let request = RunRequest::new(def);
        let run_id = request.run_id();

        let state = SyncEngine::new(engine).run(request);
        assert_eq!(state.value().unwrap(), json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(orchestrator.history().count(run_id, StateType::Retrying), 2);
        assert_eq!(orchestrator.run(run_id).unwrap().run_count, 3);
    }

    #[test]
    fn test_timeout_fails_as_timed_out() {
        let (engine, _) = engine();
        let def = TaskDefinition::new("slow", |ctx, _| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(json!("too late"))
        })
        .with_timeout(Duration::from_millis(100));

        let state = SyncEngine::new(engine).run(RunRequest::new(def));
        assert!(state.is_failed());
        assert_eq!(state.name(), TIMED_OUT);
        assert_eq!(
            state.message(),
            Some("Run exceeded timeout of 0.1 second(s)")
        );
    }

    #[test]
    fn test_delayed_retry_waits() {
        let (engine, orchestrator) = engine();
        let def = TaskDefinition::new("always-fails", |_, _| Err(TaskError::msg("no")))
            .with_retries(1)
            .with_retry_delay(RetryDelay::Constant(Duration::from_millis(50)));
        let request = RunRequest::new(def);
        let run_id = request.run_id();

        let started = Instant::now();
        let state = SyncEngine::new(engine).run(request);
        assert!(state.is_failed());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(orchestrator.history().count(run_id, StateType::AwaitingRetry), 1);
    }

    #[test]
    fn test_cancel_while_running() {
        let (engine, _) = engine();
        let def = TaskDefinition::new("waits", |ctx, _| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Err(TaskError::cancelled("stopped"))
        });
        let cancel = CancellationToken::new();
        let request = RunRequest::new(def).with_cancel_token(cancel.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let state = SyncEngine::new(engine).run(request);
        canceller.join().unwrap();
        assert!(state.is_cancelled());
    }

    #[test]
    fn test_cancel_while_waiting_on_upstream() {
        let (engine, orchestrator) = engine();
        let upstream = RunFuture::new(
            uuid::Uuid::new_v4(),
            Arc::new(Completion::new()),
            Backend::Thread {
                cancel: CancellationToken::new(),
            },
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let def = TaskDefinition::new("downstream", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        });
        let cancel = CancellationToken::new();
        let request = RunRequest::new(def)
            .with_input("x", &upstream)
            .with_cancel_token(cancel.clone());
        let run_id = request.run_id();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        });
        let state = SyncEngine::new(engine).run(request);
        canceller.join().unwrap();

        assert!(state.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            orchestrator.history().state_types(run_id),
            vec![StateType::Pending, StateType::Cancelled]
        );
    }

    #[test]
    fn test_paused_run_resumes() {
        let (engine, orchestrator) = engine();
        let mut settings = engine.settings().clone();
        settings.engine.pause_poll_interval_ms = 10;
        let engine = Engine::builder()
            .client(Arc::new(orchestrator.clone()))
            .storage(Arc::new(MemoryStorage::new()))
            .settings(settings)
            .build();

        let def = TaskDefinition::new("pausable", |_, _| Ok(json!(1)));
        let request = RunRequest::new(def);
        let run_id = request.run_id();

        // Register the run up front so the pause is pending before it starts
        orchestrator
            .create_run(RunCreate {
                id: run_id,
                name: "pausable".to_string(),
                kind: RunKind::Task,
                definition_ref: "task/pausable".to_string(),
                parameters: Default::default(),
                retries: 0,
                parent_run_id: None,
            })
            .unwrap();
        orchestrator.pause(run_id).unwrap();

        let watcher = {
            let orchestrator = orchestrator.clone();
            thread::spawn(move || {
                let paused = |o: &InMemoryOrchestrator| {
                    o.run(run_id).and_then(|r| r.state_type()) == Some(StateType::Paused)
                };
                while !paused(&orchestrator) {
                    thread::sleep(Duration::from_millis(5));
                }
                orchestrator.resume(run_id).unwrap();
            })
        };

        let state = SyncEngine::new(engine).run(request);
        watcher.join().unwrap();
        assert!(state.is_completed());
        assert!(orchestrator
            .history()
            .state_types(run_id)
            .contains(&StateType::Paused));
    }
}
