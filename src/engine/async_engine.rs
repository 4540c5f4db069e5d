use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::future::resolve_inputs_or_cancel_async;
use crate::state::{State, StateType};

use super::definition::TaskBody;
use super::lifecycle::{invoke_blocking, panic_failure, Launch, LaunchGuard};
use super::machine::{BodyOutcome, Effect, Event, RunMachine};
use super::{Engine, RunRequest};

/// A spawned body, aborted if the driver drops it before it finishes.
struct BodyTask(JoinHandle<Result<Value, TaskError>>);

impl BodyTask {
    fn abort(&self) {
        self.0.abort();
    }
}

impl Future for BodyTask {
    type Output = Result<Result<Value, TaskError>, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl Drop for BodyTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives runs on a tokio runtime.
///
/// Orchestrator calls, cache reads, lock acquisition and transaction
/// commits may block, so they run on the blocking pool. Async bodies run
/// as tasks and blocking bodies on the blocking pool. Semantics are the
/// same as [`SyncEngine`](super::SyncEngine).
#[derive(Debug, Clone)]
pub struct AsyncEngine {
    engine: Engine,
}

impl AsyncEngine {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Runs `request` to a final state.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn run(&self, request: RunRequest) -> State {
        let resolved = resolve_inputs_or_cancel_async(&request.inputs, &request.cancel)
            .await
            .map(|p| request.merge_inputs(p));

        let engine = self.engine.clone();
        let cancel = request.cancel.clone();
        // The guard is built on the blocking thread so that a launch
        // prepared after this task was aborted is still rolled back
        let guard = match tokio::task::spawn_blocking(move || {
            Launch::prepare(&engine, &request, resolved).map(LaunchGuard::new)
        })
        .await
        {
            Ok(Ok(guard)) => guard,
            Ok(Err(state)) => return state,
            Err(e) => return State::crashed(join_failure("prepare", e)),
        };

        let state = self.drive(guard.launch(), &cancel).await;

        // Blocking tasks run to completion, so finalizing is not cut short
        // by an abort from here on
        let launch = guard.disarm();
        let run_id = launch.run_id();
        let final_state = state.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || launch.finalize(&final_state)).await {
            warn!("Finalizing run {} failed: {}", run_id, e);
        }
        state
    }

    async fn drive(&self, launch: &Launch, cancel: &CancellationToken) -> State {
        let settings = &self.engine.settings().engine;
        let config = launch.machine_config();
        let timeout = config.timeout;
        let mut machine = RunMachine::new(config);
        let mut effect = machine.handle(Event::Start);
        let mut current = State::pending();
        let mut in_flight: Option<BodyTask> = None;

        loop {
            if matches!(effect, Effect::Propose(_) | Effect::CheckCache)
                && cancel.is_cancelled()
                && machine.can_cancel()
            {
                effect = machine.handle(Event::CancelRequested);
            }

            effect = match effect {
                Effect::Propose(state) => {
                    let proposer = launch.clone();
                    match tokio::task::spawn_blocking(move || proposer.propose(state)).await {
                        Ok(Ok(accepted)) => {
                            current = accepted.clone();
                            machine.handle(Event::Accepted(accepted))
                        }
                        Ok(Err(e)) => {
                            warn!("Could not propose state for run {}: {}", launch.run_id(), e);
                            machine.handle(Event::Crashed(TaskError::crash(e.to_string())))
                        }
                        Err(e) => machine.handle(Event::Crashed(join_failure("propose", e))),
                    }
                }

                Effect::CheckCache => {
                    let reader = launch.clone();
                    let hit = tokio::task::spawn_blocking(move || reader.check_cache())
                        .await
                        .unwrap_or_else(|e| {
                            warn!("Cache read for run {} failed: {}", launch.run_id(), e);
                            None
                        });
                    machine.handle(Event::CacheChecked(hit))
                }

                Effect::Invoke { .. } => {
                    launch.fire_on_running(&current);
                    let attempt_cancel = cancel.child_token();
                    let mut body = spawn_body(launch, attempt_cancel.clone());
                    let cancellable = machine.can_cancel();

                    let deadline = async {
                        match timeout {
                            Some(t) => tokio::time::sleep(t).await,
                            None => std::future::pending::<()>().await,
                        }
                    };

                    tokio::select! {
                        result = &mut body => {
                            machine.handle(Event::BodyFinished(body_outcome(result)))
                        }
                        _ = deadline => {
                            attempt_cancel.cancel();
                            // Only async bodies stop here; blocking ones run on
                            body.abort();
                            machine.handle(Event::BodyFinished(BodyOutcome::TimedOut(
                                timeout.unwrap_or_default(),
                            )))
                        }
                        _ = cancel.cancelled(), if cancellable => {
                            in_flight = Some(body);
                            machine.handle(Event::CancelRequested)
                        }
                    }
                }

                Effect::Sleep(delay) => {
                    debug!("Run {} sleeping for {:?}", launch.run_id(), delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => machine.handle(Event::DelayElapsed),
                        _ = cancel.cancelled() => machine.handle(Event::CancelRequested),
                    }
                }

                Effect::AwaitResume => loop {
                    tokio::select! {
                        _ = tokio::time::sleep(settings.pause_poll_interval()) => {}
                        _ = cancel.cancelled() => break machine.handle(Event::CancelRequested),
                    }
                    let reader = launch.clone();
                    match tokio::task::spawn_blocking(move || reader.read_state()).await {
                        Ok(Ok(Some(state))) if state.state_type() != StateType::Paused => {
                            debug!("Run {} left Paused as {}", launch.run_id(), state);
                            current = state.clone();
                            break machine.handle(Event::Accepted(state));
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            break machine.handle(Event::Crashed(TaskError::crash(e.to_string())))
                        }
                        Err(e) => break machine.handle(Event::Crashed(join_failure("read_state", e))),
                    }
                },

                Effect::DrainBody => {
                    if let Some(mut body) = in_flight.take() {
                        let grace = settings.cancellation_grace();
                        if tokio::time::timeout(grace, &mut body).await.is_err() {
                            warn!(
                                "Body of run {} did not stop within {:?} of cancellation",
                                launch.run_id(),
                                grace
                            );
                            body.abort();
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

fn spawn_body(launch: &Launch, cancel: CancellationToken) -> BodyTask {
    let ctx = launch.attempt_context(cancel);
    let params = launch.parameters().clone();
    let handle = match launch.definition().body().clone() {
        TaskBody::Async(f) => tokio::spawn(f(ctx, params)),
        body @ TaskBody::Sync(_) => {
            tokio::task::spawn_blocking(move || invoke_blocking(&body, ctx, params))
        }
    };
    BodyTask(handle)
}

fn body_outcome(result: Result<Result<Value, TaskError>, JoinError>) -> BodyOutcome {
    match result {
        Ok(result) => result.into(),
        Err(e) if e.is_panic() => BodyOutcome::Raised(panic_failure(e.into_panic())),
        Err(e) => BodyOutcome::Raised(TaskError::crash(format!("Body task failed: {}", e))),
    }
}

fn join_failure(step: &str, err: JoinError) -> TaskError {
    TaskError::crash(format!("{} task failed: {}", step, err))
}
