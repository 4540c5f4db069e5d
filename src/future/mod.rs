//! Run Futures
//!
//! A [`RunFuture`] is the handle returned when a run is submitted to a
//! task runner. It can be waited on from a thread or a tokio task, asked
//! for its result, and given callbacks that fire once the run finishes.
//!
//! Futures passed as inputs to another run form a dependency graph. The
//! engine resolves them (see [`resolve`]) before the dependent run starts.

mod completion;
pub mod resolve;

pub(crate) use completion::Completion;
pub use resolve::{
    resolve_futures_to_results, resolve_futures_to_results_async, resolve_futures_to_states,
    resolve_futures_to_states_async, resolve_inputs, resolve_inputs_async,
    resolve_inputs_or_cancel, resolve_inputs_or_cancel_async, Input, Inputs, ResolvedTree,
    MAX_INPUT_DEPTH,
};

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RunError;
use crate::state::{Outcome, State};

/// How the run behind a future is being driven.
#[derive(Clone)]
pub(crate) enum Backend {
    /// On a worker or caller thread
    Thread { cancel: CancellationToken },
    /// In a tokio task
    Task {
        cancel: CancellationToken,
        abort: AbortHandle,
    },
    /// Already finished when the future was created
    Ready,
}

impl Backend {
    fn name(&self) -> &'static str {
        match self {
            Self::Thread { .. } => "thread",
            Self::Task { .. } => "task",
            Self::Ready => "ready",
        }
    }
}

/// Handle to a submitted run's eventual final state.
#[derive(Clone)]
pub struct RunFuture {
    run_id: Uuid,
    completion: Arc<Completion>,
    backend: Backend,
}

impl RunFuture {
    pub(crate) fn new(run_id: Uuid, completion: Arc<Completion>, backend: Backend) -> Self {
        Self {
            run_id,
            completion,
            backend,
        }
    }

    /// Creates a future that is already finished with `state`.
    pub fn ready(run_id: Uuid, state: State) -> Self {
        Self::new(run_id, Arc::new(Completion::completed(state)), Backend::Ready)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Returns the final state if the run has finished.
    pub fn state(&self) -> Option<State> {
        self.completion.get()
    }

    /// Blocks until the run finishes or `timeout` passes.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<State> {
        self.completion.wait(timeout)
    }

    /// Waits for the run to finish without blocking the runtime.
    pub async fn wait_async(&self) -> State {
        self.completion.wait_async().await
    }

    /// Blocks for the run's result.
    ///
    /// With `raise_on_failure`, a failed, crashed or cancelled run yields
    /// `Err` carrying the stored failure. Without it, the failure comes
    /// back as [`Outcome::Error`].
    pub fn result(
        &self,
        timeout: Option<Duration>,
        raise_on_failure: bool,
    ) -> Result<Outcome, RunError> {
        let state = self
            .wait(timeout)
            .ok_or_else(|| RunError::WaitTimeout(timeout.unwrap_or_default()))?;
        state.result(raise_on_failure)
    }

    pub async fn result_async(&self, raise_on_failure: bool) -> Result<Outcome, RunError> {
        self.wait_async().await.result(raise_on_failure)
    }

    /// Blocks for the run's value, raising any failure.
    pub fn value(&self, timeout: Option<Duration>) -> Result<serde_json::Value, RunError> {
        self.result(timeout, true)?.into_result()
    }

    /// Registers `callback` to run once with the final state.
    ///
    /// If the run has already finished, the callback runs immediately on
    /// the calling thread. Panics inside callbacks are logged.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&State) + Send + 'static,
    {
        self.completion.add_callback(Box::new(callback));
    }

    /// Requests cooperative cancellation of the run.
    pub fn cancel(&self) {
        match &self.backend {
            Backend::Thread { cancel } | Backend::Task { cancel, .. } => cancel.cancel(),
            Backend::Ready => {}
        }
    }

    /// Stops driving the run.
    ///
    /// A run on a tokio task is aborted at its next suspension point and
    /// no further transitions are proposed; the future resolves `Crashed`.
    /// Runs on threads cannot be aborted and are cancelled instead.
    pub fn abort(&self) {
        match &self.backend {
            Backend::Task { abort, .. } => abort.abort(),
            _ => self.cancel(),
        }
    }
}

impl fmt::Debug for RunFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunFuture")
            .field("run_id", &self.run_id)
            .field("backend", &self.backend.name())
            .field("state", &self.state().map(|s| s.state_type()))
            .finish()
    }
}

/// Futures split by whether they finished.
#[derive(Debug, Clone, Default)]
pub struct DoneAndNotDone {
    pub done: Vec<RunFuture>,
    pub not_done: Vec<RunFuture>,
}

fn unique(futures: &[RunFuture]) -> Vec<RunFuture> {
    let mut seen = HashSet::new();
    futures
        .iter()
        .filter(|f| seen.insert(f.run_id))
        .cloned()
        .collect()
}

/// Waits for every future, up to `timeout` in total.
///
/// Futures with the same run id count once. Never fails; futures that do
/// not finish in time are returned in `not_done`.
pub fn wait(futures: &[RunFuture], timeout: Option<Duration>) -> DoneAndNotDone {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let mut result = DoneAndNotDone::default();

    for future in unique(futures) {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if future.wait(remaining).is_some() {
            result.done.push(future);
        } else {
            result.not_done.push(future);
        }
    }
    result
}

/// Async counterpart of [`wait`].
pub async fn wait_async(futures: &[RunFuture], timeout: Option<Duration>) -> DoneAndNotDone {
    let pending = unique(futures);
    let all = futures::future::join_all(pending.iter().map(|f| f.wait_async()));
    match timeout {
        Some(timeout) => {
            let _ = tokio::time::timeout(timeout, all).await;
        }
        None => {
            all.await;
        }
    }

    let (done, not_done): (Vec<_>, Vec<_>) = pending.into_iter().partition(|f| f.is_done());
    DoneAndNotDone { done, not_done }
}
