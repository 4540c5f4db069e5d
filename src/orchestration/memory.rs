use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use uuid::Uuid;

use crate::error::TaskError;
use crate::run::Run;
use crate::state::{is_legal, validate, RunHistory, State, StateType};

use super::{ClientError, OrchestrationClient, RunCreate, TransitionRequest};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<Uuid, Run>,
    /// Answers already given to runs still in flight, by idempotency key
    responses: HashMap<Uuid, State>,
    /// Keys in `responses` for each run
    response_keys: HashMap<Uuid, Vec<Uuid>>,
    pause_requests: HashSet<Uuid>,
    history: RunHistory,
}

/// In-process orchestrator enforcing the transition rules.
///
/// Besides validating transitions it applies the orchestration rules a
/// server would:
///
/// - a proposal from a terminal state is answered with that state
/// - a pending pause request turns a proposed `Running` into `Paused`
/// - a retry proposed after the run's retry budget is spent becomes `Failed`
///
/// Answers are kept for replay only while a run is in flight. Once it is
/// terminal, every proposal is answered with the final state anyway.
///
/// Clones share the same run table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrchestrator {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>, ClientError> {
        self.inner
            .lock()
            .map_err(|_| ClientError::Api("orchestrator state poisoned".to_string()))
    }

    /// Returns a snapshot of the run.
    pub fn run(&self, run_id: Uuid) -> Option<Run> {
        self.inner().ok()?.runs.get(&run_id).cloned()
    }

    /// Returns all runs, in no particular order.
    pub fn runs(&self) -> Vec<Run> {
        self.inner()
            .map(|i| i.runs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the runs nested under `parent`.
    pub fn children_of(&self, parent: Uuid) -> Vec<Run> {
        self.runs()
            .into_iter()
            .filter(|r| r.parent_run_id == Some(parent))
            .collect()
    }

    /// Returns a copy of every accepted transition so far.
    pub fn history(&self) -> RunHistory {
        self.inner().map(|i| i.history.clone()).unwrap_or_default()
    }

    /// Asks for the run to pause the next time it proposes `Running`.
    pub fn pause(&self, run_id: Uuid) -> Result<(), ClientError> {
        let mut inner = self.inner()?;
        if !inner.runs.contains_key(&run_id) {
            return Err(ClientError::RunNotFound(run_id));
        }
        inner.pause_requests.insert(run_id);
        info!("Pause requested for run {}", run_id);
        Ok(())
    }

    /// Moves a paused run back to `Running`.
    pub fn resume(&self, run_id: Uuid) -> Result<State, ClientError> {
        let mut inner = self.inner()?;
        let Inner { runs, history, .. } = &mut *inner;
        let run = runs.get_mut(&run_id).ok_or(ClientError::RunNotFound(run_id))?;

        let running = State::running().with_message("Resumed");
        validate(run.state_type(), StateType::Running)?;
        run.run_count += 1;
        run.state = Some(running.clone());
        history.record(run_id, &running);
        info!("Run {} resumed", run_id);
        Ok(running)
    }
}

impl OrchestrationClient for InMemoryOrchestrator {
    fn create_run(&self, create: RunCreate) -> Result<Uuid, ClientError> {
        let mut inner = self.inner()?;
        if inner.runs.contains_key(&create.id) {
            debug!("Run {} already exists", create.id);
            return Ok(create.id);
        }

        let run = Run {
            id: create.id,
            name: create.name,
            kind: create.kind,
            definition_ref: create.definition_ref,
            parameters: create.parameters,
            state: None,
            run_count: 0,
            retries: create.retries,
            parent_run_id: create.parent_run_id,
        };
        debug!("Created {} run {} ({})", run.kind, run.name, run.id);
        inner.runs.insert(run.id, run);
        Ok(create.id)
    }

    fn propose_transition(&self, request: &TransitionRequest) -> Result<State, ClientError> {
        let mut inner = self.inner()?;
        if let Some(answer) = inner.responses.get(&request.idempotency_key) {
            debug!(
                "Replaying answer for transition {} of run {}",
                request.idempotency_key, request.run_id
            );
            return Ok(answer.clone());
        }

        let Inner {
            runs,
            responses,
            response_keys,
            pause_requests,
            history,
        } = &mut *inner;
        let run = runs
            .get_mut(&request.run_id)
            .ok_or(ClientError::RunNotFound(request.run_id))?;

        if let Some(current) = run.state.as_ref().filter(|s| s.is_terminal()) {
            let current = current.clone();
            debug!(
                "Run {} is already {}; rejecting proposed {}",
                run.id,
                current.state_type(),
                request.state.state_type()
            );
            return Ok(current);
        }

        let from = run.state_type();
        let mut accepted = request.state.clone();

        if accepted.state_type() == StateType::Running
            && from.map(|f| is_legal(f, StateType::Paused)).unwrap_or(false)
            && pause_requests.remove(&run.id)
        {
            accepted = State::paused().with_message("Paused by request");
        }

        if matches!(
            accepted.state_type(),
            StateType::Retrying | StateType::AwaitingRetry
        ) && run.run_count > run.retries
        {
            let failure = accepted
                .failure()
                .cloned()
                .unwrap_or_else(|| TaskError::msg("retries exhausted"));
            accepted = State::failed(failure).with_message("Retry budget exhausted");
        }

        validate(from, accepted.state_type())?;

        if accepted.state_type() == StateType::Running {
            run.run_count += 1;
        }
        run.state = Some(accepted.clone());
        history.record(run.id, &accepted);
        if accepted.is_terminal() {
            for key in response_keys.remove(&run.id).unwrap_or_default() {
                responses.remove(&key);
            }
            pause_requests.remove(&run.id);
        } else {
            responses.insert(request.idempotency_key, accepted.clone());
            response_keys
                .entry(run.id)
                .or_default()
                .push(request.idempotency_key);
        }

        info!("Run {} ({}) -> {}", run.name, run.id, accepted);
        Ok(accepted)
    }

    fn read_state(&self, run_id: Uuid) -> Result<Option<State>, ClientError> {
        let inner = self.inner()?;
        let run = inner
            .runs
            .get(&run_id)
            .ok_or(ClientError::RunNotFound(run_id))?;
        Ok(run.state.clone())
    }

    fn read_run(&self, run_id: Uuid) -> Result<Run, ClientError> {
        self.run(run_id).ok_or(ClientError::RunNotFound(run_id))
    }
}
