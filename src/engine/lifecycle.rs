//! Run setup, I/O and teardown shared by both drivers.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::CacheKeyContext;
use crate::error::TaskError;
use crate::orchestration::{ClientError, RunCreate, TransitionRequest};
use crate::run::{Parameters, RunKind};
use crate::state::{State, StateType};
use crate::transaction::{Transaction, TxnOptions};

use super::context::RunContext;
use super::definition::{StateHook, TaskBody, TaskDefinition};
use super::machine::MachineConfig;
use super::{Engine, RunRequest};

/// A run that has been created at the orchestrator and is ready to drive.
#[derive(Clone)]
pub(crate) struct Launch {
    engine: Engine,
    definition: TaskDefinition,
    run_id: Uuid,
    parameters: Parameters,
    precondition: Option<TaskError>,
    key: Option<String>,
    txn: Transaction,
    ctx: RunContext,
}

impl Launch {
    /// Binds parameters, creates the run and opens its transaction.
    ///
    /// `resolved` holds the request's parameters merged with its resolved
    /// inputs, or the upstream failure that stopped resolution. Returns
    /// the final state directly when the run cannot even be created.
    pub(crate) fn prepare(
        engine: &Engine,
        request: &RunRequest,
        resolved: Result<Parameters, TaskError>,
    ) -> Result<Self, State> {
        let definition = request.definition.clone();
        let run_id = request.run_id;
        let settings = engine.settings();

        let (parameters, precondition) = match resolved.and_then(|p| definition.bind(p)) {
            Ok(parameters) => (parameters, None),
            Err(failure) => {
                debug!("Run {} will fail before starting: {}", run_id, failure);
                (request.parameters.clone(), Some(failure))
            }
        };

        let parent = request.parent.as_ref();
        let create = RunCreate {
            id: run_id,
            name: definition.name().to_string(),
            kind: definition.kind(),
            definition_ref: definition.definition_ref(),
            parameters: parameters.clone(),
            retries: definition.retry_policy(&settings.tasks).retries,
            parent_run_id: parent.map(|p| p.run_id),
        };
        if let Err(e) = engine.client().create_run(create) {
            error!("Could not create run {} for {}: {}", run_id, definition.name(), e);
            return Err(State::crashed(TaskError::crash(format!(
                "Could not create run: {}",
                e
            ))));
        }

        let flow_parameters = match definition.kind() {
            RunKind::Flow => Some(parameters.clone()),
            RunKind::Task => parent.and_then(|p| p.flow_parameters.clone()),
        };

        let policy = definition.cache_policy();
        let key = if precondition.is_none() {
            policy.compute_key(&CacheKeyContext {
                run_id: Some(run_id),
                definition_name: definition.name().to_string(),
                definition_source: definition.source().to_string(),
                scope: parent.map(|p| p.run_id),
                parameters: parameters.clone(),
                flow_parameters: flow_parameters.clone(),
            })
        } else {
            None
        };

        let mut store = engine.store().as_ref().clone();
        if let Some(key_storage) = policy.key_storage() {
            store = store.with_key_storage(Arc::clone(key_storage));
        }
        if let Some(lock_manager) = policy.lock_manager() {
            store = store.with_lock_manager(Arc::clone(lock_manager));
        }

        let mut options = TxnOptions::new()
            .with_store(Arc::new(store))
            .with_isolation(policy.isolation_level())
            .with_holder(run_id.to_string())
            .with_lock_timeout(settings.locks.acquire_timeout());
        if let Some(key) = &key {
            options = options.with_key(key.clone());
        }

        let scope = parent.and_then(|p| p.scope.clone());
        let txn = match &scope {
            Some(scope) => scope.begin_child(options),
            None => Transaction::begin(options),
        };

        let ctx = RunContext {
            engine: engine.clone(),
            run_id,
            run_name: definition.name().to_string(),
            kind: definition.kind(),
            parent_run_id: parent.map(|p| p.run_id),
            flow_run_id: match definition.kind() {
                RunKind::Flow => Some(run_id),
                RunKind::Task => parent.and_then(|p| p.flow_run_id),
            },
            flow_parameters,
            scope,
            txn: txn.clone(),
            cancel: request.cancel.clone(),
        };

        Ok(Self {
            engine: engine.clone(),
            definition,
            run_id,
            parameters,
            precondition,
            key,
            txn,
            ctx,
        })
    }

    pub(crate) fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub(crate) fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub(crate) fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub(crate) fn machine_config(&self) -> MachineConfig {
        let tasks = &self.engine.settings().tasks;
        MachineConfig {
            retry: self.definition.retry_policy(tasks),
            timeout: self.definition.effective_timeout(tasks),
            cache_enabled: self.key.is_some(),
            precondition: self.precondition.clone(),
        }
    }

    /// Context for one body invocation, cancelled by `cancel`.
    pub(crate) fn attempt_context(&self, cancel: CancellationToken) -> RunContext {
        self.ctx.with_cancel(cancel)
    }

    pub(crate) fn propose(&self, state: State) -> Result<State, ClientError> {
        let request = TransitionRequest::new(self.run_id, state);
        self.engine.client().propose_transition(&request)
    }

    pub(crate) fn read_state(&self) -> Result<Option<State>, ClientError> {
        self.engine.client().read_state(self.run_id)
    }

    /// Reads the run's cache key through its transaction.
    pub(crate) fn check_cache(&self) -> Option<Value> {
        let key = self.key.as_deref()?;
        let hit = self.txn.read_own();
        match &hit {
            Some(_) => debug!("Cache hit for run {} (key {})", self.run_id, key),
            None => debug!("Cache miss for run {} (key {})", self.run_id, key),
        }
        hit
    }

    pub(crate) fn fire_on_running(&self, state: &State) {
        for hook in &self.definition.hooks().on_running {
            run_state_hook("on_running", hook, &self.ctx, state);
        }
    }

    /// Resolves the run's transaction and fires its final state hooks.
    ///
    /// A completed run stages its result under its cache key, registers
    /// its commit and rollback hooks and commits. Any other outcome rolls
    /// the transaction back.
    pub(crate) fn finalize(&self, state: &State) {
        if state.is_completed() {
            if !state.is_cached() {
                self.stage_result(state);
            }
            if let Err(e) = self.txn.commit() {
                warn!("Transaction of run {} did not commit: {}", self.run_id, e);
            }
        } else {
            self.txn.rollback();
        }

        info!(
            "{} run {} ({}) finished: {}",
            self.definition.kind(),
            self.definition.name(),
            self.run_id,
            state
        );

        let hooks = self.definition.hooks();
        let (kind, list) = match state.state_type() {
            StateType::Completed => ("on_completion", &hooks.on_completion),
            StateType::Failed => ("on_failure", &hooks.on_failure),
            StateType::Crashed => ("on_crashed", &hooks.on_crashed),
            StateType::Cancelled => ("on_cancellation", &hooks.on_cancellation),
            _ => return,
        };
        for hook in list {
            run_state_hook(kind, hook, &self.ctx, state);
        }
    }

    fn stage_result(&self, state: &State) {
        if self.key.is_some() {
            let expiration = self
                .definition
                .cache_expiration()
                .and_then(|d| chrono::Duration::from_std(d).ok())
                .and_then(|d| Utc::now().checked_add_signed(d));
            let value = state.value().unwrap_or(Value::Null);
            if let Err(e) = self.txn.stage(value, expiration) {
                warn!("Could not stage result of run {}: {}", self.run_id, e);
            }
        }
        for hook in self.definition.commit_hooks() {
            if let Err(e) = self.txn.add_on_commit(Arc::clone(hook)) {
                warn!("Could not register commit hook of run {}: {}", self.run_id, e);
            }
        }
        for hook in self.definition.rollback_hooks() {
            if let Err(e) = self.txn.add_on_rollback(Arc::clone(hook)) {
                warn!("Could not register rollback hook of run {}: {}", self.run_id, e);
            }
        }
    }
}

/// Holds a prepared launch until it is finalized.
///
/// Dropping an armed guard means the driver went away mid-run, as when
/// its tokio task is aborted or a driver thread panics. The run's bodies
/// are cancelled and its transaction rolled back, which releases any
/// serializable lock it took.
pub(crate) struct LaunchGuard {
    launch: Launch,
    armed: bool,
}

impl LaunchGuard {
    pub(crate) fn new(launch: Launch) -> Self {
        Self {
            launch,
            armed: true,
        }
    }

    pub(crate) fn launch(&self) -> &Launch {
        &self.launch
    }

    /// Hands the launch over for finalizing.
    pub(crate) fn disarm(mut self) -> Launch {
        self.armed = false;
        self.launch.clone()
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Run {} was abandoned before finishing", self.launch.run_id);
        self.launch.ctx.cancel.cancel();
        if self.launch.txn.rollback() {
            debug!("Rolled back transaction of abandoned run {}", self.launch.run_id);
        }
    }
}

fn run_state_hook(kind: &str, hook: &StateHook, ctx: &RunContext, state: &State) {
    match catch_unwind(AssertUnwindSafe(|| hook(ctx, state))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} hook of run {} failed: {}", kind, ctx.run_id(), e),
        Err(_) => error!("{} hook of run {} panicked", kind, ctx.run_id()),
    }
}

/// Extracts the message of a caught panic.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn panic_failure(payload: Box<dyn Any + Send>) -> TaskError {
    TaskError::new("Panic", panic_message(payload))
}

/// Invokes a body on the current thread.
///
/// Async bodies get a current-thread runtime of their own. A panic in the
/// body becomes an execution failure.
pub(crate) fn invoke_blocking(
    body: &TaskBody,
    ctx: RunContext,
    params: Parameters,
) -> Result<Value, TaskError> {
    match body {
        TaskBody::Sync(f) => catch_unwind(AssertUnwindSafe(|| f(&ctx, &params)))
            .unwrap_or_else(|payload| Err(panic_failure(payload))),
        TaskBody::Async(f) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| TaskError::crash(format!("Could not start body runtime: {}", e)))?;
            runtime.block_on(async {
                AssertUnwindSafe(f(ctx, params))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(panic_failure(payload)))
            })
        }
    }
}
