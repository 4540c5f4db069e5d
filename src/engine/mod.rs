//! Run Engine
//!
//! Drives task and flow runs through their lifecycle:
//!
//! - [`definition`]: task and flow definitions with their policies
//! - [`machine`]: the pure lifecycle state machine
//! - [`SyncEngine`]: drives runs on the calling thread
//! - [`AsyncEngine`]: drives runs on a tokio runtime
//!
//! Every state change is proposed to the orchestration client, and the
//! engine adopts whatever state the orchestrator answers with.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::engine::{Engine, RunRequest, TaskDefinition};
//! use serde_json::json;
//!
//! let engine = Engine::in_memory();
//! let double = TaskDefinition::new("double", |_ctx, params| {
//!     let x = params["x"].as_i64().unwrap_or(0);
//!     Ok(json!(x * 2))
//! })
//! .param("x");
//!
//! let request = RunRequest::new(double).with_param("x", json!(21));
//! assert_eq!(engine.execute(request).unwrap(), json!(42));
//! ```

mod async_engine;
pub mod context;
pub mod definition;
mod lifecycle;
pub mod machine;
mod sync_engine;

pub use async_engine::AsyncEngine;
pub use context::RunContext;
pub use definition::{ParameterSpec, StateHook, StateHooks, TaskBody, TaskDefinition};
pub use machine::{BodyOutcome, Effect, Event, MachineConfig, RunMachine};
pub use sync_engine::SyncEngine;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::RecordStore;
use crate::config::Settings;
use crate::error::RunError;
use crate::future::{Input, Inputs};
use crate::locking::{LockManager, MemoryLockManager};
use crate::orchestration::{InMemoryOrchestrator, OrchestrationClient, RetryingClient};
use crate::run::Parameters;
use crate::state::State;
use crate::storage::{LocalFileStorage, MemoryStorage, ResultStorage};
use crate::transaction::Transaction;

struct EngineInner {
    client: Arc<dyn OrchestrationClient>,
    settings: Settings,
    store: Arc<RecordStore>,
}

/// Shared handle to the orchestration client, settings and record store.
///
/// Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// An engine with an in-process orchestrator and in-memory storage.
    pub fn in_memory() -> Self {
        Self::builder()
            .client(Arc::new(InMemoryOrchestrator::new()))
            .storage(Arc::new(MemoryStorage::new()))
            .build()
    }

    /// The orchestration client, wrapped in transient-error retries.
    pub fn client(&self) -> &Arc<dyn OrchestrationClient> {
        &self.inner.client
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.inner.store
    }

    /// Runs to a final state on the calling thread.
    pub fn run(&self, request: RunRequest) -> State {
        SyncEngine::new(self.clone()).run(request)
    }

    pub async fn run_async(&self, request: RunRequest) -> State {
        AsyncEngine::new(self.clone()).run(request).await
    }

    /// Runs on the calling thread and returns the value, raising failures.
    pub fn execute(&self, request: RunRequest) -> Result<Value, RunError> {
        self.run(request).value()
    }

    pub async fn execute_async(&self, request: RunRequest) -> Result<Value, RunError> {
        self.run_async(request).await.value()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("client", &self.inner.client)
            .field("store", &self.inner.store)
            .finish()
    }
}

/// Builds an [`Engine`] from injected backends.
///
/// Without explicit storage, results go to local files under
/// `settings.results.storage_path`. Without a client, runs are tracked by
/// an [`InMemoryOrchestrator`].
#[derive(Default)]
pub struct EngineBuilder {
    client: Option<Arc<dyn OrchestrationClient>>,
    settings: Option<Settings>,
    storage: Option<Arc<dyn ResultStorage>>,
    key_storage: Option<Arc<dyn ResultStorage>>,
    lock_manager: Option<Arc<dyn LockManager>>,
}

impl EngineBuilder {
    pub fn client(mut self, client: Arc<dyn OrchestrationClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Storage for result values, and for cache records unless
    /// [`key_storage`](Self::key_storage) is set.
    pub fn storage(mut self, storage: Arc<dyn ResultStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn key_storage(mut self, storage: Arc<dyn ResultStorage>) -> Self {
        self.key_storage = Some(storage);
        self
    }

    pub fn lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = Some(lock_manager);
        self
    }

    pub fn build(self) -> Engine {
        let settings = self.settings.unwrap_or_default();

        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(LocalFileStorage::new(settings.results.storage_path.clone()))
        });
        let key_storage = self.key_storage.or_else(|| {
            settings
                .results
                .key_storage_path
                .as_ref()
                .map(|path| Arc::new(LocalFileStorage::new(path.clone())) as Arc<dyn ResultStorage>)
        });
        let lock_manager = self
            .lock_manager
            .unwrap_or_else(|| Arc::new(MemoryLockManager::new()));

        let mut store = RecordStore::new(storage, lock_manager);
        if let Some(key_storage) = key_storage {
            store = store.with_key_storage(key_storage);
        }

        let client = self
            .client
            .unwrap_or_else(|| Arc::new(InMemoryOrchestrator::new()));
        let client: Arc<dyn OrchestrationClient> =
            Arc::new(RetryingClient::new(client, settings.client_retry()));

        Engine {
            inner: Arc::new(EngineInner {
                client,
                settings,
                store: Arc::new(store),
            }),
        }
    }
}

/// Links a nested run to the run that started it.
#[derive(Clone)]
pub(crate) struct ParentLink {
    pub(crate) run_id: Uuid,
    pub(crate) flow_run_id: Option<Uuid>,
    pub(crate) flow_parameters: Option<Parameters>,
    pub(crate) scope: Option<Transaction>,
}

/// One run to execute: a definition plus its parameters and inputs.
#[derive(Clone)]
pub struct RunRequest {
    pub(crate) definition: TaskDefinition,
    pub(crate) run_id: Uuid,
    pub(crate) parameters: Parameters,
    pub(crate) inputs: Inputs,
    pub(crate) parent: Option<ParentLink>,
    pub(crate) cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(definition: TaskDefinition) -> Self {
        Self {
            definition,
            run_id: Uuid::new_v4(),
            parameters: Parameters::new(),
            inputs: Inputs::new(),
            parent: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Adds inputs that are resolved into parameters before the run starts.
    pub fn with_inputs(mut self, inputs: Inputs) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, input: impl Into<Input>) -> Self {
        self.inputs.insert(name.into(), input.into());
        self
    }

    /// Nests this run under the run owning `ctx`.
    ///
    /// The run records `ctx`'s run as parent, joins its transaction scope
    /// and is cancelled along with it.
    pub fn child_of(mut self, ctx: &RunContext) -> Self {
        self.parent = Some(ParentLink {
            run_id: ctx.run_id(),
            flow_run_id: ctx.flow_run_id(),
            flow_parameters: ctx.flow_parameters().cloned(),
            scope: ctx.scope.clone(),
        });
        self.cancel = ctx.cancellation_token().child_token();
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.parent.as_ref().map(|p| p.run_id)
    }

    /// Parameters with resolved inputs laid over them.
    pub(crate) fn merge_inputs(&self, resolved: Parameters) -> Parameters {
        let mut parameters = self.parameters.clone();
        parameters.extend(resolved);
        parameters
    }
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("definition", &self.definition.name())
            .field("run_id", &self.run_id)
            .field("parameters", &self.parameters)
            .field("inputs", &self.inputs.len())
            .field("parent_run_id", &self.parent_run_id())
            .finish()
    }
}
