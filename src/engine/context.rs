use std::fmt;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RunError, TaskError};
use crate::run::{Parameters, RunKind};
use crate::transaction::{Transaction, TransactionError, TxnOptions};

use super::definition::TaskDefinition;
use super::{Engine, RunRequest};

/// What a run body knows about the run executing it.
///
/// Handed to every body invocation. Nested runs started through the
/// context record this run as their parent and join its transaction
/// scope, if one is open.
#[derive(Clone)]
pub struct RunContext {
    pub(crate) engine: Engine,
    pub(crate) run_id: Uuid,
    pub(crate) run_name: String,
    pub(crate) kind: RunKind,
    pub(crate) parent_run_id: Option<Uuid>,
    pub(crate) flow_run_id: Option<Uuid>,
    pub(crate) flow_parameters: Option<Parameters>,
    /// Explicit transaction scope that nested runs join
    pub(crate) scope: Option<Transaction>,
    /// This run's own transaction
    pub(crate) txn: Transaction,
    pub(crate) cancel: CancellationToken,
}

impl RunContext {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn kind(&self) -> RunKind {
        self.kind
    }

    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.parent_run_id
    }

    /// Id of the innermost flow run, which is this run if it is a flow.
    pub fn flow_run_id(&self) -> Option<Uuid> {
        self.flow_run_id
    }

    pub fn flow_parameters(&self) -> Option<&Parameters> {
        self.flow_parameters.as_ref()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The transaction this run's result is committed through.
    pub fn current_transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Returns true once the run has been cancelled or timed out.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Builds a request for a run nested under this one.
    pub fn request(&self, definition: &TaskDefinition) -> RunRequest {
        RunRequest::new(definition.clone()).child_of(self)
    }

    /// Runs a nested task to completion and returns its value.
    pub fn run_task(
        &self,
        definition: &TaskDefinition,
        parameters: Parameters,
    ) -> Result<Value, RunError> {
        self.engine
            .execute(self.request(definition).with_parameters(parameters))
    }

    pub async fn run_task_async(
        &self,
        definition: &TaskDefinition,
        parameters: Parameters,
    ) -> Result<Value, RunError> {
        self.engine
            .execute_async(self.request(definition).with_parameters(parameters))
            .await
    }

    /// Runs `f` inside a nested transaction scope.
    ///
    /// Runs started from the context passed to `f` stage their cache
    /// writes into the scope. The scope commits if `f` returns `Ok` and
    /// rolls back otherwise, taking every nested run's writes with it and
    /// firing their rollback hooks.
    pub fn transaction<T, F>(&self, options: TxnOptions, f: F) -> Result<T, TaskError>
    where
        F: FnOnce(&RunContext) -> Result<T, TaskError>,
    {
        Transaction::run(Some(&self.txn), options, |txn| {
            let scoped = RunContext {
                scope: Some(txn.clone()),
                txn: txn.clone(),
                ..self.clone()
            };
            f(&scoped)
        })
    }

    /// Stores a value visible to this run and runs nested in its scope.
    pub fn set(&self, name: impl Into<String>, value: Value) -> Result<(), TransactionError> {
        self.txn.set(name, value)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.txn.get(name)
    }

    /// Returns a copy using `cancel` as the cancellation token.
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("run_name", &self.run_name)
            .field("kind", &self.kind)
            .field("parent_run_id", &self.parent_run_id)
            .field("transaction", &self.txn.id())
            .finish()
    }
}
