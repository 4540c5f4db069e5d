//! Cache Transactions
//!
//! A transaction groups cache writes so that they persist together or
//! not at all. Transactions nest: committing a child only stages its
//! writes and hooks into the parent, and records reach storage when the
//! outermost transaction commits.
//!
//! # Isolation
//!
//! - `ReadCommitted` takes no lock. Concurrent runs with the same key may
//!   both miss the cache and both execute.
//! - `Serializable` acquires the key's lock from the store's lock manager
//!   when the transaction begins. The lock is held until the outermost
//!   transaction resolves the write.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowrunner::cache::RecordStore;
//! use flowrunner::transaction::{Transaction, TxnOptions};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let store = Arc::new(RecordStore::in_memory());
//! let txn = Transaction::begin(TxnOptions::new().with_store(store));
//! txn.stage_write("answer", json!(42), None).unwrap();
//! txn.commit().unwrap();
//! ```

mod hooks;

pub use hooks::TxnHook;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::RecordStore;
use crate::error::TaskError;

/// Default bound on serializable lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// Committed into a parent that has not committed yet
    Staged,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction is {0:?}, not active")]
    NotActive(TransactionState),

    #[error("a child transaction requested rollback")]
    RollbackRequested,

    #[error("parent transaction is {0:?}")]
    ParentNotActive(TransactionState),

    #[error("transaction has no record store")]
    NoStore,

    #[error("transaction has no key")]
    NoKey,

    #[error("transaction state lock poisoned")]
    Poisoned,
}

impl From<TransactionError> for TaskError {
    fn from(err: TransactionError) -> Self {
        let message = err.to_string();
        match err {
            TransactionError::RollbackRequested => TaskError::new("RollbackRequested", message),
            _ => TaskError::crash(message),
        }
    }
}

/// Settings for a new transaction.
#[derive(Debug, Clone)]
pub struct TxnOptions {
    /// Cache key this transaction produces, if any
    pub key: Option<String>,
    pub store: Option<Arc<RecordStore>>,
    pub isolation: IsolationLevel,
    /// Lock holder identity, normally the owning run's id
    pub holder: String,
    pub lock_timeout: Duration,
    /// Roll the parent back too when this transaction rolls back
    pub rollback_parent_on_failure: bool,
}

impl TxnOptions {
    pub fn new() -> Self {
        Self {
            key: None,
            store: None,
            isolation: IsolationLevel::ReadCommitted,
            holder: Uuid::new_v4().to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            rollback_parent_on_failure: false,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_store(mut self, store: Arc<RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn rollback_parent_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_parent_on_failure = enabled;
        self
    }
}

impl Default for TxnOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct StagedWrite {
    key: String,
    value: Value,
    expiration: Option<DateTime<Utc>>,
    store: Arc<RecordStore>,
}

struct Node {
    state: TransactionState,
    writes: Vec<StagedWrite>,
    children: Vec<Transaction>,
    on_commit: Vec<TxnHook>,
    on_rollback: Vec<TxnHook>,
    values: HashMap<String, Value>,
    rollback_requested: bool,
    lock_held: bool,
}

struct Shared {
    id: Uuid,
    options: TxnOptions,
    store: Option<Arc<RecordStore>>,
    parent: Option<Transaction>,
    node: Mutex<Node>,
}

/// Handle to a transaction. Clones refer to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Shared>,
}

impl Transaction {
    /// Opens an outermost transaction.
    ///
    /// Serializable transactions with a key block here until the key's
    /// lock is acquired or the lock timeout passes. A timeout or lock
    /// error is logged and the transaction proceeds unlocked.
    pub fn begin(options: TxnOptions) -> Self {
        Self::open(options, None)
    }

    /// Opens a transaction nested in this one.
    ///
    /// The child inherits this transaction's store when it has none.
    pub fn begin_child(&self, options: TxnOptions) -> Self {
        Self::open(options, Some(self.clone()))
    }

    fn open(options: TxnOptions, parent: Option<Transaction>) -> Self {
        let store = options
            .store
            .clone()
            .or_else(|| parent.as_ref().and_then(|p| p.store().cloned()));

        let lock_held = match (&options.key, &store, options.isolation) {
            (Some(key), Some(store), IsolationLevel::Serializable) => {
                let locks = store.lock_manager();
                match locks.acquire(key, &options.holder, options.lock_timeout) {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!(
                            "Could not lock cache key {} within {:?}; continuing without the lock",
                            key, options.lock_timeout
                        );
                        false
                    }
                    Err(e) => {
                        warn!("Lock manager failed for cache key {}: {}", key, e);
                        false
                    }
                }
            }
            _ => false,
        };

        let txn = Self {
            inner: Arc::new(Shared {
                id: Uuid::new_v4(),
                options,
                store,
                parent,
                node: Mutex::new(Node {
                    state: TransactionState::Active,
                    writes: Vec::new(),
                    children: Vec::new(),
                    on_commit: Vec::new(),
                    on_rollback: Vec::new(),
                    values: HashMap::new(),
                    rollback_requested: false,
                    lock_held,
                }),
            }),
        };
        debug!("Transaction {} opened (key: {:?})", txn.id(), txn.key());
        txn
    }

    /// Runs `f` in a transaction, committing on `Ok` and rolling back on `Err`.
    ///
    /// With a parent, the transaction is nested in it.
    pub fn run<T, E, F>(parent: Option<&Transaction>, options: TxnOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let txn = match parent {
            Some(parent) => parent.begin_child(options),
            None => Self::begin(options),
        };
        let guard = TransactionGuard::new(txn);

        match f(guard.transaction()) {
            Ok(value) => {
                guard.commit()?;
                Ok(value)
            }
            Err(e) => {
                guard.rollback();
                Err(e)
            }
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn key(&self) -> Option<&str> {
        self.inner.options.key.as_deref()
    }

    pub fn store(&self) -> Option<&Arc<RecordStore>> {
        self.inner.store.as_ref()
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.options.isolation
    }

    pub fn parent(&self) -> Option<&Transaction> {
        self.inner.parent.as_ref()
    }

    pub fn state(&self) -> TransactionState {
        self.node()
            .map(|n| n.state)
            .unwrap_or(TransactionState::RolledBack)
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Returns true if this transaction holds its key's lock.
    pub fn holds_lock(&self) -> bool {
        self.node().map(|n| n.lock_held).unwrap_or(false)
    }

    fn node(&self) -> Result<MutexGuard<'_, Node>, TransactionError> {
        self.inner.node.lock().map_err(|_| TransactionError::Poisoned)
    }

    fn active_node(&self) -> Result<MutexGuard<'_, Node>, TransactionError> {
        let node = self.node()?;
        if node.state != TransactionState::Active {
            return Err(TransactionError::NotActive(node.state));
        }
        Ok(node)
    }

    /// Stages a write of `value` under `key` in this transaction's store.
    pub fn stage_write(
        &self,
        key: impl Into<String>,
        value: Value,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<(), TransactionError> {
        let store = self.store().cloned().ok_or(TransactionError::NoStore)?;
        let key = key.into();
        debug!("Transaction {} staged write for key {}", self.id(), key);
        self.active_node()?.writes.push(StagedWrite {
            key,
            value,
            expiration,
            store,
        });
        Ok(())
    }

    /// Stages a write under this transaction's own key.
    pub fn stage(&self, value: Value, expiration: Option<DateTime<Utc>>) -> Result<(), TransactionError> {
        let key = self.key().ok_or(TransactionError::NoKey)?.to_string();
        self.stage_write(key, value, expiration)
    }

    /// Reads `key` as this transaction sees it.
    ///
    /// Staged writes of this transaction, its ancestors and their staged
    /// children shadow persisted records.
    pub fn read(&self, key: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(txn) = current {
            if let Some(value) = txn.staged_value(key) {
                return Some(value);
            }
            current = txn.parent();
        }
        self.store()
            .and_then(|store| store.read(key))
            .map(|hit| hit.value)
    }

    /// Reads this transaction's own key.
    pub fn read_own(&self) -> Option<Value> {
        self.key().and_then(|key| self.read(key))
    }

    fn staged_value(&self, key: &str) -> Option<Value> {
        let children = {
            let node = self.node().ok()?;
            if let Some(write) = node.writes.iter().rev().find(|w| w.key == key) {
                return Some(write.value.clone());
            }
            node.children.clone()
        };
        children
            .iter()
            .rev()
            .filter(|c| c.state() == TransactionState::Staged)
            .find_map(|c| c.staged_value(key))
    }

    /// Stores a value shared with nested transactions.
    pub fn set(&self, name: impl Into<String>, value: Value) -> Result<(), TransactionError> {
        self.node()?.values.insert(name.into(), value);
        Ok(())
    }

    /// Looks up a shared value here, then in each ancestor.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(txn) = current {
            if let Some(value) = txn.node().ok().and_then(|n| n.values.get(name).cloned()) {
                return Some(value);
            }
            current = txn.parent();
        }
        None
    }

    pub fn add_on_commit(&self, hook: TxnHook) -> Result<(), TransactionError> {
        self.active_node()?.on_commit.push(hook);
        Ok(())
    }

    pub fn add_on_rollback(&self, hook: TxnHook) -> Result<(), TransactionError> {
        self.active_node()?.on_rollback.push(hook);
        Ok(())
    }

    fn request_rollback(&self) {
        if let Ok(mut node) = self.node() {
            node.rollback_requested = true;
        }
    }

    /// Commits this transaction.
    ///
    /// A nested transaction becomes `Staged` in its parent and releases
    /// its key's lock. The outermost
    /// transaction persists every staged write in its tree, then runs the
    /// commit hooks. If a child asked for rollback, this transaction rolls
    /// back instead and `RollbackRequested` is returned.
    pub fn commit(&self) -> Result<(), TransactionError> {
        let rollback_requested = self.active_node()?.rollback_requested;
        if rollback_requested {
            self.rollback();
            return Err(TransactionError::RollbackRequested);
        }

        if let Some(parent) = self.parent() {
            let lock_held = {
                let mut node = self.node()?;
                node.state = TransactionState::Staged;
                std::mem::replace(&mut node.lock_held, false)
            };
            // Staged writes are visible through the parent from here on
            if lock_held {
                self.release_lock();
            }
            let parent_state = {
                let mut parent_node = parent.node()?;
                if parent_node.state == TransactionState::Active {
                    parent_node.children.push(self.clone());
                }
                parent_node.state
            };
            if parent_state != TransactionState::Active {
                self.rollback();
                return Err(TransactionError::ParentNotActive(parent_state));
            }
            debug!("Transaction {} staged into {}", self.id(), parent.id());
            return Ok(());
        }

        let tree = self.tree();
        for txn in &tree {
            txn.persist_writes();
        }
        for txn in &tree {
            txn.finish(TransactionState::Committed);
        }
        info!("Transaction {} committed", self.id());

        for txn in &tree {
            let hooks = txn.node().map(|n| n.on_commit.clone()).unwrap_or_default();
            for hook in hooks {
                hooks::run_hook("on_commit", &hook, txn);
            }
        }
        Ok(())
    }

    /// Rolls back this transaction and every child staged into it.
    ///
    /// Children roll back latest first, then this transaction's own
    /// rollback hooks run in reverse registration order. Returns false if
    /// the transaction had already committed or rolled back.
    pub fn rollback(&self) -> bool {
        if self.state().is_final() {
            return false;
        }
        self.rollback_tree();
        info!("Transaction {} rolled back", self.id());

        if self.inner.options.rollback_parent_on_failure {
            if let Some(parent) = self.parent() {
                debug!("Transaction {} requests rollback of {}", self.id(), parent.id());
                parent.request_rollback();
            }
        }
        true
    }

    fn rollback_tree(&self) {
        let (children, hooks) = self
            .node()
            .map(|n| (n.children.clone(), n.on_rollback.clone()))
            .unwrap_or_default();
        self.finish(TransactionState::RolledBack);

        for child in children.iter().rev() {
            if child.state() == TransactionState::Staged {
                child.rollback_tree();
            }
        }
        for hook in hooks.iter().rev() {
            hooks::run_hook("on_rollback", hook, self);
        }
    }

    /// This transaction and its staged descendants, children before parents.
    fn tree(&self) -> Vec<Transaction> {
        let children = self.node().map(|n| n.children.clone()).unwrap_or_default();
        let mut out = Vec::new();
        for child in children {
            if child.state() == TransactionState::Staged {
                out.extend(child.tree());
            }
        }
        out.push(self.clone());
        out
    }

    fn persist_writes(&self) {
        let writes = self
            .node()
            .map(|mut n| std::mem::take(&mut n.writes))
            .unwrap_or_default();
        for write in writes {
            if let Err(e) = write.store.write(
                &write.key,
                &write.value,
                write.expiration,
                self.isolation(),
            ) {
                warn!(
                    "Failed to persist cache record for key {}: {}",
                    write.key, e
                );
            }
        }
    }

    /// Moves to a final state and releases the key's lock if held.
    fn finish(&self, state: TransactionState) {
        let lock_held = match self.node() {
            Ok(mut node) => {
                node.state = state;
                if state == TransactionState::RolledBack {
                    node.writes.clear();
                }
                std::mem::replace(&mut node.lock_held, false)
            }
            Err(_) => false,
        };

        if lock_held {
            self.release_lock();
        }
    }

    fn release_lock(&self) {
        if let (Some(key), Some(store)) = (self.key(), self.store()) {
            if let Err(e) = store.lock_manager().release(key, &self.inner.options.holder) {
                warn!("Failed to release lock on cache key {}: {}", key, e);
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("key", &self.key())
            .field("state", &self.state())
            .field("isolation", &self.isolation())
            .finish()
    }
}

/// Rolls its transaction back when dropped while still active.
pub struct TransactionGuard {
    txn: Transaction,
}

impl TransactionGuard {
    pub fn new(txn: Transaction) -> Self {
        Self { txn }
    }

    pub fn commit(self) -> Result<(), TransactionError> {
        self.txn.commit()
    }

    pub fn rollback(self) -> bool {
        self.txn.rollback()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }
}

impl std::ops::Deref for TransactionGuard {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if self.txn.is_active() {
            debug!("Transaction {} dropped while active", self.txn.id());
            self.txn.rollback();
        }
    }
}
