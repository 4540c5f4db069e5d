//! Lock Managers
//!
//! Exclusive, holder-reentrant locks on cache keys. Serializable
//! transactions take a lock before computing a result so that only one
//! holder executes for a given key at a time.
//!
//! A holder that already owns a lock may acquire it again; each
//! acquisition must be matched by a release.

mod file;
mod memory;

pub use file::FileLockManager;
pub use memory::MemoryLockManager;

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock on '{key}' is held by '{owner}', not '{holder}'")]
    NotHolder {
        key: String,
        holder: String,
        owner: String,
    },

    #[error("lock on '{0}' is not held")]
    NotLocked(String),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lock manager error: {0}")]
    Backend(String),
}

/// Pluggable exclusive lock service.
pub trait LockManager: Send + Sync + fmt::Debug {
    /// Blocks until `holder` owns the lock on `key` or `timeout` passes.
    ///
    /// Returns `Ok(false)` when the timeout elapsed first.
    fn acquire(&self, key: &str, holder: &str, timeout: Duration) -> Result<bool, LockError>;

    /// Releases one acquisition of `key` by `holder`.
    fn release(&self, key: &str, holder: &str) -> Result<(), LockError>;

    fn is_locked(&self, key: &str) -> bool;

    fn is_lock_holder(&self, key: &str, holder: &str) -> bool;

    /// Blocks until nobody holds `key` or `timeout` passes.
    ///
    /// Returns true if the key is free.
    fn wait_for_unlock(&self, key: &str, timeout: Duration) -> bool;
}
