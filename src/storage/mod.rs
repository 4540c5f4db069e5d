//! Result Storage
//!
//! Byte storage for cache records and result values. Key storage and
//! value storage are separate instances of [`ResultStorage`], so a
//! policy can keep its records somewhere other than its values.

mod local;
mod memory;

pub use local::LocalFileStorage;
pub use memory::MemoryStorage;

use std::fmt;

use thiserror::Error;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no stored object at '{0}'")]
    NotFound(String),

    #[error("invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode stored object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A pluggable byte store addressed by string keys.
pub trait ResultStorage: Send + Sync + fmt::Debug {
    /// Stores `bytes` under `key` and returns the reference to read it back.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError>;

    /// Reads the bytes at `reference`.
    fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError>;

    fn exists(&self, reference: &str) -> Result<bool, StorageError>;

    /// Removes the object at `reference`. Missing objects are not an error.
    fn remove(&self, reference: &str) -> Result<(), StorageError>;

    /// Short description used in log messages.
    fn describe(&self) -> String;
}

/// Rejects keys that could escape a storage root.
pub(crate) fn check_key(key: &str) -> Result<(), StorageError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part == ".." || part.is_empty());
    if bad {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("abc.json").is_ok());
        assert!(check_key("nested/abc").is_ok());
        assert!(check_key("").is_err());
        assert!(check_key("../escape").is_err());
        assert!(check_key("/abs").is_err());
        assert!(check_key("a//b").is_err());
    }
}
