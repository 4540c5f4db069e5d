//! Record Store
//!
//! Persists cache records in key storage and their values in value
//! storage. Values are content-addressed by the SHA-256 of their JSON
//! encoding, so identical results share one stored object.
//!
//! Reads never fail: an expired record, a missing value or a backend
//! fault all read as a miss. Backend faults are logged as warnings.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::locking::{LockManager, MemoryLockManager};
use crate::storage::{MemoryStorage, ResultStorage, StorageError};
use crate::transaction::IsolationLevel;

use super::record::CacheRecord;

/// A cache record together with the value it points to.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub record: CacheRecord,
    pub value: Value,
}

/// Key storage, value storage and the lock manager guarding them.
#[derive(Clone)]
pub struct RecordStore {
    key_storage: Arc<dyn ResultStorage>,
    value_storage: Arc<dyn ResultStorage>,
    lock_manager: Arc<dyn LockManager>,
}

impl RecordStore {
    /// Creates a store that keeps records and values in the same storage.
    pub fn new(storage: Arc<dyn ResultStorage>, lock_manager: Arc<dyn LockManager>) -> Self {
        Self {
            key_storage: Arc::clone(&storage),
            value_storage: storage,
            lock_manager,
        }
    }

    /// Creates a store backed entirely by process memory.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryLockManager::new()),
        )
    }

    pub fn with_key_storage(mut self, key_storage: Arc<dyn ResultStorage>) -> Self {
        self.key_storage = key_storage;
        self
    }

    pub fn with_lock_manager(mut self, lock_manager: Arc<dyn LockManager>) -> Self {
        self.lock_manager = lock_manager;
        self
    }

    pub fn key_storage(&self) -> &Arc<dyn ResultStorage> {
        &self.key_storage
    }

    pub fn value_storage(&self) -> &Arc<dyn ResultStorage> {
        &self.value_storage
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.lock_manager
    }

    fn record_ref(key: &str) -> String {
        format!("{}.json", key)
    }

    /// Content address of an encoded value.
    pub fn content_address(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Reads a valid record and its value, or `None` on any kind of miss.
    pub fn read(&self, key: &str) -> Option<CacheHit> {
        self.read_at(key, Utc::now())
    }

    /// Like [`read`](Self::read), judging expiration at `now`.
    pub fn read_at(&self, key: &str, now: DateTime<Utc>) -> Option<CacheHit> {
        match self.try_read(key, now) {
            Ok(Some(hit)) => {
                debug!("Cache hit for key {}", key);
                Some(hit)
            }
            Ok(None) => {
                debug!("Cache miss for key {}", key);
                None
            }
            Err(e) => {
                warn!(
                    "Cache read for key {} failed on {}: {}. Treating as a miss.",
                    key,
                    self.key_storage.describe(),
                    e
                );
                None
            }
        }
    }

    fn try_read(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheHit>, StorageError> {
        let record_ref = Self::record_ref(key);
        if !self.key_storage.exists(&record_ref)? {
            return Ok(None);
        }

        let record: CacheRecord = serde_json::from_slice(&self.key_storage.read(&record_ref)?)?;
        if record.is_expired_at(now) {
            debug!("Cache record for key {} expired at {:?}", key, record.expiration);
            return Ok(None);
        }

        let value = match self.value_storage.read(&record.result_ref) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(CacheHit { record, value }))
    }

    /// Persists `value` under `key`, replacing any previous record.
    pub fn write(
        &self,
        key: &str,
        value: &Value,
        expiration: Option<DateTime<Utc>>,
        isolation_level: IsolationLevel,
    ) -> Result<CacheRecord, StorageError> {
        let bytes = serde_json::to_vec(value)?;
        let address = Self::content_address(&bytes);
        let result_ref = if self.value_storage.exists(&address)? {
            address
        } else {
            self.value_storage.write(&address, &bytes)?
        };

        let record = CacheRecord {
            key: key.to_string(),
            result_ref,
            expiration,
            isolation_level,
            created: Utc::now(),
        };
        self.key_storage
            .write(&Self::record_ref(key), &serde_json::to_vec(&record)?)?;
        debug!("Cache record written for key {}", key);
        Ok(record)
    }

    /// Returns true if an unexpired record exists for `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.read(key).is_some()
    }

    /// Removes the record for `key`. The value is left in place since
    /// other records may share it.
    pub fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.key_storage.remove(&Self::record_ref(key))
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("key_storage", &self.key_storage.describe())
            .field("value_storage", &self.value_storage.describe())
            .field("lock_manager", &self.lock_manager)
            .finish()
    }
}
