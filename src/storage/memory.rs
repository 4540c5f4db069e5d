use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{check_key, ResultStorage, StorageError};

/// Process-local storage. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn objects(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>, StorageError> {
        self.objects
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }
}

impl ResultStorage for MemoryStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<String, StorageError> {
        check_key(key)?;
        self.objects()?.insert(key.to_string(), bytes.to_vec());
        Ok(key.to_string())
    }

    fn read(&self, reference: &str) -> Result<Vec<u8>, StorageError> {
        self.objects()?
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }

    fn exists(&self, reference: &str) -> Result<bool, StorageError> {
        Ok(self.objects()?.contains_key(reference))
    }

    fn remove(&self, reference: &str) -> Result<(), StorageError> {
        self.objects()?.remove(reference);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
