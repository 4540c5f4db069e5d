use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;

use super::{LockError, LockManager};

#[derive(Debug)]
struct Held {
    holder: String,
    depth: u32,
}

#[derive(Debug, Default)]
struct Inner {
    locks: Mutex<HashMap<String, Held>>,
    released: Condvar,
}

/// In-process lock manager. Clones share the same lock table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockManager {
    inner: Arc<Inner>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn locks(&self) -> Result<MutexGuard<'_, HashMap<String, Held>>, LockError> {
        self.inner
            .locks
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))
    }
}

impl LockManager for MemoryLockManager {
    fn acquire(&self, key: &str, holder: &str, timeout: Duration) -> Result<bool, LockError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut locks = self.locks()?;

        loop {
            match locks.get_mut(key) {
                None => {
                    locks.insert(
                        key.to_string(),
                        Held {
                            holder: holder.to_string(),
                            depth: 1,
                        },
                    );
                    debug!("Lock '{}' acquired by '{}'", key, holder);
                    return Ok(true);
                }
                Some(held) if held.holder == holder => {
                    held.depth += 1;
                    return Ok(true);
                }
                Some(_) => {}
            }

            locks = match deadline {
                None => self.inner.released.wait(locks),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.inner
                        .released
                        .wait_timeout(locks, deadline - now)
                        .map(|(guard, _)| guard)
                        .map_err(|e| PoisonError::new(e.into_inner().0))
                }
            }
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;
        }
    }

    fn release(&self, key: &str, holder: &str) -> Result<(), LockError> {
        let mut locks = self.locks()?;
        let held = locks
            .get_mut(key)
            .ok_or_else(|| LockError::NotLocked(key.to_string()))?;

        if held.holder != holder {
            return Err(LockError::NotHolder {
                key: key.to_string(),
                holder: holder.to_string(),
                owner: held.holder.clone(),
            });
        }

        held.depth -= 1;
        if held.depth == 0 {
            locks.remove(key);
            debug!("Lock '{}' released by '{}'", key, holder);
            self.inner.released.notify_all();
        }
        Ok(())
    }

    fn is_locked(&self, key: &str) -> bool {
        self.locks().map(|l| l.contains_key(key)).unwrap_or(false)
    }

    fn is_lock_holder(&self, key: &str, holder: &str) -> bool {
        self.locks()
            .map(|l| l.get(key).map(|h| h.holder == holder).unwrap_or(false))
            .unwrap_or(false)
    }

    fn wait_for_unlock(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let Ok(mut locks) = self.locks() else {
            return false;
        };
        while locks.contains_key(key) {
            let waited = match deadline {
                None => self.inner.released.wait(locks),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.inner
                        .released
                        .wait_timeout(locks, deadline - now)
                        .map(|(guard, _)| guard)
                        .map_err(|e| PoisonError::new(e.into_inner().0))
                }
            };
            match waited {
                Ok(guard) => locks = guard,
                Err(_) => return false,
            }
        }
        true
    }
}
