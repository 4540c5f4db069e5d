use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use sha2::{Digest, Sha256};

use super::{LockError, LockManager};

/// Default interval between checks of a contended lock file.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lock manager backed by lock files in a directory.
///
/// A lock is a file created exclusively that contains the holder's name.
/// Reentrant depth is tracked per process; other processes only see
/// whether the file exists.
#[derive(Debug)]
pub struct FileLockManager {
    dir: PathBuf,
    poll_interval: Duration,
    depths: Mutex<HashMap<String, u32>>,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            depths: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.lock", digest))
    }

    fn owner(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.lock_path(key)).ok()
    }

    fn try_create(&self, key: &str, holder: &str) -> Result<bool, LockError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(key);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(holder.as_bytes())?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn depth_key(key: &str, holder: &str) -> String {
        format!("{}\0{}", key, holder)
    }

    fn bump_depth(&self, key: &str, holder: &str) -> Result<(), LockError> {
        let mut depths = self
            .depths
            .lock()
            .map_err(|_| LockError::Backend("lock depth table poisoned".to_string()))?;
        *depths.entry(Self::depth_key(key, holder)).or_insert(0) += 1;
        Ok(())
    }
}

impl LockManager for FileLockManager {
    fn acquire(&self, key: &str, holder: &str, timeout: Duration) -> Result<bool, LockError> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.try_create(key, holder)? {
                debug!("Lock file for '{}' created by '{}'", key, holder);
                self.bump_depth(key, holder)?;
                return Ok(true);
            }
            if self.owner(key).as_deref() == Some(holder) {
                self.bump_depth(key, holder)?;
                return Ok(true);
            }
            if past(deadline) {
                return Ok(false);
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn release(&self, key: &str, holder: &str) -> Result<(), LockError> {
        let owner = self
            .owner(key)
            .ok_or_else(|| LockError::NotLocked(key.to_string()))?;
        if owner != holder {
            return Err(LockError::NotHolder {
                key: key.to_string(),
                holder: holder.to_string(),
                owner,
            });
        }

        let mut depths = self
            .depths
            .lock()
            .map_err(|_| LockError::Backend("lock depth table poisoned".to_string()))?;
        let depth_key = Self::depth_key(key, holder);
        let remaining = match depths.get_mut(&depth_key) {
            Some(depth) => {
                *depth = depth.saturating_sub(1);
                *depth
            }
            None => {
                warn!(
                    "Releasing lock '{}' for '{}' that this process did not acquire",
                    key, holder
                );
                0
            }
        };

        if remaining == 0 {
            depths.remove(&depth_key);
            match fs::remove_file(self.lock_path(key)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            debug!("Lock file for '{}' removed by '{}'", key, holder);
        }
        Ok(())
    }

    fn is_locked(&self, key: &str) -> bool {
        self.lock_path(key).is_file()
    }

    fn is_lock_holder(&self, key: &str, holder: &str) -> bool {
        self.owner(key).as_deref() == Some(holder)
    }

    fn wait_for_unlock(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        while self.is_locked(key) {
            if past(deadline) {
                return false;
            }
            thread::sleep(self.poll_interval);
        }
        true
    }
}

/// A deadline too far out to represent is never reached.
fn past(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(at) if Instant::now() >= at)
}
