use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transaction::IsolationLevel;

/// A persisted pointer from a cache key to a stored result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: String,
    /// Reference into value storage
    pub result_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    pub created: DateTime<Utc>,
}

impl CacheRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map(|exp| now >= exp).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}
