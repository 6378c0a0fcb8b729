//! Content-addressed stage result cache.
//!
//! Entries are keyed by stage id and the canonical form of the payload the
//! stage would receive, so identical inputs map to the same key regardless
//! of object field order. Two backends share the [`StageCache`] trait:
//! [`MemoryCache`] and the directory-backed [`FileCache`].

mod file;
mod memory;

pub use file::FileCache;
pub use memory::MemoryCache;

use crate::core::AgentOutput;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared cache handle.
pub type SharedCache = Arc<dyn StageCache>;

/// Cache failures. Reads never fail; a broken entry is a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure.
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Entry could not be serialized.
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A cached stage output with expiry metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry {
    /// The stored output.
    pub output: AgentOutput,
    /// Stage that produced it.
    pub stage: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// When the entry stops being served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedEntry {
    /// Creates a non-expiring entry.
    #[must_use]
    pub fn new(stage: impl Into<String>, output: AgentOutput) -> Self {
        Self {
            output,
            stage: stage.into(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Sets the time to live.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        self
    }

    /// Returns true if the entry has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now >= expires)
    }

    /// Returns true if the entry has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Storage backend for stage results.
#[async_trait]
pub trait StageCache: Send + Sync {
    /// Returns a live entry, dropping it if expired.
    async fn get(&self, key: &str) -> Option<CachedEntry>;

    /// Stores an entry.
    async fn set(&self, key: &str, entry: CachedEntry) -> Result<(), CacheError>;

    /// Removes an entry.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Removes every entry.
    async fn clear(&self) -> Result<(), CacheError>;
}

/// Returns `value` with object keys sorted recursively.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Computes the cache key for a stage and its payload.
#[must_use]
pub fn cache_key(stage: &str, payload: &Value) -> String {
    let canonical = serde_json::to_string(&canonicalize(payload)).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    format!("{stage}-{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_ignores_field_order() {
        let a = json!({"topic": "rust", "opts": {"x": 1, "y": [1, 2]}});
        let b = json!({"opts": {"y": [1, 2], "x": 1}, "topic": "rust"});

        assert_eq!(cache_key("research", &a), cache_key("research", &b));
        assert!(cache_key("research", &a).starts_with("research-"));
    }

    #[test]
    fn test_cache_key_depends_on_stage_and_input() {
        let payload = json!({"topic": "rust"});

        assert_ne!(cache_key("research", &payload), cache_key("write", &payload));
        assert_ne!(
            cache_key("research", &payload),
            cache_key("research", &json!({"topic": "go"}))
        );
    }

    #[test]
    fn test_entry_expiry() {
        let entry = CachedEntry::new("s", AgentOutput::ok()).with_ttl(Duration::from_secs(60));
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.created_at + chrono::Duration::seconds(60)));

        let forever = CachedEntry::new("s", AgentOutput::ok());
        assert!(!forever.is_expired_at(Utc::now() + chrono::Duration::days(3650)));
    }
}
