//! Key-value persistence abstraction
//!
//! The scheduler never talks to a concrete store; components persist
//! opaque byte records through [`KeyValueStore`]. Real backends (files,
//! cloud KV) live outside this crate. [`MemoryKeyValueStore`] ships here
//! for tests and demos and to model restart-with-same-store scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Key under which the session pool persists its state
pub const SESSION_POOL_STATE_KEY: &str = "SDK_SESSION_POOL_STATE";

/// Key prefix for persisted statistics, suffixed with the instance number
pub const STATISTICS_STATE_KEY_PREFIX: &str = "STATISTICS_STATE_";

/// Error from a key-value backend
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend rejected or lost the operation
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A persisted record failed to deserialize
    #[error("Corrupt state record under key '{key}': {source}")]
    CorruptRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Opaque get/set persistence, keyed by string
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
}

/// Read and deserialize a JSON state record
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(bytes) => {
            let value =
                serde_json::from_slice(&bytes).map_err(|source| StorageError::CorruptRecord {
                    key: key.to_string(),
                    source,
                })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize and store a JSON state record
pub async fn set_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| StorageError::Unavailable(format!("serialization failed: {e}")))?;
    store.set(key, bytes).await
}

/// In-memory key-value store
///
/// Cloning shares the underlying map, so a "restarted" component handed a
/// clone observes the same persisted state.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    records: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the store holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.records.lock().insert(key.to_string(), value);
        Ok(())
    }
}
