//! In-memory KV store implementation using `DashMap`.
//!
//! Data is lost on process restart; share one instance between registries
//! (and across "restarts" in tests) to emulate a durable store.

use super::KvStore;
use crate::Result;
use dashmap::DashMap;

/// In-memory key-value store using lock-free concurrent hashmap.
///
/// # Example
///
/// ```rust
/// use trueno_lab::kv::{KvStore, MemoryKvStore};
///
/// # async fn example() -> trueno_lab::Result<()> {
/// let store = MemoryKvStore::new();
/// store.set("hello", b"world".to_vec()).await?;
/// assert_eq!(store.get("hello").await?, Some(b"world".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryKvStore {
    store: DashMap<String, Vec<u8>>,
}

impl MemoryKvStore {
    /// Create a new in-memory KV store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: DashMap::new(),
        }
    }

    /// Get the number of entries in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Keys currently stored under `prefix`, sorted.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.store.clear();
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.store.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.store.contains_key(key))
    }
}
