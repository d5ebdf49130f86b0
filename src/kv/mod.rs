//! Key-Value Store Module
//!
//! The durable store is the only persistence mechanism for experiments,
//! schedules, federated clients and round history. The engine needs just
//! `get` and `set`; everything else has a default or is optional.
//!
//! Values are opaque bytes. [`RecordStore`] layers `serde_json` encoding on
//! top so callers work with typed records.
//!
//! # Example
//!
//! ```rust,no_run
//! use trueno_lab::kv::{KvStore, MemoryKvStore};
//!
//! # async fn example() -> trueno_lab::Result<()> {
//! let store = MemoryKvStore::new();
//!
//! store.set("experiment/exp-1-1", b"{}".to_vec()).await?;
//! let value = store.get("experiment/exp-1-1").await?;
//! assert_eq!(value, Some(b"{}".to_vec()));
//!
//! store.delete("experiment/exp-1-1").await?;
//! assert!(!store.exists("experiment/exp-1-1").await?);
//! # Ok(())
//! # }
//! ```

#[cfg(test)]
pub(crate) mod faulty;
mod memory;
mod records;

pub use memory::MemoryKvStore;
pub use records::RecordStore;

use crate::Result;
use std::future::Future;

/// Durable key-value store consumed by the registries.
///
/// Implementations map their own failures to [`crate::Error::Persistence`].
pub trait KvStore: Send + Sync {
    /// Get a value by key.
    ///
    /// Returns `None` if the key doesn't exist.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Set a value for a key.
    ///
    /// Overwrites any existing value.
    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Delete a key.
    ///
    /// No-op if the key doesn't exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check if a key exists.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Get multiple keys in a batch.
    ///
    /// Returns values in the same order as keys. Missing keys return `None`.
    fn batch_get(
        &self,
        keys: &[&str],
    ) -> impl Future<Output = Result<Vec<Option<Vec<u8>>>>> + Send {
        async move {
            let mut results = Vec::with_capacity(keys.len());
            for key in keys {
                results.push(self.get(key).await?);
            }
            Ok(results)
        }
    }
}
