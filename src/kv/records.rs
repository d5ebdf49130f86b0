//! Typed record layer over any `KvStore` backend.
//!
//! Records are encoded as JSON. Collections are tracked with small index
//! records (a JSON array of ids) because the store has no key scans.

use crate::kv::KvStore;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Typed JSON view of a shared `KvStore`.
///
/// Cheap to clone: every clone points at the same backend.
#[derive(Debug)]
pub struct RecordStore<S: KvStore> {
    inner: Arc<S>,
}

impl<S: KvStore> Clone for RecordStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: KvStore> RecordStore<S> {
    /// Wrap a shared backend.
    #[must_use]
    pub const fn new(inner: Arc<S>) -> Self {
        Self { inner }
    }

    /// Get reference to inner store (for inspection/testing)
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Load and decode a record.
    ///
    /// # Errors
    /// Returns `Persistence` if the backend fails, `Serialization` if the
    /// stored bytes are not a valid record.
    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.inner.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a record that must exist.
    ///
    /// # Errors
    /// Returns `NotFound` (with `kind`/`id`) when the key is absent.
    pub async fn load_required<T: DeserializeOwned>(
        &self,
        key: &str,
        kind: &'static str,
        id: &str,
    ) -> Result<T> {
        self.load(key)
            .await?
            .ok_or_else(|| Error::not_found(kind, id))
    }

    /// Encode and store a record.
    ///
    /// # Errors
    /// Returns `Serialization` or `Persistence` errors.
    pub async fn save<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.inner.set(key, bytes).await
    }

    /// Remove a record.
    ///
    /// # Errors
    /// Returns `Persistence` if the backend fails.
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    /// Ids stored in an index record (empty when the index doesn't exist).
    ///
    /// # Errors
    /// Returns backend or decoding errors.
    pub async fn index(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.load::<Vec<String>>(key).await?.unwrap_or_default())
    }

    /// Add an id to an index record. Idempotent.
    ///
    /// # Errors
    /// Returns backend or encoding errors.
    pub async fn index_insert(&self, key: &str, id: &str) -> Result<()> {
        let mut ids = self.index(key).await?;
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
            self.save(key, &ids).await?;
        }
        Ok(())
    }

    /// Remove an id from an index record. Idempotent.
    ///
    /// # Errors
    /// Returns backend or encoding errors.
    pub async fn index_remove(&self, key: &str, id: &str) -> Result<()> {
        let mut ids = self.index(key).await?;
        let before = ids.len();
        ids.retain(|existing| existing != id);
        if ids.len() != before {
            self.save(key, &ids).await?;
        }
        Ok(())
    }
}
