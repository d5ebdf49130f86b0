//! Test store whose writes can be switched to fail.

use super::{KvStore, MemoryKvStore};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// `MemoryKvStore` with a switch that turns `set` and `delete` into
/// `Persistence` errors. Reads always succeed.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    fn check(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!("write to {key} rejected")));
        }
        Ok(())
    }
}

impl KvStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check(key)?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check(key)?;
        self.inner.delete(key).await
    }
}
