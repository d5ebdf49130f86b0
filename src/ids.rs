//! Generation-stamped identifiers
//!
//! Ids look like `exp-3-17`: prefix, process generation, sequence. The
//! generation is persisted and bumped once per start, so ids never collide
//! across restarts and never depend on the wall clock.

use crate::kv::{KvStore, RecordStore};
use crate::Result;
use std::sync::atomic::{AtomicU64, Ordering};

const GENERATION_KEY: &str = "meta/generation";

/// Hands out unique ids for one process generation.
#[derive(Debug)]
pub struct IdGenerator {
    generation: u64,
    sequence: AtomicU64,
}

impl IdGenerator {
    /// Generator for a fixed generation (tests, single-shot tools).
    #[must_use]
    pub const fn with_generation(generation: u64) -> Self {
        Self {
            generation,
            sequence: AtomicU64::new(0),
        }
    }

    /// Claim the next generation from the store and build a generator for it.
    ///
    /// # Errors
    /// Returns persistence or decoding errors from the store.
    pub async fn claim<S: KvStore>(records: &RecordStore<S>) -> Result<Self> {
        let previous = records.load::<u64>(GENERATION_KEY).await?.unwrap_or(0);
        let generation = previous + 1;
        records.save(GENERATION_KEY, &generation).await?;
        tracing::debug!(generation, "claimed id generation");
        Ok(Self::with_generation(generation))
    }

    /// The generation stamped into every id.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Next id with the given prefix.
    pub fn next(&self, prefix: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{prefix}-{}-{seq}", self.generation)
    }
}
