//! Schedule configuration owned by an experiment

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Retry policy for failed scheduled tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Retries allowed after the first failure.
    pub max_retries: u32,
    /// Growth factor between successive delays.
    pub backoff_multiplier: f64,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
}

impl RetryStrategy {
    /// Delay before retry number `retries + 1`:
    /// `initial_delay · backoff_multiplier^retries`, saturating at
    /// [`Duration::MAX`].
    #[must_use]
    pub fn delay_for(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let ms = (self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent)).round()
            as i64;
        Duration::try_milliseconds(ms).unwrap_or(Duration::MAX)
    }

    /// Instant of retry number `retries + 1` after a failure at `now`, or
    /// `None` when it is not representable.
    #[must_use]
    pub fn retry_at(&self, now: DateTime<Utc>, retries: u32) -> Option<DateTime<Utc>> {
        now.checked_add_signed(self.delay_for(retries))
    }
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1000,
        }
    }
}

fn millis(ms: u64) -> Duration {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

/// Which scheduler events reach the notification sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct NotificationFlags {
    /// Completion task finished.
    pub on_completion: bool,
    /// A task exhausted its retries.
    pub on_failure: bool,
    /// A checkpoint was written.
    pub on_checkpoint: bool,
}

impl Default for NotificationFlags {
    fn default() -> Self {
        Self {
            on_completion: true,
            on_failure: true,
            on_checkpoint: false,
        }
    }
}

/// When and how an experiment's tasks run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Window start.
    pub start_date: DateTime<Utc>,
    /// Window end; the completion task fires here.
    pub end_date: DateTime<Utc>,
    /// Checkpoint offsets from `start_date`, in milliseconds.
    #[serde(default)]
    pub checkpoint_offsets_ms: Vec<u64>,
    /// Spacing of evaluation tasks, in milliseconds.
    pub evaluation_interval_ms: u64,
    /// Tasks of this schedule allowed to run at once.
    pub max_concurrent: usize,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryStrategy,
    /// Notification flags.
    #[serde(default)]
    pub notifications: NotificationFlags,
}

impl ScheduleConfig {
    /// Daily evaluations over `start..end`, one task at a time, default retries.
    #[must_use]
    pub fn daily(start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
        Self {
            start_date,
            end_date,
            checkpoint_offsets_ms: Vec::new(),
            evaluation_interval_ms: 24 * 60 * 60 * 1000,
            max_concurrent: 1,
            priority: 0,
            retry: RetryStrategy::default(),
            notifications: NotificationFlags::default(),
        }
    }

    /// Window length.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end_date - self.start_date
    }

    /// Window length in milliseconds; zero for an inverted window.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration().num_milliseconds()).unwrap_or(0)
    }

    /// Evaluation interval as a chrono duration, saturating at
    /// [`Duration::MAX`].
    #[must_use]
    pub fn evaluation_interval(&self) -> Duration {
        millis(self.evaluation_interval_ms)
    }

    /// Absolute checkpoint instants. Offsets past the representable range
    /// are skipped.
    #[must_use]
    pub fn checkpoint_times(&self) -> Vec<DateTime<Utc>> {
        self.checkpoint_offsets_ms
            .iter()
            .filter_map(|&ms| self.start_date.checked_add_signed(millis(ms)))
            .collect()
    }

    /// Set checkpoint offsets.
    #[must_use]
    pub fn with_checkpoints(mut self, offsets_ms: Vec<u64>) -> Self {
        self.checkpoint_offsets_ms = offsets_ms;
        self
    }

    /// Set the evaluation interval.
    #[must_use]
    pub const fn with_evaluation_interval_ms(mut self, ms: u64) -> Self {
        self.evaluation_interval_ms = ms;
        self
    }

    /// Set the per-schedule concurrency cap.
    #[must_use]
    pub const fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    /// Set notification flags.
    #[must_use]
    pub const fn with_notifications(mut self, notifications: NotificationFlags) -> Self {
        self.notifications = notifications;
        self
    }
}
