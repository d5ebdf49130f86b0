//! Scheduled Task - one timed unit of work for an experiment

use crate::experiment::RetryStrategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a task does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Periodic evaluation (variant comparison or federated rounds).
    Evaluation,
    /// Snapshot of experiment / model state.
    Checkpoint,
    /// End-of-window completion.
    Completion,
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its scheduled time (or its next retry).
    Pending,
    /// Admitted by a tick and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Retries exhausted or cancelled.
    Failed,
}

impl TaskStatus {
    /// Completed and Failed never change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What happened after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to Pending at `retry_at`.
    Retry {
        /// Next eligible time.
        retry_at: DateTime<Utc>,
    },
    /// Terminal Failed.
    Exhausted,
}

/// A task owned by the scheduler, referencing its experiment by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    id: String,
    experiment_id: String,
    task_type: TaskType,
    scheduled_at: DateTime<Utc>,
    priority: i32,
    status: TaskStatus,
    retries: u32,
    last_error: Option<String>,
    result: Option<serde_json::Value>,
    updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Create a Pending task.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        experiment_id: impl Into<String>,
        task_type: TaskType,
        scheduled_at: DateTime<Utc>,
        priority: i32,
    ) -> Self {
        Self {
            id: id.into(),
            experiment_id: experiment_id.into(),
            task_type,
            scheduled_at,
            priority,
            status: TaskStatus::Pending,
            retries: 0,
            last_error: None,
            result: None,
            updated_at: scheduled_at,
        }
    }

    /// Task id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Owning experiment id.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Task type.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Earliest time the task may run.
    #[must_use]
    pub const fn scheduled_at(&self) -> DateTime<Utc> {
        self.scheduled_at
    }

    /// Higher runs first.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// Failed attempts so far that were followed by a retry.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Message of the most recent failure.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Handler output of a completed task.
    #[must_use]
    pub const fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    /// Last status change.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Pending, due, and within its retry budget.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, retry: &RetryStrategy) -> bool {
        self.status == TaskStatus::Pending
            && now >= self.scheduled_at
            && self.retries <= retry.max_retries
    }

    /// Pending → Running.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.updated_at = now;
    }

    /// Running → Completed.
    pub fn complete(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.updated_at = now;
    }

    /// Record a failed attempt and either reschedule with backoff or give up.
    ///
    /// A retry whose time cannot be represented is treated as exhausted.
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        retry: &RetryStrategy,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        self.last_error = Some(error.into());
        self.updated_at = now;
        let retry_at = (self.retries < retry.max_retries)
            .then(|| retry.retry_at(now, self.retries))
            .flatten();
        if let Some(retry_at) = retry_at {
            self.retries += 1;
            self.status = TaskStatus::Pending;
            self.scheduled_at = retry_at;
            FailureOutcome::Retry { retry_at }
        } else {
            self.status = TaskStatus::Failed;
            FailureOutcome::Exhausted
        }
    }

    /// Pending → Failed("cancelled"). Returns whether the task changed.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.last_error = Some("cancelled".to_string());
        self.updated_at = now;
        true
    }

    /// Running → Pending without spending a retry (interrupted by a restart).
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        if self.status == TaskStatus::Running {
            self.status = TaskStatus::Pending;
            self.updated_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn task() -> ScheduledTask {
        let at = Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap();
        ScheduledTask::new("task-1-1", "exp-1-1", TaskType::Evaluation, at, 0)
    }

    #[test]
    fn test_lifecycle_success() {
        let mut t = task();
        let now = t.scheduled_at();
        assert!(t.is_due(now, &RetryStrategy::default()));
        assert!(!t.is_due(now - Duration::seconds(1), &RetryStrategy::default()));

        t.start(now);
        assert_eq!(t.status(), TaskStatus::Running);
        assert!(!t.is_due(now, &RetryStrategy::default()));

        t.complete(serde_json::json!({"ok": true}), now);
        assert_eq!(t.status(), TaskStatus::Completed);
        assert!(t.status().is_terminal());
    }

    #[test]
    fn test_backoff_then_exhaustion() {
        let retry = RetryStrategy {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: 1000,
        };
        let mut t = task();
        let now = t.scheduled_at();
        let mut delays = Vec::new();

        for _ in 0..3 {
            t.start(now);
            match t.fail("boom", &retry, now) {
                FailureOutcome::Retry { retry_at } => delays.push((retry_at - now).num_milliseconds()),
                FailureOutcome::Exhausted => panic!("gave up too early"),
            }
            assert!(t.is_due(t.scheduled_at(), &retry));
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);

        t.start(now);
        assert_eq!(t.fail("boom", &retry, now), FailureOutcome::Exhausted);
        assert_eq!(t.status(), TaskStatus::Failed);
        assert_eq!(t.last_error(), Some("boom"));
    }

    #[test]
    fn test_unrepresentable_retry_time_is_terminal() {
        let retry = RetryStrategy {
            max_retries: 3,
            backoff_multiplier: 2.0,
            initial_delay_ms: u64::MAX,
        };
        let mut t = task();
        let now = t.scheduled_at();
        t.start(now);

        assert_eq!(t.fail("boom", &retry, now), FailureOutcome::Exhausted);
        assert_eq!(t.status(), TaskStatus::Failed);
        assert_eq!(t.retries(), 0);
        assert_eq!(t.last_error(), Some("boom"));
    }

    #[test]
    fn test_cancel_only_touches_pending() {
        let mut pending = task();
        assert!(pending.cancel(pending.scheduled_at()));
        assert_eq!(pending.last_error(), Some("cancelled"));

        let mut running = task();
        running.start(running.scheduled_at());
        assert!(!running.cancel(running.scheduled_at()));
        assert_eq!(running.status(), TaskStatus::Running);
    }
}
