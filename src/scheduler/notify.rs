//! Notification collaborator
//!
//! Delivery is fire-and-forget: the scheduler logs a failed `notify` and
//! carries on, so a broken sink never fails the task that triggered it.

use super::task::TaskType;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::info;

/// Scheduler event delivered to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// A completion task finished.
    ExperimentCompleted {
        /// Experiment id.
        experiment_id: String,
        /// Task id.
        task_id: String,
    },
    /// A checkpoint task finished.
    CheckpointWritten {
        /// Experiment id.
        experiment_id: String,
        /// Task id.
        task_id: String,
    },
    /// A task exhausted its retries.
    TaskFailed {
        /// Experiment id.
        experiment_id: String,
        /// Task id.
        task_id: String,
        /// Task type.
        task_type: TaskType,
        /// Last error message.
        error: String,
        /// Retries spent.
        retries: u32,
    },
    /// A schedule was cancelled.
    ScheduleCancelled {
        /// Experiment id.
        experiment_id: String,
        /// Pending tasks flipped to Failed.
        cancelled_tasks: usize,
    },
}

/// Receives scheduler events.
pub trait NotificationSink: Send + Sync + 'static {
    /// Deliver one event.
    fn notify(&self, event: Notification) -> impl Future<Output = Result<()>> + Send;
}

/// Sink that writes events to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    async fn notify(&self, event: Notification) -> Result<()> {
        info!(target: "trueno_lab::notify", event = ?event, "notification");
        Ok(())
    }
}
