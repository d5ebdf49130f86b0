//! Task execution seam

use super::task::ScheduledTask;
use crate::Result;
use std::future::Future;

/// Executes admitted tasks.
///
/// An `Err` is treated as a transient failure and fed into the task's retry
/// policy; the scheduler never propagates it.
pub trait TaskHandler: Send + Sync + 'static {
    /// Run one task and return a JSON summary stored on the task.
    fn execute(
        &self,
        task: &ScheduledTask,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send;
}
