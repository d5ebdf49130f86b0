//! Task scheduling
//!
//! A schedule is expanded into evaluation, checkpoint and completion tasks
//! when it is created. [`TaskScheduler::tick`] admits due tasks under a
//! concurrency ceiling and hands them to a [`TaskHandler`]; failures are
//! retried with exponential backoff until the schedule's retry budget runs
//! out.

mod engine;
mod generation;
mod handler;
mod notify;
mod task;

pub use engine::{ScheduleRecord, ScheduleStatus, TaskScheduler, TickReport};
pub use generation::generate_tasks;
pub use handler::TaskHandler;
pub use notify::{LogNotifier, Notification, NotificationSink};
pub use task::{FailureOutcome, ScheduledTask, TaskStatus, TaskType};
