//! Expansion of a schedule into tasks

use super::task::{ScheduledTask, TaskType};
use crate::experiment::ScheduleConfig;
use crate::ids::IdGenerator;

/// Evaluation tasks every `evaluation_interval` strictly inside the window,
/// one checkpoint per offset, and a completion task at the end date.
/// Returned in time order.
#[must_use]
pub fn generate_tasks(
    experiment_id: &str,
    schedule: &ScheduleConfig,
    ids: &IdGenerator,
) -> Vec<ScheduledTask> {
    let mut tasks = Vec::new();
    let priority = schedule.priority;
    let interval = schedule.evaluation_interval();

    if interval > chrono::Duration::zero() {
        let mut next = schedule.start_date.checked_add_signed(interval);
        while let Some(at) = next.filter(|at| *at < schedule.end_date) {
            tasks.push(ScheduledTask::new(
                ids.next("task"),
                experiment_id,
                TaskType::Evaluation,
                at,
                priority,
            ));
            next = at.checked_add_signed(interval);
        }
    }

    for at in schedule.checkpoint_times() {
        tasks.push(ScheduledTask::new(
            ids.next("task"),
            experiment_id,
            TaskType::Checkpoint,
            at,
            priority,
        ));
    }

    tasks.push(ScheduledTask::new(
        ids.next("task"),
        experiment_id,
        TaskType::Completion,
        schedule.end_date,
        priority,
    ));

    tasks.sort_by_key(ScheduledTask::scheduled_at);
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_daily_schedule_over_a_week() {
        let start = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let schedule = ScheduleConfig::daily(start, start + Duration::days(7))
            .with_checkpoints(vec![2 * 24 * 3_600_000, 5 * 24 * 3_600_000]);

        let tasks = generate_tasks("exp-1-1", &schedule, &IdGenerator::with_generation(1));

        let count = |kind| tasks.iter().filter(|t| t.task_type() == kind).count();
        assert_eq!(count(TaskType::Evaluation), 6); // days 1..=6
        assert_eq!(count(TaskType::Checkpoint), 2);
        assert_eq!(count(TaskType::Completion), 1);

        let last = tasks.last().unwrap();
        assert_eq!(last.task_type(), TaskType::Completion);
        assert_eq!(last.scheduled_at(), start + Duration::days(7));
        assert!(tasks.windows(2).all(|w| w[0].scheduled_at() <= w[1].scheduled_at()));
        assert!(tasks.iter().all(|t| t.experiment_id() == "exp-1-1"));
    }

    #[test]
    fn test_interval_longer_than_window_yields_only_completion() {
        let start = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let schedule = ScheduleConfig::daily(start, start + Duration::hours(12));

        let tasks = generate_tasks("exp-1-1", &schedule, &IdGenerator::with_generation(1));

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type(), TaskType::Completion);
    }

    #[test]
    fn test_unrepresentable_interval_yields_only_completion() {
        let start = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let schedule = ScheduleConfig::daily(start, start + Duration::days(7))
            .with_evaluation_interval_ms(u64::MAX)
            .with_checkpoints(vec![u64::MAX]);

        let tasks = generate_tasks("exp-1-1", &schedule, &IdGenerator::with_generation(1));

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type(), TaskType::Completion);
    }
}
