//! Task Scheduler - polling loop with bounded concurrency and retry/backoff
//!
//! ## Tick
//!
//! ```text
//! load active schedules ──> due tasks (Pending, now ≥ at, retries ≤ max)
//!        │                       │ sort: priority desc, scheduled_at asc
//!        │                       ▼
//!        └── ceiling = max(max_concurrent) ──> admit ceiling − running
//!                                                │ mark Running, persist
//!                                                ▼
//!                                   spawn (timeout-bounded handler)
//! ```
//!
//! Admitted tasks run as independent tokio tasks. Their outcome is written
//! back under the same write lock the tick uses, so the scheduler is the
//! single writer of schedule records. A task left Running with no live
//! execution (its outcome write failed, or it panicked) goes back to Pending
//! on the next tick without spending a retry.

use super::generation::generate_tasks;
use super::handler::TaskHandler;
use super::notify::{Notification, NotificationSink};
use super::task::{FailureOutcome, ScheduledTask, TaskStatus, TaskType};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::experiment::{Experiment, ExperimentStatus, ScheduleConfig};
use crate::ids::IdGenerator;
use crate::kv::{KvStore, RecordStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const ACTIVE_INDEX_KEY: &str = "schedule/index";

fn record_key(experiment_id: &str) -> String {
    format!("schedule/{experiment_id}")
}

/// Persisted schedule: the config plus every task generated from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    experiment_id: String,
    config: ScheduleConfig,
    tasks: Vec<ScheduledTask>,
    created_at: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
}

impl ScheduleRecord {
    /// Owning experiment.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Schedule configuration.
    #[must_use]
    pub const fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// All tasks in time order.
    #[must_use]
    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    /// Set once `cancel_schedule` ran.
    #[must_use]
    pub const fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status() == status).count()
    }

    fn task_mut(&mut self, task_id: &str) -> Option<&mut ScheduledTask> {
        self.tasks.iter_mut().find(|t| t.id() == task_id)
    }
}

/// Snapshot returned by [`TaskScheduler::get_schedule_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    /// Experiment id.
    pub experiment_id: String,
    /// False once cancelled.
    pub active: bool,
    /// Tasks waiting to run.
    pub pending: usize,
    /// Tasks executing.
    pub running: usize,
    /// Tasks finished.
    pub completed: usize,
    /// Tasks failed permanently or cancelled.
    pub failed: usize,
    /// Earliest pending task time.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Every task.
    pub tasks: Vec<ScheduledTask>,
}

impl From<&ScheduleRecord> for ScheduleStatus {
    fn from(record: &ScheduleRecord) -> Self {
        Self {
            experiment_id: record.experiment_id.clone(),
            active: record.cancelled_at.is_none(),
            pending: record.count(TaskStatus::Pending),
            running: record.count(TaskStatus::Running),
            completed: record.count(TaskStatus::Completed),
            failed: record.count(TaskStatus::Failed),
            next_run_at: record
                .tasks
                .iter()
                .filter(|t| t.status() == TaskStatus::Pending)
                .map(ScheduledTask::scheduled_at)
                .min(),
            tasks: record.tasks.clone(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Concurrency ceiling in effect.
    pub ceiling: usize,
    /// Tasks already Running when the tick started.
    pub already_running: usize,
    /// Ids admitted by this tick, in admission order.
    pub admitted: Vec<String>,
    /// Running tasks with no live execution returned to Pending.
    pub requeued: usize,
}

struct Shared<S: KvStore, H: TaskHandler, N: NotificationSink> {
    records: RecordStore<S>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    handler: H,
    notifier: N,
    config: SchedulerConfig,
    write_lock: Mutex<()>,
    in_flight: Mutex<JoinSet<()>>,
    /// Ids of tasks with a live execution in this process.
    running: DashSet<String>,
}

/// Drops a task id from the running set when its execution ends, including
/// by panic or abort.
struct InFlight<'a> {
    running: &'a DashSet<String>,
    task_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.task_id);
    }
}

/// Expands schedules into tasks and runs them.
pub struct TaskScheduler<S: KvStore, H: TaskHandler, N: NotificationSink> {
    shared: Arc<Shared<S, H, N>>,
}

impl<S: KvStore, H: TaskHandler, N: NotificationSink> Clone for TaskScheduler<S, H, N> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S, H, N> TaskScheduler<S, H, N>
where
    S: KvStore + 'static,
    H: TaskHandler,
    N: NotificationSink,
{
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        records: RecordStore<S>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn Clock>,
        handler: H,
        notifier: N,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                records,
                ids,
                clock,
                handler,
                notifier,
                config,
                write_lock: Mutex::new(()),
                in_flight: Mutex::new(JoinSet::new()),
                running: DashSet::new(),
            }),
        }
    }

    /// The task handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    /// Generate and persist the tasks of an experiment's schedule.
    ///
    /// # Errors
    /// Returns `Validation` if the experiment is completed or already has an
    /// active schedule.
    pub async fn schedule_experiment(&self, experiment: &Experiment) -> Result<ScheduleStatus> {
        if experiment.status() == ExperimentStatus::Completed {
            return Err(Error::Validation(format!(
                "experiment {} is completed and cannot be scheduled",
                experiment.id()
            )));
        }
        let shared = &self.shared;
        let _guard = shared.write_lock.lock().await;
        let key = record_key(experiment.id());
        if let Some(existing) = shared.records.load::<ScheduleRecord>(&key).await? {
            if existing.cancelled_at.is_none() {
                return Err(Error::Validation(format!(
                    "experiment {} is already scheduled",
                    experiment.id()
                )));
            }
        }

        let record = ScheduleRecord {
            experiment_id: experiment.id().to_string(),
            config: experiment.schedule().clone(),
            tasks: generate_tasks(experiment.id(), experiment.schedule(), &shared.ids),
            created_at: shared.clock.now(),
            cancelled_at: None,
        };
        shared.records.save(&key, &record).await?;
        shared
            .records
            .index_insert(ACTIVE_INDEX_KEY, experiment.id())
            .await?;

        info!(
            experiment_id = experiment.id(),
            tasks = record.tasks.len(),
            max_concurrent = record.config.max_concurrent,
            "schedule created"
        );
        Ok(ScheduleStatus::from(&record))
    }

    /// Per-status counts and the task list.
    ///
    /// # Errors
    /// Returns `NotFound` if the experiment was never scheduled.
    pub async fn get_schedule_status(&self, experiment_id: &str) -> Result<ScheduleStatus> {
        let record: ScheduleRecord = self
            .shared
            .records
            .load_required(&record_key(experiment_id), "schedule", experiment_id)
            .await?;
        Ok(ScheduleStatus::from(&record))
    }

    /// Flip every Pending task to Failed("cancelled") and deactivate the
    /// schedule. Running tasks finish, but their outcome is discarded.
    ///
    /// # Errors
    /// Returns `NotFound` if the experiment has no schedule.
    pub async fn cancel_schedule(&self, experiment_id: &str) -> Result<usize> {
        let shared = &self.shared;
        let cancelled = {
            let _guard = shared.write_lock.lock().await;
            let key = record_key(experiment_id);
            let mut record: ScheduleRecord = shared
                .records
                .load_required(&key, "schedule", experiment_id)
                .await?;
            let now = shared.clock.now();
            let cancelled = record
                .tasks
                .iter_mut()
                .map(|t| t.cancel(now))
                .filter(|changed| *changed)
                .count();
            record.cancelled_at.get_or_insert(now);
            shared.records.save(&key, &record).await?;
            shared
                .records
                .index_remove(ACTIVE_INDEX_KEY, experiment_id)
                .await?;
            cancelled
        };

        info!(experiment_id, cancelled, "schedule cancelled");
        shared
            .deliver(Notification::ScheduleCancelled {
                experiment_id: experiment_id.to_string(),
                cancelled_tasks: cancelled,
            })
            .await;
        Ok(cancelled)
    }

    /// Reset tasks left Running by a previous process back to Pending.
    ///
    /// Call once at startup, before the first tick.
    ///
    /// # Errors
    /// Returns persistence errors.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let shared = &self.shared;
        let _guard = shared.write_lock.lock().await;
        let now = shared.clock.now();
        let mut recovered = 0;
        for id in shared.records.index(ACTIVE_INDEX_KEY).await? {
            let key = record_key(&id);
            let Some(mut record) = shared.records.load::<ScheduleRecord>(&key).await? else {
                continue;
            };
            let before = record.count(TaskStatus::Running);
            record.tasks.iter_mut().for_each(|t| t.requeue(now));
            if before > 0 {
                recovered += before;
                shared.records.save(&key, &record).await?;
            }
        }
        if recovered > 0 {
            warn!(recovered, "requeued tasks interrupted by a restart");
        }
        Ok(recovered)
    }

    /// Run one poll tick: admit due tasks and spawn them.
    ///
    /// The ceiling is the largest `max_concurrent` among active schedules;
    /// each schedule is additionally held to its own `max_concurrent`.
    ///
    /// # Errors
    /// Returns persistence errors while reading or marking tasks. Task
    /// failures never surface here.
    pub async fn tick(&self) -> Result<TickReport> {
        let shared = &self.shared;
        shared.reap_finished().await;

        let admitted_tasks = {
            let _guard = shared.write_lock.lock().await;
            let now = shared.clock.now();

            let mut records = Vec::new();
            for id in shared.records.index(ACTIVE_INDEX_KEY).await? {
                if let Some(record) = shared.records.load::<ScheduleRecord>(&record_key(&id)).await? {
                    records.push(record);
                }
            }

            let mut touched = vec![false; records.len()];
            let mut requeued = 0;
            for (record, touched) in records.iter_mut().zip(touched.iter_mut()) {
                for task in record.tasks.iter_mut().filter(|t| {
                    t.status() == TaskStatus::Running && !shared.running.contains(t.id())
                }) {
                    task.requeue(now);
                    requeued += 1;
                    *touched = true;
                }
            }
            let ceiling = records
                .iter()
                .map(|r| r.config.max_concurrent)
                .max()
                .unwrap_or(0);
            let mut running_per_schedule: HashMap<String, usize> = records
                .iter()
                .map(|r| (r.experiment_id.clone(), r.count(TaskStatus::Running)))
                .collect();
            let already_running: usize = running_per_schedule.values().sum();

            let mut due: Vec<(usize, &ScheduledTask)> = records
                .iter()
                .enumerate()
                .flat_map(|(i, r)| {
                    r.tasks
                        .iter()
                        .filter(move |t| t.is_due(now, &r.config.retry))
                        .map(move |t| (i, t))
                })
                .collect();
            due.sort_by(|(_, a), (_, b)| {
                b.priority()
                    .cmp(&a.priority())
                    .then(a.scheduled_at().cmp(&b.scheduled_at()))
                    .then_with(|| a.id().cmp(b.id()))
            });

            let mut slots = ceiling.saturating_sub(already_running);
            let mut picked: Vec<(usize, String)> = Vec::new();
            for (i, task) in due {
                if slots == 0 {
                    break;
                }
                let record = &records[i];
                let running = running_per_schedule
                    .entry(record.experiment_id.clone())
                    .or_default();
                if *running >= record.config.max_concurrent {
                    continue;
                }
                *running += 1;
                slots -= 1;
                picked.push((i, task.id().to_string()));
            }

            let mut admitted = Vec::with_capacity(picked.len());
            for (i, task_id) in &picked {
                if let Some(task) = records[*i].task_mut(task_id) {
                    task.start(now);
                    admitted.push(task.clone());
                    touched[*i] = true;
                }
            }
            for (record, _) in records.iter().zip(&touched).filter(|(_, t)| **t) {
                shared
                    .records
                    .save(&record_key(&record.experiment_id), record)
                    .await?;
            }
            for task in &admitted {
                shared.running.insert(task.id().to_string());
            }

            (ceiling, already_running, admitted, requeued)
        };

        let (ceiling, already_running, admitted, requeued) = admitted_tasks;
        let report = TickReport {
            ceiling,
            already_running,
            admitted: admitted.iter().map(|t| t.id().to_string()).collect(),
            requeued,
        };
        if requeued > 0 {
            warn!(requeued, "requeued running tasks with no live execution");
        }
        if !admitted.is_empty() {
            debug!(
                ceiling,
                already_running,
                admitted = admitted.len(),
                "tick admitted tasks"
            );
        }

        let mut in_flight = shared.in_flight.lock().await;
        for task in admitted {
            let shared = Arc::clone(shared);
            in_flight.spawn(async move { shared.execute(task).await });
        }
        Ok(report)
    }

    /// Wait until every spawned task has finished and written its outcome.
    pub async fn wait_idle(&self) {
        loop {
            let mut set = {
                let mut in_flight = self.shared.in_flight.lock().await;
                if in_flight.is_empty() {
                    return;
                }
                std::mem::take(&mut *in_flight)
            };
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "scheduled task panicked");
                }
            }
        }
    }

    /// Tick every `poll_interval` until `shutdown` flips to `true`, then
    /// drain in-flight tasks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.shared.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            poll_interval_ms = self.shared.config.poll_interval_ms,
            "scheduler loop started"
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.wait_idle().await;
        info!("scheduler loop stopped");
    }
}

impl<S, H, N> Shared<S, H, N>
where
    S: KvStore + 'static,
    H: TaskHandler,
    N: NotificationSink,
{
    async fn reap_finished(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(joined) = in_flight.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "scheduled task panicked");
            }
        }
    }

    async fn execute(&self, task: ScheduledTask) {
        let _in_flight = InFlight {
            running: &self.running,
            task_id: task.id().to_string(),
        };
        let timeout = self.config.task_timeout();
        let outcome = match tokio::time::timeout(timeout, self.handler.execute(&task)).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientExecution(format!(
                "task {} timed out after {} ms",
                task.id(),
                self.config.task_timeout_ms
            ))),
        };

        match self.apply_outcome(&task, outcome).await {
            Ok(Some(notification)) => self.deliver(notification).await,
            Ok(None) => {}
            Err(e) => error!(
                task_id = task.id(),
                experiment_id = task.experiment_id(),
                error = %e,
                "failed to record task outcome"
            ),
        }
    }

    /// Write a finished attempt back to its schedule record.
    async fn apply_outcome(
        &self,
        task: &ScheduledTask,
        outcome: Result<serde_json::Value>,
    ) -> Result<Option<Notification>> {
        let _guard = self.write_lock.lock().await;
        let key = record_key(task.experiment_id());
        let Some(mut record) = self.records.load::<ScheduleRecord>(&key).await? else {
            debug!(task_id = task.id(), "schedule removed; outcome ignored");
            return Ok(None);
        };
        if record.cancelled_at.is_some() {
            debug!(task_id = task.id(), "schedule cancelled; outcome ignored");
            return Ok(None);
        }
        let now = self.clock.now();
        let retry = record.config.retry;
        let flags = record.config.notifications;
        let Some(stored) = record.task_mut(task.id()) else {
            return Ok(None);
        };
        if stored.status() != TaskStatus::Running {
            return Ok(None);
        }

        let notification = match outcome {
            Ok(value) => {
                stored.complete(value, now);
                info!(
                    task_id = task.id(),
                    experiment_id = task.experiment_id(),
                    task_type = ?task.task_type(),
                    "task completed"
                );
                match task.task_type() {
                    TaskType::Completion if flags.on_completion => {
                        Some(Notification::ExperimentCompleted {
                            experiment_id: task.experiment_id().to_string(),
                            task_id: task.id().to_string(),
                        })
                    }
                    TaskType::Checkpoint if flags.on_checkpoint => {
                        Some(Notification::CheckpointWritten {
                            experiment_id: task.experiment_id().to_string(),
                            task_id: task.id().to_string(),
                        })
                    }
                    _ => None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                match stored.fail(message.clone(), &retry, now) {
                    FailureOutcome::Retry { retry_at } => {
                        warn!(
                            task_id = task.id(),
                            experiment_id = task.experiment_id(),
                            retries = stored.retries(),
                            %retry_at,
                            error = %message,
                            "task failed; retry scheduled"
                        );
                        None
                    }
                    FailureOutcome::Exhausted => {
                        let terminal = Error::TerminalExecution {
                            task_id: task.id().to_string(),
                            reason: message.clone(),
                        };
                        error!(
                            experiment_id = task.experiment_id(),
                            error = %terminal,
                            "task retries exhausted"
                        );
                        flags.on_failure.then(|| Notification::TaskFailed {
                            experiment_id: task.experiment_id().to_string(),
                            task_id: task.id().to_string(),
                            task_type: task.task_type(),
                            error: message,
                            retries: stored.retries(),
                        })
                    }
                }
            }
        };

        self.records.save(&key, &record).await?;
        Ok(notification)
    }

    async fn deliver(&self, notification: Notification) {
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(error = %e, "notification delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::experiment::{ExperimentConfig, ExperimentType, RetryStrategy, VariantConfig};
    use crate::kv::faulty::FaultyStore;
    use crate::kv::MemoryKvStore;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Hang,
        SlowSucceed(u64),
    }

    struct TestHandler {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl TaskHandler for TestHandler {
        async fn execute(&self, task: &ScheduledTask) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(serde_json::json!({ "task": task.id() })),
                Behavior::Fail => Err(Error::TransientExecution("evaluator offline".into())),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    Ok(serde_json::Value::Null)
                }
                Behavior::SlowSucceed(ms) => {
                    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                    Ok(serde_json::Value::Null)
                }
            }
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        events: Arc<StdMutex<Vec<Notification>>>,
    }

    impl NotificationSink for RecordingNotifier {
        async fn notify(&self, event: Notification) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    type TestScheduler = TaskScheduler<MemoryKvStore, TestHandler, RecordingNotifier>;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap()
    }

    fn experiment(id: &str, schedule: ScheduleConfig) -> Experiment {
        let config = ExperimentConfig::builder("checkout", ExperimentType::AbTest, schedule)
            .variant(VariantConfig::control("control", 0.5))
            .variant(VariantConfig::treatment("treatment", 0.5))
            .build();
        Experiment::from_config(id, config, start())
    }

    fn scheduler_on<S: KvStore + 'static>(
        records: RecordStore<S>,
        clock: Arc<ManualClock>,
        behavior: Behavior,
        task_timeout_ms: u64,
    ) -> (TaskScheduler<S, TestHandler, RecordingNotifier>, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let scheduler = TaskScheduler::new(
            records,
            Arc::new(IdGenerator::with_generation(1)),
            clock,
            TestHandler {
                behavior,
                calls: AtomicUsize::new(0),
            },
            notifier.clone(),
            SchedulerConfig {
                poll_interval_ms: 10,
                task_timeout_ms,
            },
        );
        (scheduler, notifier)
    }

    fn scheduler(clock: Arc<ManualClock>, behavior: Behavior) -> (TestScheduler, RecordingNotifier) {
        scheduler_on(
            RecordStore::new(Arc::new(MemoryKvStore::new())),
            clock,
            behavior,
            5_000,
        )
    }

    #[tokio::test]
    async fn test_tick_respects_concurrency_ceiling() {
        let clock = ManualClock::shared(start());
        let (scheduler, _) = scheduler(clock.clone(), Behavior::Hang);
        let schedule = ScheduleConfig::daily(start(), start() + Duration::days(7))
            .with_evaluation_interval_ms(3_600_000)
            .with_max_concurrent(2);
        scheduler.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();

        clock.set(start() + Duration::days(7));
        let first = scheduler.tick().await.unwrap();
        assert_eq!(first.ceiling, 2);
        assert_eq!(first.admitted.len(), 2);

        let second = scheduler.tick().await.unwrap();
        assert_eq!(second.already_running, 2);
        assert_eq!(second.requeued, 0);
        assert!(second.admitted.is_empty());

        let status = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(status.running, 2);
    }

    #[tokio::test]
    async fn test_per_schedule_cap_under_shared_ceiling() {
        let clock = ManualClock::shared(start());
        let (scheduler, _) = scheduler(clock.clone(), Behavior::Hang);
        let wide = ScheduleConfig::daily(start(), start() + Duration::days(7))
            .with_evaluation_interval_ms(3_600_000)
            .with_max_concurrent(3);
        let narrow = ScheduleConfig::daily(start(), start() + Duration::days(7))
            .with_evaluation_interval_ms(3_600_000)
            .with_max_concurrent(1)
            .with_priority(10);
        scheduler.schedule_experiment(&experiment("exp-1-1", wide)).await.unwrap();
        scheduler.schedule_experiment(&experiment("exp-1-2", narrow)).await.unwrap();

        clock.set(start() + Duration::days(7));
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.ceiling, 3);
        assert_eq!(report.admitted.len(), 3);

        let narrow = scheduler.get_schedule_status("exp-1-2").await.unwrap();
        let wide = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(narrow.running, 1);
        assert_eq!(wide.running, 2);
    }

    #[tokio::test]
    async fn test_successful_completion_notifies() {
        let clock = ManualClock::shared(start());
        let (scheduler, notifier) = scheduler(clock.clone(), Behavior::Succeed);
        let schedule = ScheduleConfig::daily(start(), start() + Duration::hours(12));
        scheduler.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();

        assert!(scheduler.tick().await.unwrap().admitted.is_empty());

        clock.set(start() + Duration::hours(12));
        assert_eq!(scheduler.tick().await.unwrap().admitted.len(), 1);
        scheduler.wait_idle().await;

        let status = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(status.completed, 1);
        assert!(status.tasks[0].result().is_some());
        let events = notifier.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [Notification::ExperimentCompleted { experiment_id, .. }] if experiment_id == "exp-1-1"
        ));
    }

    #[tokio::test]
    async fn test_backoff_then_terminal_failure() {
        let clock = ManualClock::shared(start());
        let (scheduler, notifier) = scheduler(clock.clone(), Behavior::Fail);
        let schedule = ScheduleConfig::daily(start(), start() + Duration::hours(12))
            .with_retry(RetryStrategy::default());
        scheduler.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();
        clock.set(start() + Duration::hours(12));

        let mut delays = Vec::new();
        for _ in 0..3 {
            assert_eq!(scheduler.tick().await.unwrap().admitted.len(), 1);
            scheduler.wait_idle().await;
            let task = scheduler.get_schedule_status("exp-1-1").await.unwrap().tasks[0].clone();
            assert_eq!(task.status(), TaskStatus::Pending);
            let delay = task.scheduled_at() - clock.now();
            delays.push(delay.num_milliseconds());

            assert!(scheduler.tick().await.unwrap().admitted.is_empty());
            clock.advance(delay);
        }
        assert_eq!(delays, vec![1000, 2000, 4000]);

        assert_eq!(scheduler.tick().await.unwrap().admitted.len(), 1);
        scheduler.wait_idle().await;

        let status = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 0);
        assert_eq!(scheduler.handler().calls.load(Ordering::SeqCst), 4);

        let events = notifier.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [Notification::TaskFailed { retries: 3, .. }]
        ));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let clock = ManualClock::shared(start());
        let (scheduler, _) = scheduler_on(
            RecordStore::new(Arc::new(MemoryKvStore::new())),
            clock.clone(),
            Behavior::Hang,
            20,
        );
        let schedule = ScheduleConfig::daily(start(), start() + Duration::hours(12));
        scheduler.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();
        clock.set(start() + Duration::hours(12));

        scheduler.tick().await.unwrap();
        scheduler.wait_idle().await;

        let task = scheduler.get_schedule_status("exp-1-1").await.unwrap().tasks[0].clone();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.retries(), 1);
        assert!(task.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_lost_outcome_write_is_requeued_by_next_tick() {
        let clock = ManualClock::shared(start());
        let store = Arc::new(FaultyStore::new());
        let (scheduler, _) = scheduler_on(
            RecordStore::new(Arc::clone(&store)),
            clock.clone(),
            Behavior::Succeed,
            5_000,
        );
        let schedule = ScheduleConfig::daily(start(), start() + Duration::hours(12));
        scheduler.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();
        clock.set(start() + Duration::hours(12));

        assert_eq!(scheduler.tick().await.unwrap().admitted.len(), 1);
        store.fail_writes(true);
        scheduler.wait_idle().await;
        store.fail_writes(false);
        assert_eq!(scheduler.get_schedule_status("exp-1-1").await.unwrap().running, 1);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.already_running, 0);
        assert_eq!(report.admitted.len(), 1);
        scheduler.wait_idle().await;

        let status = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(status.completed, 1);
        assert_eq!(status.tasks[0].retries(), 0);
        assert_eq!(scheduler.handler().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_leaves_no_pending_tasks() {
        let clock = ManualClock::shared(start());
        let (scheduler, notifier) = scheduler(clock.clone(), Behavior::Succeed);
        let schedule = ScheduleConfig::daily(start(), start() + Duration::days(7));
        let exp = experiment("exp-1-1", schedule);
        let created = scheduler.schedule_experiment(&exp).await.unwrap();

        assert!(matches!(
            scheduler.schedule_experiment(&exp).await,
            Err(Error::Validation(_))
        ));

        let cancelled = scheduler.cancel_schedule("exp-1-1").await.unwrap();
        assert_eq!(cancelled, created.pending);

        let status = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert!(!status.active);
        assert_eq!(status.pending, 0);
        assert!(status.tasks.iter().all(|t| t.last_error() == Some("cancelled")));

        clock.set(start() + Duration::days(7));
        assert!(scheduler.tick().await.unwrap().admitted.is_empty());
        assert_eq!(notifier.events.lock().unwrap().len(), 1);

        // a cancelled schedule may be replaced
        scheduler.schedule_experiment(&exp).await.unwrap();
    }

    #[tokio::test]
    async fn test_outcome_after_cancel_is_ignored() {
        let clock = ManualClock::shared(start());
        let (scheduler, _) = scheduler(clock.clone(), Behavior::SlowSucceed(50));
        let schedule = ScheduleConfig::daily(start(), start() + Duration::hours(12));
        scheduler.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();
        clock.set(start() + Duration::hours(12));

        assert_eq!(scheduler.tick().await.unwrap().admitted.len(), 1);
        assert_eq!(scheduler.cancel_schedule("exp-1-1").await.unwrap(), 0);
        scheduler.wait_idle().await;

        let status = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(status.completed, 0);
        assert_eq!(status.running, 1);
    }

    #[tokio::test]
    async fn test_recover_requeues_running_tasks() {
        let clock = ManualClock::shared(start());
        let records = RecordStore::new(Arc::new(MemoryKvStore::new()));
        let (first, _) = scheduler_on(records.clone(), clock.clone(), Behavior::Hang, 5_000);
        let schedule = ScheduleConfig::daily(start(), start() + Duration::hours(12));
        first.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();
        clock.set(start() + Duration::hours(12));
        first.tick().await.unwrap();

        let (restarted, _) = scheduler_on(records, clock, Behavior::Succeed, 5_000);
        assert_eq!(restarted.recover_interrupted().await.unwrap(), 1);
        let status = restarted.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(status.running, 0);
        assert_eq!(status.pending, 1);
        assert_eq!(status.tasks[0].retries(), 0);
    }

    #[tokio::test]
    async fn test_completed_experiment_cannot_be_scheduled() {
        let clock = ManualClock::shared(start());
        let (scheduler, _) = scheduler(clock, Behavior::Succeed);
        let mut exp = experiment("exp-1-1", ScheduleConfig::daily(start(), start() + Duration::days(7)));
        exp.set_status(ExperimentStatus::Completed, start());
        assert!(matches!(
            scheduler.schedule_experiment(&exp).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let clock = ManualClock::shared(start());
        let (scheduler, _) = scheduler(clock.clone(), Behavior::Succeed);
        let schedule = ScheduleConfig::daily(start(), start() + Duration::hours(12));
        scheduler.schedule_experiment(&experiment("exp-1-1", schedule)).await.unwrap();
        clock.set(start() + Duration::hours(12));

        let (tx, rx) = watch::channel(false);
        let runner = scheduler.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let status = scheduler.get_schedule_status("exp-1-1").await.unwrap();
        assert_eq!(status.completed, 1);
    }
}
