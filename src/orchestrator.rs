//! Orchestrator - the public operation surface
//!
//! Wires the registry, allocator, scheduler and federated coordinator over
//! one key-value store and one clock, and routes scheduled tasks:
//!
//! ```text
//! Evaluation ─┬─ federated plan ──> FederatedCoordinator::train_detached
//!             └─ otherwise ───────> compare variants, auto-complete when eligible
//! Checkpoint ───> checkpoint/{experiment}/{task}  (experiment + global weights)
//! Completion ───> ExperimentRegistry::complete_test
//! ```

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::experiment::{
    stats, Experiment, ExperimentAnalysis, ExperimentConfig, ExperimentRegistry,
    ExperimentResults, ExperimentStatus, ExperimentType, Variant, VariantAllocator, VariantEvent,
};
use crate::federated::{
    ClientMetrics, FederatedClient, FederatedCoordinator, FederatedRound, ModelHandle,
    PrivacyBudget, TrainingExecutor, Tensor,
};
use crate::ids::IdGenerator;
use crate::kv::{KvStore, RecordStore};
use crate::scheduler::{
    NotificationSink, ScheduleStatus, ScheduledTask, TaskHandler, TaskScheduler, TaskType,
    TickReport,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Snapshot written by a checkpoint task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Task that wrote it.
    pub task_id: String,
    /// Experiment state at checkpoint time.
    pub experiment: Experiment,
    /// Global model weights, for experiments with a federated plan.
    pub weights: Option<Vec<Tensor>>,
    /// When it was taken.
    pub taken_at: DateTime<Utc>,
}

/// Key under which a checkpoint is stored.
#[must_use]
pub fn checkpoint_key(experiment_id: &str, task_id: &str) -> String {
    format!("checkpoint/{experiment_id}/{task_id}")
}

/// Routes scheduled tasks to the registry and the federated coordinator.
pub struct ExperimentTaskHandler<S: KvStore, E: TrainingExecutor, M: ModelHandle> {
    records: RecordStore<S>,
    registry: Arc<ExperimentRegistry<S>>,
    coordinator: Arc<FederatedCoordinator<S, E, M>>,
    clock: Arc<dyn Clock>,
}

impl<S, E, M> ExperimentTaskHandler<S, E, M>
where
    S: KvStore + 'static,
    E: TrainingExecutor,
    M: ModelHandle,
{
    /// Compare variants, persist their confidences and complete the
    /// experiment when it is eligible.
    ///
    /// # Errors
    /// Returns `NotFound` or persistence errors.
    pub async fn evaluate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let now = self.clock.now();
        let minimum = self.registry.limits().minimum_sample_size;
        let (experiment, (results, eligible)) = self
            .registry
            .update(experiment_id, |experiment| {
                let results = ExperimentResults::summarize(experiment, now);
                for comparison in &results.comparisons {
                    if let Some(variant) = experiment.variant_mut(&comparison.variant_id) {
                        variant.set_confidence(comparison.confidence);
                    }
                }
                let eligible = experiment.is_running()
                    && stats::should_auto_complete(experiment, now, minimum);
                Ok((results, eligible))
            })
            .await?;

        debug!(
            experiment_id,
            total_samples = results.total_samples,
            winner = ?results.winner,
            "variants evaluated"
        );
        if eligible {
            info!(experiment_id = experiment.id(), "auto-completing experiment");
            let completed = self.registry.complete_test(experiment_id).await?;
            if let Some(frozen) = completed.results() {
                return Ok(frozen.clone());
            }
        }
        Ok(results)
    }

    async fn run_evaluation(&self, experiment: &Experiment) -> Result<serde_json::Value> {
        if !experiment.is_running() {
            return Ok(json!({ "skipped": format!("{:?}", experiment.status()) }));
        }
        if let Some(plan) = experiment.federated() {
            let rounds = self
                .coordinator
                .train_detached(plan.rounds_per_evaluation)
                .await?;
            return Ok(json!({
                "rounds": rounds.iter().map(|r| json!({
                    "round_id": r.id(),
                    "phase": r.phase(),
                    "mean_loss": r.metrics().mean_loss,
                    "mean_accuracy": r.metrics().mean_accuracy,
                })).collect::<Vec<_>>(),
            }));
        }
        let results = self.evaluate(experiment.id()).await?;
        Ok(serde_json::to_value(results)?)
    }

    async fn run_checkpoint(
        &self,
        task: &ScheduledTask,
        experiment: Experiment,
    ) -> Result<serde_json::Value> {
        let weights = match experiment.federated() {
            Some(_) => Some(self.coordinator.model().weights().await?),
            None => None,
        };
        let key = checkpoint_key(experiment.id(), task.id());
        let checkpoint = Checkpoint {
            task_id: task.id().to_string(),
            experiment,
            weights,
            taken_at: self.clock.now(),
        };
        self.records.save(&key, &checkpoint).await?;
        Ok(json!({ "checkpoint": key }))
    }

    async fn run_completion(&self, experiment: &Experiment) -> Result<serde_json::Value> {
        let completed = match experiment.status() {
            ExperimentStatus::Completed => experiment.clone(),
            ExperimentStatus::Draft => {
                return Err(Error::Validation(format!(
                    "experiment {} was never started",
                    experiment.id()
                )))
            }
            ExperimentStatus::Running | ExperimentStatus::Paused => {
                self.registry.complete_test(experiment.id()).await?
            }
        };
        Ok(json!({
            "status": completed.status(),
            "winner": completed.results().and_then(|r| r.winner.clone()),
        }))
    }
}

impl<S, E, M> TaskHandler for ExperimentTaskHandler<S, E, M>
where
    S: KvStore + 'static,
    E: TrainingExecutor,
    M: ModelHandle,
{
    async fn execute(&self, task: &ScheduledTask) -> Result<serde_json::Value> {
        let experiment = self.registry.get_experiment(task.experiment_id()).await?;
        match task.task_type() {
            TaskType::Evaluation => self.run_evaluation(&experiment).await,
            TaskType::Checkpoint => self.run_checkpoint(task, experiment).await,
            TaskType::Completion => self.run_completion(&experiment).await,
        }
    }
}

/// Public entry point of the engine.
pub struct Orchestrator<S, E, M, N>
where
    S: KvStore + 'static,
    E: TrainingExecutor,
    M: ModelHandle,
    N: NotificationSink,
{
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<ExperimentRegistry<S>>,
    allocator: VariantAllocator<S>,
    coordinator: Arc<FederatedCoordinator<S, E, M>>,
    scheduler: TaskScheduler<S, ExperimentTaskHandler<S, E, M>, N>,
}

impl<S, E, M, N> Orchestrator<S, E, M, N>
where
    S: KvStore + 'static,
    E: TrainingExecutor,
    M: ModelHandle,
    N: NotificationSink,
{
    /// Build every component over `store`, restore federated state and
    /// requeue tasks interrupted by a previous run.
    ///
    /// # Errors
    /// Returns `Validation` for an invalid config, or persistence errors.
    pub async fn open(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        executor: Arc<E>,
        model: Arc<M>,
        notifier: N,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let records = RecordStore::new(store);
        let ids = Arc::new(IdGenerator::claim(&records).await?);

        let registry = Arc::new(ExperimentRegistry::new(
            records.clone(),
            Arc::clone(&ids),
            Arc::clone(&clock),
            config.experiments.clone(),
        ));
        let allocator = VariantAllocator::new(Arc::clone(&registry), config.experiments.assignment);
        let coordinator = Arc::new(FederatedCoordinator::new(
            records.clone(),
            Arc::clone(&ids),
            Arc::clone(&clock),
            executor,
            model,
            config.federated.clone(),
        ));
        coordinator.load().await?;

        let handler = ExperimentTaskHandler {
            records: records.clone(),
            registry: Arc::clone(&registry),
            coordinator: Arc::clone(&coordinator),
            clock: Arc::clone(&clock),
        };
        let scheduler = TaskScheduler::new(
            records,
            ids.clone(),
            Arc::clone(&clock),
            handler,
            notifier,
            config.scheduler.clone(),
        );
        scheduler.recover_interrupted().await?;

        info!(generation = ids.generation(), "orchestrator opened");
        Ok(Self {
            config,
            clock,
            registry,
            allocator,
            coordinator,
            scheduler,
        })
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Experiment registry.
    #[must_use]
    pub fn registry(&self) -> &ExperimentRegistry<S> {
        &self.registry
    }

    /// Federated coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &FederatedCoordinator<S, E, M> {
        &self.coordinator
    }

    /// Task scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &TaskScheduler<S, ExperimentTaskHandler<S, E, M>, N> {
        &self.scheduler
    }

    // --- experiments -------------------------------------------------------

    /// Validate and persist a new experiment.
    ///
    /// # Errors
    /// Returns `Validation` for an invalid definition.
    pub async fn create_experiment(&self, config: ExperimentConfig) -> Result<Experiment> {
        self.registry.create_experiment(config).await
    }

    /// Fetch an experiment.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn get_experiment(&self, experiment_id: &str) -> Result<Experiment> {
        self.registry.get_experiment(experiment_id).await
    }

    /// All experiments.
    ///
    /// # Errors
    /// Returns persistence errors.
    pub async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.registry.list_experiments().await
    }

    /// Delete a Draft or Completed experiment and cancel its schedule.
    ///
    /// # Errors
    /// Returns `Validation` while the experiment is Running or Paused.
    pub async fn delete_experiment(&self, experiment_id: &str) -> Result<()> {
        self.registry.delete_experiment(experiment_id).await?;
        match self.scheduler.cancel_schedule(experiment_id).await {
            Ok(_) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Start an A/B test or hyperparameter search.
    ///
    /// # Errors
    /// Returns `Validation` for cross-validation experiments (use
    /// [`Self::start_cross_validation`]) or an illegal transition.
    pub async fn start_ab_test(&self, experiment_id: &str) -> Result<Experiment> {
        let experiment = self.registry.get_experiment(experiment_id).await?;
        if !experiment.kind().is_comparative() {
            return Err(Error::Validation(format!(
                "experiment {experiment_id} is {}; start it with start_cross_validation",
                experiment.kind().as_str()
            )));
        }
        self.registry.start_test(experiment_id).await
    }

    /// Start a cross-validation experiment with `folds` folds.
    ///
    /// # Errors
    /// Returns `Validation` for the wrong type or fewer than two folds.
    pub async fn start_cross_validation(
        &self,
        experiment_id: &str,
        folds: usize,
    ) -> Result<Experiment> {
        self.registry.start_cross_validation(experiment_id, folds).await
    }

    /// Running → Paused.
    ///
    /// # Errors
    /// Returns `Validation` for an illegal transition.
    pub async fn pause_test(&self, experiment_id: &str) -> Result<Experiment> {
        self.registry.pause_test(experiment_id).await
    }

    /// Freeze results and complete.
    ///
    /// # Errors
    /// Returns `Validation` unless Running or Paused.
    pub async fn complete_test(&self, experiment_id: &str) -> Result<Experiment> {
        self.registry.complete_test(experiment_id).await
    }

    /// Variant for a subject, `None` unless Running.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown experiments.
    pub async fn assign_variant(
        &self,
        experiment_id: &str,
        subject_id: &str,
    ) -> Result<Option<String>> {
        self.allocator.assign(experiment_id, subject_id).await
    }

    /// Cross-validation fold of a subject.
    ///
    /// # Errors
    /// Returns `Validation` unless the experiment is a started cross-validation.
    pub async fn fold_for(&self, experiment_id: &str, subject_id: &str) -> Result<usize> {
        self.allocator.fold_for(experiment_id, subject_id).await
    }

    /// Fold an observed event into a variant.
    ///
    /// # Errors
    /// Returns `Validation` unless Running, `NotFound` for unknown ids.
    pub async fn record_event(
        &self,
        experiment_id: &str,
        variant_id: &str,
        event: VariantEvent,
    ) -> Result<Variant> {
        self.allocator
            .record_event(experiment_id, variant_id, event)
            .await
    }

    /// Compare variants now, persist confidences, auto-complete if eligible.
    ///
    /// Completed experiments return their frozen results.
    ///
    /// # Errors
    /// Returns `Validation` for cross-validation or never-started experiments.
    pub async fn evaluate_variants(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let experiment = self.registry.get_experiment(experiment_id).await?;
        if let Some(frozen) = experiment.results() {
            return Ok(frozen.clone());
        }
        if experiment.kind() == ExperimentType::CrossValidation {
            return Err(Error::Validation(format!(
                "experiment {experiment_id} has no variants to compare"
            )));
        }
        if experiment.status() == ExperimentStatus::Draft {
            return Err(Error::Validation(format!(
                "experiment {experiment_id} has not been started"
            )));
        }
        self.scheduler.handler().evaluate(experiment_id).await
    }

    /// Frozen results of a completed experiment, or a live snapshot.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn get_experiment_results(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let experiment = self.registry.get_experiment(experiment_id).await?;
        Ok(experiment
            .results()
            .cloned()
            .unwrap_or_else(|| ExperimentResults::summarize(&experiment, self.clock.now())))
    }

    /// Results plus a recommendation.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn analyze_results(&self, experiment_id: &str) -> Result<ExperimentAnalysis> {
        let experiment = self.registry.get_experiment(experiment_id).await?;
        let now = self.clock.now();
        let results = experiment
            .results()
            .cloned()
            .unwrap_or_else(|| ExperimentResults::summarize(&experiment, now));
        Ok(ExperimentAnalysis::from_results(
            &experiment,
            results,
            now,
            self.config.experiments.minimum_sample_size,
        ))
    }

    // --- scheduling --------------------------------------------------------

    /// Expand an experiment's schedule into tasks.
    ///
    /// # Errors
    /// Returns `Validation` when already scheduled or completed.
    pub async fn schedule_experiment(&self, experiment_id: &str) -> Result<ScheduleStatus> {
        let experiment = self.registry.get_experiment(experiment_id).await?;
        self.scheduler.schedule_experiment(&experiment).await
    }

    /// Task counts and list.
    ///
    /// # Errors
    /// Returns `NotFound` when never scheduled.
    pub async fn get_schedule_status(&self, experiment_id: &str) -> Result<ScheduleStatus> {
        self.scheduler.get_schedule_status(experiment_id).await
    }

    /// Cancel pending tasks. Returns how many were cancelled.
    ///
    /// # Errors
    /// Returns `NotFound` when never scheduled.
    pub async fn cancel_schedule(&self, experiment_id: &str) -> Result<usize> {
        self.scheduler.cancel_schedule(experiment_id).await
    }

    /// One scheduler tick.
    ///
    /// # Errors
    /// Returns persistence errors.
    pub async fn tick(&self) -> Result<TickReport> {
        self.scheduler.tick().await
    }

    /// Wait for in-flight tasks.
    pub async fn wait_idle(&self) {
        self.scheduler.wait_idle().await;
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.scheduler.run(shutdown).await;
    }

    // --- federated ---------------------------------------------------------

    /// Register a federated client.
    ///
    /// # Errors
    /// Returns `Validation` for duplicate ids.
    pub async fn register_client(
        &self,
        client_id: &str,
        metrics: ClientMetrics,
    ) -> Result<FederatedClient> {
        self.coordinator.register_client(client_id, metrics).await
    }

    /// Remove a federated client.
    ///
    /// # Errors
    /// Returns `Validation` while the client is in an active round.
    pub async fn unregister_client(&self, client_id: &str) -> Result<()> {
        self.coordinator.unregister_client(client_id).await
    }

    /// Return an errored client to Idle.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn reset_client(&self, client_id: &str) -> Result<FederatedClient> {
        self.coordinator.reset_client(client_id).await
    }

    /// Privacy budget spent by a client.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub fn privacy_budget(&self, client_id: &str) -> Result<PrivacyBudget> {
        self.coordinator.privacy_budget(client_id)
    }

    /// Run `rounds` federated rounds.
    ///
    /// # Errors
    /// Returns `InsufficientResources` when too few clients are idle or a
    /// round is already active.
    pub async fn start_federated_training(&self, rounds: usize) -> Result<Vec<FederatedRound>> {
        self.coordinator.train_detached(rounds).await
    }

    /// Archived rounds.
    pub async fn get_round_history(&self) -> Vec<FederatedRound> {
        self.coordinator.get_round_history().await
    }
}
