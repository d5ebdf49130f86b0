//! Experiment Registry - validated CRUD and the status state machine
//!
//! Every mutation is read-modify-write against the key-value store,
//! serialized by one async mutex so concurrent callers within a process
//! never lose each other's writes.

use super::experiment_record::{Experiment, ExperimentConfig, ExperimentStatus, ExperimentType};
use super::results::ExperimentResults;
use super::validation;
use crate::clock::Clock;
use crate::config::ExperimentLimits;
use crate::ids::IdGenerator;
use crate::kv::{KvStore, RecordStore};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const INDEX_KEY: &str = "experiment/index";

fn record_key(id: &str) -> String {
    format!("experiment/{id}")
}

/// Persistent registry of experiments.
pub struct ExperimentRegistry<S: KvStore> {
    records: RecordStore<S>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    limits: ExperimentLimits,
    write_lock: Mutex<()>,
}

impl<S: KvStore> ExperimentRegistry<S> {
    /// Create a registry over a shared store.
    #[must_use]
    pub fn new(
        records: RecordStore<S>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn Clock>,
        limits: ExperimentLimits,
    ) -> Self {
        Self {
            records,
            ids,
            clock,
            limits,
            write_lock: Mutex::new(()),
        }
    }

    /// Limits this registry validates against.
    #[must_use]
    pub const fn limits(&self) -> &ExperimentLimits {
        &self.limits
    }

    /// Validate and persist a new Draft experiment.
    ///
    /// # Errors
    /// Returns `Validation` for an invalid definition (nothing is written),
    /// or a persistence error.
    pub async fn create_experiment(&self, config: ExperimentConfig) -> Result<Experiment> {
        validation::validate_config(&config, &self.limits)?;

        let experiment = Experiment::from_config(self.ids.next("exp"), config, self.clock.now());
        let _guard = self.write_lock.lock().await;
        self.records
            .save(&record_key(experiment.id()), &experiment)
            .await?;
        self.records.index_insert(INDEX_KEY, experiment.id()).await?;

        info!(
            experiment_id = experiment.id(),
            kind = experiment.kind().as_str(),
            variants = experiment.variants().len(),
            "experiment created"
        );
        Ok(experiment)
    }

    /// Fetch an experiment.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown ids.
    pub async fn get_experiment(&self, id: &str) -> Result<Experiment> {
        self.records
            .load_required(&record_key(id), "experiment", id)
            .await
    }

    /// All experiments in creation order.
    ///
    /// # Errors
    /// Returns persistence or decoding errors.
    pub async fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut experiments = Vec::new();
        for id in self.records.index(INDEX_KEY).await? {
            if let Some(experiment) = self.records.load(&record_key(&id)).await? {
                experiments.push(experiment);
            }
        }
        Ok(experiments)
    }

    /// Apply `f` to the stored experiment and persist the result.
    ///
    /// Nothing is written when `f` fails.
    ///
    /// # Errors
    /// Returns `NotFound`, the error from `f`, or a persistence error.
    pub async fn update<T, F>(&self, id: &str, f: F) -> Result<(Experiment, T)>
    where
        F: FnOnce(&mut Experiment) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut experiment = self.get_experiment(id).await?;
        let out = f(&mut experiment)?;
        self.records.save(&record_key(id), &experiment).await?;
        Ok((experiment, out))
    }

    /// Move an experiment to `next`, enforcing the state machine.
    async fn transition(&self, id: &str, next: ExperimentStatus) -> Result<Experiment> {
        let now = self.clock.now();
        let (experiment, ()) = self
            .update(id, |experiment| {
                let current = experiment.status();
                if !current.can_transition_to(next) {
                    return Err(Error::Validation(format!(
                        "experiment {id} cannot move from {current:?} to {next:?}"
                    )));
                }
                experiment.set_status(next, now);
                Ok(())
            })
            .await?;
        info!(experiment_id = id, status = ?next, "experiment status changed");
        Ok(experiment)
    }

    /// Draft/Paused → Running.
    ///
    /// # Errors
    /// Returns `Validation` for an illegal transition.
    pub async fn start_test(&self, id: &str) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Running).await
    }

    /// Running → Paused.
    ///
    /// # Errors
    /// Returns `Validation` for an illegal transition.
    pub async fn pause_test(&self, id: &str) -> Result<Experiment> {
        self.transition(id, ExperimentStatus::Paused).await
    }

    /// Freeze comparator results and move to Completed.
    ///
    /// # Errors
    /// Returns `Validation` unless the experiment is Running or Paused.
    pub async fn complete_test(&self, id: &str) -> Result<Experiment> {
        let now = self.clock.now();
        let (experiment, ()) = self
            .update(id, |experiment| {
                let current = experiment.status();
                if !current.can_transition_to(ExperimentStatus::Completed) {
                    return Err(Error::Validation(format!(
                        "experiment {id} cannot complete from {current:?}"
                    )));
                }
                let results = ExperimentResults::summarize(experiment, now);
                for comparison in &results.comparisons {
                    if let Some(variant) = experiment.variant_mut(&comparison.variant_id) {
                        variant.set_confidence(comparison.confidence);
                    }
                }
                experiment.freeze_results(results);
                experiment.set_status(ExperimentStatus::Completed, now);
                Ok(())
            })
            .await?;
        info!(
            experiment_id = id,
            winner = ?experiment.results().and_then(|r| r.winner.as_deref()),
            "experiment completed"
        );
        Ok(experiment)
    }

    /// Record the fold count of a cross-validation experiment and start it.
    ///
    /// # Errors
    /// Returns `Validation` for the wrong type, fewer than 2 folds, or an
    /// illegal transition.
    pub async fn start_cross_validation(&self, id: &str, folds: usize) -> Result<Experiment> {
        if folds < 2 {
            return Err(Error::Validation(format!(
                "cross-validation needs at least 2 folds, got {folds}"
            )));
        }
        let now = self.clock.now();
        let (experiment, ()) = self
            .update(id, |experiment| {
                if experiment.kind() != ExperimentType::CrossValidation {
                    return Err(Error::Validation(format!(
                        "experiment {id} is {}, not cross_validation",
                        experiment.kind().as_str()
                    )));
                }
                if !experiment.status().can_transition_to(ExperimentStatus::Running) {
                    return Err(Error::Validation(format!(
                        "experiment {id} cannot start from {:?}",
                        experiment.status()
                    )));
                }
                experiment.set_folds(folds);
                experiment.set_status(ExperimentStatus::Running, now);
                Ok(())
            })
            .await?;
        info!(experiment_id = id, folds, "cross-validation started");
        Ok(experiment)
    }

    /// Remove a Draft or Completed experiment.
    ///
    /// # Errors
    /// Returns `Validation` while the experiment is Running or Paused.
    pub async fn delete_experiment(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let experiment = self.get_experiment(id).await?;
        if matches!(
            experiment.status(),
            ExperimentStatus::Running | ExperimentStatus::Paused
        ) {
            return Err(Error::Validation(format!(
                "experiment {id} is {:?}; complete it before deleting",
                experiment.status()
            )));
        }
        self.records.remove(&record_key(id)).await?;
        self.records.index_remove(INDEX_KEY, id).await?;
        debug!(experiment_id = id, "experiment deleted");
        Ok(())
    }
}
