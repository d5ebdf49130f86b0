//! Engine configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
//!
//! ```rust
//! use trueno_lab::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "federated": { "min_clients": 3 } }"#)?;
//! assert_eq!(config.federated.min_clients, 3);
//! assert_eq!(config.experiments.ab_test.min_days, 7);
//! # Ok::<(), trueno_lab::Error>(())
//! ```

use crate::experiment::{AssignmentPolicy, ExperimentType};
use crate::federated::AggregationKind;
use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Experiment validation limits and allocation policy.
    pub experiments: ExperimentLimits,
    /// Polling loop settings.
    pub scheduler: SchedulerConfig,
    /// Federated round settings.
    pub federated: FederatedConfig,
}

/// Allowed experiment duration, in whole days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationBounds {
    /// Shortest allowed run.
    pub min_days: i64,
    /// Longest allowed run.
    pub max_days: i64,
}

impl DurationBounds {
    /// Bounds of `min..=max` days.
    #[must_use]
    pub const fn days(min_days: i64, max_days: i64) -> Self {
        Self { min_days, max_days }
    }

    /// Whether `duration` lies within the bounds.
    #[must_use]
    pub fn contains(&self, duration: Duration) -> bool {
        duration >= Duration::days(self.min_days) && duration <= Duration::days(self.max_days)
    }
}

/// Limits applied when creating experiments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentLimits {
    /// A/B test duration bounds (default 7–30 days).
    pub ab_test: DurationBounds,
    /// Cross-validation duration bounds (default 1–30 days).
    pub cross_validation: DurationBounds,
    /// Hyperparameter search duration bounds (default 1–60 days).
    pub hyperparameter_search: DurationBounds,
    /// Total samples required before auto-completion is considered.
    pub minimum_sample_size: u64,
    /// How subjects are mapped to variants.
    pub assignment: AssignmentPolicy,
}

impl ExperimentLimits {
    /// Bounds for an experiment type.
    #[must_use]
    pub const fn bounds_for(&self, kind: ExperimentType) -> DurationBounds {
        match kind {
            ExperimentType::AbTest => self.ab_test,
            ExperimentType::CrossValidation => self.cross_validation,
            ExperimentType::HyperparameterSearch => self.hyperparameter_search,
        }
    }
}

impl Default for ExperimentLimits {
    fn default() -> Self {
        Self {
            ab_test: DurationBounds::days(7, 30),
            cross_validation: DurationBounds::days(1, 30),
            hyperparameter_search: DurationBounds::days(1, 60),
            minimum_sample_size: 100,
            assignment: AssignmentPolicy::default(),
        }
    }
}

/// Polling loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Delay between ticks.
    pub poll_interval_ms: u64,
    /// Upper bound on a single task execution.
    pub task_timeout_ms: u64,
}

impl SchedulerConfig {
    /// Poll interval as a std duration (for `tokio::time`).
    #[must_use]
    pub const fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    /// Task timeout as a std duration.
    #[must_use]
    pub const fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.task_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
            task_timeout_ms: 300_000,
        }
    }
}

/// Adam hyper-parameters for server-side `FedAdam`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    /// First-moment decay.
    pub beta1: f64,
    /// Second-moment decay.
    pub beta2: f64,
    /// Numerical stabilizer.
    pub epsilon: f64,
    /// Server learning rate.
    pub learning_rate: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            learning_rate: 0.01,
        }
    }
}

/// Differential-privacy accounting parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrivacyConfig {
    /// Gaussian noise multiplier (sigma).
    pub noise_multiplier: f64,
    /// Delta recorded on every participating client.
    pub delta: f64,
}

impl PrivacyConfig {
    /// Epsilon spent by one round of local training: `1 / (2·sigma²)`.
    #[must_use]
    pub fn epsilon_per_round(&self) -> f64 {
        1.0 / (2.0 * self.noise_multiplier * self.noise_multiplier)
    }
}

/// Federated round settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederatedConfig {
    /// Idle clients required to start a round.
    pub min_clients: usize,
    /// Share of idle clients selected per round.
    pub client_fraction: f64,
    /// Weight aggregation strategy.
    pub strategy: AggregationKind,
    /// `FedProx` proximal term.
    pub proximal_mu: f64,
    /// `FedAdam` hyper-parameters.
    pub adam: AdamConfig,
    /// Privacy accounting; `None` disables it.
    pub privacy: Option<PrivacyConfig>,
    /// Upper bound on one client's local training.
    pub client_timeout_ms: u64,
}

impl FederatedConfig {
    /// Client timeout as a std duration.
    #[must_use]
    pub const fn client_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.client_timeout_ms)
    }
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            min_clients: 2,
            client_fraction: 1.0,
            strategy: AggregationKind::FedAvg,
            proximal_mu: 0.01,
            adam: AdamConfig::default(),
            privacy: None,
            client_timeout_ms: 120_000,
        }
    }
}

impl EngineConfig {
    /// Start from defaults and override selectively.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// Returns `Serialization` for malformed JSON and `Validation` for
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    /// Returns `Other` if the file cannot be read, otherwise as
    /// [`EngineConfig::from_json_str`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Other(format!(
                "Failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_json_str(&text)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns `Validation` describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        for (name, bounds) in [
            ("ab_test", self.experiments.ab_test),
            ("cross_validation", self.experiments.cross_validation),
            ("hyperparameter_search", self.experiments.hyperparameter_search),
        ] {
            if bounds.min_days < 0 || bounds.min_days > bounds.max_days {
                return Err(Error::Validation(format!(
                    "experiments.{name}: min_days {} must be within 0..=max_days {}",
                    bounds.min_days, bounds.max_days
                )));
            }
        }
        if self.scheduler.poll_interval_ms == 0 {
            return Err(Error::Validation(
                "scheduler.poll_interval_ms must be positive".into(),
            ));
        }
        if self.scheduler.task_timeout_ms == 0 {
            return Err(Error::Validation(
                "scheduler.task_timeout_ms must be positive".into(),
            ));
        }
        let fed = &self.federated;
        if fed.min_clients == 0 {
            return Err(Error::Validation(
                "federated.min_clients must be at least 1".into(),
            ));
        }
        if !(fed.client_fraction > 0.0 && fed.client_fraction <= 1.0) {
            return Err(Error::Validation(format!(
                "federated.client_fraction {} must be in (0, 1]",
                fed.client_fraction
            )));
        }
        if fed.proximal_mu < 0.0 {
            return Err(Error::Validation("federated.proximal_mu must be >= 0".into()));
        }
        if let Some(privacy) = fed.privacy {
            if privacy.noise_multiplier <= 0.0 {
                return Err(Error::Validation(
                    "federated.privacy.noise_multiplier must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for `EngineConfig`.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Minimum total samples for auto-completion.
    #[must_use]
    pub const fn minimum_sample_size(mut self, n: u64) -> Self {
        self.config.experiments.minimum_sample_size = n;
        self
    }

    /// Subject-to-variant assignment policy.
    #[must_use]
    pub const fn assignment(mut self, policy: AssignmentPolicy) -> Self {
        self.config.experiments.assignment = policy;
        self
    }

    /// Duration bounds for one experiment type.
    #[must_use]
    pub const fn duration_bounds(mut self, kind: ExperimentType, bounds: DurationBounds) -> Self {
        match kind {
            ExperimentType::AbTest => self.config.experiments.ab_test = bounds,
            ExperimentType::CrossValidation => self.config.experiments.cross_validation = bounds,
            ExperimentType::HyperparameterSearch => {
                self.config.experiments.hyperparameter_search = bounds;
            }
        }
        self
    }

    /// Per-task execution timeout.
    #[must_use]
    pub const fn task_timeout_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.task_timeout_ms = ms;
        self
    }

    /// Polling interval of [`crate::scheduler::TaskScheduler::run`].
    #[must_use]
    pub const fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.scheduler.poll_interval_ms = ms;
        self
    }

    /// Minimum idle clients per round.
    #[must_use]
    pub const fn min_clients(mut self, n: usize) -> Self {
        self.config.federated.min_clients = n;
        self
    }

    /// Fraction of idle clients selected per round.
    #[must_use]
    pub const fn client_fraction(mut self, fraction: f64) -> Self {
        self.config.federated.client_fraction = fraction;
        self
    }

    /// Aggregation strategy.
    #[must_use]
    pub const fn strategy(mut self, strategy: AggregationKind) -> Self {
        self.config.federated.strategy = strategy;
        self
    }

    /// Enable privacy accounting.
    #[must_use]
    pub const fn privacy(mut self, privacy: PrivacyConfig) -> Self {
        self.config.federated.privacy = Some(privacy);
        self
    }

    /// Per-client training timeout.
    #[must_use]
    pub const fn client_timeout_ms(mut self, ms: u64) -> Self {
        self.config.federated.client_timeout_ms = ms;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// Returns `Validation` for out-of-range values.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.experiments.ab_test, DurationBounds::days(7, 30));
        assert!((config.federated.proximal_mu - 0.01).abs() < f64::EPSILON);
        assert!((config.federated.adam.epsilon - 1e-7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = EngineConfig::from_json_str(
            r#"{
                "experiments": { "minimum_sample_size": 400 },
                "federated": { "strategy": "fed_adam", "privacy": { "noise_multiplier": 1.0, "delta": 1e-5 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.experiments.minimum_sample_size, 400);
        assert_eq!(config.federated.strategy, AggregationKind::FedAdam);
        let privacy = config.federated.privacy.unwrap();
        assert!((privacy.epsilon_per_round() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let err = EngineConfig::builder().client_fraction(1.5).build().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let err = EngineConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_duration_bounds_contains() {
        let bounds = DurationBounds::days(7, 30);
        assert!(bounds.contains(Duration::days(7)));
        assert!(bounds.contains(Duration::days(30)));
        assert!(!bounds.contains(Duration::days(6)));
        assert!(!bounds.contains(Duration::days(31)));
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = EngineConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
