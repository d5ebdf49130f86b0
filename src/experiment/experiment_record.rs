//! Experiment - root entity owning variants and schedule

use super::results::ExperimentResults;
use super::schedule::ScheduleConfig;
use super::variant::{Variant, VariantConfig, VariantRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of controlled experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    /// Traffic split between a control and one or more treatments.
    AbTest,
    /// Candidate models evaluated over k folds.
    CrossValidation,
    /// Configurations competing on the same metric.
    HyperparameterSearch,
}

impl ExperimentType {
    /// Whether the type compares arms and so needs a control plus a treatment.
    #[must_use]
    pub const fn is_comparative(self) -> bool {
        matches!(self, Self::AbTest | Self::HyperparameterSearch)
    }

    /// Lower-case name used in logs and messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AbTest => "ab_test",
            Self::CrossValidation => "cross_validation",
            Self::HyperparameterSearch => "hyperparameter_search",
        }
    }
}

/// Lifecycle of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Created, not yet started.
    Draft,
    /// Accepting assignments and events.
    Running,
    /// Temporarily stopped; may resume.
    Paused,
    /// Results frozen.
    Completed,
}

impl ExperimentStatus {
    /// Allowed transitions: Draft→Running, Running⇄Paused, Running|Paused→Completed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft | Self::Paused, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Running | Self::Paused, Self::Completed)
        )
    }
}

/// Metric tracked by an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// `success_rate`
    SuccessRate,
    /// `response_time`
    ResponseTime,
    /// `engagement_rate`
    EngagementRate,
    /// `conversion_rate`
    ConversionRate,
}

/// A metric and whether decisions hinge on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Which metric.
    pub kind: MetricKind,
    /// Primary metrics drive the decision; secondary are reported only.
    pub primary: bool,
}

impl MetricSpec {
    /// A primary metric.
    #[must_use]
    pub const fn primary(kind: MetricKind) -> Self {
        Self {
            kind,
            primary: true,
        }
    }

    /// A secondary metric.
    #[must_use]
    pub const fn secondary(kind: MetricKind) -> Self {
        Self {
            kind,
            primary: false,
        }
    }
}

/// Per-experiment overrides of engine-wide limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    /// Overrides `experiments.minimum_sample_size`.
    pub minimum_sample_size: Option<u64>,
    /// Confidence a treatment needs to win (default 0.95).
    pub confidence_threshold: Option<f64>,
}

/// Attach federated training to an experiment's evaluation tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedPlan {
    /// Rounds run by each evaluation task.
    pub rounds_per_evaluation: usize,
}

/// Everything needed to create an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Human-readable name.
    pub name: String,
    /// Experiment kind.
    pub kind: ExperimentType,
    /// Arms.
    pub variants: Vec<VariantConfig>,
    /// Timeline.
    pub schedule: ScheduleConfig,
    /// Tracked metrics.
    pub metrics: Vec<MetricSpec>,
    /// Overrides.
    #[serde(default)]
    pub constraints: Constraints,
    /// Federated training run by evaluation tasks.
    #[serde(default)]
    pub federated: Option<FederatedPlan>,
}

impl ExperimentConfig {
    /// Builder with required fields.
    #[must_use]
    pub fn builder(
        name: impl Into<String>,
        kind: ExperimentType,
        schedule: ScheduleConfig,
    ) -> ExperimentConfigBuilder {
        ExperimentConfigBuilder {
            config: Self {
                name: name.into(),
                kind,
                variants: Vec::new(),
                schedule,
                metrics: Vec::new(),
                constraints: Constraints::default(),
                federated: None,
            },
        }
    }
}

/// Builder for `ExperimentConfig`.
#[derive(Debug)]
pub struct ExperimentConfigBuilder {
    config: ExperimentConfig,
}

impl ExperimentConfigBuilder {
    /// Add an arm.
    #[must_use]
    pub fn variant(mut self, variant: VariantConfig) -> Self {
        self.config.variants.push(variant);
        self
    }

    /// Add a metric.
    #[must_use]
    pub fn metric(mut self, metric: MetricSpec) -> Self {
        self.config.metrics.push(metric);
        self
    }

    /// Set overrides.
    #[must_use]
    pub const fn constraints(mut self, constraints: Constraints) -> Self {
        self.config.constraints = constraints;
        self
    }

    /// Run federated rounds from evaluation tasks.
    #[must_use]
    pub const fn federated(mut self, plan: FederatedPlan) -> Self {
        self.config.federated = Some(plan);
        self
    }

    /// Finish. Validation happens in the registry.
    #[must_use]
    pub fn build(self) -> ExperimentConfig {
        self.config
    }
}

/// A persisted experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    id: String,
    name: String,
    kind: ExperimentType,
    status: ExperimentStatus,
    variants: Vec<Variant>,
    schedule: ScheduleConfig,
    metrics: Vec<MetricSpec>,
    constraints: Constraints,
    federated: Option<FederatedPlan>,
    folds: Option<usize>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    results: Option<ExperimentResults>,
}

impl Experiment {
    /// Materialize a validated config as a Draft experiment.
    #[must_use]
    pub fn from_config(id: impl Into<String>, config: ExperimentConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: config.name,
            kind: config.kind,
            status: ExperimentStatus::Draft,
            variants: config.variants.into_iter().map(Variant::from).collect(),
            schedule: config.schedule,
            metrics: config.metrics,
            constraints: config.constraints,
            federated: config.federated,
            folds: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            results: None,
        }
    }

    /// Experiment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Experiment kind.
    #[must_use]
    pub const fn kind(&self) -> ExperimentType {
        self.kind
    }

    /// Lifecycle status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Whether assignments and events are accepted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    /// All arms, in definition order.
    #[must_use]
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    /// Arm by id.
    #[must_use]
    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id() == variant_id)
    }

    /// Mutable arm by id.
    pub fn variant_mut(&mut self, variant_id: &str) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id() == variant_id)
    }

    /// The control arm, if one is tagged.
    #[must_use]
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.role() == VariantRole::Control)
    }

    /// Treatment arms.
    pub fn treatments(&self) -> impl Iterator<Item = &Variant> {
        self.variants
            .iter()
            .filter(|v| v.role() == VariantRole::Treatment)
    }

    /// Sum of sample sizes over all arms.
    #[must_use]
    pub fn total_samples(&self) -> u64 {
        self.variants.iter().map(Variant::sample_size).sum()
    }

    /// Timeline.
    #[must_use]
    pub const fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    /// Tracked metrics.
    #[must_use]
    pub fn metrics(&self) -> &[MetricSpec] {
        &self.metrics
    }

    /// Overrides.
    #[must_use]
    pub const fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    /// Federated plan, if evaluation tasks train.
    #[must_use]
    pub const fn federated(&self) -> Option<FederatedPlan> {
        self.federated
    }

    /// Fold count once cross-validation started.
    #[must_use]
    pub const fn folds(&self) -> Option<usize> {
        self.folds
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// First start timestamp.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Completion timestamp.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Frozen results, present once completed.
    #[must_use]
    pub const fn results(&self) -> Option<&ExperimentResults> {
        self.results.as_ref()
    }

    pub(crate) fn set_status(&mut self, status: ExperimentStatus, now: DateTime<Utc>) {
        match status {
            ExperimentStatus::Running if self.started_at.is_none() => self.started_at = Some(now),
            ExperimentStatus::Completed => self.completed_at = Some(now),
            _ => {}
        }
        self.status = status;
    }

    pub(crate) fn set_folds(&mut self, folds: usize) {
        self.folds = Some(folds);
    }

    pub(crate) fn freeze_results(&mut self, results: ExperimentResults) {
        self.results = Some(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn config() -> ExperimentConfig {
        let start = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
        ExperimentConfig::builder(
            "Checkout copy",
            ExperimentType::AbTest,
            ScheduleConfig::daily(start, start + Duration::days(14)),
        )
        .variant(VariantConfig::control("control", 0.5))
        .variant(VariantConfig::treatment("new-copy", 0.5))
        .metric(MetricSpec::primary(MetricKind::ConversionRate))
        .build()
    }

    #[test]
    fn test_from_config_starts_in_draft() {
        let now = Utc::now();
        let experiment = Experiment::from_config("exp-1-1", config(), now);

        assert_eq!(experiment.status(), ExperimentStatus::Draft);
        assert_eq!(experiment.control().unwrap().id(), "control");
        assert_eq!(experiment.treatments().count(), 1);
        assert_eq!(experiment.total_samples(), 0);
        assert_eq!(experiment.created_at(), now);
    }

    #[test]
    fn test_status_transitions() {
        use ExperimentStatus::{Completed, Draft, Paused, Running};

        assert!(Draft.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Completed));

        assert!(!Draft.can_transition_to(Paused));
        assert!(!Draft.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_started_at_kept_on_resume() {
        let t0 = Utc::now();
        let mut experiment = Experiment::from_config("exp-1-1", config(), t0);

        experiment.set_status(ExperimentStatus::Running, t0);
        experiment.set_status(ExperimentStatus::Paused, t0 + Duration::hours(1));
        experiment.set_status(ExperimentStatus::Running, t0 + Duration::hours(2));

        assert_eq!(experiment.started_at(), Some(t0));
    }
}
