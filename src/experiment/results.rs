//! Results and analysis derived from variant metrics

use super::experiment_record::Experiment;
use super::stats::{self, Comparison};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of an experiment's comparisons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    /// Experiment id.
    pub experiment_id: String,
    /// One entry per treatment.
    pub comparisons: Vec<Comparison>,
    /// Best significant treatment with positive lift, if any.
    pub winner: Option<String>,
    /// Samples across all arms.
    pub total_samples: u64,
    /// When the snapshot was taken.
    pub computed_at: DateTime<Utc>,
}

impl ExperimentResults {
    /// Compute a snapshot from current variant metrics.
    #[must_use]
    pub fn summarize(experiment: &Experiment, now: DateTime<Utc>) -> Self {
        let comparisons = stats::compare_all(experiment);
        let threshold = stats::confidence_threshold(experiment);
        let winner = comparisons
            .iter()
            .filter(|c| c.is_winner(threshold))
            .max_by(|a, b| a.lift.total_cmp(&b.lift))
            .map(|c| c.variant_id.clone());
        Self {
            experiment_id: experiment.id().to_string(),
            comparisons,
            winner,
            total_samples: experiment.total_samples(),
            computed_at: now,
        }
    }
}

/// What to do with an experiment given its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "variant_id")]
pub enum Recommendation {
    /// Roll out the named treatment.
    AdoptVariant(String),
    /// A treatment is significantly worse, or every treatment is done and none won.
    KeepControl,
    /// Not enough evidence yet.
    ContinueTesting,
}

/// Results plus a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAnalysis {
    /// Underlying snapshot.
    pub results: ExperimentResults,
    /// Suggested action.
    pub recommendation: Recommendation,
    /// Whether the experiment is eligible for auto-completion now.
    pub ready_to_complete: bool,
}

impl ExperimentAnalysis {
    /// Derive a recommendation from a snapshot.
    #[must_use]
    pub fn from_results(
        experiment: &Experiment,
        results: ExperimentResults,
        now: DateTime<Utc>,
        minimum_sample_size: u64,
    ) -> Self {
        let threshold = stats::confidence_threshold(experiment);
        let ready_to_complete = stats::should_auto_complete(experiment, now, minimum_sample_size);
        let window_closed = now >= experiment.schedule().end_date;
        let recommendation = match &results.winner {
            Some(id) => Recommendation::AdoptVariant(id.clone()),
            None if results.comparisons.iter().any(|c| c.is_significant(threshold)) => {
                Recommendation::KeepControl
            }
            None if window_closed && experiment.results().is_some() => Recommendation::KeepControl,
            None => Recommendation::ContinueTesting,
        };
        Self {
            results,
            recommendation,
            ready_to_complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{
        ExperimentConfig, ExperimentType, MetricKind, MetricSpec, ScheduleConfig, VariantConfig,
        VariantEvent,
    };
    use chrono::{Duration, TimeZone};

    fn experiment(control_successes: u32, treatment_successes: u32, n: u32) -> Experiment {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let config = ExperimentConfig::builder(
            "Onboarding",
            ExperimentType::AbTest,
            ScheduleConfig::daily(start, start + Duration::days(7)),
        )
        .variant(VariantConfig::control("a", 0.5))
        .variant(VariantConfig::treatment("b", 0.5))
        .metric(MetricSpec::primary(MetricKind::SuccessRate))
        .build();
        let mut experiment = Experiment::from_config("exp-1-1", config, start);
        for i in 0..n {
            let a = experiment.variant_mut("a").unwrap();
            a.record(&VariantEvent::outcome(i < control_successes));
            let b = experiment.variant_mut("b").unwrap();
            b.record(&VariantEvent::outcome(i < treatment_successes));
        }
        experiment
    }

    #[test]
    fn test_clear_winner_is_adopted() {
        let exp = experiment(80, 110, 200);
        let now = exp.schedule().end_date;
        let results = ExperimentResults::summarize(&exp, now);

        assert_eq!(results.winner.as_deref(), Some("b"));
        assert_eq!(results.total_samples, 400);

        let analysis = ExperimentAnalysis::from_results(&exp, results, now, 100);
        assert_eq!(analysis.recommendation, Recommendation::AdoptVariant("b".into()));
        assert!(analysis.ready_to_complete);
    }

    #[test]
    fn test_significantly_worse_treatment_keeps_control() {
        let exp = experiment(110, 80, 200);
        let now = exp.schedule().start_date;
        let results = ExperimentResults::summarize(&exp, now);

        assert!(results.winner.is_none());
        let analysis = ExperimentAnalysis::from_results(&exp, results, now, 100);
        assert_eq!(analysis.recommendation, Recommendation::KeepControl);
        assert!(!analysis.ready_to_complete);
    }

    #[test]
    fn test_thin_evidence_continues() {
        let exp = experiment(5, 6, 10);
        let now = exp.schedule().start_date;
        let analysis =
            ExperimentAnalysis::from_results(&exp, ExperimentResults::summarize(&exp, now), now, 100);
        assert_eq!(analysis.recommendation, Recommendation::ContinueTesting);
    }
}
