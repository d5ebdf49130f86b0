//! Statistical Comparator
//!
//! Two-proportion z-test over `success_rate`. Confidence is `min(1, z/3)`:
//! a bounded, monotonic stand-in for significance, **not** a calibrated
//! p-value. z = 3 maps to full confidence and 0.95 corresponds to z ≈ 2.85.

use super::experiment_record::Experiment;
use super::variant::Variant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Confidence a treatment needs before it counts as a winner.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.95;

/// Outcome of one control-vs-treatment comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Control arm id.
    pub control_id: String,
    /// Treatment arm id.
    pub variant_id: String,
    /// Control success rate.
    pub control_rate: f64,
    /// Treatment success rate.
    pub variant_rate: f64,
    /// `variant_rate - control_rate`.
    pub lift: f64,
    /// `|p1 - p2| / se`, 0 for degenerate input.
    pub z_score: f64,
    /// `min(1, z/3)`.
    pub confidence: f64,
}

impl Comparison {
    /// Whether confidence reaches `threshold`.
    #[must_use]
    pub fn is_significant(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }

    /// Significant and better than the control.
    #[must_use]
    pub fn is_winner(&self, threshold: f64) -> bool {
        self.is_significant(threshold) && self.lift > 0.0
    }
}

/// z-score for two observed proportions and their sample sizes.
///
/// Returns 0 when either arm is empty or the pooled variance vanishes.
#[must_use]
pub fn z_score(p1: f64, n1: u64, p2: f64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let (n1, n2) = (n1 as f64, n2 as f64);
    let pooled = p1.mul_add(n1, p2 * n2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if !se.is_finite() || se <= 0.0 {
        return 0.0;
    }
    (p1 - p2).abs() / se
}

/// Map a z-score onto `[0, 1]`.
#[must_use]
pub fn confidence_from_z(z: f64) -> f64 {
    (z / 3.0).clamp(0.0, 1.0)
}

/// Compare a treatment against the control.
#[must_use]
pub fn compare(control: &Variant, variant: &Variant) -> Comparison {
    let p1 = control.metrics().success_rate;
    let p2 = variant.metrics().success_rate;
    let z = z_score(p1, control.sample_size(), p2, variant.sample_size());
    Comparison {
        control_id: control.id().to_string(),
        variant_id: variant.id().to_string(),
        control_rate: p1,
        variant_rate: p2,
        lift: p2 - p1,
        z_score: z,
        confidence: confidence_from_z(z),
    }
}

/// Compare every treatment against the control. Empty without a control.
#[must_use]
pub fn compare_all(experiment: &Experiment) -> Vec<Comparison> {
    let Some(control) = experiment.control() else {
        return Vec::new();
    };
    experiment
        .treatments()
        .map(|variant| compare(control, variant))
        .collect()
}

/// Confidence threshold in effect for an experiment.
#[must_use]
pub fn confidence_threshold(experiment: &Experiment) -> f64 {
    experiment
        .constraints()
        .confidence_threshold
        .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD)
}

/// True when enough samples exist, the window has closed, and at least one
/// treatment reaches the confidence threshold.
#[must_use]
pub fn should_auto_complete(
    experiment: &Experiment,
    now: DateTime<Utc>,
    minimum_sample_size: u64,
) -> bool {
    let minimum = experiment
        .constraints()
        .minimum_sample_size
        .unwrap_or(minimum_sample_size);
    if experiment.total_samples() < minimum || now < experiment.schedule().end_date {
        return false;
    }
    let threshold = confidence_threshold(experiment);
    compare_all(experiment)
        .iter()
        .any(|c| c.is_significant(threshold))
}
