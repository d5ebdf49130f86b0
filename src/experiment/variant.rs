//! Variant - one arm of an experiment

use serde::{Deserialize, Serialize};

/// Whether a variant is the baseline or a challenger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantRole {
    /// Baseline every treatment is compared against.
    Control,
    /// Challenger arm.
    Treatment,
}

/// Running metrics of a variant.
///
/// All rates are means over the variant's events; `confidence` is written by
/// the comparator, never by events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantMetrics {
    /// Share of successful events.
    pub success_rate: f64,
    /// Mean response time in milliseconds.
    pub response_time: f64,
    /// Share of engaged events.
    pub engagement_rate: f64,
    /// Share of converting events.
    pub conversion_rate: f64,
    /// Latest confidence against the control (0 for the control itself).
    pub confidence: f64,
}

/// One observation for a variant. Absent fields leave their metric untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VariantEvent {
    /// Outcome counted toward `success_rate`.
    pub success: Option<bool>,
    /// Observed latency in milliseconds.
    pub response_time_ms: Option<f64>,
    /// Counted toward `engagement_rate`.
    pub engaged: Option<bool>,
    /// Counted toward `conversion_rate`.
    pub converted: Option<bool>,
}

impl VariantEvent {
    /// Event carrying only a success/failure outcome.
    #[must_use]
    pub const fn outcome(success: bool) -> Self {
        Self {
            success: Some(success),
            response_time_ms: None,
            engaged: None,
            converted: None,
        }
    }

    /// Attach a response time.
    #[must_use]
    pub const fn with_response_time(mut self, ms: f64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    /// Attach an engagement flag.
    #[must_use]
    pub const fn with_engaged(mut self, engaged: bool) -> Self {
        self.engaged = Some(engaged);
        self
    }

    /// Attach a conversion flag.
    #[must_use]
    pub const fn with_converted(mut self, converted: bool) -> Self {
        self.converted = Some(converted);
        self
    }

    const fn is_empty(&self) -> bool {
        self.success.is_none()
            && self.response_time_ms.is_none()
            && self.engaged.is_none()
            && self.converted.is_none()
    }
}

/// Variant definition supplied when creating an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantConfig {
    /// Identifier, unique within the experiment.
    pub id: String,
    /// Control or treatment.
    pub role: VariantRole,
    /// Share of traffic, all variants summing to 1.
    pub allocation: f64,
    /// Opaque configuration handed to whatever runs the arm.
    #[serde(default)]
    pub configuration: serde_json::Value,
}

impl VariantConfig {
    /// Control arm with an empty configuration.
    #[must_use]
    pub fn control(id: impl Into<String>, allocation: f64) -> Self {
        Self {
            id: id.into(),
            role: VariantRole::Control,
            allocation,
            configuration: serde_json::Value::Null,
        }
    }

    /// Treatment arm with an empty configuration.
    #[must_use]
    pub fn treatment(id: impl Into<String>, allocation: f64) -> Self {
        Self {
            id: id.into(),
            role: VariantRole::Treatment,
            allocation,
            configuration: serde_json::Value::Null,
        }
    }

    /// Attach a configuration blob.
    #[must_use]
    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }
}

/// Variant as stored on an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    id: String,
    role: VariantRole,
    allocation: f64,
    configuration: serde_json::Value,
    metrics: VariantMetrics,
    sample_size: u64,
}

impl From<VariantConfig> for Variant {
    fn from(config: VariantConfig) -> Self {
        Self {
            id: config.id,
            role: config.role,
            allocation: config.allocation,
            configuration: config.configuration,
            metrics: VariantMetrics::default(),
            sample_size: 0,
        }
    }
}

impl Variant {
    /// Variant id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Control or treatment.
    #[must_use]
    pub const fn role(&self) -> VariantRole {
        self.role
    }

    /// Whether this is the control arm.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.role == VariantRole::Control
    }

    /// Traffic share.
    #[must_use]
    pub const fn allocation(&self) -> f64 {
        self.allocation
    }

    /// Configuration blob.
    #[must_use]
    pub const fn configuration(&self) -> &serde_json::Value {
        &self.configuration
    }

    /// Running metrics.
    #[must_use]
    pub const fn metrics(&self) -> &VariantMetrics {
        &self.metrics
    }

    /// Number of recorded events.
    #[must_use]
    pub const fn sample_size(&self) -> u64 {
        self.sample_size
    }

    /// Fold one event into the running means and count it once.
    ///
    /// Returns `false` (and changes nothing) for an event with no fields.
    pub fn record(&mut self, event: &VariantEvent) -> bool {
        if event.is_empty() {
            return false;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = self.sample_size as f64;
        let fold = |old: f64, value: f64| old.mul_add(n, value) / (n + 1.0);
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        let m = &mut self.metrics;
        if let Some(success) = event.success {
            m.success_rate = fold(m.success_rate, flag(success));
        }
        if let Some(ms) = event.response_time_ms {
            m.response_time = fold(m.response_time, ms);
        }
        if let Some(engaged) = event.engaged {
            m.engagement_rate = fold(m.engagement_rate, flag(engaged));
        }
        if let Some(converted) = event.converted {
            m.conversion_rate = fold(m.conversion_rate, flag(converted));
        }
        self.sample_size += 1;
        true
    }

    /// Overwrite the confidence written by the comparator.
    pub fn set_confidence(&mut self, confidence: f64) {
        self.metrics.confidence = confidence;
    }

    /// Seed metrics directly (imports, fixtures).
    #[must_use]
    pub const fn with_metrics(mut self, metrics: VariantMetrics, sample_size: u64) -> Self {
        self.metrics = metrics;
        self.sample_size = sample_size;
        self
    }
}
