//! Controlled experiments: definitions, assignment, and comparison
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment (1) ──< Variant (N)      role: control | treatment
//!      │
//!      ├── ScheduleConfig             expanded into tasks by the scheduler
//!      └── ExperimentResults          frozen on completion
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use trueno_lab::experiment::{
//!     validate_config, ExperimentConfig, ExperimentType, MetricKind, MetricSpec,
//!     ScheduleConfig, VariantConfig,
//! };
//! use trueno_lab::config::ExperimentLimits;
//!
//! let start = Utc::now();
//! let config = ExperimentConfig::builder(
//!     "Checkout button",
//!     ExperimentType::AbTest,
//!     ScheduleConfig::daily(start, start + Duration::days(14)),
//! )
//! .variant(VariantConfig::control("blue", 0.5))
//! .variant(VariantConfig::treatment("green", 0.5))
//! .metric(MetricSpec::primary(MetricKind::ConversionRate))
//! .build();
//!
//! validate_config(&config, &ExperimentLimits::default())?;
//! # Ok::<(), trueno_lab::Error>(())
//! ```

mod allocator;
mod experiment_record;
mod registry;
mod results;
mod schedule;
pub mod stats;
mod validation;
mod variant;

pub use allocator::{select_variant, stable_hash, AssignmentPolicy, VariantAllocator};
pub use experiment_record::{
    Constraints, Experiment, ExperimentConfig, ExperimentConfigBuilder, ExperimentStatus,
    ExperimentType, FederatedPlan, MetricKind, MetricSpec,
};
pub use registry::ExperimentRegistry;
pub use results::{ExperimentAnalysis, ExperimentResults, Recommendation};
pub use schedule::{NotificationFlags, RetryStrategy, ScheduleConfig};
pub use stats::Comparison;
pub use validation::{
    validate_config, validate_schedule, ALLOCATION_TOLERANCE, MAX_BACKOFF_MULTIPLIER, MAX_RETRIES,
};
pub use variant::{Variant, VariantConfig, VariantEvent, VariantMetrics, VariantRole};
