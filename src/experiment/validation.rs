//! Pure validation of experiment definitions (no I/O)

use super::experiment_record::{ExperimentConfig, ExperimentType};
use super::schedule::{RetryStrategy, ScheduleConfig};
use super::variant::VariantRole;
use crate::config::ExperimentLimits;
use crate::{Error, Result};
use std::collections::HashSet;

/// Allowed deviation of the allocation sum from 1.
pub const ALLOCATION_TOLERANCE: f64 = 0.001;

/// Upper bound on `RetryStrategy::max_retries`.
pub const MAX_RETRIES: u32 = 32;

/// Upper bound on `RetryStrategy::backoff_multiplier`.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;

/// Validate a creation request against engine limits.
///
/// # Errors
/// Returns `Validation` naming the first violated rule.
pub fn validate_config(config: &ExperimentConfig, limits: &ExperimentLimits) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(Error::Validation("experiment name must not be empty".into()));
    }
    validate_variants(config)?;
    validate_schedule(&config.schedule, config.kind, limits)?;
    if !config.metrics.iter().any(|m| m.primary) {
        return Err(Error::Validation(
            "at least one primary metric is required".into(),
        ));
    }
    if let Some(threshold) = config.constraints.confidence_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::Validation(format!(
                "confidence threshold {threshold} must be within [0, 1]"
            )));
        }
    }
    if let Some(plan) = config.federated {
        if plan.rounds_per_evaluation == 0 {
            return Err(Error::Validation(
                "federated plan must run at least one round per evaluation".into(),
            ));
        }
    }
    Ok(())
}

fn validate_variants(config: &ExperimentConfig) -> Result<()> {
    let variants = &config.variants;
    if variants.is_empty() {
        return Err(Error::Validation("at least one variant is required".into()));
    }
    if config.kind.is_comparative() && variants.len() < 2 {
        return Err(Error::Validation(format!(
            "{} requires at least 2 variants, got {}",
            config.kind.as_str(),
            variants.len()
        )));
    }

    let mut seen = HashSet::new();
    for variant in variants {
        if variant.id.trim().is_empty() {
            return Err(Error::Validation("variant id must not be empty".into()));
        }
        if !seen.insert(variant.id.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate variant id '{}'",
                variant.id
            )));
        }
        if !(0.0..=1.0).contains(&variant.allocation) {
            return Err(Error::Validation(format!(
                "variant '{}' allocation {} must be within [0, 1]",
                variant.id, variant.allocation
            )));
        }
    }

    let sum: f64 = variants.iter().map(|v| v.allocation).sum();
    if (sum - 1.0).abs() > ALLOCATION_TOLERANCE {
        return Err(Error::Validation(format!(
            "variant allocations must sum to 1 (±{ALLOCATION_TOLERANCE}), got {sum:.4}"
        )));
    }

    let controls = variants
        .iter()
        .filter(|v| v.role == VariantRole::Control)
        .count();
    if config.kind.is_comparative() && controls != 1 {
        return Err(Error::Validation(format!(
            "{} requires exactly one control variant, got {controls}",
            config.kind.as_str()
        )));
    }
    if controls > 1 {
        return Err(Error::Validation(format!(
            "at most one control variant is allowed, got {controls}"
        )));
    }
    Ok(())
}

/// Validate a schedule window and its task parameters.
///
/// # Errors
/// Returns `Validation` naming the first violated rule.
pub fn validate_schedule(
    schedule: &ScheduleConfig,
    kind: ExperimentType,
    limits: &ExperimentLimits,
) -> Result<()> {
    if schedule.end_date <= schedule.start_date {
        return Err(Error::Validation(format!(
            "end date {} must be after start date {}",
            schedule.end_date, schedule.start_date
        )));
    }
    let bounds = limits.bounds_for(kind);
    if !bounds.contains(schedule.duration()) {
        return Err(Error::Validation(format!(
            "{} duration of {} days must be between {} and {} days",
            kind.as_str(),
            schedule.duration().num_days(),
            bounds.min_days,
            bounds.max_days
        )));
    }
    let window_ms = schedule.duration_ms();
    if schedule.evaluation_interval_ms == 0 {
        return Err(Error::Validation(
            "evaluation interval must be positive".into(),
        ));
    }
    if schedule.evaluation_interval_ms > window_ms {
        return Err(Error::Validation(format!(
            "evaluation interval of {} ms exceeds the {window_ms} ms window",
            schedule.evaluation_interval_ms
        )));
    }
    if schedule.max_concurrent == 0 {
        return Err(Error::Validation("max concurrent tasks must be at least 1".into()));
    }
    validate_retry(&schedule.retry, window_ms)?;
    if let Some(late) = schedule
        .checkpoint_offsets_ms
        .iter()
        .find(|&&offset| offset > window_ms)
    {
        return Err(Error::Validation(format!(
            "checkpoint offset of {late} ms falls after the end date"
        )));
    }
    Ok(())
}

fn validate_retry(retry: &RetryStrategy, window_ms: u64) -> Result<()> {
    if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&retry.backoff_multiplier) {
        return Err(Error::Validation(format!(
            "backoff multiplier {} must be within [1, {MAX_BACKOFF_MULTIPLIER}]",
            retry.backoff_multiplier
        )));
    }
    if retry.max_retries > MAX_RETRIES {
        return Err(Error::Validation(format!(
            "max retries {} must be at most {MAX_RETRIES}",
            retry.max_retries
        )));
    }
    if retry.initial_delay_ms > window_ms {
        return Err(Error::Validation(format!(
            "initial retry delay of {} ms exceeds the {window_ms} ms window",
            retry.initial_delay_ms
        )));
    }
    Ok(())
}
