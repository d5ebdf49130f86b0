//! Orchestration walkthrough
//!
//! Runs an A/B test with simulated traffic and a federated cross-validation
//! experiment on a simulated clock, ticking the scheduler by hand.
//!
//! Run with: cargo run --example orchestration
//! Verbose:  RUST_LOG=trueno_lab=debug cargo run --example orchestration

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use trueno_lab::clock::ManualClock;
use trueno_lab::config::{EngineConfig, PrivacyConfig};
use trueno_lab::experiment::{
    ExperimentConfig, ExperimentType, FederatedPlan, MetricKind, MetricSpec, ScheduleConfig,
    VariantConfig, VariantEvent,
};
use trueno_lab::federated::{
    AggregationKind, ClientMetrics, FederatedClient, InMemoryModel, LocalUpdate, Tensor,
    TrainingExecutor,
};
use trueno_lab::kv::MemoryKvStore;
use trueno_lab::orchestrator::Orchestrator;
use trueno_lab::scheduler::LogNotifier;
use trueno_lab::telemetry::init_tracing;

/// Pretends to train: nudges weights with noise proportional to the client's
/// data size and reports a noisy loss.
struct SimulatedTraining;

impl TrainingExecutor for SimulatedTraining {
    async fn train(
        &self,
        client: &FederatedClient,
        global: &[Tensor],
    ) -> trueno_lab::Result<LocalUpdate> {
        let (weights, loss, accuracy) = {
            let mut rng = rand::thread_rng();
            #[allow(clippy::cast_precision_loss)]
            let scale = 1.0 / (client.metrics().data_size as f64).sqrt();
            let weights = global
                .iter()
                .map(|t| {
                    Tensor::new(
                        t.values()
                            .iter()
                            .map(|v| v + rng.gen_range(-scale..scale))
                            .collect(),
                    )
                })
                .collect::<Vec<_>>();
            (weights, rng.gen_range(0.2..0.6), rng.gen_range(0.7..0.95))
        };
        Ok(LocalUpdate {
            weights,
            loss,
            accuracy,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let start = Utc::now();
    let clock = ManualClock::shared(start);
    let config = EngineConfig::builder()
        .strategy(AggregationKind::FedAdam)
        .privacy(PrivacyConfig {
            noise_multiplier: 1.1,
            delta: 1e-5,
        })
        .build()?;

    let engine = Orchestrator::open(
        Arc::new(MemoryKvStore::new()),
        clock.clone(),
        Arc::new(SimulatedTraining),
        Arc::new(InMemoryModel::new(vec![Tensor::zeros(8), Tensor::zeros(2)])),
        LogNotifier,
        config,
    )
    .await?;

    // --- A/B test ---------------------------------------------------------
    let ab = engine
        .create_experiment(
            ExperimentConfig::builder(
                "Checkout button colour",
                ExperimentType::AbTest,
                ScheduleConfig::daily(start, start + Duration::days(7)),
            )
            .variant(VariantConfig::control("blue", 0.5))
            .variant(VariantConfig::treatment("green", 0.5))
            .metric(MetricSpec::primary(MetricKind::ConversionRate))
            .build(),
        )
        .await?;
    engine.start_ab_test(ab.id()).await?;
    engine.schedule_experiment(ab.id()).await?;

    let mut rng = rand::thread_rng();
    for user in 0..1_000 {
        let subject = format!("user-{user}");
        let Some(variant) = engine.assign_variant(ab.id(), &subject).await? else {
            continue;
        };
        let rate = if variant == "green" { 0.58 } else { 0.45 };
        let converted = rng.gen_bool(rate);
        engine
            .record_event(
                ab.id(),
                &variant,
                VariantEvent::outcome(converted).with_converted(converted),
            )
            .await?;
    }

    // --- federated cross-validation ----------------------------------------
    for (id, data, compute) in [
        ("phone-a", 1_200, 1.0),
        ("phone-b", 800, 2.5),
        ("tablet", 3_000, 1.5),
    ] {
        engine
            .register_client(id, ClientMetrics::with_capacity(data, compute))
            .await?;
    }
    let cv = engine
        .create_experiment(
            ExperimentConfig::builder(
                "Next-word model",
                ExperimentType::CrossValidation,
                ScheduleConfig::daily(start, start + Duration::days(3))
                    .with_checkpoints(vec![36 * 3_600_000]),
            )
            .variant(VariantConfig::control("model", 1.0))
            .metric(MetricSpec::primary(MetricKind::SuccessRate))
            .federated(FederatedPlan {
                rounds_per_evaluation: 2,
            })
            .build(),
        )
        .await?;
    engine.start_cross_validation(cv.id(), 5).await?;
    engine.schedule_experiment(cv.id()).await?;

    // --- drive the clock ----------------------------------------------------
    for day in 1..=7 {
        clock.set(start + Duration::days(day));
        for _ in 0..4 {
            engine.tick().await?;
            engine.wait_idle().await;
        }
        println!("day {day}");
        for id in [ab.id(), cv.id()] {
            let status = engine.get_schedule_status(id).await?;
            println!(
                "  {id}: pending={} completed={} failed={}",
                status.pending, status.completed, status.failed
            );
        }
    }

    let analysis = engine
        .analyze_results(ab.id())
        .await
        .context("analysing A/B test")?;
    println!("\nA/B recommendation: {:?}", analysis.recommendation);
    for comparison in &analysis.results.comparisons {
        println!(
            "  {} vs {}: lift {:+.3}, confidence {:.2}",
            comparison.variant_id, comparison.control_id, comparison.lift, comparison.confidence
        );
    }

    println!("\nFederated rounds:");
    for round in engine.get_round_history().await {
        println!(
            "  #{} {:?}: {} participants, loss {:.3}, accuracy {:.3}",
            round.round_number(),
            round.phase(),
            round.participants().len(),
            round.metrics().mean_loss,
            round.metrics().mean_accuracy
        );
    }
    for client in engine.coordinator().list_clients() {
        println!(
            "  {} spent epsilon {:.3}",
            client.id(),
            engine.privacy_budget(client.id())?.epsilon
        );
    }

    Ok(())
}
