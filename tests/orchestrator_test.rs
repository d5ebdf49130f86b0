//! End-to-end tests through the `Orchestrator` facade
//!
//! Time is driven by a `ManualClock`; the scheduler is advanced with explicit
//! `tick()` + `wait_idle()` calls instead of the polling loop.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use trueno_lab::clock::ManualClock;
use trueno_lab::config::EngineConfig;
use trueno_lab::experiment::{
    ExperimentConfig, ExperimentStatus, ExperimentType, FederatedPlan, MetricKind, MetricSpec,
    Recommendation, ScheduleConfig, VariantConfig, VariantEvent,
};
use trueno_lab::federated::{
    ClientMetrics, FederatedClient, InMemoryModel, LocalUpdate, RoundPhase, Tensor,
    TrainingExecutor,
};
use trueno_lab::kv::MemoryKvStore;
use trueno_lab::orchestrator::{Checkpoint, Orchestrator};
use trueno_lab::scheduler::{Notification, NotificationSink};
use trueno_lab::Error;

// =============================================================================
// Fixtures
// =============================================================================

/// Moves every weight halfway toward the client's data size / 100.
struct HalfwayExecutor;

impl TrainingExecutor for HalfwayExecutor {
    async fn train(
        &self,
        client: &FederatedClient,
        global: &[Tensor],
    ) -> trueno_lab::Result<LocalUpdate> {
        #[allow(clippy::cast_precision_loss)]
        let target = client.metrics().data_size as f64 / 100.0;
        let weights = global
            .iter()
            .map(|t| Tensor::new(t.values().iter().map(|v| (v + target) / 2.0).collect()))
            .collect();
        Ok(LocalUpdate {
            weights,
            loss: 0.5,
            accuracy: 0.75,
        })
    }
}

#[derive(Clone, Default)]
struct Inbox {
    events: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationSink for Inbox {
    async fn notify(&self, event: Notification) -> trueno_lab::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

type Engine = Orchestrator<MemoryKvStore, HalfwayExecutor, InMemoryModel, Inbox>;

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()
}

async fn engine_on(store: Arc<MemoryKvStore>, clock: Arc<ManualClock>) -> (Engine, Inbox) {
    let inbox = Inbox::default();
    let engine = Orchestrator::open(
        store,
        clock,
        Arc::new(HalfwayExecutor),
        Arc::new(InMemoryModel::new(vec![Tensor::zeros(2)])),
        inbox.clone(),
        EngineConfig::default(),
    )
    .await
    .unwrap();
    (engine, inbox)
}

fn ab_config(control: f64, treatment: f64) -> ExperimentConfig {
    ExperimentConfig::builder(
        "Checkout copy",
        ExperimentType::AbTest,
        ScheduleConfig::daily(start(), start() + Duration::days(7)),
    )
    .variant(VariantConfig::control("current", control))
    .variant(VariantConfig::treatment("shorter", treatment))
    .metric(MetricSpec::primary(MetricKind::SuccessRate))
    .metric(MetricSpec::secondary(MetricKind::ResponseTime))
    .build()
}

async fn drain(engine: &Engine, experiment_id: &str) {
    for _ in 0..32 {
        engine.tick().await.unwrap();
        engine.wait_idle().await;
        let status = engine.get_schedule_status(experiment_id).await.unwrap();
        if status.pending == 0 && status.running == 0 {
            return;
        }
    }
    panic!("schedule for {experiment_id} did not drain");
}

// =============================================================================
// A/B test lifecycle
// =============================================================================

#[tokio::test]
async fn test_invalid_allocation_is_rejected() {
    let clock = ManualClock::shared(start());
    let (engine, _) = engine_on(Arc::new(MemoryKvStore::new()), clock).await;

    let err = engine.create_experiment(ab_config(0.5, 0.4)).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(engine.list_experiments().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_assignment_is_stable_while_running() {
    let clock = ManualClock::shared(start());
    let (engine, _) = engine_on(Arc::new(MemoryKvStore::new()), clock).await;
    let id = engine.create_experiment(ab_config(0.5, 0.5)).await.unwrap().id().to_string();

    assert_eq!(engine.assign_variant(&id, "user-42").await.unwrap(), None);

    engine.start_ab_test(&id).await.unwrap();
    let first = engine.assign_variant(&id, "user-42").await.unwrap();
    assert!(first.is_some());
    for _ in 0..5 {
        assert_eq!(engine.assign_variant(&id, "user-42").await.unwrap(), first);
    }

    engine.pause_test(&id).await.unwrap();
    assert_eq!(engine.assign_variant(&id, "user-42").await.unwrap(), None);
}

#[tokio::test]
async fn test_scheduled_ab_test_auto_completes() {
    let clock = ManualClock::shared(start());
    let (engine, inbox) = engine_on(Arc::new(MemoryKvStore::new()), clock.clone()).await;
    let id = engine.create_experiment(ab_config(0.5, 0.5)).await.unwrap().id().to_string();
    engine.start_ab_test(&id).await.unwrap();

    // control 0.40 vs treatment 0.55, n = 200 each
    for i in 0..200 {
        engine
            .record_event(&id, "current", VariantEvent::outcome(i < 80).with_response_time(120.0))
            .await
            .unwrap();
        engine
            .record_event(&id, "shorter", VariantEvent::outcome(i < 110))
            .await
            .unwrap();
    }

    let early = engine.analyze_results(&id).await.unwrap();
    assert!(!early.ready_to_complete);
    let confidence = early.results.comparisons[0].confidence;
    assert!((0.5..=1.0).contains(&confidence));

    let scheduled = engine.schedule_experiment(&id).await.unwrap();
    assert_eq!(scheduled.pending, 7); // 6 evaluations + completion

    clock.set(start() + Duration::days(7));
    drain(&engine, &id).await;

    let experiment = engine.get_experiment(&id).await.unwrap();
    assert_eq!(experiment.status(), ExperimentStatus::Completed);
    let results = engine.get_experiment_results(&id).await.unwrap();
    assert_eq!(results.winner.as_deref(), Some("shorter"));
    assert_eq!(results.total_samples, 400);

    let analysis = engine.analyze_results(&id).await.unwrap();
    assert_eq!(
        analysis.recommendation,
        Recommendation::AdoptVariant("shorter".into())
    );

    let control = experiment.variant("current").unwrap();
    assert!((control.metrics().response_time - 120.0).abs() < 1e-9);
    assert!(inbox
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Notification::ExperimentCompleted { experiment_id, .. } if experiment_id == &id)));
}

#[tokio::test]
async fn test_evaluate_variants_before_window_end_keeps_running() {
    let clock = ManualClock::shared(start());
    let (engine, _) = engine_on(Arc::new(MemoryKvStore::new()), clock).await;
    let id = engine.create_experiment(ab_config(0.5, 0.5)).await.unwrap().id().to_string();

    assert!(matches!(
        engine.evaluate_variants(&id).await,
        Err(Error::Validation(_))
    ));

    engine.start_ab_test(&id).await.unwrap();
    for i in 0..100 {
        engine.record_event(&id, "current", VariantEvent::outcome(i % 2 == 0)).await.unwrap();
        engine.record_event(&id, "shorter", VariantEvent::outcome(i % 3 == 0)).await.unwrap();
    }
    let results = engine.evaluate_variants(&id).await.unwrap();
    assert_eq!(results.total_samples, 200);

    let experiment = engine.get_experiment(&id).await.unwrap();
    assert!(experiment.is_running());
    let stored = experiment.variant("shorter").unwrap().metrics().confidence;
    assert!((stored - results.comparisons[0].confidence).abs() < 1e-12);
}

#[tokio::test]
async fn test_cancel_schedule_and_delete() {
    let clock = ManualClock::shared(start());
    let (engine, inbox) = engine_on(Arc::new(MemoryKvStore::new()), clock).await;
    let id = engine.create_experiment(ab_config(0.5, 0.5)).await.unwrap().id().to_string();
    engine.schedule_experiment(&id).await.unwrap();

    let cancelled = engine.cancel_schedule(&id).await.unwrap();
    assert_eq!(cancelled, 7);
    assert_eq!(engine.get_schedule_status(&id).await.unwrap().pending, 0);
    assert!(matches!(
        inbox.events.lock().unwrap().as_slice(),
        [Notification::ScheduleCancelled { cancelled_tasks: 7, .. }]
    ));

    engine.delete_experiment(&id).await.unwrap();
    assert!(matches!(
        engine.get_experiment(&id).await,
        Err(Error::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let store = Arc::new(MemoryKvStore::new());
    let clock = ManualClock::shared(start());
    let (engine, _) = engine_on(Arc::clone(&store), clock.clone()).await;
    let id = engine.create_experiment(ab_config(0.5, 0.5)).await.unwrap().id().to_string();
    engine.start_ab_test(&id).await.unwrap();
    engine.record_event(&id, "shorter", VariantEvent::outcome(true)).await.unwrap();
    engine
        .register_client("edge-1", ClientMetrics::with_capacity(100, 1.0))
        .await
        .unwrap();
    let before = engine.get_experiment(&id).await.unwrap();
    drop(engine);

    let (reopened, _) = engine_on(store, clock).await;
    assert_eq!(reopened.get_experiment(&id).await.unwrap(), before);
    assert_eq!(reopened.coordinator().list_clients().len(), 1);

    // ids from the new generation never collide with the old one
    let second = reopened.create_experiment(ab_config(0.5, 0.5)).await.unwrap();
    assert_ne!(second.id(), id);
    assert!(second.id().starts_with("exp-2-"));
}

// =============================================================================
// Federated training
// =============================================================================

#[tokio::test]
async fn test_federated_training_through_facade() {
    let clock = ManualClock::shared(start());
    let (engine, _) = engine_on(Arc::new(MemoryKvStore::new()), clock).await;

    assert!(matches!(
        engine.start_federated_training(1).await,
        Err(Error::InsufficientResources(_))
    ));

    engine.register_client("edge-1", ClientMetrics::with_capacity(100, 1.0)).await.unwrap();
    engine.register_client("edge-2", ClientMetrics::with_capacity(300, 1.0)).await.unwrap();

    let rounds = engine.start_federated_training(2).await.unwrap();
    assert_eq!(rounds.len(), 2);
    assert!(rounds.iter().all(|r| r.phase() == RoundPhase::Completed));
    assert_eq!(engine.get_round_history().await.len(), 2);
    assert_eq!(rounds[1].round_number(), 2);

    engine.unregister_client("edge-1").await.unwrap();
    assert!(matches!(
        engine.start_federated_training(1).await,
        Err(Error::InsufficientResources(_))
    ));
}

#[tokio::test]
async fn test_federated_plan_runs_from_scheduled_evaluations() {
    let store = Arc::new(MemoryKvStore::new());
    let clock = ManualClock::shared(start());
    let (engine, _) = engine_on(Arc::clone(&store), clock.clone()).await;
    engine.register_client("edge-1", ClientMetrics::with_capacity(100, 1.0)).await.unwrap();
    engine.register_client("edge-2", ClientMetrics::with_capacity(300, 1.0)).await.unwrap();

    let config = ExperimentConfig::builder(
        "Keyboard model",
        ExperimentType::CrossValidation,
        ScheduleConfig::daily(start(), start() + Duration::days(2))
            .with_checkpoints(vec![36 * 3_600_000]),
    )
    .variant(VariantConfig::control("model", 1.0))
    .metric(MetricSpec::primary(MetricKind::SuccessRate))
    .federated(FederatedPlan {
        rounds_per_evaluation: 2,
    })
    .build();
    let id = engine.create_experiment(config).await.unwrap().id().to_string();

    assert!(engine.start_ab_test(&id).await.is_err());
    let started = engine.start_cross_validation(&id, 5).await.unwrap();
    assert_eq!(started.folds(), Some(5));
    assert!(engine.fold_for(&id, "subject-9").await.unwrap() < 5);

    engine.schedule_experiment(&id).await.unwrap();
    clock.set(start() + Duration::days(2));
    drain(&engine, &id).await;

    assert_eq!(engine.get_round_history().await.len(), 2);
    assert_eq!(
        engine.get_experiment(&id).await.unwrap().status(),
        ExperimentStatus::Completed
    );

    let keys = store.keys_with_prefix("checkpoint/");
    assert_eq!(keys.len(), 1);
    let status = engine.get_schedule_status(&id).await.unwrap();
    assert_eq!(status.completed, 3);

    let checkpoint: Checkpoint = {
        use trueno_lab::kv::KvStore;
        let bytes = store.get(&keys[0]).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    };
    assert_eq!(checkpoint.weights.unwrap().len(), 1);
}

/// `HalfwayExecutor` that takes `delay_ms` of wall time per client.
struct SlowExecutor {
    delay_ms: u64,
}

impl TrainingExecutor for SlowExecutor {
    async fn train(
        &self,
        client: &FederatedClient,
        global: &[Tensor],
    ) -> trueno_lab::Result<LocalUpdate> {
        tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        HalfwayExecutor.train(client, global).await
    }
}

#[tokio::test]
async fn test_task_timeout_does_not_strand_federated_round() {
    let clock = ManualClock::shared(start());
    let engine = Orchestrator::open(
        Arc::new(MemoryKvStore::new()),
        clock.clone(),
        Arc::new(SlowExecutor { delay_ms: 200 }),
        Arc::new(InMemoryModel::new(vec![Tensor::zeros(2)])),
        Inbox::default(),
        EngineConfig::builder().task_timeout_ms(50).build().unwrap(),
    )
    .await
    .unwrap();
    engine.register_client("edge-1", ClientMetrics::with_capacity(100, 1.0)).await.unwrap();
    engine.register_client("edge-2", ClientMetrics::with_capacity(300, 1.0)).await.unwrap();

    let config = ExperimentConfig::builder(
        "Keyboard model",
        ExperimentType::CrossValidation,
        ScheduleConfig::daily(start(), start() + Duration::days(2)),
    )
    .variant(VariantConfig::control("model", 1.0))
    .metric(MetricSpec::primary(MetricKind::SuccessRate))
    .federated(FederatedPlan {
        rounds_per_evaluation: 1,
    })
    .build();
    let id = engine.create_experiment(config).await.unwrap().id().to_string();
    engine.start_cross_validation(&id, 5).await.unwrap();
    engine.schedule_experiment(&id).await.unwrap();

    clock.set(start() + Duration::hours(30));
    assert_eq!(engine.tick().await.unwrap().admitted.len(), 1);
    engine.wait_idle().await;

    let evaluation = engine.get_schedule_status(&id).await.unwrap().tasks[0].clone();
    assert_eq!(evaluation.retries(), 1);
    assert!(evaluation.last_error().unwrap().contains("timed out"));

    for _ in 0..100 {
        if !engine.get_round_history().await.is_empty() && !engine.coordinator().is_round_active() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    let history = engine.get_round_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].phase(), RoundPhase::Completed);
    assert!(engine
        .coordinator()
        .list_clients()
        .iter()
        .all(|c| !c.is_busy()));

    engine.reset_client("edge-1").await.unwrap();
    let rounds = engine.start_federated_training(1).await.unwrap();
    assert_eq!(rounds[0].round_number(), 2);
}
