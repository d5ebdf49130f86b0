//! # Trueno-Lab: Experiment Orchestration Engine
//!
//! **Version**: 0.1.0
//!
//! Trueno-Lab defines, schedules, executes and evaluates controlled
//! experiments (A/B tests, cross-validation, hyperparameter searches) and
//! federated-learning rounds across a fleet of independent clients.
//!
//! ## Components
//!
//! - **Experiment registry**: validated definitions and the
//!   `Draft → Running → {Paused, Completed}` state machine
//! - **Variant allocator**: deterministic subject → variant assignment and
//!   online metric updates
//! - **Statistical comparator**: two-proportion z-score between control and
//!   each treatment (an approximation, not a calibrated p-value)
//! - **Task scheduler**: evaluation/checkpoint/completion tasks with a
//!   concurrency ceiling, priorities and exponential backoff
//! - **Federated coordinator**: client selection, FedAvg / FedProx / FedAdam
//!   aggregation and privacy-budget accounting
//!
//! All state goes through a [`kv::KvStore`] and all time through a
//! [`clock::Clock`], so every component runs deterministically in tests.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trueno_lab::clock::SystemClock;
//! use trueno_lab::config::EngineConfig;
//! use trueno_lab::federated::{
//!     ClientMetrics, FederatedClient, InMemoryModel, LocalUpdate, Tensor, TrainingExecutor,
//! };
//! use trueno_lab::kv::MemoryKvStore;
//! use trueno_lab::orchestrator::Orchestrator;
//! use trueno_lab::scheduler::LogNotifier;
//!
//! struct Echo;
//!
//! impl TrainingExecutor for Echo {
//!     async fn train(
//!         &self,
//!         _client: &FederatedClient,
//!         global: &[Tensor],
//!     ) -> trueno_lab::Result<LocalUpdate> {
//!         Ok(LocalUpdate { weights: global.to_vec(), loss: 0.1, accuracy: 0.9 })
//!     }
//! }
//!
//! # async fn demo() -> trueno_lab::Result<()> {
//! let engine = Orchestrator::open(
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(SystemClock),
//!     Arc::new(Echo),
//!     Arc::new(InMemoryModel::new(vec![Tensor::zeros(4)])),
//!     LogNotifier,
//!     EngineConfig::default(),
//! )
//! .await?;
//!
//! engine.register_client("edge-1", ClientMetrics::with_capacity(500, 1.0)).await?;
//! engine.register_client("edge-2", ClientMetrics::with_capacity(800, 2.0)).await?;
//! let rounds = engine.start_federated_training(3).await?;
//! println!("{} rounds", rounds.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod clock;
pub mod config;
pub mod error;
pub mod experiment;
pub mod federated;
pub mod ids;
pub mod kv;
pub mod orchestrator;
pub mod scheduler;
pub mod telemetry;

pub use error::{Error, Result};
