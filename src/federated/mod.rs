//! Federated learning
//!
//! Registered clients train locally through a [`TrainingExecutor`]; the
//! [`FederatedCoordinator`] selects participants, collects their updates and
//! combines them into new global weights held by a [`ModelHandle`].

mod aggregation;
mod client;
mod coordinator;
mod executor;
mod round;
mod tensor;

pub use aggregation::{aggregate, fed_avg, fed_prox, AggregationKind, FedAdamState};
pub use client::{ClientMetrics, ClientStatus, FederatedClient, PrivacyBudget};
pub use coordinator::FederatedCoordinator;
pub use executor::{InMemoryModel, LocalUpdate, ModelHandle, TrainingExecutor};
pub use round::{ClientUpdate, FederatedRound, RoundMetrics, RoundPhase};
pub use tensor::Tensor;
