//! Federated client record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a client with respect to rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// Available for selection.
    Idle,
    /// Training locally for the active round.
    Training,
    /// Update received, waiting for the round to aggregate.
    Aggregating,
    /// Last training attempt failed or timed out.
    Error,
}

/// Latest metrics reported by (or declared for) a client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClientMetrics {
    /// Local training loss.
    pub loss: f64,
    /// Local training accuracy.
    pub accuracy: f64,
    /// Number of local training samples.
    pub data_size: u64,
    /// Relative compute power, used to rank candidates.
    pub compute_capability: f64,
}

impl ClientMetrics {
    /// Declared capacity with no training history.
    #[must_use]
    pub const fn with_capacity(data_size: u64, compute_capability: f64) -> Self {
        Self {
            loss: 0.0,
            accuracy: 0.0,
            data_size,
            compute_capability,
        }
    }

    /// Selection score: `compute_capability · data_size`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn selection_score(&self) -> f64 {
        self.compute_capability * self.data_size as f64
    }
}

/// Differential-privacy budget spent so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    /// Accumulated epsilon.
    pub epsilon: f64,
    /// Delta from the privacy configuration.
    pub delta: f64,
}

/// A registered participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedClient {
    id: String,
    status: ClientStatus,
    last_update: Option<DateTime<Utc>>,
    metrics: ClientMetrics,
    privacy_budget: PrivacyBudget,
    rounds_completed: u64,
}

impl FederatedClient {
    /// New idle client.
    #[must_use]
    pub fn new(id: impl Into<String>, metrics: ClientMetrics) -> Self {
        Self {
            id: id.into(),
            status: ClientStatus::Idle,
            last_update: None,
            metrics,
            privacy_budget: PrivacyBudget::default(),
            rounds_completed: 0,
        }
    }

    /// Client id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> ClientStatus {
        self.status
    }

    /// Time of the last successful update.
    #[must_use]
    pub const fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Latest metrics.
    #[must_use]
    pub const fn metrics(&self) -> &ClientMetrics {
        &self.metrics
    }

    /// Privacy budget spent.
    #[must_use]
    pub const fn privacy_budget(&self) -> PrivacyBudget {
        self.privacy_budget
    }

    /// Rounds this client contributed to.
    #[must_use]
    pub const fn rounds_completed(&self) -> u64 {
        self.rounds_completed
    }

    /// True while the client is part of an active round.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self.status, ClientStatus::Training | ClientStatus::Aggregating)
    }

    pub(crate) fn set_status(&mut self, status: ClientStatus) {
        self.status = status;
    }

    /// Successful local training: record metrics and spend privacy budget.
    pub(crate) fn record_training(
        &mut self,
        loss: f64,
        accuracy: f64,
        privacy: Option<(f64, f64)>,
        now: DateTime<Utc>,
    ) {
        self.metrics.loss = loss;
        self.metrics.accuracy = accuracy;
        self.last_update = Some(now);
        self.rounds_completed += 1;
        self.status = ClientStatus::Aggregating;
        if let Some((epsilon, delta)) = privacy {
            self.privacy_budget.epsilon += epsilon;
            self.privacy_budget.delta = delta;
        }
    }
}
