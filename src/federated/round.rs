//! Federated round record

use super::tensor::Tensor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Round lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Selecting participants.
    Initializing,
    /// Global weights handed to participants.
    Distributing,
    /// Participants training locally.
    Training,
    /// Combining updates.
    Aggregating,
    /// New global weights written.
    Completed,
    /// No participant returned an update.
    Failed,
}

/// Weights returned by one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUpdate {
    /// Participant id.
    pub client_id: String,
    /// Updated local weights.
    pub weights: Vec<Tensor>,
    /// Samples the update was trained on.
    pub data_size: u64,
    /// Local loss.
    pub loss: f64,
    /// Local accuracy.
    pub accuracy: f64,
}

/// Aggregate metrics of a finished round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    /// Mean loss over successful participants.
    pub mean_loss: f64,
    /// Mean accuracy over successful participants.
    pub mean_accuracy: f64,
    /// Clients selected.
    pub selected: usize,
    /// Clients that returned an update.
    pub succeeded: usize,
}

/// One round of federated training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedRound {
    id: String,
    round_number: u64,
    phase: RoundPhase,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    participants: Vec<String>,
    metrics: RoundMetrics,
    updates: Vec<ClientUpdate>,
}

impl FederatedRound {
    pub(crate) fn new(id: String, round_number: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            round_number,
            phase: RoundPhase::Initializing,
            started_at: now,
            ended_at: None,
            participants: Vec::new(),
            metrics: RoundMetrics::default(),
            updates: Vec::new(),
        }
    }

    /// Round id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 1-based position in the coordinator's history.
    #[must_use]
    pub const fn round_number(&self) -> u64 {
        self.round_number
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Round start.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Round end, once Completed or Failed.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Selected client ids.
    #[must_use]
    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    /// Aggregate metrics.
    #[must_use]
    pub const fn metrics(&self) -> &RoundMetrics {
        &self.metrics
    }

    /// Updates that entered aggregation.
    #[must_use]
    pub fn updates(&self) -> &[ClientUpdate] {
        &self.updates
    }

    pub(crate) fn set_phase(&mut self, phase: RoundPhase) {
        self.phase = phase;
    }

    pub(crate) fn set_participants(&mut self, participants: Vec<String>) {
        self.metrics.selected = participants.len();
        self.participants = participants;
    }

    pub(crate) fn push_update(&mut self, update: ClientUpdate) {
        self.updates.push(update);
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn finish(&mut self, phase: RoundPhase, now: DateTime<Utc>) {
        let n = self.updates.len();
        self.metrics.succeeded = n;
        if n > 0 {
            self.metrics.mean_loss = self.updates.iter().map(|u| u.loss).sum::<f64>() / n as f64;
            self.metrics.mean_accuracy =
                self.updates.iter().map(|u| u.accuracy).sum::<f64>() / n as f64;
        }
        self.phase = phase;
        self.ended_at = Some(now);
    }
}
