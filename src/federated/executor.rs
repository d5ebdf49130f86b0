//! Training and model collaborators

use super::client::FederatedClient;
use super::tensor::Tensor;
use crate::Result;
use std::future::Future;
use std::sync::{PoisonError, RwLock};

/// Result of one client's local training.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    /// Updated weights, one tensor per layer.
    pub weights: Vec<Tensor>,
    /// Local loss.
    pub loss: f64,
    /// Local accuracy.
    pub accuracy: f64,
}

/// Runs local training on a client.
///
/// The coordinator bounds every call with the client timeout; an `Err` or a
/// timeout moves the client to `Error` and excludes it from aggregation.
pub trait TrainingExecutor: Send + Sync + 'static {
    /// Train `client` starting from `global_weights`.
    fn train(
        &self,
        client: &FederatedClient,
        global_weights: &[Tensor],
    ) -> impl Future<Output = Result<LocalUpdate>> + Send;
}

/// Holds the global model weights.
pub trait ModelHandle: Send + Sync + 'static {
    /// Current global weights.
    fn weights(&self) -> impl Future<Output = Result<Vec<Tensor>>> + Send;

    /// Replace the global weights.
    fn set_weights(&self, weights: Vec<Tensor>) -> impl Future<Output = Result<()>> + Send;
}

/// Model kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryModel {
    weights: RwLock<Vec<Tensor>>,
}

impl InMemoryModel {
    /// Model initialised with `weights`.
    #[must_use]
    pub const fn new(weights: Vec<Tensor>) -> Self {
        Self {
            weights: RwLock::new(weights),
        }
    }

    /// Copy of the current weights without going through the async trait.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Tensor> {
        self.weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ModelHandle for InMemoryModel {
    async fn weights(&self) -> Result<Vec<Tensor>> {
        Ok(self.snapshot())
    }

    async fn set_weights(&self, weights: Vec<Tensor>) -> Result<()> {
        *self.weights.write().unwrap_or_else(PoisonError::into_inner) = weights;
        Ok(())
    }
}
