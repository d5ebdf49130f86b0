//! Aggregation strategies
//!
//! ## Strategies
//!
//! | Strategy | New global weights |
//! |---|---|
//! | `FedAvg` | `Σ wᵢ·(nᵢ/N)` |
//! | `FedProx` | `avg + mu·(global − avg)` |
//! | `FedAdam` | `global + lr·m̂/(√v̂ + ε)` over `Δ = avg − global` |
//!
//! `FedAdam` moments live in [`FedAdamState`], which the coordinator keeps
//! across rounds and persists with its history.

use super::round::ClientUpdate;
use super::tensor::Tensor;
use crate::config::AdamConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Server-side aggregation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// Data-size weighted average.
    #[default]
    FedAvg,
    /// Weighted average pulled toward the previous global weights.
    FedProx,
    /// Adam step on the averaged delta.
    FedAdam,
}

/// Data-size weighted average of every layer.
///
/// # Errors
/// Returns `Validation` when there are no updates, the total data size is
/// zero, or layer shapes disagree.
#[allow(clippy::cast_precision_loss)]
pub fn fed_avg(updates: &[ClientUpdate]) -> Result<Vec<Tensor>> {
    let first = updates
        .first()
        .ok_or_else(|| Error::Validation("no client updates to aggregate".into()))?;
    let total: u64 = updates.iter().map(|u| u.data_size).sum();
    if total == 0 {
        return Err(Error::Validation("total client data size is zero".into()));
    }

    let mut averaged: Vec<Tensor> = first.weights.iter().map(Tensor::zeros_like).collect();
    for update in updates {
        if update.weights.len() != averaged.len() {
            return Err(Error::Validation(format!(
                "client {} sent {} layers, expected {}",
                update.client_id,
                update.weights.len(),
                averaged.len()
            )));
        }
        let share = update.data_size as f64 / total as f64;
        for (acc, layer) in averaged.iter_mut().zip(&update.weights) {
            *acc = acc.add(&layer.scale(share))?;
        }
    }
    Ok(averaged)
}

/// `FedAvg` shifted toward `global` by the proximal term `mu`.
///
/// # Errors
/// Propagates `fed_avg` errors and layer-shape mismatches against `global`.
pub fn fed_prox(updates: &[ClientUpdate], global: &[Tensor], mu: f64) -> Result<Vec<Tensor>> {
    let averaged = fed_avg(updates)?;
    check_layers(&averaged, global)?;
    averaged
        .iter()
        .zip(global)
        .map(|(avg, g)| avg.add(&g.sub(avg)?.scale(mu)))
        .collect()
}

/// Adam moment estimates carried between rounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FedAdamState {
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    step: u64,
}

impl FedAdamState {
    /// Adam steps taken so far.
    #[must_use]
    pub const fn step(&self) -> u64 {
        self.step
    }

    /// Apply one Adam step on `averaged − global` and return the new weights.
    ///
    /// Moments reset when the model shape changes.
    ///
    /// # Errors
    /// Returns `Validation` on layer-shape mismatch.
    pub fn apply(
        &mut self,
        global: &[Tensor],
        averaged: &[Tensor],
        adam: &AdamConfig,
    ) -> Result<Vec<Tensor>> {
        check_layers(averaged, global)?;
        let shape_matches = self.m.len() == global.len()
            && self.m.iter().zip(global).all(|(m, g)| m.len() == g.len());
        if !shape_matches {
            self.m = global.iter().map(Tensor::zeros_like).collect();
            self.v = self.m.clone();
            self.step = 0;
        }
        self.step += 1;
        let t = i32::try_from(self.step).unwrap_or(i32::MAX);
        let m_correction = 1.0 - adam.beta1.powi(t);
        let v_correction = 1.0 - adam.beta2.powi(t);

        let mut next = Vec::with_capacity(global.len());
        for ((g, avg), (m, v)) in global
            .iter()
            .zip(averaged)
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
        {
            let delta = avg.sub(g)?;
            *m = m.scale(adam.beta1).add(&delta.scale(1.0 - adam.beta1))?;
            *v = v
                .scale(adam.beta2)
                .add(&delta.square().scale(1.0 - adam.beta2))?;
            let m_hat = m.scale(1.0 / m_correction);
            let v_hat = v.scale(1.0 / v_correction);
            let step = m_hat.zip_with(&v_hat.sqrt(), |m, s| m / (s + adam.epsilon))?;
            next.push(g.add(&step.scale(adam.learning_rate))?);
        }
        Ok(next)
    }
}

/// Dispatch to the configured strategy.
///
/// # Errors
/// Propagates strategy errors.
pub fn aggregate(
    kind: AggregationKind,
    updates: &[ClientUpdate],
    global: &[Tensor],
    proximal_mu: f64,
    adam: &AdamConfig,
    adam_state: &mut FedAdamState,
) -> Result<Vec<Tensor>> {
    match kind {
        AggregationKind::FedAvg => fed_avg(updates),
        AggregationKind::FedProx => fed_prox(updates, global, proximal_mu),
        AggregationKind::FedAdam => {
            let averaged = fed_avg(updates)?;
            adam_state.apply(global, &averaged, adam)
        }
    }
}

fn check_layers(a: &[Tensor], b: &[Tensor]) -> Result<()> {
    if a.len() == b.len() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "layer count mismatch: {} vs {}",
            a.len(),
            b.len()
        )))
    }
}
