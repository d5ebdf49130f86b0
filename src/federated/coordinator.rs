//! Federated Round Coordinator
//!
//! ## Round
//!
//! ```text
//! Initializing ─ select idle clients (score = compute · data_size)
//!      │
//! Distributing ─ snapshot global weights, mark Training
//!      │
//! Training ───── executor.train per client (timeout-bounded, concurrent)
//!      │           ok → Aggregating, epsilon += 1/(2σ²)   err → Error
//! Aggregating ── FedAvg | FedProx | FedAdam over successful updates
//!      │
//! Completed ──── write global weights, clients → Idle, archive round
//! ```
//!
//! Only one round runs at a time per coordinator. Client records live in an
//! in-memory map mirrored to the key-value store on every change. A round
//! that errors midway returns its busy participants to Idle and is archived
//! as Failed.

use super::aggregation::{aggregate, FedAdamState};
use super::client::{ClientMetrics, ClientStatus, FederatedClient, PrivacyBudget};
use super::executor::{LocalUpdate, ModelHandle, TrainingExecutor};
use super::round::{ClientUpdate, FederatedRound, RoundPhase};
use super::tensor::Tensor;
use crate::clock::Clock;
use crate::config::FederatedConfig;
use crate::ids::IdGenerator;
use crate::kv::{KvStore, RecordStore};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const CLIENT_INDEX_KEY: &str = "client/index";
const HISTORY_KEY: &str = "round/history";
const ADAM_STATE_KEY: &str = "round/adam_state";

fn client_key(client_id: &str) -> String {
    format!("client/{client_id}")
}

/// Coordinates rounds across registered clients.
pub struct FederatedCoordinator<S: KvStore, E: TrainingExecutor, M: ModelHandle> {
    records: RecordStore<S>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    executor: Arc<E>,
    model: Arc<M>,
    config: FederatedConfig,
    clients: DashMap<String, FederatedClient>,
    history: RwLock<Vec<FederatedRound>>,
    /// Held for the duration of a training run; carries `FedAdam` moments.
    active: Mutex<FedAdamState>,
}

impl<S, E, M> FederatedCoordinator<S, E, M>
where
    S: KvStore,
    E: TrainingExecutor,
    M: ModelHandle,
{
    /// Create a coordinator with no clients. Call [`Self::load`] to restore
    /// persisted state.
    #[must_use]
    pub fn new(
        records: RecordStore<S>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn Clock>,
        executor: Arc<E>,
        model: Arc<M>,
        config: FederatedConfig,
    ) -> Self {
        Self {
            records,
            ids,
            clock,
            executor,
            model,
            config,
            clients: DashMap::new(),
            history: RwLock::new(Vec::new()),
            active: Mutex::new(FedAdamState::default()),
        }
    }

    /// Round settings.
    #[must_use]
    pub const fn config(&self) -> &FederatedConfig {
        &self.config
    }

    /// Global model collaborator.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// True while `start_federated_training` is running.
    #[must_use]
    pub fn is_round_active(&self) -> bool {
        self.active.try_lock().is_err()
    }

    /// Restore clients, round history and `FedAdam` moments.
    ///
    /// Clients persisted mid-round are returned to Idle.
    ///
    /// # Errors
    /// Returns persistence or decoding errors.
    pub async fn load(&self) -> Result<usize> {
        let mut interrupted = 0;
        for id in self.records.index(CLIENT_INDEX_KEY).await? {
            let Some(mut client) = self.records.load::<FederatedClient>(&client_key(&id)).await?
            else {
                continue;
            };
            if client.is_busy() {
                client.set_status(ClientStatus::Idle);
                self.records.save(&client_key(&id), &client).await?;
                interrupted += 1;
            }
            self.clients.insert(id, client);
        }
        if let Some(history) = self.records.load::<Vec<FederatedRound>>(HISTORY_KEY).await? {
            *self.history.write().await = history;
        }
        if let Some(state) = self.records.load::<FedAdamState>(ADAM_STATE_KEY).await? {
            *self.active.lock().await = state;
        }
        if interrupted > 0 {
            warn!(interrupted, "clients interrupted mid-round reset to idle");
        }
        info!(clients = self.clients.len(), "federated coordinator loaded");
        Ok(self.clients.len())
    }

    /// Register an idle client.
    ///
    /// # Errors
    /// Returns `Validation` for an empty or duplicate id.
    pub async fn register_client(
        &self,
        client_id: &str,
        metrics: ClientMetrics,
    ) -> Result<FederatedClient> {
        if client_id.trim().is_empty() {
            return Err(Error::Validation("client id must not be empty".into()));
        }
        if self.clients.contains_key(client_id) {
            return Err(Error::Validation(format!(
                "client {client_id} is already registered"
            )));
        }
        let client = FederatedClient::new(client_id, metrics);
        self.records.save(&client_key(client_id), &client).await?;
        self.records.index_insert(CLIENT_INDEX_KEY, client_id).await?;
        self.clients.insert(client_id.to_string(), client.clone());
        info!(client_id, data_size = metrics.data_size, "client registered");
        Ok(client)
    }

    /// Remove a client.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id and `Validation` while the client
    /// takes part in an active round.
    pub async fn unregister_client(&self, client_id: &str) -> Result<()> {
        let busy = self
            .clients
            .get(client_id)
            .map(|c| c.is_busy())
            .ok_or_else(|| Error::not_found("client", client_id))?;
        if busy {
            return Err(Error::Validation(format!(
                "client {client_id} is participating in an active round"
            )));
        }
        self.clients.remove(client_id);
        self.records.remove(&client_key(client_id)).await?;
        self.records.index_remove(CLIENT_INDEX_KEY, client_id).await?;
        info!(client_id, "client unregistered");
        Ok(())
    }

    /// One client.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub fn get_client(&self, client_id: &str) -> Result<FederatedClient> {
        self.clients
            .get(client_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::not_found("client", client_id))
    }

    /// All clients, ordered by id.
    #[must_use]
    pub fn list_clients(&self) -> Vec<FederatedClient> {
        let mut clients: Vec<_> = self.clients.iter().map(|c| c.value().clone()).collect();
        clients.sort_by(|a, b| a.id().cmp(b.id()));
        clients
    }

    /// Privacy budget a client has spent.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id.
    pub fn privacy_budget(&self, client_id: &str) -> Result<PrivacyBudget> {
        self.get_client(client_id).map(|c| c.privacy_budget())
    }

    /// Return an errored client to Idle.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown id and `Validation` while the client
    /// takes part in an active round.
    pub async fn reset_client(&self, client_id: &str) -> Result<FederatedClient> {
        let client = {
            let mut entry = self
                .clients
                .get_mut(client_id)
                .ok_or_else(|| Error::not_found("client", client_id))?;
            if entry.is_busy() {
                return Err(Error::Validation(format!(
                    "client {client_id} is participating in an active round"
                )));
            }
            entry.set_status(ClientStatus::Idle);
            entry.value().clone()
        };
        self.records.save(&client_key(client_id), &client).await?;
        Ok(client)
    }

    /// Archived rounds, oldest first.
    pub async fn get_round_history(&self) -> Vec<FederatedRound> {
        self.history.read().await.clone()
    }

    /// Run `rounds` rounds back to back.
    ///
    /// Stops after a round in which no participant returned an update; that
    /// round is archived as Failed and included in the result.
    ///
    /// # Errors
    /// Returns `Validation` for zero rounds, `InsufficientResources` when a
    /// round is already active or too few clients are idle, and persistence
    /// or aggregation errors.
    pub async fn start_federated_training(&self, rounds: usize) -> Result<Vec<FederatedRound>> {
        if rounds == 0 {
            return Err(Error::Validation("rounds must be at least 1".into()));
        }
        let mut adam_state = self.active.try_lock().map_err(|_| {
            Error::InsufficientResources("a federated round is already active".into())
        })?;

        let mut completed = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let round = self.run_round(&mut adam_state).await?;
            let failed = round.phase() == RoundPhase::Failed;
            completed.push(round);
            if failed {
                break;
            }
        }
        Ok(completed)
    }

    /// [`Self::start_federated_training`] on its own task. Dropping the
    /// returned future leaves the rounds running to completion, so callers
    /// under a deadline never abandon clients mid-round.
    ///
    /// # Errors
    /// As [`Self::start_federated_training`], plus `Other` if the training
    /// task panics.
    pub async fn train_detached(self: &Arc<Self>, rounds: usize) -> Result<Vec<FederatedRound>>
    where
        S: 'static,
    {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.start_federated_training(rounds).await })
            .await
            .map_err(|e| Error::Other(format!("federated training task failed: {e}")))?
    }

    async fn run_round(&self, adam_state: &mut FedAdamState) -> Result<FederatedRound> {
        let archived = self.history.read().await.len();
        let round_number = u64::try_from(archived).unwrap_or(u64::MAX).saturating_add(1);
        let mut round = FederatedRound::new(self.ids.next("round"), round_number, self.clock.now());

        let participants = self.select_clients()?;
        round.set_participants(participants.clone());
        info!(
            round = round_number,
            round_id = round.id(),
            participants = participants.len(),
            strategy = ?self.config.strategy,
            "federated round started"
        );

        let driven = self.drive_round(&mut round, &participants, adam_state).await;
        if driven.is_err() {
            self.release_participants(&participants).await;
            round.finish(RoundPhase::Failed, self.clock.now());
        }
        let stored = self.archive(&round, adam_state).await;
        match (driven, stored) {
            (Err(e), stored) => {
                if let Err(archive_err) = stored {
                    warn!(round = round_number, error = %archive_err, "failed round not archived");
                }
                warn!(round = round_number, error = %e, "federated round aborted");
                Err(e)
            }
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => {
                if round.phase() == RoundPhase::Completed {
                    info!(
                        round = round_number,
                        succeeded = round.metrics().succeeded,
                        mean_loss = round.metrics().mean_loss,
                        mean_accuracy = round.metrics().mean_accuracy,
                        "federated round completed"
                    );
                }
                Ok(round)
            }
        }
    }

    /// Distribute, train, aggregate. Leaves `round` finished on success and
    /// unfinished on error.
    async fn drive_round(
        &self,
        round: &mut FederatedRound,
        participants: &[String],
        adam_state: &mut FedAdamState,
    ) -> Result<()> {
        let round_number = round.round_number();
        round.set_phase(RoundPhase::Distributing);
        let global = Arc::new(self.model.weights().await?);
        for id in participants {
            self.update_client(id, |c| c.set_status(ClientStatus::Training))
                .await?;
        }

        round.set_phase(RoundPhase::Training);
        let outcomes = self.train_participants(participants, &global).await;
        let privacy = self
            .config
            .privacy
            .map(|p| (p.epsilon_per_round(), p.delta));

        let mut outstanding: HashSet<&str> = participants.iter().map(String::as_str).collect();
        for (client_id, outcome) in outcomes {
            outstanding.remove(client_id.as_str());
            match outcome {
                Ok(local) => {
                    let now = self.clock.now();
                    let client = self
                        .update_client(&client_id, |c| {
                            c.record_training(local.loss, local.accuracy, privacy, now);
                        })
                        .await?;
                    round.push_update(ClientUpdate {
                        client_id,
                        weights: local.weights,
                        data_size: client.metrics().data_size,
                        loss: local.loss,
                        accuracy: local.accuracy,
                    });
                }
                Err(e) => {
                    warn!(client_id = %client_id, round = round_number, error = %e, "client training failed");
                    self.update_client(&client_id, |c| c.set_status(ClientStatus::Error))
                        .await?;
                }
            }
        }
        for client_id in outstanding {
            warn!(client_id, round = round_number, "client training task aborted");
            self.update_client(client_id, |c| c.set_status(ClientStatus::Error))
                .await?;
        }

        if round.updates().is_empty() {
            round.finish(RoundPhase::Failed, self.clock.now());
            warn!(round = round_number, "no client returned an update; round failed");
            return Ok(());
        }

        round.set_phase(RoundPhase::Aggregating);
        let weights = aggregate(
            self.config.strategy,
            round.updates(),
            &global,
            self.config.proximal_mu,
            &self.config.adam,
            adam_state,
        )?;
        self.model.set_weights(weights).await?;
        let contributors: Vec<String> = round
            .updates()
            .iter()
            .map(|u| u.client_id.clone())
            .collect();
        for id in &contributors {
            self.update_client(id, |c| c.set_status(ClientStatus::Idle))
                .await?;
        }
        round.finish(RoundPhase::Completed, self.clock.now());
        Ok(())
    }

    /// Return participants still marked busy to Idle after an aborted round.
    /// Store failures are logged; the in-memory state is authoritative.
    async fn release_participants(&self, participants: &[String]) {
        for id in participants {
            let released = self.clients.get_mut(id).and_then(|mut entry| {
                entry.is_busy().then(|| {
                    entry.set_status(ClientStatus::Idle);
                    entry.value().clone()
                })
            });
            let Some(client) = released else {
                continue;
            };
            if let Err(e) = self.records.save(&client_key(id), &client).await {
                warn!(client_id = %id, error = %e, "released client not persisted");
            }
        }
    }

    /// Idle clients ranked by `compute_capability · data_size`, taking
    /// `floor(available · fraction)` but never fewer than `min_clients`.
    fn select_clients(&self) -> Result<Vec<String>> {
        let mut idle: Vec<(String, f64)> = self
            .clients
            .iter()
            .filter(|c| c.status() == ClientStatus::Idle)
            .map(|c| (c.id().to_string(), c.metrics().selection_score()))
            .collect();
        let available = idle.len();
        if available == 0 || available < self.config.min_clients {
            return Err(Error::InsufficientResources(format!(
                "{available} idle clients, {} required",
                self.config.min_clients
            )));
        }
        idle.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let by_fraction = (available as f64 * self.config.client_fraction).floor() as usize;
        let take = by_fraction.max(self.config.min_clients).min(available);
        debug!(available, take, "clients selected");
        Ok(idle.into_iter().take(take).map(|(id, _)| id).collect())
    }

    async fn train_participants(
        &self,
        participants: &[String],
        global: &Arc<Vec<Tensor>>,
    ) -> Vec<(String, Result<LocalUpdate>)> {
        let timeout = self.config.client_timeout();
        let timeout_ms = self.config.client_timeout_ms;
        let mut set = JoinSet::new();
        for id in participants {
            let Some(client) = self.clients.get(id).map(|c| c.value().clone()) else {
                continue;
            };
            let executor = Arc::clone(&self.executor);
            let global = Arc::clone(global);
            set.spawn(async move {
                let outcome =
                    match tokio::time::timeout(timeout, executor.train(&client, &global)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::TransientExecution(format!(
                            "client {} timed out after {timeout_ms} ms",
                            client.id()
                        ))),
                    };
                (client.id().to_string(), outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(participants.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "client training task panicked"),
            }
        }
        outcomes
    }

    async fn update_client(
        &self,
        client_id: &str,
        f: impl FnOnce(&mut FederatedClient),
    ) -> Result<FederatedClient> {
        let client = {
            let mut entry = self
                .clients
                .get_mut(client_id)
                .ok_or_else(|| Error::not_found("client", client_id))?;
            f(entry.value_mut());
            entry.value().clone()
        };
        self.records.save(&client_key(client_id), &client).await?;
        Ok(client)
    }

    /// Persist the round, then publish it to the in-memory history. A failed
    /// write leaves the history unchanged.
    async fn archive(&self, round: &FederatedRound, adam_state: &FedAdamState) -> Result<()> {
        let mut history = self.history.write().await;
        let mut updated = history.clone();
        updated.push(round.clone());
        self.records.save(ADAM_STATE_KEY, adam_state).await?;
        self.records.save(HISTORY_KEY, &updated).await?;
        *history = updated;
        Ok(())
    }
}
