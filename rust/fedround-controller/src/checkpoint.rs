//! Checkpoints of an experiment.
//!
//! A [`Checkpoint`] captures everything needed to resume an experiment after its last completed
//! round: the round counters, the history of the global parameters, the node states, the states of
//! the aggregator and of the server optimizer and the configuration of the experiment. It is
//! encoded as a JSON document and handed to a [`CheckpointStorage`] by the [`CheckpointManager`].
//!
//! Checkpoints are validated when they are saved and when they are loaded. A checkpoint which
//! fails the validation is never restored.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use displaydoc::Display;
use thiserror::Error;

use fedround_core::{
    message::TrainingArgs,
    model::Parameters,
    ExperimentId,
    NodeId,
    ResearcherId,
    RoundNumber,
};

use crate::{
    aggregation::{Aggregator, ServerOptimizer},
    dataset::{DatasetQuery, FederatedDataset},
    experiment::history::RoundRecord,
    node_state::NodeStateAgent,
    secagg::SecureAggregation,
    storage::{CheckpointId, CheckpointStorage, StorageError},
};

/// The version of the checkpoint format.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Errors which can occur while saving or loading a checkpoint.
#[derive(Debug, Display, Error)]
pub enum CheckpointError {
    /// The checkpoint storage failed: {0}.
    Storage(#[from] StorageError),
    /// The checkpoint could not be encoded: {0}.
    Encoding(#[from] serde_json::Error),
    /// The checkpoint is corrupted: {0}.
    Corruption(String),
    /// The checkpoint format version {0} is not supported.
    Version(u32),
    /// No checkpoint found for {0}.
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A snapshot of an experiment after a completed round.
pub struct Checkpoint {
    pub version: u32,
    pub experiment_id: ExperimentId,
    pub researcher_id: ResearcherId,
    pub created_at: DateTime<Utc>,
    /// The number of completed rounds.
    pub round_current: RoundNumber,
    pub round_limit: RoundNumber,
    /// The global parameters before the first round.
    pub initial_params: Parameters,
    /// One record per completed round, in round order.
    pub history: Vec<RoundRecord>,
    pub node_states: NodeStateAgent,
    pub aggregator: Aggregator,
    /// The server optimizer with its state.
    #[serde(default)]
    pub optimizer: ServerOptimizer,
    pub training_args: TrainingArgs,
    #[serde(default)]
    pub model_args: BTreeMap<String, serde_json::Value>,
    /// The query the federated dataset was resolved from.
    pub query: DatasetQuery,
    /// The nodes filter of the experiment.
    #[serde(default)]
    pub nodes: Option<BTreeSet<NodeId>>,
    pub dataset: FederatedDataset,
    /// Whether the data quality of the dataset was checked.
    #[serde(default)]
    pub data_checked: bool,
    pub secagg: SecureAggregation,
    pub round_timeout: Duration,
    /// The name of the node selection strategy.
    pub selection: String,
}

/// The part of a checkpoint which is decoded first, to reject unknown formats early.
#[derive(Deserialize)]
struct Versioned {
    version: u32,
}

impl Checkpoint {
    /// Gets the handle of the checkpoint.
    pub fn id(&self) -> CheckpointId {
        CheckpointId::new(self.experiment_id.clone(), self.round_current)
    }

    /// Gets the global parameters after the last completed round.
    pub fn global_params(&self) -> &Parameters {
        self.history
            .last()
            .map(|record| &record.params)
            .unwrap_or(&self.initial_params)
    }

    /// Checks the internal consistency of the checkpoint.
    ///
    /// # Errors
    /// Fails with [`CheckpointError::Version`] for an unknown format and with
    /// [`CheckpointError::Corruption`] if the checkpoint is inconsistent.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version(self.version));
        }
        let corruption = |reason: String| Err(CheckpointError::Corruption(reason));

        if self.history.len() as u64 != self.round_current {
            return corruption(format!(
                "{} rounds completed but {} recorded",
                self.round_current,
                self.history.len()
            ));
        }
        if self.round_current > self.round_limit {
            return corruption(format!(
                "round {} exceeds the round limit {}",
                self.round_current, self.round_limit
            ));
        }
        if !self.initial_params.is_finite() {
            return corruption("the initial parameters are not finite".into());
        }
        for (expected, record) in (0..).zip(self.history.iter()) {
            if record.round_number != expected {
                return corruption(format!(
                    "round {} recorded at position {}",
                    record.round_number, expected
                ));
            }
            if let Err(error) = self.initial_params.check_shape(&record.params) {
                return corruption(format!("parameters of round {}: {}", expected, error));
            }
            if !record.params.is_finite() {
                return corruption(format!("the parameters of round {} are not finite", expected));
            }
        }
        for moment in self.optimizer.state() {
            if let Err(error) = self.initial_params.check_shape(moment) {
                return corruption(format!("state of the {} optimizer: {}", self.optimizer.name(), error));
            }
        }
        for (node_id, state) in self.node_states.iter() {
            match state.last_round {
                Some(round) if round >= self.round_current => {
                    return corruption(format!(
                        "{} took part in round {} which is not completed",
                        node_id, round
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn decode(blob: &[u8]) -> Result<Self, CheckpointError> {
        let versioned: Versioned = serde_json::from_slice(blob)
            .map_err(|error| CheckpointError::Corruption(error.to_string()))?;
        if versioned.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Version(versioned.version));
        }
        serde_json::from_slice(blob).map_err(|error| CheckpointError::Corruption(error.to_string()))
    }
}

#[derive(Debug, Clone)]
/// Saves and loads the checkpoints of experiments.
pub struct CheckpointManager<S> {
    store: S,
}

impl<S> CheckpointManager<S>
where
    S: CheckpointStorage,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Gets the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Checks that the underlying store can process requests.
    pub async fn is_ready(&mut self) -> Result<(), CheckpointError> {
        Ok(self.store.is_ready().await?)
    }

    /// Saves a checkpoint.
    ///
    /// # Errors
    /// Fails if the checkpoint is inconsistent or the storage fails. Nothing is written in the
    /// former case.
    pub async fn save(&mut self, checkpoint: &Checkpoint) -> Result<CheckpointId, CheckpointError> {
        checkpoint.validate()?;
        let id = checkpoint.id();
        let blob = checkpoint.encode()?;
        self.store.set_checkpoint(&id, &blob).await?;
        info!("checkpoint {} saved", id);
        Ok(id)
    }

    /// Loads the checkpoint of an experiment after `round` completed rounds, or the latest one.
    ///
    /// # Errors
    /// Fails if there is no such checkpoint, if the storage fails or if the checkpoint doesn't
    /// pass the validation.
    pub async fn load(
        &mut self,
        experiment_id: &ExperimentId,
        round: Option<RoundNumber>,
    ) -> Result<Checkpoint, CheckpointError> {
        let id = match round {
            Some(round) => CheckpointId::new(experiment_id.clone(), round),
            None => self
                .store
                .latest_checkpoint_id(experiment_id)
                .await?
                .ok_or_else(|| CheckpointError::NotFound(experiment_id.to_string()))?,
        };
        let blob = self
            .store
            .checkpoint(&id)
            .await?
            .ok_or_else(|| CheckpointError::NotFound(id.to_string()))?;

        let checkpoint = Checkpoint::decode(&blob)?;
        checkpoint.validate()?;
        if checkpoint.id() != id {
            return Err(CheckpointError::Corruption(format!(
                "{} stored under {}",
                checkpoint.id(),
                id
            )));
        }
        debug!("checkpoint {} loaded", id);
        Ok(checkpoint)
    }
}
