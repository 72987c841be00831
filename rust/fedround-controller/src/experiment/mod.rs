//! The experiment controller.
//!
//! An [`Experiment`] drives the rounds of a federated training. It owns the global parameters,
//! the node states and the aggregator, and it is the only one to change them: a round works on
//! copies and hands back a [`CompletedRound`], which the experiment commits at once. A failed
//! round commits nothing, so the experiment always reflects its last completed round.
//!
//! Rounds run strictly one after the other. Each round:
//!
//! 1. checks the data quality of a freshly resolved dataset,
//! 2. selects the participants,
//! 3. establishes a secure aggregation session if secure aggregation is enabled,
//! 4. runs the round [`StateMachine`],
//! 5. commits the completed round and saves a checkpoint if enabled.
//!
//! Experiments are created with an [`ExperimentBuilder`], either from scratch or from a
//! [`Checkpoint`].
//!
//! [`CompletedRound`]: crate::state_machine::round::CompletedRound

pub mod builder;
pub mod history;


use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use displaydoc::Display;
use thiserror::Error;
use tracing_futures::Instrument;

use fedround_core::{
    message::TrainingArgs,
    model::Parameters,
    ExperimentId,
    NodeId,
    ResearcherId,
    RoundNumber,
};

pub use self::{builder::ExperimentBuilder, history::RoundRecord};
use crate::{
    aggregation::{AggregationError, Aggregator, PreconditionError, ServerOptimizer},
    checkpoint::{Checkpoint, CheckpointError, CheckpointManager, CHECKPOINT_VERSION},
    dataset::{Catalog, DatasetError, DatasetMetadata, DatasetQuery, FederatedDataset},
    node_state::NodeStateAgent,
    secagg::SecureAggregation,
    selection::{NodeSelectionStrategy, SelectionError},
    state_machine::{
        phases::RoundError,
        round::{CompletedRound, Participant, RoundContext},
        RoundIo,
        StateMachine,
    },
    storage::{CheckpointId, CheckpointStorage, NoopStore},
};

/// Errors of an experiment.
#[derive(Debug, Display, Error)]
pub enum ExperimentError {
    /// Round {0} failed: {1}.
    Round(RoundNumber, RoundError),
    /// The selection of the participants failed: {0}.
    Selection(#[from] SelectionError),
    /// The training data is invalid: {0}.
    Dataset(#[from] DatasetError),
    /// The configuration doesn't meet the preconditions of the aggregator: {0}.
    Precondition(#[from] PreconditionError),
    /// Checkpointing failed: {0}.
    Checkpoint(#[from] CheckpointError),
    /// Invalid configuration: {0}.
    Configuration(String),
    /// A previous round was interrupted and the connection to the nodes was lost.
    Interrupted,
}

impl ExperimentError {
    fn round(round_number: RoundNumber, error: impl Into<RoundError>) -> Self {
        ExperimentError::Round(round_number, error.into())
    }
}

#[derive(Debug)]
/// The report of a [`Experiment::run()`].
pub struct RunReport {
    /// The number of rounds that completed.
    pub rounds_executed: u64,
    /// Whether the experiment reached its round limit.
    pub limit_reached: bool,
    /// The error which stopped the run early, if any.
    pub failure: Option<ExperimentError>,
}

/// A federated training experiment.
pub struct Experiment<S = NoopStore> {
    researcher_id: ResearcherId,
    experiment_id: ExperimentId,

    catalog: Arc<dyn Catalog>,
    query: DatasetQuery,
    nodes: Option<BTreeSet<NodeId>>,
    dataset: FederatedDataset,
    data_checked: bool,

    training_args: TrainingArgs,
    model_args: BTreeMap<String, serde_json::Value>,
    aggregator: Aggregator,
    optimizer: ServerOptimizer,
    strategy: NodeSelectionStrategy,
    node_states: NodeStateAgent,
    secagg: SecureAggregation,

    round_current: RoundNumber,
    round_limit: RoundNumber,
    round_timeout: Duration,
    initial_params: Parameters,
    global: Arc<Parameters>,
    history: Vec<RoundRecord>,

    /// The I/O interfaces, lent to the running round.
    io: Option<RoundIo>,
    checkpoints: CheckpointManager<S>,
    save_checkpoints: bool,
}

impl<S> Experiment<S>
where
    S: CheckpointStorage,
{
    pub fn experiment_id(&self) -> &ExperimentId {
        &self.experiment_id
    }

    pub fn researcher_id(&self) -> &ResearcherId {
        &self.researcher_id
    }

    /// Gets the number of completed rounds, which is also the number of the next round.
    pub fn round_current(&self) -> RoundNumber {
        self.round_current
    }

    pub fn round_limit(&self) -> RoundNumber {
        self.round_limit
    }

    /// Gets the global parameters of the last completed round.
    pub fn global_params(&self) -> &Parameters {
        &self.global
    }

    /// Gets the records of the completed rounds.
    pub fn history(&self) -> &[RoundRecord] {
        &self.history
    }

    pub fn dataset(&self) -> &FederatedDataset {
        &self.dataset
    }

    pub fn node_states(&self) -> &NodeStateAgent {
        &self.node_states
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn optimizer(&self) -> &ServerOptimizer {
        &self.optimizer
    }

    pub fn training_args(&self) -> &TrainingArgs {
        &self.training_args
    }

    pub fn secure_aggregation(&self) -> &SecureAggregation {
        &self.secagg
    }

    pub fn strategy(&self) -> &NodeSelectionStrategy {
        &self.strategy
    }

    /// Selects the training data by tags and resolves it anew.
    ///
    /// Explicit training data is dropped.
    ///
    /// # Errors
    /// Fails if the dataset can't be resolved. The experiment is left unchanged in that case.
    pub async fn set_tags<T>(&mut self, tags: impl IntoIterator<Item = T>) -> Result<(), ExperimentError>
    where
        T: Into<String>,
    {
        let query = DatasetQuery::Tags(tags.into_iter().map(Into::into).collect());
        self.resolve(query, self.nodes.clone()).await
    }

    /// Restricts the federation to the `nodes`, or lifts the restriction, and resolves the
    /// dataset anew.
    ///
    /// # Errors
    /// Fails if the dataset can't be resolved. The experiment is left unchanged in that case.
    pub async fn set_nodes(&mut self, nodes: Option<BTreeSet<NodeId>>) -> Result<(), ExperimentError> {
        self.resolve(self.query.clone(), nodes).await
    }

    /// Replaces the training data by an explicit mapping from nodes to their datasets.
    ///
    /// The tags are dropped.
    ///
    /// # Errors
    /// Fails if the mapping is empty. The experiment is left unchanged in that case.
    pub async fn set_training_data(
        &mut self,
        data: BTreeMap<NodeId, DatasetMetadata>,
    ) -> Result<(), ExperimentError> {
        self.resolve(DatasetQuery::Explicit(data), self.nodes.clone())
            .await
    }

    async fn resolve(
        &mut self,
        query: DatasetQuery,
        nodes: Option<BTreeSet<NodeId>>,
    ) -> Result<(), ExperimentError> {
        let dataset = FederatedDataset::resolve(self.catalog.as_ref(), &query, nodes.as_ref()).await?;
        info!("training data resolved: {} nodes", dataset.len());

        self.node_states.retain(|node_id| dataset.contains(node_id));
        self.secagg.clear();
        self.query = query;
        self.nodes = nodes;
        self.dataset = dataset;
        self.data_checked = false;
        Ok(())
    }

    /// Marks a node as available or unavailable for the next rounds.
    ///
    /// # Errors
    /// Fails if the node is not part of the federated dataset.
    pub fn set_node_availability(&mut self, node_id: &NodeId, available: bool) -> Result<(), ExperimentError> {
        if !self.dataset.contains(node_id) {
            return Err(ExperimentError::Configuration(format!(
                "{} is not part of the federated dataset",
                node_id
            )));
        }
        self.dataset = self.dataset.with_availability(node_id, available);
        Ok(())
    }

    /// Sets the round limit.
    ///
    /// # Errors
    /// Fails if the limit is below the number of completed rounds.
    pub fn set_round_limit(&mut self, round_limit: RoundNumber) -> Result<(), ExperimentError> {
        if round_limit < self.round_current {
            return Err(ExperimentError::Configuration(format!(
                "round limit {} is below the {} completed rounds",
                round_limit, self.round_current
            )));
        }
        self.round_limit = round_limit;
        Ok(())
    }

    /// Sets the round timeout.
    pub fn set_round_timeout(&mut self, timeout: Duration) -> Result<(), ExperimentError> {
        if timeout == Duration::from_secs(0) {
            return Err(ExperimentError::Configuration("the round timeout is zero".into()));
        }
        self.round_timeout = timeout;
        Ok(())
    }

    /// Sets the training arguments.
    ///
    /// # Errors
    /// Fails if the arguments don't meet the preconditions of the aggregator.
    pub fn set_training_args(&mut self, training_args: TrainingArgs) -> Result<(), ExperimentError> {
        self.aggregator
            .check_preconditions(&training_args, self.secagg.is_enabled())?;
        self.training_args = training_args;
        Ok(())
    }

    pub fn set_model_args(&mut self, model_args: BTreeMap<String, serde_json::Value>) {
        self.model_args = model_args;
    }

    /// Replaces the aggregator.
    ///
    /// # Errors
    /// Fails if the configuration doesn't meet the preconditions of the aggregator.
    pub fn set_aggregator(&mut self, aggregator: Aggregator) -> Result<(), ExperimentError> {
        aggregator.check_preconditions(&self.training_args, self.secagg.is_enabled())?;
        self.aggregator = aggregator;
        Ok(())
    }

    /// Replaces the server optimizer. The state of the previous optimizer is dropped.
    ///
    /// # Errors
    /// Fails if the hyperparameters of the optimizer are invalid.
    pub fn set_optimizer(&mut self, optimizer: ServerOptimizer) -> Result<(), ExperimentError> {
        optimizer.check_preconditions()?;
        self.optimizer = optimizer;
        Ok(())
    }

    pub fn set_strategy(&mut self, strategy: NodeSelectionStrategy) {
        self.strategy = strategy;
    }

    /// Enables or disables secure aggregation.
    ///
    /// # Errors
    /// Fails if the aggregator can't be combined with secure aggregation.
    pub fn set_secure_aggregation(&mut self, enabled: bool) -> Result<(), ExperimentError> {
        self.aggregator
            .check_preconditions(&self.training_args, enabled)?;
        self.secagg.set_enabled(enabled);
        Ok(())
    }

    /// Runs up to `rounds` rounds.
    ///
    /// The rounds stop at the round limit, unless `increase` is set, in which case the limit is
    /// raised to make room for all of them. The run stops at the first round that fails, leaving
    /// the experiment at its last completed round.
    pub async fn run(&mut self, rounds: u64, increase: bool) -> RunReport {
        let left = self.round_limit.saturating_sub(self.round_current);
        if rounds > left {
            if increase {
                self.round_limit = self.round_current + rounds;
                info!("round limit increased to {}", self.round_limit);
            } else {
                warn!(
                    "only {} of the {} requested rounds are left before the round limit",
                    left, rounds
                );
            }
        }
        let to_run = rounds.min(self.round_limit.saturating_sub(self.round_current));

        let mut report = RunReport {
            rounds_executed: 0,
            limit_reached: false,
            failure: None,
        };
        for _ in 0..to_run {
            match self.run_round().await {
                Ok(_) => report.rounds_executed += 1,
                Err(error) => {
                    error!("stopping the experiment: {}", error);
                    report.failure = Some(error);
                    break;
                }
            }
        }
        report.limit_reached = self.round_current >= self.round_limit;
        info!(
            "{} rounds executed, {} of {} rounds completed",
            report.rounds_executed, self.round_current, self.round_limit
        );
        report
    }

    /// Runs a single round.
    pub async fn run_once(&mut self, increase: bool) -> RunReport {
        self.run(1, increase).await
    }

    async fn run_round(&mut self) -> Result<RoundNumber, ExperimentError> {
        let round_number = self.round_current;
        let span = info_span!("round", round_number);
        async move {
            let completed = self.execute_round(round_number).await?;
            self.commit(completed);
            info!("round completed");
            if self.save_checkpoints {
                self.save_checkpoint().await?;
            }
            Ok(round_number)
        }
        .instrument(span)
        .await
    }

    async fn execute_round(&mut self, round_number: RoundNumber) -> Result<CompletedRound, ExperimentError> {
        if !self.data_checked {
            self.dataset.check_data_quality()?;
            self.data_checked = true;
        }
        let selected = self
            .strategy
            .select(round_number, &self.dataset, &self.node_states)?;

        let mut io = self.io.take().ok_or(ExperimentError::Interrupted)?;
        let round = match self.prepare_round(round_number, &selected, &mut io).await {
            Ok(round) => round,
            Err(error) => {
                self.io = Some(io);
                return Err(error);
            }
        };

        let outcome = StateMachine::new(round, io).run().await;
        self.io = Some(outcome.io);
        outcome
            .result
            .map_err(|error| ExperimentError::round(round_number, error))
    }

    async fn prepare_round(
        &mut self,
        round_number: RoundNumber,
        selected: &BTreeSet<NodeId>,
        io: &mut RoundIo,
    ) -> Result<RoundContext, ExperimentError> {
        let secagg = if self.secagg.is_enabled() {
            let session = self
                .secagg
                .setup(
                    &self.researcher_id,
                    &self.experiment_id,
                    selected,
                    io.transport.as_ref(),
                    &mut io.replies,
                )
                .await
                .map_err(|error| ExperimentError::round(round_number, error))?;
            Some(self.secagg.round(session, rand::random::<f64>()))
        } else {
            None
        };

        let mut participants = BTreeMap::new();
        for node_id in selected {
            let record = self
                .dataset
                .get(node_id)
                .ok_or_else(|| SelectionError::InvalidSelection(node_id.clone()))?;
            let aux_vars = self
                .aggregator
                .aux_vars_for(node_id, &self.node_states, &self.global)
                .map_err(|error: AggregationError| ExperimentError::round(round_number, error))?;
            participants.insert(
                node_id.clone(),
                Participant {
                    dataset_id: record.dataset_id.clone(),
                    state_id: self.node_states.expected_state_id(node_id),
                    aux_vars,
                },
            );
        }

        Ok(RoundContext {
            researcher_id: self.researcher_id.clone(),
            experiment_id: self.experiment_id.clone(),
            round_number,
            request_id: rand::random(),
            participants,
            global: self.global.clone(),
            training_args: self.training_args.clone(),
            model_args: self.model_args.clone(),
            aggregator: self.aggregator.clone(),
            optimizer: self.optimizer.clone(),
            node_states: self.node_states.clone(),
            federation_size: self.dataset.len(),
            timeout: self.round_timeout,
            secagg,
        })
    }

    fn commit(&mut self, completed: CompletedRound) {
        let record = RoundRecord::new(&completed);
        let CompletedRound {
            round_number,
            aggregated,
            optimizer,
            state_ids,
            ..
        } = completed;

        for (node_id, state_id) in state_ids {
            let mut state = aggregated
                .node_states
                .get(&node_id)
                .cloned()
                .unwrap_or_else(|| self.node_states.state_for(&node_id));
            state.state_id = state_id;
            state.last_round = Some(round_number);
            self.node_states.update(node_id, state);
        }
        self.aggregator = aggregated.aggregator;
        self.optimizer = optimizer;
        self.global = Arc::new(aggregated.global);
        self.history.push(record);
        self.round_current += 1;
    }

    /// Takes a snapshot of the experiment.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            experiment_id: self.experiment_id.clone(),
            researcher_id: self.researcher_id.clone(),
            created_at: Utc::now(),
            round_current: self.round_current,
            round_limit: self.round_limit,
            initial_params: self.initial_params.clone(),
            history: self.history.clone(),
            node_states: self.node_states.clone(),
            aggregator: self.aggregator.clone(),
            optimizer: self.optimizer.clone(),
            training_args: self.training_args.clone(),
            model_args: self.model_args.clone(),
            query: self.query.clone(),
            nodes: self.nodes.clone(),
            dataset: self.dataset.clone(),
            data_checked: self.data_checked,
            secagg: self.secagg.clone(),
            round_timeout: self.round_timeout,
            selection: self.strategy.name().to_string(),
        }
    }

    /// Saves a checkpoint of the last completed round.
    pub async fn save_checkpoint(&mut self) -> Result<CheckpointId, ExperimentError> {
        let checkpoint = self.checkpoint();
        Ok(self.checkpoints.save(&checkpoint).await?)
    }
}
