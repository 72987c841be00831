use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use uuid::Uuid;

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
    checkpoint::{Checkpoint, CheckpointManager},
    dataset::{Catalog, DatasetMetadata, DatasetQuery, FederatedDataset},
    experiment::{Experiment, ExperimentError, RoundRecord},
    node_state::NodeStateAgent,
    secagg::SecureAggregation,
    selection::NodeSelectionStrategy,
    settings::Settings,
    state_machine::{
        cancel::{cancellation, RoundCanceller},
        events::{EventPublisher, EventSubscriber, ModelUpdate},
        phases::PhaseName,
        replies::ReplyReceiver,
        RoundIo,
    },
    storage::{CheckpointStorage, FileStore, NoopStore},
    transport::Transport,
};

/// The progress of an experiment restored from a checkpoint.
struct Restored {
    round_current: RoundNumber,
    history: Vec<RoundRecord>,
    node_states: NodeStateAgent,
    dataset: FederatedDataset,
    data_checked: bool,
}

/// A builder of an [`Experiment`].
pub struct ExperimentBuilder<S = NoopStore> {
    researcher_id: ResearcherId,
    experiment_id: Option<ExperimentId>,
    catalog: Arc<dyn Catalog>,
    io: Option<(Arc<dyn Transport>, ReplyReceiver)>,
    query: Option<DatasetQuery>,
    nodes: Option<BTreeSet<NodeId>>,
    initial_params: Option<Parameters>,
    training_args: TrainingArgs,
    model_args: BTreeMap<String, serde_json::Value>,
    aggregator: Aggregator,
    optimizer: ServerOptimizer,
    strategy: NodeSelectionStrategy,
    secagg: SecureAggregation,
    round_limit: RoundNumber,
    round_timeout: Duration,
    restored: Option<Restored>,
    checkpoints: CheckpointManager<S>,
    save_checkpoints: bool,
}

impl ExperimentBuilder<NoopStore> {
    /// Creates a builder of an experiment of the `researcher_id` whose datasets are resolved
    /// from the `catalog`.
    pub fn new(researcher_id: impl Into<ResearcherId>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            researcher_id: researcher_id.into(),
            experiment_id: None,
            catalog,
            io: None,
            query: None,
            nodes: None,
            initial_params: None,
            training_args: TrainingArgs::default(),
            model_args: BTreeMap::new(),
            aggregator: Aggregator::default(),
            optimizer: ServerOptimizer::default(),
            strategy: NodeSelectionStrategy::default(),
            secagg: SecureAggregation::default(),
            round_limit: 0,
            round_timeout: Duration::from_secs(600),
            restored: None,
            checkpoints: CheckpointManager::new(NoopStore),
            save_checkpoints: false,
        }
    }

    /// Creates a builder configured by the `settings`.
    ///
    /// Checkpoints are stored in files under the configured checkpoint path and saved after every
    /// round if checkpointing is enabled. The transport and the initial parameters must still be
    /// set.
    pub fn from_settings(settings: &Settings, catalog: Arc<dyn Catalog>) -> ExperimentBuilder<FileStore> {
        let experiment = &settings.experiment;
        let mut builder = Self::new(experiment.researcher_id.as_str(), catalog)
            .with_round_limit(experiment.round_limit)
            .with_round_timeout(settings.round.timeout())
            .with_aggregator(Aggregator::from(&settings.aggregator))
            .with_optimizer(ServerOptimizer::from(&settings.optimizer))
            .with_training_args(TrainingArgs::from(&settings.training))
            .with_secure_aggregation(SecureAggregation::from(&settings.secagg))
            .with_checkpoints(
                FileStore::new(&settings.checkpoint.path),
                settings.checkpoint.enable,
            );
        if let Some(experiment_id) = &experiment.experiment_id {
            builder = builder.with_experiment_id(experiment_id.as_str());
        }
        if !experiment.tags.is_empty() {
            builder = builder.with_tags(experiment.tags.iter().cloned());
        }
        if !experiment.nodes.is_empty() {
            builder = builder.with_nodes(experiment.nodes.iter().map(|node| NodeId::new(node.as_str())));
        }
        builder
    }
}

impl<S> ExperimentBuilder<S>
where
    S: CheckpointStorage,
{
    pub fn with_experiment_id(mut self, experiment_id: impl Into<ExperimentId>) -> Self {
        self.experiment_id = Some(experiment_id.into());
        self
    }

    /// Sets the transport to the nodes and the receiver of their replies.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>, replies: ReplyReceiver) -> Self {
        self.io = Some((transport, replies));
        self
    }

    /// Selects the training data by tags.
    pub fn with_tags<T>(mut self, tags: impl IntoIterator<Item = T>) -> Self
    where
        T: Into<String>,
    {
        self.query = Some(DatasetQuery::Tags(tags.into_iter().map(Into::into).collect()));
        self
    }

    /// Selects the training data explicitly.
    pub fn with_training_data(mut self, data: BTreeMap<NodeId, DatasetMetadata>) -> Self {
        self.query = Some(DatasetQuery::Explicit(data));
        self
    }

    /// Restricts the federation to the `nodes`.
    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.nodes = Some(nodes.into_iter().collect());
        self
    }

    /// Sets the global parameters the first round starts from.
    pub fn with_initial_params(mut self, params: Parameters) -> Self {
        self.initial_params = Some(params);
        self
    }

    pub fn with_training_args(mut self, training_args: TrainingArgs) -> Self {
        self.training_args = training_args;
        self
    }

    pub fn with_model_args(mut self, model_args: BTreeMap<String, serde_json::Value>) -> Self {
        self.model_args = model_args;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Sets the optimizer applied to the aggregated parameters of every round.
    pub fn with_optimizer(mut self, optimizer: ServerOptimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_strategy(mut self, strategy: NodeSelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_secure_aggregation(mut self, secagg: SecureAggregation) -> Self {
        self.secagg = secagg;
        self
    }

    pub fn with_round_limit(mut self, round_limit: RoundNumber) -> Self {
        self.round_limit = round_limit;
        self
    }

    pub fn with_round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    /// Sets the checkpoint store. If `save_every_round` is set, a checkpoint is saved after
    /// every completed round.
    pub fn with_checkpoints<T>(self, store: T, save_every_round: bool) -> ExperimentBuilder<T>
    where
        T: CheckpointStorage,
    {
        ExperimentBuilder {
            researcher_id: self.researcher_id,
            experiment_id: self.experiment_id,
            catalog: self.catalog,
            io: self.io,
            query: self.query,
            nodes: self.nodes,
            initial_params: self.initial_params,
            training_args: self.training_args,
            model_args: self.model_args,
            aggregator: self.aggregator,
            optimizer: self.optimizer,
            strategy: self.strategy,
            secagg: self.secagg,
            round_limit: self.round_limit,
            round_timeout: self.round_timeout,
            restored: self.restored,
            checkpoints: CheckpointManager::new(store),
            save_checkpoints: save_every_round,
        }
    }

    /// Resumes the experiment of a checkpoint.
    ///
    /// Everything but the transport, the checkpoint store and the node selection strategy is
    /// taken from the checkpoint. A custom strategy must be set again.
    ///
    /// # Errors
    /// Fails if the checkpoint is inconsistent.
    pub fn restore(mut self, checkpoint: Checkpoint) -> Result<Self, ExperimentError> {
        checkpoint.validate()?;
        if checkpoint.selection != NodeSelectionStrategy::AllAvailable.name() {
            warn!(
                "the node selection strategy {} can't be restored, falling back to {}",
                checkpoint.selection,
                NodeSelectionStrategy::AllAvailable.name()
            );
        }
        info!(
            "restoring experiment {} after {} completed rounds",
            checkpoint.experiment_id, checkpoint.round_current
        );

        let mut secagg = checkpoint.secagg;
        // the nodes may have dropped the session meanwhile
        secagg.clear();

        self.researcher_id = checkpoint.researcher_id;
        self.experiment_id = Some(checkpoint.experiment_id);
        self.query = Some(checkpoint.query);
        self.nodes = checkpoint.nodes;
        self.initial_params = Some(checkpoint.initial_params);
        self.training_args = checkpoint.training_args;
        self.model_args = checkpoint.model_args;
        self.aggregator = checkpoint.aggregator;
        self.optimizer = checkpoint.optimizer;
        self.strategy = NodeSelectionStrategy::AllAvailable;
        self.secagg = secagg;
        self.round_limit = checkpoint.round_limit;
        self.round_timeout = checkpoint.round_timeout;
        self.restored = Some(Restored {
            round_current: checkpoint.round_current,
            history: checkpoint.history,
            node_states: checkpoint.node_states,
            dataset: checkpoint.dataset,
            data_checked: checkpoint.data_checked,
        });
        Ok(self)
    }

    /// Resumes the experiment from a stored checkpoint, after `round` completed rounds or from
    /// the latest checkpoint. See [`restore()`].
    ///
    /// [`restore()`]: ExperimentBuilder::restore
    pub async fn load_checkpoint(
        mut self,
        experiment_id: &ExperimentId,
        round: Option<RoundNumber>,
    ) -> Result<Self, ExperimentError> {
        let checkpoint = self.checkpoints.load(experiment_id, round).await?;
        self.restore(checkpoint)
    }

    /// Builds the experiment.
    ///
    /// Returns the experiment, a subscriber to its events and a handle to cancel its running
    /// round.
    ///
    /// # Errors
    /// Fails if the configuration is incomplete or invalid, or if the dataset can't be resolved.
    /// Nothing is sent to the nodes in that case.
    pub async fn build(
        mut self,
    ) -> Result<(Experiment<S>, EventSubscriber, RoundCanceller), ExperimentError> {
        let (transport, replies) = self
            .io
            .ok_or_else(|| ExperimentError::Configuration("no transport to the nodes".into()))?;
        let query = self
            .query
            .ok_or_else(|| ExperimentError::Configuration("no training data selected".into()))?;
        let initial_params = self
            .initial_params
            .ok_or_else(|| ExperimentError::Configuration("no initial parameters".into()))?;
        if initial_params.has_no_layers() || !initial_params.is_finite() {
            return Err(ExperimentError::Configuration(
                "the initial parameters are empty or not finite".into(),
            ));
        }
        if self.round_timeout == Duration::from_secs(0) {
            return Err(ExperimentError::Configuration("the round timeout is zero".into()));
        }
        self.aggregator
            .check_preconditions(&self.training_args, self.secagg.is_enabled())?;
        self.optimizer.check_preconditions()?;

        let restored = match self.restored {
            Some(restored) => restored,
            None => Restored {
                round_current: 0,
                history: Vec::new(),
                node_states: NodeStateAgent::new(),
                dataset: FederatedDataset::resolve(self.catalog.as_ref(), &query, self.nodes.as_ref())
                    .await?,
                data_checked: false,
            },
        };
        if restored.round_current > self.round_limit {
            return Err(ExperimentError::Configuration(format!(
                "round limit {} is below the {} completed rounds",
                self.round_limit, restored.round_current
            )));
        }
        if self.save_checkpoints {
            self.checkpoints.is_ready().await?;
        }

        let global = Arc::new(
            restored
                .history
                .last()
                .map(|record| record.params.clone())
                .unwrap_or_else(|| initial_params.clone()),
        );
        let model = if restored.history.is_empty() {
            ModelUpdate::Invalidate
        } else {
            ModelUpdate::New(global.clone())
        };
        let (events, subscriber) =
            EventPublisher::init(restored.round_current, PhaseName::Created, model);
        let (canceller, cancel) = cancellation();

        let experiment_id = self
            .experiment_id
            .unwrap_or_else(|| ExperimentId::new(Uuid::new_v4().to_string()));
        info!(
            "experiment {} with {} nodes, {} of {} rounds completed",
            experiment_id,
            restored.dataset.len(),
            restored.round_current,
            self.round_limit
        );

        let experiment = Experiment {
            researcher_id: self.researcher_id,
            experiment_id,
            catalog: self.catalog,
            query,
            nodes: self.nodes,
            dataset: restored.dataset,
            data_checked: restored.data_checked,
            training_args: self.training_args,
            model_args: self.model_args,
            aggregator: self.aggregator,
            optimizer: self.optimizer,
            strategy: self.strategy,
            node_states: restored.node_states,
            secagg: self.secagg,
            round_current: restored.round_current,
            round_limit: self.round_limit,
            round_timeout: self.round_timeout,
            initial_params,
            global,
            history: restored.history,
            io: Some(RoundIo {
                transport,
                replies,
                events,
                cancel,
            }),
            checkpoints: self.checkpoints,
            save_checkpoints: self.save_checkpoints,
        };
        Ok((experiment, subscriber, canceller))
    }
}
