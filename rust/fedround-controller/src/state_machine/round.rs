//! The inputs and outputs of a single round.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use fedround_core::{
    message::{AuxVars, Metrics, Request, Timing, TrainingArgs, WorkRequest},
    model::Parameters,
    ExperimentId,
    NodeId,
    ResearcherId,
    RoundNumber,
    StateId,
};

use crate::{
    aggregation::{Aggregated, Aggregator, ServerOptimizer},
    node_state::NodeStateAgent,
    secagg::SecaggRound,
};

#[derive(Debug, Clone, PartialEq)]
/// A node selected for a round.
pub struct Participant {
    /// The dataset the node trains on.
    pub dataset_id: String,
    /// The state the node must continue from.
    pub state_id: StateId,
    /// The auxiliary variables of the aggregator for this node.
    pub aux_vars: AuxVars,
}

#[derive(Debug, Clone)]
/// Everything a round needs to know, fixed when the round is created.
pub struct RoundContext {
    pub researcher_id: ResearcherId,
    pub experiment_id: ExperimentId,
    pub round_number: RoundNumber,
    /// Identifies this attempt of the round. Replies to any other attempt are discarded.
    pub request_id: u64,
    /// The selected nodes.
    pub participants: BTreeMap<NodeId, Participant>,
    /// The global parameters the participants start from.
    pub global: Arc<Parameters>,
    pub training_args: TrainingArgs,
    pub model_args: BTreeMap<String, serde_json::Value>,
    /// The aggregator of the round. The round works on its own copy.
    pub aggregator: Aggregator,
    /// The server optimizer of the round. The round works on its own copy.
    pub optimizer: ServerOptimizer,
    /// A snapshot of the node states when the round was created.
    pub node_states: NodeStateAgent,
    /// The number of nodes of the federated dataset.
    pub federation_size: usize,
    /// The maximal time to wait for the replies once the requests are sent.
    pub timeout: Duration,
    /// The secure aggregation parameters, if the round is securely aggregated.
    pub secagg: Option<SecaggRound>,
}

impl RoundContext {
    /// Builds the work request of every participant, in ascending node order.
    pub fn requests(&self) -> Vec<Request> {
        let secagg = self.secagg.as_ref().map(SecaggRound::arguments);
        self.participants
            .iter()
            .map(|(node_id, participant)| {
                Request::Train(WorkRequest {
                    researcher_id: self.researcher_id.clone(),
                    experiment_id: self.experiment_id.clone(),
                    round_number: self.round_number,
                    request_id: self.request_id,
                    node_id: node_id.clone(),
                    dataset_id: participant.dataset_id.clone(),
                    state_id: participant.state_id,
                    params: self.global.as_ref().clone(),
                    training_args: self.training_args.clone(),
                    model_args: self.model_args.clone(),
                    aux_vars: participant.aux_vars.clone(),
                    secagg: secagg.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A summary of the reply of a participant.
pub struct ReplySummary {
    pub sample_count: u64,
    /// The timing reported by the node.
    pub timing: Timing,
    /// The time in seconds from sending the request until the reply arrived.
    pub rtime_total: f64,
    /// The training metrics reported by the node.
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq)]
/// The result of a round that completed.
pub struct CompletedRound {
    pub round_number: RoundNumber,
    /// The aggregation result, with the global parameters after the server optimizer step.
    pub aggregated: Aggregated,
    /// The successor state of the server optimizer.
    pub optimizer: ServerOptimizer,
    pub participants: BTreeMap<NodeId, ReplySummary>,
    /// The state every participant produced in this round.
    pub state_ids: BTreeMap<NodeId, StateId>,
}
