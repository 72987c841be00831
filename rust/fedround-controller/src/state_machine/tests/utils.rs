use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use tracing_subscriber::*;

use fedround_core::{
    message::{AuxVars, Request, TrainingArgs, WorkReply, WorkRequest},
    testutils,
    ExperimentId,
    NodeId,
    ResearcherId,
    RoundNumber,
    StateId,
};

use crate::{
    aggregation::{Aggregator, ServerOptimizer},
    node_state::NodeStateAgent,
    state_machine::round::{Participant, RoundContext},
    transport::{Transport, TransportError},
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

/// Creates the context of round 0 of the test experiment.
pub fn round_context(nodes: &[&str], timeout: Duration) -> RoundContext {
    let participants = nodes
        .iter()
        .map(|node| {
            let participant = Participant {
                dataset_id: format!("dataset-{}", node),
                state_id: StateId::INITIAL,
                aux_vars: AuxVars::new(),
            };
            (NodeId::from(*node), participant)
        })
        .collect();
    RoundContext {
        researcher_id: ResearcherId::from("researcher-0"),
        experiment_id: ExperimentId::from(testutils::EXPERIMENT_ID),
        round_number: 0,
        request_id: 0,
        participants,
        global: Arc::new(testutils::parameters(0.0)),
        training_args: TrainingArgs::default(),
        model_args: BTreeMap::new(),
        aggregator: Aggregator::default(),
        optimizer: ServerOptimizer::default(),
        node_states: NodeStateAgent::new(),
        federation_size: nodes.len(),
        timeout,
        secagg: None,
    }
}

/// Creates the request a participant of [`round_context()`] receives.
pub fn request_for(node: &str, round_number: RoundNumber) -> WorkRequest {
    testutils::work_request(node, round_number)
}

/// Creates a successful reply of a participant of [`round_context()`].
pub fn reply_for(node: &str, round_number: RoundNumber, value: f64, sample_count: u64) -> WorkReply {
    testutils::work_reply(node, round_number, value, sample_count)
}

/// A transport which records the requests without delivering them.
#[derive(Debug, Default, Clone)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<Request>>>,
    pub unreachable: BTreeSet<NodeId>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: Request) -> Result<(), TransportError> {
        if self.unreachable.contains(request.node_id()) {
            return Err(anyhow!("{} is unreachable", request.node_id()));
        }
        self.sent.lock().unwrap().push(request);
        Ok(())
    }
}
