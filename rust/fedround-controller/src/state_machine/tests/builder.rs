use std::{collections::BTreeMap, sync::Arc, time::Duration};

use fedround_core::{model::Parameters, NodeId};

use crate::{
    aggregation::{Aggregated, Aggregator, ServerOptimizer},
    secagg::SecaggRound,
    state_machine::{
        cancel::{cancellation, RoundCanceller},
        events::{EventPublisher, EventSubscriber, ModelUpdate},
        phases::{Complete, Failure, PhaseName, PhaseState, RoundError, Shared},
        replies::{ReplyReceiver, ReplySender},
        round::CompletedRound,
        tests::utils::{self, RecordingTransport},
        RoundIo,
        StateMachine,
    },
};

enum Start {
    Created,
    Failure(RoundError),
    Complete(Parameters),
}

pub struct StateMachineBuilder {
    nodes: Vec<String>,
    timeout: Duration,
    transport: RecordingTransport,
    secagg: Option<SecaggRound>,
    start: Start,
}

impl StateMachineBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            timeout: Duration::from_secs(5),
            transport: RecordingTransport::default(),
            secagg: None,
            start: Start::Created,
        }
    }

    pub fn with_nodes(mut self, nodes: &[&str]) -> Self {
        self.nodes = nodes.iter().map(|node| node.to_string()).collect();
        self
    }

    pub fn with_unreachable(mut self, nodes: &[&str]) -> Self {
        self.transport.unreachable = nodes.iter().map(|node| NodeId::from(*node)).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[allow(dead_code)]
    pub fn with_secagg(mut self, secagg: SecaggRound) -> Self {
        self.secagg = Some(secagg);
        self
    }

    pub fn with_failure(mut self, error: RoundError) -> Self {
        self.start = Start::Failure(error);
        self
    }

    pub fn with_completed(mut self, global: Parameters) -> Self {
        self.start = Start::Complete(global);
        self
    }

    pub fn build(self) -> (StateMachine, ReplySender, EventSubscriber) {
        let (state_machine, reply_tx, events, _) = self.build_with_canceller();
        (state_machine, reply_tx, events)
    }

    pub fn build_with_canceller(
        self,
    ) -> (StateMachine, ReplySender, EventSubscriber, RoundCanceller) {
        let Self {
            nodes,
            timeout,
            transport,
            secagg,
            start,
        } = self;

        let nodes: Vec<&str> = nodes.iter().map(String::as_str).collect();
        let mut round = utils::round_context(&nodes, timeout);
        round.secagg = secagg;

        let (replies, reply_tx) = ReplyReceiver::new();
        let (events, subscriber) =
            EventPublisher::init(round.round_number, PhaseName::Created, ModelUpdate::Invalidate);
        let (canceller, cancel) = cancellation();
        let io = RoundIo {
            transport: Arc::new(transport),
            replies,
            events,
            cancel: cancel.arm(),
        };

        let state_machine = match start {
            Start::Created => StateMachine::new(round, io),
            Start::Failure(error) => PhaseState::<Failure>::new(Shared::new(round, io), error).into(),
            Start::Complete(global) => {
                let completed = CompletedRound {
                    round_number: round.round_number,
                    aggregated: Aggregated {
                        global,
                        node_states: BTreeMap::new(),
                        aggregator: Aggregator::default(),
                    },
                    optimizer: ServerOptimizer::default(),
                    participants: BTreeMap::new(),
                    state_ids: BTreeMap::new(),
                };
                PhaseState::<Complete>::new(Shared::new(round, io), completed).into()
            }
        };
        (state_machine, reply_tx, subscriber, canceller)
    }
}
