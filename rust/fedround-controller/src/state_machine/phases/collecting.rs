use std::collections::BTreeMap;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use fedround_core::{
    message::{NodeErrorKind, Reply, ReplyParams, WorkReply},
    NodeId,
    StateId,
};

use crate::{
    aggregation::{AggregationInput, NodeUpdate},
    secagg::SecureAggregationError,
    state_machine::{
        phases::{Complete, Failure, Phase, PhaseName, PhaseState, RoundError, Shared},
        round::{CompletedRound, ReplySummary},
        Step,
    },
};

/// A counter to keep track of handled replies.
#[derive(Debug)]
struct Counter {
    /// The number of replies expected.
    expected: usize,
    /// The number of replies accepted.
    accepted: usize,
    /// The number of replies discarded without being processed.
    discarded: usize,
}

impl Counter {
    /// Creates a new reply counter.
    fn new(expected: usize) -> Self {
        Self {
            expected,
            accepted: 0,
            discarded: 0,
        }
    }

    /// Increments the counter for accepted replies.
    fn increment_accepted(&mut self) {
        self.accepted += 1;
        debug!("{} of {} replies accepted", self.accepted, self.expected);
    }

    /// Increments the counter for discarded replies.
    fn increment_discarded(&mut self) {
        self.discarded += 1;
        debug!("{} replies discarded", self.discarded);
    }
}

/// The collecting state.
#[derive(Debug)]
pub struct Collecting {
    /// The time at which the requests were sent.
    sent_at: Instant,
    /// The participants which did not reply yet, with the state they continue from.
    pending: BTreeMap<NodeId, StateId>,
    /// The accepted replies, with the time they arrived after the requests were sent.
    received: BTreeMap<NodeId, (WorkReply, f64)>,
    /// The result of the round, once aggregated.
    completed: Option<CompletedRound>,
}

#[async_trait]
impl Phase for PhaseState<Collecting> {
    const NAME: PhaseName = PhaseName::Collecting;

    async fn process(&mut self) -> Result<(), RoundError> {
        let mut counter = Counter::new(self.private.pending.len());
        let deadline = sleep_until(self.private.sent_at + self.shared.round.timeout);
        tokio::pin!(deadline);
        let mut cancel = self.shared.io.cancel.clone();

        info!("collecting {} replies", counter.expected);
        while !self.private.pending.is_empty() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    warn!("round cancelled while collecting replies");
                    return Err(RoundError::Cancelled);
                }
                _ = &mut deadline => {
                    let missing: Vec<NodeId> = self.private.pending.keys().cloned().collect();
                    warn!("{} nodes did not reply in time", missing.len());
                    // the masks of a secure round only cancel over all parties
                    if self.shared.round.secagg.is_some() {
                        return Err(SecureAggregationError::QuorumNotMet(missing).into());
                    }
                    return Err(RoundError::NodeTimeout(missing));
                }
                next = self.next_reply() => {
                    let reply = next?;
                    self.handle_reply(reply, &mut counter)?;
                }
            }
        }
        info!(
            "in total {} replies accepted and {} discarded",
            counter.accepted, counter.discarded,
        );

        self.private.completed = Some(self.aggregate()?);
        Ok(())
    }

    async fn next(self) -> Step {
        match self.private.completed {
            Some(completed) => {
                Step::Next(PhaseState::<Complete>::new(self.shared, completed).into())
            }
            // `process` always aggregates before it succeeds
            None => Step::Next(
                PhaseState::<Failure>::new(self.shared, RoundError::ReplyChannel).into(),
            ),
        }
    }
}

impl PhaseState<Collecting> {
    /// Creates a new collecting state, for requests sent at `sent_at`.
    pub fn new(shared: Shared, sent_at: Instant) -> Self {
        let pending = shared
            .round
            .participants
            .iter()
            .map(|(node_id, participant)| (node_id.clone(), participant.state_id))
            .collect();
        Self {
            private: Collecting {
                sent_at,
                pending,
                received: BTreeMap::new(),
                completed: None,
            },
            shared,
        }
    }

    /// Handles a single reply.
    ///
    /// Replies of other experiments, rounds or attempts of the round, of nodes which are not
    /// pending and for stale states are discarded. A valid failure reply fails the round.
    fn handle_reply(&mut self, reply: Reply, counter: &mut Counter) -> Result<(), RoundError> {
        let reply = match reply {
            Reply::Train(reply) => reply,
            Reply::SecaggSetup(reply) => {
                debug!("discarding setup reply of {}", reply.node_id);
                counter.increment_discarded();
                return Ok(());
            }
        };

        let round = &self.shared.round;
        if reply.experiment_id != round.experiment_id || reply.round_number != round.round_number
        {
            debug!(
                "discarding reply of {} for round {} of {}",
                reply.node_id, reply.round_number, reply.experiment_id,
            );
            counter.increment_discarded();
            return Ok(());
        }
        if reply.request_id != round.request_id {
            debug!("discarding reply of {} to an earlier attempt", reply.node_id);
            counter.increment_discarded();
            return Ok(());
        }
        match self.private.pending.get(&reply.node_id) {
            Some(state_id) if *state_id == reply.state_id => {}
            Some(_) => {
                debug!("discarding reply of {} for a stale state", reply.node_id);
                counter.increment_discarded();
                return Ok(());
            }
            None => {
                debug!("discarding unexpected reply of {}", reply.node_id);
                counter.increment_discarded();
                return Ok(());
            }
        }
        self.private.pending.remove(&reply.node_id);
        counter.increment_accepted();

        reply
            .validate()
            .map_err(|error| RoundError::ProtocolMismatch {
                node: reply.node_id.clone(),
                reason: error.to_string(),
            })?;
        if !reply.success {
            let (kind, message) = reply
                .error
                .map(|error| (error.kind, error.message))
                .unwrap_or((NodeErrorKind::Other, String::new()));
            let node = reply.node_id;
            warn!("{} failed: {}", node, message);
            if round.secagg.is_some() {
                return Err(SecureAggregationError::QuorumNotMet(vec![node]).into());
            }
            return Err(match kind {
                NodeErrorKind::StateMismatch => RoundError::StateMismatch { node, message },
                _ => RoundError::NodeTraining { node, message },
            });
        }
        let secure = round.secagg.is_some();
        match &reply.params {
            Some(ReplyParams::Plain(_)) if !secure => {}
            Some(ReplyParams::Masked(_)) if secure => {}
            _ => {
                return Err(RoundError::ProtocolMismatch {
                    node: reply.node_id,
                    reason: if secure {
                        "expected masked parameters".into()
                    } else {
                        "expected plain parameters".into()
                    },
                })
            }
        }

        if !reply.metrics.is_empty() {
            info!("training metrics of {}: {:?}", reply.node_id, reply.metrics);
        }
        let rtime_total = self.private.sent_at.elapsed().as_secs_f64();
        self.private
            .received
            .insert(reply.node_id.clone(), (reply, rtime_total));
        Ok(())
    }

    /// Aggregates the accepted replies.
    fn aggregate(&mut self) -> Result<CompletedRound, RoundError> {
        let round = &self.shared.round;
        let received = std::mem::take(&mut self.private.received);
        info!("aggregating {} replies with {}", received.len(), round.aggregator.name());

        let mut participants = BTreeMap::new();
        let mut state_ids = BTreeMap::new();
        let mut plain = BTreeMap::new();
        let mut masked = BTreeMap::new();
        for (node_id, (reply, rtime_total)) in received {
            participants.insert(
                node_id.clone(),
                ReplySummary {
                    sample_count: reply.sample_count,
                    timing: reply.timing,
                    rtime_total,
                    metrics: reply
                        .metrics
                        .into_iter()
                        .filter(|(_, value)| value.is_finite())
                        .collect(),
                },
            );
            state_ids.insert(node_id.clone(), reply.state_id.successor());
            match reply.params {
                Some(ReplyParams::Plain(params)) => {
                    plain.insert(
                        node_id,
                        NodeUpdate {
                            params,
                            sample_count: reply.sample_count,
                            aux_vars: reply.aux_vars,
                        },
                    );
                }
                Some(ReplyParams::Masked(object)) => {
                    masked.insert(node_id, (object, reply.sample_count));
                }
                None => {}
            }
        }

        let mut aggregated = match &round.secagg {
            Some(secagg) => {
                let mean = secagg.aggregate(masked, &round.global)?;
                round
                    .aggregator
                    .aggregate_secure(mean, participants.keys().cloned(), &round.node_states)?
            }
            None => round.aggregator.aggregate(AggregationInput {
                results: &plain,
                previous: &round.global,
                node_states: &round.node_states,
                training_args: &round.training_args,
                federation_size: round.federation_size,
            })?,
        };
        let (global, optimizer) = round.optimizer.step(&round.global, &aggregated.global)?;
        aggregated.global = global;
        Ok(CompletedRound {
            round_number: round.round_number,
            aggregated,
            optimizer,
            participants,
            state_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state_machine::{
        tests::{builder::StateMachineBuilder, utils},
        StateMachine,
    };
    use fedround_core::{
        message::{NodeError, WorkReply},
        testutils,
    };

    /// Runs the state machine up to the collecting phase.
    async fn collecting(state_machine: StateMachine) -> StateMachine {
        let mut state_machine = state_machine;
        while !state_machine.is_collecting() {
            state_machine = match state_machine.next().await {
                Step::Next(state_machine) => state_machine,
                Step::Done(_) => panic!("the round ended before collecting"),
            };
        }
        state_machine
    }

    #[tokio::test]
    async fn test_collecting_aggregates_all_replies() {
        let (state_machine, reply_tx, events) = StateMachineBuilder::new()
            .with_nodes(&["node-a", "node-b", "node-c"])
            .build();
        let state_machine = collecting(state_machine).await;

        // arrival order doesn't matter
        for (node, value, samples) in &[("node-c", 3.0, 50), ("node-a", 1.0, 100), ("node-b", 2.0, 150)] {
            reply_tx
                .send(Reply::Train(utils::reply_for(node, 0, *value, *samples)))
                .unwrap();
        }

        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must complete"),
        };
        assert!(state_machine.is_complete());
        assert_eq!(events.phase_listener().get_latest().event, PhaseName::Collecting);
    }

    #[tokio::test]
    async fn test_collecting_discards_unrelated_replies() {
        let (state_machine, reply_tx, _events) = StateMachineBuilder::new()
            .with_nodes(&["node-a"])
            .build();
        let state_machine = collecting(state_machine).await;

        // an earlier round, another node, a stale state, then the valid reply
        reply_tx
            .send(Reply::Train(testutils::work_reply("node-a", 5, 9.0, 1)))
            .unwrap();
        reply_tx
            .send(Reply::Train(utils::reply_for("node-z", 0, 9.0, 1)))
            .unwrap();
        let mut stale = utils::reply_for("node-a", 0, 9.0, 1);
        stale.state_id = stale.state_id.successor();
        reply_tx.send(Reply::Train(stale)).unwrap();
        reply_tx
            .send(Reply::Train(utils::reply_for("node-a", 0, 1.0, 1)))
            .unwrap();

        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must complete"),
        };
        match state_machine {
            StateMachine::Complete(state) => {
                assert_eq!(state.private.completed().aggregated.global, testutils::parameters(1.0))
            }
            _ => panic!("expected the complete phase"),
        }
    }

    #[tokio::test]
    async fn test_collecting_discards_replies_to_another_attempt() {
        let (state_machine, reply_tx, _events) = StateMachineBuilder::new()
            .with_nodes(&["node-a"])
            .build();
        let state_machine = collecting(state_machine).await;

        let mut earlier = utils::reply_for("node-a", 0, 9.0, 1);
        earlier.request_id += 1;
        reply_tx.send(Reply::Train(earlier)).unwrap();
        reply_tx
            .send(Reply::Train(utils::reply_for("node-a", 0, 1.0, 1)))
            .unwrap();

        match state_machine.next().await.into_next() {
            StateMachine::Complete(state) => {
                assert_eq!(state.private.completed().aggregated.global, testutils::parameters(1.0))
            }
            _ => panic!("expected the complete phase"),
        }
    }

    #[tokio::test]
    async fn test_collecting_times_out() {
        let (state_machine, reply_tx, _events) = StateMachineBuilder::new()
            .with_nodes(&["node-a", "node-b"])
            .with_timeout(Duration::from_millis(100))
            .build();
        let state_machine = collecting(state_machine).await;
        reply_tx
            .send(Reply::Train(utils::reply_for("node-a", 0, 1.0, 1)))
            .unwrap();

        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must fail first"),
        };
        match state_machine {
            StateMachine::Failed(state) => assert!(matches!(
                state.error(),
                RoundError::NodeTimeout(missing) if missing == &vec![NodeId::from("node-b")]
            )),
            _ => panic!("expected the failure phase"),
        }
    }

    #[tokio::test]
    async fn test_failure_reply_fails_the_round() {
        let (state_machine, reply_tx, _events) = StateMachineBuilder::new()
            .with_nodes(&["node-a", "node-b"])
            .build();
        let state_machine = collecting(state_machine).await;

        let request = utils::request_for("node-b", 0);
        reply_tx
            .send(Reply::Train(WorkReply::failure(
                &request,
                NodeError {
                    kind: NodeErrorKind::StateMismatch,
                    message: "unknown state".into(),
                },
            )))
            .unwrap();

        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must fail first"),
        };
        match state_machine {
            StateMachine::Failed(state) => assert!(matches!(
                state.error(),
                RoundError::StateMismatch { node, .. } if node.as_str() == "node-b"
            )),
            _ => panic!("expected the failure phase"),
        }
    }

    #[tokio::test]
    async fn test_masked_reply_in_plain_round_is_a_protocol_mismatch() {
        let (state_machine, reply_tx, _events) = StateMachineBuilder::new()
            .with_nodes(&["node-a"])
            .build();
        let state_machine = collecting(state_machine).await;

        let mut reply = utils::reply_for("node-a", 0, 1.0, 1);
        reply.params = Some(ReplyParams::Masked(fedround_core::mask::MaskObject {
            data: vec![0; 4],
        }));
        reply_tx.send(Reply::Train(reply)).unwrap();

        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must fail first"),
        };
        match state_machine {
            StateMachine::Failed(state) => {
                assert!(matches!(state.error(), RoundError::ProtocolMismatch { .. }))
            }
            _ => panic!("expected the failure phase"),
        }
    }

    #[tokio::test]
    async fn test_cancel_while_collecting() {
        let (state_machine, _reply_tx, _events, canceller) = StateMachineBuilder::new()
            .with_nodes(&["node-a"])
            .build_with_canceller();
        let state_machine = collecting(state_machine).await;

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must fail first"),
        };
        cancel.await.unwrap();
        match state_machine {
            StateMachine::Failed(state) => assert!(matches!(state.error(), RoundError::Cancelled)),
            _ => panic!("expected the failure phase"),
        }
    }
}
