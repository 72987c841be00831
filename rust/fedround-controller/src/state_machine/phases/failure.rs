use displaydoc::Display;
use thiserror::Error;
use tracing::error;

use fedround_core::NodeId;

use crate::{
    aggregation::AggregationError,
    secagg::SecureAggregationError,
    state_machine::{
        phases::{Phase, PhaseName, PhaseState, Shared},
        RoundOutcome,
        Step,
    },
    transport::TransportError,
};

/// Errors which fail a round.
#[derive(Debug, Display, Error)]
pub enum RoundError {
    /// The nodes {0:?} did not reply before the round timeout.
    NodeTimeout(Vec<NodeId>),
    /// {node} failed to train: {message}.
    NodeTraining { node: NodeId, message: String },
    /// {node} refused the round because of a state mismatch: {message}.
    StateMismatch { node: NodeId, message: String },
    /// {node} sent an invalid reply: {reason}.
    ProtocolMismatch { node: NodeId, reason: String },
    /// The request to {0} could not be sent: {1}.
    Transport(NodeId, TransportError),
    /// Aggregation failed: {0}.
    Aggregation(#[from] AggregationError),
    /// Secure aggregation failed: {0}.
    SecureAggregation(#[from] SecureAggregationError),
    /// The round was cancelled.
    Cancelled,
    /// The reply channel is closed.
    ReplyChannel,
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    error: RoundError,
}

#[async_trait]
impl Phase for PhaseState<Failure> {
    const NAME: PhaseName = PhaseName::Failed;

    async fn process(&mut self) -> Result<(), RoundError> {
        error!("round failed: {}", self.private.error);
        Ok(())
    }

    async fn next(self) -> Step {
        Step::Done(RoundOutcome {
            result: Err(self.private.error),
            io: self.shared.io,
        })
    }
}

impl PhaseState<Failure> {
    /// Creates a new failure phase.
    pub fn new(shared: Shared, error: RoundError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }

    /// Gets the error which failed the round.
    pub fn error(&self) -> &RoundError {
        &self.private.error
    }
}
