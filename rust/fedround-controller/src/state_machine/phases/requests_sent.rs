use tokio::time::Instant;
use tracing::{debug, info};

use fedround_core::message::Request;

use crate::state_machine::{
    phases::{Collecting, Phase, PhaseName, PhaseState, RoundError, Shared},
    Step,
};

/// The requests sent state.
#[derive(Debug)]
pub struct RequestsSent {
    /// The requests to send.
    requests: Vec<Request>,
    /// The time at which the requests were sent.
    sent_at: Option<Instant>,
}

#[async_trait]
impl Phase for PhaseState<RequestsSent> {
    const NAME: PhaseName = PhaseName::RequestsSent;

    async fn process(&mut self) -> Result<(), RoundError> {
        let requests = std::mem::take(&mut self.private.requests);
        info!("sending {} work requests", requests.len());
        self.private.sent_at = Some(Instant::now());
        self.shared
            .io
            .transport
            .broadcast(requests)
            .await
            .map_err(|(node_id, error)| RoundError::Transport(node_id, error))?;
        debug!("all work requests sent");
        Ok(())
    }

    async fn next(self) -> Step {
        let sent_at = self.private.sent_at.unwrap_or_else(Instant::now);
        Step::Next(PhaseState::<Collecting>::new(self.shared, sent_at).into())
    }
}

impl PhaseState<RequestsSent> {
    /// Creates a new requests sent state.
    pub fn new(shared: Shared, requests: Vec<Request>) -> Self {
        Self {
            private: RequestsSent {
                requests,
                sent_at: None,
            },
            shared,
        }
    }
}

impl RequestsSent {
    #[cfg(test)]
    pub(in crate::state_machine) fn requests(&self) -> &[Request] {
        &self.requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{tests::builder::StateMachineBuilder, StateMachine};

    #[tokio::test]
    async fn test_unreachable_node_fails_the_round() {
        let (state_machine, _reply_tx, _events) = StateMachineBuilder::new()
            .with_nodes(&["node-1", "node-2"])
            .with_unreachable(&["node-2"])
            .build();

        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must not end"),
        };
        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must not end"),
        };
        match state_machine {
            StateMachine::Failed(state) => {
                assert!(matches!(state.error(), RoundError::Transport(node, _) if node.as_str() == "node-2"))
            }
            _ => panic!("expected the failure phase"),
        }
    }
}
