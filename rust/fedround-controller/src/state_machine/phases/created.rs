use tracing::debug;

use fedround_core::message::Request;

use crate::state_machine::{
    phases::{Phase, PhaseName, PhaseState, RequestsSent, RoundError, Shared},
    Step,
};

/// The created state. The participants and their requests are fixed, nothing was sent yet.
#[derive(Debug, Default)]
pub struct Created {
    requests: Vec<Request>,
}

#[async_trait]
impl Phase for PhaseState<Created> {
    const NAME: PhaseName = PhaseName::Created;

    async fn process(&mut self) -> Result<(), RoundError> {
        self.purge_outdated_replies()?;
        self.private.requests = self.shared.round.requests();
        debug!("{} requests ready", self.private.requests.len());
        Ok(())
    }

    async fn next(self) -> Step {
        Step::Next(PhaseState::<RequestsSent>::new(self.shared, self.private.requests).into())
    }
}

impl PhaseState<Created> {
    /// Creates a new created state.
    pub fn new(shared: Shared) -> Self {
        Self {
            private: Created::default(),
            shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::tests::builder::StateMachineBuilder;
    use fedround_core::{message::Reply, testutils};

    #[tokio::test]
    async fn test_created_to_requests_sent() {
        let (state_machine, reply_tx, _events) = StateMachineBuilder::new()
            .with_nodes(&["node-1", "node-2"])
            .build();
        assert!(state_machine.is_created());

        // a late reply of an earlier round is waiting
        reply_tx
            .send(Reply::Train(testutils::work_reply("node-1", 7, 1.0, 1)))
            .unwrap();

        let state_machine = match state_machine.next().await {
            Step::Next(state_machine) => state_machine,
            Step::Done(_) => panic!("the round must not end"),
        };
        match state_machine {
            crate::state_machine::StateMachine::RequestsSent(mut state) => {
                assert_eq!(state.private.requests().len(), 2);
                assert_eq!(state.shared.io.replies.try_recv(), None);
            }
            _ => panic!("expected the requests sent phase"),
        }
    }
}
