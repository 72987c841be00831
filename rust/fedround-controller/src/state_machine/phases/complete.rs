use std::sync::Arc;

use tracing::info;

use crate::state_machine::{
    events::ModelUpdate,
    phases::{Phase, PhaseName, PhaseState, RoundError, Shared},
    round::CompletedRound,
    RoundOutcome,
    Step,
};

/// The complete state.
#[derive(Debug)]
pub struct Complete {
    completed: CompletedRound,
}

#[async_trait]
impl Phase for PhaseState<Complete> {
    const NAME: PhaseName = PhaseName::Complete;

    async fn process(&mut self) -> Result<(), RoundError> {
        info!(
            "round completed with {} participants",
            self.private.completed.participants.len()
        );
        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the new global parameters");
        let global = Arc::new(self.private.completed.aggregated.global.clone());
        self.shared.io.events.broadcast_model(ModelUpdate::New(global));
    }

    async fn next(self) -> Step {
        Step::Done(RoundOutcome {
            result: Ok(self.private.completed),
            io: self.shared.io,
        })
    }
}

impl PhaseState<Complete> {
    /// Creates a new complete state.
    pub fn new(shared: Shared, completed: CompletedRound) -> Self {
        Self {
            private: Complete { completed },
            shared,
        }
    }
}

impl Complete {
    #[cfg(test)]
    pub(in crate::state_machine) fn completed(&self) -> &CompletedRound {
        &self.completed
    }
}
