//! The state machine that drives a single round.
//!
//! # Overview
//!
//! A round moves through the phases `Created -> RequestsSent -> Collecting -> Complete`. Any of
//! the phases may fail the round, in which case it ends in the `Failed` phase instead. Both
//! `Complete` and `Failed` are terminal: the [`StateMachine`] hands back a [`RoundOutcome`] with
//! the result of the round and the I/O interfaces it borrowed.
//!
//! A round never changes the state of the experiment. The [`CompletedRound`] carries the new
//! global parameters, node states and aggregator state, and the experiment commits all of them at
//! once. A failed round leaves nothing to commit.
//!
//! # Phase states
//!
//! **Created**
//!
//! Publishes [`PhaseName::Created`], discards the replies left over from earlier rounds and builds
//! the work request of every participant.
//!
//! **RequestsSent**
//!
//! Publishes [`PhaseName::RequestsSent`] and sends the work requests concurrently. The round fails
//! if a request can't be sent.
//!
//! **Collecting**
//!
//! Publishes [`PhaseName::Collecting`] and waits at most the round timeout for one reply per
//! participant. Replies of other rounds, of nodes which are not participants and for stale states
//! are discarded. A failure reply, an invalid reply, the timeout or a cancellation fail the round.
//! Once every participant replied, the results are aggregated, securely if the round is.
//!
//! **Complete**
//!
//! Publishes [`PhaseName::Complete`] and the new global parameters.
//!
//! **Failed**
//!
//! Publishes [`PhaseName::Failed`] and logs the [`RoundError`].
//!
//! # Replies
//!
//! The replies of the nodes reach the state machine through the [`ReplyReceiver`], independently
//! from the [`Transport`] that carried the requests. The sender half ([`ReplySender`]) is handed
//! out to whatever receives the replies from the nodes.
//!
//! # Events
//!
//! The state machine publishes the phases and the new global parameters. Everyone who is
//! interested in the events can subscribe to them via the [`EventSubscriber`].
//!
//! [`PhaseName::Created`]: crate::state_machine::phases::PhaseName::Created
//! [`PhaseName::RequestsSent`]: crate::state_machine::phases::PhaseName::RequestsSent
//! [`PhaseName::Collecting`]: crate::state_machine::phases::PhaseName::Collecting
//! [`PhaseName::Complete`]: crate::state_machine::phases::PhaseName::Complete
//! [`PhaseName::Failed`]: crate::state_machine::phases::PhaseName::Failed
//! [`ReplySender`]: crate::state_machine::replies::ReplySender
//! [`EventSubscriber`]: crate::state_machine::events::EventSubscriber
//! [`Transport`]: crate::transport::Transport

pub mod cancel;
pub mod events;
pub mod phases;
pub mod replies;
pub mod round;

#[cfg(test)]
pub(crate) mod tests;

use std::{fmt, sync::Arc};

use derive_more::From;

use self::{
    cancel::CancelListener,
    events::EventPublisher,
    phases::{
        Collecting,
        Complete,
        Created,
        Failure,
        Phase,
        PhaseName,
        PhaseState,
        RequestsSent,
        RoundError,
        Shared,
    },
    replies::ReplyReceiver,
    round::{CompletedRound, RoundContext},
};
use crate::transport::Transport;

/// The I/O interfaces a round works with.
pub struct RoundIo {
    /// The transport to the nodes.
    pub transport: Arc<dyn Transport>,
    /// The receiver half of the reply channel.
    pub replies: ReplyReceiver,
    /// The event publisher.
    pub events: EventPublisher,
    /// The cancellation listener of the experiment.
    pub cancel: CancelListener,
}

impl fmt::Debug for RoundIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundIo")
            .field("replies", &self.replies)
            .field("events", &self.events)
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// The outcome of a round.
#[derive(Debug)]
pub struct RoundOutcome {
    /// The result of the round.
    pub result: Result<CompletedRound, RoundError>,
    /// The I/O interfaces handed back by the round.
    pub io: RoundIo,
}

/// A step of the state machine.
pub enum Step {
    /// The round moved to the next phase.
    Next(StateMachine),
    /// The round is over.
    Done(RoundOutcome),
}

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine {
    Created(PhaseState<Created>),
    RequestsSent(PhaseState<RequestsSent>),
    Collecting(PhaseState<Collecting>),
    Complete(PhaseState<Complete>),
    Failed(PhaseState<Failure>),
}

impl StateMachine {
    /// Creates the state machine of a round.
    ///
    /// The cancellation listener only reacts to cancellations issued from now on.
    pub fn new(round: RoundContext, mut io: RoundIo) -> Self {
        io.cancel = io.cancel.arm();
        PhaseState::<Created>::new(Shared::new(round, io)).into()
    }

    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    pub async fn next(self) -> Step {
        match self {
            StateMachine::Created(state) => state.run_phase().await,
            StateMachine::RequestsSent(state) => state.run_phase().await,
            StateMachine::Collecting(state) => state.run_phase().await,
            StateMachine::Complete(state) => state.run_phase().await,
            StateMachine::Failed(state) => state.run_phase().await,
        }
    }

    /// Runs the round to its end.
    pub async fn run(mut self) -> RoundOutcome {
        loop {
            self = match self.next().await {
                Step::Next(state_machine) => state_machine,
                Step::Done(outcome) => return outcome,
            };
        }
    }

    /// Gets the name of the current phase.
    pub fn phase(&self) -> PhaseName {
        match self {
            StateMachine::Created(_) => PhaseState::<Created>::NAME,
            StateMachine::RequestsSent(_) => PhaseState::<RequestsSent>::NAME,
            StateMachine::Collecting(_) => PhaseState::<Collecting>::NAME,
            StateMachine::Complete(_) => PhaseState::<Complete>::NAME,
            StateMachine::Failed(_) => PhaseState::<Failure>::NAME,
        }
    }
}
