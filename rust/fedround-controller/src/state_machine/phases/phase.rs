use std::fmt;

use derive_more::Display;
use futures::StreamExt;
use tracing::{debug, error, error_span, info, warn};
use tracing_futures::Instrument;

use fedround_core::message::Reply;

use crate::state_machine::{
    phases::{Failure, RoundError},
    round::RoundContext,
    RoundIo,
    StateMachine,
    Step,
};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Created")]
    Created,
    #[display(fmt = "RequestsSent")]
    RequestsSent,
    #[display(fmt = "Collecting")]
    Collecting,
    #[display(fmt = "Complete")]
    Complete,
    #[display(fmt = "Failed")]
    Failed,
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase {
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), RoundError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    async fn next(self) -> Step;
}

/// A struct that contains the round context and the I/O interfaces that are shared and
/// accessible by all `PhaseState`s.
pub struct Shared {
    /// The round context.
    pub(in crate::state_machine) round: RoundContext,
    /// The I/O interfaces, handed back once the round is over.
    pub(in crate::state_machine) io: RoundIo,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("round", &self.round)
            .field("replies", &self.io.replies)
            .field("events", &self.io.events)
            .finish()
    }
}

impl Shared {
    /// Creates a new shared state and attaches the round number to all events.
    pub fn new(round: RoundContext, mut io: RoundIo) -> Self {
        io.events.set_round_id(round.round_number);
        Self { round, io }
    }

    /// Returns the current round number.
    pub fn round_id(&self) -> u64 {
        self.round.round_number
    }
}

/// The state corresponding to a phase of a round.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared round context and I/O interfaces.
    pub(in crate::state_machine) shared: Shared,
}

impl<S> PhaseState<S>
where
    S: Send,
    Self: Phase,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> Step {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase, round_id = self.shared.round_id());

        async move {
            info!("starting phase");
            self.shared.io.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return Step::Next(self.into_failure_state(err));
            }
            info!("phase ran successfully");

            self.broadcast();

            info!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }
}

impl<S> PhaseState<S> {
    /// Receives the next [`Reply`].
    ///
    /// # Errors
    /// Returns [`RoundError::ReplyChannel`] when all sender halves have been dropped.
    pub async fn next_reply(&mut self) -> Result<Reply, RoundError> {
        debug!("waiting for the next incoming reply");
        self.shared.io.replies.next().await.ok_or_else(|| {
            error!("reply receiver broken: senders have been dropped");
            RoundError::ReplyChannel
        })
    }

    /// Discards all the pending replies, which belong to earlier rounds.
    pub fn purge_outdated_replies(&mut self) -> Result<(), RoundError> {
        loop {
            match self.shared.io.replies.try_recv() {
                Some(Some(reply)) => {
                    debug!("discarding outdated reply of {}", reply.node_id());
                }
                Some(None) => {
                    warn!("failed to get next pending reply: channel shut down");
                    return Err(RoundError::ReplyChannel);
                }
                None => {
                    debug!("no pending reply");
                    return Ok(());
                }
            }
        }
    }

    fn into_failure_state(self, err: RoundError) -> StateMachine {
        PhaseState::<Failure>::new(self.shared, err).into()
    }
}
