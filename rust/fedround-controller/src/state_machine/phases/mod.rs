//! This module provides the `PhaseStates` of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod collecting;
mod complete;
mod created;
mod failure;
mod phase;
mod requests_sent;

pub use self::{
    collecting::Collecting,
    complete::Complete,
    created::Created,
    failure::{Failure, RoundError},
    phase::{Phase, PhaseName, PhaseState, Shared},
    requests_sent::RequestsSent,
};
