#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedround core
//!
//! Types shared between the fedround controller and the nodes it drives.
//!
//! A federated experiment proceeds in rounds. In each round the controller
//! sends a [`WorkRequest`] to every selected node, the node trains on its
//! private data and answers with a [`WorkReply`] carrying its updated
//! [`Parameters`]. The controller combines the replies into new global
//! parameters.
//!
//! When secure aggregation is enabled the nodes never reveal their updated
//! parameters to the controller. Instead they add pairwise canceling masks
//! (see the [`mask`] module) so that only the sum over the exact party set
//! can be recovered. The pairwise keys behind the masks are agreed on by the
//! nodes themselves (see the [`crypto`] module).
//!
//! [`WorkRequest`]: crate::message::WorkRequest
//! [`WorkReply`]: crate::message::WorkReply
//! [`Parameters`]: crate::model::Parameters
#[macro_use]
extern crate serde;

pub mod common;
pub mod crypto;
pub mod mask;
pub mod message;
pub mod model;
#[cfg(any(test, feature = "testutils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testutils")))]
pub mod testutils;

pub use self::{
    common::{ExperimentId, NodeId, ResearcherId, RoundNumber, StateId, StateLedger, StateMismatch},
    model::{Parameters, ShapeError},
};
