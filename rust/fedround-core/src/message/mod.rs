//! Messages exchanged between the controller and the nodes.
//!
//! Every message is a JSON document. The field names are part of the wire
//! format and must stay stable across controller and node versions within a
//! deployment. Replies reject unknown fields, a reply that fails to
//! deserialize is invalid and must be discarded by the receiver.

pub mod secagg;
pub mod work;

use thiserror::Error;

pub use self::{
    secagg::{SecaggSetupReply, SecaggSetupRequest},
    work::{
        AuxVars,
        Metrics,
        NodeError,
        NodeErrorKind,
        ReplyError,
        ReplyParams,
        SecaggArguments,
        Timing,
        TrainingArgs,
        WorkReply,
        WorkRequest,
    },
};
use crate::{ExperimentId, NodeId};

#[derive(Debug, Error)]
/// Errors related to the encoding and decoding of messages.
pub enum MessageError {
    #[error("invalid message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
/// A message sent from the controller to a node.
pub enum Request {
    /// Train on the local dataset.
    Train(WorkRequest),
    /// Join a secure aggregation session.
    SecaggSetup(SecaggSetupRequest),
}

impl Request {
    /// Gets the node the request is addressed to.
    pub fn node_id(&self) -> &NodeId {
        match self {
            Request::Train(req) => &req.node_id,
            Request::SecaggSetup(req) => &req.node_id,
        }
    }

    /// Serializes the request.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a request.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
/// A message sent from a node to the controller.
pub enum Reply {
    /// The outcome of a training request.
    Train(WorkReply),
    /// The outcome of a secure aggregation setup request.
    SecaggSetup(SecaggSetupReply),
}

impl Reply {
    /// Gets the node which sent the reply.
    pub fn node_id(&self) -> &NodeId {
        match self {
            Reply::Train(rep) => &rep.node_id,
            Reply::SecaggSetup(rep) => &rep.node_id,
        }
    }

    /// Gets the experiment the reply belongs to.
    pub fn experiment_id(&self) -> &ExperimentId {
        match self {
            Reply::Train(rep) => &rep.experiment_id,
            Reply::SecaggSetup(rep) => &rep.experiment_id,
        }
    }

    /// Serializes the reply.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a reply.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
