//! Secure aggregation setup messages.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: crate::message

use crate::{crypto::PublicExchangeKey, message::NodeError, ExperimentId, NodeId, ResearcherId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A request to join a secure aggregation session.
///
/// The node generates an ephemeral key pair for the session and acknowledges
/// the request with its public key. The pairwise session keys are agreed on
/// once the controller relays the public keys of all parties.
pub struct SecaggSetupRequest {
    pub researcher_id: ResearcherId,
    pub experiment_id: ExperimentId,
    pub session_id: String,
    pub node_id: NodeId,
    pub parties: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
/// The outcome of a secure aggregation setup request.
pub struct SecaggSetupReply {
    pub experiment_id: ExperimentId,
    pub session_id: String,
    pub node_id: NodeId,
    pub success: bool,
    /// The public key of the node for this session, required on success.
    #[serde(default)]
    pub public_key: Option<PublicExchangeKey>,
    #[serde(default)]
    pub error: Option<NodeError>,
}

impl SecaggSetupReply {
    /// Creates the acknowledgement of the `request`, handing in the `public_key` of the node.
    pub fn ack(request: &SecaggSetupRequest, public_key: PublicExchangeKey) -> Self {
        Self {
            experiment_id: request.experiment_id.clone(),
            session_id: request.session_id.clone(),
            node_id: request.node_id.clone(),
            success: true,
            public_key: Some(public_key),
            error: None,
        }
    }

    /// Creates the refusal of the `request`.
    pub fn refuse(request: &SecaggSetupRequest, error: NodeError) -> Self {
        Self {
            experiment_id: request.experiment_id.clone(),
            session_id: request.session_id.clone(),
            node_id: request.node_id.clone(),
            success: false,
            public_key: None,
            error: Some(error),
        }
    }
}
