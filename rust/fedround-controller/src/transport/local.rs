//! An in-process transport.
//!
//! The [`LocalTransport`] hands every request to the [`NodeHandler`] registered for its node, on
//! a task of its own. The reply is encoded and decoded exactly as if it crossed the network, hence
//! nodes driven in-process are subject to the same reply validation as remote ones.

use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::anyhow;
use tracing::{debug, warn};

use fedround_core::{
    message::{Reply, Request},
    NodeId,
};

use crate::{
    state_machine::replies::ReplySender,
    transport::{Transport, TransportError},
};

#[async_trait]
/// The node side of the [`LocalTransport`].
pub trait NodeHandler: Send + Sync + 'static {
    /// Handles a request. Returns the reply of the node, or `None` if the node stays silent.
    async fn handle(&self, request: Request) -> Option<Reply>;
}

#[derive(Clone)]
/// A transport which delivers the requests to in-process node handlers.
pub struct LocalTransport {
    nodes: BTreeMap<NodeId, Arc<dyn NodeHandler>>,
    replies: ReplySender,
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalTransport {
    /// Creates a transport without any node.
    pub fn new(replies: ReplySender) -> Self {
        Self {
            nodes: BTreeMap::new(),
            replies,
        }
    }

    /// Registers the handler of a node.
    pub fn with_node(mut self, node_id: impl Into<NodeId>, handler: Arc<dyn NodeHandler>) -> Self {
        self.nodes.insert(node_id.into(), handler);
        self
    }

    /// Gets the nodes reachable through this transport.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, request: Request) -> Result<(), TransportError> {
        let node_id = request.node_id().clone();
        let handler = self
            .nodes
            .get(&node_id)
            .cloned()
            .ok_or_else(|| anyhow!("node {} is unreachable", node_id))?;
        let replies = self.replies.clone();

        debug!("sending request to {}", node_id);
        tokio::spawn(async move {
            let reply = match handler.handle(request).await {
                Some(reply) => reply,
                None => return,
            };
            let delivered = reply
                .to_json()
                .map_err(Into::into)
                .and_then(|bytes| replies.deliver(&bytes));
            if let Err(error) = delivered {
                warn!("failed to deliver the reply of {}: {}", node_id, error);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::replies::ReplyReceiver;
    use fedround_core::{message::WorkReply, testutils};

    struct Echo;

    #[async_trait]
    impl NodeHandler for Echo {
        async fn handle(&self, request: Request) -> Option<Reply> {
            match request {
                Request::Train(request) => Some(Reply::Train(WorkReply::success(
                    &request,
                    fedround_core::message::ReplyParams::Plain(request.params.clone()),
                    1,
                    Default::default(),
                    Default::default(),
                ))),
                Request::SecaggSetup(_) => None,
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_registered_node() {
        let (mut replies, reply_tx) = ReplyReceiver::new();
        let transport = LocalTransport::new(reply_tx).with_node("node-1", Arc::new(Echo));

        let request = testutils::work_request("node-1", 0);
        transport.send(Request::Train(request.clone())).await.unwrap();

        match replies.recv().await {
            Some(Reply::Train(reply)) => {
                assert_eq!(reply.node_id, request.node_id);
                assert_eq!(reply.state_id, request.state_id);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reports_unreachable_node() {
        let (_replies, reply_tx) = ReplyReceiver::new();
        let transport = LocalTransport::new(reply_tx).with_node("node-1", Arc::new(Echo));

        let requests = vec![
            Request::Train(testutils::work_request("node-1", 0)),
            Request::Train(testutils::work_request("node-2", 0)),
        ];
        let (node_id, _) = transport.broadcast(requests).await.unwrap_err();
        assert_eq!(node_id, NodeId::from("node-2"));
    }
}
