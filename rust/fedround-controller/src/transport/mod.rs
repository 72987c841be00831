//! Delivery of requests to the nodes.
//!
//! The controller only depends on the [`Transport`] trait to reach the nodes. The replies travel
//! back through a [`ReplySender`], independently from the transport that carried the request,
//! which lets a transport deliver them whenever and in whatever order they arrive.
//!
//! [`ReplySender`]: crate::state_machine::replies::ReplySender

pub mod local;

use futures::future::join_all;
use tracing::debug;

use fedround_core::{message::Request, NodeId};

pub use self::local::{LocalTransport, NodeHandler};

/// An error returned by a [`Transport`].
pub type TransportError = anyhow::Error;

#[async_trait]
/// An asynchronous channel from the controller to the nodes.
pub trait Transport: Send + Sync + 'static {
    /// Sends a request to the node it is addressed to.
    ///
    /// A request which was sent successfully is not necessarily received by the node. The reply
    /// of the node (if any) is delivered through the reply channel.
    async fn send(&self, request: Request) -> Result<(), TransportError>;

    /// Sends all the `requests` concurrently.
    ///
    /// # Errors
    /// Fails with the error of the first request, in node order, that could not be sent.
    async fn broadcast(&self, requests: Vec<Request>) -> Result<(), (NodeId, TransportError)> {
        debug!("sending {} requests", requests.len());
        let sends = requests.into_iter().map(|request| async move {
            let node_id = request.node_id().clone();
            self.send(request).await.map_err(|error| (node_id, error))
        });
        let mut failed: Vec<_> = join_all(sends)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        failed.sort_by(|(a, _), (b, _)| a.cmp(b));
        match failed.into_iter().next() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}
