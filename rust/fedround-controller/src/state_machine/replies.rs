//! This module provides the `ReplySender` and `ReplyReceiver` types, the channel through which
//! the replies of the nodes reach the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use derive_more::From;
use displaydoc::Display;
use futures::{future::FutureExt, Stream};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use fedround_core::message::{MessageError, Reply};

/// Errors which can occur while delivering a reply.
#[derive(Debug, Display, Error)]
pub enum DeliveryError {
    /// The reply is invalid: {0}.
    Invalid(#[from] MessageError),
    /// The controller has shut down and no longer receives replies.
    Closed,
}

/// A handle to deliver the replies of the nodes to the controller.
#[derive(Clone, From, Debug)]
pub struct ReplySender(mpsc::UnboundedSender<Reply>);

impl ReplySender {
    /// Delivers a decoded reply.
    ///
    /// # Errors
    /// Fails if the [`ReplyReceiver`] has been dropped.
    pub fn send(&self, reply: Reply) -> Result<(), DeliveryError> {
        self.0.send(reply).map_err(|_| DeliveryError::Closed)
    }

    /// Decodes a reply as received on the wire and delivers it.
    ///
    /// A reply which can't be decoded never reaches the controller.
    ///
    /// # Errors
    /// Fails if the reply is invalid or the [`ReplyReceiver`] has been dropped.
    pub fn deliver(&self, bytes: &[u8]) -> Result<(), DeliveryError> {
        let reply = Reply::from_json(bytes).map_err(|error| {
            warn!("discarding invalid reply: {}", error);
            error
        })?;
        self.send(reply)
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// The receiver half of the reply channel that is used by the controller to receive the replies
/// of the nodes.
#[derive(From, Debug)]
pub struct ReplyReceiver(mpsc::UnboundedReceiver<Reply>);

impl Stream for ReplyReceiver {
    type Item = Reply;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        trace!("ReplyReceiver: polling");
        Pin::new(&mut self.get_mut().0).poll_recv(cx)
    }
}

impl ReplyReceiver {
    /// Creates a new reply channel and returns the [`ReplyReceiver`] as well as the
    /// [`ReplySender`] half.
    pub fn new() -> (Self, ReplySender) {
        let (tx, rx) = mpsc::unbounded_channel::<Reply>();
        let receiver = ReplyReceiver::from(rx);
        let handle = ReplySender::from(tx);
        (receiver, handle)
    }

    /// Closes the reply channel.
    /// See [the `tokio` documentation][close] for more information.
    ///
    /// [close]: https://docs.rs/tokio/1.4.0/tokio/sync/mpsc/struct.UnboundedReceiver.html#method.close
    pub fn close(&mut self) {
        self.0.close()
    }

    /// Receives the next reply.
    /// See [the `tokio` documentation][receive] for more information.
    ///
    /// [receive]: https://docs.rs/tokio/1.4.0/tokio/sync/mpsc/struct.UnboundedReceiver.html#method.recv
    pub async fn recv(&mut self) -> Option<Reply> {
        self.0.recv().await
    }

    /// Try to retrieve the next reply without blocking.
    ///
    /// Returns `None` if no reply is pending and `Some(None)` if the channel is closed.
    pub fn try_recv(&mut self) -> Option<Option<Reply>> {
        self.0.recv().now_or_never()
    }
}
