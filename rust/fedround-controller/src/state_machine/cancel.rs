//! Cancellation of the running round.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::watch;
use tracing::info;

/// A handle to cancel the round that is currently running.
///
/// Cancelling fails the running round. Rounds started after the cancellation are not affected.
#[derive(Debug, Clone)]
pub struct RoundCanceller {
    tx: Arc<watch::Sender<u64>>,
    generation: Arc<AtomicU64>,
}

/// The listener half of a [`RoundCanceller`].
#[derive(Debug, Clone)]
pub struct CancelListener {
    rx: watch::Receiver<u64>,
    armed_at: u64,
}

/// Creates a new cancellation channel.
pub fn cancellation() -> (RoundCanceller, CancelListener) {
    let (tx, rx) = watch::channel(0);
    let canceller = RoundCanceller {
        tx: Arc::new(tx),
        generation: Arc::new(AtomicU64::new(0)),
    };
    (canceller, CancelListener { rx, armed_at: 0 })
}

impl RoundCanceller {
    /// Cancels the running round.
    pub fn cancel(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("cancelling the running round");
        // nobody listens if the controller has shut down
        let _ = self.tx.send(generation);
    }
}

impl CancelListener {
    /// Creates a listener which only reacts to cancellations issued from now on.
    pub fn arm(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            armed_at: *self.rx.borrow(),
        }
    }

    /// Checks whether a cancellation was issued since the listener was armed.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.armed_at
    }

    /// Waits until a cancellation is issued. Never completes if all cancellers were dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_cancel_armed_listener() {
        let (canceller, listener) = cancellation();
        let mut armed = listener.arm();
        assert!(!armed.is_cancelled());

        canceller.cancel();
        tokio::time::timeout(Duration::from_secs(1), armed.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_earlier_cancellations_are_ignored() {
        let (canceller, listener) = cancellation();
        canceller.cancel();

        let mut armed = listener.arm();
        assert!(!armed.is_cancelled());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), armed.cancelled())
                .await
                .is_err()
        );
    }
}
