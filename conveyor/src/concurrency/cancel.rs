//! One-shot cancellation token shared by every blocking operation of a pipeline.

use tokio::sync::watch;

/// Transmitter side of the cancellation channel.
///
/// Cancelling is idempotent and cannot be undone. The transmitter can be cloned and handed to
/// supervisors that must be able to stop the pipeline.
#[derive(Debug, Clone)]
pub struct CancelTx(watch::Sender<bool>);

impl CancelTx {
    /// Wraps a watch sender into a [`CancelTx`].
    pub fn new(tx: watch::Sender<bool>) -> Self {
        Self(tx)
    }

    /// Fires the cancellation signal.
    ///
    /// Returns `true` if this call transitioned the token to cancelled.
    pub fn cancel(&self) -> bool {
        // Infallible send so cancelling works before any receiver subscribed.
        !self.0.send_replace(true)
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Creates a new receiver subscription.
    pub fn subscribe(&self) -> CancelRx {
        CancelRx(self.0.subscribe())
    }
}

/// Receiver side of the cancellation channel.
#[derive(Debug, Clone)]
pub struct CancelRx(watch::Receiver<bool>);

impl CancelRx {
    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once cancellation has been requested.
    ///
    /// Returns immediately when the token is already cancelled. If the transmitter is dropped
    /// without cancelling, the future stays pending forever since cancellation can no longer
    /// happen.
    pub async fn wait_for_cancel(&self) {
        let mut rx = self.0.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Creates a new cancellation channel in the not-cancelled state.
pub fn create_cancel_channel() -> (CancelTx, CancelRx) {
    let (tx, rx) = watch::channel(false);
    (CancelTx::new(tx), CancelRx(rx))
}
