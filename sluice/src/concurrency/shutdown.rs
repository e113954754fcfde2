use tokio::sync::watch;

/// Sending half of the shutdown signal.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiving half of the shutdown signal, cloneable per worker.
#[derive(Clone, Debug)]
pub struct ShutdownRx {
    rx: watch::Receiver<bool>,
}

impl ShutdownRx {
    /// Returns `true` once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when shutdown is requested. Returns immediately if it
    /// already was.
    pub async fn wait_for_shutdown(&mut self) {
        // An error means the sender is gone, which we treat as shutdown.
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}

/// Creates a connected shutdown channel pair.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (tx, ShutdownRx { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_reaches_all_receivers() {
        let (tx, rx) = create_shutdown_channel();
        let mut second = rx.clone();

        assert!(!rx.is_shutdown());
        tx.send(true).unwrap();

        assert!(rx.is_shutdown());
        second.wait_for_shutdown().await;
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        let mut rx2 = rx.clone();
        drop(tx);
        // Must not hang.
        rx2.wait_for_shutdown().await;
    }
}
