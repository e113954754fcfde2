use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::source::CdcPull;

/// Handle to a running keepalive worker.
#[derive(Debug)]
pub struct KeepaliveWorkerHandle {
    handle: JoinHandle<()>,
}

impl KeepaliveWorkerHandle {
    /// Waits for the worker to observe shutdown and exit.
    pub async fn wait(self) {
        // Keepalive failures are logged, never propagated; a panicked ticker
        // must not take the sync step down with it.
        let _ = self.handle.await;
    }
}

/// Periodically pings the source while a sync step runs.
///
/// The ping itself is a no-op inside the source while a pull is actively
/// receiving, so this never competes with stream traffic; it only prevents
/// server-side idle timeouts between batches.
pub struct KeepaliveWorker<P> {
    source: Arc<P>,
    interval: Duration,
    shutdown_rx: ShutdownRx,
}

impl<P> KeepaliveWorker<P>
where
    P: CdcPull + 'static,
{
    pub fn new(source: Arc<P>, interval: Duration, shutdown_rx: ShutdownRx) -> Self {
        Self {
            source,
            interval,
            shutdown_rx,
        }
    }

    pub fn start(self) -> KeepaliveWorkerHandle {
        let handle = tokio::spawn(self.run());
        KeepaliveWorkerHandle { handle }
    }

    async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "starting keepalive worker");

        let mut ticker = interval(self.interval);
        // The first tick fires immediately; skip it so a fresh connection is
        // not pinged right away.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.source.keepalive().await {
                        Ok(()) => debug!("source keepalive sent"),
                        Err(err) => warn!(error = %err, "source keepalive failed"),
                    }
                }
                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("keepalive worker shutting down");
                    return;
                }
            }
        }
    }
}
