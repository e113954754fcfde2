use std::collections::HashMap;

use sluice_config::TableMapping;
use tokio::sync::mpsc;

/// Capacity of the signal mailbox. Signals are operator actions, so a small
/// bound is plenty; senders get backpressure instead of unbounded buffering.
const SIGNAL_CAPACITY: usize = 16;

/// Control signals accepted by a running mirror.
///
/// Signals apply at the start of the next loop iteration, never mid-step,
/// except [`MirrorSignal::Pause`] which takes effect after the currently
/// running step commits.
#[derive(Clone, Debug)]
pub enum MirrorSignal {
    AddTables(Vec<TableMapping>),
    RemoveTables(Vec<String>),
    UpdateEnv(HashMap<String, String>),
    UpdateBatchSize(usize),
    Pause,
    Resume,
    Terminate,
}

/// Sending half of a mirror's signal mailbox.
#[derive(Clone, Debug)]
pub struct SignalSender {
    tx: mpsc::Sender<MirrorSignal>,
}

impl SignalSender {
    /// Delivers a signal, waiting if the mailbox is momentarily full.
    pub async fn send(&self, signal: MirrorSignal) -> bool {
        self.tx.send(signal).await.is_ok()
    }
}

/// Creates a connected signal mailbox pair.
pub fn signal_channel() -> (SignalSender, mpsc::Receiver<MirrorSignal>) {
    let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
    (SignalSender { tx }, rx)
}
