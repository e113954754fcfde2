//! Cooperative-task plumbing: shutdown signaling and the keepalive ticker.

pub mod keepalive;
pub mod shutdown;

pub use keepalive::{KeepaliveWorker, KeepaliveWorkerHandle};
pub use shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
