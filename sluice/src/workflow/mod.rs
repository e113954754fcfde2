//! Mirror orchestration: idempotent activities and the controller loop.
//!
//! The durable workflow engine hosting these pieces is an external
//! collaborator; everything here is written so that any step can be replayed
//! with the same `(mirror, batch_id)` and converge. The controller models
//! one mirror's lifecycle and runs `(sync, normalize)` iterations, applying
//! control signals only at iteration boundaries.

mod activities;
mod controller;
mod signals;

pub use activities::{MirrorActivities, SyncStepOutcome};
pub use controller::{ControllerHandle, MirrorController, RetryPolicy};
pub use signals::{MirrorSignal, SignalSender, signal_channel};

use crate::destination::{CdcNormalize, CdcSync, QRepSync, RenameTables, ValidateDestination};
use crate::source::{CdcPull, GetTableSchema, GetVersion, QRepPull, ValidateSource};

/// Everything the controller needs from a source peer.
pub trait SourcePeer:
    CdcPull + GetTableSchema + QRepPull + ValidateSource + GetVersion + Send + Sync
{
}

impl<T> SourcePeer for T where
    T: CdcPull + GetTableSchema + QRepPull + ValidateSource + GetVersion + Send + Sync
{
}

/// Everything the controller needs from a destination peer.
pub trait DestinationPeer:
    CdcSync + CdcNormalize + QRepSync + RenameTables + ValidateDestination + Send + Sync
{
}

impl<T> DestinationPeer for T where
    T: CdcSync + CdcNormalize + QRepSync + RenameTables + ValidateDestination + Send + Sync
{
}
