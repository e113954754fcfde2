use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, warn};

use crate::catalog::{Catalog, MirrorStatus};
use crate::classifier::{self, ErrorAction};
use crate::concurrency::{KeepaliveWorker, ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::error::{SluiceError, SluiceResult};
use crate::types::TableSchema;
use crate::workflow::activities::MirrorActivities;
use crate::workflow::signals::{MirrorSignal, SignalSender, signal_channel};
use crate::workflow::{DestinationPeer, SourcePeer};

/// Interval between keepalive pings while the mirror runs.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded exponential backoff applied to recoverable errors.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive recoverable failures tolerated before the mirror pauses.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.min(self.max_backoff)
    }
}

/// Handle to a spawned controller.
pub struct ControllerHandle {
    pub signals: SignalSender,
    handle: JoinHandle<SluiceResult<()>>,
}

impl ControllerHandle {
    /// Waits for the controller to finish its lifecycle.
    pub async fn wait(self) -> SluiceResult<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "mirror controller task panicked");
                Err(crate::sluice_error!(
                    crate::error::ErrorKind::WorkerPanic,
                    "Mirror controller panicked",
                    err.to_string()
                ))
            }
        }
    }
}

/// Drives one mirror through its lifecycle:
/// `Setup -> Snapshot? -> Running <-> Paused -> Terminated/Completed`.
pub struct MirrorController<S, D, C> {
    activities: MirrorActivities<S, D, C>,
    retry_policy: RetryPolicy,
    signals_rx: mpsc::Receiver<MirrorSignal>,
    signals_tx: SignalSender,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
}

impl<S, D, C> MirrorController<S, D, C>
where
    S: SourcePeer + 'static,
    D: DestinationPeer + 'static,
    C: Catalog + 'static,
{
    pub fn new(
        source: Arc<S>,
        destination: Arc<D>,
        catalog: C,
        config: sluice_config::MirrorConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        let (signals_tx, signals_rx) = signal_channel();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Self {
            activities: MirrorActivities {
                source,
                destination,
                catalog,
                config,
            },
            retry_policy,
            signals_rx,
            signals_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawns the controller loop and returns its handle plus signal sender.
    pub fn start(self) -> ControllerHandle {
        let signals = self.signals_tx.clone();
        let span = tracing::info_span!(
            "mirror_controller",
            mirror = %self.activities.config.name
        );
        let handle = tokio::spawn(self.run().instrument(span));

        ControllerHandle { signals, handle }
    }

    async fn run(mut self) -> SluiceResult<()> {
        let catalog = self.activities.catalog.clone();
        let mirror = self.activities.config.name.clone();

        catalog.set_mirror_status(&mirror, MirrorStatus::Setup).await?;
        let (_setup, mut table_schemas) = self.activities.setup().await?;

        if self.activities.config.do_initial_snapshot {
            catalog
                .set_mirror_status(&mirror, MirrorStatus::Snapshot)
                .await?;
            self.activities.snapshot(&table_schemas).await?;

            if self.activities.config.resync {
                self.activities.rename_tables(&table_schemas).await?;
            }
        }

        if self.activities.config.initial_snapshot_only {
            catalog
                .set_mirror_status(&mirror, MirrorStatus::Completed)
                .await?;
            info!("snapshot-only mirror completed");
            return Ok(());
        }

        catalog
            .set_mirror_status(&mirror, MirrorStatus::Running)
            .await?;

        // Keepalive runs for the whole streaming phase; pulls make it a
        // no-op while they are active.
        let keepalive = KeepaliveWorker::new(
            Arc::clone(&self.activities.source),
            KEEPALIVE_INTERVAL,
            self.shutdown_rx.clone(),
        )
        .start();

        let result = self.streaming_loop(&mut table_schemas).await;

        // Stop the keepalive ticker before reporting the final status.
        let _ = self.shutdown_tx.send(true);
        keepalive.wait().await;

        match &result {
            Ok(()) => {
                catalog
                    .set_mirror_status(&mirror, MirrorStatus::Terminated)
                    .await?;
                info!("mirror terminated");
            }
            Err(err) => {
                error!(error = %err, "mirror stopped on unrecoverable error");
            }
        }

        result
    }

    /// The `(sync, normalize)` loop with signal handling and classified
    /// failure routing.
    async fn streaming_loop(
        &mut self,
        table_schemas: &mut HashMap<String, TableSchema>,
    ) -> SluiceResult<()> {
        let mut paused = false;
        let mut recoverable_attempts = 0u32;

        loop {
            // Signals apply at iteration boundaries only.
            while let Ok(signal) = self.signals_rx.try_recv() {
                match self.apply_signal(signal, table_schemas).await? {
                    LoopAction::Continue => {}
                    LoopAction::Pause => paused = true,
                    LoopAction::Resume => paused = false,
                    LoopAction::Terminate => return Ok(()),
                }
            }

            if paused {
                self.activities
                    .catalog
                    .set_mirror_status(&self.activities.config.name, MirrorStatus::Paused)
                    .await?;

                // Block until the operator acts; nothing else to do.
                let Some(signal) = self.signals_rx.recv().await else {
                    return Ok(());
                };
                match self.apply_signal(signal, table_schemas).await? {
                    LoopAction::Resume => {
                        paused = false;
                        self.activities
                            .catalog
                            .set_mirror_status(
                                &self.activities.config.name,
                                MirrorStatus::Running,
                            )
                            .await?;
                    }
                    LoopAction::Terminate => return Ok(()),
                    LoopAction::Continue | LoopAction::Pause => {}
                }
                continue;
            }

            let iteration = async {
                self.activities.sync_step(table_schemas).await?;
                self.activities.normalize_step(table_schemas).await
            }
            .await;

            match iteration {
                Ok(()) => {
                    recoverable_attempts = 0;
                }
                Err(err) => match self.route_error(&err).await? {
                    ErrorAction::Ignore => {
                        recoverable_attempts = 0;
                    }
                    ErrorAction::RetryRecoverable | ErrorAction::NotifyTelemetry => {
                        recoverable_attempts += 1;
                        if recoverable_attempts >= self.retry_policy.max_attempts {
                            warn!(
                                attempts = recoverable_attempts,
                                "recoverable error persisted, pausing mirror"
                            );
                            self.record_error(&err).await?;
                            paused = true;
                            continue;
                        }

                        let backoff = self.retry_policy.backoff_for(recoverable_attempts);
                        warn!(
                            error = %err,
                            attempt = recoverable_attempts,
                            backoff_secs = backoff.as_secs(),
                            "recoverable error, backing off"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    ErrorAction::NotifyUser => {
                        self.record_error(&err).await?;
                        paused = true;
                    }
                },
            }
        }
    }

    async fn apply_signal(
        &mut self,
        signal: MirrorSignal,
        table_schemas: &mut HashMap<String, TableSchema>,
    ) -> SluiceResult<LoopAction> {
        let config = &self.activities.config;

        match signal {
            MirrorSignal::Pause => {
                info!("pause signal received");
                Ok(LoopAction::Pause)
            }
            MirrorSignal::Resume => {
                info!("resume signal received");
                Ok(LoopAction::Resume)
            }
            MirrorSignal::Terminate => {
                info!("terminate signal received");
                self.activities
                    .catalog
                    .set_mirror_status(&config.name, MirrorStatus::Terminating)
                    .await?;
                Ok(LoopAction::Terminate)
            }
            MirrorSignal::AddTables(mappings) => {
                let mirror_name = config.name.clone();
                for mapping in mappings {
                    let schema = self
                        .activities
                        .source
                        .table_schema(
                            &mapping.source_identifier,
                            &mapping.destination_identifier,
                            &mapping.excluded_columns,
                        )
                        .await?;
                    self.activities
                        .catalog
                        .store_table_schema(&mirror_name, &mapping.source_identifier, &schema)
                        .await?;
                    table_schemas.insert(mapping.destination_identifier.clone(), schema);
                    info!(table = %mapping.destination_identifier, "table added to mirror");
                    self.activities.config.table_mappings.push(mapping);
                }
                Ok(LoopAction::Continue)
            }
            MirrorSignal::RemoveTables(destination_tables) => {
                let mirror_name = config.name.clone();
                let cursor = self.activities.catalog.get_cursor(&mirror_name).await?;
                self.activities
                    .destination
                    .remove_table_entries(
                        &mirror_name,
                        &destination_tables,
                        cursor.last_normalize_batch_id,
                        cursor.last_sync_batch_id,
                    )
                    .await?;
                for table in &destination_tables {
                    table_schemas.remove(table);
                    info!(table = %table, "table removed from mirror");
                }
                self.activities
                    .config
                    .table_mappings
                    .retain(|mapping| {
                        !destination_tables.contains(&mapping.destination_identifier)
                    });
                Ok(LoopAction::Continue)
            }
            MirrorSignal::UpdateEnv(values) => {
                info!(keys = values.len(), "environment update received");
                self.activities.config.env.replace(values);
                Ok(LoopAction::Continue)
            }
            MirrorSignal::UpdateBatchSize(size) => {
                info!(size, "batch size update received");
                self.activities.config.batch.max_batch_size = size;
                Ok(LoopAction::Continue)
            }
        }
    }

    /// Classifies `err` and persists user-facing failures.
    async fn route_error(&self, err: &SluiceError) -> SluiceResult<ErrorAction> {
        let (class, info) = classifier::classify(err);

        warn!(
            class = class.name,
            source = info.source.as_str(),
            code = %info.code,
            error = %err,
            "step failed"
        );

        Ok(class.action)
    }

    async fn record_error(&self, err: &SluiceError) -> SluiceResult<()> {
        let (class, _) = classifier::classify(err);
        self.activities
            .catalog
            .set_mirror_error(&self.activities.config.name, class.name, &err.to_string())
            .await
    }
}

enum LoopAction {
    Continue,
    Pause,
    Resume,
    Terminate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(30), Duration::from_secs(60));
    }
}
