//! Durable catalog: batch cursors, peers, mirror state, QRep partitions and
//! schema snapshots.
//!
//! Everything a mirror needs to resume after a crash lives here, addressed by
//! mirror name. All writes run in short transactions against a single
//! relational store; cursor updates are guarded so that replaying an already
//! committed step is a no-op.

use std::future::Future;
use std::time::Duration;

use sluice_config::{Peer, PeerConfig, PeerKind};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, SluiceResult};
use crate::types::{BatchCursor, Checkpoint, TableSchema};

/// Maximum number of connections in the catalog pool.
///
/// Kept small: every catalog operation is a short transaction and activities
/// never hold a connection across an await on peer I/O.
const MAX_POOL_CONNECTIONS: u32 = 4;

/// Duration after which idle catalog connections are closed.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of a mirror, persisted in `mirror_jobs.status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorStatus {
    Setup,
    Snapshot,
    Running,
    Pausing,
    Paused,
    Terminating,
    Terminated,
    Completed,
}

impl MirrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorStatus::Setup => "setup",
            MirrorStatus::Snapshot => "snapshot",
            MirrorStatus::Running => "running",
            MirrorStatus::Pausing => "pausing",
            MirrorStatus::Paused => "paused",
            MirrorStatus::Terminating => "terminating",
            MirrorStatus::Terminated => "terminated",
            MirrorStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "setup" => MirrorStatus::Setup,
            "snapshot" => MirrorStatus::Snapshot,
            "running" => MirrorStatus::Running,
            "pausing" => MirrorStatus::Pausing,
            "paused" => MirrorStatus::Paused,
            "terminating" => MirrorStatus::Terminating,
            "terminated" => MirrorStatus::Terminated,
            "completed" => MirrorStatus::Completed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-mirror state: the contract every catalog backend honors.
///
/// All operations are idempotent under replay and all writes are
/// transactional per call. The Postgres-backed implementation below is the
/// production one; tests run against the in-memory catalog in
/// [`crate::test_utils`].
pub trait Catalog: Clone + Send + Sync {
    fn get_cursor(&self, mirror: &str)
    -> impl Future<Output = SluiceResult<BatchCursor>> + Send;

    /// Advances the last durable source offset; regressions are ignored.
    fn set_last_offset(
        &self,
        mirror: &str,
        offset: &Checkpoint,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Atomically advances `last_sync_batch_id` and the offset; replaying a
    /// committed batch id is a no-op.
    fn finish_sync_batch(
        &self,
        mirror: &str,
        batch_id: i64,
        offset: &Checkpoint,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    /// Advances `last_normalize_batch_id`; fails when `batch_id` exceeds
    /// `last_sync_batch_id`.
    fn finish_normalize_batch(
        &self,
        mirror: &str,
        batch_id: i64,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    fn set_mirror_status(
        &self,
        mirror: &str,
        status: MirrorStatus,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    fn get_mirror_status(
        &self,
        mirror: &str,
    ) -> impl Future<Output = SluiceResult<Option<MirrorStatus>>> + Send;

    fn set_mirror_error(
        &self,
        mirror: &str,
        error_class: &str,
        error_message: &str,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    fn drop_mirror(&self, mirror: &str) -> impl Future<Output = SluiceResult<()>> + Send;

    fn register_partition(
        &self,
        mirror: &str,
        partition_id: &str,
        range_start: &str,
        range_end: &str,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    fn is_partition_done(
        &self,
        mirror: &str,
        partition_id: &str,
    ) -> impl Future<Output = SluiceResult<bool>> + Send;

    fn mark_partition_done(
        &self,
        mirror: &str,
        partition_id: &str,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    fn store_table_schema(
        &self,
        mirror: &str,
        source_table: &str,
        schema: &TableSchema,
    ) -> impl Future<Output = SluiceResult<()>> + Send;

    fn load_table_schema(
        &self,
        mirror: &str,
        source_table: &str,
    ) -> impl Future<Output = SluiceResult<Option<TableSchema>>> + Send;
}

/// Handle to the catalog database.
///
/// Cheaply cloneable; the pool is shared and connects lazily.
#[derive(Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    /// Creates a catalog handle with a lazily connected pool.
    pub fn connect_lazy(options: PgConnectOptions) -> Self {
        let pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(MAX_POOL_CONNECTIONS)
            .idle_timeout(Some(IDLE_TIMEOUT))
            .connect_lazy_with(options);

        Self { pool }
    }

    /// Wraps an existing pool, used by tests and embedding binaries.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the catalog tables if they do not exist yet.
    pub async fn migrate(&self) -> SluiceResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS peers (
                name TEXT PRIMARY KEY,
                type INT NOT NULL,
                options JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS flow_state (
                mirror_name TEXT PRIMARY KEY,
                last_offset_id BIGINT NOT NULL DEFAULT 0,
                last_offset_text TEXT NOT NULL DEFAULT '',
                last_sync_batch_id BIGINT NOT NULL DEFAULT 0,
                last_normalize_batch_id BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS mirror_jobs (
                mirror_name TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                last_error_class TEXT,
                last_error_message TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"#,
            r#"CREATE TABLE IF NOT EXISTS qrep_partitions (
                mirror_name TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                range_start TEXT NOT NULL,
                range_end TEXT NOT NULL,
                completed BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (mirror_name, partition_id)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS table_schema_mapping (
                mirror_name TEXT NOT NULL,
                source_table TEXT NOT NULL,
                table_schema JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (mirror_name, source_table)
            )"#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("catalog migrations applied");

        Ok(())
    }

}

impl Catalog for PostgresCatalog {
    /// Returns the cursor triple for `mirror`, initializing it on first use.
    async fn get_cursor(&self, mirror: &str) -> SluiceResult<BatchCursor> {
        sqlx::query("INSERT INTO flow_state (mirror_name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(mirror)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query(
            r#"SELECT last_offset_id, last_offset_text, last_sync_batch_id,
                      last_normalize_batch_id
               FROM flow_state WHERE mirror_name = $1"#,
        )
        .bind(mirror)
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchCursor {
            last_offset: Checkpoint::with_text(
                row.try_get::<i64, _>("last_offset_id")? as u64,
                row.try_get::<String, _>("last_offset_text")?,
            ),
            last_sync_batch_id: row.try_get("last_sync_batch_id")?,
            last_normalize_batch_id: row.try_get("last_normalize_batch_id")?,
        })
    }

    /// Advances the last durable source offset.
    ///
    /// Must only be called once the raw batch carrying records up to `offset`
    /// is durable on the destination. Regressions are silently ignored so the
    /// offset never moves backwards.
    async fn set_last_offset(&self, mirror: &str, offset: &Checkpoint) -> SluiceResult<()> {
        sqlx::query(
            r#"UPDATE flow_state
               SET last_offset_id = $2, last_offset_text = $3, updated_at = now()
               WHERE mirror_name = $1 AND last_offset_id <= $2"#,
        )
        .bind(mirror)
        .bind(offset.id as i64)
        .bind(&offset.text)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically advances `last_sync_batch_id` and the offset.
    ///
    /// Replaying with a `batch_id` at or below the current cursor is a no-op,
    /// which makes the sync activity idempotent under workflow retries.
    async fn finish_sync_batch(
        &self,
        mirror: &str,
        batch_id: i64,
        offset: &Checkpoint,
    ) -> SluiceResult<()> {
        let result = sqlx::query(
            r#"UPDATE flow_state
               SET last_sync_batch_id = $2,
                   last_offset_id = GREATEST(last_offset_id, $3),
                   last_offset_text = $4,
                   updated_at = now()
               WHERE mirror_name = $1 AND last_sync_batch_id < $2"#,
        )
        .bind(mirror)
        .bind(batch_id)
        .bind(offset.id as i64)
        .bind(&offset.text)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                mirror,
                batch_id, "finish_sync_batch replayed for a committed batch, ignoring"
            );
        }

        Ok(())
    }

    /// Advances `last_normalize_batch_id`.
    ///
    /// Fails when `batch_id` exceeds `last_sync_batch_id`: a batch can never
    /// normalize before it synced. Replays at or below the cursor are no-ops.
    async fn finish_normalize_batch(&self, mirror: &str, batch_id: i64) -> SluiceResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT last_sync_batch_id, last_normalize_batch_id FROM flow_state \
             WHERE mirror_name = $1 FOR UPDATE",
        )
        .bind(mirror)
        .fetch_one(&mut *tx)
        .await?;

        let last_sync: i64 = row.try_get("last_sync_batch_id")?;
        let last_normalize: i64 = row.try_get("last_normalize_batch_id")?;

        if batch_id > last_sync {
            bail!(
                ErrorKind::InvalidState,
                "Normalize cursor cannot pass the sync cursor",
                format!("normalize batch {batch_id} > last sync batch {last_sync}")
            );
        }

        if batch_id > last_normalize {
            sqlx::query(
                "UPDATE flow_state SET last_normalize_batch_id = $2, updated_at = now() \
                 WHERE mirror_name = $1",
            )
            .bind(mirror)
            .bind(batch_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn set_mirror_status(&self, mirror: &str, status: MirrorStatus) -> SluiceResult<()> {
        sqlx::query(
            r#"INSERT INTO mirror_jobs (mirror_name, status) VALUES ($1, $2)
               ON CONFLICT (mirror_name) DO UPDATE SET status = $2, updated_at = now()"#,
        )
        .bind(mirror)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_mirror_status(&self, mirror: &str) -> SluiceResult<Option<MirrorStatus>> {
        let row = sqlx::query("SELECT status FROM mirror_jobs WHERE mirror_name = $1")
            .bind(mirror)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|row| row.try_get::<String, _>("status"))
            .transpose()?
            .and_then(|raw| MirrorStatus::parse(&raw)))
    }

    /// Persists the classified error that paused a mirror, surfaced by the
    /// status API.
    async fn set_mirror_error(
        &self,
        mirror: &str,
        error_class: &str,
        error_message: &str,
    ) -> SluiceResult<()> {
        sqlx::query(
            r#"UPDATE mirror_jobs
               SET last_error_class = $2, last_error_message = $3, updated_at = now()
               WHERE mirror_name = $1"#,
        )
        .bind(mirror)
        .bind(error_class)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes every catalog row belonging to `mirror`.
    async fn drop_mirror(&self, mirror: &str) -> SluiceResult<()> {
        let mut tx = self.pool.begin().await?;

        for table in [
            "flow_state",
            "mirror_jobs",
            "qrep_partitions",
            "table_schema_mapping",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE mirror_name = $1"))
                .bind(mirror)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Registers a partition if it is not known yet. Existing rows keep their
    /// completion flag, so re-planning after a restart cannot reset progress.
    async fn register_partition(
        &self,
        mirror: &str,
        partition_id: &str,
        range_start: &str,
        range_end: &str,
    ) -> SluiceResult<()> {
        sqlx::query(
            r#"INSERT INTO qrep_partitions (mirror_name, partition_id, range_start, range_end)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (mirror_name, partition_id) DO NOTHING"#,
        )
        .bind(mirror)
        .bind(partition_id)
        .bind(range_start)
        .bind(range_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_partition_done(&self, mirror: &str, partition_id: &str) -> SluiceResult<bool> {
        let row = sqlx::query(
            "SELECT completed FROM qrep_partitions WHERE mirror_name = $1 AND partition_id = $2",
        )
        .bind(mirror)
        .bind(partition_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|row| row.try_get::<bool, _>("completed"))
            .transpose()?
            .unwrap_or(false))
    }

    async fn mark_partition_done(&self, mirror: &str, partition_id: &str) -> SluiceResult<()> {
        sqlx::query(
            r#"UPDATE qrep_partitions SET completed = TRUE, updated_at = now()
               WHERE mirror_name = $1 AND partition_id = $2"#,
        )
        .bind(mirror)
        .bind(partition_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn store_table_schema(
        &self,
        mirror: &str,
        source_table: &str,
        schema: &TableSchema,
    ) -> SluiceResult<()> {
        let payload = serde_json::to_value(schema)?;

        sqlx::query(
            r#"INSERT INTO table_schema_mapping (mirror_name, source_table, table_schema)
               VALUES ($1, $2, $3)
               ON CONFLICT (mirror_name, source_table)
               DO UPDATE SET table_schema = $3, updated_at = now()"#,
        )
        .bind(mirror)
        .bind(source_table)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_table_schema(
        &self,
        mirror: &str,
        source_table: &str,
    ) -> SluiceResult<Option<TableSchema>> {
        let row = sqlx::query(
            "SELECT table_schema FROM table_schema_mapping \
             WHERE mirror_name = $1 AND source_table = $2",
        )
        .bind(mirror)
        .bind(source_table)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: serde_json::Value = row.try_get("table_schema")?;
        Ok(Some(serde_json::from_value(payload)?))
    }
}

/// Peer registry operations, outside the [`Catalog`] contract because only
/// the control surface uses them.
impl PostgresCatalog {
    pub async fn save_peer(&self, peer: &Peer) -> SluiceResult<()> {
        let options = serde_json::to_value(&peer.config)?;

        sqlx::query(
            r#"INSERT INTO peers (name, type, options) VALUES ($1, $2, $3)
               ON CONFLICT (name) DO UPDATE SET type = $2, options = $3"#,
        )
        .bind(&peer.name)
        .bind(peer.kind() as i32)
        .bind(options)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn load_peer(&self, name: &str) -> SluiceResult<Peer> {
        let row = sqlx::query("SELECT options FROM peers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            bail!(
                ErrorKind::ConfigError,
                "Peer not found",
                format!("no peer named '{name}' in the catalog")
            );
        };

        let options: serde_json::Value = row.try_get("options")?;
        let config: PeerConfig = serde_json::from_value(options)?;

        Ok(Peer::new(name, config))
    }

    /// Returns the kind of a peer without deserializing its options.
    pub async fn load_peer_kind(&self, name: &str) -> SluiceResult<PeerKind> {
        self.load_peer(name).await.map(|peer| peer.kind())
    }

    pub async fn drop_peer(&self, name: &str) -> SluiceResult<()> {
        sqlx::query("DELETE FROM peers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
