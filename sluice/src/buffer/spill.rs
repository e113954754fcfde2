use redb::{Database, ReadableTable, TableDefinition};
use tempfile::TempDir;
use tracing::debug;

use crate::error::SluiceResult;
use crate::types::ChangeRecord;

/// Spilled log entries: arrival sequence number to serialized record.
const RECORDS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("buffered_records");

/// On-disk tier of the change buffer.
///
/// One spill store lives for at most one sync step. The database file sits in
/// its own temp directory, which is removed when the store is dropped.
pub(crate) struct SpillStore {
    db: Database,
    // Held only for its Drop impl, which deletes the directory.
    _dir: TempDir,
}

impl SpillStore {
    /// Creates the spill database for `mirror_name`.
    pub fn create(mirror_name: &str) -> SluiceResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("sluice-spill-{mirror_name}-"))
            .tempdir()?;
        let path = dir.path().join("records.redb");
        let db = Database::create(&path).map_err(redb::Error::from)?;

        debug!(path = %path.display(), "change buffer spilling to disk");

        Ok(Self { db, _dir: dir })
    }

    /// Inserts or overwrites the entry at `seq`, returning `true` if the
    /// sequence number was new.
    pub fn put(&self, seq: u64, record: &ChangeRecord) -> SluiceResult<bool> {
        let value = serde_json::to_vec(record)?;

        let write_txn = self.db.begin_write().map_err(redb::Error::from)?;
        let was_new = {
            let mut table = write_txn
                .open_table(RECORDS_TABLE)
                .map_err(redb::Error::from)?;
            table
                .insert(seq, value.as_slice())
                .map_err(redb::Error::from)?
                .is_none()
        };
        write_txn.commit().map_err(redb::Error::from)?;

        Ok(was_new)
    }

    pub fn get(&self, seq: u64) -> SluiceResult<Option<ChangeRecord>> {
        let read_txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = match read_txn.open_table(RECORDS_TABLE) {
            Ok(table) => table,
            // The table is created lazily by the first put.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(redb::Error::from(err).into()),
        };

        let Some(guard) = table.get(seq).map_err(redb::Error::from)? else {
            return Ok(None);
        };

        let record: ChangeRecord = serde_json::from_slice(guard.value())?;
        Ok(Some(record))
    }

    /// Drains every spilled entry into `out`, in sequence order.
    pub fn drain_into(&self, out: &mut Vec<(u64, ChangeRecord)>) -> SluiceResult<()> {
        let read_txn = self.db.begin_read().map_err(redb::Error::from)?;
        let table = match read_txn.open_table(RECORDS_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(err) => return Err(redb::Error::from(err).into()),
        };

        for item in table.iter().map_err(redb::Error::from)? {
            let (seq, value) = item.map_err(redb::Error::from)?;
            let record: ChangeRecord = serde_json::from_slice(value.value())?;
            out.push((seq.value(), record));
        }

        Ok(())
    }
}
