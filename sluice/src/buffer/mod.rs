//! Keyed change buffer with spill-to-disk.
//!
//! A buffer accumulates the change records of exactly one sync step as an
//! arrival-ordered log plus a key index. Repeated updates to the same
//! `(table, primary-key hash)` collapse last-writer-wins; all other records
//! append, so an insert, update and delete of one key land as three records.
//! Records with no usable key go to the log only and are never collapsed.
//!
//! The in-memory tier holds up to `spill_threshold` records; past that, new
//! records transparently go to an embedded ordered store on disk. Reads merge
//! both tiers, and `get` always returns the last record set for a key no
//! matter which tier owns it.

mod spill;

use std::collections::HashMap;

use metrics::gauge;
use sha2::{Digest, Sha256};

use crate::error::SluiceResult;
use crate::metrics::{MIRROR_LABEL, SLUICE_BUFFER_SPILLED_RECORDS};
use crate::types::{ChangeRecord, RecordItems, RecordType, TableSchema};
use spill::SpillStore;

/// Width of the content-addressed primary-key hash.
pub const PKEY_HASH_LEN: usize = 32;

/// Key of one buffered record: destination table plus a fixed-width hash of
/// the primary-key column values. The all-zero hash marks records without a
/// usable key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub table_name: String,
    pub pkey_hash: [u8; PKEY_HASH_LEN],
}

impl BufferKey {
    pub fn new(table_name: impl Into<String>, pkey_hash: [u8; PKEY_HASH_LEN]) -> Self {
        Self {
            table_name: table_name.into(),
            pkey_hash,
        }
    }

    /// Builds the key for a row image by hashing its primary-key values.
    ///
    /// Returns an un-keyed key when the schema has no identity columns or any
    /// identity value is absent from the image.
    pub fn from_items(schema: &TableSchema, items: &RecordItems) -> Self {
        let identity = schema.identity_columns();
        if identity.is_empty() {
            return Self::unkeyed(&schema.name);
        }

        let mut hasher = Sha256::new();
        for column in &identity {
            let Some(value) = items.get(column) else {
                return Self::unkeyed(&schema.name);
            };
            hasher.update(column.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_json().to_string().as_bytes());
            hasher.update([0u8]);
        }

        Self {
            table_name: schema.name.clone(),
            pkey_hash: hasher.finalize().into(),
        }
    }

    pub fn unkeyed(table_name: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            pkey_hash: [0u8; PKEY_HASH_LEN],
        }
    }

    pub fn is_unkeyed(&self) -> bool {
        self.pkey_hash == [0u8; PKEY_HASH_LEN]
    }
}

/// The change buffer of one sync step.
pub struct ChangeBuffer {
    mirror_name: String,
    spill_threshold: usize,
    /// In-memory log tier; the sequence number of `mem_log[i]` is `i`.
    mem_log: Vec<ChangeRecord>,
    /// Latest log position per key, spanning both tiers.
    key_index: HashMap<BufferKey, u64>,
    spill: Option<SpillStore>,
    spilled_len: usize,
}

impl ChangeBuffer {
    /// Creates an empty buffer that spills past `spill_threshold` records.
    pub fn new(mirror_name: impl Into<String>, spill_threshold: usize) -> Self {
        Self {
            mirror_name: mirror_name.into(),
            spill_threshold,
            mem_log: Vec::new(),
            key_index: HashMap::new(),
            spill: None,
            spilled_len: 0,
        }
    }

    fn next_seq(&self) -> u64 {
        (self.mem_log.len() + self.spilled_len) as u64
    }

    fn record_at(&self, seq: u64) -> SluiceResult<Option<ChangeRecord>> {
        if (seq as usize) < self.mem_log.len() {
            return Ok(self.mem_log.get(seq as usize).cloned());
        }
        match &self.spill {
            Some(spill) => spill.get(seq),
            None => Ok(None),
        }
    }

    fn write_at(&mut self, seq: u64, record: ChangeRecord) -> SluiceResult<()> {
        if (seq as usize) < self.mem_log.len() {
            self.mem_log[seq as usize] = record;
            return Ok(());
        }

        let spill = match self.spill.take() {
            Some(spill) => spill,
            None => SpillStore::create(&self.mirror_name)?,
        };
        let was_new = spill.put(seq, &record)?;
        if was_new {
            self.spilled_len += 1;
        }
        self.spill = Some(spill);

        gauge!(
            SLUICE_BUFFER_SPILLED_RECORDS,
            MIRROR_LABEL => self.mirror_name.clone()
        )
        .set(self.spilled_len as f64);

        Ok(())
    }

    /// Stores `record` under `key`.
    ///
    /// When both the stored record for `key` and `record` are updates, the
    /// stored one is overwritten in place; anything else appends, preserving
    /// one landed record per source event.
    pub fn set(&mut self, key: BufferKey, record: ChangeRecord) -> SluiceResult<()> {
        if !key.is_unkeyed()
            && let Some(&seq) = self.key_index.get(&key)
            && record.record_type() == Some(RecordType::Update)
            && self.record_at(seq)?.as_ref().and_then(ChangeRecord::record_type)
                == Some(RecordType::Update)
        {
            return self.write_at(seq, record);
        }

        let seq = self.next_seq();
        if self.spill.is_none() && self.mem_log.len() < self.spill_threshold {
            self.mem_log.push(record);
        } else {
            self.write_at(seq, record)?;
        }

        if !key.is_unkeyed() {
            self.key_index.insert(key, seq);
        }

        Ok(())
    }

    /// Returns the latest record stored under `key`, regardless of tier.
    pub fn get(&self, key: &BufferKey) -> SluiceResult<Option<ChangeRecord>> {
        if key.is_unkeyed() {
            return Ok(None);
        }

        match self.key_index.get(key) {
            Some(&seq) => self.record_at(seq),
            None => Ok(None),
        }
    }

    /// Total number of stored records across tiers, including un-keyed ones.
    pub fn len(&self) -> usize {
        self.mem_log.len() + self.spilled_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once the on-disk tier has been created.
    pub fn has_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Drains the buffer into a vector ordered by source offset, ties broken
    /// by arrival order.
    pub fn flush_ordered(&mut self) -> SluiceResult<Vec<ChangeRecord>> {
        let mut entries: Vec<(u64, ChangeRecord)> = Vec::with_capacity(self.len());

        for (seq, record) in self.mem_log.drain(..).enumerate() {
            entries.push((seq as u64, record));
        }
        if let Some(spill) = &self.spill {
            spill.drain_into(&mut entries)?;
        }
        self.spilled_len = 0;
        self.key_index.clear();

        entries.sort_by_key(|(seq, record)| (record.checkpoint_id(), *seq));

        Ok(entries.into_iter().map(|(_, record)| record).collect())
    }

    /// Releases all resources, deleting the spill store if one was created.
    pub fn close(mut self) {
        self.mem_log.clear();
        self.key_index.clear();
        // Dropping the spill store removes its temp directory.
        self.spill.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeMeta, Checkpoint, Value};
    use chrono::Utc;
    use rand::RngCore;
    use std::collections::BTreeSet;

    fn meta(checkpoint_id: u64) -> ChangeMeta {
        ChangeMeta {
            checkpoint: Checkpoint::new(checkpoint_id),
            commit_time: Utc::now(),
            source_table: "src".to_string(),
            destination_table: "dst".to_string(),
        }
    }

    fn insert_record(checkpoint_id: u64, marker: i64) -> ChangeRecord {
        let mut items = RecordItems::new();
        items.insert("id", Value::Int64(marker));
        ChangeRecord::Insert {
            meta: meta(checkpoint_id),
            items,
        }
    }

    fn update_record(checkpoint_id: u64, marker: i64) -> ChangeRecord {
        let mut items = RecordItems::new();
        items.insert("id", Value::Int64(marker));
        ChangeRecord::Update {
            meta: meta(checkpoint_id),
            items,
            old_items: None,
            unchanged_toast_columns: BTreeSet::new(),
        }
    }

    fn delete_record(checkpoint_id: u64, marker: i64) -> ChangeRecord {
        let mut items = RecordItems::new();
        items.insert("id", Value::Int64(marker));
        ChangeRecord::Delete {
            meta: meta(checkpoint_id),
            old_items: items,
        }
    }

    fn random_key() -> BufferKey {
        let mut hash = [0u8; PKEY_HASH_LEN];
        rand::rng().fill_bytes(&mut hash);
        BufferKey::new("dst", hash)
    }

    #[test]
    fn single_record_stays_in_memory() {
        let mut buffer = ChangeBuffer::new("test_single_record", 10);
        let key = random_key();
        let record = insert_record(1, 1);

        buffer.set(key.clone(), record.clone()).unwrap();
        assert!(!buffer.has_spilled());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(&key).unwrap(), Some(record));

        buffer.close();
    }

    #[test]
    fn records_till_spill_then_disk_tier() {
        let mut buffer = ChangeBuffer::new("test_records_till_spill", 10);

        let mut keys = Vec::new();
        for i in 1..=10 {
            let key = random_key();
            buffer.set(key.clone(), insert_record(i, i as i64)).unwrap();
            keys.push(key);
            assert_eq!(buffer.len(), i as usize);
            assert!(!buffer.has_spilled());
        }

        // The 11th distinct key transitions the buffer to the disk tier.
        let key = random_key();
        let record = insert_record(11, 11);
        buffer.set(key.clone(), record.clone()).unwrap();

        assert!(buffer.has_spilled());
        assert_eq!(buffer.len(), 11);
        assert_eq!(buffer.get(&key).unwrap(), Some(record));

        // Pre-transition keys still resolve from the memory tier.
        assert_eq!(buffer.get(&keys[0]).unwrap(), Some(insert_record(1, 1)));

        buffer.close();
    }

    #[test]
    fn repeated_updates_collapse_last_writer_wins() {
        let mut buffer = ChangeBuffer::new("test_collapse", 10);
        let key = random_key();

        buffer.set(key.clone(), update_record(1, 1)).unwrap();
        buffer.set(key.clone(), update_record(2, 2)).unwrap();
        buffer.set(key.clone(), update_record(3, 3)).unwrap();

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(&key).unwrap(), Some(update_record(3, 3)));

        buffer.close();
    }

    #[test]
    fn insert_update_delete_keep_one_record_each() {
        let mut buffer = ChangeBuffer::new("test_no_cross_collapse", 10);
        let key = random_key();

        buffer.set(key.clone(), insert_record(1, 7)).unwrap();
        buffer.set(key.clone(), update_record(2, 7)).unwrap();
        buffer.set(key.clone(), delete_record(3, 7)).unwrap();

        // Three distinct events, three landed records.
        assert_eq!(buffer.len(), 3);
        // The index always serves the latest record for the key.
        assert_eq!(buffer.get(&key).unwrap(), Some(delete_record(3, 7)));

        let flushed = buffer.flush_ordered().unwrap();
        let types: Vec<_> = flushed.iter().map(|r| r.record_type()).collect();
        assert_eq!(
            types,
            vec![
                Some(RecordType::Insert),
                Some(RecordType::Update),
                Some(RecordType::Delete)
            ]
        );
    }

    #[test]
    fn collapsed_update_in_spill_tier_is_overwritten_in_place() {
        let mut buffer = ChangeBuffer::new("test_spill_collapse", 1);
        buffer.set(random_key(), insert_record(1, 1)).unwrap();

        let key = random_key();
        buffer.set(key.clone(), update_record(2, 2)).unwrap();
        assert!(buffer.has_spilled());

        buffer.set(key.clone(), update_record(3, 33)).unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get(&key).unwrap(), Some(update_record(3, 33)));

        buffer.close();
    }

    #[test]
    fn unkeyed_records_append_without_collapsing() {
        let mut buffer = ChangeBuffer::new("test_unkeyed", 10);
        let key = BufferKey::unkeyed("dst");

        buffer.set(key.clone(), update_record(1, 1)).unwrap();
        buffer.set(key.clone(), update_record(2, 2)).unwrap();

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.get(&key).unwrap(), None);

        buffer.close();
    }

    #[test]
    fn flush_is_ordered_by_offset_across_tiers() {
        let mut buffer = ChangeBuffer::new("test_flush_order", 2);

        buffer.set(random_key(), insert_record(30, 1)).unwrap();
        buffer.set(random_key(), insert_record(10, 2)).unwrap();
        // Spilled record with the middle offset.
        buffer.set(random_key(), insert_record(20, 3)).unwrap();
        assert!(buffer.has_spilled());

        let flushed = buffer.flush_ordered().unwrap();
        let offsets: Vec<u64> = flushed.iter().map(|r| r.checkpoint_id()).collect();
        assert_eq!(offsets, vec![10, 20, 30]);

        buffer.close();
    }

    #[test]
    fn flush_breaks_offset_ties_by_arrival_order() {
        let mut buffer = ChangeBuffer::new("test_flush_ties", 10);
        let unkeyed = BufferKey::unkeyed("dst");

        buffer.set(unkeyed.clone(), insert_record(5, 1)).unwrap();
        buffer.set(unkeyed.clone(), insert_record(5, 2)).unwrap();
        buffer.set(unkeyed, insert_record(5, 3)).unwrap();

        let flushed = buffer.flush_ordered().unwrap();
        let markers: Vec<i64> = flushed
            .iter()
            .map(|r| match r.items().unwrap().get("id").unwrap() {
                Value::Int64(v) => *v,
                _ => panic!("unexpected value"),
            })
            .collect();
        assert_eq!(markers, vec![1, 2, 3]);
    }

    #[test]
    fn key_hash_is_content_addressed() {
        let schema = TableSchema::new(
            "dst",
            vec![
                crate::types::ColumnSchema::new("id", crate::types::ValueKind::Int64, -1, false),
                crate::types::ColumnSchema::new("v", crate::types::ValueKind::String, -1, true),
            ],
            vec!["id".to_string()],
        );

        let mut a = RecordItems::new();
        a.insert("id", Value::Int64(7));
        a.insert("v", Value::String("x".to_string()));

        let mut b = RecordItems::new();
        b.insert("id", Value::Int64(7));
        b.insert("v", Value::String("different".to_string()));

        // Same identity, different payload: identical keys.
        assert_eq!(
            BufferKey::from_items(&schema, &a),
            BufferKey::from_items(&schema, &b)
        );

        let mut c = RecordItems::new();
        c.insert("id", Value::Int64(8));
        assert_ne!(
            BufferKey::from_items(&schema, &a),
            BufferKey::from_items(&schema, &c)
        );

        // A missing identity value degrades to the un-keyed form.
        let missing = RecordItems::new();
        assert!(BufferKey::from_items(&schema, &missing).is_unkeyed());
    }
}
