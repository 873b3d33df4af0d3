//! Write path: validation, buffered append, KeyDir and cache publication,
//! tag index diffing and dead-byte accounting.

use std::sync::atomic::Ordering;

use crate::datafile::{DATA_ENTRY_HEADER_SIZE, DataEntryHeader, record_checksum};
use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use crate::keydir::{KeyChunk, OldKeyChunk};
use crate::types::{
    KEY_INDEX_PAIR_SIZE, KeyIndex, MAX_KEY_INDEX_QTY, MAX_VALUE_SIZE, NO_FILE_ID, NOT_STORED,
    TOMBSTONE_VALUE_SIZE,
};

use super::StoreInner;

impl StoreInner {
    pub(crate) fn put_entry(
        &self,
        key: &[u8],
        value: &[u8],
        indexes: &[KeyIndex],
        ttl_sec: u32,
        forced_sync: bool,
    ) -> Result<()> {
        if key.is_empty() || key.len() >= u16::MAX as usize {
            self.counters
                .put_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::BadKeySize);
        }
        if indexes.len() > MAX_KEY_INDEX_QTY {
            self.counters
                .put_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::InconsistentKeyIndex);
        }
        let mut last = KeyIndex::new(0, 0);
        for ki in indexes {
            if ki.len == 0 || ki.start as usize + ki.len as usize > key.len() {
                self.counters
                    .put_call_failed_qty
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::InconsistentKeyIndex);
            }
            if ki.start < last.start || (ki.start == last.start && ki.len <= last.len) {
                self.counters
                    .put_call_failed_qty
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::UnorderedKeyIndex);
            }
            last = *ki;
        }
        if value.len() as u64 >= u64::from(MAX_VALUE_SIZE) {
            self.counters
                .put_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::BadValueSize);
        }

        let mut index_bytes = [0u8; MAX_KEY_INDEX_QTY * KEY_INDEX_PAIR_SIZE];
        for (i, ki) in indexes.iter().enumerate() {
            index_bytes[i * KEY_INDEX_PAIR_SIZE] = ki.start;
            index_bytes[i * KEY_INDEX_PAIR_SIZE + 1] = ki.len;
        }
        let index_bytes = &index_bytes[..indexes.len() * KEY_INDEX_PAIR_SIZE];

        let hash64 = hash_bytes(key);
        let record_size = DATA_ENTRY_HEADER_SIZE + key.len() + index_bytes.len() + value.len();

        let guard = self.active_mutex.lock();
        if !self.is_open.load(Ordering::Relaxed) {
            self.counters
                .put_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::StoreNotOpen);
        }
        if self.degraded.load(Ordering::Relaxed) {
            self.counters
                .put_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::Io(std::io::Error::other(
                "datastore is degraded after write failures",
            )));
        }

        let exp_time_sec = if ttl_sec == 0 {
            0
        } else {
            self.now_sec() + ttl_sec
        };
        let header = DataEntryHeader {
            checksum: record_checksum(
                exp_time_sec,
                value.len() as u32,
                key,
                index_bytes,
                value,
            ),
            exp_time_sec,
            value_size: value.len() as u32,
            key_size: key.len() as u16,
            index_size: index_bytes.len() as u8,
        };

        let (entry_file_id, entry_offset) =
            self.append_record(&header, key, index_bytes, value, record_size, forced_sync)?;

        // Write-through the cache, then publish in the KeyDir before the
        // append serialisation ends: a subsequent get in any thread sees
        // the new version even while the bytes sit in the write buffer
        let cache_loc = if self.cache.is_enabled() {
            self.cache.insert_value(value, hash64, exp_time_sec)
        } else {
            NOT_STORED
        };
        let chunk = KeyChunk {
            exp_time_sec,
            value_size: value.len() as u32,
            cache_loc,
            file_offset: entry_offset,
            file_id: entry_file_id,
            key_size: key.len() as u16,
            index_size: index_bytes.len() as u8,
            change_counter: header.checksum as u8,
            prior_file_id: NO_FILE_ID,
        };
        let old = match self.keydir.insert_entry(hash64, key, indexes, chunk) {
            Ok(old) => old,
            Err(e) => {
                if matches!(e, Error::OutOfMemory) {
                    self.logger.error(
                        "unable to store the new key due to out of memory; the run-time \
                         integrity of the datastore is compromised (data files are intact). \
                         Reopening the store recovers it; a full merge can compact it further",
                    );
                }
                return Err(e);
            }
        };
        drop(guard);

        self.publish_tag_diff(key, indexes, old.as_ref(), hash64 as u32);
        if let Some(old) = &old {
            self.retire_old_version(old, hash64, key.len());
        }

        self.counters.put_call_qty.fetch_add(1, Ordering::Relaxed);
        if self.keydir.is_resizing() {
            self.upkeep.request();
        }
        Ok(())
    }

    pub(crate) fn remove_impl(&self, key: &[u8], forced_sync: bool) -> Result<()> {
        if key.is_empty() || key.len() >= u16::MAX as usize {
            self.counters
                .remove_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::BadKeySize);
        }

        let hash64 = hash_bytes(key);
        let guard = self.active_mutex.lock();
        if !self.is_open.load(Ordering::Relaxed) {
            self.counters
                .remove_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::StoreNotOpen);
        }
        if self.degraded.load(Ordering::Relaxed) {
            self.counters
                .remove_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::Io(std::io::Error::other(
                "datastore is degraded after write failures",
            )));
        }

        // Writing a tombstone for an absent key would only grow the files
        let now = self.now_sec();
        let existing = self.keydir.find(hash64 as u32, key);
        let Some(existing) = existing.filter(|e| !e.is_tombstone() && !e.is_expired(now)) else {
            self.counters
                .remove_call_not_found_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::EntryNotFound);
        };

        let record_size = DATA_ENTRY_HEADER_SIZE + key.len();
        let header = DataEntryHeader {
            checksum: record_checksum(0, TOMBSTONE_VALUE_SIZE, key, &[], &[]),
            exp_time_sec: 0,
            value_size: TOMBSTONE_VALUE_SIZE,
            key_size: key.len() as u16,
            index_size: 0,
        };
        let (entry_file_id, entry_offset) =
            self.append_record(&header, key, &[], &[], record_size, forced_sync)?;

        // Tombstone entry; the index pairs stay attached in memory so the
        // tag buckets are not duplicated if the key comes back later
        let chunk = KeyChunk {
            exp_time_sec: 0,
            value_size: TOMBSTONE_VALUE_SIZE,
            cache_loc: NOT_STORED,
            file_offset: entry_offset,
            file_id: entry_file_id,
            key_size: key.len() as u16,
            index_size: 0,
            change_counter: 0,
            prior_file_id: existing.file_id,
        };
        let old = self.keydir.insert_entry(hash64, key, &[], chunk)?;
        drop(guard);

        if let Some(old) = &old {
            self.retire_old_version(old, hash64, key.len());
        }
        self.counters
            .remove_call_qty
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Appends one record to the active file, rolling it when full and
    /// spilling through the write buffer. Returns (file id, offset). The
    /// active mutex is held by the caller.
    fn append_record(
        &self,
        header: &DataEntryHeader,
        key: &[u8],
        index_bytes: &[u8],
        value: &[u8],
        record_size: usize,
        forced_sync: bool,
    ) -> Result<(u16, u32)> {
        // Roll the file when this record would cross the size limit; a
        // fresh file accepts any record size
        {
            let ws = self.write_state.read();
            let max = self.data_file_max_bytes.load(Ordering::Relaxed);
            if ws.data_offset > 0 && u64::from(ws.data_offset) + record_size as u64 >= max {
                drop(ws);
                self.create_new_active_file_locked()?;
            }
        }

        let files = self.files.read();
        let mut ws = self.write_state.write();
        if ws.pending_bytes() + record_size > ws.buffer.len() {
            self.flush_write_buffer_locked(&mut ws, &files)?;
        }

        let entry_file_id = ws.active_file_id;
        let entry_offset = ws.data_offset;
        let df = files
            .get(entry_file_id)
            .ok_or_else(|| Error::Io(std::io::Error::other("active data file is missing")))?;

        if ws.pending_bytes() + record_size <= ws.buffer.len() {
            let start = ws.pending_bytes();
            let buf = &mut ws.buffer[start..start + record_size];
            buf[..DATA_ENTRY_HEADER_SIZE].copy_from_slice(&header.to_bytes());
            let mut at = DATA_ENTRY_HEADER_SIZE;
            buf[at..at + key.len()].copy_from_slice(key);
            at += key.len();
            buf[at..at + index_bytes.len()].copy_from_slice(index_bytes);
            at += index_bytes.len();
            buf[at..at + value.len()].copy_from_slice(value);
            ws.data_offset += record_size as u32;
            if forced_sync {
                self.flush_write_buffer_locked(&mut ws, &files)?;
                df.sync().map_err(|e| self.note_write_failure(e))?;
            }
        } else {
            // Oversized record: the buffer was flushed above, write direct
            let write = df
                .append(&header.to_bytes())
                .and_then(|()| df.append(key))
                .and_then(|()| df.append(index_bytes))
                .and_then(|()| df.append(value));
            write.map_err(|e| self.note_write_failure(e))?;
            ws.data_offset += record_size as u32;
            ws.flushed_offset = ws.data_offset;
            if forced_sync {
                df.sync().map_err(|e| self.note_write_failure(e))?;
            }
        }
        self.write_failure_qty.store(0, Ordering::Relaxed);

        df.record_append(record_size as u64, header.is_tombstone());
        Ok((entry_file_id, entry_offset))
    }

    /// Adds the new-only tags of this put to the tag index. Both index
    /// lists are ordered, so a single merge walk finds the additions.
    pub(crate) fn publish_tag_diff(
        &self,
        key: &[u8],
        indexes: &[KeyIndex],
        old: Option<&OldKeyChunk>,
        key_id: u32,
    ) {
        let mut old_idx = 0usize;
        for ki in indexes {
            let mut add = true;
            if let Some(old) = old {
                while old_idx < old.indexes.len()
                    && (old.indexes[old_idx].start < ki.start
                        || (old.indexes[old_idx].start == ki.start
                            && old.indexes[old_idx].len < ki.len))
                {
                    old_idx += 1;
                }
                add = old_idx >= old.indexes.len()
                    || old.indexes[old_idx].start != ki.start
                    || old.indexes[old_idx].len != ki.len;
            }
            if add {
                let tag = &key[ki.start as usize..ki.start as usize + ki.len as usize];
                self.index.insert(tag, key_id);
            }
        }
    }

    /// Cache and dead-byte accounting for a replaced version.
    fn retire_old_version(&self, old: &OldKeyChunk, hash64: u64, key_len: usize) {
        if old.cache_loc != NOT_STORED && self.cache.is_enabled() {
            self.cache.remove_value(old.cache_loc, hash64);
        }
        let files = self.files.read();
        if let Some(df) = files.get(old.file_id) {
            let dead = (DATA_ENTRY_HEADER_SIZE + key_len) as u64
                + u64::from(old.index_size)
                + u64::from(old.live_value_size());
            df.record_dead(dead);
        }
    }
}
