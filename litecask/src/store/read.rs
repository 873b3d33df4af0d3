//! Read path: write-buffer probe, value cache, data file fallback, and the
//! AND tag query with its lazy bucket cleaning.

use std::sync::atomic::Ordering;

use crate::datafile::{DATA_ENTRY_HEADER_SIZE, DataEntryHeader, record_checksum};
use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use crate::types::KeyIndex;

use super::StoreInner;

/// Whether the entry declares `part` among its tag slices.
fn entry_has_tag(key: &[u8], indexes: &[KeyIndex], part: &[u8]) -> bool {
    indexes.iter().any(|ki| {
        ki.len as usize == part.len()
            && ki.start as usize + ki.len as usize <= key.len()
            && &key[ki.start as usize..ki.start as usize + ki.len as usize] == part
    })
}

/// A bucket is cleaned when at least this many ids were found stale...
const MIN_CLEAN_ENTRIES: usize = 10;
/// ...and they make up at least this share of the bucket, in percent.
const MIN_CLEAN_ARRAY_PERCENT: usize = 10;

impl StoreInner {
    pub(crate) fn get_impl(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() || key.len() >= u16::MAX as usize {
            self.counters
                .get_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::BadKeySize);
        }
        if !self.is_open.load(Ordering::Relaxed) {
            self.counters
                .get_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::StoreNotOpen);
        }

        let hash64 = hash_bytes(key);
        let now = self.now_sec();
        let files = self.files.read();

        let Some(entry) = self
            .keydir
            .find(hash64 as u32, key)
            .filter(|e| !e.is_tombstone() && !e.is_expired(now))
        else {
            self.counters
                .get_call_not_found_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::EntryNotFound);
        };

        // Freshest copy first: the record may still sit in the write buffer
        {
            let ws = self.write_state.read();
            if entry.file_id == ws.active_file_id
                && entry.file_offset >= ws.flushed_offset
                && ((entry.file_offset - ws.flushed_offset) as usize) < ws.buffer.len()
            {
                let start = (entry.file_offset - ws.flushed_offset) as usize
                    + DATA_ENTRY_HEADER_SIZE
                    + key.len()
                    + entry.index_size as usize;
                let value = ws.buffer[start..start + entry.value_size as usize].to_vec();
                drop(ws);
                drop(files);
                self.counters.get_call_qty.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .get_write_buffer_hit_qty
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
        }

        if self.cache.is_enabled() {
            if let Some(value) = self.cache.get_value(entry.cache_loc, hash64, entry.value_size) {
                drop(files);
                self.counters.get_call_qty.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .get_cache_hit_qty
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
        }

        // Fall back to the data file and verify the whole record frame
        let total = DATA_ENTRY_HEADER_SIZE
            + key.len()
            + entry.index_size as usize
            + entry.value_size as usize;
        let mut record = vec![0u8; total];
        let read_ok = files
            .get(entry.file_id)
            .map(|df| df.read_exact_at(&mut record, u64::from(entry.file_offset)).is_ok())
            .unwrap_or(false);
        drop(files);

        let value_start = DATA_ENTRY_HEADER_SIZE + key.len() + entry.index_size as usize;
        let mut intact = read_ok;
        if intact {
            let header = DataEntryHeader::from_bytes(&record);
            let checksum = record_checksum(
                header.exp_time_sec,
                header.value_size,
                &record[DATA_ENTRY_HEADER_SIZE..DATA_ENTRY_HEADER_SIZE + key.len()],
                &record[DATA_ENTRY_HEADER_SIZE + key.len()..value_start],
                &record[value_start..],
            );
            intact = checksum == header.checksum
                && &record[DATA_ENTRY_HEADER_SIZE..DATA_ENTRY_HEADER_SIZE + key.len()] == key;
        }
        if !intact {
            self.counters
                .get_call_corrupted_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::Corrupted);
        }

        let value = record[value_start..].to_vec();

        if self.cache.is_enabled() {
            let cache_loc = self.cache.insert_value(&value, hash64, entry.exp_time_sec);
            // The change counter fences the ABA case where the entry was
            // replaced between the lookup above and this cache publication
            self.keydir.update_cached_value_location(
                hash64 as u32,
                key,
                entry.value_size,
                entry.change_counter,
                cache_loc,
            );
        }

        self.counters.get_call_qty.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    pub(crate) fn query_impl(&self, tag_parts: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        self.counters.query_call_qty.fetch_add(1, Ordering::Relaxed);
        if !self.is_open.load(Ordering::Relaxed) {
            self.counters
                .query_call_failed_qty
                .fetch_add(1, Ordering::Relaxed);
            return Err(Error::StoreNotOpen);
        }
        for part in tag_parts {
            if part.len() >= u16::MAX as usize {
                self.counters
                    .query_call_failed_qty
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::BadKeySize);
            }
        }
        if tag_parts.is_empty() {
            return Ok(Vec::new());
        }

        // Drive the intersection from the smallest bucket
        let mut source_idx = None;
        let mut best_count = usize::MAX;
        for (i, part) in tag_parts.iter().enumerate() {
            let count = self.index.entry_count(part);
            if count == 0 {
                return Ok(Vec::new()); // AND with an empty part is empty
            }
            if count < best_count {
                best_count = count;
                source_idx = Some(i);
            }
        }
        let Some(source_idx) = source_idx else {
            return Ok(Vec::new());
        };
        let source_part = tag_parts[source_idx];
        let ids = self.index.snapshot(source_part);

        let mut matches = Vec::new();
        let mut stale = Vec::new();
        for &id in &ids {
            let Some((key, indexes)) = self.keydir.get_key_and_indexes(id) else {
                stale.push(id);
                continue;
            };
            if !entry_has_tag(&key, &indexes, source_part) {
                // The entry no longer declares the driving tag: flag its
                // bucket id for cleaning
                stale.push(id);
                continue;
            }
            let all_present = tag_parts
                .iter()
                .enumerate()
                .all(|(i, part)| i == source_idx || entry_has_tag(&key, &indexes, part));
            if all_present {
                matches.push(key);
            }
        }

        // Lazy cleaning once the bucket has accumulated enough stale ids
        if stale.len() > MIN_CLEAN_ENTRIES
            && stale.len() * 100 > MIN_CLEAN_ARRAY_PERCENT * ids.len()
        {
            self.counters
                .index_array_cleaning_qty
                .fetch_add(1, Ordering::Relaxed);
            let dropped = self
                .index
                .clean_bucket(source_part, &stale, |id| {
                    self.keydir.clean_index(id, source_part)
                });
            self.counters
                .index_array_cleaned_entries
                .fetch_add(dropped, Ordering::Relaxed);
        }

        Ok(matches)
    }
}
