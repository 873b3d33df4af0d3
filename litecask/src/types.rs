//! Shared types, constants and observable counters

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Maximum number of key indexes an entry may declare.
pub const MAX_KEY_INDEX_QTY: usize = 8;

/// Byte size of one serialized key index pair.
pub const KEY_INDEX_PAIR_SIZE: usize = 2;

/// Largest storable value size in bytes.
pub const MAX_VALUE_SIZE: u32 = 0xFFFF_0000;

/// Sentinel stored in `value_size` fields for tombstone records.
pub const TOMBSTONE_VALUE_SIZE: u32 = 0xFFFF_FFFF;

/// Sentinel for "no location" in compressed arena handles.
pub const NOT_STORED: u32 = 0xFFFF_FFFF;

/// Sentinel for "no file" in `u16` file id fields.
pub const NO_FILE_ID: u16 = 0xFFFF;

/// Smallest accepted `data_file_max_bytes` configuration value.
pub const MIN_DATA_FILE_MAX_BYTES: u64 = 1024;

/// Declares that the key sub-slice `[start, start + len)` is a searchable tag.
///
/// Example: the key `"UJohn Doe/CUS/TTax document/0001"` with indexes
/// `[(0, 9), (10, 3), (14, 13)]` can be queried by user `"UJohn Doe"`,
/// country `"CUS"` or type `"TTax document"`. The leading byte of each slice
/// keeps the "columns" from mixing; the `/` separators are purely cosmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndex {
    /// Start offset of the tag slice within the key
    pub start: u8,
    /// Length of the tag slice, in bytes
    pub len: u8,
}

impl KeyIndex {
    /// Creates a key index covering `[start, start + len)` of the key.
    pub const fn new(start: u8, len: u8) -> Self {
        Self { start, len }
    }
}

/// Aggregated statistics over all data files of an open store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFileStats {
    /// Number of data files currently on disk
    pub file_qty: u64,
    /// Total record count, including tombstones and dead records
    pub entries: u64,
    /// Total record bytes
    pub entry_bytes: u64,
    /// Bytes held by tombstone records
    pub tomb_bytes: u64,
    /// Tombstone record count
    pub tomb_entries: u64,
    /// Bytes of superseded or tombstoned records
    pub dead_bytes: u64,
    /// Superseded or tombstoned record count
    pub dead_entries: u64,
}

/// Snapshot of the datastore call and maintenance counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatastoreCounters {
    pub open_call_qty: u64,
    pub open_call_failed_qty: u64,
    pub close_call_qty: u64,
    pub close_call_failed_qty: u64,
    pub put_call_qty: u64,
    pub put_call_failed_qty: u64,
    pub remove_call_qty: u64,
    pub remove_call_not_found_qty: u64,
    pub remove_call_failed_qty: u64,
    pub get_call_qty: u64,
    pub get_call_not_found_qty: u64,
    pub get_call_corrupted_qty: u64,
    pub get_call_failed_qty: u64,
    pub get_write_buffer_hit_qty: u64,
    pub get_cache_hit_qty: u64,
    pub query_call_qty: u64,
    pub query_call_failed_qty: u64,
    pub data_file_creation_qty: u64,
    pub active_data_file_switch_qty: u64,
    pub index_array_cleaning_qty: u64,
    pub index_array_cleaned_entries: u64,
    pub merge_cycle_qty: u64,
    pub merge_cycle_with_merge_qty: u64,
    pub merge_gained_data_file_qty: u64,
    pub merge_gained_bytes: u64,
    pub hint_file_created_qty: u64,
}

/// Snapshot of the value cache counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueCacheCounters {
    pub insert_call_qty: u64,
    pub get_call_qty: u64,
    pub remove_call_qty: u64,
    pub current_in_cache_value_qty: u32,
    pub hit_qty: u64,
    pub miss_qty: u64,
    pub evicted_qty: u64,
}

/// Internal atomic cells backing [`DatastoreCounters`].
#[derive(Debug, Default)]
pub(crate) struct CounterCells {
    pub open_call_qty: AtomicU64,
    pub open_call_failed_qty: AtomicU64,
    pub close_call_qty: AtomicU64,
    pub close_call_failed_qty: AtomicU64,
    pub put_call_qty: AtomicU64,
    pub put_call_failed_qty: AtomicU64,
    pub remove_call_qty: AtomicU64,
    pub remove_call_not_found_qty: AtomicU64,
    pub remove_call_failed_qty: AtomicU64,
    pub get_call_qty: AtomicU64,
    pub get_call_not_found_qty: AtomicU64,
    pub get_call_corrupted_qty: AtomicU64,
    pub get_call_failed_qty: AtomicU64,
    pub get_write_buffer_hit_qty: AtomicU64,
    pub get_cache_hit_qty: AtomicU64,
    pub query_call_qty: AtomicU64,
    pub query_call_failed_qty: AtomicU64,
    pub data_file_creation_qty: AtomicU64,
    pub active_data_file_switch_qty: AtomicU64,
    pub index_array_cleaning_qty: AtomicU64,
    pub index_array_cleaned_entries: AtomicU64,
    pub merge_cycle_qty: AtomicU64,
    pub merge_cycle_with_merge_qty: AtomicU64,
    pub merge_gained_data_file_qty: AtomicU64,
    pub merge_gained_bytes: AtomicU64,
    pub hint_file_created_qty: AtomicU64,
}

impl CounterCells {
    pub fn snapshot(&self) -> DatastoreCounters {
        let ld = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DatastoreCounters {
            open_call_qty: ld(&self.open_call_qty),
            open_call_failed_qty: ld(&self.open_call_failed_qty),
            close_call_qty: ld(&self.close_call_qty),
            close_call_failed_qty: ld(&self.close_call_failed_qty),
            put_call_qty: ld(&self.put_call_qty),
            put_call_failed_qty: ld(&self.put_call_failed_qty),
            remove_call_qty: ld(&self.remove_call_qty),
            remove_call_not_found_qty: ld(&self.remove_call_not_found_qty),
            remove_call_failed_qty: ld(&self.remove_call_failed_qty),
            get_call_qty: ld(&self.get_call_qty),
            get_call_not_found_qty: ld(&self.get_call_not_found_qty),
            get_call_corrupted_qty: ld(&self.get_call_corrupted_qty),
            get_call_failed_qty: ld(&self.get_call_failed_qty),
            get_write_buffer_hit_qty: ld(&self.get_write_buffer_hit_qty),
            get_cache_hit_qty: ld(&self.get_cache_hit_qty),
            query_call_qty: ld(&self.query_call_qty),
            query_call_failed_qty: ld(&self.query_call_failed_qty),
            data_file_creation_qty: ld(&self.data_file_creation_qty),
            active_data_file_switch_qty: ld(&self.active_data_file_switch_qty),
            index_array_cleaning_qty: ld(&self.index_array_cleaning_qty),
            index_array_cleaned_entries: ld(&self.index_array_cleaned_entries),
            merge_cycle_qty: ld(&self.merge_cycle_qty),
            merge_cycle_with_merge_qty: ld(&self.merge_cycle_with_merge_qty),
            merge_gained_data_file_qty: ld(&self.merge_gained_data_file_qty),
            merge_gained_bytes: ld(&self.merge_gained_bytes),
            hint_file_created_qty: ld(&self.hint_file_created_qty),
        }
    }
}

/// Internal atomic cells backing [`ValueCacheCounters`].
#[derive(Debug, Default)]
pub(crate) struct CacheCounterCells {
    pub insert_call_qty: AtomicU64,
    pub get_call_qty: AtomicU64,
    pub remove_call_qty: AtomicU64,
    pub current_in_cache_value_qty: AtomicU32,
    pub hit_qty: AtomicU64,
    pub miss_qty: AtomicU64,
    pub evicted_qty: AtomicU64,
}

impl CacheCounterCells {
    pub fn snapshot(&self) -> ValueCacheCounters {
        ValueCacheCounters {
            insert_call_qty: self.insert_call_qty.load(Ordering::Relaxed),
            get_call_qty: self.get_call_qty.load(Ordering::Relaxed),
            remove_call_qty: self.remove_call_qty.load(Ordering::Relaxed),
            current_in_cache_value_qty: self.current_in_cache_value_qty.load(Ordering::Relaxed),
            hit_qty: self.hit_qty.load(Ordering::Relaxed),
            miss_qty: self.miss_qty.load(Ordering::Relaxed),
            evicted_qty: self.evicted_qty.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_snapshot() {
        let cells = CounterCells::default();
        cells.put_call_qty.fetch_add(3, Ordering::Relaxed);
        cells.get_cache_hit_qty.fetch_add(1, Ordering::Relaxed);
        let snap = cells.snapshot();
        assert_eq!(snap.put_call_qty, 3);
        assert_eq!(snap.get_cache_hit_qty, 1);
        assert_eq!(snap.get_call_qty, 0);
    }
}
