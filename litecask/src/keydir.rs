//! In-memory key directory: a compact open-addressed hashtable mapping each
//! key to its on-disk location and metadata.
//!
//! Slots hold only a 32-bit hash tag and a 32-bit handle; the variable-length
//! key record (metadata header, key bytes, index pairs) lives in a sharded
//! TLSF arena. 8 slots form a group scanned linearly, groups are probed with
//! an increasing stride. Resizing is incremental: a second table of double
//! capacity is installed, writes land in it, readers consult both, and the
//! upkeep thread migrates a bounded batch of slots per tick.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::tlsf::{BlockRef, Tlsf};
use crate::types::{KEY_INDEX_PAIR_SIZE, KeyIndex, TOMBSTONE_VALUE_SIZE};

/// Slots per group; one group spans a cache line of tags.
const ASSOC_QTY: usize = 8;

/// Hash tag marking an empty slot.
const EMPTY_HASH: u32 = 0;
/// Hash tag marking a dead slot, reclaimed by resize migration.
const TOMBSTONE_HASH: u32 = u32::MAX;

/// Number of key-storage shards; writers on distinct shards do not contend.
const KEY_SHARD_COUNT: usize = 8;
/// Handle bits reserved for the in-shard block reference.
const KEY_SHARD_REF_BITS: u32 = 28;
const KEY_SHARD_REF_MASK: u32 = (1 << KEY_SHARD_REF_BITS) - 1;
/// Per-shard arena cap keeping block references within their bit budget.
const KEY_SHARD_MAX_BYTES: u64 = 1 << 31;

/// Serialized size of the metadata header preceding the key bytes.
pub(crate) const KEY_CHUNK_HEADER_SIZE: usize = 24;

/// Forced-resize batch applied when a new resize arrives before the
/// previous one finished.
const EMERGENCY_RESIZE_BATCH: u32 = 1_000_000;

/// Per-key metadata stored in the key arena, ahead of the key bytes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct KeyChunk {
    pub exp_time_sec: u32,
    pub value_size: u32,
    pub cache_loc: u32,
    pub file_offset: u32,
    pub file_id: u16,
    pub key_size: u16,
    pub index_size: u8,
    pub change_counter: u8,
    /// For tombstones: file holding the version being masked, if known.
    pub prior_file_id: u16,
}

impl KeyChunk {
    pub fn is_tombstone(&self) -> bool {
        self.value_size == TOMBSTONE_VALUE_SIZE
    }

    pub fn is_expired(&self, now_sec: u32) -> bool {
        self.exp_time_sec > 0 && self.exp_time_sec <= now_sec
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            exp_time_sec: LittleEndian::read_u32(&bytes[0..4]),
            value_size: LittleEndian::read_u32(&bytes[4..8]),
            cache_loc: LittleEndian::read_u32(&bytes[8..12]),
            file_offset: LittleEndian::read_u32(&bytes[12..16]),
            file_id: LittleEndian::read_u16(&bytes[16..18]),
            key_size: LittleEndian::read_u16(&bytes[18..20]),
            index_size: bytes[20],
            change_counter: bytes[21],
            prior_file_id: LittleEndian::read_u16(&bytes[22..24]),
        }
    }

    fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(&mut bytes[0..4], self.exp_time_sec);
        LittleEndian::write_u32(&mut bytes[4..8], self.value_size);
        LittleEndian::write_u32(&mut bytes[8..12], self.cache_loc);
        LittleEndian::write_u32(&mut bytes[12..16], self.file_offset);
        LittleEndian::write_u16(&mut bytes[16..18], self.file_id);
        LittleEndian::write_u16(&mut bytes[18..20], self.key_size);
        bytes[20] = self.index_size;
        bytes[21] = self.change_counter;
        LittleEndian::write_u16(&mut bytes[22..24], self.prior_file_id);
    }
}

/// Previous version returned on replace; feeds dead-byte accounting and the
/// tag index diff.
#[derive(Debug, Clone)]
pub(crate) struct OldKeyChunk {
    pub value_size: u32,
    pub cache_loc: u32,
    pub file_id: u16,
    pub index_size: u8,
    pub indexes: Vec<KeyIndex>,
}

impl OldKeyChunk {
    /// Value byte count, treating tombstones as empty.
    pub fn live_value_size(&self) -> u32 {
        if self.value_size == TOMBSTONE_VALUE_SIZE {
            0
        } else {
            self.value_size
        }
    }
}

/// Entry removed by the TTL reaping scan, for dead-byte accounting.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReapedEntry {
    pub key_size: u16,
    pub index_size: u8,
    pub value_size: u32,
    pub file_id: u16,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    hash: u32,
    loc: u32,
}

#[derive(Debug, Default)]
struct Table {
    slots: Vec<Slot>,
    size: u32,
}

impl Table {
    fn with_capacity(capacity: u32) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity as usize >= ASSOC_QTY);
        Self {
            slots: vec![Slot::default(); capacity as usize],
            size: 0,
        }
    }

    fn group_mask(&self) -> u32 {
        (self.slots.len() as u32 - 1) & !(ASSOC_QTY as u32 - 1)
    }
}

#[derive(Debug)]
struct KeyDirInner {
    tables: [Table; 2],
    current: usize,
    resizing: bool,
    resize_next: u32,
    ttl_next: u32,
    max_load_128: u64,
}

/// Sharded TLSF arena holding the key records.
struct KeyArena {
    shards: Vec<Mutex<Tlsf>>,
}

impl KeyArena {
    fn new(max_total_bytes: u64) -> Self {
        let per_shard = (max_total_bytes / KEY_SHARD_COUNT as u64).min(KEY_SHARD_MAX_BYTES);
        Self {
            shards: (0..KEY_SHARD_COUNT)
                .map(|_| Mutex::new(Tlsf::new(per_shard)))
                .collect(),
        }
    }

    fn alloc(&self, hash: u64, size: usize) -> Option<u32> {
        let shard = ((hash >> 32) as usize) & (KEY_SHARD_COUNT - 1);
        let block = self.shards[shard].lock().malloc(size as u64)?;
        debug_assert!(block.0 <= KEY_SHARD_REF_MASK);
        Some(((shard as u32) << KEY_SHARD_REF_BITS) | block.0)
    }

    fn free(&self, loc: u32) {
        let (shard, block) = Self::split(loc);
        self.shards[shard].lock().free(block);
    }

    fn real_size(&self, loc: u32) -> u64 {
        let (shard, block) = Self::split(loc);
        self.shards[shard].lock().real_allocated_size(block)
    }

    fn with_bytes<R>(&self, loc: u32, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let (shard, block) = Self::split(loc);
        let guard = self.shards[shard].lock();
        f(guard.payload(block, len))
    }

    fn with_bytes_mut<R>(&self, loc: u32, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let (shard, block) = Self::split(loc);
        let mut guard = self.shards[shard].lock();
        f(guard.payload_mut(block, len))
    }

    fn allocated_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.lock().allocated_bytes()).sum()
    }

    fn reset(&self) {
        for shard in &self.shards {
            shard.lock().reset();
        }
    }

    fn split(loc: u32) -> (usize, BlockRef) {
        (
            (loc >> KEY_SHARD_REF_BITS) as usize,
            BlockRef(loc & KEY_SHARD_REF_MASK),
        )
    }
}

/// The key directory.
pub(crate) struct KeyDir {
    inner: RwLock<KeyDirInner>,
    arena: KeyArena,
    now_sec: AtomicU32,
    probe_enabled: AtomicBool,
    probe_max: AtomicU64,
    probe_sum: AtomicU64,
    find_count: AtomicU64,
}

impl KeyDir {
    pub fn new(max_key_storage_bytes: u64, initial_capacity: u32) -> Self {
        Self {
            inner: RwLock::new(KeyDirInner {
                tables: [Table::with_capacity(initial_capacity), Table::default()],
                current: 0,
                resizing: false,
                resize_next: 0,
                ttl_next: 0,
                max_load_128: (0.90 * 128.0) as u64,
            }),
            arena: KeyArena::new(max_key_storage_bytes),
            now_sec: AtomicU32::new(0),
            probe_enabled: AtomicBool::new(false),
            probe_max: AtomicU64::new(0),
            probe_sum: AtomicU64::new(0),
            find_count: AtomicU64::new(0),
        }
    }

    /// Drops all entries and key storage, e.g. at (re)open time.
    pub fn reset(&self) {
        let mut inner = self.inner.write();
        let cap = inner.tables[inner.current].slots.len() as u32;
        inner.tables = [Table::with_capacity(cap.max(16)), Table::default()];
        inner.current = 0;
        inner.resizing = false;
        inner.resize_next = 0;
        inner.ttl_next = 0;
        self.arena.reset();
    }

    pub fn set_now(&self, now_sec: u32) {
        self.now_sec.store(now_sec, Ordering::Relaxed);
    }

    pub fn len(&self) -> u32 {
        let inner = self.inner.read();
        inner.tables[0].size + inner.tables[1].size
    }

    pub fn capacity(&self) -> u32 {
        let inner = self.inner.read();
        inner.tables[0]
            .slots
            .len()
            .max(inner.tables[1].slots.len()) as u32
    }

    pub fn load_factor(&self) -> f64 {
        let inner = self.inner.read();
        let size = inner.tables[0].size + inner.tables[1].size;
        let capacity = inner.tables[0].slots.len().max(inner.tables[1].slots.len());
        f64::from(size) / capacity.max(1) as f64
    }

    /// Above this load factor the directory starts an incremental resize.
    pub fn set_max_load_factor(&self, f: f64) -> bool {
        if f <= 0.0 || f > 1.0 {
            return false;
        }
        self.inner.write().max_load_128 = (128.0 * f) as u64;
        true
    }

    pub fn is_resizing(&self) -> bool {
        self.inner.read().resizing
    }

    pub fn estimated_used_memory_bytes(&self) -> u64 {
        let inner = self.inner.read();
        let slots = inner.tables[0].slots.len() + inner.tables[1].slots.len();
        (slots * std::mem::size_of::<Slot>()) as u64 + self.arena.allocated_bytes()
    }

    /// Enables find-path probe accounting (test support).
    pub fn set_probe_instrumentation(&self, enable: bool) {
        self.probe_enabled.store(enable, Ordering::Relaxed);
    }

    /// Returns (max probe count, total probe count, find count) since the
    /// last call, resetting the maximum.
    pub fn take_probe_stats(&self) -> (u64, u64, u64) {
        let max = self.probe_max.swap(0, Ordering::Relaxed);
        (
            max,
            self.probe_sum.load(Ordering::Relaxed),
            self.find_count.load(Ordering::Relaxed),
        )
    }

    /// Looks a key up; expired entries read as absent, tombstones are
    /// returned (the caller inspects the flag).
    pub fn find(&self, hash: u32, key: &[u8]) -> Option<KeyChunk> {
        let hash = bump_hash(hash);
        let now = self.now_sec.load(Ordering::Relaxed);
        let inner = self.inner.read();

        let chunk = self.probe_key(&inner.tables[inner.current], hash, key, now);
        if chunk.is_some() {
            return chunk;
        }
        if inner.resizing {
            return self.probe_key(&inner.tables[1 - inner.current], hash, key, now);
        }
        None
    }

    fn probe_key(&self, table: &Table, hash: u32, key: &[u8], now: u32) -> Option<KeyChunk> {
        let mask = table.group_mask();
        let mut idx = hash & mask;
        let mut probe_incr = 1u32;

        // Dead slots keep probe chains alive, so a pathological table could
        // have no empty slot on this probe path: bound the walk
        for _ in 0..probe_limit(table) {
            let mut cell = 0;
            while cell < ASSOC_QTY {
                let slot = table.slots[(idx as usize) + cell];
                if slot.hash == EMPTY_HASH {
                    break;
                }
                if slot.hash == hash {
                    let chunk = self
                        .arena
                        .with_bytes(slot.loc, KEY_CHUNK_HEADER_SIZE, KeyChunk::read_from);
                    let matched = chunk.key_size as usize == key.len()
                        && self.arena.with_bytes(
                            slot.loc,
                            KEY_CHUNK_HEADER_SIZE + key.len(),
                            |bytes| &bytes[KEY_CHUNK_HEADER_SIZE..] == key,
                        );
                    if matched {
                        if self.probe_enabled.load(Ordering::Relaxed) {
                            self.probe_max
                                .fetch_max(u64::from(probe_incr), Ordering::Relaxed);
                            self.probe_sum
                                .fetch_add(u64::from(probe_incr), Ordering::Relaxed);
                            self.find_count.fetch_add(1, Ordering::Relaxed);
                        }
                        if chunk.is_expired(now) {
                            return None;
                        }
                        return Some(chunk);
                    }
                }
                cell += 1;
            }
            if cell < ASSOC_QTY {
                return None; // Empty slot in the group: key is absent
            }
            idx = (idx + probe_incr * ASSOC_QTY as u32) & mask;
            probe_incr += 1;
        }
        None
    }

    /// Inserts or replaces the entry for `key`, returning the previous
    /// version when there was one.
    pub fn insert_entry(
        &self,
        hash64: u64,
        key: &[u8],
        indexes: &[KeyIndex],
        mut chunk: KeyChunk,
    ) -> Result<Option<OldKeyChunk>> {
        let hash = bump_hash(hash64 as u32);
        let mut inner = self.inner.write();
        let inner = &mut *inner;

        // During a resize a duplicate may still sit in the old table: move
        // its slot out of the way and keep its metadata as the old version.
        let mut displaced: Option<OldKeyChunk> = None;
        if inner.resizing {
            let old_table = &mut inner.tables[1 - inner.current];
            if let Some(pos) = Self::probe_position(&self.arena, old_table, hash, key) {
                let loc = old_table.slots[pos].loc;
                displaced = Some(self.load_old_chunk(loc));
                self.arena.free(loc);
                old_table.slots[pos].hash = TOMBSTONE_HASH;
                old_table.size -= 1;
            }
        }

        let table = &mut inner.tables[inner.current];
        if let Some(pos) = Self::probe_position(&self.arena, table, hash, key) {
            let loc = table.slots[pos].loc;
            let old = self.load_old_chunk(loc);
            let new_loc = self.update_record(loc, hash64, key, indexes, &mut chunk, &old)?;
            table.slots[pos].loc = new_loc;
            return Ok(Some(old));
        }

        // Fresh insertion
        let record_size =
            KEY_CHUNK_HEADER_SIZE + key.len() + indexes.len() * KEY_INDEX_PAIR_SIZE;
        chunk.key_size = key.len() as u16;
        chunk.index_size = (indexes.len() * KEY_INDEX_PAIR_SIZE) as u8;
        let loc = self
            .arena
            .alloc(hash64, record_size)
            .ok_or(Error::OutOfMemory)?;
        self.arena.with_bytes_mut(loc, record_size, |bytes| {
            chunk.write_to(bytes);
            bytes[KEY_CHUNK_HEADER_SIZE..KEY_CHUNK_HEADER_SIZE + key.len()].copy_from_slice(key);
            encode_indexes(indexes, &mut bytes[KEY_CHUNK_HEADER_SIZE + key.len()..]);
        });

        let table = &mut inner.tables[inner.current];
        let pos = Self::probe_insert_position(table, hash);
        table.slots[pos] = Slot { hash, loc };
        table.size += 1;

        let total = u64::from(inner.tables[0].size + inner.tables[1].size);
        let capacity = inner.tables[inner.current].slots.len() as u64;
        if 128 * total > inner.max_load_128 * capacity {
            let new_capacity = (capacity * 2) as u32;
            self.start_resize(inner, new_capacity);
        }
        Ok(displaced)
    }

    /// Marks the slot of `key` dead and releases its record. The slot is
    /// reclaimed by the next resize migration.
    pub fn remove(&self, hash: u32, key: &[u8]) -> bool {
        let hash = bump_hash(hash);
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        for table_idx in [inner.current, 1 - inner.current] {
            if table_idx != inner.current && !inner.resizing {
                break;
            }
            let table = &mut inner.tables[table_idx];
            if table.slots.is_empty() {
                continue;
            }
            if let Some(pos) = Self::probe_position(&self.arena, table, hash, key) {
                self.arena.free(table.slots[pos].loc);
                table.slots[pos].hash = TOMBSTONE_HASH;
                table.size -= 1;
                return true;
            }
        }
        false
    }

    /// Returns the key bytes and decoded indexes of a live entry with this
    /// hash, if any. Tag queries resolve key ids through this.
    pub fn get_key_and_indexes(&self, hash: u32) -> Option<(Vec<u8>, Vec<KeyIndex>)> {
        let hash = bump_hash(hash);
        let now = self.now_sec.load(Ordering::Relaxed);
        let inner = self.inner.read();

        let found = self.scan_hash_valid(&inner.tables[inner.current], hash, now);
        if found.is_some() {
            return found;
        }
        if inner.resizing {
            return self.scan_hash_valid(&inner.tables[1 - inner.current], hash, now);
        }
        None
    }

    fn scan_hash_valid(
        &self,
        table: &Table,
        hash: u32,
        now: u32,
    ) -> Option<(Vec<u8>, Vec<KeyIndex>)> {
        if table.slots.is_empty() {
            return None;
        }
        let mask = table.group_mask();
        let mut idx = hash & mask;
        let mut probe_incr = 1u32;
        for _ in 0..probe_limit(table) {
            let mut cell = 0;
            while cell < ASSOC_QTY {
                let slot = table.slots[(idx as usize) + cell];
                if slot.hash == EMPTY_HASH {
                    break;
                }
                if slot.hash == hash {
                    let header = self
                        .arena
                        .with_bytes(slot.loc, KEY_CHUNK_HEADER_SIZE, KeyChunk::read_from);
                    if !header.is_tombstone() && !header.is_expired(now) {
                        let total = KEY_CHUNK_HEADER_SIZE
                            + header.key_size as usize
                            + header.index_size as usize;
                        return Some(self.arena.with_bytes(slot.loc, total, |bytes| {
                            let key =
                                bytes[KEY_CHUNK_HEADER_SIZE..KEY_CHUNK_HEADER_SIZE + header.key_size as usize]
                                    .to_vec();
                            let indexes = decode_indexes(
                                &bytes[KEY_CHUNK_HEADER_SIZE + header.key_size as usize..],
                            );
                            (key, indexes)
                        }));
                    }
                }
                cell += 1;
            }
            if cell < ASSOC_QTY {
                return None;
            }
            idx = (idx + probe_incr * ASSOC_QTY as u32) & mask;
            probe_incr += 1;
        }
        None
    }

    /// Strips the tag slice `tag` from a dead entry carrying this hash.
    /// Returns true when the tag bucket should drop this key id.
    pub fn clean_index(&self, hash: u32, tag: &[u8]) -> bool {
        let hash = bump_hash(hash);
        let now = self.now_sec.load(Ordering::Relaxed);
        let inner = self.inner.write();

        for table_idx in [inner.current, 1 - inner.current] {
            if table_idx != inner.current && !inner.resizing {
                break;
            }
            let table = &inner.tables[table_idx];
            if table.slots.is_empty() {
                continue;
            }
            let mask = table.group_mask();
            let mut idx = hash & mask;
            let mut probe_incr = 1u32;
            'probe: for _ in 0..probe_limit(table) {
                let mut cell = 0;
                while cell < ASSOC_QTY {
                    let slot = table.slots[(idx as usize) + cell];
                    if slot.hash == EMPTY_HASH {
                        break;
                    }
                    if slot.hash == hash {
                        let header = self
                            .arena
                            .with_bytes(slot.loc, KEY_CHUNK_HEADER_SIZE, KeyChunk::read_from);
                        if (header.is_tombstone() || header.is_expired(now))
                            && self.strip_tag_from_record(slot.loc, &header, tag)
                        {
                            return true;
                        }
                    }
                    cell += 1;
                }
                if cell < ASSOC_QTY {
                    break 'probe;
                }
                idx = (idx + probe_incr * ASSOC_QTY as u32) & mask;
                probe_incr += 1;
            }
        }
        // No matching entry left: the bucket id is stale either way
        true
    }

    fn strip_tag_from_record(&self, loc: u32, header: &KeyChunk, tag: &[u8]) -> bool {
        let total =
            KEY_CHUNK_HEADER_SIZE + header.key_size as usize + header.index_size as usize;
        self.arena.with_bytes_mut(loc, total, |bytes| {
            let key_end = KEY_CHUNK_HEADER_SIZE + header.key_size as usize;
            let mut offset = key_end;
            while offset + KEY_INDEX_PAIR_SIZE <= total {
                let start = bytes[offset] as usize;
                let len = bytes[offset + 1] as usize;
                let key = &bytes[KEY_CHUNK_HEADER_SIZE..key_end];
                if len == tag.len()
                    && start + len <= key.len()
                    && &key[start..start + len] == tag
                {
                    bytes.copy_within(offset + KEY_INDEX_PAIR_SIZE..total, offset);
                    let mut chunk = KeyChunk::read_from(bytes);
                    chunk.index_size -= KEY_INDEX_PAIR_SIZE as u8;
                    chunk.write_to(bytes);
                    return true;
                }
                offset += KEY_INDEX_PAIR_SIZE;
            }
            false
        })
    }

    /// Repoints the cached value location, guarded against concurrent
    /// replacement by the value size and change counter.
    pub fn update_cached_value_location(
        &self,
        hash: u32,
        key: &[u8],
        check_value_size: u32,
        check_change_counter: u8,
        new_cache_loc: u32,
    ) {
        let hash = bump_hash(hash);
        let inner = self.inner.write();
        for table_idx in [inner.current, 1 - inner.current] {
            if table_idx != inner.current && !inner.resizing {
                break;
            }
            let table = &inner.tables[table_idx];
            if table.slots.is_empty() {
                continue;
            }
            if let Some(pos) = Self::probe_position(&self.arena, table, hash, key) {
                let loc = table.slots[pos].loc;
                self.arena.with_bytes_mut(loc, KEY_CHUNK_HEADER_SIZE, |bytes| {
                    let mut chunk = KeyChunk::read_from(bytes);
                    if chunk.value_size == check_value_size
                        && chunk.change_counter == check_change_counter
                    {
                        chunk.cache_loc = new_cache_loc;
                        chunk.write_to(bytes);
                    }
                });
                return;
            }
        }
    }

    /// Repoints an entry moved by a merge, guarded by its previous location.
    pub fn update_merged_value_location(
        &self,
        hash: u32,
        old_file_id: u16,
        old_file_offset: u32,
        new_file_id: u16,
        new_file_offset: u32,
    ) {
        let hash = bump_hash(hash);
        let inner = self.inner.write();
        for table_idx in [inner.current, 1 - inner.current] {
            if table_idx != inner.current && !inner.resizing {
                break;
            }
            let table = &inner.tables[table_idx];
            if table.slots.is_empty() {
                continue;
            }
            let mask = table.group_mask();
            let mut idx = hash & mask;
            let mut probe_incr = 1u32;
            'probe: for _ in 0..probe_limit(table) {
                let mut cell = 0;
                while cell < ASSOC_QTY {
                    let slot = table.slots[(idx as usize) + cell];
                    if slot.hash == EMPTY_HASH {
                        break;
                    }
                    if slot.hash == hash {
                        let done =
                            self.arena
                                .with_bytes_mut(slot.loc, KEY_CHUNK_HEADER_SIZE, |bytes| {
                                    let mut chunk = KeyChunk::read_from(bytes);
                                    if chunk.file_id == old_file_id
                                        && chunk.file_offset == old_file_offset
                                    {
                                        chunk.file_id = new_file_id;
                                        chunk.file_offset = new_file_offset;
                                        chunk.write_to(bytes);
                                        true
                                    } else {
                                        false
                                    }
                                });
                        if done {
                            return;
                        }
                    }
                    cell += 1;
                }
                if cell < ASSOC_QTY {
                    break 'probe;
                }
                idx = (idx + probe_incr * ASSOC_QTY as u32) & mask;
                probe_incr += 1;
            }
        }
    }

    /// Migrates up to `batch` slots of an ongoing resize. Cheap no-op when
    /// no resize is in progress.
    pub fn background_resize_work(&self, batch: u32) {
        let mut inner = self.inner.write();
        Self::resize_step(&mut *inner, batch);
    }

    fn resize_step(inner: &mut KeyDirInner, batch: u32) {
        if !inner.resizing {
            return;
        }
        let old_idx = 1 - inner.current;
        let (old, new) = if old_idx == 0 {
            let (a, b) = inner.tables.split_at_mut(1);
            (&mut a[0], &mut b[0])
        } else {
            let (a, b) = inner.tables.split_at_mut(1);
            (&mut b[0], &mut a[0])
        };

        let last = (inner.resize_next + batch).min(old.slots.len() as u32);
        for old_pos in inner.resize_next..last {
            let slot = old.slots[old_pos as usize];
            if slot.hash == EMPTY_HASH || slot.hash == TOMBSTONE_HASH {
                continue;
            }
            let pos = Self::probe_insert_position(new, slot.hash);
            new.slots[pos] = slot;
            new.size += 1;
            old.size -= 1;
        }
        inner.resize_next = last;
        if last == old.slots.len() as u32 {
            old.size = 0;
            old.slots = Vec::new();
            inner.resizing = false;
        }
    }

    fn start_resize(&self, inner: &mut KeyDirInner, new_capacity: u32) {
        if inner.resizing {
            // The previous resize did not finish in time: force-finish it
            while inner.resizing {
                Self::resize_step(inner, EMERGENCY_RESIZE_BATCH);
            }
            tracing::debug!("keydir resize force-finished before restart");
        }
        let other = 1 - inner.current;
        inner.tables[other] = Table::with_capacity(new_capacity);
        inner.resize_next = 0;
        inner.current = other;
        inner.resizing = true;
        tracing::debug!("keydir resizing to {new_capacity} slots started");
    }

    /// Scans up to `batch` slots for entries with an elapsed TTL, removing
    /// them and reporting what was dropped for cache/accounting updates.
    pub fn reap_expired(&self, batch: u32) -> Vec<ReapedEntry> {
        let now = self.now_sec.load(Ordering::Relaxed);
        let mut reaped = Vec::new();
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let table = &mut inner.tables[inner.current];
        if table.slots.is_empty() {
            return reaped;
        }
        let capacity = table.slots.len() as u32;
        let last = (inner.ttl_next + batch).min(capacity);

        for pos in inner.ttl_next..last {
            let slot = table.slots[pos as usize];
            if slot.hash == EMPTY_HASH || slot.hash == TOMBSTONE_HASH {
                continue;
            }
            let chunk = self
                .arena
                .with_bytes(slot.loc, KEY_CHUNK_HEADER_SIZE, KeyChunk::read_from);
            if chunk.is_tombstone() || !chunk.is_expired(now) {
                continue;
            }
            reaped.push(ReapedEntry {
                key_size: chunk.key_size,
                index_size: chunk.index_size,
                value_size: chunk.value_size,
                file_id: chunk.file_id,
            });
            self.arena.free(slot.loc);
            table.slots[pos as usize].hash = TOMBSTONE_HASH;
            table.size -= 1;
        }
        inner.ttl_next = if last >= capacity { 0 } else { last };
        reaped
    }

    // ------------------------------------------------------------------
    // Probing helpers
    // ------------------------------------------------------------------

    /// Position of the slot holding `key`, if present.
    fn probe_position(arena: &KeyArena, table: &Table, hash: u32, key: &[u8]) -> Option<usize> {
        if table.slots.is_empty() {
            return None;
        }
        let mask = table.group_mask();
        let mut idx = hash & mask;
        let mut probe_incr = 1u32;
        for _ in 0..probe_limit(table) {
            let mut cell = 0;
            while cell < ASSOC_QTY {
                let slot = table.slots[(idx as usize) + cell];
                if slot.hash == EMPTY_HASH {
                    break;
                }
                if slot.hash == hash {
                    let header =
                        arena.with_bytes(slot.loc, KEY_CHUNK_HEADER_SIZE, KeyChunk::read_from);
                    let matches = header.key_size as usize == key.len()
                        && arena.with_bytes(slot.loc, KEY_CHUNK_HEADER_SIZE + key.len(), |bytes| {
                            &bytes[KEY_CHUNK_HEADER_SIZE..] == key
                        });
                    if matches {
                        return Some((idx as usize) + cell);
                    }
                }
                cell += 1;
            }
            if cell < ASSOC_QTY {
                return None;
            }
            idx = (idx + probe_incr * ASSOC_QTY as u32) & mask;
            probe_incr += 1;
        }
        None
    }

    /// First reusable position for a fresh insert of `hash` (the key is
    /// known to be absent).
    fn probe_insert_position(table: &Table, hash: u32) -> usize {
        let mask = table.group_mask();
        let mut idx = hash & mask;
        let mut probe_incr = 1u32;
        let mut reusable: Option<usize> = None;
        for _ in 0..probe_limit(table) {
            let mut cell = 0;
            while cell < ASSOC_QTY {
                let slot = table.slots[(idx as usize) + cell];
                if slot.hash == EMPTY_HASH {
                    return reusable.unwrap_or((idx as usize) + cell);
                }
                if slot.hash == TOMBSTONE_HASH && reusable.is_none() {
                    reusable = Some((idx as usize) + cell);
                }
                cell += 1;
            }
            if let Some(pos) = reusable {
                // A reclaimed slot on the chain is good enough once the
                // probe walk gets long
                return pos;
            }
            idx = (idx + probe_incr * ASSOC_QTY as u32) & mask;
            probe_incr += 1;
        }
        reusable.expect("hash table probe found neither an empty nor a dead slot")
    }

    fn load_old_chunk(&self, loc: u32) -> OldKeyChunk {
        let header = self
            .arena
            .with_bytes(loc, KEY_CHUNK_HEADER_SIZE, KeyChunk::read_from);
        let total =
            KEY_CHUNK_HEADER_SIZE + header.key_size as usize + header.index_size as usize;
        let indexes = self.arena.with_bytes(loc, total, |bytes| {
            decode_indexes(&bytes[KEY_CHUNK_HEADER_SIZE + header.key_size as usize..])
        });
        OldKeyChunk {
            value_size: header.value_size,
            cache_loc: header.cache_loc,
            file_id: header.file_id,
            index_size: header.index_size,
            indexes,
        }
    }

    /// Rewrites the record at `loc` for an update, reallocating when the new
    /// index pairs do not fit. Returns the (possibly new) location.
    fn update_record(
        &self,
        loc: u32,
        hash64: u64,
        key: &[u8],
        indexes: &[KeyIndex],
        chunk: &mut KeyChunk,
        old: &OldKeyChunk,
    ) -> Result<u32> {
        let old_header = self
            .arena
            .with_bytes(loc, KEY_CHUNK_HEADER_SIZE, KeyChunk::read_from);
        chunk.key_size = key.len() as u16;
        chunk.index_size = (indexes.len() * KEY_INDEX_PAIR_SIZE) as u8;
        chunk.change_counter = old_header.change_counter.wrapping_add(1);

        let accessible =
            self.arena.real_size(loc) as usize - KEY_CHUNK_HEADER_SIZE - key.len();
        if chunk.index_size as usize > accessible {
            // The current record is too small for the new index pairs
            let record_size =
                KEY_CHUNK_HEADER_SIZE + key.len() + indexes.len() * KEY_INDEX_PAIR_SIZE;
            let new_loc = self
                .arena
                .alloc(hash64, record_size)
                .ok_or(Error::OutOfMemory)?;
            let chunk = *chunk;
            self.arena.with_bytes_mut(new_loc, record_size, |bytes| {
                chunk.write_to(bytes);
                bytes[KEY_CHUNK_HEADER_SIZE..KEY_CHUNK_HEADER_SIZE + key.len()]
                    .copy_from_slice(key);
                encode_indexes(indexes, &mut bytes[KEY_CHUNK_HEADER_SIZE + key.len()..]);
            });
            self.arena.free(loc);
            return Ok(new_loc);
        }

        if chunk.is_tombstone() {
            // Keep the previous index pairs on deletion: if the key returns
            // later with matching tags, the buckets must not double up
            chunk.index_size = old.index_size;
            let chunk = *chunk;
            self.arena
                .with_bytes_mut(loc, KEY_CHUNK_HEADER_SIZE, |bytes| chunk.write_to(bytes));
            return Ok(loc);
        }

        let total = KEY_CHUNK_HEADER_SIZE + key.len() + chunk.index_size as usize;
        let chunk = *chunk;
        self.arena.with_bytes_mut(loc, total, |bytes| {
            chunk.write_to(bytes);
            encode_indexes(indexes, &mut bytes[KEY_CHUNK_HEADER_SIZE + key.len()..]);
        });
        Ok(loc)
    }
}

/// Upper bound on group hops for one probe walk; generous compared to any
/// healthy load factor.
fn probe_limit(table: &Table) -> usize {
    table.slots.len() / ASSOC_QTY * 2 + 2
}

fn bump_hash(hash: u32) -> u32 {
    match hash {
        EMPTY_HASH => 1,
        TOMBSTONE_HASH => TOMBSTONE_HASH - 1,
        h => h,
    }
}

pub(crate) fn encode_indexes(indexes: &[KeyIndex], out: &mut [u8]) {
    for (i, ki) in indexes.iter().enumerate() {
        out[i * KEY_INDEX_PAIR_SIZE] = ki.start;
        out[i * KEY_INDEX_PAIR_SIZE + 1] = ki.len;
    }
}

pub(crate) fn decode_indexes(bytes: &[u8]) -> Vec<KeyIndex> {
    bytes
        .chunks_exact(KEY_INDEX_PAIR_SIZE)
        .map(|pair| KeyIndex::new(pair[0], pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::types::NOT_STORED;

    fn hash32(data: &[u8]) -> u32 {
        hash_bytes(data) as u32
    }

    fn chunk_for(file_id: u16, offset: u32, value_size: u32) -> KeyChunk {
        KeyChunk {
            exp_time_sec: 0,
            value_size,
            cache_loc: NOT_STORED,
            file_offset: offset,
            file_id,
            key_size: 0,
            index_size: 0,
            change_counter: 0,
            prior_file_id: crate::types::NO_FILE_ID,
        }
    }

    fn insert(kd: &KeyDir, key: &[u8], chunk: KeyChunk) -> Option<OldKeyChunk> {
        kd.insert_entry(hash_bytes(key), key, &[], chunk).expect("insert")
    }

    #[test]
    fn test_insert_find_replace() {
        let kd = KeyDir::new(1 << 22, 64);
        assert!(insert(&kd, b"alpha", chunk_for(1, 0, 10)).is_none());
        assert_eq!(kd.len(), 1);

        let found = kd.find(hash32(b"alpha"), b"alpha").expect("present");
        assert_eq!(found.file_id, 1);
        assert_eq!(found.value_size, 10);

        let old = insert(&kd, b"alpha", chunk_for(2, 100, 20)).expect("old version");
        assert_eq!(old.file_id, 1);
        assert_eq!(old.value_size, 10);
        assert_eq!(kd.len(), 1);

        let found = kd.find(hash32(b"alpha"), b"alpha").expect("present");
        assert_eq!(found.file_id, 2);
        assert_eq!(found.file_offset, 100);
    }

    #[test]
    fn test_missing_and_removed_keys() {
        let kd = KeyDir::new(1 << 22, 64);
        assert!(kd.find(hash32(b"ghost"), b"ghost").is_none());

        insert(&kd, b"gone", chunk_for(1, 0, 5));
        assert!(kd.remove(hash32(b"gone"), b"gone"));
        assert!(kd.find(hash32(b"gone"), b"gone").is_none());
        assert_eq!(kd.len(), 0);
        assert!(!kd.remove(hash32(b"gone"), b"gone"));
    }

    #[test]
    fn test_tombstone_update_keeps_indexes() {
        let kd = KeyDir::new(1 << 22, 64);
        let indexes = [KeyIndex::new(0, 2), KeyIndex::new(2, 3)];
        kd.insert_entry(hash_bytes(b"tagged"), b"tagged", &indexes, chunk_for(1, 0, 9))
            .expect("insert");

        let mut tomb = chunk_for(2, 40, TOMBSTONE_VALUE_SIZE);
        tomb.prior_file_id = 1;
        let old = kd
            .insert_entry(hash_bytes(b"tagged"), b"tagged", &[], tomb)
            .expect("tombstone")
            .expect("old present");
        assert_eq!(old.indexes.len(), 2);

        // The tombstone keeps the previous tag pairs for bucket hygiene
        let chunk = kd.find(hash32(b"tagged"), b"tagged").expect("tombstone visible");
        assert!(chunk.is_tombstone());
        assert_eq!(chunk.index_size, 4);
        assert_eq!(chunk.prior_file_id, 1);
    }

    #[test]
    fn test_incremental_resize_keeps_entries_reachable() {
        let kd = KeyDir::new(1 << 24, 16);
        let keys: Vec<Vec<u8>> = (0..2000u32).map(|i| format!("key-{i}").into_bytes()).collect();
        for (i, key) in keys.iter().enumerate() {
            insert(&kd, key, chunk_for(1, i as u32, 8));
            // Drain any pending resize slowly, touching the mixed state
            if kd.is_resizing() {
                kd.background_resize_work(16);
            }
        }
        while kd.is_resizing() {
            kd.background_resize_work(64);
        }
        assert_eq!(kd.len(), keys.len() as u32);
        assert!(kd.capacity() >= 2048, "table doubled along the way");
        assert!(kd.load_factor() < 0.95);
        for (i, key) in keys.iter().enumerate() {
            let found = kd.find(hash32(key), key).expect("reachable after resize");
            assert_eq!(found.file_offset, i as u32);
        }
    }

    #[test]
    fn test_update_during_resize_tombstones_old_duplicate() {
        let kd = KeyDir::new(1 << 24, 16);
        for i in 0..64u32 {
            let key = format!("k{i}").into_bytes();
            insert(&kd, &key, chunk_for(1, i, 8));
        }
        assert!(kd.is_resizing(), "64 entries into 16 slots must resize");

        // Replace an entry while both tables are live
        let old = insert(&kd, b"k3", chunk_for(2, 999, 8)).expect("old version");
        assert_eq!(old.file_id, 1);
        while kd.is_resizing() {
            kd.background_resize_work(8);
        }
        let found = kd.find(hash32(b"k3"), b"k3").expect("present");
        assert_eq!(found.file_id, 2);
        assert_eq!(found.file_offset, 999);
        assert_eq!(kd.len(), 64);
    }

    #[test]
    fn test_ttl_expiry_and_reaping() {
        let kd = KeyDir::new(1 << 22, 64);
        kd.set_now(1000);
        let mut chunk = chunk_for(1, 0, 6);
        chunk.exp_time_sec = 1010;
        insert(&kd, b"mayfly", chunk);
        insert(&kd, b"oak", chunk_for(1, 50, 6));

        assert!(kd.find(hash32(b"mayfly"), b"mayfly").is_some());
        kd.set_now(1010);
        assert!(kd.find(hash32(b"mayfly"), b"mayfly").is_none(), "expired reads as absent");

        let reaped = kd.reap_expired(1024);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].value_size, 6);
        assert_eq!(kd.len(), 1);
        assert!(kd.find(hash32(b"oak"), b"oak").is_some());
        assert!(kd.reap_expired(1024).is_empty());
    }

    #[test]
    fn test_out_of_memory_is_graceful() {
        // A shard cap this small cannot hold more than a handful of records
        let kd = KeyDir::new(64 * 1024 * KEY_SHARD_COUNT as u64, 1 << 16);
        let mut stored = 0u32;
        let mut failed = false;
        for i in 0..100_000u32 {
            let key = format!("key-{i:06}").into_bytes();
            match kd.insert_entry(hash_bytes(&key), &key, &[], chunk_for(1, i, 8)) {
                Ok(_) => stored += 1,
                Err(Error::OutOfMemory) => {
                    failed = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(failed, "the key arena should eventually refuse");
        assert!(stored > 0);
        assert_eq!(kd.len(), stored);
    }

    #[test]
    fn test_probe_counts_stay_bounded() {
        let kd = KeyDir::new(1 << 26, 1 << 14);
        kd.set_max_load_factor(0.90);
        let entries = ((1 << 14) as f64 * 0.88) as u32;
        let keys: Vec<Vec<u8>> = (0..entries).map(|i| format!("probe-key-{i}").into_bytes()).collect();
        for (i, key) in keys.iter().enumerate() {
            insert(&kd, key, chunk_for(1, i as u32, 8));
        }
        while kd.is_resizing() {
            kd.background_resize_work(1 << 14);
        }

        kd.set_probe_instrumentation(true);
        for key in &keys {
            kd.find(hash32(key), key).expect("present");
        }
        let (max, sum, count) = kd.take_probe_stats();
        assert_eq!(count, u64::from(entries));
        let average = sum as f64 / count as f64;
        assert!(average < 5.0, "average probe count {average} too high");
        assert!(max < 50, "max probe count {max} too high");
    }

    #[test]
    fn test_merged_location_patch() {
        let kd = KeyDir::new(1 << 22, 64);
        insert(&kd, b"moved", chunk_for(3, 300, 12));
        kd.update_merged_value_location(hash32(b"moved"), 3, 300, 7, 64);
        let found = kd.find(hash32(b"moved"), b"moved").expect("present");
        assert_eq!(found.file_id, 7);
        assert_eq!(found.file_offset, 64);

        // A stale patch (wrong old location) is ignored
        kd.update_merged_value_location(hash32(b"moved"), 3, 300, 9, 128);
        let found = kd.find(hash32(b"moved"), b"moved").expect("present");
        assert_eq!(found.file_id, 7);
    }

    #[test]
    fn test_cached_location_patch_is_guarded() {
        let kd = KeyDir::new(1 << 22, 64);
        insert(&kd, b"cached", chunk_for(1, 0, 32));
        let chunk = kd.find(hash32(b"cached"), b"cached").expect("present");

        kd.update_cached_value_location(hash32(b"cached"), b"cached", 32, chunk.change_counter, 77);
        assert_eq!(kd.find(hash32(b"cached"), b"cached").expect("present").cache_loc, 77);

        // Wrong change counter: the entry was replaced meanwhile, skip
        kd.update_cached_value_location(hash32(b"cached"), b"cached", 32, chunk.change_counter.wrapping_add(5), 99);
        assert_eq!(kd.find(hash32(b"cached"), b"cached").expect("present").cache_loc, 77);
    }
}
