//! Scan-resistant value cache over a bounded TLSF region.
//!
//! Entries live in three intrusive LRU queues. Insertions enter `Cold`. A
//! hit only stamps the entry's ACTIVE bit; the structural moves are deferred
//! to batched maintenance and to the eviction path:
//!
//! - evicting pops the `Cold` tail, but an ACTIVE tail is promoted to `Warm`
//!   instead of being dropped (one hit is enough to survive a scan),
//! - `Warm` beyond its share demotes inactive tails back to `Cold` and
//!   promotes re-touched ones to `Protected`,
//! - `Protected` is bounded to ~40% of the cache capacity; overflow demotes
//!   its LRU back to `Warm`.
//!
//! Entries carry their owner's key hash; a location is only trusted when the
//! owner and size match, so a stale handle after eviction reads as a miss.

use std::sync::atomic::Ordering;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;

use crate::tlsf::{BlockRef, Tlsf};
use crate::types::{CacheCounterCells, NOT_STORED, ValueCacheCounters};

/// Queue identifiers stored in the low flag bits.
const QUEUE_NONE: u16 = 0;
const QUEUE_COLD: u16 = 1;
const QUEUE_WARM: u16 = 2;
const QUEUE_PROTECTED: u16 = 3;
const QUEUE_MASK: u16 = 0x3;

/// Flag stamped on access, consumed by the deferred queue moves.
const FLAG_ACTIVE: u16 = 0x4;

/// Serialized header ahead of the cached value bytes.
const VALUE_CHUNK_HEADER_SIZE: usize = 28;

/// Queue entries handled inline when the background batches fell behind.
const SMALL_BATCH: u32 = 10;

/// Share of the cache capacity the Protected queue may hold.
const PROTECTED_CAP_PERCENT: u64 = 40;
/// Share of the live bytes the Warm queue may hold.
const WARM_SHARE_PERCENT: u64 = 40;

#[derive(Debug, Clone, Copy)]
struct ValueChunk {
    owner_id: u64,
    exp_time_sec: u32,
    size: u32,
    flags: u16,
    prev: u32,
    next: u32,
}

impl ValueChunk {
    fn read_from(bytes: &[u8]) -> Self {
        Self {
            owner_id: LittleEndian::read_u64(&bytes[0..8]),
            exp_time_sec: LittleEndian::read_u32(&bytes[8..12]),
            size: LittleEndian::read_u32(&bytes[12..16]),
            flags: LittleEndian::read_u16(&bytes[16..18]),
            prev: LittleEndian::read_u32(&bytes[20..24]),
            next: LittleEndian::read_u32(&bytes[24..28]),
        }
    }

    fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u64(&mut bytes[0..8], self.owner_id);
        LittleEndian::write_u32(&mut bytes[8..12], self.exp_time_sec);
        LittleEndian::write_u32(&mut bytes[12..16], self.size);
        LittleEndian::write_u16(&mut bytes[16..18], self.flags);
        LittleEndian::write_u16(&mut bytes[18..20], 0);
        LittleEndian::write_u32(&mut bytes[20..24], self.prev);
        LittleEndian::write_u32(&mut bytes[24..28], self.next);
    }
}

#[derive(Debug, Clone, Copy)]
struct Queue {
    head: u32,
    tail: u32,
    bytes: u64,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            head: NOT_STORED,
            tail: NOT_STORED,
            bytes: 0,
        }
    }
}

struct CacheInner {
    tlsf: Tlsf,
    queues: [Queue; 4],
}

enum EvictOutcome {
    Evicted,
    Promoted,
    Empty,
}

/// The value cache. A zero-capacity cache is valid and disabled.
pub(crate) struct ValueCache {
    inner: Mutex<CacheInner>,
    stats: CacheCounterCells,
    max_bytes: u64,
    target_load_percent: std::sync::atomic::AtomicU32,
}

impl ValueCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                tlsf: Tlsf::new(max_bytes),
                queues: [Queue::default(); 4],
            }),
            stats: CacheCounterCells::default(),
            max_bytes,
            target_load_percent: std::sync::atomic::AtomicU32::new(90),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_bytes > 0
    }

    pub fn max_allocatable_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.inner.lock().tlsf.allocated_bytes()
    }

    pub fn counters(&self) -> ValueCacheCounters {
        self.stats.snapshot()
    }

    pub fn set_target_memory_load_percent(&self, percent: u32) {
        self.target_load_percent
            .store(percent.min(100), Ordering::Relaxed);
    }

    /// Drops every cached value; previously returned locations become stale
    /// (and read as misses thanks to the owner check).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.tlsf.reset();
        inner.queues = [Queue::default(); 4];
        self.stats
            .current_in_cache_value_qty
            .store(0, Ordering::Relaxed);
    }

    /// Inserts a value, evicting cold entries as needed. Returns the cache
    /// location, or [`NOT_STORED`] when the value cannot fit.
    pub fn insert_value(&self, data: &[u8], owner_id: u64, exp_time_sec: u32) -> u32 {
        self.stats.insert_call_qty.fetch_add(1, Ordering::Relaxed);
        if !self.is_enabled() {
            return NOT_STORED;
        }
        let target = (VALUE_CHUNK_HEADER_SIZE + data.len()) as u64;
        let mut inner = self.inner.lock();

        let mut block = inner.tlsf.malloc(target);
        if block.is_none() {
            let cc = inner.tlsf.size_check_context(target);
            let mut tries = SMALL_BATCH;
            let mut allocatable = false;
            loop {
                match self.try_evict_one(&mut inner) {
                    EvictOutcome::Empty => break,
                    EvictOutcome::Promoted => {}
                    EvictOutcome::Evicted => {
                        allocatable = inner.tlsf.is_allocatable(&cc);
                    }
                }
                if allocatable || tries == 0 {
                    break;
                }
                tries -= 1;
            }
            if allocatable {
                block = inner.tlsf.malloc(target);
            }
        }
        let Some(block) = block else {
            return NOT_STORED;
        };

        let chunk = ValueChunk {
            owner_id,
            exp_time_sec,
            size: data.len() as u32,
            flags: QUEUE_NONE,
            prev: NOT_STORED,
            next: NOT_STORED,
        };
        let total = VALUE_CHUNK_HEADER_SIZE + data.len();
        let bytes = inner.tlsf.payload_mut(block, total);
        chunk.write_to(bytes);
        bytes[VALUE_CHUNK_HEADER_SIZE..].copy_from_slice(data);

        self.stats
            .current_in_cache_value_qty
            .fetch_add(1, Ordering::Relaxed);
        Self::queue_push_front(&mut inner, QUEUE_COLD, block.0);
        block.0
    }

    /// Copies a cached value out if `loc` still belongs to `owner_id` with
    /// the expected size, stamping the entry active.
    pub fn get_value(&self, loc: u32, owner_id: u64, check_size: u32) -> Option<Vec<u8>> {
        self.stats.get_call_qty.fetch_add(1, Ordering::Relaxed);
        if loc == NOT_STORED || !self.is_enabled() {
            return None;
        }
        let mut inner = self.inner.lock();
        if !inner.tlsf.contains(BlockRef(loc), VALUE_CHUNK_HEADER_SIZE) {
            self.stats.miss_qty.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut chunk = Self::read_chunk(&inner, loc);
        if chunk.owner_id != owner_id || chunk.size != check_size {
            self.stats.miss_qty.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        chunk.flags |= FLAG_ACTIVE;
        Self::write_chunk(&mut inner, loc, &chunk);
        self.stats.hit_qty.fetch_add(1, Ordering::Relaxed);

        let total = VALUE_CHUNK_HEADER_SIZE + chunk.size as usize;
        let bytes = inner.tlsf.payload(BlockRef(loc), total);
        Some(bytes[VALUE_CHUNK_HEADER_SIZE..].to_vec())
    }

    /// Drops a cached value when `loc` still belongs to `owner_id`.
    pub fn remove_value(&self, loc: u32, owner_id: u64) -> bool {
        self.stats.remove_call_qty.fetch_add(1, Ordering::Relaxed);
        if loc == NOT_STORED || !self.is_enabled() {
            return false;
        }
        let mut inner = self.inner.lock();
        if !inner.tlsf.contains(BlockRef(loc), VALUE_CHUNK_HEADER_SIZE) {
            return false;
        }
        let mut chunk = Self::read_chunk(&inner, loc);
        if chunk.owner_id != owner_id || (chunk.flags & QUEUE_MASK) == QUEUE_NONE {
            return false;
        }
        Self::queue_remove(&mut inner, loc);
        chunk.owner_id = 0;
        chunk.flags = QUEUE_NONE;
        Self::write_chunk(&mut inner, loc, &chunk);
        inner.tlsf.free(BlockRef(loc));
        self.stats
            .current_in_cache_value_qty
            .fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Deferred queue moves: promotions, demotions and the Protected cap,
    /// bounded by `batch` entries. Runs on the upkeep thread.
    pub fn maintain_queues(&self, batch: u32) {
        if !self.is_enabled() || batch == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        self.rebalance(&mut inner, batch, false);
    }

    /// Evicts toward the configured target memory load so insertions keep a
    /// free margin. Runs on the upkeep thread.
    pub fn preventive_eviction(&self, batch: u32) {
        if !self.is_enabled() {
            return;
        }
        let target = u64::from(self.target_load_percent.load(Ordering::Relaxed))
            * self.max_bytes
            / 100;
        let mut inner = self.inner.lock();
        for _ in 0..batch {
            if inner.tlsf.allocated_bytes() <= target {
                break;
            }
            match self.try_evict_one(&mut inner) {
                EvictOutcome::Empty => break,
                EvictOutcome::Promoted | EvictOutcome::Evicted => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Queue mechanics (inner lock held)
    // ------------------------------------------------------------------

    fn try_evict_one(&self, inner: &mut CacheInner) -> EvictOutcome {
        if inner.queues[QUEUE_COLD as usize].tail == NOT_STORED {
            self.rebalance(inner, SMALL_BATCH, true);
            if inner.queues[QUEUE_COLD as usize].tail == NOT_STORED {
                return EvictOutcome::Empty;
            }
        }
        let loc = inner.queues[QUEUE_COLD as usize].tail;
        let mut chunk = Self::read_chunk(inner, loc);
        Self::queue_remove(inner, loc);
        if chunk.flags & FLAG_ACTIVE != 0 {
            // One hit since insertion: the entry earned its way to Warm
            Self::queue_push_front(inner, QUEUE_WARM, loc);
            EvictOutcome::Promoted
        } else {
            chunk.owner_id = 0;
            chunk.flags = QUEUE_NONE;
            Self::write_chunk(inner, loc, &chunk);
            inner.tlsf.free(BlockRef(loc));
            self.stats.evicted_qty.fetch_add(1, Ordering::Relaxed);
            self.stats
                .current_in_cache_value_qty
                .fetch_sub(1, Ordering::Relaxed);
            EvictOutcome::Evicted
        }
    }

    /// Moves entries between queues. With `refill_cold` the Warm budget is
    /// ignored until one Cold candidate exists, so eviction can proceed.
    fn rebalance(&self, inner: &mut CacheInner, batch: u32, refill_cold: bool) -> u32 {
        let mut consumed = 0u32;
        let protected_cap = self.max_bytes * PROTECTED_CAP_PERCENT / 100;

        // Protected overflow: demote its LRU back to Warm
        let mut qty = batch;
        while qty > 0
            && inner.queues[QUEUE_PROTECTED as usize].bytes > protected_cap
            && inner.queues[QUEUE_PROTECTED as usize].tail != NOT_STORED
        {
            let loc = inner.queues[QUEUE_PROTECTED as usize].tail;
            Self::queue_remove(inner, loc);
            Self::queue_push_front(inner, QUEUE_WARM, loc);
            consumed += 1;
            qty -= 1;
        }

        // Warm beyond its share: promote re-touched tails, demote idle ones
        let all_bytes: u64 = inner.queues[1..=3].iter().map(|q| q.bytes).sum();
        let mut move_bytes = if refill_cold {
            u64::MAX
        } else {
            inner.queues[QUEUE_WARM as usize]
                .bytes
                .saturating_sub(all_bytes * WARM_SHARE_PERCENT / 100)
        };
        let mut qty = batch;
        while qty > 0 && move_bytes > 0 && inner.queues[QUEUE_WARM as usize].tail != NOT_STORED {
            let loc = inner.queues[QUEUE_WARM as usize].tail;
            let chunk = Self::read_chunk(inner, loc);
            Self::queue_remove(inner, loc);
            if chunk.flags & FLAG_ACTIVE != 0 {
                if inner.queues[QUEUE_PROTECTED as usize].bytes + u64::from(chunk.size)
                    <= protected_cap
                {
                    Self::queue_push_front(inner, QUEUE_PROTECTED, loc);
                } else {
                    Self::queue_push_front(inner, QUEUE_WARM, loc);
                }
            } else {
                Self::queue_push_front(inner, QUEUE_COLD, loc);
            }
            move_bytes = move_bytes.saturating_sub(u64::from(chunk.size));
            consumed += 1;
            qty -= 1;
            if refill_cold && inner.queues[QUEUE_COLD as usize].tail != NOT_STORED {
                break;
            }
        }
        consumed
    }

    fn queue_remove(inner: &mut CacheInner, loc: u32) {
        let mut chunk = Self::read_chunk(inner, loc);
        let queue_id = (chunk.flags & QUEUE_MASK) as usize;
        debug_assert!(queue_id != QUEUE_NONE as usize);

        if chunk.prev != NOT_STORED {
            let mut prev = Self::read_chunk(inner, chunk.prev);
            prev.next = chunk.next;
            Self::write_chunk(inner, chunk.prev, &prev);
        } else {
            inner.queues[queue_id].head = chunk.next;
        }
        if chunk.next != NOT_STORED {
            let mut next = Self::read_chunk(inner, chunk.next);
            next.prev = chunk.prev;
            Self::write_chunk(inner, chunk.next, &next);
        } else {
            inner.queues[queue_id].tail = chunk.prev;
        }
        debug_assert!(inner.queues[queue_id].bytes >= u64::from(chunk.size));
        inner.queues[queue_id].bytes -= u64::from(chunk.size);

        chunk.flags = QUEUE_NONE; // Also clears ACTIVE, consumed by the move
        chunk.prev = NOT_STORED;
        chunk.next = NOT_STORED;
        Self::write_chunk(inner, loc, &chunk);
    }

    fn queue_push_front(inner: &mut CacheInner, queue_id: u16, loc: u32) {
        let mut chunk = Self::read_chunk(inner, loc);
        debug_assert!((chunk.flags & QUEUE_MASK) == QUEUE_NONE);
        chunk.flags = queue_id;
        chunk.prev = NOT_STORED;

        let head = inner.queues[queue_id as usize].head;
        if head != NOT_STORED {
            let mut old_head = Self::read_chunk(inner, head);
            old_head.prev = loc;
            Self::write_chunk(inner, head, &old_head);
            chunk.next = head;
        } else {
            inner.queues[queue_id as usize].tail = loc;
            chunk.next = NOT_STORED;
        }
        inner.queues[queue_id as usize].head = loc;
        inner.queues[queue_id as usize].bytes += u64::from(chunk.size);
        Self::write_chunk(inner, loc, &chunk);
    }

    fn read_chunk(inner: &CacheInner, loc: u32) -> ValueChunk {
        ValueChunk::read_from(inner.tlsf.payload(BlockRef(loc), VALUE_CHUNK_HEADER_SIZE))
    }

    fn write_chunk(inner: &mut CacheInner, loc: u32, chunk: &ValueChunk) {
        chunk.write_to(inner.tlsf.payload_mut(BlockRef(loc), VALUE_CHUNK_HEADER_SIZE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let cache = ValueCache::new(1 << 20);
        let loc = cache.insert_value(b"hello cache", 42, 0);
        assert_ne!(loc, NOT_STORED);

        let value = cache.get_value(loc, 42, 11).expect("cached");
        assert_eq!(value, b"hello cache");

        assert!(cache.remove_value(loc, 42));
        assert!(cache.get_value(loc, 42, 11).is_none());

        let counters = cache.counters();
        assert_eq!(counters.insert_call_qty, 1);
        assert_eq!(counters.hit_qty, 1);
        assert_eq!(counters.current_in_cache_value_qty, 0);
    }

    #[test]
    fn test_owner_and_size_guard() {
        let cache = ValueCache::new(1 << 20);
        let loc = cache.insert_value(b"guarded", 7, 0);
        assert!(cache.get_value(loc, 8, 7).is_none(), "wrong owner");
        assert!(cache.get_value(loc, 7, 99).is_none(), "wrong size");
        assert!(!cache.remove_value(loc, 8), "wrong owner cannot remove");
        assert!(cache.get_value(loc, 7, 7).is_some());
    }

    #[test]
    fn test_disabled_cache() {
        let cache = ValueCache::new(0);
        assert!(!cache.is_enabled());
        assert_eq!(cache.insert_value(b"data", 1, 0), NOT_STORED);
        assert!(cache.get_value(NOT_STORED, 1, 4).is_none());
    }

    #[test]
    fn test_eviction_under_pressure() {
        let cache = ValueCache::new(64 * 1024);
        let mut locs = Vec::new();
        for i in 0..500u64 {
            let data = vec![i as u8; 400];
            locs.push(cache.insert_value(&data, i, 0));
        }
        let counters = cache.counters();
        assert!(counters.evicted_qty > 0, "pressure must evict");
        assert!(
            u64::from(counters.current_in_cache_value_qty) < 500,
            "not everything can stay cached"
        );
        // The most recent insertions are still present
        let last = *locs.last().expect("non-empty");
        assert!(cache.get_value(last, 499, 400).is_some());
    }

    #[test]
    fn test_one_hit_survives_insertion_burst() {
        let cache = ValueCache::new(64 * 1024);
        let loc = cache.insert_value(&[0xEE; 400], 1_000_000, 0);
        assert_ne!(loc, NOT_STORED);
        // One hit stamps the entry active
        assert!(cache.get_value(loc, 1_000_000, 400).is_some());

        // A full-capacity burst of fresh insertions
        for i in 0..400u64 {
            cache.insert_value(&[i as u8; 400], i, 0);
        }

        assert!(
            cache.get_value(loc, 1_000_000, 400).is_some(),
            "a touched entry survives a scan-sized burst"
        );
    }

    #[test]
    fn test_oversized_value_is_skipped() {
        let cache = ValueCache::new(64 * 1024);
        let too_big = vec![0u8; 128 * 1024];
        assert_eq!(cache.insert_value(&too_big, 1, 0), NOT_STORED);
    }

    #[test]
    fn test_maintenance_promotes_and_bounds_protected() {
        let cache = ValueCache::new(64 * 1024);
        let mut locs = Vec::new();
        for i in 0..64u64 {
            locs.push(cache.insert_value(&[1u8; 512], i, 0));
        }
        // Touch half of them twice across maintenance rounds
        for (i, loc) in locs.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
            cache.get_value(*loc, i as u64, 512);
        }
        // Pressure moves touched entries to Warm
        for i in 64..96u64 {
            cache.insert_value(&[2u8; 512], i, 0);
        }
        cache.maintain_queues(256);
        for (i, loc) in locs.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
            cache.get_value(*loc, i as u64, 512);
        }
        cache.maintain_queues(256);

        let inner = cache.inner.lock();
        let protected_cap = cache.max_bytes * PROTECTED_CAP_PERCENT / 100;
        assert!(
            inner.queues[QUEUE_PROTECTED as usize].bytes <= protected_cap,
            "protected queue exceeds its cap"
        );
    }

    #[test]
    fn test_preventive_eviction_reaches_target() {
        let cache = ValueCache::new(64 * 1024);
        cache.set_target_memory_load_percent(50);
        for i in 0..200u64 {
            cache.insert_value(&[3u8; 400], i, 0);
        }
        for _ in 0..50 {
            cache.preventive_eviction(64);
        }
        assert!(
            cache.allocated_bytes() <= cache.max_allocatable_bytes() * 55 / 100,
            "preventive eviction should approach the target load"
        );
    }

    #[test]
    fn test_reset_clears_entries() {
        let cache = ValueCache::new(1 << 20);
        let loc = cache.insert_value(b"stale", 5, 0);
        cache.reset();
        assert!(cache.get_value(loc, 5, 5).is_none());
        assert_eq!(cache.counters().current_in_cache_value_qty, 0);
    }
}
