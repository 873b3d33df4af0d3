//! Two-level segregated-fit allocator over a contiguous byte arena.
//!
//! Backs the value cache and the KeyDir key storage. The arena is a single
//! growable byte region capped at construction time; block references are
//! 32-bit compressed handles (byte offset shifted by the 8-byte alignment),
//! which keeps the in-memory directory structures compact.
//!
//! First-level classes split sizes by power of two, the second level splits
//! each power-of-two range into 16 linear sub-ranges. Two bitmaps record the
//! non-empty free lists so `malloc` finds the lowest fitting list with a
//! couple of bit scans. `malloc` and `free` are O(1); freed blocks coalesce
//! with their physical neighbours.
//!
//! Physical layout of a block at header offset `h` (all offsets 8-aligned):
//!
//! ```text
//! [h - 8]  handle of previous physical block, valid only when it is free
//! [h + 0]  u64: payload size | FREE flag | PREV_FREE flag
//! [h + 8]  payload  (free blocks store the next/prev free-list links here)
//! ```
//!
//! The last 8 bytes of the arena hold a zero-size sentinel block so the
//! coalescing walk never runs past the end.

use byteorder::{ByteOrder, LittleEndian};

const ALIGN_SHIFT: u32 = 3;
const ALIGN: u64 = 1 << ALIGN_SHIFT;
const SL_SHIFT: u32 = 4;
const SL_QTY: usize = 1 << SL_SHIFT;
const FL_SHIFT: u32 = SL_SHIFT + ALIGN_SHIFT;
const FL_QTY: usize = 32;
/// Sizes below this all live in first-level class 0, in 8-byte steps.
const SMALL_SIZE: u64 = 1 << FL_SHIFT;
/// Upper bound of a single allocation.
const MAX_ALLOC_SIZE: u64 = 1 << (FL_QTY as u32 + FL_SHIFT - 2);
/// Smallest payload; keeps room for the two free-list links.
const MIN_ALLOC_SIZE: u64 = 16;
/// Per-block bookkeeping: the size-and-flags word before the payload.
const BLOCK_OVERHEAD: u64 = 8;
/// Arena growth granularity.
const GRANULE: u64 = 64 * 1024;

const FLAG_FREE: u64 = 0x1;
const FLAG_PREV_FREE: u64 = 0x2;
const FLAG_MASK: u64 = FLAG_FREE | FLAG_PREV_FREE;

const NIL: u32 = u32::MAX;

/// Compressed handle to an allocated payload (byte offset >> 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef(pub u32);

impl BlockRef {
    /// Sentinel for "no block".
    pub const NONE: BlockRef = BlockRef(u32::MAX);

    pub fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Byte offset of the payload within the arena.
    fn byte_offset(self) -> usize {
        (self.0 as usize) << ALIGN_SHIFT
    }
}

/// Precomputed bitmap masks for a cheap "would an allocation of this size
/// succeed" probe, used by the cache eviction loop.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext {
    fl: usize,
    fl_mask: u32,
    sl_mask: u32,
}

/// The allocator. Thread safety is enforced by the owner.
pub struct Tlsf {
    arena: Vec<u8>,
    arena_len: u64,
    max_bytes: u64,
    fl_bitmap: u32,
    sl_bitmaps: [u32; FL_QTY],
    free_heads: [[u32; SL_QTY]; FL_QTY],
    allocated_bytes: u64,
}

impl std::fmt::Debug for Tlsf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tlsf")
            .field("arena_len", &self.arena_len)
            .field("max_bytes", &self.max_bytes)
            .field("allocated_bytes", &self.allocated_bytes)
            .finish_non_exhaustive()
    }
}

impl Tlsf {
    /// Creates an allocator able to grow up to `max_allocatable_bytes`.
    pub fn new(max_allocatable_bytes: u64) -> Self {
        Self {
            arena: Vec::new(),
            arena_len: 0,
            max_bytes: max_allocatable_bytes,
            fl_bitmap: 0,
            sl_bitmaps: [0; FL_QTY],
            free_heads: [[NIL; SL_QTY]; FL_QTY],
            allocated_bytes: 0,
        }
    }

    /// Re-initialises the allocator; all previous references become invalid.
    pub fn reset(&mut self) {
        self.arena.clear();
        self.arena_len = 0;
        self.fl_bitmap = 0;
        self.sl_bitmaps = [0; FL_QTY];
        self.free_heads = [[NIL; SL_QTY]; FL_QTY];
        self.allocated_bytes = 0;
    }

    /// Live payload bytes plus per-block overhead.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn max_allocatable_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Allocates `size` bytes, 8-byte aligned. `None` when exhausted.
    pub fn malloc(&mut self, size: u64) -> Option<BlockRef> {
        let (size, adjusted) = self.adjust_size(size)?;
        let (fl, sl) = fitting_list(adjusted);

        let mut found = self.search_free(fl, sl);
        if found.is_none() {
            if !self.extend_arena(adjusted) {
                return None;
            }
            found = self.search_free(fl, sl);
        }
        let (h, ffl, fsl) = found?;
        debug_assert!(self.payload_size(h) >= size, "insufficient block size");
        self.detach_free(h, ffl, fsl);

        // Split off the unused right part when it can hold a block of its own
        if self.payload_size(h) >= size + BLOCK_OVERHEAD + MIN_ALLOC_SIZE {
            let right = h + 1 + (size >> ALIGN_SHIFT) as u32;
            let right_size = self.payload_size(h) - size - BLOCK_OVERHEAD;
            self.set_size_flags(right, right_size);
            self.set_free(right, true);

            let flags = self.size_flags(h) & FLAG_MASK;
            self.set_size_flags(h, size | flags);

            self.set_prev_phys(right, h);
            self.set_prev_free_flag(right, true);
            self.insert_free(right);
        }

        self.set_free(h, false);
        self.allocated_bytes += BLOCK_OVERHEAD + self.payload_size(h);
        Some(BlockRef(h + 1))
    }

    /// Releases a block, coalescing with free physical neighbours. O(1).
    pub fn free(&mut self, r: BlockRef) {
        if r.is_none() {
            return;
        }
        let h = r.0 - 1;
        debug_assert!(!self.is_free(h), "block already marked as free");
        self.set_free(h, true);
        debug_assert!(self.allocated_bytes >= BLOCK_OVERHEAD + self.payload_size(h));
        self.allocated_bytes -= BLOCK_OVERHEAD + self.payload_size(h);

        let h = self.merge_prev_if_free(h);

        let next = self.next_phys(h);
        if self.is_free(next) {
            let (nfl, nsl) = fitting_list(self.payload_size(next));
            self.detach_free(next, nfl, nsl);
            let absorbed = self.payload_size(next) + BLOCK_OVERHEAD;
            self.set_size_flags(h, self.size_flags(h) + absorbed);
            let after = self.next_phys(h);
            self.set_prev_phys(after, h);
        }

        self.insert_free(h);
    }

    /// Whether `len` payload bytes at `r` fall inside the arena. Stale
    /// references (e.g. held across a reset) fail this check.
    pub fn contains(&self, r: BlockRef, len: usize) -> bool {
        !r.is_none() && (r.byte_offset() + len) as u64 <= self.arena_len
    }

    /// Payload bytes of an allocated block.
    pub fn payload(&self, r: BlockRef, len: usize) -> &[u8] {
        let off = r.byte_offset();
        &self.arena[off..off + len]
    }

    /// Mutable payload bytes of an allocated block.
    pub fn payload_mut(&mut self, r: BlockRef, len: usize) -> &mut [u8] {
        let off = r.byte_offset();
        &mut self.arena[off..off + len]
    }

    /// Real (rounded-up) payload size granted to this block.
    pub fn real_allocated_size(&self, r: BlockRef) -> u64 {
        self.payload_size(r.0 - 1)
    }

    /// Builds the masks probing whether a block of `size` could be carved
    /// out of the current free lists.
    pub fn size_check_context(&self, size: u64) -> CheckContext {
        let (_, adjusted) = self
            .adjust_size(size)
            .unwrap_or((MAX_ALLOC_SIZE, MAX_ALLOC_SIZE));
        let (fl, sl) = fitting_list(adjusted.min(MAX_ALLOC_SIZE));
        CheckContext {
            fl,
            fl_mask: !(((1u64 << (fl + 1)) - 1) as u32),
            sl_mask: !(((1u64 << sl) - 1) as u32),
        }
    }

    /// Cheap check that an allocation matching `cc` would succeed without
    /// growing the arena.
    pub fn is_allocatable(&self, cc: &CheckContext) -> bool {
        (self.sl_bitmaps[cc.fl] & cc.sl_mask) != 0 || (self.fl_bitmap & cc.fl_mask) != 0
    }

    // ------------------------------------------------------------------
    // Internal mechanics
    // ------------------------------------------------------------------

    fn adjust_size(&self, size: u64) -> Option<(u64, u64)> {
        let size = ((size + (ALIGN - 1)) & !(ALIGN - 1)).max(MIN_ALLOC_SIZE);
        if size > MAX_ALLOC_SIZE || size > self.max_bytes {
            return None;
        }
        // Round up to the class boundary so every block in the targeted
        // list is large enough
        let adjusted = if size >= SMALL_SIZE {
            let fl_bit = 63 - u64::leading_zeros(size);
            let mask = (1u64 << (fl_bit - SL_SHIFT)) - 1;
            (size + mask) & !mask
        } else {
            size
        };
        Some((size, adjusted))
    }

    fn search_free(&self, fl: usize, sl: usize) -> Option<(u32, usize, usize)> {
        let mut sl_map = self.sl_bitmaps[fl] & !(((1u64 << sl) - 1) as u32);
        let ffl;
        if sl_map == 0 {
            let fl_map = self.fl_bitmap & !(((1u64 << (fl + 1)) - 1) as u32);
            if fl_map == 0 {
                return None;
            }
            ffl = fl_map.trailing_zeros() as usize;
            sl_map = self.sl_bitmaps[ffl];
            debug_assert!(sl_map != 0, "second level empty despite first level bit");
        } else {
            ffl = fl;
        }
        let fsl = sl_map.trailing_zeros() as usize;
        let h = self.free_heads[ffl][fsl];
        debug_assert!(h != NIL);
        Some((h, ffl, fsl))
    }

    fn extend_arena(&mut self, size: u64) -> bool {
        debug_assert!(size & (ALIGN - 1) == 0);
        let first_overhead = if self.arena_len == 0 { BLOCK_OVERHEAD } else { 0 };
        let required = self.arena_len + size + BLOCK_OVERHEAD + first_overhead;
        let granular_total = required.div_ceil(GRANULE) * GRANULE;
        if granular_total > self.max_bytes {
            return false;
        }
        let granular_size = granular_total - self.arena_len - BLOCK_OVERHEAD - first_overhead;
        self.arena.resize(granular_total as usize, 0);

        // The old end sentinel (or the fresh arena start) becomes a free
        // block spanning the added region
        let h = if self.arena_len == 0 {
            0
        } else {
            ((self.arena_len - BLOCK_OVERHEAD) >> ALIGN_SHIFT) as u32
        };
        debug_assert!(
            self.payload_size(h) == 0 && !self.is_free(h),
            "end sentinel is corrupted"
        );
        self.set_size_flags(h, self.size_flags(h) | granular_size | FLAG_FREE);
        let h = self.merge_prev_if_free(h);
        self.insert_free(h);

        // New end sentinel after the grown block
        let sentinel = self.next_phys(h);
        self.set_prev_phys(sentinel, h);
        self.set_size_flags(sentinel, FLAG_PREV_FREE);

        self.arena_len = granular_total;
        true
    }

    fn merge_prev_if_free(&mut self, h: u32) -> u32 {
        if !self.is_prev_free(h) {
            return h;
        }
        let prev = self.prev_phys(h);
        debug_assert!(self.is_free(prev), "prev block not free though marked so");
        let (pfl, psl) = fitting_list(self.payload_size(prev));
        self.detach_free(prev, pfl, psl);

        let absorbed = self.payload_size(h) + BLOCK_OVERHEAD;
        self.set_size_flags(prev, self.size_flags(prev) + absorbed);
        let after = self.next_phys(prev);
        self.set_prev_phys(after, prev);
        prev
    }

    fn detach_free(&mut self, h: u32, fl: usize, sl: usize) {
        let prev = self.prev_free(h);
        let next = self.next_free(h);
        if next != NIL {
            self.set_prev_free(next, prev);
        }
        if prev != NIL {
            self.set_next_free(prev, next);
        }
        if self.free_heads[fl][sl] == h {
            self.free_heads[fl][sl] = next;
            if next == NIL {
                self.sl_bitmaps[fl] &= !(1u32 << sl);
                if self.sl_bitmaps[fl] == 0 {
                    self.fl_bitmap &= !(1u32 << fl);
                }
            }
        }
    }

    fn insert_free(&mut self, h: u32) {
        let (fl, sl) = fitting_list(self.payload_size(h));
        let head = self.free_heads[fl][sl];
        self.set_next_free(h, head);
        self.set_prev_free(h, NIL);
        if head != NIL {
            self.set_prev_free(head, h);
        }
        self.free_heads[fl][sl] = h;
        self.fl_bitmap |= 1u32 << fl;
        self.sl_bitmaps[fl] |= 1u32 << sl;
    }

    // Field accessors over the arena bytes

    fn size_flags(&self, h: u32) -> u64 {
        let off = (h as usize) << ALIGN_SHIFT;
        LittleEndian::read_u64(&self.arena[off..off + 8])
    }

    fn set_size_flags(&mut self, h: u32, v: u64) {
        let off = (h as usize) << ALIGN_SHIFT;
        LittleEndian::write_u64(&mut self.arena[off..off + 8], v);
    }

    fn payload_size(&self, h: u32) -> u64 {
        self.size_flags(h) & !FLAG_MASK
    }

    fn is_free(&self, h: u32) -> bool {
        self.size_flags(h) & FLAG_FREE != 0
    }

    fn is_prev_free(&self, h: u32) -> bool {
        self.size_flags(h) & FLAG_PREV_FREE != 0
    }

    fn set_free(&mut self, h: u32, state: bool) {
        debug_assert!(self.is_free(h) != state, "block free bit unchanged");
        let sf = self.size_flags(h);
        self.set_size_flags(h, if state { sf | FLAG_FREE } else { sf & !FLAG_FREE });
        let next = self.next_phys(h);
        self.set_prev_phys(next, h);
        self.set_prev_free_flag(next, state);
    }

    fn set_prev_free_flag(&mut self, h: u32, state: bool) {
        let sf = self.size_flags(h);
        self.set_size_flags(
            h,
            if state { sf | FLAG_PREV_FREE } else { sf & !FLAG_PREV_FREE },
        );
    }

    fn next_phys(&self, h: u32) -> u32 {
        h + 1 + (self.payload_size(h) >> ALIGN_SHIFT) as u32
    }

    fn prev_phys(&self, h: u32) -> u32 {
        let off = ((h as usize) << ALIGN_SHIFT) - 8;
        LittleEndian::read_u32(&self.arena[off..off + 4])
    }

    fn set_prev_phys(&mut self, h: u32, p: u32) {
        let off = ((h as usize) << ALIGN_SHIFT) - 8;
        LittleEndian::write_u32(&mut self.arena[off..off + 4], p);
    }

    fn next_free(&self, h: u32) -> u32 {
        let off = ((h as usize) << ALIGN_SHIFT) + 8;
        LittleEndian::read_u32(&self.arena[off..off + 4])
    }

    fn set_next_free(&mut self, h: u32, v: u32) {
        let off = ((h as usize) << ALIGN_SHIFT) + 8;
        LittleEndian::write_u32(&mut self.arena[off..off + 4], v);
    }

    fn prev_free(&self, h: u32) -> u32 {
        let off = ((h as usize) << ALIGN_SHIFT) + 12;
        LittleEndian::read_u32(&self.arena[off..off + 4])
    }

    fn set_prev_free(&mut self, h: u32, v: u32) {
        let off = ((h as usize) << ALIGN_SHIFT) + 12;
        LittleEndian::write_u32(&mut self.arena[off..off + 4], v);
    }

    /// Verifies the free-list structure: every listed block is free, has no
    /// free physical neighbour, sits in the list matching its size, and the
    /// bitmaps reflect list occupancy.
    #[cfg(test)]
    fn check_consistency(&self) {
        for fl in 0..FL_QTY {
            for sl in 0..SL_QTY {
                let head = self.free_heads[fl][sl];
                let bit_set = self.sl_bitmaps[fl] & (1u32 << sl) != 0;
                assert_eq!(head != NIL, bit_set, "bitmap mismatch at [{fl}][{sl}]");
                if bit_set {
                    assert!(
                        self.fl_bitmap & (1u32 << fl) != 0,
                        "first-level bit missing for {fl}"
                    );
                }
                let mut h = head;
                let mut prev = NIL;
                while h != NIL {
                    assert!(self.is_free(h), "non-free block in free list");
                    assert_eq!(self.prev_free(h), prev, "broken free list back link");
                    let next = self.next_phys(h);
                    assert!(!self.is_free(next), "uncoalesced free neighbour");
                    assert!(!self.is_prev_free(h), "uncoalesced free predecessor");
                    assert_eq!(
                        fitting_list(self.payload_size(h)),
                        (fl, sl),
                        "block in wrong size class"
                    );
                    prev = h;
                    h = self.next_free(h);
                }
            }
        }
    }
}

/// Maps a size to its (first level, second level) free-list coordinates.
fn fitting_list(size: u64) -> (usize, usize) {
    if size < SMALL_SIZE {
        (0, (size / (SMALL_SIZE / SL_QTY as u64)) as usize)
    } else {
        let fl_bit = 63 - u64::leading_zeros(size);
        let fl = (1 + fl_bit - FL_SHIFT) as usize;
        let sl = ((size >> (fl_bit - SL_SHIFT)) & (SL_QTY as u64 - 1)) as usize;
        debug_assert!(fl < FL_QTY && sl < SL_QTY);
        (fl, sl)
    }
}
