//! Secondary index: tag bytes to the key ids whose entries declare the tag.
//!
//! Key ids are the 32-bit key hashes also used as KeyDir tags; a query
//! resolves each id through the KeyDir and verifies the tag slices, so a
//! stale id is harmless. Buckets are not updated when entries die; they
//! accumulate stale ids until a query observes enough mismatches, at which
//! point the bucket is cleaned in place (lazy cleaning).

use std::collections::HashMap;

use parking_lot::RwLock;

/// Tag buckets. The whole map is small compared to the KeyDir: one slot per
/// distinct tag plus one id per declaring entry.
pub(crate) struct TagIndex {
    buckets: RwLock<HashMap<Box<[u8]>, Vec<u32>>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn reset(&self) {
        self.buckets.write().clear();
    }

    /// Registers `key_id` under `tag`. The caller diffs old and new tag sets
    /// at put time, so duplicates do not arise from updates.
    pub fn insert(&self, tag: &[u8], key_id: u32) {
        let mut buckets = self.buckets.write();
        buckets.entry(tag.into()).or_default().push(key_id);
    }

    /// Number of ids currently filed under `tag` (including stale ones).
    pub fn entry_count(&self, tag: &[u8]) -> usize {
        self.buckets.read().get(tag).map_or(0, Vec::len)
    }

    /// Copies the id list of `tag` for lock-free iteration by the caller.
    pub fn snapshot(&self, tag: &[u8]) -> Vec<u32> {
        self.buckets.read().get(tag).cloned().unwrap_or_default()
    }

    /// Removes the ids of `stale` for which `should_drop` confirms the
    /// KeyDir no longer backs the tag. Returns how many ids were dropped.
    pub fn clean_bucket(
        &self,
        tag: &[u8],
        stale: &[u32],
        mut should_drop: impl FnMut(u32) -> bool,
    ) -> u64 {
        let mut buckets = self.buckets.write();
        let Some(ids) = buckets.get_mut(tag) else {
            return 0;
        };
        let mut dropped = 0;
        for &id in stale {
            if !should_drop(id) {
                continue;
            }
            if let Some(pos) = ids.iter().position(|&v| v == id) {
                ids.swap_remove(pos);
                dropped += 1;
            }
        }
        if ids.is_empty() {
            buckets.remove(tag);
        }
        dropped
    }

    pub fn estimated_used_memory_bytes(&self) -> u64 {
        let buckets = self.buckets.read();
        buckets
            .iter()
            .map(|(tag, ids)| (tag.len() + ids.len() * 4 + 48) as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_snapshot() {
        let index = TagIndex::new();
        index.insert(b"user:42", 1);
        index.insert(b"user:42", 2);
        index.insert(b"country:fr", 1);

        assert_eq!(index.entry_count(b"user:42"), 2);
        assert_eq!(index.entry_count(b"country:fr"), 1);
        assert_eq!(index.entry_count(b"missing"), 0);

        let mut ids = index.snapshot(b"user:42");
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(index.snapshot(b"missing").is_empty());
    }

    #[test]
    fn test_clean_bucket_drops_confirmed_ids() {
        let index = TagIndex::new();
        for id in 1..=6 {
            index.insert(b"shared", id);
        }
        // Only even ids are confirmed stale by the callback
        let dropped = index.clean_bucket(b"shared", &[2, 3, 4], |id| id % 2 == 0);
        assert_eq!(dropped, 2);
        let mut ids = index.snapshot(b"shared");
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 3, 5, 6]);
    }

    #[test]
    fn test_clean_bucket_removes_empty_bucket() {
        let index = TagIndex::new();
        index.insert(b"lonely", 9);
        let dropped = index.clean_bucket(b"lonely", &[9], |_| true);
        assert_eq!(dropped, 1);
        assert_eq!(index.entry_count(b"lonely"), 0);
        assert!(index.snapshot(b"lonely").is_empty());
    }
}
