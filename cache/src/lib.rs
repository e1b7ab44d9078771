//! The cache index: `key -> { host_address, byte_length, slab_index }`,
//! process-wide and mutated only from the event loop thread.

use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;

/// One cached block's location: the slab slot it lives in, its base
/// address within the registered pinned region, and its length (always
/// equal to the allocator's configured block size).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub host_address: u64,
    pub byte_length: u64,
    pub slab_index: u32,
}

#[derive(Default)]
pub struct CacheIndex {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Overwriting an existing key replaces the entry; the prior slab slot
    /// is not reclaimed. There is no deallocation path in this core, so an
    /// overwrite leaks a slot — a known limitation, not a bug.
    pub fn insert(&self, key: String, entry: CacheEntry) {
        let mut entries = self.entries.write();
        if entries.insert(key.clone(), entry).is_some() {
            warn!("cache: overwrote existing key {:?}, leaking its prior slot", key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns the largest `i` such that `keys[0..=i]` are all present,
    /// or `-1` if `keys` is empty or `keys[0]` is absent.
    ///
    /// Relies on the caller's sequence having monotone membership (if key
    /// `i` is present, every key before it is present too) to binary-search
    /// for the boundary instead of scanning linearly. Violating that
    /// invariant yields an unspecified but bounded result — it will never
    /// panic or read out of bounds, but the returned index may not be the
    /// true longest prefix.
    pub fn longest_matching_prefix_length(&self, keys: &[String]) -> i32 {
        if keys.is_empty() {
            return -1;
        }

        let entries = self.entries.read();
        let present = |i: usize| entries.contains_key(&keys[i]);

        if !present(0) {
            return -1;
        }

        let mut lo = 0usize;
        let mut hi = keys.len() - 1;
        let mut best = 0usize;

        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            if present(mid) {
                best = mid;
                if mid == keys.len() - 1 {
                    break;
                }
                lo = mid + 1;
            } else {
                if mid == 0 {
                    break;
                }
                hi = mid - 1;
            }
        }

        best as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(idx: u32) -> CacheEntry {
        CacheEntry {
            host_address: 0x1000 + idx as u64 * 4096,
            byte_length: 4096,
            slab_index: idx,
        }
    }

    #[test]
    fn lookup_and_contains_reflect_inserts() {
        let index = CacheIndex::new();
        assert!(!index.contains("a"));
        index.insert("a".to_string(), entry(0));
        assert!(index.contains("a"));
        assert_eq!(index.lookup("a"), Some(entry(0)));
        assert_eq!(index.lookup("missing"), None);
    }

    #[test]
    fn overwrite_replaces_entry() {
        let index = CacheIndex::new();
        index.insert("a".to_string(), entry(0));
        index.insert("a".to_string(), entry(1));
        assert_eq!(index.lookup("a"), Some(entry(1)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn empty_key_list_returns_negative_one() {
        let index = CacheIndex::new();
        assert_eq!(index.longest_matching_prefix_length(&[]), -1);
    }

    #[test]
    fn absent_first_key_returns_negative_one() {
        let index = CacheIndex::new();
        index.insert("b".to_string(), entry(0));
        let keys = vec!["a".to_string(), "b".to_string()];
        assert_eq!(index.longest_matching_prefix_length(&keys), -1);
    }

    #[test]
    fn full_prefix_match_returns_last_index() {
        let index = CacheIndex::new();
        for (i, k) in ["a", "b", "c"].iter().enumerate() {
            index.insert(k.to_string(), entry(i as u32));
        }
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(index.longest_matching_prefix_length(&keys), 2);
    }

    #[test]
    fn partial_monotone_prefix_returns_boundary() {
        let index = CacheIndex::new();
        index.insert("a".to_string(), entry(0));
        index.insert("b".to_string(), entry(1));
        // "c" and "d" are absent, consistent with monotone membership.
        let keys = vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "d".to_string(),
        ];
        assert_eq!(index.longest_matching_prefix_length(&keys), 1);
    }

    #[test]
    fn single_key_present() {
        let index = CacheIndex::new();
        index.insert("only".to_string(), entry(0));
        let keys = vec!["only".to_string()];
        assert_eq!(index.longest_matching_prefix_length(&keys), 0);
    }
}
