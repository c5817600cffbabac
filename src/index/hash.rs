//! Hash index: equality probes, duplicates allowed, NULL keys skipped.

use std::collections::HashMap;
use std::hash::Hash;

use crate::storage::RowRef;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IndexStats {
    pub unique_keys: usize,
    pub total_entries: usize,
    pub avg_entries_per_key: f64,
    pub memory_bytes: usize,
    /// distinct / total; 1.0 means every key is unique.
    pub selectivity: f64,
}

pub struct HashIndex<K: Eq + Hash> {
    map: HashMap<K, Vec<RowRef>>,
    total_entries: usize,
    key_bytes: usize,
}

impl<K: Eq + Hash> Default for HashIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> HashIndex<K> {
    pub fn new() -> Self {
        HashIndex { map: HashMap::new(), total_entries: 0, key_bytes: 0 }
    }

    pub fn add(&mut self, key: K, row_ref: RowRef)
    where
        K: KeySize,
    {
        let size = key.key_size();
        let bucket = self.map.entry(key).or_default();
        if bucket.is_empty() {
            self.key_bytes += size;
        }
        bucket.push(row_ref);
        self.total_entries += 1;
    }

    /// Remove one `(key, ref)` pairing; a no-op when absent.
    pub fn remove(&mut self, key: &K, row_ref: RowRef)
    where
        K: KeySize,
    {
        let Some(bucket) = self.map.get_mut(key) else { return };
        let Some(pos) = bucket.iter().position(|r| *r == row_ref) else {
            return;
        };
        bucket.swap_remove(pos);
        self.total_entries -= 1;
        if bucket.is_empty() {
            self.key_bytes -= key.key_size();
            self.map.remove(key);
        }
    }

    pub fn find(&self, key: &K) -> impl Iterator<Item = RowRef> + '_ {
        self.map.get(key).into_iter().flatten().copied()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn rebuild<I>(&mut self, entries: I)
    where
        K: KeySize,
        I: IntoIterator<Item = (K, RowRef)>,
    {
        self.map.clear();
        self.total_entries = 0;
        self.key_bytes = 0;
        for (key, row_ref) in entries {
            self.add(key, row_ref);
        }
    }

    pub fn stats(&self) -> IndexStats {
        let unique = self.map.len();
        let total = self.total_entries;
        IndexStats {
            unique_keys: unique,
            total_entries: total,
            avg_entries_per_key: if unique == 0 { 0.0 } else { total as f64 / unique as f64 },
            memory_bytes: self.key_bytes
                + total * std::mem::size_of::<RowRef>()
                + unique * std::mem::size_of::<Vec<RowRef>>(),
            selectivity: if total == 0 { 0.0 } else { unique as f64 / total as f64 },
        }
    }
}

/// Approximate heap footprint of a key, for the memory statistic.
pub trait KeySize {
    fn key_size(&self) -> usize;
}

impl KeySize for Vec<u8> {
    fn key_size(&self) -> usize {
        self.len()
    }
}

impl KeySize for String {
    fn key_size(&self) -> usize {
        self.len()
    }
}

impl KeySize for i64 {
    fn key_size(&self) -> usize {
        std::mem::size_of::<i64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(offset: u64) -> RowRef {
        RowRef::Offset(offset)
    }

    #[test]
    fn test_find_returns_added_minus_removed() {
        let mut idx: HashIndex<i64> = HashIndex::new();
        idx.add(1, r(10));
        idx.add(1, r(20));
        idx.add(2, r(30));
        idx.remove(&1, r(10));

        let found: Vec<RowRef> = idx.find(&1).collect();
        assert_eq!(found, vec![r(20)]);
        assert_eq!(idx.find(&2).count(), 1);
        assert_eq!(idx.find(&3).count(), 0);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut idx: HashIndex<i64> = HashIndex::new();
        idx.add(1, r(10));
        idx.remove(&9, r(10));
        idx.remove(&1, r(99));
        assert_eq!(idx.stats().total_entries, 1);
    }

    #[test]
    fn test_stats_and_selectivity() {
        let mut idx: HashIndex<String> = HashIndex::new();
        for i in 0..100 {
            idx.add(format!("key{}", i % 20), r(i));
        }
        let stats = idx.stats();
        assert_eq!(stats.unique_keys, 20);
        assert_eq!(stats.total_entries, 100);
        assert!((stats.avg_entries_per_key - 5.0).abs() < f64::EPSILON);
        assert!((stats.selectivity - 0.2).abs() < f64::EPSILON);
        assert!(stats.memory_bytes > 0);
    }

    #[test]
    fn test_rebuild_replaces_contents() {
        let mut idx: HashIndex<i64> = HashIndex::new();
        idx.add(1, r(1));
        idx.rebuild((0..5).map(|i| (i, r(i as u64 * 100))));
        assert_eq!(idx.stats().total_entries, 5);
        assert_eq!(idx.find(&1).collect::<Vec<_>>(), vec![r(100)]);
    }
}
