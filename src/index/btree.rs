//! B-tree index: ordered map over encoded keys supporting range scans.
//!
//! Keys are the order-preserving encodings from `key_encoding`; byte
//! comparison is the ordinal ordering the spec requires. Access paths
//! that consume range results re-apply the predicate, so the inclusive
//! bounds here may over-approximate strict comparisons.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::index::hash::IndexStats;
use crate::storage::RowRef;

pub struct BTreeIndex {
    map: BTreeMap<Vec<u8>, Vec<RowRef>>,
    total_entries: usize,
    key_bytes: usize,
}

impl Default for BTreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BTreeIndex {
    pub fn new() -> Self {
        BTreeIndex { map: BTreeMap::new(), total_entries: 0, key_bytes: 0 }
    }

    pub fn add(&mut self, key: Vec<u8>, row_ref: RowRef) {
        let size = key.len();
        let bucket = self.map.entry(key).or_default();
        if bucket.is_empty() {
            self.key_bytes += size;
        }
        bucket.push(row_ref);
        self.total_entries += 1;
    }

    pub fn remove(&mut self, key: &[u8], row_ref: RowRef) {
        let Some(bucket) = self.map.get_mut(key) else { return };
        let Some(pos) = bucket.iter().position(|r| *r == row_ref) else {
            return;
        };
        bucket.swap_remove(pos);
        self.total_entries -= 1;
        if bucket.is_empty() {
            self.key_bytes -= key.len();
            self.map.remove(key);
        }
    }

    pub fn find(&self, key: &[u8]) -> impl Iterator<Item = RowRef> + '_ {
        self.map.get(key).into_iter().flatten().copied()
    }

    /// Inclusive range scan in key order. `None` bounds are open-ended.
    pub fn find_range<'a>(
        &'a self,
        lo: Option<&[u8]>,
        hi: Option<&[u8]>,
    ) -> impl Iterator<Item = RowRef> + 'a {
        let lower = match lo {
            Some(key) => Bound::Included(key.to_vec()),
            None => Bound::Unbounded,
        };
        let upper = match hi {
            Some(key) => Bound::Included(key.to_vec()),
            None => Bound::Unbounded,
        };
        self.map
            .range((lower, upper))
            .flat_map(|(_, refs)| refs.iter().copied())
    }

    pub fn rebuild<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (Vec<u8>, RowRef)>,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key_encoding::encode_value;
    use crate::types::Value;

    fn key(v: i64) -> Vec<u8> {
        encode_value(&Value::Integer(v)).unwrap()
    }

    fn r(offset: u64) -> RowRef {
        RowRef::Offset(offset)
    }

    #[test]
    fn test_range_scan_in_order() {
        let mut idx = BTreeIndex::new();
        for v in [5i64, 1, 9, 3, 7] {
            idx.add(key(v), r(v as u64));
        }
        let hits: Vec<RowRef> = idx.find_range(Some(&key(3)), Some(&key(7))).collect();
        assert_eq!(hits, vec![r(3), r(5), r(7)]);
    }

    #[test]
    fn test_open_ended_ranges() {
        let mut idx = BTreeIndex::new();
        for v in 0..10i64 {
            idx.add(key(v), r(v as u64));
        }
        assert_eq!(idx.find_range(Some(&key(8)), None).count(), 2);
        assert_eq!(idx.find_range(None, Some(&key(1))).count(), 2);
        assert_eq!(idx.find_range(None, None).count(), 10);
    }

    #[test]
    fn test_duplicates_and_remove() {
        let mut idx = BTreeIndex::new();
        idx.add(key(1), r(10));
        idx.add(key(1), r(20));
        idx.remove(&key(1), r(10));
        assert_eq!(idx.find(&key(1)).collect::<Vec<_>>(), vec![r(20)]);
        idx.remove(&key(1), r(20));
        assert_eq!(idx.stats().unique_keys, 0);
    }
}
