//! SELECT result cache with write-epoch invalidation.
//!
//! Entries are keyed by SQL text plus the parameter fingerprint. Each
//! entry captures the write epochs of every table the query touched; a
//! lookup whose epochs no longer match is a miss and the stale entry is
//! dropped. Epoch bumps happen on every committed write, so invalidation
//! needs no per-statement bookkeeping.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::exec::Row;

#[derive(Clone)]
pub struct CachedResult {
    pub rows: Vec<Row>,
    /// (table lowercase, epoch at fill time).
    epochs: Vec<(String, u64)>,
}

pub struct ResultCache {
    entries: LruCache<(String, String), CachedResult>,
    hits: u64,
    misses: u64,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        ResultCache {
            entries: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity")),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(
        &mut self,
        sql: &str,
        fingerprint: &str,
        current_epoch: impl Fn(&str) -> Option<u64>,
    ) -> Option<CachedResult> {
        let key = (sql.to_string(), fingerprint.to_string());
        let fresh = match self.entries.get(&key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry
                .epochs
                .iter()
                .all(|(table, epoch)| current_epoch(table) == Some(*epoch)),
        };
        if fresh {
            self.hits += 1;
            self.entries.get(&key).cloned()
        } else {
            self.misses += 1;
            self.entries.pop(&key);
            None
        }
    }

    pub fn put(&mut self, sql: &str, fingerprint: &str, rows: Vec<Row>, epochs: Vec<(String, u64)>) {
        self.entries.put(
            (sql.to_string(), fingerprint.to_string()),
            CachedResult { rows, epochs },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> (u64, u64, usize) {
        (self.hits, self.misses, self.entries.len())
    }
}
