//! Multi-version concurrency control with snapshot isolation.
//!
//! Every logical row (keyed by primary key) owns a chain of versions
//! tagged `{begin, end}` with commit timestamps. A transaction reads the
//! version satisfying `begin <= snapshot < end`; writes are staged in the
//! transaction's write set and installed atomically at commit, which
//! assigns the commit timestamp and closes superseded versions.
//!
//! Writer-writer conflicts are resolved first-committer-wins: the second
//! committer observes a chain head newer than its snapshot and aborts
//! with `WriteConflict`.
//!
//! Version nodes live in an arena and link by index, so vacuum is a
//! compact-and-update-heads pass instead of a pointer chase. Readers only
//! take the shared lock; writers hold the exclusive lock for the brief
//! install window at commit.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Result, VaultError};

pub type TxId = u64;
pub type Timestamp = u64;

/// Open end timestamp: the version is current.
pub const TS_INFINITY: Timestamp = u64::MAX;

#[derive(Debug, Clone)]
struct Version<V> {
    begin: Timestamp,
    end: Timestamp,
    tombstone: bool,
    payload: Option<V>,
    prev: Option<usize>,
}

struct Chains<K, V> {
    arena: Vec<Version<V>>,
    heads: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone, V> Chains<K, V> {
    fn new() -> Self {
        Chains { arena: Vec::new(), heads: HashMap::new() }
    }

    /// Visible version index for `key` at `snapshot`.
    fn visible(&self, key: &K, snapshot: Timestamp) -> Option<&Version<V>> {
        let mut cursor = self.heads.get(key).copied();
        while let Some(idx) = cursor {
            let version = &self.arena[idx];
            if version.begin <= snapshot && snapshot < version.end {
                return Some(version);
            }
            cursor = version.prev;
        }
        None
    }
}

#[derive(Debug, Clone)]
enum WriteOp<K, V> {
    Put { key: K, value: V },
    Delete { key: K },
}

impl<K, V> WriteOp<K, V> {
    fn key(&self) -> &K {
        match self {
            WriteOp::Put { key, .. } => key,
            WriteOp::Delete { key } => key,
        }
    }
}

/// A transaction handle. Staged writes live here until commit; dropping
/// the handle (without commit) releases its snapshot pin.
pub struct Transaction<K, V> {
    id: TxId,
    snapshot: Timestamp,
    read_only: bool,
    writes: Vec<WriteOp<K, V>>,
    registry: Arc<Mutex<HashMap<TxId, Timestamp>>>,
    finished: bool,
}

impl<K, V> Transaction<K, V> {
    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn snapshot(&self) -> Timestamp {
        self.snapshot
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    fn release(&mut self) {
        if !self.finished {
            self.registry.lock().remove(&self.id);
            self.finished = true;
        }
    }
}

impl<K, V> Drop for Transaction<K, V> {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct MvccManager<K, V> {
    chains: RwLock<Chains<K, V>>,
    /// Last committed timestamp; snapshots are taken from here.
    commit_counter: AtomicU64,
    next_tx: AtomicU64,
    active: Arc<Mutex<HashMap<TxId, Timestamp>>>,
}

impl<K, V> Default for MvccManager<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MvccManager<K, V>
where
    K: Eq + Hash + Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        MvccManager {
            chains: RwLock::new(Chains::new()),
            commit_counter: AtomicU64::new(0),
            next_tx: AtomicU64::new(1),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Install a committed base version without a transaction. Used when
    /// rebuilding in-memory state from storage on open.
    pub fn load_committed(&self, key: K, value: V) {
        let mut chains = self.chains.write();
        let prev = chains.heads.get(&key).copied();
        let idx = chains.arena.len();
        chains.arena.push(Version {
            begin: 1,
            end: TS_INFINITY,
            tombstone: false,
            payload: Some(value),
            prev,
        });
        chains.heads.insert(key, idx);
        // Base versions commit at timestamp 1.
        self.commit_counter.fetch_max(1, Ordering::SeqCst);
    }

    pub fn begin_transaction(&self, read_only: bool) -> Transaction<K, V> {
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.commit_counter.load(Ordering::SeqCst);
        self.active.lock().insert(id, snapshot);
        Transaction {
            id,
            snapshot,
            read_only,
            writes: Vec::new(),
            registry: self.active.clone(),
            finished: false,
        }
    }

    fn check_writable(tx: &Transaction<K, V>) -> Result<()> {
        if tx.read_only {
            return Err(VaultError::ReadOnly("transaction is read-only".to_string()));
        }
        Ok(())
    }

    /// Own staged write for `key`, if any (last write wins).
    fn staged<'t>(tx: &'t Transaction<K, V>, key: &K) -> Option<&'t WriteOp<K, V>> {
        tx.writes.iter().rev().find(|op| op.key() == key)
    }

    /// Stage a new row. Fails if the key is already visible to this
    /// transaction (primary-key duplicate).
    pub fn insert(&self, key: K, value: V, tx: &mut Transaction<K, V>) -> Result<()> {
        Self::check_writable(tx)?;
        match Self::staged(tx, &key) {
            Some(WriteOp::Put { .. }) => {
                return Err(VaultError::ConstraintViolation("duplicate key in transaction".to_string()));
            }
            Some(WriteOp::Delete { .. }) => {}
            None => {
                let chains = self.chains.read();
                if chains
                    .visible(&key, tx.snapshot)
                    .map(|v| !v.tombstone)
                    .unwrap_or(false)
                {
                    return Err(VaultError::ConstraintViolation("duplicate key".to_string()));
                }
            }
        }
        tx.writes.push(WriteOp::Put { key, value });
        Ok(())
    }

    /// Stage a replacement version.
    pub fn update(&self, key: K, value: V, tx: &mut Transaction<K, V>) -> Result<()> {
        Self::check_writable(tx)?;
        if self.get(&key, tx).is_none() {
            return Err(VaultError::Execution("update of missing key".to_string()));
        }
        tx.writes.push(WriteOp::Put { key, value });
        Ok(())
    }

    /// Stage a tombstone.
    pub fn delete(&self, key: K, tx: &mut Transaction<K, V>) -> Result<()> {
        Self::check_writable(tx)?;
        if self.get(&key, tx).is_none() {
            return Err(VaultError::Execution("delete of missing key".to_string()));
        }
        tx.writes.push(WriteOp::Delete { key });
        Ok(())
    }

    /// Read through the transaction's snapshot, seeing its own staged
    /// writes first and skipping tombstones.
    pub fn get(&self, key: &K, tx: &Transaction<K, V>) -> Option<V> {
        match Self::staged(tx, key) {
            Some(WriteOp::Put { value, .. }) => return Some(value.clone()),
            Some(WriteOp::Delete { .. }) => return None,
            None => {}
        }
        let chains = self.chains.read();
        chains
            .visible(key, tx.snapshot)
            .filter(|v| !v.tombstone)
            .and_then(|v| v.payload.clone())
    }

    /// Visible rows whose key satisfies `filter`, ordered by key.
    pub fn scan_where(&self, tx: &Transaction<K, V>, filter: impl Fn(&K) -> bool) -> Vec<(K, V)> {
        let chains = self.chains.read();
        let mut out: Vec<(K, V)> = Vec::new();
        for key in chains.heads.keys() {
            if !filter(key) || Self::staged(tx, key).is_some() {
                continue;
            }
            if let Some(version) = chains.visible(key, tx.snapshot) {
                if !version.tombstone {
                    if let Some(payload) = &version.payload {
                        out.push((key.clone(), payload.clone()));
                    }
                }
            }
        }
        drop(chains);
        for op in &tx.writes {
            if let WriteOp::Put { key, value } = op {
                if !filter(key) {
                    continue;
                }
                if Self::staged(tx, key).map(|last| std::ptr::eq(last, op)).unwrap_or(false) {
                    out.push((key.clone(), value.clone()));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// All visible rows, ordered by key.
    pub fn scan(&self, tx: &Transaction<K, V>) -> Vec<(K, V)> {
        self.scan_where(tx, |_| true)
    }

    /// Atomically install the transaction's writes. First committer wins:
    /// if any written key gained a committed version newer than this
    /// transaction's snapshot, the commit aborts with `WriteConflict`.
    pub fn commit_transaction(&self, mut tx: Transaction<K, V>) -> Result<Timestamp> {
        if tx.read_only && !tx.writes.is_empty() {
            return Err(VaultError::ReadOnly("transaction is read-only".to_string()));
        }
        let mut chains = self.chains.write();

        for op in &tx.writes {
            if let Some(&head) = chains.heads.get(op.key()) {
                if chains.arena[head].begin > tx.snapshot {
                    return Err(VaultError::WriteConflict);
                }
            }
        }

        let commit_ts = self.commit_counter.load(Ordering::SeqCst) + 1;
        let writes = std::mem::take(&mut tx.writes);
        for op in writes {
            let (key, tombstone, payload) = match op {
                WriteOp::Put { key, value } => (key, false, Some(value)),
                WriteOp::Delete { key } => (key, true, None),
            };
            let prev = chains.heads.get(&key).copied();
            if let Some(head) = prev {
                if chains.arena[head].end == TS_INFINITY {
                    chains.arena[head].end = commit_ts;
                }
            }
            let idx = chains.arena.len();
            chains.arena.push(Version { begin: commit_ts, end: TS_INFINITY, tombstone, payload, prev });
            chains.heads.insert(key, idx);
        }
        self.commit_counter.store(commit_ts, Ordering::SeqCst);
        drop(chains);
        tx.release();
        Ok(commit_ts)
    }

    pub fn rollback(&self, mut tx: Transaction<K, V>) {
        tx.writes.clear();
        tx.release();
    }

    /// Oldest snapshot any live transaction might read at; with no
    /// active transactions the current commit counter is the horizon.
    fn vacuum_horizon(&self) -> Timestamp {
        let active = self.active.lock();
        active
            .values()
            .copied()
            .min()
            .unwrap_or_else(|| self.commit_counter.load(Ordering::SeqCst))
    }

    /// Drop every version no live snapshot can see. Returns the number of
    /// versions reclaimed. The arena is rebuilt compactly.
    pub fn vacuum(&self) -> usize {
        let horizon = self.vacuum_horizon();
        let mut chains = self.chains.write();
        let old_len = chains.arena.len();

        let mut new_arena: Vec<Version<V>> = Vec::with_capacity(old_len);
        let mut new_heads: HashMap<K, usize> = HashMap::with_capacity(chains.heads.len());

        for (key, &head) in &chains.heads {
            // Walk newest-to-oldest, keeping versions a snapshot at or
            // after the horizon could still read.
            let mut kept: Vec<Version<V>> = Vec::new();
            let mut cursor = Some(head);
            while let Some(idx) = cursor {
                let version = &chains.arena[idx];
                cursor = version.prev;
                if version.end != TS_INFINITY && version.end <= horizon {
                    continue;
                }
                kept.push(version.clone());
            }
            // A chain whose only surviving version is an old tombstone is
            // fully dead: every live snapshot sees the key as deleted.
            if kept.len() == 1 && kept[0].tombstone && kept[0].begin <= horizon {
                kept.clear();
            }
            if kept.is_empty() {
                continue;
            }
            // Relink oldest-first into the compact arena.
            let mut prev: Option<usize> = None;
            for mut version in kept.into_iter().rev() {
                version.prev = prev;
                let idx = new_arena.len();
                new_arena.push(version);
                prev = Some(idx);
            }
            new_heads.insert(key.clone(), prev.expect("non-empty chain has a head"));
        }

        let reclaimed = old_len - new_arena.len();
        chains.arena = new_arena;
        chains.heads = new_heads;
        if reclaimed > 0 {
            debug!(reclaimed, horizon, "mvcc vacuum reclaimed versions");
        }
        reclaimed
    }

    pub fn version_count(&self) -> usize {
        self.chains.read().arena.len()
    }

    pub fn active_transactions(&self) -> usize {
        self.active.lock().len()
    }

    pub fn last_commit_ts(&self) -> Timestamp {
        self.commit_counter.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Mgr = MvccManager<i64, String>;

    fn commit_one(mgr: &Mgr, key: i64, value: &str) {
        let mut tx = mgr.begin_transaction(false);
        if mgr.get(&key, &tx).is_some() {
            mgr.update(key, value.to_string(), &mut tx).unwrap();
        } else {
            mgr.insert(key, value.to_string(), &mut tx).unwrap();
        }
        mgr.commit_transaction(tx).unwrap();
    }

    #[test]
    fn test_staged_writes_invisible_until_commit() {
        let mgr = Mgr::new();
        let mut tx = mgr.begin_transaction(false);
        mgr.insert(1, "alice".to_string(), &mut tx).unwrap();

        let other = mgr.begin_transaction(true);
        assert_eq!(mgr.get(&1, &other), None);
        assert_eq!(mgr.get(&1, &tx), Some("alice".to_string()));

        mgr.commit_transaction(tx).unwrap();
        // Old snapshot still blind, fresh snapshot sees it.
        assert_eq!(mgr.get(&1, &other), None);
        let fresh = mgr.begin_transaction(true);
        assert_eq!(mgr.get(&1, &fresh), Some("alice".to_string()));
    }

    #[test]
    fn test_snapshot_isolation_across_update() {
        let mgr = Mgr::new();
        commit_one(&mgr, 1, "alice");

        let reader = mgr.begin_transaction(true);
        commit_one(&mgr, 1, "alice2");

        assert_eq!(mgr.get(&1, &reader), Some("alice".to_string()));
        let fresh = mgr.begin_transaction(true);
        assert_eq!(mgr.get(&1, &fresh), Some("alice2".to_string()));
    }

    #[test]
    fn test_write_conflict_second_committer_aborts() {
        let mgr = Mgr::new();
        commit_one(&mgr, 1, "base");

        let mut tx_a = mgr.begin_transaction(false);
        let mut tx_b = mgr.begin_transaction(false);
        mgr.update(1, "from a".to_string(), &mut tx_a).unwrap();
        mgr.update(1, "from b".to_string(), &mut tx_b).unwrap();

        mgr.commit_transaction(tx_a).unwrap();
        assert!(matches!(
            mgr.commit_transaction(tx_b),
            Err(VaultError::WriteConflict)
        ));
        let fresh = mgr.begin_transaction(true);
        assert_eq!(mgr.get(&1, &fresh), Some("from a".to_string()));
    }

    #[test]
    fn test_delete_is_tombstone_until_vacuum() {
        let mgr = Mgr::new();
        commit_one(&mgr, 1, "row");

        let reader = mgr.begin_transaction(true);

        let mut tx = mgr.begin_transaction(false);
        mgr.delete(1, &mut tx).unwrap();
        mgr.commit_transaction(tx).unwrap();

        // Pinned snapshot still sees the row.
        assert_eq!(mgr.get(&1, &reader), Some("row".to_string()));
        let fresh = mgr.begin_transaction(true);
        assert_eq!(mgr.get(&1, &fresh), None);

        // Vacuum cannot reclaim while the reader pins the old version.
        assert_eq!(mgr.vacuum(), 0);
        drop(reader);
        drop(fresh);
        assert!(mgr.vacuum() >= 2);
        assert_eq!(mgr.version_count(), 0);
    }

    #[test]
    fn test_scan_sees_exactly_one_live_version_per_key() {
        let mgr = Mgr::new();
        for i in 0..10 {
            commit_one(&mgr, i, "v1");
        }
        for i in 0..10 {
            commit_one(&mgr, i, "v2");
        }
        let tx = mgr.begin_transaction(true);
        let rows = mgr.scan(&tx);
        assert_eq!(rows.len(), 10);
        assert!(rows.iter().all(|(_, v)| v == "v2"));
        // Ordered by key.
        let keys: Vec<i64> = rows.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_scan_includes_own_staged_writes() {
        let mgr = Mgr::new();
        commit_one(&mgr, 1, "committed");
        let mut tx = mgr.begin_transaction(false);
        mgr.insert(2, "staged".to_string(), &mut tx).unwrap();
        mgr.update(1, "updated".to_string(), &mut tx).unwrap();

        let rows = mgr.scan(&tx);
        assert_eq!(
            rows,
            vec![(1, "updated".to_string()), (2, "staged".to_string())]
        );
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mgr = Mgr::new();
        commit_one(&mgr, 1, "first");
        let mut tx = mgr.begin_transaction(false);
        assert!(matches!(
            mgr.insert(1, "again".to_string(), &mut tx),
            Err(VaultError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn test_read_only_cannot_write() {
        let mgr = Mgr::new();
        let mut tx = mgr.begin_transaction(true);
        assert!(matches!(
            mgr.insert(1, "x".to_string(), &mut tx),
            Err(VaultError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let mgr = Arc::new(Mgr::new());
        commit_one(&mgr, 1, "v0");

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mgr = mgr.clone();
                std::thread::spawn(move || {
                    let tx = mgr.begin_transaction(true);
                    let seen = mgr.get(&1, &tx).unwrap();
                    // A snapshot never changes mid-transaction.
                    for _ in 0..100 {
                        assert_eq!(mgr.get(&1, &tx).unwrap(), seen);
                    }
                })
            })
            .collect();

        let writer = {
            let mgr = mgr.clone();
            std::thread::spawn(move || {
                for i in 1..=20 {
                    commit_one(&mgr, 1, &format!("v{i}"));
                }
            })
        };

        for r in readers {
            r.join().unwrap();
        }
        writer.join().unwrap();
        let tx = mgr.begin_transaction(true);
        assert_eq!(mgr.get(&1, &tx), Some("v20".to_string()));
    }
}
