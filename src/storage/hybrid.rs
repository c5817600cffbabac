//! Hybrid storage engine: WAL-fronted writes over a page store.
//!
//! Mutations are made durable by the shared WAL (logged by the query
//! layer before reaching the engine) and land in the page store's cache,
//! which doubles as the in-memory dirty set. Reads therefore see pending
//! changes before they are materialized. Commit is cheap — the expensive
//! page flush is deferred until the checkpoint threshold is reached or a
//! compaction runs, at which point the WAL may be truncated up to that
//! safe point.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::crypto::Cipher;
use crate::error::Result;
use crate::storage::engine::{EngineMetrics, RowRef, StorageEngine, VacuumReport};
use crate::storage::page_engine::PageEngine;

/// Materialize after this many committed mutations.
const DEFAULT_CHECKPOINT_OPS: u64 = 512;

pub struct HybridEngine {
    store: PageEngine,
    pending_ops: u64,
    checkpoint_ops: u64,
}

impl HybridEngine {
    pub fn create(
        path: PathBuf,
        cipher: Arc<Cipher>,
        table_id: u32,
        cache_pages: usize,
        header_flush_batch: usize,
    ) -> Result<Self> {
        let store = PageEngine::create(path, cipher, table_id, cache_pages, header_flush_batch)?;
        Ok(HybridEngine {
            store,
            pending_ops: 0,
            checkpoint_ops: DEFAULT_CHECKPOINT_OPS,
        })
    }

    pub fn open(
        path: PathBuf,
        cipher: Arc<Cipher>,
        table_id: u32,
        cache_pages: usize,
        header_flush_batch: usize,
    ) -> Result<Self> {
        let store = PageEngine::open(path, cipher, table_id, cache_pages, header_flush_batch)?;
        Ok(HybridEngine {
            store,
            pending_ops: 0,
            checkpoint_ops: DEFAULT_CHECKPOINT_OPS,
        })
    }

    #[cfg(test)]
    fn with_checkpoint_ops(mut self, ops: u64) -> Self {
        self.checkpoint_ops = ops.max(1);
        self
    }
}

impl StorageEngine for HybridEngine {
    fn insert(&mut self, row: &[u8]) -> Result<RowRef> {
        let row_ref = self.store.insert(row)?;
        self.pending_ops += 1;
        Ok(row_ref)
    }

    fn update(&mut self, row_ref: RowRef, row: &[u8]) -> Result<RowRef> {
        let new_ref = self.store.update(row_ref, row)?;
        self.pending_ops += 1;
        Ok(new_ref)
    }

    fn delete(&mut self, row_ref: RowRef) -> Result<()> {
        self.store.delete(row_ref)?;
        self.pending_ops += 1;
        Ok(())
    }

    fn read(&mut self, row_ref: RowRef) -> Result<Option<Vec<u8>>> {
        // The page cache holds the dirty set, so this sees pending writes.
        self.store.read(row_ref)
    }

    fn scan(&mut self) -> Result<Vec<(RowRef, Vec<u8>)>> {
        self.store.scan()
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending_ops >= self.checkpoint_ops {
            self.materialize()?;
        }
        Ok(())
    }

    fn pending_materialization(&self) -> bool {
        self.pending_ops > 0
    }

    fn materialize(&mut self) -> Result<()> {
        if self.pending_ops == 0 {
            return Ok(());
        }
        self.store.commit()?;
        debug!(ops = self.pending_ops, "hybrid engine materialized");
        self.pending_ops = 0;
        Ok(())
    }

    fn vacuum(&mut self) -> Result<(VacuumReport, Vec<(RowRef, RowRef)>)> {
        self.materialize()?;
        self.store.vacuum()
    }

    fn metrics(&self) -> EngineMetrics {
        self.store.metrics()
    }
}
