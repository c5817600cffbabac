//! Append-only storage engine.
//!
//! Rows go to `<table>.dat` sequentially. UPDATE appends a supersede
//! record carrying the old offset; DELETE appends a tombstone. The live
//! set is rebuilt on open by replaying the log, so no separate index file
//! is needed. VACUUM copies live rows into a fresh file and atomically
//! swaps it in, returning the offset remapping for index fixup.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::crypto::Cipher;
use crate::error::{Result, VaultError};
use crate::storage::append_log::{AppendLog, REC_DATA, REC_SUPERSEDE, REC_TOMBSTONE};
use crate::storage::engine::{EngineMetrics, RowRef, StorageEngine, VacuumReport};

pub struct AppendOnlyEngine {
    log: AppendLog,
    path: PathBuf,
    cipher: Arc<Cipher>,
    /// Offsets of live records, in insertion order.
    live: BTreeSet<u64>,
    dead_records: u64,
    rows_inserted: u64,
    rows_updated: u64,
    rows_deleted: u64,
    rows_read: u64,
}

impl AppendOnlyEngine {
    pub fn create(path: PathBuf, cipher: Arc<Cipher>) -> Result<Self> {
        let log = AppendLog::create(&path, cipher.clone())?;
        Ok(AppendOnlyEngine {
            log,
            path,
            cipher,
            live: BTreeSet::new(),
            dead_records: 0,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            rows_read: 0,
        })
    }

    pub fn open(path: PathBuf, cipher: Arc<Cipher>) -> Result<Self> {
        let mut log = AppendLog::open(&path, cipher.clone())?;
        let mut live = BTreeSet::new();
        let mut dead_records = 0u64;
        for (offset, flags, payload) in log.scan()? {
            match flags {
                REC_DATA => {
                    live.insert(offset);
                }
                REC_SUPERSEDE => {
                    let old = parse_target(&payload)?;
                    if live.remove(&old) {
                        dead_records += 1;
                    }
                    live.insert(offset);
                }
                REC_TOMBSTONE => {
                    let old = parse_target(&payload)?;
                    if live.remove(&old) {
                        dead_records += 1;
                    }
                    dead_records += 1;
                }
                other => {
                    return Err(VaultError::Corruption(format!("unknown record flag {other}")));
                }
            }
        }
        debug!(path = %path.display(), live = live.len(), "append engine recovered");
        Ok(AppendOnlyEngine {
            log,
            path,
            cipher,
            live,
            dead_records,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            rows_read: 0,
        })
    }

    fn offset_of(row_ref: RowRef) -> Result<u64> {
        match row_ref {
            RowRef::Offset(offset) => Ok(offset),
            RowRef::Page { .. } => Err(VaultError::Internal(
                "page reference passed to append-only engine".to_string(),
            )),
        }
    }

    /// Extract the row bytes from a live record's payload.
    fn row_bytes(flags: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
        match flags {
            REC_DATA => Ok(payload),
            REC_SUPERSEDE => {
                if payload.len() < 8 {
                    return Err(VaultError::Corruption("short supersede record".to_string()));
                }
                Ok(payload[8..].to_vec())
            }
            _ => Err(VaultError::Corruption("live set points at a tombstone".to_string())),
        }
    }
}

fn parse_target(payload: &[u8]) -> Result<u64> {
    if payload.len() < 8 {
        return Err(VaultError::Corruption("record target missing".to_string()));
    }
    Ok(u64::from_le_bytes(payload[0..8].try_into().expect("8-byte slice")))
}

impl StorageEngine for AppendOnlyEngine {
    fn insert(&mut self, row: &[u8]) -> Result<RowRef> {
        let offset = self.log.append(REC_DATA, row)?;
        self.live.insert(offset);
        self.rows_inserted += 1;
        Ok(RowRef::Offset(offset))
    }

    fn update(&mut self, row_ref: RowRef, row: &[u8]) -> Result<RowRef> {
        let old = Self::offset_of(row_ref)?;
        if !self.live.contains(&old) {
            return Err(VaultError::Execution(format!("update of dead row at {row_ref}")));
        }
        let mut payload = Vec::with_capacity(8 + row.len());
        payload.extend_from_slice(&old.to_le_bytes());
        payload.extend_from_slice(row);
        let offset = self.log.append(REC_SUPERSEDE, &payload)?;
        self.live.remove(&old);
        self.live.insert(offset);
        self.dead_records += 1;
        self.rows_updated += 1;
        Ok(RowRef::Offset(offset))
    }

    fn delete(&mut self, row_ref: RowRef) -> Result<()> {
        let old = Self::offset_of(row_ref)?;
        if !self.live.remove(&old) {
            return Err(VaultError::Execution(format!("delete of dead row at {row_ref}")));
        }
        self.log.append(REC_TOMBSTONE, &old.to_le_bytes())?;
        self.dead_records += 2;
        self.rows_deleted += 1;
        Ok(())
    }

    fn read(&mut self, row_ref: RowRef) -> Result<Option<Vec<u8>>> {
        let offset = Self::offset_of(row_ref)?;
        if !self.live.contains(&offset) {
            return Ok(None);
        }
        let (flags, payload) = self.log.read_at(offset)?;
        self.rows_read += 1;
        Self::row_bytes(flags, payload).map(Some)
    }

    fn scan(&mut self) -> Result<Vec<(RowRef, Vec<u8>)>> {
        let offsets: Vec<u64> = self.live.iter().copied().collect();
        let mut rows = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let (flags, payload) = self.log.read_at(offset)?;
            rows.push((RowRef::Offset(offset), Self::row_bytes(flags, payload)?));
        }
        self.rows_read += rows.len() as u64;
        Ok(rows)
    }

    fn commit(&mut self) -> Result<()> {
        self.log.sync()
    }

    fn vacuum(&mut self) -> Result<(VacuumReport, Vec<(RowRef, RowRef)>)> {
        let old_bytes = self.log.len();
        let tmp_path = self.path.with_extension("dat.compact");
        if tmp_path.exists() {
            fs::remove_file(&tmp_path)?;
        }

        let mut new_log = AppendLog::create(&tmp_path, self.cipher.clone())?;
        let mut remap = Vec::with_capacity(self.live.len());
        let mut new_live = BTreeSet::new();
        for &offset in &self.live {
            let (flags, payload) = self.log.read_at(offset)?;
            let row = Self::row_bytes(flags, payload)?;
            let new_offset = new_log.append(REC_DATA, &row)?;
            remap.push((RowRef::Offset(offset), RowRef::Offset(new_offset)));
            new_live.insert(new_offset);
        }
        new_log.sync()?;
        drop(new_log);

        // Atomic swap: the old file is replaced only after the compacted
        // copy is fully durable.
        fs::rename(&tmp_path, &self.path)?;
        self.log = AppendLog::open(&self.path, self.cipher.clone())?;

        let report = VacuumReport {
            reclaimed_bytes: old_bytes.saturating_sub(self.log.len()),
            live_rows: new_live.len() as u64,
            dropped_records: self.dead_records,
        };
        debug!(
            path = %self.path.display(),
            reclaimed = report.reclaimed_bytes,
            "append engine vacuumed"
        );
        self.live = new_live;
        self.dead_records = 0;
        Ok((report, remap))
    }

    fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            rows_inserted: self.rows_inserted,
            rows_updated: self.rows_updated,
            rows_deleted: self.rows_deleted,
            rows_read: self.rows_read,
            live_rows: self.live.len() as u64,
            dead_records: self.dead_records,
            file_bytes: self.log.len(),
        }
    }
}
