//! The storage-engine operation set.
//!
//! Engines are selected per table at CREATE TABLE time and hidden behind
//! this capability set — no caller distinguishes engines. Dispatch happens
//! through `Box<dyn StorageEngine>` held by the catalog layer.

use std::fmt;

use crate::error::{Result, VaultError};
use crate::storage::page::PageId;

/// Opaque, engine-specific row location.
///
/// Page engines hand out `(page, slot)` pairs that stay stable for the
/// lifetime of the row. Append-only engines hand out file offsets; UPDATE
/// writes a new record there, so the reference changes and indexes are
/// repointed in the same logical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowRef {
    Page { page: PageId, slot: u16 },
    Offset(u64),
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowRef::Page { page, slot } => write!(f, "page {page} slot {slot}"),
            RowRef::Offset(offset) => write!(f, "offset {offset}"),
        }
    }
}

/// Which persistence strategy backs a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Append-only record log with the columnar aggregate path preferred.
    /// This is the default for new tables.
    Columnar,
    AppendOnly,
    PageBased,
    Hybrid,
}

impl EngineKind {
    pub const fn tag(self) -> u8 {
        match self {
            EngineKind::Columnar => 0,
            EngineKind::AppendOnly => 1,
            EngineKind::PageBased => 2,
            EngineKind::Hybrid => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => EngineKind::Columnar,
            1 => EngineKind::AppendOnly,
            2 => EngineKind::PageBased,
            3 => EngineKind::Hybrid,
            _ => return None,
        })
    }

    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name.to_ascii_uppercase().as_str() {
            "COLUMNAR" => EngineKind::Columnar,
            "APPEND_ONLY" => EngineKind::AppendOnly,
            "PAGE_BASED" => EngineKind::PageBased,
            "HYBRID" => EngineKind::Hybrid,
            _ => {
                return Err(VaultError::Parse(format!("unknown storage engine: {name}")));
            }
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EngineKind::Columnar => "COLUMNAR",
            EngineKind::AppendOnly => "APPEND_ONLY",
            EngineKind::PageBased => "PAGE_BASED",
            EngineKind::Hybrid => "HYBRID",
        }
    }

    /// Data file extension for this engine's table files.
    pub const fn file_suffix(self) -> &'static str {
        match self {
            EngineKind::Columnar | EngineKind::AppendOnly => "dat",
            EngineKind::PageBased | EngineKind::Hybrid => "pages",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineMetrics {
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub rows_deleted: u64,
    pub rows_read: u64,
    pub live_rows: u64,
    pub dead_records: u64,
    pub file_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VacuumReport {
    pub reclaimed_bytes: u64,
    pub live_rows: u64,
    pub dropped_records: u64,
}

pub trait StorageEngine: Send {
    /// Persist a serialized row; returns its reference.
    fn insert(&mut self, row: &[u8]) -> Result<RowRef>;

    /// Replace a row. The returned reference may differ from the input
    /// (append-only engines always move; page engines move on overflow).
    fn update(&mut self, row_ref: RowRef, row: &[u8]) -> Result<RowRef>;

    fn delete(&mut self, row_ref: RowRef) -> Result<()>;

    /// Read a row; `None` when the reference points at a deleted row.
    fn read(&mut self, row_ref: RowRef) -> Result<Option<Vec<u8>>>;

    /// All live rows in storage order.
    fn scan(&mut self) -> Result<Vec<(RowRef, Vec<u8>)>>;

    /// Make every completed mutation durable. Engines backed by the WAL
    /// may defer the page materialization and report it as pending.
    fn commit(&mut self) -> Result<()>;

    /// True while committed mutations still live only in memory and the
    /// WAL; the WAL must not be truncated past them until `materialize`.
    fn pending_materialization(&self) -> bool {
        false
    }

    /// Force every committed mutation into the backing store.
    fn materialize(&mut self) -> Result<()> {
        self.commit()
    }

    /// Reclaim dead space. May rewrite files and remap row references;
    /// the returned mapping is applied to indexes by the caller.
    fn vacuum(&mut self) -> Result<(VacuumReport, Vec<(RowRef, RowRef)>)>;

    fn metrics(&self) -> EngineMetrics;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_roundtrip() {
        for kind in [
            EngineKind::Columnar,
            EngineKind::AppendOnly,
            EngineKind::PageBased,
            EngineKind::Hybrid,
        ] {
            assert_eq!(EngineKind::from_tag(kind.tag()), Some(kind));
            assert_eq!(EngineKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(EngineKind::parse("LSM").is_err());
    }

    #[test]
    fn test_engine_kind_parse_is_case_insensitive() {
        assert_eq!(EngineKind::parse("page_based").unwrap(), EngineKind::PageBased);
    }
}
