//! Page-based storage engine over slotted pages.
//!
//! Row references are `(page, slot)` and stay stable for the lifetime of
//! the row: an UPDATE that no longer fits is relocated and the original
//! slot becomes a forwarding pointer. Relocated records carry their
//! origin reference as a 10-byte payload prefix so scans can report the
//! stable reference.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::crypto::Cipher;
use crate::error::{Result, VaultError};
use crate::storage::engine::{EngineMetrics, RowRef, StorageEngine, VacuumReport};
use crate::storage::page::{
    Page, PageId, PageType, SLOT_FORWARD, SLOT_MOVED_IN, SLOT_TOMBSTONE,
};
use crate::storage::pager::{Pager, ENCRYPTED_PAGE_SIZE};

/// Compact a page opportunistically once this share of its heap is dead.
const DEAD_SPACE_THRESHOLD: f64 = 0.3;

pub struct PageEngine {
    pager: Pager,
    table_id: u32,
    /// Free bytes per TABLE page, maintained on every write.
    space_map: HashMap<PageId, usize>,
    live_rows: u64,
    dead_records: u64,
    rows_inserted: u64,
    rows_updated: u64,
    rows_deleted: u64,
    rows_read: u64,
}

impl PageEngine {
    pub fn create(
        path: std::path::PathBuf,
        cipher: Arc<Cipher>,
        table_id: u32,
        cache_pages: usize,
        header_flush_batch: usize,
    ) -> Result<Self> {
        let pager = Pager::create(&path, cipher, table_id, cache_pages, header_flush_batch)?;
        Ok(PageEngine {
            pager,
            table_id,
            space_map: HashMap::new(),
            live_rows: 0,
            dead_records: 0,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            rows_read: 0,
        })
    }

    pub fn open(
        path: std::path::PathBuf,
        cipher: Arc<Cipher>,
        table_id: u32,
        cache_pages: usize,
        header_flush_batch: usize,
    ) -> Result<Self> {
        let mut pager = Pager::open(&path, cipher, table_id, cache_pages, header_flush_batch)?;
        let mut space_map = HashMap::new();
        let mut live_rows = 0u64;
        let mut dead_records = 0u64;
        for page_id in 1..pager.page_count() {
            let page = pager.read_page(page_id)?;
            if page.page_type() != Some(PageType::Table) {
                continue;
            }
            space_map.insert(page_id, page.free_space());
            for slot in 0..page.slot_count() {
                let Some((_, _, flags)) = page.slot(slot) else { continue };
                if flags & SLOT_TOMBSTONE != 0 {
                    dead_records += 1;
                } else if flags & SLOT_FORWARD == 0 {
                    live_rows += 1;
                }
            }
        }
        debug!(path = %path.display(), live = live_rows, "page engine opened");
        Ok(PageEngine {
            pager,
            table_id,
            space_map,
            live_rows,
            dead_records,
            rows_inserted: 0,
            rows_updated: 0,
            rows_deleted: 0,
            rows_read: 0,
        })
    }

    fn page_ref(row_ref: RowRef) -> Result<(PageId, u16)> {
        match row_ref {
            RowRef::Page { page, slot } => Ok((page, slot)),
            RowRef::Offset(_) => Err(VaultError::Internal(
                "offset reference passed to page engine".to_string(),
            )),
        }
    }

    /// Find a TABLE page with room, or allocate one.
    fn page_for(&mut self, needed: usize) -> Result<PageId> {
        let found = self
            .space_map
            .iter()
            .find(|(_, free)| **free >= needed)
            .map(|(id, _)| *id);
        if let Some(id) = found {
            return Ok(id);
        }
        let id = self.pager.allocate()?;
        let page = Page::new(PageType::Table, self.table_id);
        self.space_map.insert(id, page.free_space());
        self.pager.write_page(id, page)?;
        Ok(id)
    }

    fn write_back(&mut self, page_id: PageId, page: Page) -> Result<()> {
        self.space_map.insert(page_id, page.free_space());
        self.pager.write_page(page_id, page)
    }

    /// Follow at most one forwarding hop to the record's physical home.
    fn resolve(&mut self, page_id: PageId, slot: u16) -> Result<(PageId, u16)> {
        let page = self.pager.read_page(page_id)?;
        match page.forward_target(slot) {
            Some((to_page, to_slot)) => Ok((to_page, to_slot)),
            None => Ok((page_id, slot)),
        }
    }

    /// Insert `payload` as a relocated record carrying its origin ref.
    fn insert_moved(&mut self, origin: (PageId, u16), row: &[u8]) -> Result<(PageId, u16)> {
        let mut payload = Vec::with_capacity(10 + row.len());
        payload.extend_from_slice(&origin.0.to_le_bytes());
        payload.extend_from_slice(&origin.1.to_le_bytes());
        payload.extend_from_slice(row);

        let page_id = self.page_for(payload.len())?;
        let mut page = self.pager.read_page(page_id)?;
        let slot = page.insert_record_flagged(&payload, SLOT_MOVED_IN)?;
        self.write_back(page_id, page)?;
        Ok((page_id, slot))
    }

    fn maybe_compact(page: &mut Page) {
        if page.dead_space_ratio() > DEAD_SPACE_THRESHOLD {
            page.compact();
        }
    }
}

/// Strip the origin prefix from a moved-in record.
fn moved_row_bytes(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < 10 {
        return Err(VaultError::Corruption("short relocated record".to_string()));
    }
    Ok(&payload[10..])
}

fn moved_origin(payload: &[u8]) -> Result<(PageId, u16)> {
    if payload.len() < 10 {
        return Err(VaultError::Corruption("short relocated record".to_string()));
    }
    let page = u64::from_le_bytes(payload[0..8].try_into().expect("8-byte slice"));
    let slot = u16::from_le_bytes(payload[8..10].try_into().expect("2-byte slice"));
    Ok((page, slot))
}

impl StorageEngine for PageEngine {
    fn insert(&mut self, row: &[u8]) -> Result<RowRef> {
        let page_id = self.page_for(row.len())?;
        let mut page = self.pager.read_page(page_id)?;
        let slot = page.insert_record(row)?;
        self.write_back(page_id, page)?;
        self.live_rows += 1;
        self.rows_inserted += 1;
        Ok(RowRef::Page { page: page_id, slot })
    }

    fn update(&mut self, row_ref: RowRef, row: &[u8]) -> Result<RowRef> {
        let (origin_page, origin_slot) = Self::page_ref(row_ref)?;
        let (home_page, home_slot) = self.resolve(origin_page, origin_slot)?;

        let mut page = self.pager.read_page(home_page)?;
        let (_, _, flags) = page.slot(home_slot).ok_or(VaultError::InvalidPage)?;
        if flags & SLOT_TOMBSTONE != 0 {
            return Err(VaultError::Execution(format!("update of dead row at {row_ref}")));
        }

        // Moved-in records keep their origin prefix through updates.
        let stored: Vec<u8> = if flags & SLOT_MOVED_IN != 0 {
            let mut buf = Vec::with_capacity(10 + row.len());
            buf.extend_from_slice(&origin_page.to_le_bytes());
            buf.extend_from_slice(&origin_slot.to_le_bytes());
            buf.extend_from_slice(row);
            buf
        } else {
            row.to_vec()
        };

        if page.update_in_place(home_slot, &stored).is_ok()
            || page.relocate_in_page(home_slot, &stored).is_ok()
        {
            self.write_back(home_page, page)?;
            self.rows_updated += 1;
            return Ok(row_ref);
        }
        // No room on the home page: relocate and forward from the origin.
        self.write_back(home_page, page)?;

        let (new_page, new_slot) = self.insert_moved((origin_page, origin_slot), row)?;
        if (home_page, home_slot) != (origin_page, origin_slot) {
            // The old relocation site is dead now.
            let mut old_home = self.pager.read_page(home_page)?;
            old_home.mark_tombstone(home_slot)?;
            Self::maybe_compact(&mut old_home);
            self.write_back(home_page, old_home)?;
            self.dead_records += 1;
        }
        let mut origin = self.pager.read_page(origin_page)?;
        origin.set_forward(origin_slot, new_page, new_slot)?;
        self.write_back(origin_page, origin)?;

        self.rows_updated += 1;
        Ok(row_ref)
    }

    fn delete(&mut self, row_ref: RowRef) -> Result<()> {
        let (origin_page, origin_slot) = Self::page_ref(row_ref)?;
        let (home_page, home_slot) = self.resolve(origin_page, origin_slot)?;

        let mut page = self.pager.read_page(home_page)?;
        if page.is_tombstoned(home_slot) {
            return Err(VaultError::Execution(format!("delete of dead row at {row_ref}")));
        }
        page.mark_tombstone(home_slot)?;
        Self::maybe_compact(&mut page);
        self.write_back(home_page, page)?;

        if (home_page, home_slot) != (origin_page, origin_slot) {
            let mut origin = self.pager.read_page(origin_page)?;
            origin.mark_tombstone(origin_slot)?;
            self.write_back(origin_page, origin)?;
            self.dead_records += 1;
        }
        self.live_rows = self.live_rows.saturating_sub(1);
        self.dead_records += 1;
        self.rows_deleted += 1;
        Ok(())
    }

    fn read(&mut self, row_ref: RowRef) -> Result<Option<Vec<u8>>> {
        let (origin_page, origin_slot) = Self::page_ref(row_ref)?;
        let (home_page, home_slot) = self.resolve(origin_page, origin_slot)?;
        let page = self.pager.read_page(home_page)?;
        let Some((_, _, flags)) = page.slot(home_slot) else {
            return Ok(None);
        };
        let Some(payload) = page.record(home_slot) else {
            return Ok(None);
        };
        self.rows_read += 1;
        if flags & SLOT_MOVED_IN != 0 {
            Ok(Some(moved_row_bytes(payload)?.to_vec()))
        } else {
            Ok(Some(payload.to_vec()))
        }
    }

    fn scan(&mut self) -> Result<Vec<(RowRef, Vec<u8>)>> {
        let mut rows = Vec::new();
        for page_id in 1..self.pager.page_count() {
            let page = self.pager.read_page(page_id)?;
            if page.page_type() != Some(PageType::Table) {
                continue;
            }
            for slot in 0..page.slot_count() {
                let Some((_, _, flags)) = page.slot(slot) else { continue };
                if flags & (SLOT_TOMBSTONE | SLOT_FORWARD) != 0 {
                    continue;
                }
                let Some(payload) = page.record(slot) else { continue };
                if flags & SLOT_MOVED_IN != 0 {
                    let (op, os) = moved_origin(payload)?;
                    rows.push((RowRef::Page { page: op, slot: os }, moved_row_bytes(payload)?.to_vec()));
                } else {
                    rows.push((RowRef::Page { page: page_id, slot }, payload.to_vec()));
                }
            }
        }
        self.rows_read += rows.len() as u64;
        Ok(rows)
    }

    fn commit(&mut self) -> Result<()> {
        self.pager.flush_dirty_pages()
    }

    fn vacuum(&mut self) -> Result<(VacuumReport, Vec<(RowRef, RowRef)>)> {
        let mut dropped = 0u64;
        let mut freed_pages = 0u64;
        for page_id in 1..self.pager.page_count() {
            let mut page = self.pager.read_page(page_id)?;
            if page.page_type() != Some(PageType::Table) {
                continue;
            }
            let mut all_dead = page.slot_count() > 0;
            let mut had_tombstone = false;
            for slot in 0..page.slot_count() {
                let Some((_, _, flags)) = page.slot(slot) else { continue };
                if flags & SLOT_TOMBSTONE != 0 {
                    had_tombstone = true;
                } else {
                    all_dead = false;
                }
            }
            if all_dead {
                self.space_map.remove(&page_id);
                self.pager.free(page_id)?;
                freed_pages += 1;
                dropped += u64::from(page.slot_count());
            } else if had_tombstone {
                dropped += u64::from(page.slot_count())
                    - page_live_count(&page);
                page.compact();
                self.write_back(page_id, page)?;
            }
        }
        self.pager.flush_dirty_pages()?;
        let report = VacuumReport {
            reclaimed_bytes: freed_pages * ENCRYPTED_PAGE_SIZE as u64,
            live_rows: self.live_rows,
            dropped_records: dropped,
        };
        self.dead_records = 0;
        // Page references stay stable across vacuum.
        Ok((report, Vec::new()))
    }

    fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            rows_inserted: self.rows_inserted,
            rows_updated: self.rows_updated,
            rows_deleted: self.rows_deleted,
            rows_read: self.rows_read,
            live_rows: self.live_rows,
            dead_records: self.dead_records,
            file_bytes: self.pager.page_count() * ENCRYPTED_PAGE_SIZE as u64,
        }
    }
}

fn page_live_count(page: &Page) -> u64 {
    let mut live = 0u64;
    for slot in 0..page.slot_count() {
        if let Some((_, _, flags)) = page.slot(slot) {
            if flags & SLOT_TOMBSTONE == 0 {
                live += 1;
            }
        }
    }
    live
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterKey;
    use tempfile::TempDir;

    fn test_cipher() -> Arc<Cipher> {
        Arc::new(Cipher::new(&MasterKey::new([0x42u8; 32]), false))
    }

    fn new_engine(dir: &TempDir) -> PageEngine {
        PageEngine::create(dir.path().join("t.pages"), test_cipher(), 1, 64, 1).unwrap()
    }

    #[test]
    fn test_crud_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);

        let a = engine.insert(b"row a").unwrap();
        let b = engine.insert(b"row b").unwrap();
        assert_eq!(engine.read(a).unwrap(), Some(b"row a".to_vec()));

        // In-place update keeps the reference.
        let a_after = engine.update(a, b"row A").unwrap();
        assert_eq!(a_after, a);
        assert_eq!(engine.read(a).unwrap(), Some(b"row A".to_vec()));

        engine.delete(b).unwrap();
        assert_eq!(engine.read(b).unwrap(), None);

        let rows = engine.scan().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], (a, b"row A".to_vec()));
    }

    #[test]
    fn test_reference_stable_across_growing_update() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);

        // Fill a page so the grown row cannot stay.
        let first = engine.insert(&[1u8; 64]).unwrap();
        while let RowRef::Page { page, .. } = engine.insert(&[0u8; 64]).unwrap() {
            if page != 1 {
                break;
            }
        }

        let big = vec![9u8; 3000];
        let after = engine.update(first, &big).unwrap();
        assert_eq!(after, first, "reference must stay stable");
        assert_eq!(engine.read(first).unwrap(), Some(big.clone()));

        // Scan reports the stable reference, exactly once.
        let rows = engine.scan().unwrap();
        let hits: Vec<_> = rows.iter().filter(|(r, _)| *r == first).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, big);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.pages");
        let a;
        {
            let mut engine =
                PageEngine::create(path.clone(), test_cipher(), 1, 64, 1).unwrap();
            a = engine.insert(b"persisted").unwrap();
            engine.commit().unwrap();
        }
        let mut engine = PageEngine::open(path, test_cipher(), 1, 64, 1).unwrap();
        assert_eq!(engine.read(a).unwrap(), Some(b"persisted".to_vec()));
        assert_eq!(engine.metrics().live_rows, 1);
    }

    #[test]
    fn test_vacuum_frees_dead_pages() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);

        let mut refs = Vec::new();
        for _ in 0..200 {
            refs.push(engine.insert(&[7u8; 256]).unwrap());
        }
        for r in &refs {
            engine.delete(*r).unwrap();
        }
        let (report, remap) = engine.vacuum().unwrap();
        assert!(report.reclaimed_bytes > 0);
        assert!(remap.is_empty());
        assert_eq!(engine.scan().unwrap().len(), 0);
    }

    #[test]
    fn test_update_dead_row_fails() {
        let dir = TempDir::new().unwrap();
        let mut engine = new_engine(&dir);
        let a = engine.insert(b"x").unwrap();
        engine.delete(a).unwrap();
        assert!(engine.update(a, b"y").is_err());
    }
}
