//! Page manager: allocation, free-list maintenance and a bounded LRU
//! cache of decrypted pages for one table file.
//!
//! Page 0 is the file header page. It persists the magic number, format
//! version, page size, free-list head, page count, root pointer, creation
//! timestamp and the encryption flag. The free list is intrusive: each
//! FREE page stores the id of the next free page in its own header, so
//! allocation pops the head in O(1) regardless of file size and reopen
//! never scans.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use lru::LruCache;
use tracing::warn;

use crate::crypto::Cipher;
use crate::error::{Result, VaultError};
use crate::storage::page::{Page, PageId, PageType, NIL_PAGE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::types::now_ticks;

/// On-disk encrypted page size = nonce(12) + 4096 + tag(16).
pub const ENCRYPTED_PAGE_SIZE: usize = PAGE_SIZE + Cipher::overhead();

const MAGIC: &[u8; 8] = b"VAULTDB1";
const FORMAT_VERSION: u32 = 1;

struct CacheSlot {
    page: Page,
    dirty: bool,
}

pub struct Pager {
    file: File,
    cipher: Arc<Cipher>,
    table_id: u32,
    page_count: u64,
    free_head: PageId,
    root_ptr: u64,
    created_at: i64,
    cache: LruCache<PageId, CacheSlot>,
    header_dirty: bool,
    pending_header_changes: usize,
    header_flush_batch: usize,
}

impl Pager {
    pub fn create(
        path: &Path,
        cipher: Arc<Cipher>,
        table_id: u32,
        cache_pages: usize,
        header_flush_batch: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut pager = Pager {
            file,
            cipher,
            table_id,
            page_count: 1, // page 0 is the header page
            free_head: NIL_PAGE,
            root_ptr: NIL_PAGE,
            created_at: now_ticks(),
            cache: LruCache::new(NonZeroUsize::new(cache_pages.max(1)).expect("nonzero capacity")),
            header_dirty: false,
            pending_header_changes: 0,
            header_flush_batch: header_flush_batch.max(1),
        };
        pager.flush_header()?;
        Ok(pager)
    }

    pub fn open(
        path: &Path,
        cipher: Arc<Cipher>,
        table_id: u32,
        cache_pages: usize,
        header_flush_batch: usize,
    ) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut pager = Pager {
            file,
            cipher,
            table_id,
            page_count: 0,
            free_head: NIL_PAGE,
            root_ptr: NIL_PAGE,
            created_at: 0,
            cache: LruCache::new(NonZeroUsize::new(cache_pages.max(1)).expect("nonzero capacity")),
            header_dirty: false,
            pending_header_changes: 0,
            header_flush_batch: header_flush_batch.max(1),
        };

        let header_page = pager.read_page_from_disk(0)?;
        pager.parse_header(&header_page)?;

        // A crash between the header write and the page write can leave
        // the file shorter than the recorded page count; trust the file.
        let actual_pages = pager.file.metadata()?.len() / ENCRYPTED_PAGE_SIZE as u64;
        if actual_pages < pager.page_count {
            warn!(
                recorded = pager.page_count,
                actual = actual_pages,
                "page count exceeds file length, clamping"
            );
            pager.page_count = actual_pages.max(1);
            pager.header_changed();
        }

        pager.validate_free_head()?;
        Ok(pager)
    }

    fn parse_header(&mut self, page: &Page) -> Result<()> {
        page.verify_crc()?;
        let body = &page.data[PAGE_HEADER_SIZE..];
        if &body[0..8] != MAGIC {
            return Err(VaultError::InvalidPage);
        }
        let version = u32::from_le_bytes(body[8..12].try_into().expect("4-byte slice"));
        if version != FORMAT_VERSION {
            return Err(VaultError::Corruption(format!("unsupported format version {version}")));
        }
        let page_size = u32::from_le_bytes(body[12..16].try_into().expect("4-byte slice"));
        if page_size as usize != PAGE_SIZE {
            return Err(VaultError::Corruption(format!("unsupported page size {page_size}")));
        }
        self.free_head = u64::from_le_bytes(body[16..24].try_into().expect("8-byte slice"));
        self.page_count = u64::from_le_bytes(body[24..32].try_into().expect("8-byte slice"));
        self.root_ptr = u64::from_le_bytes(body[32..40].try_into().expect("8-byte slice"));
        self.created_at = i64::from_le_bytes(body[40..48].try_into().expect("8-byte slice"));
        let encrypted = body[48] != 0;
        if encrypted != self.cipher.is_encrypting() {
            return Err(VaultError::Corruption(
                "file encryption flag disagrees with runtime no_encrypt_mode".to_string(),
            ));
        }
        Ok(())
    }

    /// The persisted head is authoritative, but it is only accepted after
    /// the first free page's link checks out.
    fn validate_free_head(&mut self) -> Result<()> {
        if self.free_head == NIL_PAGE {
            return Ok(());
        }
        if self.free_head >= self.page_count {
            warn!(head = self.free_head, "free-list head out of range, resetting");
            self.free_head = NIL_PAGE;
            self.header_changed();
            return Ok(());
        }
        let first = self.read_page(self.free_head)?;
        let next = first.next_free_page();
        let consistent =
            first.page_type() == Some(PageType::Free) && (next == NIL_PAGE || next < self.page_count);
        if !consistent {
            warn!(head = self.free_head, "free-list head inconsistent, resetting");
            self.free_head = NIL_PAGE;
            self.header_changed();
        }
        Ok(())
    }

    fn write_header_page(&mut self) -> Result<()> {
        let mut page = Page::new(PageType::Header, self.table_id);
        let body = &mut page.data[PAGE_HEADER_SIZE..];
        body[0..8].copy_from_slice(MAGIC);
        body[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        body[12..16].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        body[16..24].copy_from_slice(&self.free_head.to_le_bytes());
        body[24..32].copy_from_slice(&self.page_count.to_le_bytes());
        body[32..40].copy_from_slice(&self.root_ptr.to_le_bytes());
        body[40..48].copy_from_slice(&self.created_at.to_le_bytes());
        body[48] = u8::from(self.cipher.is_encrypting());
        page.update_crc();
        self.write_page_to_disk(0, &page)
    }

    /// Flush the header page immediately.
    pub fn flush_header(&mut self) -> Result<()> {
        self.write_header_page()?;
        self.header_dirty = false;
        self.pending_header_changes = 0;
        Ok(())
    }

    /// Record a free-list/page-count change; flushes the header when the
    /// batch threshold is reached (threshold 1 = write-through).
    fn header_changed(&mut self) {
        self.header_dirty = true;
        self.pending_header_changes += 1;
    }

    fn maybe_flush_header(&mut self) -> Result<()> {
        if self.header_dirty && self.pending_header_changes >= self.header_flush_batch {
            self.flush_header()?;
        }
        Ok(())
    }

    /// Allocate a page id: pop the free-list head in O(1), or extend the
    /// file by one page.
    pub fn allocate(&mut self) -> Result<PageId> {
        let id = if self.free_head != NIL_PAGE {
            let id = self.free_head;
            let page = self.read_page(id)?;
            if page.page_type() != Some(PageType::Free) {
                return Err(VaultError::Corruption(format!("free-list page {id} is not FREE")));
            }
            let next = page.next_free_page();
            if next != NIL_PAGE && next >= self.page_count {
                warn!(page = id, next, "free-list link out of range, dropping tail");
                self.free_head = NIL_PAGE;
            } else {
                self.free_head = next;
            }
            id
        } else {
            let id = self.page_count;
            self.page_count += 1;
            // Extend the file before the header can record the new count.
            let mut blank = Page::new(PageType::Free, self.table_id);
            blank.update_crc();
            self.write_page_to_disk(id, &blank)?;
            self.put_cache(id, blank, false);
            id
        };
        self.header_changed();
        self.maybe_flush_header()?;
        Ok(id)
    }

    /// Return a page to the free list. LIFO: last freed, first reused.
    pub fn free(&mut self, page_id: PageId) -> Result<()> {
        if page_id == 0 || page_id >= self.page_count {
            return Err(VaultError::PageNotFound(page_id));
        }
        let mut page = Page::new(PageType::Free, self.table_id);
        page.set_next_free_page(self.free_head);
        self.put_cache(page_id, page, true);
        self.free_head = page_id;
        self.header_changed();
        self.maybe_flush_header()
    }

    pub fn read_page(&mut self, page_id: PageId) -> Result<Page> {
        if page_id >= self.page_count {
            return Err(VaultError::PageNotFound(page_id));
        }
        if let Some(slot) = self.cache.get(&page_id) {
            return Ok(slot.page.clone());
        }
        let page = self.read_page_from_disk(page_id)?;
        self.put_cache(page_id, page.clone(), false);
        Ok(page)
    }

    /// Zero-allocation read into a caller-provided buffer.
    pub fn read_page_into(&mut self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        if page_id >= self.page_count {
            return Err(VaultError::PageNotFound(page_id));
        }
        if let Some(slot) = self.cache.get(&page_id) {
            buf.copy_from_slice(&slot.page.data);
            return Ok(());
        }
        let page = self.read_page_from_disk(page_id)?;
        buf.copy_from_slice(&page.data);
        self.put_cache(page_id, page, false);
        Ok(())
    }

    /// Write a page through the cache; disk write happens on eviction or
    /// an explicit flush.
    pub fn write_page(&mut self, page_id: PageId, page: Page) -> Result<()> {
        if page_id == 0 || page_id >= self.page_count {
            return Err(VaultError::PageNotFound(page_id));
        }
        self.put_cache(page_id, page, true);
        Ok(())
    }

    fn put_cache(&mut self, page_id: PageId, page: Page, dirty: bool) {
        let merged_dirty = dirty
            || self
                .cache
                .peek(&page_id)
                .map(|slot| slot.dirty)
                .unwrap_or(false);
        if let Some((evicted_id, evicted)) =
            self.cache.push(page_id, CacheSlot { page, dirty: merged_dirty })
        {
            if evicted_id != page_id && evicted.dirty {
                // Dirty eviction write-back.
                if let Err(e) = self.write_page_to_disk_plain(evicted_id, &evicted.page) {
                    warn!(page = evicted_id, error = %e, "dirty page eviction write failed");
                }
            }
        }
    }

    fn read_page_from_disk(&mut self, page_id: PageId) -> Result<Page> {
        match self.try_read_page_from_disk(page_id) {
            Ok(page) => Ok(page),
            // One retry on transient I/O failure before surfacing.
            Err(VaultError::Io(_)) => self.try_read_page_from_disk(page_id),
            Err(e) => Err(e),
        }
    }

    fn try_read_page_from_disk(&mut self, page_id: PageId) -> Result<Page> {
        let offset = page_id * ENCRYPTED_PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut encrypted = vec![0u8; ENCRYPTED_PAGE_SIZE];
        self.file.read_exact(&mut encrypted)?;

        let plaintext = self.cipher.decrypt(&encrypted)?;
        if plaintext.len() != PAGE_SIZE {
            return Err(VaultError::InvalidPage);
        }
        let mut data = [0u8; PAGE_SIZE];
        data.copy_from_slice(&plaintext);
        let page = Page::from_bytes(data);
        page.verify_crc()?;
        Ok(page)
    }

    fn write_page_to_disk(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        let encrypted = self.cipher.encrypt(page.as_bytes())?;
        let offset = page_id * ENCRYPTED_PAGE_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&encrypted)?;
        Ok(())
    }

    /// Like `write_page_to_disk` but refreshes the CRC first; used for
    /// cache write-back where the caller did not finalize the page.
    fn write_page_to_disk_plain(&mut self, page_id: PageId, page: &Page) -> Result<()> {
        let mut copy = page.clone();
        copy.update_crc();
        self.write_page_to_disk(page_id, &copy)
    }

    /// Write every dirty cached page and the header, then fsync.
    pub fn flush_dirty_pages(&mut self) -> Result<()> {
        let dirty_ids: Vec<PageId> = self
            .cache
            .iter()
            .filter(|(_, slot)| slot.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty_ids {
            if let Some(slot) = self.cache.peek(&id) {
                let page = slot.page.clone();
                self.write_page_to_disk_plain(id, &page)?;
            }
            if let Some(slot) = self.cache.peek_mut(&id) {
                slot.dirty = false;
            }
        }
        if self.header_dirty {
            self.flush_header()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.flush_dirty_pages()
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn free_head(&self) -> PageId {
        self.free_head
    }

    pub fn root_ptr(&self) -> u64 {
        self.root_ptr
    }

    pub fn set_root_ptr(&mut self, ptr: u64) {
        self.root_ptr = ptr;
        self.header_changed();
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
