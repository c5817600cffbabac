//! Free-list behavior of the page manager: O(1) LIFO reuse that
//! survives a restart without any scan.

use std::sync::Arc;
use tempfile::TempDir;
use vaultdb::crypto::{Cipher, MasterKey};
use vaultdb::storage::pager::Pager;

fn test_cipher() -> Arc<Cipher> {
    Arc::new(Cipher::new(&MasterKey::new([0x42u8; 32]), false))
}

#[test]
fn test_freed_pages_reused_lifo() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.pages");
    // Batched header flushes: one header write per 64 changes.
    let mut pager = Pager::create(&path, test_cipher(), 1, 128, 64).unwrap();

    let count = 5000;
    let mut allocated = Vec::with_capacity(count);
    for _ in 0..count {
        allocated.push(pager.allocate().unwrap());
    }
    for &id in &allocated {
        pager.free(id).unwrap();
    }

    // Every new allocation comes from the freed set, LIFO.
    for expected in allocated.iter().rev() {
        assert_eq!(pager.allocate().unwrap(), *expected);
    }
    // No growth happened during reuse.
    assert_eq!(pager.page_count(), count as u64 + 1);
}

#[test]
fn test_free_list_head_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.pages");
    let last_freed;
    {
        let mut pager = Pager::create(&path, test_cipher(), 1, 128, 1).unwrap();
        let pages: Vec<u64> = (0..100).map(|_| pager.allocate().unwrap()).collect();
        for &id in &pages {
            pager.free(id).unwrap();
        }
        last_freed = *pages.last().unwrap();
        pager.flush_dirty_pages().unwrap();
    }
    {
        // The persisted head is authoritative: first allocation pops it
        // with no scan.
        let mut pager = Pager::open(&path, test_cipher(), 1, 128, 1).unwrap();
        assert_eq!(pager.free_head(), last_freed);
        assert_eq!(pager.allocate().unwrap(), last_freed);
    }
}

#[test]
fn test_allocation_latency_stable_at_scale() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.pages");
    let mut pager = Pager::create(&path, test_cipher(), 1, 128, 64).unwrap();

    let batch = 1000;
    let batches = 10;
    let mut timings = Vec::with_capacity(batches);
    for _ in 0..batches {
        let start = std::time::Instant::now();
        for _ in 0..batch {
            pager.allocate().unwrap();
        }
        timings.push(start.elapsed().as_secs_f64());
    }
    // Last batch of 1000 allocations within 10x of the first (cache
    // warmup included).
    let first = timings[0].max(1e-9);
    let last = timings[batches - 1];
    assert!(last / first < 10.0, "allocation degraded: first={first} last={last}");
}
