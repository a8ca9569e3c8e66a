//! Allocator behavior across commits: staged frees, coalescing, tail
//! trimming, and free-range index round-trips.

use mosaic::store::{LockLevel, OpenOptions, Store};
use tempfile::tempdir;

fn create_store(path: &std::path::Path) -> Store {
    let store = Store::open(
        path,
        OpenOptions {
            write: true,
            create: true,
            ..Default::default()
        },
    )
    .unwrap();
    let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
    tx.commit(true).unwrap();
    tx.end().unwrap();
    store
}

#[test]
fn free_coalescing_and_tail_trim() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("coalesce.store");
    let store = create_store(&path);

    // Three contiguous ranges.
    let (a, b, c) = {
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        let a = tx.alloc_pages(100).unwrap();
        let b = tx.alloc_pages(200).unwrap();
        let c = tx.alloc_pages(50).unwrap();
        assert_eq!((b, c), (a + 100, a + 300));
        tx.commit(true).unwrap();
        tx.end().unwrap();
        (a, b, c)
    };
    assert_eq!(store.header().unwrap().total_pages, a + 350);

    // Free A: a single free range appears (minus the page the free-range
    // index blob reclaims from it).
    {
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        tx.free_pages(a, 100).unwrap();
        tx.commit(true).unwrap();
        let stats = tx.free_range_stats();
        assert_eq!(stats.ranges, 1);
        assert_eq!(stats.free_pages, 99);
        tx.verify_free_ranges().unwrap();
        tx.end().unwrap();
    }
    assert_eq!(store.header().unwrap().total_pages, a + 350);
    assert_eq!(store.header().unwrap().free_ranges, 1);

    // Free C: it sits at the file tail, so the file shrinks instead of
    // gaining a range.
    {
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        tx.free_pages(c, 50).unwrap();
        tx.commit(true).unwrap();
        tx.verify_free_ranges().unwrap();
        tx.end().unwrap();
    }
    assert_eq!(store.header().unwrap().total_pages, c);

    // Free B: coalesces with the range at A, making A..B the tail; the trim
    // absorbs everything back down to a single header page.
    {
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        tx.free_pages(b, 200).unwrap();
        tx.commit(true).unwrap();
        tx.verify_free_ranges().unwrap();
        tx.end().unwrap();
    }
    let header = store.header().unwrap();
    assert_eq!(header.total_pages, 1);
    assert_eq!(header.free_ranges, 0);
    assert_eq!(header.free_range_index, 0);
}

#[test]
fn alloc_after_free_reuses_space() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reuse.store");
    let store = create_store(&path);

    let (a, guard) = {
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        let a = tx.alloc_pages(64).unwrap();
        let guard = tx.alloc_pages(1).unwrap();
        tx.commit(true).unwrap();
        tx.end().unwrap();
        (a, guard)
    };
    {
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        tx.free_pages(a, 64).unwrap();
        tx.commit(true).unwrap();
        tx.end().unwrap();
    }
    let total_before = store.header().unwrap().total_pages;
    {
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        let reused = tx.alloc_pages(32).unwrap();
        assert!(
            reused >= a && reused < guard,
            "expected reuse inside the freed range"
        );
        tx.commit(true).unwrap();
        tx.end().unwrap();
    }
    assert!(store.header().unwrap().total_pages <= total_before);
}

#[test]
fn non_final_commits_defer_the_free_range_index() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bulk.store");
    let store = create_store(&path);

    let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
    let a = tx.alloc_pages(8).unwrap();
    let _b = tx.alloc_pages(8).unwrap();
    tx.free_pages(a, 8).unwrap();
    tx.commit(false).unwrap();
    // The intermediate commit is durable but leaves the FRI unwritten.
    let header = store.header().unwrap();
    assert_eq!(header.free_range_index, u32::MAX);
    assert_eq!(header.free_ranges, 1);

    tx.commit(true).unwrap();
    tx.end().unwrap();
    let header = store.header().unwrap();
    assert_ne!(header.free_range_index, u32::MAX);
    assert_ne!(header.free_range_index, 0);

    // The final FRI round-trips into the next transaction.
    let tx = store.begin_transaction(LockLevel::Append).unwrap();
    tx.verify_free_ranges().unwrap();
    assert_eq!(tx.free_range_stats().ranges, 1);
    tx.end().unwrap();
}

#[test]
fn free_range_state_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.store");
    {
        let store = create_store(&path);
        let mut tx = store.begin_transaction(LockLevel::Append).unwrap();
        let a = tx.alloc_pages(10).unwrap();
        let _b = tx.alloc_pages(10).unwrap();
        tx.commit(true).unwrap();
        tx.free_pages(a, 10).unwrap();
        tx.commit(true).unwrap();
        tx.end().unwrap();
        store.close().unwrap();
    }
    let store = Store::open(
        &path,
        OpenOptions {
            write: true,
            ..Default::default()
        },
    )
    .unwrap();
    let tx = store.begin_transaction(LockLevel::Append).unwrap();
    tx.verify_free_ranges().unwrap();
    let stats = tx.free_range_stats();
    assert!(stats.ranges >= 1);
    tx.end().unwrap();
}
