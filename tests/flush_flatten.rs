//! Write-path scenarios: memtable semantics through the manager, overflow
//! growth during flush, and chain flattening.

use linekv::{Manager, Options, Record};

fn load_pages(
    dir: &std::path::Path,
    keys: std::ops::Range<u64>,
    value_len: usize,
    options: Options,
) -> Manager {
    let records: Vec<Record> = keys.map(|k| (k, vec![k as u8; value_len])).collect();
    Manager::bulk_load_into_pages(dir, &records, options).unwrap()
}

#[test]
fn latest_write_wins_through_manager() {
    let dir = tempfile::tempdir().unwrap();
    let db = load_pages(dir.path(), 0..50, 8, Options::default());

    // Put, put, delete, put on the same key: the last write is what reads
    // see, before and after a flush.
    db.put(5, b"a").unwrap();
    db.put(5, b"b").unwrap();
    db.delete(5).unwrap();
    db.put(5, b"c").unwrap();
    assert_eq!(db.get(5).unwrap().as_deref(), Some(&b"c"[..]));

    db.flush_memtable().unwrap();
    assert_eq!(db.get(5).unwrap().as_deref(), Some(&b"c"[..]));
}

#[test]
fn delete_reaches_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db = load_pages(dir.path(), 0..50, 8, Options::default());

    assert!(db.get(7).unwrap().is_some());
    db.delete(7).unwrap();
    assert_eq!(db.get(7).unwrap(), None);

    db.flush_memtable().unwrap();
    assert_eq!(db.get(7).unwrap(), None);
    // Neighbors are untouched.
    assert!(db.get(6).unwrap().is_some());
    assert!(db.get(8).unwrap().is_some());
}

#[test]
fn flush_attaches_overflow_then_flatten_reclaims_it() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        records_per_page_goal: 50,
        // Keep the flush from flattening on its own; the test drives it.
        chain_rewrite_threshold: 8,
        record_size_hint: 48,
        ..Options::default()
    };
    // One 1-page segment holding keys 0..49.
    let db = load_pages(dir.path(), 0..50, 8, options);
    assert_eq!(db.index_len(), 1);
    let (base, before) = db.index_snapshot().into_iter().next().unwrap();
    assert_eq!(base, 0);

    // Rewrite every key with a fatter value and add ten new ones; the page
    // cannot hold that, so the flush chains an overflow page.
    for k in 0..60u64 {
        db.put(k, &[0xAB; 40]).unwrap();
    }
    db.flush_memtable().unwrap();
    let (_, after) = db.index_snapshot().into_iter().next().unwrap();
    assert!(after.has_overflow, "flush should have attached an overflow");
    assert_eq!(after.id, before.id);

    let free_before = db.free_list_len();
    db.flatten_chain(0, &[]).unwrap();

    // The chain became a run of one-page segments covering [0, 50) and
    // beyond; the old main and overflow slots went to the free list.
    assert!(db.index_len() >= 2, "flatten should split the chain");
    assert!(db.free_list_len() >= free_before + 2);
    assert!(db.free_list_contains(before.id));
    for (_, info) in db.index_snapshot() {
        assert_eq!(info.page_count(), 1);
        assert!(!info.has_overflow);
    }
    for k in 0..60u64 {
        assert_eq!(db.get(k).unwrap().as_deref(), Some(&[0xAB; 40][..]), "key {k}");
    }
    assert_eq!(db.get(60).unwrap(), None);
}

#[test]
fn flush_merges_new_records_through_flatten_when_chain_saturates() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        records_per_page_goal: 40,
        chain_rewrite_threshold: 2,
        ..Options::default()
    };
    let db = load_pages(dir.path(), 0..40, 8, options);

    // Enough fat updates to overrun the chain threshold immediately: the
    // flush falls through to a flatten carrying the remaining records.
    for k in 0..120u64 {
        db.put(k, &[0x5A; 60]).unwrap();
    }
    db.flush_memtable().unwrap();

    for k in 0..120u64 {
        assert_eq!(db.get(k).unwrap().as_deref(), Some(&[0x5A; 60][..]), "key {k}");
    }
    // Whatever shape the index took, it is all unchained one-page runs
    // with the chain threshold this low.
    assert!(db.index_len() >= 2);
}

#[test]
fn keys_below_the_first_base_extend_the_covered_range() {
    let dir = tempfile::tempdir().unwrap();
    let db = load_pages(dir.path(), 100..150, 8, Options::default());
    assert_eq!(db.get(10).unwrap(), None);

    db.put(10, b"low").unwrap();
    db.flush_memtable().unwrap();

    assert_eq!(db.get(10).unwrap().as_deref(), Some(&b"low"[..]));
    assert_eq!(db.index_snapshot()[0].0, 10);
    // The pre-existing records survived the rewrite.
    for k in 100..150 {
        assert!(db.get(k).unwrap().is_some(), "key {k}");
    }
}
