//! Segment rewrite scenarios: neighbor selection, slot reclamation and
//! record preservation.

use linekv::{Manager, Options, Record};

/// Fat value used to overflow pages sized for 8-byte loads.
const FAT: [u8; 110] = [0xCD; 110];

/// Three runs of 64 keys with sharply different densities, separated by
/// wide gaps: the builder closes each run as its own 2-page segment (64
/// records at 32 per page) because no single line covers two runs.
fn three_run_dataset() -> Vec<Record> {
    let mut records = Vec::new();
    for run in 0..3u64 {
        let base = run * 1_000_000;
        let step = 2 * run + 1;
        for i in 0..64u64 {
            records.push((base + i * step, vec![run as u8 + 1; 8]));
        }
    }
    records
}

fn build_three_overflowing_segments(dir: &std::path::Path) -> Manager {
    let options = Options {
        records_per_page_goal: 32,
        records_per_page_delta: 3.0,
        consider_neighbors_during_rewrite: true,
        // Exercise the parallel zeroing path.
        background_threads: 2,
        ..Options::default()
    };
    let db = Manager::bulk_load_into_segments(dir, &three_run_dataset(), options).unwrap();

    let snapshot = db.index_snapshot();
    assert_eq!(snapshot.len(), 3, "expected one segment per run");
    for (_, info) in &snapshot {
        assert_eq!(info.page_count(), 2);
    }

    // Fat updates overflow every page of every segment.
    for (key, _) in three_run_dataset() {
        db.put(key, &FAT).unwrap();
    }
    db.flush_memtable().unwrap();
    for (base, info) in db.index_snapshot() {
        assert!(info.has_overflow, "segment at {base} should have overflowed");
    }
    db
}

#[test]
fn rewrite_absorbs_overflowing_neighbors() {
    let dir = tempfile::tempdir().unwrap();
    let db = build_three_overflowing_segments(dir.path());

    let before = db.index_snapshot();
    let middle_base = before[1].0;
    let old_ids: Vec<_> = before.iter().map(|(_, info)| info.id).collect();
    assert_eq!(db.free_list_len(), 0);

    db.rewrite_segments(middle_base, &[]).unwrap();

    // All three old segments plus their six overflow pages were reclaimed.
    assert_eq!(db.free_list_len(), 9);
    for id in &old_ids {
        assert!(db.free_list_contains(*id), "old segment {id:?} not reclaimed");
    }

    // The new segments cover the same range, overflow-free.
    let after = db.index_snapshot();
    assert_eq!(after[0].0, 0);
    for (_, info) in &after {
        assert!(!info.has_overflow);
    }

    // Every live record survived with its latest value.
    for (key, _) in three_run_dataset() {
        assert_eq!(db.get(key).unwrap().as_deref(), Some(&FAT[..]), "key {key}");
    }
    assert_eq!(db.get(5_000_000).unwrap(), None);
}

#[test]
fn rewrite_without_neighbor_consideration_touches_one_segment() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        records_per_page_goal: 32,
        records_per_page_delta: 3.0,
        consider_neighbors_during_rewrite: false,
        ..Options::default()
    };
    let db = Manager::bulk_load_into_segments(dir.path(), &three_run_dataset(), options).unwrap();
    for (key, _) in three_run_dataset() {
        db.put(key, &[0xEE; 110]).unwrap();
    }
    db.flush_memtable().unwrap();

    let before = db.index_snapshot();
    let middle_base = before[1].0;
    db.rewrite_segments(middle_base, &[]).unwrap();

    // Only the middle segment (plus its two overflows) was reclaimed; the
    // neighbors keep their ids and overflows.
    assert_eq!(db.free_list_len(), 3);
    let after = db.index_snapshot();
    assert!(after.iter().any(|(_, info)| info.id == before[0].1.id));
    assert!(after.iter().any(|(_, info)| info.id == before[2].1.id));
    assert!(!after.iter().any(|(_, info)| info.id == before[1].1.id));

    for (key, _) in three_run_dataset() {
        assert_eq!(db.get(key).unwrap().as_deref(), Some(&[0xEE; 110][..]), "key {key}");
    }
}

#[test]
fn rewrite_merges_additional_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = build_three_overflowing_segments(dir.path());
    let middle_base = db.index_snapshot()[1].0;

    // New records interleaved into the middle run's key space (its keys
    // step by 3), plus one update; the in-memory record must win its tie.
    let addtl: Vec<Record> = vec![
        (middle_base + 1, b"fresh1".to_vec()),
        (middle_base + 2, b"fresh2".to_vec()),
        (middle_base + 6, b"update".to_vec()),
    ];
    db.rewrite_segments(middle_base, &addtl).unwrap();

    assert_eq!(db.get(middle_base + 1).unwrap().as_deref(), Some(&b"fresh1"[..]));
    assert_eq!(db.get(middle_base + 2).unwrap().as_deref(), Some(&b"fresh2"[..]));
    assert_eq!(db.get(middle_base + 6).unwrap().as_deref(), Some(&b"update"[..]));
    // Untouched keys keep their flushed values.
    assert_eq!(db.get(middle_base).unwrap().as_deref(), Some(&FAT[..]));
    assert_eq!(db.get(middle_base + 3).unwrap().as_deref(), Some(&FAT[..]));
}
