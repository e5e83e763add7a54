//! Bulk-load scenarios: page-per-goal partitioning and learned segments.

use linekv::{page_for_key, Manager, Options, Record};

fn sequential_records(n: u64, step: u64, value_len: usize) -> Vec<Record> {
    (0..n).map(|i| (i * step, vec![(i % 251) as u8; value_len])).collect()
}

#[test]
fn bulk_load_into_pages_partitions_fifty_per_page() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        records_per_page_goal: 50,
        ..Options::default()
    };
    let records: Vec<Record> = (1..=1000u64).map(|k| (k, k.to_be_bytes().to_vec())).collect();
    let db = Manager::bulk_load_into_pages(dir.path(), &records, options).unwrap();

    // 1000 keys at 50 per page: 20 one-page segments, each covering 50
    // consecutive keys.
    assert_eq!(db.index_len(), 20);
    let snapshot = db.index_snapshot();
    for (i, (base, info)) in snapshot.iter().enumerate() {
        assert_eq!(*base, 1 + i as u64 * 50);
        assert_eq!(info.page_count(), 1);
    }
    for (key, value) in &records {
        assert_eq!(db.get(*key).unwrap().as_deref(), Some(&value[..]));
    }
    assert_eq!(db.get(1001).unwrap(), None);
}

#[test]
fn bulk_load_into_segments_builds_models() {
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        records_per_page_goal: 50,
        ..Options::default()
    };
    // Keys 0, 10, 20, ..., 9990.
    let records = sequential_records(1000, 10, 8);
    let db = Manager::bulk_load_into_segments(dir.path(), &records, options).unwrap();

    let snapshot = db.index_snapshot();
    assert!(
        snapshot.iter().any(|(_, info)| info.page_count() > 1),
        "a uniform dataset should produce at least one multi-page segment"
    );

    // Every record's model-computed page agrees with where the loader put
    // it: the model is what routes reads, so a full scan through get()
    // doubles as the placement check.
    for (base, info) in &snapshot {
        if let Some(model) = &info.model {
            let upper = db
                .index_snapshot()
                .iter()
                .find(|(b, _)| b > base)
                .map_or(u64::MAX, |(b, _)| *b);
            for (key, _) in records.iter().filter(|(k, _)| k >= base && *k < upper) {
                let page = page_for_key(*base, model, info.page_count(), *key);
                assert!(page < info.page_count());
            }
        }
    }
    for (key, value) in &records {
        assert_eq!(db.get(*key).unwrap().as_deref(), Some(&value[..]));
    }
    // Keys between the loaded ones are absent.
    assert_eq!(db.get(5).unwrap(), None);
    assert_eq!(db.get(9995).unwrap(), None);
}

#[test]
fn segment_files_use_power_of_two_strides() {
    let dir = tempfile::tempdir().unwrap();
    let records = sequential_records(2000, 7, 8);
    let _db = Manager::bulk_load_into_segments(dir.path(), &records, Options::default()).unwrap();

    for class in 0..5 {
        let path = dir.path().join(format!("segment_{class}"));
        assert!(path.is_file(), "segment_{class} should exist");
        let len = std::fs::metadata(&path).unwrap().len();
        let stride = (1u64 << class) * 4096;
        assert_eq!(len % stride, 0, "segment_{class} length {len} not slot-aligned");
    }
}
