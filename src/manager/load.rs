//! Bulk loading and segment materialization.
//!
//! `bulk_load_into_segments` runs the segment builder over a sorted dataset
//! and writes variable-size segments with models; `bulk_load_into_pages`
//! skips the builder and packs a fixed number of records per one-page
//! segment (the non-model flavor). Both hand each finished segment to the
//! writers here, which are also what flattens and rewrites use:
//! `load_into_new_segment` for modeled segments, `load_into_new_pages` for
//! runs of one-page segments.

use std::path::Path;
use std::sync::atomic::Ordering;

use eyre::{ensure, Result, WrapErr};

use crate::config::Options;
use crate::key::Key;
use crate::manager::Manager;
use crate::segment_builder::{
    compute_page_lower_boundaries, Record, Segment, SegmentBuilder,
};
use crate::storage::{
    FreeList, PageMut, SegmentFile, SegmentInfo, SegmentWrap, PAGE_SIZE,
    SEGMENT_PAGE_COUNTS,
};

const DEBUG_DIR_NAME: &str = "debug";
const SEGMENT_SUMMARY_CSV: &str = "segment_summary.csv";

impl Manager {
    /// Creates a database from a sorted dataset, organized into
    /// variable-size segments with learned page addressing.
    pub fn bulk_load_into_segments(
        db_path: &Path,
        records: &[Record],
        options: Options,
    ) -> Result<Manager> {
        options.validate()?;
        ensure!(!records.is_empty(), "cannot bulk load an empty dataset");
        std::fs::create_dir_all(db_path)
            .wrap_err_with(|| format!("failed to create {}", db_path.display()))?;

        let files = (0..SEGMENT_PAGE_COUNTS.len())
            .map(|class| SegmentFile::open(db_path, class))
            .collect::<Result<Vec<_>>>()?;
        let manager =
            Manager::with_state(db_path.to_path_buf(), options, files, 1, FreeList::new());

        let mut builder = SegmentBuilder::new(
            manager.options.records_per_page_goal,
            manager.options.records_per_page_delta,
        );
        let segments = builder.build_from_dataset(records)?;

        if manager.options.write_debug_info {
            write_segment_summary(manager.db_path(), &segments)?;
        }

        let mut entries = Vec::with_capacity(segments.len());
        for (i, segment) in segments.iter().enumerate() {
            let upper_bound = segments
                .get(i + 1)
                .map_or(Key::MAX, |next| next.base_key);
            entries.push(manager.load_into_new_segment(0, segment, upper_bound)?);
        }
        manager.install_index(entries);
        Ok(manager)
    }

    /// Creates a database of one-page segments, `records_per_page_goal`
    /// records each, with no models. This is the flavor the overflow-chain
    /// reorganization operates on.
    pub fn bulk_load_into_pages(
        db_path: &Path,
        records: &[Record],
        options: Options,
    ) -> Result<Manager> {
        options.validate()?;
        ensure!(!records.is_empty(), "cannot bulk load an empty dataset");
        ensure!(
            records.windows(2).all(|w| w[0].0 < w[1].0),
            "bulk-load records must be sorted by strictly ascending key"
        );
        std::fs::create_dir_all(db_path)
            .wrap_err_with(|| format!("failed to create {}", db_path.display()))?;

        // One single file of 4 KiB pages.
        let files = vec![SegmentFile::open(db_path, 0)?];
        let manager =
            Manager::with_state(db_path.to_path_buf(), options, files, 1, FreeList::new());

        let entries =
            manager.load_into_new_pages(0, records[0].0, Key::MAX, records)?;
        manager.install_index(entries);
        Ok(manager)
    }

    /// Installs a freshly built index, replacing nothing. Used by the bulk
    /// loaders and recovery.
    pub(crate) fn install_index(&self, entries: Vec<(Key, SegmentInfo)>) {
        let mut index = self.index.write();
        debug_assert!(index.is_empty());
        let mut pages = 0u64;
        for (base, info) in entries {
            pages += info.page_count() as u64;
            index.insert(base, info);
        }
        self.num_model_pages.store(pages, Ordering::Release);
    }

    /// Writes one builder segment to disk: partitions its records onto
    /// pages along the model-induced boundaries, stamps the sequence
    /// number and checksums, and places it in a free or fresh slot.
    pub(crate) fn load_into_new_segment(
        &self,
        sequence: u32,
        segment: &Segment,
        upper_bound: Key,
    ) -> Result<(Key, SegmentInfo)> {
        ensure!(!segment.records.is_empty(), "segment has no records");
        let page_count = segment.page_count;
        let base_key = segment.base_key;
        let mut buf = vec![0u8; page_count * PAGE_SIZE];

        if page_count > 1 {
            let boundaries = compute_page_lower_boundaries(segment)?;
            let mut start = 0usize;
            for page_idx in 0..page_count {
                let page_upper = boundaries
                    .get(page_idx + 1)
                    .copied()
                    .unwrap_or(upper_bound);
                let end = if page_idx + 1 < page_count {
                    segment.records[start..]
                        .partition_point(|(k, _)| *k < page_upper)
                        + start
                } else {
                    segment.records.len()
                };
                load_into_page(
                    &mut buf[page_idx * PAGE_SIZE..(page_idx + 1) * PAGE_SIZE],
                    boundaries[page_idx],
                    page_upper,
                    &segment.records[start..end],
                )?;
                start = end;
            }
            // The model is serialized on the first page only.
            let model = segment
                .model
                .ok_or_else(|| eyre::eyre!("multi-page segment is missing its model"))?;
            PageMut::new(&mut buf[..PAGE_SIZE]).set_model(model);
        } else {
            load_into_page(&mut buf, base_key, upper_bound, &segment.records)?;
        }

        let mut wrap = SegmentWrap::new(&mut buf, page_count);
        wrap.set_sequence_number(sequence);
        wrap.clear_all_overflows();
        wrap.compute_and_set_checksums();

        let id = self.allocate_segment_slot(page_count)?;
        self.file_for(id).write_pages(id.page_offset, &buf)?;
        // The slot may be a reused one; stale cached frames must not
        // survive its new contents.
        for i in 0..page_count {
            self.bufmgr.invalidate(id.nth_page(i));
        }

        Ok((base_key, SegmentInfo::new(id, segment.model)))
    }

    /// Writes a sorted run of records out as a sequence of one-page
    /// segments of `records_per_page_goal` records each, spanning
    /// `[lower_bound, upper_bound)`.
    pub(crate) fn load_into_new_pages(
        &self,
        sequence: u32,
        lower_bound: Key,
        upper_bound: Key,
        records: &[Record],
    ) -> Result<Vec<(Key, SegmentInfo)>> {
        if records.is_empty() {
            // A fully deleted range still needs a page so the index keeps
            // covering it.
            let mut buf = vec![0u8; PAGE_SIZE];
            load_into_page(&mut buf, lower_bound, upper_bound, &[])?;
            let mut wrap = SegmentWrap::new(&mut buf, 1);
            wrap.set_sequence_number(sequence);
            wrap.compute_and_set_checksums();
            let id = self.allocate_segment_slot(1)?;
            self.file_for(id).write_pages(id.page_offset, &buf)?;
            self.bufmgr.invalidate(id);
            return Ok(vec![(lower_bound, SegmentInfo::new(id, None))]);
        }
        let per_page = self.options.records_per_page_goal;
        let mut entries = Vec::with_capacity(records.len().div_ceil(per_page));
        let mut buf = vec![0u8; PAGE_SIZE];

        let mut start = 0usize;
        while start < records.len() {
            let end = (start + per_page).min(records.len());
            let lower = if start == 0 {
                lower_bound
            } else {
                records[start].0
            };
            let upper = if end == records.len() {
                upper_bound
            } else {
                records[end].0
            };
            load_into_page(&mut buf, lower, upper, &records[start..end])?;

            let mut wrap = SegmentWrap::new(&mut buf, 1);
            wrap.set_sequence_number(sequence);
            wrap.clear_all_overflows();
            wrap.compute_and_set_checksums();

            let id = self.allocate_segment_slot(1)?;
            self.file_for(id).write_pages(id.page_offset, &buf)?;
            self.bufmgr.invalidate(id);

            entries.push((lower, SegmentInfo::new(id, None)));
            start = end;
        }
        Ok(entries)
    }
}

/// Packs a sorted record run into one page spanning `[lower, upper)`.
fn load_into_page(buf: &mut [u8], lower: Key, upper: Key, records: &[Record]) -> Result<()> {
    let mut page = PageMut::new(buf);
    page.init(lower, upper);
    for (key, value) in records {
        ensure!(
            page.insert(*key, value),
            "page full while loading {} records into [{lower}, {upper})",
            records.len()
        );
    }
    Ok(())
}

/// Writes `debug/segment_summary.csv`: one row per size class with the
/// number of segments the bulk load produced at that size.
fn write_segment_summary(db_path: &Path, segments: &[Segment]) -> Result<()> {
    use std::io::Write;

    let debug_dir = db_path.join(DEBUG_DIR_NAME);
    std::fs::create_dir_all(&debug_dir)?;
    let mut counts = [0usize; SEGMENT_PAGE_COUNTS.len()];
    for segment in segments {
        if let Some(class) = crate::storage::size_class_for_page_count(segment.page_count) {
            counts[class] += 1;
        }
    }

    let mut out = std::fs::File::create(debug_dir.join(SEGMENT_SUMMARY_CSV))?;
    writeln!(out, "segment_page_count,num_segments")?;
    for (class, count) in counts.iter().enumerate() {
        writeln!(out, "{},{}", 1usize << class, count)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(n: u64, step: u64) -> Vec<Record> {
        (0..n).map(|i| (i * step, i.to_be_bytes().to_vec())).collect()
    }

    #[test]
    fn pages_flavor_partitions_by_goal() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            records_per_page_goal: 50,
            ..Options::default()
        };
        let manager =
            Manager::bulk_load_into_pages(dir.path(), &records(1000, 1), options).unwrap();

        assert_eq!(manager.index_len(), 20);
        let snapshot = manager.index_snapshot();
        for (i, (base, info)) in snapshot.iter().enumerate() {
            assert_eq!(*base, i as Key * 50);
            assert_eq!(info.page_count(), 1);
            assert!(info.model.is_none());
        }
        assert_eq!(manager.num_model_pages(), 20);
    }

    #[test]
    fn segments_flavor_builds_models() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            records_per_page_goal: 50,
            ..Options::default()
        };
        let manager =
            Manager::bulk_load_into_segments(dir.path(), &records(1000, 10), options).unwrap();

        let snapshot = manager.index_snapshot();
        assert!(snapshot.iter().any(|(_, info)| info.page_count() > 1));
        let pages: u64 = snapshot.iter().map(|(_, i)| i.page_count() as u64).sum();
        assert_eq!(manager.num_model_pages(), pages);
    }

    #[test]
    fn loaded_records_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        let data = records(500, 3);
        let manager =
            Manager::bulk_load_into_segments(dir.path(), &data, Options::default()).unwrap();
        for (key, value) in &data {
            assert_eq!(manager.get(*key).unwrap().as_deref(), Some(&value[..]));
        }
        assert_eq!(manager.get(1).unwrap(), None);
        assert_eq!(manager.get(3 * 500).unwrap(), None);
    }

    #[test]
    fn debug_summary_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            records_per_page_goal: 50,
            write_debug_info: true,
            ..Options::default()
        };
        Manager::bulk_load_into_segments(dir.path(), &records(1000, 10), options).unwrap();

        let csv =
            std::fs::read_to_string(dir.path().join("debug").join("segment_summary.csv")).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("segment_page_count,num_segments"));
        let rows: Vec<&str> = lines.collect();
        assert_eq!(rows.len(), SEGMENT_PAGE_COUNTS.len());
        assert!(rows[0].starts_with("1,"));
        assert!(rows[4].starts_with("16,"));
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manager::bulk_load_into_pages(dir.path(), &[], Options::default()).is_err());
    }
}
