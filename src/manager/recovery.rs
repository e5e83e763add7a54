//! Opening an existing database.
//!
//! Recovery state is implicit in the segment files. The scan walks every
//! slot of every size-class file and reads its first page:
//!
//! - an all-zero page marks a free (or invalidated) slot → free list;
//! - a checksum mismatch marks a torn or corrupt slot → logged, free list;
//! - an overflow-flagged page is reachable only through its parent and is
//!   never an index candidate;
//! - anything else is a segment candidate carrying its base key (lower
//!   fence), model and sequence number.
//!
//! Candidates are adopted in descending sequence order; a candidate whose
//! key range overlaps an already adopted one lost a rewrite race with a
//! crash in between — it is zeroed and its slot reclaimed. Both monotone
//! counters restart above the largest persisted sequence number.

use std::collections::BTreeMap;
use std::path::Path;

use eyre::Result;
use tracing::{info, warn};

use crate::config::Options;
use crate::error::StorageError;
use crate::key::Key;
use crate::manager::{Manager, ZERO_PAGE};
use crate::storage::{
    FreeList, Page, SegmentFile, SegmentId, SegmentInfo, PAGE_SIZE, SEGMENT_PAGE_COUNTS,
};

struct Candidate {
    base: Key,
    upper: Key,
    sequence: u32,
    info: SegmentInfo,
}

pub(crate) fn open_existing(db_path: &Path, options: Options) -> Result<Manager> {
    let mut files: Vec<SegmentFile> = Vec::new();
    for class in 0..SEGMENT_PAGE_COUNTS.len() {
        if !db_path.join(SegmentFile::file_name(class)).is_file() {
            break;
        }
        files.push(SegmentFile::open(db_path, class)?);
    }
    if files.is_empty() {
        return Err(StorageError::InvalidArgument(format!(
            "{} is not a database directory (no segment files)",
            db_path.display()
        ))
        .into());
    }

    let free = FreeList::new();
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut max_sequence = 0u32;
    let mut corrupt_slots = 0usize;

    for (class, file) in files.iter().enumerate() {
        let pages_per_segment = file.pages_per_segment();
        let mut buf = vec![0u8; pages_per_segment * PAGE_SIZE];
        for slot in 0..file.num_segments() {
            let page_offset = slot * pages_per_segment as u64;
            file.read_pages(page_offset, &mut buf)?;
            let id = SegmentId::new(class as u32, page_offset);
            let first = Page::new(&buf[..PAGE_SIZE]);

            if first.is_zeroed() {
                free.add(id);
                continue;
            }
            if !first.checksum_ok() {
                warn!(?id, "segment slot failed checksum validation; reclaiming");
                corrupt_slots += 1;
                free.add(id);
                continue;
            }
            if first.is_overflow_page() {
                // Owned by whichever main page points at it. If that parent
                // is gone the slot is leaked until a later failed
                // validation reclaims it.
                continue;
            }

            let base = first.lower_fence();
            let sequence = first.sequence();
            max_sequence = max_sequence.max(sequence);

            let mut info = SegmentInfo::new(id, first.model());
            let mut upper = first.upper_fence();
            for i in 0..pages_per_segment {
                let page = Page::new(&buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
                if page.has_overflow() {
                    info.has_overflow = true;
                }
                if i + 1 == pages_per_segment {
                    upper = page.upper_fence();
                }
            }

            candidates.push(Candidate {
                base,
                upper,
                sequence,
                info,
            });
        }
    }

    // Highest sequence number wins any overlap: a crash mid-rewrite leaves
    // both the replaced segments and their replacements on disk.
    candidates.sort_by(|a, b| b.sequence.cmp(&a.sequence).then(a.base.cmp(&b.base)));
    let mut adopted: BTreeMap<Key, (Key, SegmentInfo)> = BTreeMap::new();
    for candidate in candidates {
        if overlaps(&adopted, candidate.base, candidate.upper) {
            warn!(
                base = candidate.base,
                sequence = candidate.sequence,
                "discarding superseded segment from an interrupted rewrite"
            );
            let id = candidate.info.id;
            files[id.file_index as usize].write_pages(id.page_offset, &ZERO_PAGE)?;
            free.add(id);
            continue;
        }
        adopted.insert(candidate.base, (candidate.upper, candidate.info));
    }

    let manager = Manager::with_state(
        db_path.to_path_buf(),
        options,
        files,
        max_sequence + 1,
        free,
    );
    let segments = adopted.len();
    manager.install_index(
        adopted
            .into_iter()
            .map(|(base, (_, info))| (base, info))
            .collect(),
    );

    info!(
        segments,
        corrupt_slots,
        next_sequence = max_sequence + 1,
        "database recovered"
    );
    Ok(manager)
}

fn overlaps(adopted: &BTreeMap<Key, (Key, SegmentInfo)>, base: Key, upper: Key) -> bool {
    // Predecessor reaching past our base?
    if let Some((_, (prev_upper, _))) = adopted.range(..=base).next_back() {
        if *prev_upper > base {
            return true;
        }
    }
    // Successor starting inside our range?
    adopted.range(base..upper).next().is_some()
}
