//! # Storage Module
//!
//! On-disk layout for the segment store. A database directory contains one
//! fixed-stride file per power-of-two segment size:
//!
//! ```text
//! database_dir/
//! ├── segment_0            # 1-page segments (and all overflow pages)
//! ├── segment_1            # 2-page segments
//! ├── segment_2            # 4-page segments
//! ├── segment_3            # 8-page segments
//! ├── segment_4            # 16-page segments
//! └── debug/
//!     └── segment_summary.csv   # optional bulk-load statistics
//! ```
//!
//! A segment is a run of 1, 2, 4, 8 or 16 contiguous 4 KiB pages sharing one
//! base key and, for multi-page segments, one model line. Offsets within a
//! file are multiples of the segment size, so a slot is addressed by
//! `(file_index, page_offset)` — the [`SegmentId`]. Overflow pages are
//! one-page segments and are addressed the same way.
//!
//! ## Module Organization
//!
//! - `page`: the 4 KiB slotted page format (fences, prefix-stripped
//!   records, overflow pointer, model line, checksum)
//! - `segment_file`: fixed-stride positional I/O per size class
//! - `free_list`: per-size-class pools of reclaimed segment slots
//! - `wrap`: whole-segment stamping (sequence numbers, checksums)
//!
//! ## Durability Model
//!
//! There is no page-level write-ahead logging. New segments are written in
//! full and stamped with a monotone sequence number before the index ever
//! points at them; old segments are invalidated by zeroing their first page.
//! Recovery scans the files, validates checksums and adopts the highest
//! sequence number covering a key range.

mod free_list;
mod page;
mod segment_file;
mod wrap;

pub use free_list::FreeList;
pub use page::{
    Page, PageMut, PageRecords, PAGE_FLAG_HAS_MODEL, PAGE_FLAG_OVERFLOW, PAGE_HEADER_SIZE,
    PAGE_RECORD_METADATA, PAGE_SIZE, PAGE_USABLE_SIZE,
};
pub use segment_file::SegmentFile;
pub use wrap::SegmentWrap;

use crate::key::Key;
use crate::model::Line64;

/// The permitted segment sizes, in pages. Index i holds segments of
/// `1 << i` pages in file `segment_i`.
pub const SEGMENT_PAGE_COUNTS: [usize; 5] = [1, 2, 4, 8, 16];

/// The largest permitted segment size, in pages.
pub const MAX_SEGMENT_PAGES: usize = 16;

/// Returns the size-class index for a page count, if it is permitted.
pub fn size_class_for_page_count(page_count: usize) -> Option<usize> {
    SEGMENT_PAGE_COUNTS.iter().position(|&n| n == page_count)
}

/// Address of a segment's first page, or of an overflow page (which is a
/// one-page segment). `page_offset` is in pages within the size-class file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    pub file_index: u32,
    pub page_offset: u64,
}

impl SegmentId {
    pub fn new(file_index: u32, page_offset: u64) -> Self {
        Self {
            file_index,
            page_offset,
        }
    }

    /// Number of pages in segments of this id's size class.
    pub fn page_count(&self) -> usize {
        1 << self.file_index
    }

    /// Address of the i-th page of this segment.
    pub fn nth_page(&self, i: usize) -> SegmentId {
        debug_assert!(i < self.page_count());
        SegmentId {
            file_index: self.file_index,
            page_offset: self.page_offset + i as u64,
        }
    }

    /// On-disk encoding. The file index is biased by one so that the
    /// all-zero word is free to mean "no segment" (an absent overflow
    /// pointer).
    pub fn to_repr(&self) -> u64 {
        ((self.file_index as u64 + 1) << 56) | self.page_offset
    }

    /// Decodes [`Self::to_repr`]; zero decodes to `None`.
    pub fn from_repr(repr: u64) -> Option<SegmentId> {
        if repr == 0 {
            return None;
        }
        Some(SegmentId {
            file_index: ((repr >> 56) - 1) as u32,
            page_offset: repr & ((1 << 56) - 1),
        })
    }
}

/// What the ordered index stores per segment: where it lives, its model (if
/// any) and whether any of its pages currently has an overflow chain.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub id: SegmentId,
    pub model: Option<Line64>,
    pub has_overflow: bool,
}

impl SegmentInfo {
    pub fn new(id: SegmentId, model: Option<Line64>) -> Self {
        Self {
            id,
            model,
            has_overflow: false,
        }
    }

    pub fn page_count(&self) -> usize {
        self.id.page_count()
    }

    /// Page index the model assigns to `key`, relative to `base`.
    pub fn page_for_key(&self, base: Key, key: Key) -> usize {
        match &self.model {
            Some(model) => crate::model::page_for_key(base, model, self.page_count(), key),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_are_powers_of_two() {
        for (i, &n) in SEGMENT_PAGE_COUNTS.iter().enumerate() {
            assert_eq!(n, 1 << i);
            assert_eq!(size_class_for_page_count(n), Some(i));
        }
        assert_eq!(size_class_for_page_count(3), None);
        assert_eq!(size_class_for_page_count(32), None);
    }

    #[test]
    fn segment_id_repr_round_trip() {
        for id in [
            SegmentId::new(0, 0),
            SegmentId::new(0, 12345),
            SegmentId::new(4, 7),
            SegmentId::new(4, (1 << 56) - 1),
        ] {
            assert_eq!(SegmentId::from_repr(id.to_repr()), Some(id));
            assert_ne!(id.to_repr(), 0);
        }
        assert_eq!(SegmentId::from_repr(0), None);
    }

    #[test]
    fn nth_page_offsets_into_segment() {
        let id = SegmentId::new(2, 40);
        assert_eq!(id.page_count(), 4);
        assert_eq!(id.nth_page(0), id);
        assert_eq!(id.nth_page(3).page_offset, 43);
    }
}
