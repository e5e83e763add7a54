//! Whole-segment stamping.
//!
//! A [`SegmentWrap`] views an in-memory run of pages about to be written as
//! one segment and applies the per-page header bookkeeping the loaders and
//! rewrites need: sequence numbers on every page, fresh checksums, cleared
//! overflow pointers. It also answers segment-wide questions (overflow
//! count) when a segment has just been read in.

use super::{Page, PageMut, SegmentId, PAGE_SIZE};

pub struct SegmentWrap<'a> {
    data: &'a mut [u8],
    page_count: usize,
}

impl<'a> SegmentWrap<'a> {
    pub fn new(data: &'a mut [u8], page_count: usize) -> SegmentWrap<'a> {
        debug_assert_eq!(data.len(), page_count * PAGE_SIZE);
        SegmentWrap { data, page_count }
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    fn page_slice(&self, i: usize) -> &[u8] {
        &self.data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]
    }

    fn page_slice_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]
    }

    /// Stamps `sequence` on every page of the segment.
    pub fn set_sequence_number(&mut self, sequence: u32) {
        for i in 0..self.page_count {
            PageMut::new(self.page_slice_mut(i)).set_sequence(sequence);
        }
    }

    /// The sequence number recorded on the first page.
    pub fn sequence_number(&self) -> u32 {
        Page::new(self.page_slice(0)).sequence()
    }

    /// Zeroes the overflow pointer on every page. New segments must never
    /// point at overflow pages owned by their predecessors.
    pub fn clear_all_overflows(&mut self) {
        for i in 0..self.page_count {
            PageMut::new(self.page_slice_mut(i)).set_overflow(None);
        }
    }

    /// Number of pages in this segment that currently have an overflow.
    pub fn num_overflows(&self) -> usize {
        (0..self.page_count)
            .filter(|&i| Page::new(self.page_slice(i)).has_overflow())
            .count()
    }

    /// Recomputes and stores each page's checksum. Must run last, after all
    /// other header mutations.
    pub fn compute_and_set_checksums(&mut self) {
        for i in 0..self.page_count {
            PageMut::new(self.page_slice_mut(i)).update_checksum();
        }
    }

    pub fn verify_checksums(&self) -> bool {
        (0..self.page_count).all(|i| Page::new(self.page_slice(i)).checksum_ok())
    }

    pub fn for_each_page(&self, mut f: impl FnMut(usize, Page<'_>)) {
        for i in 0..self.page_count {
            f(i, Page::new(self.page_slice(i)));
        }
    }

    /// Overflow ids referenced by this segment's pages, paired with the
    /// referencing page index.
    pub fn overflow_ids(&self) -> Vec<(usize, SegmentId)> {
        let mut out = Vec::new();
        self.for_each_page(|i, page| {
            if let Some(id) = page.overflow() {
                out.push((i, id));
            }
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    fn init_pages(data: &mut [u8], page_count: usize) {
        for i in 0..page_count {
            let lower = (i as Key) * 100;
            let upper = if i + 1 == page_count { Key::MAX } else { lower + 100 };
            PageMut::new(&mut data[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]).init(lower, upper);
        }
    }

    #[test]
    fn stamps_every_page() {
        let mut data = vec![0u8; 4 * PAGE_SIZE];
        init_pages(&mut data, 4);
        let mut wrap = SegmentWrap::new(&mut data, 4);
        wrap.set_sequence_number(9);
        wrap.compute_and_set_checksums();

        assert_eq!(wrap.sequence_number(), 9);
        assert!(wrap.verify_checksums());
        wrap.for_each_page(|_, page| assert_eq!(page.sequence(), 9));
    }

    #[test]
    fn clears_and_counts_overflows() {
        let mut data = vec![0u8; 2 * PAGE_SIZE];
        init_pages(&mut data, 2);
        PageMut::new(&mut data[..PAGE_SIZE]).set_overflow(Some(SegmentId::new(0, 3)));

        let mut wrap = SegmentWrap::new(&mut data, 2);
        assert_eq!(wrap.num_overflows(), 1);
        assert_eq!(wrap.overflow_ids(), vec![(0, SegmentId::new(0, 3))]);

        wrap.clear_all_overflows();
        assert_eq!(wrap.num_overflows(), 0);
    }

    #[test]
    fn checksum_fails_after_mutation() {
        let mut data = vec![0u8; PAGE_SIZE];
        init_pages(&mut data, 1);
        let mut wrap = SegmentWrap::new(&mut data, 1);
        wrap.set_sequence_number(1);
        wrap.compute_and_set_checksums();
        assert!(wrap.verify_checksums());

        PageMut::new(&mut data[..PAGE_SIZE]).set_sequence(2);
        let wrap = SegmentWrap::new(&mut data, 1);
        assert!(!wrap.verify_checksums());
    }
}
