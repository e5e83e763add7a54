//! Per-size-class pools of reclaimed segment slots.
//!
//! A slot becomes reusable only after the zeroing write that invalidates it
//! is durable; callers add ids here at that point, and allocation paths
//! consult the pool before growing a file.

use parking_lot::Mutex;

use super::{size_class_for_page_count, SegmentId, SEGMENT_PAGE_COUNTS};

#[derive(Debug, Default)]
pub struct FreeList {
    pools: Mutex<[Vec<SegmentId>; SEGMENT_PAGE_COUNTS.len()]>,
}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList::default()
    }

    /// Takes a reclaimed slot for segments of `page_count` pages, if any.
    pub fn get(&self, page_count: usize) -> Option<SegmentId> {
        let class = size_class_for_page_count(page_count)?;
        self.pools.lock()[class].pop()
    }

    /// Returns a slot to its size-class pool.
    pub fn add(&self, id: SegmentId) {
        let class = id.file_index as usize;
        debug_assert!(class < SEGMENT_PAGE_COUNTS.len());
        self.pools.lock()[class].push(id);
    }

    pub fn len(&self) -> usize {
        self.pools.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: SegmentId) -> bool {
        let class = id.file_index as usize;
        self.pools.lock()[class].contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pools_are_per_size_class() {
        let free = FreeList::new();
        let one_page = SegmentId::new(0, 5);
        let four_page = SegmentId::new(2, 8);
        free.add(one_page);
        free.add(four_page);

        assert_eq!(free.len(), 2);
        assert_eq!(free.get(4), Some(four_page));
        assert_eq!(free.get(4), None);
        assert_eq!(free.get(1), Some(one_page));
        assert!(free.is_empty());
    }

    #[test]
    fn invalid_page_count_yields_nothing() {
        let free = FreeList::new();
        free.add(SegmentId::new(0, 1));
        assert_eq!(free.get(3), None);
        assert_eq!(free.len(), 1);
    }
}
