//! Bounded page-slot pool for the sliding-window rewrite.
//!
//! A rewrite keeps at most `capacity` pages in memory at once. Slots are
//! pre-allocated page buffers handed out by `allocate` and returned by
//! `free`; the capacity is a hard upper bound chosen by the caller, which
//! is responsible for flushing the segment builder before exceeding it —
//! running out here is a logic error, not an I/O condition, and aborts.
//!
//! The FIFO release discipline lives in the caller's `processed` deque:
//! chains are freed strictly in the order they were read in.

use crate::bufmgr::PageBuf;
use crate::storage::PAGE_SIZE;

pub(crate) struct CircularPageBuffer {
    free: Vec<PageBuf>,
    capacity: usize,
}

impl CircularPageBuffer {
    pub fn new(capacity: usize) -> CircularPageBuffer {
        let free = (0..capacity)
            .map(|_| -> PageBuf { Box::new([0u8; PAGE_SIZE]) })
            .collect();
        CircularPageBuffer { free, capacity }
    }

    pub fn num_free_pages(&self) -> usize {
        self.free.len()
    }

    /// Takes a free slot. Panics when the window is exhausted; the rewrite
    /// must flush before reading more pages than fit.
    pub fn allocate(&mut self) -> PageBuf {
        self.free
            .pop()
            .expect("sliding-window page buffer exhausted; caller failed to flush")
    }

    /// Returns a slot to the pool.
    pub fn free(&mut self, buf: PageBuf) {
        debug_assert!(self.free.len() < self.capacity);
        self.free.push(buf);
    }
}
