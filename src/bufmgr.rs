//! # Buffer Manager
//!
//! A frame table implementing the fix/unfix contract the engine is written
//! against. Fixing a page pins a frame (loading it from its segment file on
//! a miss) and hands back a shared [`BufferFrame`]; the frame's per-page
//! latch is taken separately through `read()` / `write()` guards, so a
//! chain-walking caller can hold several latches at once in head-first
//! order.
//!
//! Readers take shared latches; only the flush worker and the reorg worker
//! ever take exclusive latches. Unfixing with `dirty = true` writes the
//! page back through its segment file with a fresh checksum, so an on-disk
//! page is always self-validating.
//!
//! Eviction is deliberately simple (this crate only relies on the contract,
//! not a particular policy): when the table grows past its watermark,
//! unpinned clean frames are dropped. `invalidate` removes a frame
//! outright; the zeroing passes use it so a reclaimed slot can never serve
//! stale bytes to a later fix of the same id.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::storage::{PageMut, SegmentFile, SegmentId, PAGE_SIZE};

/// Heap buffer backing one page frame.
pub type PageBuf = Box<[u8; PAGE_SIZE]>;

/// An owned exclusive latch guard on a frame's page buffer. Owning (rather
/// than borrowing) guards is what lets a fixed overflow chain carry its
/// latches in one vector.
pub type FrameWriteGuard = parking_lot::ArcRwLockWriteGuard<parking_lot::RawRwLock, PageBuf>;

/// An owned shared latch guard on a frame's page buffer.
pub type FrameReadGuard = parking_lot::ArcRwLockReadGuard<parking_lot::RawRwLock, PageBuf>;

#[derive(Debug)]
pub struct BufferFrame {
    id: SegmentId,
    data: Arc<RwLock<PageBuf>>,
}

impl BufferFrame {
    fn new(id: SegmentId, buf: PageBuf) -> BufferFrame {
        BufferFrame {
            id,
            data: Arc::new(RwLock::new(buf)),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    /// Shared page latch.
    pub fn read(&self) -> FrameReadGuard {
        self.data.read_arc()
    }

    /// Exclusive page latch.
    pub fn write(&self) -> FrameWriteGuard {
        self.data.write_arc()
    }
}

#[derive(Debug)]
pub struct BufferManager {
    files: Arc<Vec<SegmentFile>>,
    frames: Mutex<HashMap<SegmentId, Arc<BufferFrame>>>,
    capacity: usize,
}

impl BufferManager {
    pub fn new(files: Arc<Vec<SegmentFile>>, capacity: usize) -> BufferManager {
        BufferManager {
            files,
            frames: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Pins the frame for `page`, reading it from disk on a miss. The
    /// returned `Arc` is the pin; dropping it releases the frame to the
    /// eviction policy.
    pub fn fix(&self, page: SegmentId) -> Result<Arc<BufferFrame>> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&page) {
            return Ok(Arc::clone(frame));
        }

        if frames.len() >= self.capacity {
            // Drop unpinned frames. Dirty pages are written back eagerly in
            // unfix, so anything unpinned here is clean.
            frames.retain(|_, frame| Arc::strong_count(frame) > 1);
        }

        let mut buf: PageBuf = Box::new([0u8; PAGE_SIZE]);
        self.files[page.file_index as usize].read_pages(page.page_offset, &mut buf[..])?;
        let frame = Arc::new(BufferFrame::new(page, buf));
        frames.insert(page, Arc::clone(&frame));
        Ok(frame)
    }

    /// Releases a pin. When `dirty`, the page is written back with a fresh
    /// checksum first.
    pub fn unfix(&self, frame: Arc<BufferFrame>, dirty: bool) -> Result<()> {
        if dirty {
            let mut guard = frame.write();
            PageMut::new(&mut guard[..]).update_checksum();
            let id = frame.id();
            self.files[id.file_index as usize].write_pages(id.page_offset, &guard[..])?;
        }
        Ok(())
    }

    /// Drops a cached frame so the next fix rereads from disk. Used when a
    /// slot is zeroed or its on-disk content replaced wholesale.
    pub fn invalidate(&self, page: SegmentId) {
        self.frames.lock().remove(&page);
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.frames.lock().len()
    }
}
