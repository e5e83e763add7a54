//! # Manager
//!
//! Owns the ordered segment index, the segment files, the free list, the
//! memtable pair and the background pool, and exposes the engine's
//! operations: bulk loads, point reads, writes through the memtable and
//! flush, chain flattening, segment rewrites and overflow-chain
//! reorganization.
//!
//! ## Read path
//!
//! A read consults the active memtable, then the memtable currently being
//! flushed, then the disk. The disk step locates the owning segment (the
//! index entry with the greatest base key at or below the target), computes
//! the page with the segment's model, fixes that page shared and, if
//! needed, follows the overflow chain. After every page fix the index is
//! re-checked: if a concurrent rewrite replaced the segment, the read
//! restarts from the index. A reader that already holds a page latch
//! instead completes against the old segment — rewrites never mutate old
//! pages in place, they zero them after the index swap.
//!
//! ## Mutator coordination
//!
//! There is one flush worker and one reorganization worker. The flush
//! worker reaches pages only through exclusive overflow-chain fixes;
//! reorganizations fix whole chains head-first. Whoever locks
//! a chain's head link first wins; the loser observes the global
//! model-page count changed and retries from the index. Flatten, rewrite
//! and reorganize additionally serialize among themselves — they are the
//! single logical "reorg worker" of the system.

pub(crate) mod circular;
mod flush;
mod load;
mod merge;
mod recovery;
mod reorg;
mod rewrite;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::Result;
use parking_lot::{Mutex, RwLock};

use crate::bufmgr::BufferManager;
use crate::config::Options;
use crate::key::Key;
use crate::memtable::{EntryKind, MemTable};
use crate::pool::ThreadPool;
use crate::storage::{FreeList, Page, SegmentFile, SegmentId, SegmentInfo};
use crate::wal::{NoopRewriteLog, RewriteLog};

/// Pages cached by the buffer manager. Reads beyond this are served by
/// evicting unpinned frames; the number only bounds steady-state footprint.
const BUFFER_CAPACITY_PAGES: usize = 256;

/// Shared buffer for zeroing writes. Immutable, so parallel zeroing tasks
/// can all point at it; the zeroing passes still await their writes before
/// reporting completion.
pub(crate) static ZERO_PAGE: [u8; crate::storage::PAGE_SIZE] = [0u8; crate::storage::PAGE_SIZE];

pub struct Manager {
    db_path: PathBuf,
    options: Options,
    files: Arc<Vec<SegmentFile>>,
    bufmgr: BufferManager,
    index: RwLock<BTreeMap<Key, SegmentInfo>>,
    free: FreeList,
    /// Monotone rewrite sequence number; also stamped on bulk loads.
    next_sequence: AtomicU32,
    /// Total pages covered by the index. Chain fixes snapshot this to
    /// detect that a reorganization restructured pages underneath them.
    num_model_pages: AtomicU64,
    active: RwLock<Arc<MemTable>>,
    flushing: RwLock<Option<Arc<MemTable>>>,
    /// Serializes the flush path.
    flush_lock: Mutex<()>,
    /// Serializes flatten, rewrite and reorganize — the single logical
    /// reorganization worker.
    reorg_lock: Mutex<()>,
    pool: Option<ThreadPool>,
    log: Box<dyn RewriteLog>,
}

impl Manager {
    /// Opens an existing database directory, rebuilding the index and
    /// counters from the segment files. See `recovery`.
    pub fn open(db_path: &Path, options: Options) -> Result<Manager> {
        options.validate()?;
        recovery::open_existing(db_path, options)
    }

    pub(crate) fn with_state(
        db_path: PathBuf,
        options: Options,
        files: Vec<SegmentFile>,
        next_sequence: u32,
        free: FreeList,
    ) -> Manager {
        let files = Arc::new(files);
        let bufmgr = BufferManager::new(Arc::clone(&files), BUFFER_CAPACITY_PAGES);
        let pool = (options.background_threads > 0)
            .then(|| ThreadPool::new(options.background_threads));
        Manager {
            db_path,
            options,
            files,
            bufmgr,
            index: RwLock::new(BTreeMap::new()),
            free,
            next_sequence: AtomicU32::new(next_sequence),
            num_model_pages: AtomicU64::new(0),
            active: RwLock::new(Arc::new(MemTable::new())),
            flushing: RwLock::new(None),
            flush_lock: Mutex::new(()),
            reorg_lock: Mutex::new(()),
            pool,
            log: Box::new(NoopRewriteLog),
        }
    }

    /// Replaces the rewrite log. Intended to be called right after
    /// construction, before any rewrites run.
    pub fn set_rewrite_log(&mut self, log: Box<dyn RewriteLog>) {
        self.log = log;
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Records a write in the memtable. Visible to reads immediately;
    /// reaches disk on the next flush.
    pub fn put(&self, key: Key, value: &[u8]) -> Result<()> {
        self.active.read().put(key, value);
        Ok(())
    }

    /// Records a delete in the memtable. The key may still live on disk;
    /// the tombstone shadows it until the flush applies the removal.
    pub fn delete(&self, key: Key) -> Result<()> {
        self.active.read().delete(key);
        Ok(())
    }

    /// Whether the active memtable has crossed the flush threshold. The
    /// caller decides when to invoke [`Manager::flush_memtable`].
    pub fn memtable_needs_flush(&self) -> bool {
        self.active.read().approximate_memory_usage() >= self.options.memtable_flush_threshold
    }

    /// Point lookup.
    pub fn get(&self, key: Key) -> Result<Option<Vec<u8>>> {
        let (active, flushing) = {
            (
                Arc::clone(&self.active.read()),
                self.flushing.read().clone(),
            )
        };

        // 1/2. Memtables, newest first. A tombstone answers NotFound
        // without touching disk.
        for table in std::iter::once(&active).chain(flushing.as_ref()) {
            if let Some((kind, value)) = table.get(key) {
                return Ok(match kind {
                    EntryKind::Write => Some(value),
                    EntryKind::Delete => None,
                });
            }
        }

        // 3. Disk, restarting whenever a rewrite swaps the segment out
        // underneath us.
        'restart: loop {
            let Some((base, info)) = self.owning_segment(key) else {
                return Ok(None);
            };
            let page_idx = info.page_for_key(base, key);
            let mut next = Some(info.id.nth_page(page_idx));

            let mut _prev_guard = None;
            while let Some(page_id) = next.take() {
                let frame = self.bufmgr.fix(page_id)?;
                let guard = frame.read();
                if !self.segment_unchanged(key, base, &info) {
                    continue 'restart;
                }
                let page = Page::new(&guard[..]);
                if let Some(value) = page.get(key) {
                    return Ok(Some(value.to_vec()));
                }
                next = page.overflow();
                // Hand-over-hand: keep this link latched until the next
                // one is fixed, so the chain cannot be cut under us.
                _prev_guard = Some(guard);
            }
            return Ok(None);
        }
    }

    /// Index entry owning `key`: greatest base key at or below it.
    pub(crate) fn owning_segment(&self, key: Key) -> Option<(Key, SegmentInfo)> {
        let index = self.index.read();
        index
            .range(..=key)
            .next_back()
            .map(|(base, info)| (*base, info.clone()))
    }

    /// First index entry, used to route keys below every base.
    pub(crate) fn first_segment(&self) -> Option<(Key, SegmentInfo)> {
        let index = self.index.read();
        index
            .iter()
            .next()
            .map(|(base, info)| (*base, info.clone()))
    }

    /// Base key of the index entry following `key`, if any.
    pub(crate) fn next_base_after(&self, key: Key) -> Option<Key> {
        use std::ops::Bound;
        let index = self.index.read();
        index
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(base, _)| *base)
    }

    fn segment_unchanged(&self, key: Key, base: Key, info: &SegmentInfo) -> bool {
        match self.owning_segment(key) {
            Some((b, now)) => b == base && now.id == info.id && now.model == info.model,
            None => false,
        }
    }

    pub(crate) fn allocate_sequence(&self) -> u32 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Takes a reclaimed slot of the requested size or grows the
    /// size-class file.
    pub(crate) fn allocate_segment_slot(&self, page_count: usize) -> Result<SegmentId> {
        if let Some(id) = self.free.get(page_count) {
            return Ok(id);
        }
        let class = crate::storage::size_class_for_page_count(page_count)
            .ok_or_else(|| eyre::eyre!("invalid segment page count: {page_count}"))?;
        let file = &self.files[class];
        let page_offset = file.allocate_segment()?;
        Ok(SegmentId::new(class as u32, page_offset))
    }

    pub(crate) fn file_for(&self, id: SegmentId) -> &SegmentFile {
        &self.files[id.file_index as usize]
    }

    // -- introspection, used by tests and the debug CSV writer --

    pub fn index_len(&self) -> usize {
        self.index.read().len()
    }

    pub fn index_snapshot(&self) -> Vec<(Key, SegmentInfo)> {
        self.index
            .read()
            .iter()
            .map(|(base, info)| (*base, info.clone()))
            .collect()
    }

    pub fn free_list_len(&self) -> usize {
        self.free.len()
    }

    pub fn free_list_contains(&self, id: SegmentId) -> bool {
        self.free.contains(id)
    }

    pub fn num_model_pages(&self) -> u64 {
        self.num_model_pages.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("db_path", &self.db_path)
            .field("segments", &self.index_len())
            .field("model_pages", &self.num_model_pages())
            .finish()
    }
}
