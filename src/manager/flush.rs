//! Memtable flush.
//!
//! Draining the memtable partitions its records (one latest entry per key)
//! by owning segment and pushes each group into that segment's pages
//! through exclusive overflow-chain fixes. A full page grows an overflow
//! (a one-page segment from the free list); a chain that crosses the
//! configured threshold — or an overflow page that is itself full — stops
//! the in-place path, and the remaining records ride into a
//! [`Manager::flatten_chain`] or [`Manager::rewrite_segments`] instead.
//!
//! ## Chain fix protocol
//!
//! `fix_overflow_chain` locks a chain strictly head-first, so the flush
//! worker and the reorganization worker serialize on the head link:
//! whichever acquires it first wins. The loser detects that the global
//! model-page count moved while it waited and gets [`ChainFix::Retry`],
//! sending it back to the index. Deletes are applied in place to chain
//! pages and never enter the record stream handed to a rewrite.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use eyre::Result;
use smallvec::SmallVec;

use crate::bufmgr::{BufferFrame, FrameWriteGuard};
use crate::key::Key;
use crate::memtable::{EntryKind, MemTable};
use crate::manager::Manager;
use crate::segment_builder::Record;
use crate::storage::{Page, PageMut, SegmentId, SegmentInfo};

/// An exclusively latched overflow chain, head first.
pub(crate) struct OverflowChain {
    pub links: SmallVec<[ChainLink; 4]>,
}

pub(crate) struct ChainLink {
    pub frame: Arc<BufferFrame>,
    pub guard: FrameWriteGuard,
}

/// Result of a chain fix attempt.
pub(crate) enum ChainFix {
    Chain(OverflowChain),
    /// The page layout changed between the caller's index consultation and
    /// the head-link acquisition; restart from the index.
    Retry,
}

impl OverflowChain {
    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn ids(&self) -> Vec<SegmentId> {
        self.links.iter().map(|l| l.frame.id()).collect()
    }

    /// Drops the latches and unfixes every link, writing back the dirty
    /// ones (guards must go before `unfix` retakes the latch).
    pub fn release(self, manager: &Manager, dirty: bool) -> Result<()> {
        for link in self.links {
            drop(link.guard);
            manager.bufmgr.unfix(link.frame, dirty)?;
        }
        Ok(())
    }
}

impl Manager {
    /// Fixes and exclusively latches the whole chain rooted at `head`.
    ///
    /// `expected` is the owning segment the caller saw in the index and
    /// `expected_model_pages` its snapshot of the global page count; if
    /// either moved by the time the head latch is held, a concurrent
    /// reorganization won the race and the caller must re-consult the
    /// index.
    pub(crate) fn fix_overflow_chain(
        &self,
        base: Key,
        expected: &SegmentInfo,
        expected_model_pages: u64,
        head: SegmentId,
    ) -> Result<ChainFix> {
        let head_frame = self.bufmgr.fix(head)?;
        let head_guard = head_frame.write();

        if self.num_model_pages.load(Ordering::Acquire) != expected_model_pages {
            return Ok(ChainFix::Retry);
        }
        match self.owning_segment(base) {
            Some((b, now)) if b == base && now.id == expected.id => {}
            _ => return Ok(ChainFix::Retry),
        }

        let mut links = SmallVec::new();
        links.push(ChainLink {
            frame: head_frame,
            guard: head_guard,
        });
        loop {
            let tail: &ChainLink = &links[links.len() - 1];
            let Some(next) = Page::new(&tail.guard[..]).overflow() else {
                break;
            };
            let frame = self.bufmgr.fix(next)?;
            let guard = frame.write();
            links.push(ChainLink { frame, guard });
        }
        Ok(ChainFix::Chain(OverflowChain { links }))
    }

    /// Drains the active memtable to disk.
    ///
    /// The active table is swapped aside (reads keep consulting it as the
    /// "being flushed" table), partitioned by owning segment and applied.
    /// Returns once every record is on disk and the flushed table is
    /// dropped.
    pub fn flush_memtable(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock();

        let table = {
            let mut active = self.active.write();
            if !active.has_entries() {
                return Ok(());
            }
            let full = Arc::clone(&*active);
            *active = Arc::new(MemTable::new());
            *self.flushing.write() = Some(Arc::clone(&full));
            full
        };

        let result = self.flush_table(&table);
        *self.flushing.write() = None;
        result
    }

    fn flush_table(&self, table: &MemTable) -> Result<()> {
        // Partition the drained records by owning segment. Keys below the
        // first base belong to the first segment; its rewrite extends the
        // covered range downward.
        let mut groups: Vec<(Key, Vec<(Key, EntryKind, Vec<u8>)>)> = Vec::new();
        for (key, kind, value) in table.iter() {
            let base = match self.owning_segment(key).or_else(|| self.first_segment()) {
                Some((base, _)) => base,
                None => eyre::bail!("flush into an empty index"),
            };
            match groups.last_mut() {
                Some((b, group)) if *b == base => group.push((key, kind, value)),
                _ => groups.push((base, vec![(key, kind, value)])),
            }
        }

        for (_, group) in groups {
            self.flush_group(group)?;
        }
        tracing::debug!(
            bytes = table.approximate_memory_usage(),
            "memtable flush complete"
        );
        Ok(())
    }

    /// Applies one per-segment group of drained records.
    fn flush_group(&self, group: Vec<(Key, EntryKind, Vec<u8>)>) -> Result<()> {
        // Deletes are applied in place and never ride into a rewrite; the
        // writes may still trigger one. Each key appears at most once.
        let mut writes: Vec<Record> = Vec::with_capacity(group.len());
        for (key, kind, value) in group {
            match kind {
                EntryKind::Write => writes.push((key, value)),
                EntryKind::Delete => self.apply_delete(key)?,
            }
        }

        let mut i = 0usize;
        while i < writes.len() {
            let key = writes[i].0;
            // Re-consult every round: an earlier rewrite in this group may
            // have re-partitioned the key space.
            let (base, info) = match self.owning_segment(key).or_else(|| self.first_segment()) {
                Some(found) => found,
                None => eyre::bail!("flush into an empty index"),
            };

            if key < base {
                // Below every segment: only a rewrite can extend the range.
                self.rewrite_or_flatten(base, &info, &writes[i..])?;
                return Ok(());
            }

            let page_idx = info.page_for_key(base, key);
            // Records for the same target page are applied under one fix.
            let mut end = i + 1;
            while end < writes.len() {
                let k = writes[end].0;
                let same_segment = match self.owning_segment(k) {
                    Some((b, _)) => b == base,
                    None => false,
                };
                if !same_segment || info.page_for_key(base, k) != page_idx {
                    break;
                }
                end += 1;
            }

            let model_pages = self.num_model_pages.load(Ordering::Acquire);
            let head = info.id.nth_page(page_idx);
            let chain = match self.fix_overflow_chain(base, &info, model_pages, head)? {
                ChainFix::Chain(chain) => chain,
                ChainFix::Retry => continue,
            };

            match self.insert_into_chain(base, &info, chain, &writes[i..end])? {
                ChainOutcome::Done => {
                    i = end;
                }
                ChainOutcome::NeedsRewrite(done) => {
                    // The chain is saturated; everything not yet applied in
                    // this group merges through a rewrite instead.
                    self.rewrite_or_flatten(base, &info, &writes[i + done..])?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn rewrite_or_flatten(&self, base: Key, info: &SegmentInfo, records: &[Record]) -> Result<()> {
        if info.page_count() == 1 {
            self.flatten_chain(base, records)
        } else {
            self.rewrite_segments(base, records)
        }
    }

    /// Applies a tombstone: the record is removed from whichever chain
    /// link holds it. Absence is fine — the key may only ever have lived
    /// in the memtable.
    fn apply_delete(&self, key: Key) -> Result<()> {
        loop {
            let Some((base, info)) = self.owning_segment(key) else {
                return Ok(());
            };
            let page_idx = info.page_for_key(base, key);
            let model_pages = self.num_model_pages.load(Ordering::Acquire);
            let head = info.id.nth_page(page_idx);
            let mut chain = match self.fix_overflow_chain(base, &info, model_pages, head)? {
                ChainFix::Chain(chain) => chain,
                ChainFix::Retry => continue,
            };
            let mut removed = false;
            for link in chain.links.iter_mut() {
                if PageMut::new(&mut link.guard[..]).remove(key) {
                    removed = true;
                    break;
                }
            }
            return chain.release(self, removed);
        }
    }

    /// Inserts a run of records targeted at one page, growing the chain as
    /// needed.
    fn insert_into_chain(
        &self,
        base: Key,
        info: &SegmentInfo,
        mut chain: OverflowChain,
        records: &[Record],
    ) -> Result<ChainOutcome> {
        // A multi-page segment's page chains stay at one overflow; the
        // one-page flavor may grow until the rewrite threshold.
        let max_links = if info.page_count() > 1 {
            2
        } else {
            self.options.chain_rewrite_threshold
        };

        let mut grew = false;
        for (done, (key, value)) in records.iter().enumerate() {
            if !self.insert_one(&mut chain, *key, value, max_links, &mut grew)? {
                chain.release(self, true)?;
                return Ok(ChainOutcome::NeedsRewrite(done));
            }
        }

        let saturated = chain.len() >= self.options.chain_rewrite_threshold;
        if grew {
            self.mark_has_overflow(base, info.id);
        }
        chain.release(self, true)?;

        if saturated {
            // Crossing the threshold schedules a rewrite even though every
            // record fit; the remaining group records go with it.
            return Ok(ChainOutcome::NeedsRewrite(records.len()));
        }
        Ok(ChainOutcome::Done)
    }

    fn insert_one(
        &self,
        chain: &mut OverflowChain,
        key: Key,
        value: &[u8],
        max_links: usize,
        grew: &mut bool,
    ) -> Result<bool> {
        let mut li = 0;
        while li < chain.links.len() {
            let links_len = chain.links.len();
            let is_tail = li + 1 == links_len;
            let mut page = PageMut::new(&mut chain.links[li].guard[..]);

            if !is_tail {
                // Interior link: update in place only. If the new value no
                // longer fits here, drop the stale copy and fall through to
                // the tail.
                if page.as_page().get(key).is_some() {
                    if page.insert(key, value) {
                        return Ok(true);
                    }
                    page.remove(key);
                }
                li += 1;
                continue;
            }

            if page.insert(key, value) {
                return Ok(true);
            }
            // Full tail page. A stale copy of this key must not survive
            // behind the one about to land in the overflow.
            if page.as_page().get(key).is_some() {
                page.remove(key);
                if page.insert(key, value) {
                    return Ok(true);
                }
            }
            if links_len >= max_links {
                return Ok(false);
            }

            // Grow the chain: a fresh one-page segment inheriting the
            // fences (and so the prefix) of its parent.
            let (lower, upper) = {
                let parent = page.as_page();
                (parent.lower_fence(), parent.upper_fence())
            };
            let overflow_id = self.allocate_segment_slot(1)?;
            let frame = self.bufmgr.fix(overflow_id)?;
            let mut guard = frame.write();
            PageMut::new(&mut guard[..]).init_overflow(lower, upper);
            PageMut::new(&mut chain.links[li].guard[..]).set_overflow(Some(overflow_id));
            chain.links.push(ChainLink { frame, guard });
            *grew = true;
            li += 1;
        }
        unreachable!("chain insert always terminates at the tail link");
    }

    fn mark_has_overflow(&self, base: Key, id: SegmentId) {
        let mut index = self.index.write();
        if let Some(info) = index.get_mut(&base) {
            if info.id == id {
                info.has_overflow = true;
            }
        }
    }
}

enum ChainOutcome {
    /// All records applied in place.
    Done,
    /// `0..n` records applied; the rest must merge through a rewrite.
    NeedsRewrite(usize),
}
