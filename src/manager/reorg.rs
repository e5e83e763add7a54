//! Overflow-chain reorganization (the non-model flavor).
//!
//! Reshapes one long chain of one-page segments into a small fan-out of
//! independent pages, each re-entering the index under its own lower
//! boundary. The whole chain is held exclusively for the duration:
//!
//! - Concurrent flushers serialize with us on the head link. Whoever
//!   loses observes the model-page count changed and retries from the
//!   index (see `fix_overflow_chain`).
//! - Readers already holding a link proceed against the old layout; the
//!   exclusive fix waits for them. Readers that have not reached the head
//!   yet block there and re-consult the index afterwards.
//!
//! The commit walks the new layout in REVERSE page order, releasing each
//! frame as it is finalized, so a reader stalled at the head is released
//! last — by then every page it can advance to is committed.

use std::sync::atomic::Ordering;

use eyre::{ensure, Result};

use crate::error::StorageError;
use crate::key::Key;
use crate::manager::flush::{ChainFix, ChainLink};
use crate::manager::merge::PageMergeIterator;
use crate::manager::Manager;
use crate::storage::{
    Page, PageMut, SegmentId, SegmentInfo, PAGE_RECORD_METADATA, PAGE_SIZE, PAGE_USABLE_SIZE,
};

impl Manager {
    /// Reorganizes the chain rooted at `head` to roughly `page_fill_pct`
    /// per page. Returns `InvalidArgument` when the chain exceeds the
    /// maximum reorganization fanout.
    pub fn reorganize_overflow_chain(&self, head: SegmentId, page_fill_pct: u32) -> Result<()> {
        let _worker = self.reorg_lock.lock();
        if !(1..=100).contains(&page_fill_pct) {
            return Err(StorageError::InvalidArgument(format!(
                "page_fill_pct must be within [1, 100], got {page_fill_pct}"
            ))
            .into());
        }

        // Acquire the whole chain, retrying while reorganizations race us.
        let (base, mut chain) = loop {
            let head_frame = self.bufmgr.fix(head)?;
            let base = Page::new(&head_frame.read()[..]).lower_fence();
            drop(head_frame);

            let Some((found_base, info)) = self.owning_segment(base) else {
                return Ok(());
            };
            if found_base != base || info.id != head {
                // The chain was rewritten while this reorganization was
                // queued; nothing left to do.
                return Ok(());
            }
            if info.page_count() != 1 || info.model.is_some() {
                return Err(StorageError::InvalidArgument(
                    "overflow-chain reorganization applies to unmodeled one-page segments".into(),
                )
                .into());
            }

            let model_pages = self.num_model_pages.load(Ordering::Acquire);
            match self.fix_overflow_chain(base, &info, model_pages, head)? {
                ChainFix::Chain(chain) => break (base, chain),
                ChainFix::Retry => continue,
            }
        };

        // Scheduled twice? The chain may already be short.
        if chain.len() == 1 {
            return chain.release(self, false);
        }
        let old_num_pages = chain.len();
        if old_num_pages > self.options.max_reorg_fanout {
            tracing::warn!(
                chain_length = old_num_pages,
                max_fanout = self.options.max_reorg_fanout,
                "chain is too long to reorganize within the maximum fanout"
            );
            chain.release(self, false)?;
            return Err(StorageError::InvalidArgument(format!(
                "chain of {old_num_pages} pages exceeds the maximum reorganization fanout"
            ))
            .into());
        }

        // All links share the head's fences, so they share its prefix; the
        // records' effective size shrinks by that much.
        let head_page = Page::new(&chain.links[0].guard[..]);
        let prefix_len = head_page.prefix_len();
        let upper_fence = head_page.upper_fence();
        let record_size = self.options.record_size_hint;
        let effective_record_size = record_size.saturating_sub(prefix_len).max(1);
        let per_record = effective_record_size + PAGE_RECORD_METADATA;

        // Conservative record-count bound: every link full of
        // effective-size records, fences subtracted. Refined after the
        // first pass counts the real records.
        let estimated_keys =
            old_num_pages * (PAGE_USABLE_SIZE.saturating_sub(2 * record_size) / per_record);

        let records_per_page_at =
            |fill: u32| ((PAGE_USABLE_SIZE * fill as usize / 100) / per_record).max(1);
        let pages_for = |keys: usize, fill: u32| keys.div_ceil(records_per_page_at(fill)).max(1);

        // Bump the fill target until the fan-out fits. This stops at or
        // before 100%: the chain itself (no longer than the max fanout)
        // already stores these records at some per-page fullness.
        let mut fill = page_fill_pct;
        while pages_for(estimated_keys, fill) > self.options.max_reorg_fanout && fill < 100 {
            fill += 1;
        }
        let records_per_page = records_per_page_at(fill);

        // Pass 1: count records and collect the boundary key of every
        // records_per_page-th record.
        let mut boundary_keys: Vec<Key> = vec![base];
        let mut record_count = 0usize;
        {
            let pages = chain.links.iter().map(|l| Page::new(&l.guard[..]));
            for (key, _) in PageMergeIterator::new(pages) {
                if record_count > 0 && record_count % records_per_page == 0 {
                    boundary_keys.push(key);
                }
                record_count += 1;
            }
        }
        let new_num_pages = boundary_keys.len();
        boundary_keys.push(upper_fence);

        // Pass 2: build the new pages in memory.
        let mut new_pages: Vec<Vec<u8>> = (0..new_num_pages)
            .map(|i| {
                let mut buf = vec![0u8; PAGE_SIZE];
                PageMut::new(&mut buf).init(boundary_keys[i], boundary_keys[i + 1]);
                buf
            })
            .collect();
        {
            let pages = chain.links.iter().map(|l| Page::new(&l.guard[..]));
            for (i, (key, value)) in PageMergeIterator::new(pages).enumerate() {
                let target = i / records_per_page;
                ensure!(
                    PageMut::new(&mut new_pages[target]).insert(key, value),
                    "reorganized page {target} overflowed at fill {fill}%"
                );
            }
        }

        let sequence = self.allocate_sequence();

        // Gather the final frame per new page index: old frames first,
        // fresh one-page slots beyond the old chain length.
        let mut surplus: Vec<ChainLink> = Vec::new();
        while chain.links.len() > new_num_pages {
            if let Some(link) = chain.links.pop() {
                surplus.push(link);
            }
        }
        let mut links: Vec<ChainLink> = chain.links.into_iter().collect();
        while links.len() < new_num_pages {
            let id = self.allocate_segment_slot(1)?;
            let frame = self.bufmgr.fix(id)?;
            let guard = frame.write();
            links.push(ChainLink { frame, guard });
        }

        // Publish the new boundaries while every frame is still latched;
        // a reader routed here blocks until the commit below releases its
        // page. The old entry's boundary (the head) is simply overwritten.
        {
            let mut index = self.index.write();
            for (i, link) in links.iter().enumerate() {
                index.insert(
                    boundary_keys[i],
                    SegmentInfo::new(link.frame.id(), None),
                );
            }
            self.bump_model_pages(new_num_pages as i64 - 1);
        }

        // Commit in reverse page order, head last.
        let mut reclaimed: Vec<SegmentId> = Vec::new();
        for (i, link) in links.into_iter().enumerate().rev() {
            let ChainLink { frame, mut guard } = link;
            guard[..].copy_from_slice(&new_pages[i]);
            PageMut::new(&mut guard[..]).set_sequence(sequence);
            drop(guard);
            self.bufmgr.unfix(frame, true)?;
        }

        // Surplus old links (tail side) hold records that now live in the
        // fan-out; zero them and reclaim their slots.
        if !surplus.is_empty() {
            tracing::warn!(
                old_pages = old_num_pages,
                new_pages = new_num_pages,
                "reorganization produced fewer pages than the chain held"
            );
        }
        for link in surplus {
            let ChainLink { frame, mut guard } = link;
            guard[..].fill(0);
            drop(guard);
            let id = frame.id();
            drop(frame);
            self.file_for(id).write_pages(id.page_offset, &super::ZERO_PAGE)?;
            self.bufmgr.invalidate(id);
            self.free.add(id);
            reclaimed.push(id);
        }

        tracing::debug!(
            base,
            old_pages = old_num_pages,
            new_pages = new_num_pages,
            reclaimed = reclaimed.len(),
            fill_pct = fill,
            "overflow chain reorganized"
        );
        Ok(())
    }
}
