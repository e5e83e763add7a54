//! Chain flattening and segment rewriting.
//!
//! Both operations replace on-disk segments wholesale: they merge the old
//! pages with any in-memory records (the in-memory record wins a key tie),
//! write fresh segments stamped with a new sequence number, swap the index
//! in one step and only then invalidate the old slots by zeroing their
//! first pages. A crash at any point leaves either the old segments intact
//! (new ones are orphans recovery discards by sequence) or the new ones
//! adopted (old ones fail validation or lose the sequence comparison).
//!
//! `rewrite_segments` streams: a sliding window of at most
//! `16 * 4` pages is read in segment order, fed through a fresh
//! [`SegmentBuilder`], and written back out as soon as segments close —
//! bounded memory for arbitrarily many neighbors.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::key::Key;
use crate::manager::circular::CircularPageBuffer;
use crate::manager::flush::ChainFix;
use crate::manager::merge::{PageChain, PageMergeIterator, PagePlusRecordMerger, RecordCursor};
use crate::manager::Manager;
use crate::segment_builder::{Record, Segment, SegmentBuilder};
use crate::storage::{Page, SegmentId, SegmentInfo, SegmentWrap, MAX_SEGMENT_PAGES, PAGE_SIZE};

use super::ZERO_PAGE;

/// Sliding-window state threaded through one `rewrite_segments` call.
struct RewriteRun {
    pool: CircularPageBuffer,
    builder: SegmentBuilder,
    /// Chains already offered to the builder but whose records may not all
    /// be written out yet. Freed front-first as the builder advances.
    processed: VecDeque<PageChain>,
    rewritten: Vec<(Key, SegmentInfo)>,
    sequence: u32,
}

impl Manager {
    /// Rewrites the one-page segment at `base` (and its overflow chain)
    /// into a fresh run of one-page segments, merging in `addtl` records.
    pub fn flatten_chain(&self, base: Key, addtl: &[Record]) -> Result<()> {
        let _worker = self.reorg_lock.lock();
        debug_assert!(addtl.windows(2).all(|w| w[0].0 < w[1].0));

        loop {
            let Some((found_base, info)) = self.owning_segment(base) else {
                eyre::bail!("flatten_chain: no segment owns key {base}");
            };
            ensure!(
                found_base == base,
                "flatten_chain: {base} is not a segment base (owner is {found_base})"
            );
            ensure!(
                info.page_count() == 1,
                "flatten_chain applies to one-page segments; {base} spans {} pages",
                info.page_count()
            );

            let model_pages = self.num_model_pages.load(Ordering::Acquire);
            let chain = match self.fix_overflow_chain(base, &info, model_pages, info.id)? {
                ChainFix::Chain(chain) => chain,
                ChainFix::Retry => continue,
            };

            let upper = self.next_base_after(base).unwrap_or(Key::MAX);

            // Merge chain records with the in-memory ones; on a key tie the
            // in-memory record is newer and wins.
            let merged: Vec<Record> = {
                let mut cursor = RecordCursor::new(addtl);
                let pages =
                    PageMergeIterator::new(chain.links.iter().map(|l| Page::new(&l.guard[..])));
                let mut records: Vec<Record> =
                    PagePlusRecordMerger::new(pages, &mut cursor).collect();
                records.extend(cursor.drain());
                records
            };

            let sequence = self.allocate_sequence();
            let old_ids = chain.ids();
            self.log.rewrite_started(sequence, &old_ids)?;

            // In-memory records may extend the covered range downward, but
            // never past the next segment's base.
            debug_assert!(merged.last().map_or(true, |r| r.0 < upper || upper == Key::MAX));
            let lower = merged.first().map_or(base, |r| r.0.min(base));
            let new_entries = self.load_into_new_pages(sequence, lower, upper, &merged)?;

            {
                let mut index = self.index.write();
                index.remove(&base);
                let delta = new_entries.len() as i64 - 1;
                for (new_base, new_info) in &new_entries {
                    index.insert(*new_base, new_info.clone());
                }
                self.bump_model_pages(delta);
            }

            // Readers stalled on the head latch re-check the index once we
            // release and restart against the new segments.
            chain.release(self, false)?;

            self.zero_and_reclaim(&old_ids)?;
            self.log.rewrite_finished(sequence)?;

            tracing::debug!(
                base,
                new_segments = new_entries.len(),
                "flattened overflow chain"
            );
            return Ok(());
        }
    }

    /// Rewrites the segment at `base` — extended over contiguous
    /// overflowing neighbors when configured — into fresh segments,
    /// merging in `addtl` records.
    pub fn rewrite_segments(&self, base: Key, addtl: &[Record]) -> Result<()> {
        let _worker = self.reorg_lock.lock();
        debug_assert!(addtl.windows(2).all(|w| w[0].0 < w[1].0));

        let victims = self.select_rewrite_victims(base)?;
        let sequence = self.allocate_sequence();
        let victim_ids: Vec<SegmentId> = victims.iter().map(|(_, info)| info.id).collect();
        self.log.rewrite_started(sequence, &victim_ids)?;

        let mut run = RewriteRun {
            pool: CircularPageBuffer::new(MAX_SEGMENT_PAGES * 4),
            builder: SegmentBuilder::new(
                self.options.records_per_page_goal,
                self.options.records_per_page_delta,
            ),
            processed: VecDeque::new(),
            rewritten: Vec::new(),
            sequence,
        };
        let mut cursor = RecordCursor::new(addtl);
        let mut overflows_to_clear: Vec<SegmentId> = Vec::new();
        let mut to_process: VecDeque<PageChain> = VecDeque::new();

        for (_, info) in &victims {
            let segment_pages = info.page_count();
            if segment_pages > run.pool.num_free_pages() {
                let closed = run.builder.finish();
                self.write_out(&mut run, closed)?;
            }

            // Read the whole segment, then find out how many overflows it
            // drags in before committing window space to them.
            let mut scratch = vec![0u8; segment_pages * PAGE_SIZE];
            self.file_for(info.id)
                .read_pages(info.id.page_offset, &mut scratch)?;
            let overflow_refs = SegmentWrap::new(&mut scratch, segment_pages).overflow_ids();
            if segment_pages + overflow_refs.len() > run.pool.num_free_pages() {
                let closed = run.builder.finish();
                self.write_out(&mut run, closed)?;
            }
            debug_assert!(
                segment_pages + overflow_refs.len() <= run.pool.num_free_pages(),
                "sliding window cannot hold one segment with its overflows"
            );

            let mut overflow_iter = overflow_refs.iter().peekable();
            for page_idx in 0..segment_pages {
                let mut main = run.pool.allocate();
                main.copy_from_slice(&scratch[page_idx * PAGE_SIZE..(page_idx + 1) * PAGE_SIZE]);

                let overflow = match overflow_iter.peek() {
                    Some((idx, id)) if *idx == page_idx => {
                        overflow_iter.next();
                        overflows_to_clear.push(*id);
                        let mut buf = run.pool.allocate();
                        self.file_for(*id).read_pages(id.page_offset, &mut buf[..])?;
                        Some(buf)
                    }
                    _ => None,
                };
                to_process.push_back(match overflow {
                    Some(buf) => PageChain::with_overflow(main, buf),
                    None => PageChain::single(main),
                });
            }

            while let Some(chain) = to_process.pop_front() {
                {
                    let pages = chain.iter();
                    let merger = PagePlusRecordMerger::new(pages, &mut cursor);
                    for record in merger {
                        let closed = run.builder.offer(record);
                        if !closed.is_empty() {
                            self.write_out(&mut run, closed)?;
                        }
                    }
                }
                run.processed.push_back(chain);
            }
        }

        // Leftover in-memory records beyond the last chain.
        if cursor.has_records() {
            let leftovers: Vec<Record> = cursor.drain().collect();
            for record in leftovers {
                let closed = run.builder.offer(record);
                if !closed.is_empty() {
                    self.write_out(&mut run, closed)?;
                }
            }
        }
        let closed = run.builder.finish();
        if !closed.is_empty() {
            self.write_out(&mut run, closed)?;
        }

        // Swap the index in one step: old entries out, new entries in.
        {
            let mut index = self.index.write();
            let mut delta = 0i64;
            for (victim_base, info) in &victims {
                let removed = index.remove(victim_base);
                debug_assert!(removed.map_or(false, |r| r.id == info.id));
                delta -= info.page_count() as i64;
            }
            for (new_base, new_info) in &run.rewritten {
                delta += new_info.page_count() as i64;
                index.insert(*new_base, new_info.clone());
            }
            self.bump_model_pages(delta);
        }

        let mut reclaim = victim_ids;
        reclaim.extend(overflows_to_clear);
        self.zero_and_reclaim(&reclaim)?;
        self.log.rewrite_finished(sequence)?;

        tracing::debug!(
            base,
            victims = victims.len(),
            new_segments = run.rewritten.len(),
            "segment rewrite complete"
        );
        Ok(())
    }

    /// The segment at `base` plus, when configured, the maximal run of
    /// contiguous neighbors with overflows on both sides, ascending.
    fn select_rewrite_victims(&self, base: Key) -> Result<Vec<(Key, SegmentInfo)>> {
        let index = self.index.read();
        let info = index
            .get(&base)
            .ok_or_else(|| eyre::eyre!("rewrite_segments: no segment based at {base}"))?;
        let mut victims: SmallVec<[(Key, SegmentInfo); 8]> = SmallVec::new();

        if self.options.consider_neighbors_during_rewrite {
            for (b, i) in index.range(..base).rev() {
                if !i.has_overflow {
                    break;
                }
                victims.push((*b, i.clone()));
            }
            victims.reverse();
        }
        victims.push((base, info.clone()));
        if self.options.consider_neighbors_during_rewrite {
            use std::ops::Bound;
            for (b, i) in index.range((Bound::Excluded(base), Bound::Unbounded)) {
                if !i.has_overflow {
                    break;
                }
                victims.push((*b, i.clone()));
            }
        }
        Ok(victims.into_vec())
    }

    /// Writes closed segments out and releases window pages the builder no
    /// longer needs.
    fn write_out(&self, run: &mut RewriteRun, segments: Vec<Segment>) -> Result<()> {
        for (i, segment) in segments.iter().enumerate() {
            // The upper bound feeds fence construction (and so prefix
            // compression) of the segment's last page.
            let upper = if i + 1 < segments.len() {
                segments[i + 1].base_key
            } else if let Some(next_base) = run.builder.current_base_key() {
                next_base
            } else {
                // Builder drained: the bound comes from the first index
                // entry past the last written key. Old entries are still
                // in the index at this point, which is exactly what makes
                // this lookup meaningful mid-rewrite.
                let last_key = segment.records.last().map_or(segment.base_key, |r| r.0);
                self.next_base_after(last_key).unwrap_or(Key::MAX)
            };
            run.rewritten
                .push(self.load_into_new_segment(run.sequence, segment, upper)?);
        }

        // Window pages whose records are all written out can be freed.
        // With the builder empty every processed chain is releasable.
        let barrier = run.builder.current_base_key();
        loop {
            let releasable = match run.processed.front() {
                None => break,
                Some(front) => match (front.largest_key(), barrier) {
                    // Keys at or past the builder's current base have not
                    // been written out yet; the chain must stay resident.
                    (Some(largest), Some(next_base)) => largest < next_base,
                    _ => true,
                },
            };
            if !releasable {
                break;
            }
            if let Some(chain) = run.processed.pop_front() {
                chain.release(&mut run.pool);
            }
        }
        Ok(())
    }

    /// Zeroes the first page of every listed slot (invalidate), drops any
    /// cached frames, and — once the zeroing writes have completed — hands
    /// the slots to the free list for reuse.
    pub(crate) fn zero_and_reclaim(&self, ids: &[SegmentId]) -> Result<()> {
        if let Some(pool) = &self.pool {
            let tasks: Vec<_> = ids
                .iter()
                .map(|id| {
                    let files = std::sync::Arc::clone(&self.files);
                    let id = *id;
                    pool.submit(move || {
                        files[id.file_index as usize].write_pages(id.page_offset, &ZERO_PAGE)
                    })
                })
                .collect();
            for task in tasks {
                task.wait()??;
            }
        } else {
            for id in ids {
                self.file_for(*id).write_pages(id.page_offset, &ZERO_PAGE)?;
            }
        }

        for id in ids {
            for page_idx in 0..id.page_count() {
                self.bufmgr.invalidate(id.nth_page(page_idx));
            }
            self.free.add(*id);
        }
        Ok(())
    }

    pub(crate) fn bump_model_pages(&self, delta: i64) {
        if delta >= 0 {
            self.num_model_pages
                .fetch_add(delta as u64, Ordering::AcqRel);
        } else {
            self.num_model_pages
                .fetch_sub((-delta) as u64, Ordering::AcqRel);
        }
    }
}
