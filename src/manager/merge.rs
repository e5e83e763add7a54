//! Streaming merge structures for reorganization.
//!
//! A [`PageChain`] is a main page plus its overflow, read into memory for a
//! rewrite. [`PageMergeIterator`] merges the sorted records of a chain's
//! pages (main entries win ties — the overflow is logically older), and
//! [`PagePlusRecordMerger`] interleaves that stream with the in-memory
//! records handed to a rewrite, preferring the in-memory record on equal
//! keys because it is the more recent write.

use std::iter::Peekable;

use smallvec::SmallVec;

use crate::bufmgr::PageBuf;
use crate::key::Key;
use crate::manager::circular::CircularPageBuffer;
use crate::segment_builder::Record;
use crate::storage::{Page, PageRecords};

/// A main page plus at most one overflow, owning their buffers for the
/// duration of a rewrite.
pub(crate) struct PageChain {
    main: PageBuf,
    overflow: Option<PageBuf>,
}

impl PageChain {
    pub fn single(main: PageBuf) -> PageChain {
        PageChain {
            main,
            overflow: None,
        }
    }

    pub fn with_overflow(main: PageBuf, overflow: PageBuf) -> PageChain {
        PageChain {
            main,
            overflow: Some(overflow),
        }
    }

    /// The largest key stored anywhere in the chain.
    pub fn largest_key(&self) -> Option<Key> {
        let main = Page::new(&self.main[..]).largest_key();
        let overflow = self
            .overflow
            .as_ref()
            .and_then(|buf| Page::new(&buf[..]).largest_key());
        main.into_iter().chain(overflow).max()
    }

    pub fn iter(&self) -> PageMergeIterator<'_> {
        let mut pages = SmallVec::<[Page<'_>; 2]>::new();
        pages.push(Page::new(&self.main[..]));
        if let Some(buf) = &self.overflow {
            pages.push(Page::new(&buf[..]));
        }
        PageMergeIterator::new(pages)
    }

    /// Returns the chain's buffers to the sliding-window pool.
    pub fn release(self, pool: &mut CircularPageBuffer) {
        pool.free(self.main);
        if let Some(buf) = self.overflow {
            pool.free(buf);
        }
    }
}

/// Merges the sorted record streams of several pages of one chain. Ties go
/// to the earliest page (the main page precedes its overflow links); the
/// later copies are superseded and dropped, so each key is yielded at most
/// once per chain.
pub(crate) struct PageMergeIterator<'a> {
    iters: SmallVec<[Peekable<PageRecords<'a>>; 2]>,
}

impl<'a> PageMergeIterator<'a> {
    pub fn new(pages: impl IntoIterator<Item = Page<'a>>) -> PageMergeIterator<'a> {
        PageMergeIterator {
            iters: pages.into_iter().map(|p| p.iter().peekable()).collect(),
        }
    }

    pub fn peek_key(&mut self) -> Option<Key> {
        self.iters
            .iter_mut()
            .filter_map(|it| it.peek().map(|(k, _)| *k))
            .min()
    }
}

impl<'a> Iterator for PageMergeIterator<'a> {
    type Item = (Key, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let mut winner: Option<(usize, Key)> = None;
        for (i, it) in self.iters.iter_mut().enumerate() {
            if let Some(&(key, _)) = it.peek() {
                if winner.map_or(true, |(_, best)| key < best) {
                    winner = Some((i, key));
                }
            }
        }
        let (idx, key) = winner?;
        // Later pages holding the winning key carry its superseded copies;
        // discard them so the key comes out exactly once.
        for (i, it) in self.iters.iter_mut().enumerate() {
            if i != idx && it.peek().map_or(false, |&(k, _)| k == key) {
                it.next();
            }
        }
        self.iters[idx].next()
    }
}

/// Cursor over the sorted in-memory records handed to a rewrite.
pub(crate) struct RecordCursor<'r> {
    records: &'r [Record],
    next: usize,
}

impl<'r> RecordCursor<'r> {
    pub fn new(records: &'r [Record]) -> RecordCursor<'r> {
        debug_assert!(records.windows(2).all(|w| w[0].0 < w[1].0));
        RecordCursor { records, next: 0 }
    }

    pub fn has_records(&self) -> bool {
        self.next < self.records.len()
    }

    pub fn peek(&self) -> Option<&'r Record> {
        self.records.get(self.next)
    }

    fn advance(&mut self) {
        self.next += 1;
    }

    /// Remaining records, consuming the cursor's view of them.
    pub fn drain(&mut self) -> impl Iterator<Item = Record> + 'r {
        let slice: &'r [Record] = self.records;
        let rest = &slice[self.next.min(slice.len())..];
        self.next = slice.len();
        rest.iter().cloned()
    }
}

/// Interleaves one chain's records with the in-memory record stream, in
/// ascending key order. On equal keys the in-memory record wins and the
/// stale on-disk record is dropped. The iterator ends when the CHAIN side
/// is exhausted; later records stay in the cursor for the next chain (or
/// the final drain).
pub(crate) struct PagePlusRecordMerger<'a, 'c, 'r> {
    pages: PageMergeIterator<'a>,
    records: &'c mut RecordCursor<'r>,
}

impl<'a, 'c, 'r> PagePlusRecordMerger<'a, 'c, 'r> {
    pub fn new(
        pages: PageMergeIterator<'a>,
        records: &'c mut RecordCursor<'r>,
    ) -> PagePlusRecordMerger<'a, 'c, 'r> {
        PagePlusRecordMerger { pages, records }
    }
}

impl Iterator for PagePlusRecordMerger<'_, '_, '_> {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        let page_key = self.pages.peek_key()?;
        match self.records.peek() {
            Some(&(rec_key, ref value)) if rec_key <= page_key => {
                let out = (rec_key, value.clone());
                self.records.advance();
                if rec_key == page_key {
                    // The on-disk record is stale; skip it.
                    self.pages.next();
                }
                Some(out)
            }
            _ => self.pages.next().map(|(k, v)| (k, v.to_vec())),
        }
    }
}
