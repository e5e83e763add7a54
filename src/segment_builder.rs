//! # Segment Builder
//!
//! Consumes records in ascending key order and cuts them into variable-size
//! segments of 1, 2, 4, 8 or 16 pages, each with a linear model mapping
//! `key - base_key` to a page index.
//!
//! The fit is streamed: every offered record extends a slope corridor over
//! the points `(key - base, position / goal)` with vertical tolerance
//! `delta / goal`. While the corridor stays non-empty the candidate keeps
//! growing, up to 16 pages' worth of records. When it breaks (or the
//! candidate is full), the builder closes the candidate at the largest
//! permitted page count its record count fills and re-seeds the fit with
//! the leftovers, so a single `offer` can emit several segments. The
//! fallback is always available: any run of records can be emitted as
//! one-page segments, which carry no model.
//!
//! Page boundaries are implicit in the model. `compute_page_lower_boundaries`
//! materializes them by inverting the line for a first guess and then
//! binary-searching the integer key domain with the FORWARD model as the
//! comparator — the inverse alone is not trustworthy under float precision
//! drift, and the search is what makes the boundaries exact.

use std::collections::VecDeque;

use eyre::{ensure, Result};

use crate::key::Key;
use crate::model::{page_for_key, Line64, SlopeCorridor};
use crate::storage::{MAX_SEGMENT_PAGES, SEGMENT_PAGE_COUNTS};

/// A record bound for disk: key plus opaque value.
pub type Record = (Key, Vec<u8>);

/// A segment cut by the builder, not yet written out.
#[derive(Debug, Clone)]
pub struct Segment {
    pub base_key: Key,
    pub page_count: usize,
    pub records: Vec<Record>,
    /// Absent for single-page segments.
    pub model: Option<Line64>,
}

#[derive(Debug)]
pub struct SegmentBuilder {
    goal: usize,
    tolerance: f64,
    pending: Vec<Record>,
    corridor: SlopeCorridor,
    base: Option<Key>,
}

impl SegmentBuilder {
    pub fn new(records_per_page_goal: usize, records_per_page_delta: f64) -> SegmentBuilder {
        assert!(records_per_page_goal >= 1);
        let tolerance = records_per_page_delta / records_per_page_goal as f64;
        SegmentBuilder {
            goal: records_per_page_goal,
            tolerance,
            pending: Vec::new(),
            corridor: SlopeCorridor::new(tolerance),
            base: None,
        }
    }

    /// Base key of the candidate currently being built, if any.
    pub fn current_base_key(&self) -> Option<Key> {
        self.base
    }

    /// Offers the next record (keys must be offered in strictly ascending
    /// order) and returns any segments this closed.
    pub fn offer(&mut self, record: Record) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut carry: VecDeque<Record> = VecDeque::new();
        carry.push_back(record);

        while let Some(rec) = carry.pop_front() {
            if self.try_accept(&rec) {
                self.pending.push(rec);
                continue;
            }
            // The candidate cannot grow further: close it and re-offer the
            // leftovers (they re-anchor the fit at a new base key).
            let leftovers = self.close_candidate(&mut out);
            carry.push_front(rec);
            for rec in leftovers.into_iter().rev() {
                carry.push_front(rec);
            }
        }
        out
    }

    /// Emits everything still buffered as final segments.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        while !self.pending.is_empty() {
            let leftovers = self.close_candidate(&mut out);
            // Leftovers re-anchor at a new base, which can break the fit
            // again, so they go back through the regular offer path.
            for rec in leftovers {
                out.extend(self.offer(rec));
            }
        }
        self.reset();
        out
    }

    /// Convenience wrapper for bulk loads.
    pub fn build_from_dataset(&mut self, records: &[(Key, Vec<u8>)]) -> Result<Vec<Segment>> {
        ensure!(
            records.windows(2).all(|w| w[0].0 < w[1].0),
            "bulk-load records must be sorted by strictly ascending key"
        );
        let mut segments = Vec::new();
        for (key, value) in records {
            segments.extend(self.offer((*key, value.clone())));
        }
        segments.extend(self.finish());
        Ok(segments)
    }

    fn try_accept(&mut self, record: &Record) -> bool {
        match self.base {
            None => {
                debug_assert!(self.pending.is_empty());
                self.base = Some(record.0);
                self.corridor = SlopeCorridor::new(self.tolerance);
                let anchored = self.corridor.try_extend(0.0, 0.0);
                debug_assert!(anchored);
                true
            }
            Some(base) => {
                debug_assert!(self.pending.last().map_or(true, |r| record.0 > r.0));
                if self.pending.len() >= MAX_SEGMENT_PAGES * self.goal {
                    return false;
                }
                let x = (record.0 - base) as f64;
                let y = self.pending.len() as f64 / self.goal as f64;
                self.corridor.try_extend(x, y)
            }
        }
    }

    /// Closes the current candidate: picks the largest permitted page count
    /// the buffered records fill, pushes that segment, and returns the
    /// records that did not make the cut. Resets the fit state.
    fn close_candidate(&mut self, out: &mut Vec<Segment>) -> Vec<Record> {
        debug_assert!(!self.pending.is_empty());
        let available = self.pending.len();

        let page_count = SEGMENT_PAGE_COUNTS
            .iter()
            .rev()
            .copied()
            .find(|&n| n * self.goal <= available)
            .unwrap_or(1);

        let (cutoff, model) = if page_count == 1 {
            (available.min(self.goal), None)
        } else {
            let cutoff = page_count * self.goal;
            match self.fitted_model(cutoff, page_count) {
                Some(model) => (cutoff, Some(model)),
                // No usable line for this cut; fall back to one page.
                None => (available.min(self.goal), None),
            }
        };

        let leftovers = self.pending.split_off(cutoff);
        let records = std::mem::take(&mut self.pending);
        let base_key = records[0].0;
        out.push(Segment {
            base_key,
            page_count: if model.is_some() { page_count } else { 1 },
            records,
            model,
        });
        self.reset();
        leftovers
    }

    /// The corridor line for the first `cutoff` records, nudged so that no
    /// accepted record maps outside `[0, page_count)`. The corridor bounds
    /// hold for any prefix of the accepted points, so only the upper end
    /// needs checking.
    fn fitted_model(&self, cutoff: usize, page_count: usize) -> Option<Line64> {
        let base = self.base?;
        let mut line = self.corridor.line();
        let (slope_lo, _) = self.corridor.bounds();
        let last_x = (self.pending[cutoff - 1].0 - base) as f64;
        if last_x > 0.0 {
            let cap = (page_count as f64 - 1e-9) / last_x;
            if cap < line.slope {
                if cap < slope_lo {
                    return None;
                }
                line.slope = cap;
            }
        }
        // Every record must land on a real page under the final line.
        let ok = self.pending[..cutoff].iter().all(|rec| {
            let floor = line.eval((rec.0 - base) as f64).floor();
            floor >= 0.0 && (floor as usize) < page_count
        });
        ok.then_some(line)
    }

    fn reset(&mut self) {
        self.base = None;
        self.corridor = SlopeCorridor::new(self.tolerance);
    }
}

/// The smallest key assigned to each page of a multi-page segment.
///
/// Returned keys are strictly increasing; entry `i` is the smallest key for
/// which [`page_for_key`] answers `i`.
pub fn compute_page_lower_boundaries(segment: &Segment) -> Result<Vec<Key>> {
    let mut boundaries = vec![segment.base_key];
    if segment.page_count == 1 {
        return Ok(boundaries);
    }
    let model = segment
        .model
        .ok_or_else(|| eyre::eyre!("multi-page segment is missing its model"))?;
    ensure!(model.slope > 0.0, "segment model must have positive slope");
    let inverse = model.invert();
    boundaries.reserve(segment.page_count);

    let base = segment.base_key;
    let page_count = segment.page_count;
    let approx = |page_idx: usize| -> Key {
        let x = inverse.eval(page_idx as f64).max(0.0);
        base.saturating_add(x as Key)
    };

    for page_idx in 1..page_count {
        // The inverted model gives a candidate boundary, which establishes
        // the search bounds; the exact answer comes from the binary search
        // below, driven by the forward model.
        let candidate = approx(page_idx);
        let page_for_candidate = page_for_key(base, &model, page_count, candidate);
        let (lo, hi) = if page_for_candidate >= page_idx {
            (approx(page_idx - 1), candidate)
        } else {
            (candidate, approx(page_idx + 1))
        };
        // Widen slightly: the bounds themselves came from floats.
        let mut lo = lo.saturating_sub(2).max(base);
        let mut hi = hi.saturating_add(2);
        ensure!(lo < hi, "degenerate boundary search for page {page_idx}");

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if page_for_key(base, &model, page_count, mid) < page_idx {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        ensure!(
            page_for_key(base, &model, page_count, lo) == page_idx
                && page_for_key(base, &model, page_count, lo - 1) < page_idx,
            "boundary search failed to converge for page {page_idx}"
        );
        boundaries.push(lo);
    }

    debug_assert_eq!(boundaries.len(), page_count);
    debug_assert!(boundaries.windows(2).all(|w| w[0] < w[1]));
    Ok(boundaries)
}
