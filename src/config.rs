//! Engine configuration.

use eyre::{ensure, Result};

/// Tuning knobs for the storage engine.
///
/// The defaults target the 4 KiB page format with 8-byte keys and small
/// values. `validate()` is called by every constructor that accepts an
/// `Options`, mirroring the rule that configuration errors surface as
/// `InvalidArgument` before any file is touched.
#[derive(Debug, Clone)]
pub struct Options {
    /// Target number of records per page when building segments.
    pub records_per_page_goal: usize,

    /// Allowed deviation (in records) from the goal line when fitting a
    /// segment model.
    pub records_per_page_delta: f64,

    /// Whether a rewrite extends over contiguous overflowing neighbors of
    /// the requested segment.
    pub consider_neighbors_during_rewrite: bool,

    /// Maximum number of pages a chain reorganization may fan out into.
    pub max_reorg_fanout: usize,

    /// Chain length at which the flush path stops growing an overflow chain
    /// and rewrites it instead (flatten for one-page segments, a segment
    /// rewrite otherwise). Multi-page segments never chain more than one
    /// overflow per page regardless of this value.
    pub chain_rewrite_threshold: usize,

    /// Target page fill percentage handed to chain reorganizations.
    pub page_fill_pct: u32,

    /// Expected encoded key size, used when estimating reorganization
    /// fanout.
    pub key_size_hint: usize,

    /// Expected full record size (key plus value), used when estimating
    /// reorganization fanout.
    pub record_size_hint: usize,

    /// Number of background worker threads. Zero runs all background work
    /// synchronously on the calling thread.
    pub background_threads: usize,

    /// Approximate memory usage at which callers should drain the memtable.
    pub memtable_flush_threshold: usize,

    /// Write `debug/segment_summary.csv` after a bulk load.
    pub write_debug_info: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            records_per_page_goal: 44,
            records_per_page_delta: 5.0,
            consider_neighbors_during_rewrite: true,
            max_reorg_fanout: 50,
            chain_rewrite_threshold: 4,
            page_fill_pct: 50,
            key_size_hint: crate::key::KEY_SIZE,
            record_size_hint: 16,
            background_threads: 0,
            memtable_flush_threshold: 64 * 1024 * 1024,
            write_debug_info: false,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.records_per_page_goal >= 1,
            "records_per_page_goal must be at least 1"
        );
        ensure!(
            self.records_per_page_delta >= 0.0,
            "records_per_page_delta cannot be negative"
        );
        ensure!(
            (1..=100).contains(&self.page_fill_pct),
            "page_fill_pct must be a value between 1 and 100 inclusive"
        );
        ensure!(
            self.max_reorg_fanout >= 2,
            "max_reorg_fanout must be at least 2"
        );
        ensure!(
            self.chain_rewrite_threshold >= 2,
            "chain_rewrite_threshold must be at least 2"
        );
        ensure!(
            self.key_size_hint == crate::key::KEY_SIZE,
            "only {}-byte keys are supported",
            crate::key::KEY_SIZE
        );
        ensure!(
            self.record_size_hint > self.key_size_hint,
            "record_size_hint must exceed key_size_hint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_goal() {
        let opts = Options {
            records_per_page_goal: 0,
            ..Options::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_fill_pct() {
        for pct in [0, 101] {
            let opts = Options {
                page_fill_pct: pct,
                ..Options::default()
            };
            assert!(opts.validate().is_err());
        }
    }

    #[test]
    fn rejects_tiny_fanout() {
        let opts = Options {
            max_reorg_fanout: 1,
            ..Options::default()
        };
        assert!(opts.validate().is_err());
    }
}
