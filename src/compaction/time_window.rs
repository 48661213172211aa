//! Time-Window Compaction Strategy (TWCS).
//!
//! Every run belongs to the window of its newest write timestamp. The
//! current window behaves size-tiered (it is still receiving flushes); a
//! sealed window is collapsed into a single run. Merges never cross window
//! boundaries, and the writer is told to cut outputs at window edges so
//! reshaped runs stop straddling.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::sstable::{SortedRun, Timestamp};
use crate::table::{TableSchema, TableState};

use super::backlog::{BacklogTracker, TimeWindowBacklogTracker};
use super::options::{CommonOptions, StcsOptions, TimestampResolution, TwcsOptions};
use super::stcs::{most_interesting_bucket, size_tiered_buckets};
use super::{
    CompactionDescriptor, DEFAULT_MAX_OUTPUT_SIZE, OutputShaping, ReshapeMode, StrategyControl,
    WriterMeta, tombstone_fallback,
};

/// Converts a microsecond timestamp into ticks of the configured resolution.
pub(crate) fn to_resolution(ts: Timestamp, resolution: TimestampResolution) -> i64 {
    match resolution {
        TimestampResolution::Seconds => ts.div_euclid(1_000_000),
        TimestampResolution::Milliseconds => ts.div_euclid(1_000),
        TimestampResolution::Microseconds => ts,
    }
}

/// Lower bound of the window containing `ts`, in resolution ticks.
pub(crate) fn window_lower_bound(window_size: i64, ts: i64) -> i64 {
    ts.div_euclid(window_size).saturating_mul(window_size)
}

// ------------------------------------------------------------------------------------------------
// Strategy
// ------------------------------------------------------------------------------------------------

/// The time-window family.
#[derive(Debug, Clone)]
pub struct TimeWindowStrategy {
    common: CommonOptions,
    stcs_opts: StcsOptions,
    opts: TwcsOptions,
}

impl TimeWindowStrategy {
    pub fn new(common: CommonOptions, stcs_opts: StcsOptions, opts: TwcsOptions) -> Self {
        TimeWindowStrategy {
            common,
            stcs_opts,
            opts,
        }
    }

    /// Window lower bound for a microsecond timestamp.
    pub(crate) fn window_of(&self, ts: Timestamp) -> i64 {
        window_lower_bound(
            self.opts.window_size_in_resolution(),
            to_resolution(ts, self.opts.timestamp_resolution),
        )
    }

    fn group_by_window(&self, runs: &[Arc<SortedRun>]) -> BTreeMap<i64, Vec<Arc<SortedRun>>> {
        let mut windows: BTreeMap<i64, Vec<Arc<SortedRun>>> = BTreeMap::new();
        for sr in runs {
            if sr.data_size == 0 {
                continue;
            }
            windows
                .entry(self.window_of(sr.max_timestamp))
                .or_default()
                .push(Arc::clone(sr));
        }
        windows
    }

    pub(crate) fn select_compaction(
        &self,
        table: &TableState,
        control: &StrategyControl,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        let windows = self.group_by_window(&candidates);
        let current = self.window_of(control.now);

        // The hot window keeps receiving flushes; treat it size-tiered.
        if let Some(runs) = windows.get(&current)
            && let Some(bucket) = most_interesting_bucket(
                size_tiered_buckets(runs, &self.stcs_opts),
                self.common.min_threshold,
                self.common.max_threshold,
            )
        {
            debug!(
                window = current,
                selected = bucket.len(),
                "time-window: size-tiered merge in current window"
            );
            return CompactionDescriptor::new(bucket, 0, DEFAULT_MAX_OUTPUT_SIZE);
        }

        // Sealed windows collapse to one run apiece, oldest window first.
        for (bound, runs) in windows.range(..current) {
            if runs.len() >= 2 {
                debug!(
                    window = bound,
                    inputs = runs.len(),
                    "time-window: collapsing old window"
                );
                return CompactionDescriptor::new(runs.clone(), 0, DEFAULT_MAX_OUTPUT_SIZE);
            }
        }

        tombstone_fallback(&candidates, &self.common, table.gc_state(), control.now)
    }

    pub(crate) fn major_job(
        &self,
        _table: &TableState,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        let mut desc = CompactionDescriptor::new(candidates, 0, DEFAULT_MAX_OUTPUT_SIZE);
        desc.shaping = OutputShaping::SplitByWindow {
            window_size: self.opts.window_size_in_resolution(),
            resolution: self.opts.timestamp_resolution,
        };
        desc
    }

    /// Window-aware cleanup: one job per window, chunked by `max_threshold`.
    pub(crate) fn cleanup_jobs(
        &self,
        _table: &TableState,
        candidates: Vec<Arc<SortedRun>>,
    ) -> Vec<CompactionDescriptor> {
        let mut jobs = Vec::new();
        for (_bound, runs) in self.group_by_window(&candidates) {
            for chunk in runs.chunks(self.common.max_threshold) {
                let mut desc =
                    CompactionDescriptor::new(chunk.to_vec(), 0, DEFAULT_MAX_OUTPUT_SIZE);
                desc.cleanup = true;
                jobs.push(desc);
            }
        }
        jobs
    }

    /// A run whose writes straddle more than one window breaks the layout;
    /// rewrite it with window-aligned output cutting.
    pub(crate) fn reshape_job(
        &self,
        input: Vec<Arc<SortedRun>>,
        _schema: &TableSchema,
        _mode: ReshapeMode,
    ) -> CompactionDescriptor {
        let mut offenders: BTreeMap<i64, Vec<Arc<SortedRun>>> = BTreeMap::new();
        for sr in &input {
            if sr.data_size == 0 {
                continue;
            }
            if self.window_of(sr.min_timestamp) != self.window_of(sr.max_timestamp) {
                offenders
                    .entry(self.window_of(sr.max_timestamp))
                    .or_default()
                    .push(Arc::clone(sr));
            }
        }
        match offenders.into_iter().next() {
            Some((_bound, mut runs)) => {
                runs.truncate(self.common.max_threshold);
                let mut desc = CompactionDescriptor::new(runs, 0, DEFAULT_MAX_OUTPUT_SIZE);
                desc.shaping = OutputShaping::SplitByWindow {
                    window_size: self.opts.window_size_in_resolution(),
                    resolution: self.opts.timestamp_resolution,
                };
                desc
            }
            None => CompactionDescriptor::none(),
        }
    }

    pub(crate) fn pending_compactions(&self, table: &TableState) -> i64 {
        let runs = table.set().main_snapshot();
        // One collapse per window holding more than one run; the hot window
        // is an approximation until it seals.
        self.group_by_window(&runs)
            .values()
            .filter(|runs| runs.len() >= 2)
            .count() as i64
    }

    pub(crate) fn make_backlog_tracker(&self, schema: &TableSchema) -> BacklogTracker {
        BacklogTracker::TimeWindow(TimeWindowBacklogTracker::new(
            self.opts.clone(),
            self.stcs_opts.clone(),
            schema.min_compaction_threshold,
        ))
    }

    /// Number of windows a write stream spans.
    fn windows_spanned(&self, meta: &WriterMeta) -> i64 {
        let size = self.opts.window_size_in_resolution();
        let lo = self.window_of(meta.min_timestamp);
        let hi = self.window_of(meta.max_timestamp);
        (hi - lo) / size + 1
    }

    /// Outputs are split per window, so each one holds a fraction of the
    /// incoming partitions.
    pub(crate) fn adjust_partition_estimate(&self, meta: &WriterMeta, estimate: u64) -> u64 {
        if estimate == 0 {
            return 0;
        }
        let windows = self.windows_spanned(meta).max(1) as u64;
        (estimate / windows).max(1)
    }

    pub(crate) fn output_shaping(&self, meta: &WriterMeta) -> OutputShaping {
        if self.windows_spanned(meta) > 1 {
            OutputShaping::SplitByWindow {
                window_size: self.opts.window_size_in_resolution(),
                resolution: self.opts.timestamp_resolution,
            }
        } else {
            OutputShaping::None
        }
    }
}
