//! Backlog trackers.
//!
//! A tracker turns a table's live run set plus its in-flight writes and
//! compactions into one scalar: how many byte·log₄(byte) units of merge work
//! stand between the current layout and the strategy's goal. Absolute values
//! carry no meaning — the admission controller only compares them to split
//! the I/O budget across tables.
//!
//! Each strategy family has its own math:
//!
//! - **Size-tiered** — for every run in an interesting bucket, the work left
//!   is `(Sᵢ − Cᵢ) × log₄(T / Sᵢ)`: a run must be rewritten once per
//!   quadrupling until it reaches the contributing total `T`.
//! - **Time-window** — one size-tiered tracker per window; in-flight work is
//!   routed to its window, partial writes to unmaterialized windows are
//!   charged through a throwaway tracker.
//! - **Leveled** — per-level byte counts; every byte above a level's target
//!   must be rewritten into the next level at that level's effective fan-out,
//!   with overflow propagating upward. L0 adds an inner size-tiered term.
//!
//! A tracker that detects impossible bookkeeping (negative sizes) reports an
//! invariant violation; the table then swaps in [`BacklogTracker::Disabled`],
//! whose sentinel tells the controller to fall back to a flat budget.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::sstable::{Generation, SortedRun, Timestamp};

use super::CompactionError;
use super::leveled::{LEVELED_FAN_OUT, MAX_LEVELS, SPACE_AMPLIFICATION_GOAL};
use super::options::{StcsOptions, TwcsOptions};
use super::stcs::{is_bucket_interesting, size_tiered_buckets};
use super::time_window::{to_resolution, window_lower_bound};

/// Sentinel returned by the disabled tracker; the controller switches to a
/// flat I/O budget when it sees it.
pub const DISABLE_BACKLOG: f64 = f64::INFINITY;

/// Base-4 logarithm, zero for degenerate inputs.
pub(crate) fn log4(x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    x.ln() / 4f64.ln()
}

// ------------------------------------------------------------------------------------------------
// In-flight work views
// ------------------------------------------------------------------------------------------------

/// A partially-written output run (e.g. an ongoing flush or compaction
/// output), not yet in the set.
#[derive(Debug, Clone)]
pub struct OngoingWrite {
    pub level: u32,
    pub max_timestamp: Timestamp,
    pub written: u64,
}

/// Progress of an in-flight compaction against one of its input runs.
#[derive(Debug, Clone)]
pub struct OngoingCompaction {
    pub input: Arc<SortedRun>,
    pub compacted: u64,
}

// ------------------------------------------------------------------------------------------------
// Size-tiered tracker
// ------------------------------------------------------------------------------------------------

/// Backlog for a size-tiered run set.
#[derive(Debug, Clone)]
pub struct SizeTieredBacklogTracker {
    opts: StcsOptions,
    min_threshold: usize,
    all: BTreeMap<Generation, Arc<SortedRun>>,
    total_bytes: u64,
    contributing: HashSet<Generation>,
    contributing_bytes: u64,
    contribution: f64,
}

impl SizeTieredBacklogTracker {
    pub fn new(opts: StcsOptions, min_threshold: usize) -> Self {
        SizeTieredBacklogTracker {
            opts,
            min_threshold,
            all: BTreeMap::new(),
            total_bytes: 0,
            contributing: HashSet::new(),
            contributing_bytes: 0,
            contribution: 0.0,
        }
    }

    /// Total bytes tracked, contributing or not.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Rebuilds the contribution set: only buckets whose fan-in reaches
    /// `min_threshold` count. Low-efficiency merges below that run only under
    /// light load and must not inflate the controller's budget.
    fn refresh_contribution(&mut self) {
        self.contributing.clear();
        self.contributing_bytes = 0;
        self.contribution = 0.0;
        if self.all.is_empty() {
            return;
        }
        let runs: Vec<Arc<SortedRun>> = self.all.values().cloned().collect();
        for bucket in size_tiered_buckets(&runs, &self.opts) {
            if !is_bucket_interesting(&bucket, self.min_threshold) {
                continue;
            }
            for sr in bucket {
                self.contributing_bytes += sr.data_size;
                self.contribution += sr.data_size as f64 * log4(sr.data_size as f64);
                self.contributing.insert(sr.generation);
            }
        }
    }

    pub fn replace_sstables(
        &mut self,
        old: &[Arc<SortedRun>],
        new: &[Arc<SortedRun>],
    ) -> Result<(), CompactionError> {
        for sr in old {
            if sr.data_size == 0 {
                continue;
            }
            if self.all.remove(&sr.generation).is_none() {
                return Err(CompactionError::InvariantViolation(format!(
                    "backlog tracker asked to remove unknown generation {}",
                    sr.generation
                )));
            }
            self.total_bytes = self.total_bytes.checked_sub(sr.data_size).ok_or_else(|| {
                CompactionError::InvariantViolation(
                    "backlog tracker total went negative".to_string(),
                )
            })?;
        }
        for sr in new {
            if sr.data_size == 0 {
                continue;
            }
            if self.all.insert(sr.generation, Arc::clone(sr)).is_some() {
                return Err(CompactionError::InvariantViolation(format!(
                    "backlog tracker asked to add duplicate generation {}",
                    sr.generation
                )));
            }
            self.total_bytes += sr.data_size;
        }
        self.refresh_contribution();
        Ok(())
    }

    pub fn backlog(&self, writes: &[OngoingWrite], compactions: &[OngoingCompaction]) -> f64 {
        // Progress against contributing inputs is work already done.
        let mut compacted_bytes = 0u64;
        let mut compacted_contribution = 0.0f64;
        for c in compactions {
            if !self.contributing.contains(&c.input.generation) {
                continue;
            }
            compacted_bytes += c.compacted;
            compacted_contribution += c.compacted as f64 * log4(c.input.data_size as f64);
        }

        // Partial writes behave like runs being born: they will need the
        // same log₄ laddering once they land.
        let mut write_bytes = 0u64;
        let mut write_contribution = 0.0f64;
        for w in writes {
            if w.written == 0 {
                continue;
            }
            write_bytes += w.written;
            write_contribution += w.written as f64 * log4(w.written as f64);
        }

        let total = self.contributing_bytes + write_bytes;
        if total <= compacted_bytes {
            return 0.0;
        }
        let effective = (total - compacted_bytes) as f64;
        let contribution = self.contribution - compacted_contribution + write_contribution;
        let b = effective * log4(total as f64) - contribution;
        b.max(0.0)
    }
}

// ------------------------------------------------------------------------------------------------
// Time-window tracker
// ------------------------------------------------------------------------------------------------

/// Backlog for a time-window run set: the sum of per-window size-tiered
/// backlogs.
#[derive(Debug, Clone)]
pub struct TimeWindowBacklogTracker {
    twcs_opts: TwcsOptions,
    stcs_opts: StcsOptions,
    min_threshold: usize,
    windows: BTreeMap<i64, SizeTieredBacklogTracker>,
}

impl TimeWindowBacklogTracker {
    pub fn new(twcs_opts: TwcsOptions, stcs_opts: StcsOptions, min_threshold: usize) -> Self {
        TimeWindowBacklogTracker {
            twcs_opts,
            stcs_opts,
            min_threshold,
            windows: BTreeMap::new(),
        }
    }

    fn lower_bound_of(&self, ts: Timestamp) -> i64 {
        window_lower_bound(
            self.twcs_opts.window_size_in_resolution(),
            to_resolution(ts, self.twcs_opts.timestamp_resolution),
        )
    }

    /// Number of live windows, for introspection and tests.
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    pub fn replace_sstables(
        &mut self,
        old: &[Arc<SortedRun>],
        new: &[Arc<SortedRun>],
    ) -> Result<(), CompactionError> {
        struct Replacement {
            old: Vec<Arc<SortedRun>>,
            new: Vec<Arc<SortedRun>>,
        }
        let mut per_window: BTreeMap<i64, Replacement> = BTreeMap::new();

        for sr in new {
            if sr.data_size == 0 {
                continue;
            }
            let bound = self.lower_bound_of(sr.max_timestamp);
            self.windows.entry(bound).or_insert_with(|| {
                SizeTieredBacklogTracker::new(self.stcs_opts.clone(), self.min_threshold)
            });
            per_window
                .entry(bound)
                .or_insert_with(|| Replacement {
                    old: Vec::new(),
                    new: Vec::new(),
                })
                .new
                .push(Arc::clone(sr));
        }
        for sr in old {
            if sr.data_size == 0 {
                continue;
            }
            let bound = self.lower_bound_of(sr.max_timestamp);
            if self.windows.contains_key(&bound) {
                per_window
                    .entry(bound)
                    .or_insert_with(|| Replacement {
                        old: Vec::new(),
                        new: Vec::new(),
                    })
                    .old
                    .push(Arc::clone(sr));
            }
        }

        for (bound, r) in per_window {
            let tracker = self.windows.get_mut(&bound).ok_or_else(|| {
                CompactionError::InvariantViolation(format!(
                    "time-window tracker lost window {bound}"
                ))
            })?;
            tracker.replace_sstables(&r.old, &r.new)?;
            if tracker.total_bytes() == 0 {
                self.windows.remove(&bound);
            }
        }
        Ok(())
    }

    pub fn backlog(&self, writes: &[OngoingWrite], compactions: &[OngoingCompaction]) -> f64 {
        let mut writes_per_window: BTreeMap<i64, Vec<OngoingWrite>> = BTreeMap::new();
        for w in writes {
            writes_per_window
                .entry(self.lower_bound_of(w.max_timestamp))
                .or_default()
                .push(w.clone());
        }
        let mut compactions_per_window: BTreeMap<i64, Vec<OngoingCompaction>> = BTreeMap::new();
        for c in compactions {
            compactions_per_window
                .entry(self.lower_bound_of(c.input.max_timestamp))
                .or_default()
                .push(c.clone());
        }

        let no_compactions: Vec<OngoingCompaction> = Vec::new();
        let mut b = 0.0f64;
        for (bound, tracker) in &self.windows {
            let ow = writes_per_window.remove(bound).unwrap_or_default();
            let oc = compactions_per_window.get(bound).unwrap_or(&no_compactions);
            b += tracker.backlog(&ow, oc);
        }

        // Writes whose window has no runs yet: charge them through a
        // throwaway tracker so a brand-new window is not free.
        for (_bound, ow) in writes_per_window {
            let throwaway =
                SizeTieredBacklogTracker::new(self.stcs_opts.clone(), self.min_threshold);
            b += throwaway.backlog(&ow, &no_compactions);
        }
        b
    }
}

// ------------------------------------------------------------------------------------------------
// Leveled tracker
// ------------------------------------------------------------------------------------------------

/// Backlog for a leveled run set.
#[derive(Debug, Clone)]
pub struct LeveledBacklogTracker {
    max_run_size: u64,
    l0: SizeTieredBacklogTracker,
    size_per_level: [u64; MAX_LEVELS],
}

impl LeveledBacklogTracker {
    pub fn new(max_run_size: u64, l0: SizeTieredBacklogTracker) -> Self {
        LeveledBacklogTracker {
            max_run_size,
            l0,
            size_per_level: [0; MAX_LEVELS],
        }
    }

    pub fn size_per_level(&self) -> &[u64; MAX_LEVELS] {
        &self.size_per_level
    }

    fn level_of(sr: &SortedRun) -> usize {
        (sr.level as usize).min(MAX_LEVELS - 1)
    }

    pub fn replace_sstables(
        &mut self,
        old: &[Arc<SortedRun>],
        new: &[Arc<SortedRun>],
    ) -> Result<(), CompactionError> {
        let mut l0_old: Vec<Arc<SortedRun>> = Vec::new();
        let mut l0_new: Vec<Arc<SortedRun>> = Vec::new();

        for sr in new {
            if sr.data_size == 0 {
                continue;
            }
            let level = Self::level_of(sr);
            self.size_per_level[level] += sr.data_size;
            if level == 0 {
                l0_new.push(Arc::clone(sr));
            }
        }
        for sr in old {
            if sr.data_size == 0 {
                continue;
            }
            let level = Self::level_of(sr);
            self.size_per_level[level] = self.size_per_level[level]
                .checked_sub(sr.data_size)
                .ok_or_else(|| {
                    CompactionError::InvariantViolation(format!(
                        "size of level {level} went negative"
                    ))
                })?;
            if level == 0 {
                l0_old.push(Arc::clone(sr));
            }
        }
        if !l0_old.is_empty() || !l0_new.is_empty() {
            self.l0.replace_sstables(&l0_old, &l0_new)?;
        }
        Ok(())
    }

    pub fn backlog(&self, writes: &[OngoingWrite], compactions: &[OngoingCompaction]) -> f64 {
        let mut effective: [i64; MAX_LEVELS] = [0; MAX_LEVELS];
        for (level, size) in self.size_per_level.iter().enumerate() {
            effective[level] = *size as i64;
        }

        let mut l0_writes: Vec<OngoingWrite> = Vec::new();
        let mut l0_compactions: Vec<OngoingCompaction> = Vec::new();
        for w in writes {
            let level = (w.level as usize).min(MAX_LEVELS - 1);
            effective[level] += w.written as i64;
            if level == 0 {
                l0_writes.push(w.clone());
            }
        }
        for c in compactions {
            let level = Self::level_of(&c.input);
            effective[level] -= c.compacted as i64;
            if level == 0 {
                l0_compactions.push(c.clone());
            }
        }

        let mut b = self.l0.backlog(&l0_writes, &l0_compactions);

        let max_populated = effective.iter().rposition(|&s| s > 0).unwrap_or(0);
        let total: i64 = effective.iter().map(|&s| s.max(0)).sum();
        let target_max_level_size = (total as f64 / SPACE_AMPLIFICATION_GOAL).ceil();
        let target = |level: usize| -> u64 {
            let r = (target_max_level_size
                / (LEVELED_FAN_OUT as f64).powi((max_populated - level) as i32))
            .ceil() as u64;
            r.max(self.max_run_size)
        };

        // Every byte above a level's target must be rewritten into the next
        // level; the overflow itself then counts toward that level's own
        // backlog, so it propagates.
        for level in 0..max_populated {
            let lsize = effective[level].max(0) as u64;
            let target_lsize = target(level);
            if lsize <= target_lsize {
                continue;
            }
            let overflow = lsize - target_lsize;

            // A next level still being born would make a jump to the full
            // fan-out abrupt; damp it by the runs estimated to be there.
            let next_size = effective[level + 1].max(0) as u64;
            let estimated_next_runs = next_size.div_ceil(self.max_run_size);
            let estimated_fan_out = LEVELED_FAN_OUT.min(estimated_next_runs);

            b += (overflow * estimated_fan_out) as f64;
            effective[level + 1] += overflow as i64;
        }
        b
    }
}

// ------------------------------------------------------------------------------------------------
// Tracker sum type
// ------------------------------------------------------------------------------------------------

/// A table's backlog tracker, matching its strategy family.
#[derive(Debug, Clone)]
pub enum BacklogTracker {
    /// Always zero; for strategies with no backlog notion.
    Null,

    /// Bookkeeping failed; reports [`DISABLE_BACKLOG`] until table reopen.
    Disabled,

    SizeTiered(SizeTieredBacklogTracker),
    TimeWindow(TimeWindowBacklogTracker),
    Leveled(LeveledBacklogTracker),
}

impl BacklogTracker {
    /// Current backlog given the in-flight work. Non-negative, except for
    /// the disabled sentinel.
    pub fn backlog(&self, writes: &[OngoingWrite], compactions: &[OngoingCompaction]) -> f64 {
        match self {
            BacklogTracker::Null => 0.0,
            BacklogTracker::Disabled => DISABLE_BACKLOG,
            BacklogTracker::SizeTiered(t) => t.backlog(writes, compactions),
            BacklogTracker::TimeWindow(t) => t.backlog(writes, compactions),
            BacklogTracker::Leveled(t) => t.backlog(writes, compactions),
        }
    }

    /// Applies a set mutation. Called together with the run set's own
    /// `replace` so the tracker never drifts from the set.
    pub fn replace_sstables(
        &mut self,
        old: &[Arc<SortedRun>],
        new: &[Arc<SortedRun>],
    ) -> Result<(), CompactionError> {
        match self {
            BacklogTracker::Null | BacklogTracker::Disabled => Ok(()),
            BacklogTracker::SizeTiered(t) => t.replace_sstables(old, new),
            BacklogTracker::TimeWindow(t) => t.replace_sstables(old, new),
            BacklogTracker::Leveled(t) => t.replace_sstables(old, new),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, BacklogTracker::Disabled)
    }
}
