//! # Compaction Strategies
//!
//! The decision engine of the storage engine: given a table's live sorted
//! runs, decide **which runs to merge, into which level, under which size
//! bound**. Four strategy families share one uniform operation set:
//!
//! - **Null** — never compacts; placeholder for system tables.
//! - **Size-Tiered (STCS)** — groups runs into similarity buckets and merges
//!   the cheapest interesting bucket.
//! - **Leveled (LCS)** — maintains an exponential level hierarchy and
//!   promotes overflowing levels, with STCS behavior inside L0.
//! - **Time-Window (TWCS)** — groups runs by the window of their newest
//!   write; STCS inside the current window, whole-window merges for old ones.
//!
//! Every family also answers **reshape** questions (repair the on-disk layout
//! after imports/repair), provides **cleanup** job splitting, estimates
//! pending work, and builds the matching [`backlog`] tracker that the
//! admission controller reads to budget compaction I/O.
//!
//! Strategies are pure decision makers: they produce
//! [`CompactionDescriptor`]s and never touch disk. Execution happens in the
//! compaction manager behind the runner seam.

pub mod backlog;
pub mod leveled;
pub mod options;
pub mod stcs;
pub mod time_window;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::sstable::{RunId, SortedRun, SortedRunSetError, Timestamp};
use crate::table::{TableSchema, TableState};

use self::backlog::BacklogTracker;
use self::leveled::LeveledStrategy;
use self::options::{CommonOptions, OptionsError, StrategyKind, StrategyOptions, TimestampResolution};
use self::stcs::SizeTieredStrategy;
use self::time_window::TimeWindowStrategy;

/// Effectively-unbounded output size for jobs that may produce one big run.
pub const DEFAULT_MAX_OUTPUT_SIZE: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Errors
// ------------------------------------------------------------------------------------------------

/// Unified error type of the compaction subsystem.
///
/// The variants encode the failure taxonomy the orchestrator acts on:
/// transient I/O is retried with identical inputs, `Stopped` is cooperative
/// cancellation (never a failure), a dropped table is skipped with a warning,
/// corruption quarantines the affected runs, and an invariant violation
/// disables the backlog tracker while the engine keeps serving.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Transient I/O failure; the manager reissues the descriptor a bounded
    /// number of times.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Cooperative cancellation, observed at a sorted-run boundary.
    #[error("compaction stopped: {0}")]
    Stopped(&'static str),

    /// The named keyspace does not exist.
    #[error("no such keyspace: {0}")]
    NoSuchKeyspace(String),

    /// The table vanished while an operation was in flight.
    #[error("table {keyspace}.{table} was dropped")]
    TableDropped { keyspace: String, table: String },

    /// A run failed validation; it belongs in quarantine.
    #[error("corruption in sorted run generation {generation}: {reason}")]
    Corruption { generation: u64, reason: String },

    /// Internal bookkeeping disagreed with itself.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Bad strategy options; raised at table open, never later.
    #[error("invalid compaction options: {0}")]
    Options(#[from] OptionsError),

    /// Shard executor or channel failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SortedRunSetError> for CompactionError {
    fn from(e: SortedRunSetError) -> Self {
        CompactionError::InvariantViolation(e.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// Descriptor
// ------------------------------------------------------------------------------------------------

/// How the writer should cut output runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputShaping {
    /// One output stream, cut only by `max_output_size`.
    #[default]
    None,

    /// Split outputs at time-window boundaries so no output run straddles
    /// more than one window.
    SplitByWindow {
        window_size: i64,
        resolution: TimestampResolution,
    },
}

/// A proposal to compact, produced by a strategy and consumed exactly once by
/// the compaction runner.
#[derive(Debug, Clone)]
pub struct CompactionDescriptor {
    /// Runs to merge. Empty means "nothing to do".
    pub inputs: Vec<Arc<SortedRun>>,

    /// Level the outputs land on.
    pub target_level: u32,

    /// Upper bound on each output run's size in bytes.
    pub max_output_size: u64,

    /// Run identity shared by all outputs of this job.
    pub run_id: RunId,

    /// Split shared inputs into per-shard disjoint outputs.
    pub reshard: bool,

    /// Drop data outside the supplied owned ranges while rewriting.
    pub cleanup: bool,

    /// Purge droppable tombstones while rewriting.
    pub garbage_collect: bool,

    /// Output cutting rule.
    pub shaping: OutputShaping,
}

impl CompactionDescriptor {
    /// An empty descriptor: nothing to do.
    pub fn none() -> Self {
        CompactionDescriptor::new(Vec::new(), 0, DEFAULT_MAX_OUTPUT_SIZE)
    }

    pub fn new(inputs: Vec<Arc<SortedRun>>, target_level: u32, max_output_size: u64) -> Self {
        CompactionDescriptor {
            inputs,
            target_level,
            max_output_size,
            run_id: RunId::new(),
            reshard: false,
            cleanup: false,
            garbage_collect: false,
            shaping: OutputShaping::None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sum of input data sizes; the unit of progress reporting.
    pub fn total_input_size(&self) -> u64 {
        self.inputs.iter().map(|sr| sr.data_size).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Environment seams
// ------------------------------------------------------------------------------------------------

/// Tombstone GC horizon, injected as a pure function. Strategies never reach
/// into repair or replication internals.
pub trait GcState: Send + Sync {
    /// Writes deleted before the returned timestamp may be purged.
    fn gc_before(&self, sr: &SortedRun, now: Timestamp) -> Timestamp;
}

/// GC horizon at a fixed grace period behind `now`.
#[derive(Debug, Clone)]
pub struct FixedGraceGc {
    pub grace: Duration,
}

impl GcState for FixedGraceGc {
    fn gc_before(&self, _sr: &SortedRun, now: Timestamp) -> Timestamp {
        now.saturating_sub(self.grace.as_micros() as i64)
    }
}

/// Metadata of a pending write stream, for the output-shaping hooks.
#[derive(Debug, Clone, Copy)]
pub struct WriterMeta {
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
}

/// Per-selection inputs from the compaction manager.
#[derive(Debug, Clone, Copy)]
pub struct StrategyControl {
    /// Current wall-clock time, microseconds.
    pub now: Timestamp,

    /// Whether this table already has a compaction in flight.
    pub has_ongoing_compaction: bool,
}

/// Layout-repair aggressiveness. `Strict` is the normal mode; `Relaxed`
/// tolerates more disorder so a booting node comes online sooner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshapeMode {
    Strict,
    Relaxed,
}

// ------------------------------------------------------------------------------------------------
// Tombstone-only fallback, shared by every family
// ------------------------------------------------------------------------------------------------

/// Whether a single-run rewrite to purge tombstones is worthwhile.
///
/// Recently-written runs are ignored: expired tombstones there may still
/// shadow older data, and rewriting them would loop on the same bytes.
pub fn worth_dropping_tombstones(
    common: &CommonOptions,
    sr: &SortedRun,
    now: Timestamp,
    gc: &dyn GcState,
) -> bool {
    if common.tombstone_compaction_disabled {
        return false;
    }
    let interval = common.tombstone_compaction_interval.as_micros() as i64;
    if now.saturating_sub(interval) < sr.written_at {
        return false;
    }
    let gc_before = gc.gc_before(sr, now);
    sr.estimate_droppable_tombstone_ratio(gc_before) >= common.tombstone_threshold
}

/// Picks the most tombstone-laden eligible run, if any.
pub(crate) fn tombstone_fallback(
    candidates: &[Arc<SortedRun>],
    common: &CommonOptions,
    gc: &dyn GcState,
    now: Timestamp,
) -> CompactionDescriptor {
    let best = candidates
        .iter()
        .filter(|sr| sr.data_size > 0)
        .filter(|sr| worth_dropping_tombstones(common, sr, now, gc))
        .max_by(|a, b| {
            let ra = a.estimate_droppable_tombstone_ratio(gc.gc_before(a, now));
            let rb = b.estimate_droppable_tombstone_ratio(gc.gc_before(b, now));
            ra.total_cmp(&rb)
        });
    match best {
        Some(sr) => {
            let mut desc = CompactionDescriptor::new(
                vec![Arc::clone(sr)],
                sr.level,
                DEFAULT_MAX_OUTPUT_SIZE,
            );
            desc.garbage_collect = true;
            desc
        }
        None => CompactionDescriptor::none(),
    }
}

/// Default cleanup splitting: one job per run, level and run identity
/// preserved. Bucket-aware families override this to avoid rewriting whole
/// buckets one run at a time.
pub(crate) fn per_run_cleanup_jobs(candidates: Vec<Arc<SortedRun>>) -> Vec<CompactionDescriptor> {
    candidates
        .into_iter()
        .map(|sr| {
            let level = sr.level;
            let run_id = sr.run_id;
            let mut desc = CompactionDescriptor::new(vec![sr], level, DEFAULT_MAX_OUTPUT_SIZE);
            desc.run_id = run_id;
            desc.cleanup = true;
            desc
        })
        .collect()
}

// ------------------------------------------------------------------------------------------------
// Strategy — closed sum type over the four families
// ------------------------------------------------------------------------------------------------

/// Strategy that never has anything to do.
#[derive(Debug, Clone, Default)]
pub struct NullStrategy;

/// A table's compaction strategy, picked at table-open time from the parsed
/// options. The operation set is uniform across families.
#[derive(Debug, Clone)]
pub enum Strategy {
    Null(NullStrategy),
    SizeTiered(SizeTieredStrategy),
    Leveled(LeveledStrategy),
    TimeWindow(TimeWindowStrategy),
}

impl Strategy {
    /// Builds the strategy selected by the parsed options.
    pub fn from_options(options: &StrategyOptions) -> Self {
        match options.kind {
            StrategyKind::Null => Strategy::Null(NullStrategy),
            StrategyKind::SizeTiered => Strategy::SizeTiered(SizeTieredStrategy::new(
                options.common.clone(),
                options.stcs.clone(),
            )),
            StrategyKind::Leveled => Strategy::Leveled(LeveledStrategy::new(
                options.common.clone(),
                options.stcs.clone(),
                options.lcs.clone(),
            )),
            StrategyKind::TimeWindow => Strategy::TimeWindow(TimeWindowStrategy::new(
                options.common.clone(),
                options.stcs.clone(),
                options.twcs.clone(),
            )),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Null(_) => StrategyKind::Null,
            Strategy::SizeTiered(_) => StrategyKind::SizeTiered,
            Strategy::Leveled(_) => StrategyKind::Leveled,
            Strategy::TimeWindow(_) => StrategyKind::TimeWindow,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Picks the runs to compact now; empty descriptor when satisfied.
    pub fn select_compaction(
        &self,
        table: &TableState,
        control: &StrategyControl,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        match self {
            Strategy::Null(_) => CompactionDescriptor::none(),
            Strategy::SizeTiered(s) => s.select_compaction(table, control, candidates),
            Strategy::Leveled(s) => s.select_compaction(table, control, candidates),
            Strategy::TimeWindow(s) => s.select_compaction(table, control, candidates),
        }
    }

    /// One descriptor covering all candidates.
    pub fn major_job(
        &self,
        table: &TableState,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        match self {
            Strategy::Null(_) => CompactionDescriptor::none(),
            Strategy::SizeTiered(s) => s.major_job(table, candidates),
            Strategy::Leveled(s) => s.major_job(table, candidates),
            Strategy::TimeWindow(s) => s.major_job(table, candidates),
        }
    }

    /// Splits cleanup of the candidates into jobs.
    pub fn cleanup_jobs(
        &self,
        table: &TableState,
        candidates: Vec<Arc<SortedRun>>,
    ) -> Vec<CompactionDescriptor> {
        match self {
            Strategy::Null(_) | Strategy::Leveled(_) => per_run_cleanup_jobs(candidates),
            Strategy::SizeTiered(s) => s.cleanup_jobs(table, candidates),
            Strategy::TimeWindow(s) => s.cleanup_jobs(table, candidates),
        }
    }

    /// Proposes a layout-repair compaction over the inputs; empty when the
    /// layout is acceptable.
    pub fn reshape_job(
        &self,
        input: Vec<Arc<SortedRun>>,
        schema: &TableSchema,
        mode: ReshapeMode,
    ) -> CompactionDescriptor {
        match self {
            Strategy::Null(_) => CompactionDescriptor::none(),
            Strategy::SizeTiered(s) => s.reshape_job(input, schema, mode),
            Strategy::Leveled(s) => s.reshape_job(input, schema, mode),
            Strategy::TimeWindow(s) => s.reshape_job(input, schema, mode),
        }
    }

    /// Rough count of compactions needed to reach the strategy's goal.
    pub fn pending_compactions(&self, table: &TableState) -> i64 {
        match self {
            Strategy::Null(_) => 0,
            Strategy::SizeTiered(s) => s.pending_compactions(table),
            Strategy::Leveled(s) => s.pending_compactions(table),
            Strategy::TimeWindow(s) => s.pending_compactions(table),
        }
    }

    /// Builds the backlog tracker matching this family.
    pub fn make_backlog_tracker(&self, schema: &TableSchema) -> BacklogTracker {
        match self {
            Strategy::Null(_) => BacklogTracker::Null,
            Strategy::SizeTiered(s) => s.make_backlog_tracker(schema),
            Strategy::Leveled(s) => s.make_backlog_tracker(schema),
            Strategy::TimeWindow(s) => s.make_backlog_tracker(schema),
        }
    }

    /// Scales a writer's partition estimate for strategies that split their
    /// outputs. Identity by default.
    pub fn adjust_partition_estimate(&self, meta: &WriterMeta, estimate: u64) -> u64 {
        match self {
            Strategy::TimeWindow(s) => s.adjust_partition_estimate(meta, estimate),
            _ => estimate,
        }
    }

    /// Output-cutting rule the writer must honor. Identity by default.
    pub fn output_shaping(&self, meta: &WriterMeta) -> OutputShaping {
        match self {
            Strategy::TimeWindow(s) => s.output_shaping(meta),
            _ => OutputShaping::None,
        }
    }
}
