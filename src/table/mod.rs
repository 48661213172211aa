//! # Per-Table Compaction State
//!
//! One [`TableState`] exists per (table, shard). It exclusively owns the
//! table's [`SortedRunSet`], its [`Strategy`] instance and its
//! [`BacklogTracker`], and records in-flight compaction jobs and writes so
//! the tracker can subtract work already done. The owning shard actor is the
//! only accessor, so a `replace` of the set and the tracker is atomic from
//! the strategy's point of view: no selection can run between removing the
//! inputs and inserting the outputs.


use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, warn};

use crate::compaction::backlog::{BacklogTracker, OngoingCompaction, OngoingWrite};
use crate::compaction::options::{OptionsError, StrategyOptions};
use crate::compaction::{
    CompactionDescriptor, CompactionError, FixedGraceGc, GcState, Strategy, StrategyControl,
};
use crate::sstable::{Generation, SortedRun, SortedRunSet, Timestamp};

/// Engine-wide table identifier, assigned at table creation.
pub type TableId = u64;

/// Default GC grace period: ten days, matching the usual repair cadence.
pub const DEFAULT_GC_GRACE: Duration = Duration::from_secs(864_000);

// ------------------------------------------------------------------------------------------------
// Schema
// ------------------------------------------------------------------------------------------------

/// The slice of a table's schema the compaction subsystem consumes.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub keyspace: String,
    pub name: String,

    /// Fan-in floor used by selection and by backlog contribution.
    pub min_compaction_threshold: usize,

    /// Upper bound on runs merged by one job; also sizes reshard batches.
    pub max_compaction_threshold: usize,

    /// Current on-disk format version; `upgradesstables` rewrites anything
    /// older.
    pub current_version: String,

    /// On-disk format family tag used in component filenames.
    pub format: String,
}

impl TableSchema {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        TableSchema {
            keyspace: keyspace.into(),
            name: name.into(),
            min_compaction_threshold: 4,
            max_compaction_threshold: 32,
            current_version: "me".to_string(),
            format: "big".to_string(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Job records
// ------------------------------------------------------------------------------------------------

/// Bookkeeping for one in-flight compaction job, from start to terminal
/// state. The backlog tracker consults it to subtract in-flight progress
/// from outstanding work.
#[derive(Debug, Clone)]
pub struct CompactionJobRecord {
    pub id: u64,
    pub inputs: Vec<Arc<SortedRun>>,
    pub target_level: u32,

    /// Output bytes written so far.
    pub written: u64,

    /// Input bytes consumed so far, parallel to `inputs`.
    compacted: Vec<u64>,
}

impl CompactionJobRecord {
    fn new(id: u64, descriptor: &CompactionDescriptor) -> Self {
        let compacted = vec![0u64; descriptor.inputs.len()];
        CompactionJobRecord {
            id,
            inputs: descriptor.inputs.clone(),
            target_level: descriptor.target_level,
            written: 0,
            compacted,
        }
    }

    /// Record for a job whose inputs are not in any table set (loader work).
    pub(crate) fn detached(descriptor: &CompactionDescriptor) -> Self {
        Self::new(0, descriptor)
    }

    /// Records absolute progress against one input, clamped to its size.
    pub fn set_compacted(&mut self, input_index: usize, bytes: u64) {
        if let (Some(slot), Some(input)) =
            (self.compacted.get_mut(input_index), self.inputs.get(input_index))
        {
            *slot = bytes.min(input.data_size);
        }
    }

    pub fn add_written(&mut self, bytes: u64) {
        self.written += bytes;
    }

    pub fn total_compacted(&self) -> u64 {
        self.compacted.iter().sum()
    }

    /// Clears progress; used when a transient failure forces a reissue.
    pub fn reset_progress(&mut self) {
        self.written = 0;
        self.compacted.fill(0);
    }

    fn ongoing(&self) -> impl Iterator<Item = OngoingCompaction> + '_ {
        self.inputs
            .iter()
            .zip(self.compacted.iter())
            .map(|(input, compacted)| OngoingCompaction {
                input: Arc::clone(input),
                compacted: *compacted,
            })
    }
}

// ------------------------------------------------------------------------------------------------
// TableState
// ------------------------------------------------------------------------------------------------

/// Compaction-facing state of one table on one shard.
pub struct TableState {
    schema: TableSchema,
    options: StrategyOptions,
    set: SortedRunSet,
    strategy: Strategy,
    tracker: BacklogTracker,
    gc: Arc<dyn GcState>,

    jobs: BTreeMap<u64, CompactionJobRecord>,
    next_job_id: u64,

    writes: HashMap<u64, OngoingWrite>,
    next_write_id: u64,

    /// Last allocated generation; shared by this table's states on every
    /// shard so generations stay unique per table.
    generations: Arc<AtomicU64>,
}

impl TableState {
    /// Builds the state from parsed options. Strategy and tracker are
    /// constructed once here; configuration problems surface before the
    /// table opens.
    pub fn new(
        schema: TableSchema,
        options: StrategyOptions,
        generations: Arc<AtomicU64>,
    ) -> Self {
        let strategy = Strategy::from_options(&options);
        let tracker = strategy.make_backlog_tracker(&schema);
        TableState {
            schema,
            options,
            set: SortedRunSet::new(),
            strategy,
            tracker,
            gc: Arc::new(FixedGraceGc {
                grace: DEFAULT_GC_GRACE,
            }),
            jobs: BTreeMap::new(),
            next_job_id: 0,
            writes: HashMap::new(),
            next_write_id: 0,
            generations,
        }
    }

    /// Parses the raw option map and builds the state.
    pub fn from_option_map(
        schema: TableSchema,
        options: &std::collections::BTreeMap<String, String>,
        generations: Arc<AtomicU64>,
    ) -> Result<Self, OptionsError> {
        let options = StrategyOptions::parse(options)?;
        Ok(Self::new(schema, options, generations))
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn options(&self) -> &StrategyOptions {
        &self.options
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn set(&self) -> &SortedRunSet {
        &self.set
    }

    pub fn set_mut(&mut self) -> &mut SortedRunSet {
        &mut self.set
    }

    pub fn gc_state(&self) -> &dyn GcState {
        self.gc.as_ref()
    }

    pub fn set_gc_state(&mut self, gc: Arc<dyn GcState>) {
        self.gc = gc;
    }

    /// Allocates the next generation for a new run of this table.
    pub fn next_generation(&self) -> Generation {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Bumps the allocator past generations discovered on disk.
    pub fn ensure_generation_at_least(&self, seen: Generation) {
        self.generations.fetch_max(seen, Ordering::SeqCst);
    }

    pub fn generation_source(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generations)
    }

    /// Bytes on disk, the sort key for per-shard serialized operations.
    pub fn live_disk_space_used(&self) -> u64 {
        self.set.live_data_size()
    }

    // --------------------------------------------------------------------------------------------
    // Set + tracker mutation
    // --------------------------------------------------------------------------------------------

    /// Atomically applies a replacement to the run set and the backlog
    /// tracker.
    ///
    /// A tracker bookkeeping failure is fatal *to the tracker only*: it is
    /// swapped for the disabled sentinel and the table keeps serving.
    pub fn replace_sstables(
        &mut self,
        old: &[Arc<SortedRun>],
        new: &[Arc<SortedRun>],
    ) -> Result<(), CompactionError> {
        self.set.replace(old, new)?;
        if let Err(e) = self.tracker.replace_sstables(old, new) {
            error!(
                keyspace = %self.schema.keyspace,
                table = %self.schema.name,
                %e,
                "backlog tracker bookkeeping failed; disabling tracker"
            );
            self.tracker = BacklogTracker::Disabled;
        }
        Ok(())
    }

    /// Moves a main-set run into quarantine and drops it from the tracker.
    pub fn quarantine_run(&mut self, generation: Generation) {
        let Some(sr) = self
            .set
            .main_runs()
            .find(|sr| sr.generation == generation)
            .cloned()
        else {
            return;
        };
        if self.set.quarantine(generation) {
            warn!(
                keyspace = %self.schema.keyspace,
                table = %self.schema.name,
                generation,
                "moved corrupt run to quarantine"
            );
            if let Err(e) = self.tracker.replace_sstables(&[sr], &[]) {
                error!(%e, "backlog tracker bookkeeping failed; disabling tracker");
                self.tracker = BacklogTracker::Disabled;
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Selection
    // --------------------------------------------------------------------------------------------

    /// Main-set runs eligible for a new compaction: everything not already
    /// feeding an in-flight job.
    pub fn compaction_candidates(&self) -> Vec<Arc<SortedRun>> {
        let busy: HashSet<Generation> = self
            .jobs
            .values()
            .flat_map(|job| job.inputs.iter().map(|sr| sr.generation))
            .collect();
        self.set
            .main_runs()
            .filter(|sr| !busy.contains(&sr.generation))
            .cloned()
            .collect()
    }

    /// Control block for one selection round.
    pub fn strategy_control(&self, now: Timestamp) -> StrategyControl {
        StrategyControl {
            now,
            has_ongoing_compaction: !self.jobs.is_empty(),
        }
    }

    /// Asks the strategy for the next compaction over the current candidates.
    pub fn select_compaction(&self, now: Timestamp) -> CompactionDescriptor {
        let control = self.strategy_control(now);
        self.strategy
            .select_compaction(self, &control, self.compaction_candidates())
    }

    /// Strategy's estimate of outstanding compactions.
    pub fn pending_compactions(&self) -> i64 {
        self.strategy.pending_compactions(self)
    }

    // --------------------------------------------------------------------------------------------
    // Job records
    // --------------------------------------------------------------------------------------------

    pub fn register_job(&mut self, descriptor: &CompactionDescriptor) -> u64 {
        self.next_job_id += 1;
        let id = self.next_job_id;
        self.jobs.insert(id, CompactionJobRecord::new(id, descriptor));
        id
    }

    pub fn job_mut(&mut self, id: u64) -> Option<&mut CompactionJobRecord> {
        self.jobs.get_mut(&id)
    }

    pub fn remove_job(&mut self, id: u64) -> Option<CompactionJobRecord> {
        self.jobs.remove(&id)
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Completes a job: its inputs leave the set, its outputs enter, and the
    /// record is dropped — in that order, atomically for the strategy.
    pub fn apply_compaction(
        &mut self,
        job_id: u64,
        outputs: &[Arc<SortedRun>],
    ) -> Result<(), CompactionError> {
        let job = self.jobs.remove(&job_id).ok_or_else(|| {
            CompactionError::InvariantViolation(format!("unknown compaction job {job_id}"))
        })?;
        let inputs = job.inputs.clone();
        match self.replace_sstables(&inputs, outputs) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.jobs.insert(job_id, job);
                Err(e)
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Write records
    // --------------------------------------------------------------------------------------------

    /// Registers an in-flight write stream (flush or streamed-in run).
    pub fn register_write(&mut self, level: u32, max_timestamp: Timestamp) -> u64 {
        self.next_write_id += 1;
        let id = self.next_write_id;
        self.writes.insert(
            id,
            OngoingWrite {
                level,
                max_timestamp,
                written: 0,
            },
        );
        id
    }

    pub fn note_write_progress(&mut self, id: u64, written: u64) {
        if let Some(w) = self.writes.get_mut(&id) {
            w.written = written;
        }
    }

    pub fn finish_write(&mut self, id: u64) {
        self.writes.remove(&id);
    }

    // --------------------------------------------------------------------------------------------
    // Backlog
    // --------------------------------------------------------------------------------------------

    /// In-flight compaction progress, one entry per (job, input).
    pub fn ongoing_compactions(&self) -> Vec<OngoingCompaction> {
        self.jobs.values().flat_map(|job| job.ongoing()).collect()
    }

    /// In-flight write streams.
    pub fn ongoing_writes(&self) -> Vec<OngoingWrite> {
        self.writes.values().cloned().collect()
    }

    /// Current backlog of this table on this shard.
    pub fn backlog(&self) -> f64 {
        self.tracker
            .backlog(&self.ongoing_writes(), &self.ongoing_compactions())
    }

    pub fn tracker(&self) -> &BacklogTracker {
        &self.tracker
    }
}
