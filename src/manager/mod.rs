//! # Compaction Manager
//!
//! Global execution gate for compaction work. Every job — strategy-selected,
//! major, cleanup, or one of the custom kinds — must hold a **permit** before
//! it runs; custom kinds (reshard, reshape, upgrade, scrub, off-strategy)
//! additionally pass through a per-kind gate so any number can queue (and be
//! visible in the statistics) while only a bounded number execute.
//!
//! The actual merge is behind the [`CompactionRunner`] seam: the manager
//! hands it a [`CompactionRequest`] plus the job record to report progress
//! into, and deals with the outcome — transient I/O failures are reissued
//! with identical inputs a bounded number of times, cooperative stops are
//! never treated as failures, and successful outputs are applied to the
//! table atomically.


use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::compaction::{CompactionDescriptor, CompactionError};
use crate::sstable::{Generation, SortedRun};
use crate::table::{CompactionJobRecord, TableSchema, TableState};
use crate::tasks::AbortHandle;

/// Key ranges this node owns; cleanup drops everything outside them.
pub type OwnedRanges = Vec<(Vec<u8>, Vec<u8>)>;

// ------------------------------------------------------------------------------------------------
// Job kinds and scrub options
// ------------------------------------------------------------------------------------------------

/// What kind of job a descriptor is being run as. Custom kinds are
/// serialized per kind by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Regular,
    Major,
    Cleanup,
    Offstrategy,
    Upgrade,
    Scrub,
    Reshape,
    Reshard,
}

impl JobKind {
    /// Custom jobs pass through a per-kind gate.
    pub fn is_custom(&self) -> bool {
        matches!(
            self,
            JobKind::Offstrategy
                | JobKind::Upgrade
                | JobKind::Scrub
                | JobKind::Reshape
                | JobKind::Reshard
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Regular => "compaction",
            JobKind::Major => "major compaction",
            JobKind::Cleanup => "cleanup compaction",
            JobKind::Offstrategy => "offstrategy compaction",
            JobKind::Upgrade => "upgrade compaction",
            JobKind::Scrub => "scrub compaction",
            JobKind::Reshape => "reshape compaction",
            JobKind::Reshard => "reshard compaction",
        }
    }
}

/// What scrub does when it meets a corrupt row or run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubMode {
    /// Move the corrupt run aside and keep going.
    Quarantine,
    /// Drop corrupt rows, keep the rest of the run.
    Skip,
    /// Rewrite out-of-order data into separate well-formed runs.
    Segregate,
    /// Read-only pass; report, change nothing.
    Validate,
    /// Stop the operation on first corruption.
    Abort,
}

impl ScrubMode {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "quarantine" => ScrubMode::Quarantine,
            "skip" => ScrubMode::Skip,
            "segregate" => ScrubMode::Segregate,
            "validate" => ScrubMode::Validate,
            "abort" => ScrubMode::Abort,
            _ => return None,
        })
    }
}

/// Aggregate scrub outcome across tables and shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrubStats {
    pub scrubbed: u64,
    pub corrupted: u64,
    pub quarantined: u64,
}

impl std::ops::AddAssign for ScrubStats {
    fn add_assign(&mut self, rhs: Self) {
        self.scrubbed += rhs.scrubbed;
        self.corrupted += rhs.corrupted;
        self.quarantined += rhs.quarantined;
    }
}

// ------------------------------------------------------------------------------------------------
// Job context and runner seam
// ------------------------------------------------------------------------------------------------

/// Cancellation, deadline and per-operation parameters flowing top-down
/// through the task tree into every job.
#[derive(Clone)]
pub struct JobContext {
    pub abort: AbortHandle,
    pub deadline: Option<Instant>,
    pub scrub_mode: Option<ScrubMode>,
    pub owned_ranges: Option<Arc<OwnedRanges>>,
}

impl JobContext {
    pub fn new(abort: AbortHandle) -> Self {
        JobContext {
            abort,
            deadline: None,
            scrub_mode: None,
            owned_ranges: None,
        }
    }

    /// Checked at every job and sorted-run boundary.
    pub fn check(&self) -> Result<(), CompactionError> {
        self.abort.check()?;
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(CompactionError::Stopped("deadline reached"));
        }
        Ok(())
    }
}

/// Everything the runner needs to execute one descriptor.
pub struct CompactionRequest<'a> {
    pub schema: &'a TableSchema,
    pub descriptor: &'a CompactionDescriptor,
    pub kind: JobKind,
    pub scrub_mode: Option<ScrubMode>,
    pub owned_ranges: Option<Arc<OwnedRanges>>,
    pub abort: &'a AbortHandle,
    pub deadline: Option<Instant>,
    generations: &'a Arc<AtomicU64>,
}

impl CompactionRequest<'_> {
    /// Allocates a generation for an output run.
    pub fn next_generation(&self) -> Generation {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// For the runner to call between sorted runs; surfaces cancellation as
    /// the compaction-stopped condition.
    pub fn check_abort(&self) -> Result<(), CompactionError> {
        self.abort.check()?;
        if let Some(deadline) = self.deadline
            && Instant::now() >= deadline
        {
            return Err(CompactionError::Stopped("deadline reached"));
        }
        Ok(())
    }
}

/// Executes compaction descriptors. The merge machinery (readers, writers,
/// the on-disk encoding) lives outside this subsystem; implementations must
/// observe `check_abort` at sorted-run boundaries, report progress into the
/// job record, and delete partial outputs when stopped.
pub trait CompactionRunner: Send + Sync {
    fn run(
        &self,
        request: &CompactionRequest<'_>,
        progress: &mut CompactionJobRecord,
    ) -> Result<Vec<SortedRun>, CompactionError>;
}

// ------------------------------------------------------------------------------------------------
// Permit gates
// ------------------------------------------------------------------------------------------------

struct Gate {
    capacity: usize,
    in_use: Mutex<usize>,
    cv: Condvar,
}

struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Gate {
    fn new(capacity: usize) -> Self {
        Gate {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    /// Waits for a slot, polling the abort token so a cancelled waiter does
    /// not sit in the queue forever.
    fn acquire<'a>(&'a self, abort: &AbortHandle) -> Result<GateGuard<'a>, CompactionError> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        while *in_use >= self.capacity {
            abort.check()?;
            let (guard, _timeout) = self
                .cv
                .wait_timeout(in_use, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            in_use = guard;
        }
        *in_use += 1;
        Ok(GateGuard { gate: self })
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let mut in_use = self
            .gate
            .in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *in_use = in_use.saturating_sub(1);
        self.gate.cv.notify_one();
    }
}

// ------------------------------------------------------------------------------------------------
// Manager
// ------------------------------------------------------------------------------------------------

/// Manager tunables.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Total compaction permits across all shards and kinds.
    pub max_concurrent_compactions: usize,

    /// Executing slots per custom job kind.
    pub custom_job_slots: usize,

    /// Reissues of a descriptor after transient I/O failure.
    pub max_retries: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_concurrent_compactions: 4,
            custom_job_slots: 1,
            max_retries: 2,
        }
    }
}

/// Counters snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub stopped: u64,
    pub retried: u64,
}

/// The global compaction manager.
pub struct CompactionManager {
    permits: Gate,
    custom: HashMap<JobKind, Gate>,
    runner: Arc<dyn CompactionRunner>,
    max_retries: usize,
    stats: Mutex<CompactionStats>,
}

impl CompactionManager {
    pub fn new(runner: Arc<dyn CompactionRunner>, config: ManagerConfig) -> Self {
        let custom = [
            JobKind::Offstrategy,
            JobKind::Upgrade,
            JobKind::Scrub,
            JobKind::Reshape,
            JobKind::Reshard,
        ]
        .into_iter()
        .map(|kind| (kind, Gate::new(config.custom_job_slots)))
        .collect();
        CompactionManager {
            permits: Gate::new(config.max_concurrent_compactions),
            custom,
            runner,
            max_retries: config.max_retries,
            stats: Mutex::new(CompactionStats::default()),
        }
    }

    pub fn stats(&self) -> CompactionStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_stats(&self, f: impl FnOnce(&mut CompactionStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }

    /// Waits for the per-kind slot (custom jobs only) and then a global
    /// permit. Both waits observe the abort token.
    fn acquire_slots<'a>(
        &'a self,
        kind: JobKind,
        ctx: &JobContext,
    ) -> Result<(Option<GateGuard<'a>>, GateGuard<'a>), CompactionError> {
        let custom_slot = match self.custom.get(&kind) {
            Some(gate) => Some(gate.acquire(&ctx.abort)?),
            None => None,
        };
        let permit = self.permits.acquire(&ctx.abort)?;
        Ok((custom_slot, permit))
    }

    /// Runs a descriptor against a table: registers the job record, executes
    /// through the runner with bounded retries, and applies the outputs to
    /// the table's set and tracker. Scrub in validate mode leaves the set
    /// untouched.
    pub fn run_table_compaction(
        &self,
        table: &mut TableState,
        descriptor: CompactionDescriptor,
        kind: JobKind,
        ctx: &JobContext,
    ) -> Result<Vec<Arc<SortedRun>>, CompactionError> {
        if descriptor.is_empty() {
            return Ok(Vec::new());
        }
        ctx.check()?;
        self.with_stats(|s| s.pending += 1);

        let slots = self.acquire_slots(kind, ctx);
        let (_custom_slot, _permit) = match slots {
            Ok(slots) => slots,
            Err(e) => {
                self.with_stats(|s| s.pending -= 1);
                return Err(e);
            }
        };
        self.with_stats(|s| {
            s.pending -= 1;
            s.running += 1;
        });

        let job_id = table.register_job(&descriptor);
        let result = self.execute_with_retries(table, job_id, &descriptor, kind, ctx);
        self.with_stats(|s| s.running -= 1);

        match result {
            Ok(outputs) => {
                let outputs: Vec<Arc<SortedRun>> = outputs.into_iter().map(Arc::new).collect();
                if matches!(ctx.scrub_mode, Some(ScrubMode::Validate)) {
                    table.remove_job(job_id);
                } else {
                    table.apply_compaction(job_id, &outputs)?;
                }
                self.with_stats(|s| s.completed += 1);
                debug!(
                    keyspace = %table.schema().keyspace,
                    table = %table.schema().name,
                    kind = kind.name(),
                    outputs = outputs.len(),
                    "compaction applied"
                );
                Ok(outputs)
            }
            Err(e) => {
                // Partial outputs of a stopped or failed job are the
                // runner's to delete; only the record is dropped here.
                table.remove_job(job_id);
                self.with_stats(|s| match e {
                    CompactionError::Stopped(_) => s.stopped += 1,
                    _ => s.failed += 1,
                });
                Err(e)
            }
        }
    }

    fn execute_with_retries(
        &self,
        table: &mut TableState,
        job_id: u64,
        descriptor: &CompactionDescriptor,
        kind: JobKind,
        ctx: &JobContext,
    ) -> Result<Vec<SortedRun>, CompactionError> {
        let schema = table.schema().clone();
        let generations = table.generation_source();
        let mut attempt = 0usize;
        loop {
            ctx.check()?;
            let request = CompactionRequest {
                schema: &schema,
                descriptor,
                kind,
                scrub_mode: ctx.scrub_mode,
                owned_ranges: ctx.owned_ranges.clone(),
                abort: &ctx.abort,
                deadline: ctx.deadline,
                generations: &generations,
            };
            let progress = table.job_mut(job_id).ok_or_else(|| {
                CompactionError::Internal(format!("compaction job {job_id} lost its record"))
            })?;
            match self.runner.run(&request, progress) {
                Ok(outputs) => return Ok(outputs),
                Err(CompactionError::Io(e)) if attempt < self.max_retries => {
                    attempt += 1;
                    self.with_stats(|s| s.retried += 1);
                    warn!(
                        keyspace = %schema.keyspace,
                        table = %schema.name,
                        kind = kind.name(),
                        attempt,
                        %e,
                        "transient I/O failure; reissuing descriptor"
                    );
                    if let Some(progress) = table.job_mut(job_id) {
                        progress.reset_progress();
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs a descriptor over runs that are not (yet) in any table set —
    /// loader reshard/reshape work. Same gating and retry rules; outputs are
    /// returned to the caller instead of applied to a table.
    pub fn run_detached_job(
        &self,
        schema: &TableSchema,
        generations: &Arc<AtomicU64>,
        descriptor: CompactionDescriptor,
        kind: JobKind,
        ctx: &JobContext,
    ) -> Result<Vec<Arc<SortedRun>>, CompactionError> {
        if descriptor.is_empty() {
            return Ok(Vec::new());
        }
        ctx.check()?;
        self.with_stats(|s| s.pending += 1);

        let slots = self.acquire_slots(kind, ctx);
        let (_custom_slot, _permit) = match slots {
            Ok(slots) => slots,
            Err(e) => {
                self.with_stats(|s| s.pending -= 1);
                return Err(e);
            }
        };
        self.with_stats(|s| {
            s.pending -= 1;
            s.running += 1;
        });

        let mut progress = CompactionJobRecord::detached(&descriptor);
        let mut attempt = 0usize;
        let result = loop {
            if let Err(e) = ctx.check() {
                break Err(e);
            }
            let request = CompactionRequest {
                schema,
                descriptor: &descriptor,
                kind,
                scrub_mode: ctx.scrub_mode,
                owned_ranges: ctx.owned_ranges.clone(),
                abort: &ctx.abort,
                deadline: ctx.deadline,
                generations,
            };
            match self.runner.run(&request, &mut progress) {
                Ok(outputs) => break Ok(outputs),
                Err(CompactionError::Io(e)) if attempt < self.max_retries => {
                    attempt += 1;
                    self.with_stats(|s| s.retried += 1);
                    warn!(
                        keyspace = %schema.keyspace,
                        table = %schema.name,
                        kind = kind.name(),
                        attempt,
                        %e,
                        "transient I/O failure; reissuing descriptor"
                    );
                    progress.reset_progress();
                }
                Err(e) => break Err(e),
            }
        };
        self.with_stats(|s| s.running -= 1);

        match result {
            Ok(outputs) => {
                self.with_stats(|s| s.completed += 1);
                Ok(outputs.into_iter().map(Arc::new).collect())
            }
            Err(e) => {
                self.with_stats(|s| match e {
                    CompactionError::Stopped(_) => s.stopped += 1,
                    _ => s.failed += 1,
                });
                Err(e)
            }
        }
    }
}
