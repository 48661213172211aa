//! # Task Orchestration
//!
//! A keyspace-level operation fans out into a three-level task tree:
//!
//! ```text
//! keyspace op (driver)
//!  ├── shard op × shard_count          (parallel, one per shard)
//!  │    └── table op × tables          (serialized or bounded-parallel)
//! ```
//!
//! For `major` and `cleanup`, table ops on one shard run strictly one at a
//! time, **smallest table first**, with sizes re-sampled before each pick —
//! under low free space the small merges must land before the big ones. The
//! remaining operations run tables without sorting; the compaction manager's
//! per-kind gates bound their concurrency.
//!
//! Cancellation flows top-down through [`AbortHandle`]s; a parent abort
//! broadcasts to its children, and an in-flight job observes it as the
//! compaction-stopped condition at the next run boundary. A per-table error
//! is caught, logged with `{keyspace, table, op}`, recorded on the task
//! node, and the operation *continues*; the first error surfaces only after
//! every sibling has quiesced. Cancellation always outranks errors.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use tracing::{debug, error, info, warn};

use crate::compaction::{
    CompactionDescriptor, CompactionError, DEFAULT_MAX_OUTPUT_SIZE, ReshapeMode,
};
use crate::manager::{CompactionManager, JobContext, JobKind, ScrubMode, ScrubStats};
use crate::shard::ShardState;
use crate::sstable::{MaintenanceKind, ShardId};
use crate::table::TableId;

// ------------------------------------------------------------------------------------------------
// Operations
// ------------------------------------------------------------------------------------------------

/// The keyspace-level operations the orchestrator knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Major,
    Cleanup,
    Offstrategy,
    Upgrade,
    Scrub,
    Reshape,
    Reshard,
}

impl OpKind {
    /// Whether per-shard table ops are serialized smallest-table-first.
    pub fn serialized_by_size(&self) -> bool {
        matches!(self, OpKind::Major | OpKind::Cleanup)
    }

    pub(crate) fn job_kind(&self) -> JobKind {
        match self {
            OpKind::Major => JobKind::Major,
            OpKind::Cleanup => JobKind::Cleanup,
            OpKind::Offstrategy => JobKind::Offstrategy,
            OpKind::Upgrade => JobKind::Upgrade,
            OpKind::Scrub => JobKind::Scrub,
            OpKind::Reshape => JobKind::Reshape,
            OpKind::Reshard => JobKind::Reshard,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Major => "major",
            OpKind::Cleanup => "cleanup",
            OpKind::Offstrategy => "offstrategy",
            OpKind::Upgrade => "upgrade",
            OpKind::Scrub => "scrub",
            OpKind::Reshape => "reshape",
            OpKind::Reshard => "reshard",
        };
        f.write_str(s)
    }
}

// ------------------------------------------------------------------------------------------------
// Abort tree
// ------------------------------------------------------------------------------------------------

struct AbortInner {
    aborted: AtomicBool,
    children: Mutex<Vec<AbortHandle>>,
}

/// Node of the cancellation tree. Aborting a handle aborts every child
/// derived from it, recursively.
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

impl AbortHandle {
    pub fn new() -> Self {
        AbortHandle {
            inner: Arc::new(AbortInner {
                aborted: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Derives a child handle. A child of an already-aborted parent is born
    /// aborted.
    pub fn child(&self) -> AbortHandle {
        let child = AbortHandle::new();
        if self.is_aborted() {
            child.inner.aborted.store(true, Ordering::SeqCst);
            return child;
        }
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        children.push(child.clone());
        child
    }

    /// Broadcasts the abort down the tree.
    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        let children: Vec<AbortHandle> = {
            let mut guard = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        for child in children {
            child.abort();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Surfaces an abort as the compaction-stopped condition.
    pub fn check(&self) -> Result<(), CompactionError> {
        if self.is_aborted() {
            Err(CompactionError::Stopped("operation aborted"))
        } else {
            Ok(())
        }
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Progress registry
// ------------------------------------------------------------------------------------------------

/// Terminal and non-terminal states of a task node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Done,
    Failed(String),
    Aborted,
}

/// One node of the task tree, as published to observers.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub id: u64,
    pub parent: Option<u64>,
    pub shard: Option<ShardId>,
    pub keyspace: String,
    pub table: Option<String>,
    pub op: OpKind,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub started_at: SystemTime,
    pub state: TaskState,
}

/// Registry of task nodes. Updates are cooperative: published at task and
/// job boundaries, never from inside tight loops.
pub struct TaskRegistry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, TaskStatus>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry {
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(
        &self,
        parent: Option<u64>,
        shard: Option<ShardId>,
        keyspace: &str,
        table: Option<&str>,
        op: OpKind,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let status = TaskStatus {
            id,
            parent,
            shard,
            keyspace: keyspace.to_string(),
            table: table.map(str::to_string),
            op,
            bytes_total: 0,
            bytes_done: 0,
            started_at: SystemTime::now(),
            state: TaskState::Running,
        };
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, status);
        id
    }

    fn update(&self, id: u64, f: impl FnOnce(&mut TaskStatus)) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = tasks.get_mut(&id) {
            f(status);
        }
    }

    pub fn set_total(&self, id: u64, bytes_total: u64) {
        self.update(id, |s| s.bytes_total = bytes_total);
    }

    pub fn add_done(&self, id: u64, bytes: u64) {
        self.update(id, |s| s.bytes_done += bytes);
    }

    pub fn finish(&self, id: u64, state: TaskState) {
        self.update(id, |s| s.state = state);
    }

    pub fn get(&self, id: u64) -> Option<TaskStatus> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<TaskStatus> {
        let mut tasks: Vec<TaskStatus> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ------------------------------------------------------------------------------------------------
// Shard-level execution
// ------------------------------------------------------------------------------------------------

/// Instructions one shard receives for a keyspace operation.
#[derive(Clone)]
pub(crate) struct ShardOpSpec {
    pub op: OpKind,
    pub keyspace: String,
    pub tables: Vec<(TableId, String)>,
    pub parent_task: u64,
    pub include_all_versions: bool,
}

/// What a shard reports back to the keyspace driver.
pub(crate) struct ShardOpOutcome {
    pub shard: ShardId,
    pub first_error: Option<CompactionError>,
    pub failed_tables: Vec<(String, String)>,
    pub offstrategy_needed: bool,
    pub scrub: ScrubStats,
}

/// Runs every table op of one keyspace operation on this shard.
pub(crate) fn run_shard_op(
    state: &mut ShardState,
    manager: &CompactionManager,
    registry: &TaskRegistry,
    spec: &ShardOpSpec,
    ctx: &JobContext,
) -> ShardOpOutcome {
    let shard = state.shard;
    let shard_task = registry.start(
        Some(spec.parent_task),
        Some(shard),
        &spec.keyspace,
        None,
        spec.op,
    );
    let mut outcome = ShardOpOutcome {
        shard,
        first_error: None,
        failed_tables: Vec::new(),
        offstrategy_needed: false,
        scrub: ScrubStats::default(),
    };

    let mut remaining = spec.tables.clone();
    while !remaining.is_empty() {
        if ctx.abort.is_aborted() {
            outcome.first_error = Some(CompactionError::Stopped("operation aborted"));
            registry.finish(shard_task, TaskState::Aborted);
            return outcome;
        }

        // Compacting one table can shift sizes substantially, so the
        // smallest-first order is re-derived before every pick.
        let next = if spec.op.serialized_by_size() {
            let smallest = remaining
                .iter()
                .enumerate()
                .min_by_key(|(_, (id, _))| {
                    state
                        .tables
                        .get(id)
                        .map(|t| t.live_disk_space_used() as i128)
                        .unwrap_or(-1)
                })
                .map(|(idx, _)| idx);
            match smallest {
                Some(idx) => remaining.remove(idx),
                None => break,
            }
        } else {
            remaining.remove(0)
        };

        let (table_id, table_name) = next;
        let stop = run_table_op(
            state,
            manager,
            registry,
            spec,
            shard_task,
            table_id,
            &table_name,
            ctx,
            &mut outcome,
        );
        if stop {
            break;
        }
    }

    let terminal = match &outcome.first_error {
        Some(CompactionError::Stopped(_)) => TaskState::Aborted,
        Some(e) => TaskState::Failed(e.to_string()),
        None => TaskState::Done,
    };
    registry.finish(shard_task, terminal);
    outcome
}

/// Runs one table op; returns true when the whole shard op must stop
/// (cancellation).
#[allow(clippy::too_many_arguments)]
fn run_table_op(
    state: &mut ShardState,
    manager: &CompactionManager,
    registry: &TaskRegistry,
    spec: &ShardOpSpec,
    shard_task: u64,
    table_id: TableId,
    table_name: &str,
    ctx: &JobContext,
    outcome: &mut ShardOpOutcome,
) -> bool {
    debug!(
        keyspace = %spec.keyspace,
        table = %table_name,
        op = %spec.op,
        shard = state.shard,
        "starting table operation"
    );
    let task = registry.start(
        Some(shard_task),
        Some(state.shard),
        &spec.keyspace,
        Some(table_name),
        spec.op,
    );

    let result = execute_table_op(state, manager, registry, spec, task, table_id, ctx, outcome);

    match result {
        Ok(()) => {
            registry.finish(task, TaskState::Done);
            false
        }
        Err(CompactionError::TableDropped { keyspace, table }) => {
            warn!(
                keyspace = %keyspace,
                table = %table,
                op = %spec.op,
                "skipping operation: table was dropped"
            );
            registry.finish(task, TaskState::Done);
            false
        }
        Err(e @ CompactionError::Stopped(_)) => {
            // Cancellation outranks any error recorded so far.
            registry.finish(task, TaskState::Aborted);
            outcome.first_error = Some(e);
            true
        }
        Err(e) => {
            error!(
                keyspace = %spec.keyspace,
                table = %table_name,
                op = %spec.op,
                %e,
                "table operation failed"
            );
            registry.finish(task, TaskState::Failed(e.to_string()));
            outcome
                .failed_tables
                .push((table_name.to_string(), e.to_string()));
            if outcome.first_error.is_none() {
                outcome.first_error = Some(e);
            }
            false
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_table_op(
    state: &mut ShardState,
    manager: &CompactionManager,
    registry: &TaskRegistry,
    spec: &ShardOpSpec,
    task: u64,
    table_id: TableId,
    ctx: &JobContext,
    outcome: &mut ShardOpOutcome,
) -> Result<(), CompactionError> {
    let table = state
        .tables
        .get_mut(&table_id)
        .ok_or_else(|| CompactionError::TableDropped {
            keyspace: spec.keyspace.clone(),
            table: spec
                .tables
                .iter()
                .find(|(id, _)| *id == table_id)
                .map(|(_, name)| name.clone())
                .unwrap_or_default(),
        })?;

    match spec.op {
        OpKind::Major => {
            let candidates = table.compaction_candidates();
            let descriptor = table.strategy().major_job(table, candidates);
            registry.set_total(task, descriptor.total_input_size());
            let size = descriptor.total_input_size();
            manager.run_table_compaction(table, descriptor, JobKind::Major, ctx)?;
            registry.add_done(task, size);
        }

        OpKind::Cleanup => {
            let candidates = table.compaction_candidates();
            let jobs = table.strategy().cleanup_jobs(table, candidates);
            registry.set_total(task, jobs.iter().map(|d| d.total_input_size()).sum());
            for mut descriptor in jobs {
                ctx.check()?;
                descriptor.cleanup = true;
                let size = descriptor.total_input_size();
                manager.run_table_compaction(table, descriptor, JobKind::Cleanup, ctx)?;
                registry.add_done(task, size);
            }
        }

        OpKind::Offstrategy => {
            let runs = table.set_mut().take_maintenance(MaintenanceKind::OffStrategy);
            if runs.is_empty() {
                return Ok(());
            }
            outcome.offstrategy_needed = true;
            registry.set_total(task, runs.iter().map(|sr| sr.data_size).sum());

            let max = table.schema().max_compaction_threshold.max(1);
            let schema = table.schema().clone();
            let generations = table.generation_source();
            let mut chunks: Vec<Vec<_>> = runs.chunks(max).map(<[_]>::to_vec).collect();

            while let Some(chunk) = chunks.pop() {
                let descriptor =
                    CompactionDescriptor::new(chunk.clone(), 0, DEFAULT_MAX_OUTPUT_SIZE);
                let size = descriptor.total_input_size();
                let run = ctx.check().and_then(|_| {
                    manager.run_detached_job(
                        &schema,
                        &generations,
                        descriptor,
                        JobKind::Offstrategy,
                        ctx,
                    )
                });
                match run {
                    Ok(outputs) => {
                        table.replace_sstables(&[], &outputs)?;
                        registry.add_done(task, size);
                    }
                    Err(e) => {
                        // Unabsorbed runs stay in the maintenance set for
                        // the next off-strategy round.
                        for sr in chunk {
                            table
                                .set_mut()
                                .add_maintenance(MaintenanceKind::OffStrategy, sr);
                        }
                        for chunk in chunks {
                            for sr in chunk {
                                table
                                    .set_mut()
                                    .add_maintenance(MaintenanceKind::OffStrategy, sr);
                            }
                        }
                        return Err(e);
                    }
                }
            }
        }

        OpKind::Upgrade => {
            let current = table.schema().current_version.clone();
            let candidates: Vec<_> = table
                .compaction_candidates()
                .into_iter()
                .filter(|sr| spec.include_all_versions || sr.version != current)
                .collect();
            registry.set_total(task, candidates.iter().map(|sr| sr.data_size).sum());
            for sr in candidates {
                ctx.check()?;
                let size = sr.data_size;
                let level = sr.level;
                let descriptor = CompactionDescriptor::new(vec![sr], level, DEFAULT_MAX_OUTPUT_SIZE);
                manager.run_table_compaction(table, descriptor, JobKind::Upgrade, ctx)?;
                registry.add_done(task, size);
            }
        }

        OpKind::Scrub => {
            let mode = ctx.scrub_mode.unwrap_or(ScrubMode::Validate);
            let candidates = table.compaction_candidates();
            registry.set_total(task, candidates.iter().map(|sr| sr.data_size).sum());
            for sr in candidates {
                ctx.check()?;
                let size = sr.data_size;
                let level = sr.level;
                let generation = sr.generation;
                let descriptor = CompactionDescriptor::new(vec![sr], level, DEFAULT_MAX_OUTPUT_SIZE);
                match manager.run_table_compaction(table, descriptor, JobKind::Scrub, ctx) {
                    Ok(_) => {
                        outcome.scrub.scrubbed += 1;
                        registry.add_done(task, size);
                    }
                    Err(e @ CompactionError::Corruption { .. }) => {
                        outcome.scrub.corrupted += 1;
                        match mode {
                            ScrubMode::Quarantine => {
                                table.quarantine_run(generation);
                                outcome.scrub.quarantined += 1;
                            }
                            ScrubMode::Abort => return Err(e),
                            _ => {}
                        }
                        registry.add_done(task, size);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        OpKind::Reshape => {
            loop {
                ctx.check()?;
                let candidates = table.compaction_candidates();
                let descriptor =
                    table
                        .strategy()
                        .reshape_job(candidates, table.schema(), ReshapeMode::Strict);
                if descriptor.is_empty() {
                    break;
                }
                let size = descriptor.total_input_size();
                match manager.run_table_compaction(table, descriptor, JobKind::Reshape, ctx) {
                    Ok(_) => registry.add_done(task, size),
                    Err(CompactionError::Stopped(_)) => {
                        info!(
                            keyspace = %spec.keyspace,
                            table = %table.schema().name,
                            "reshape aborted cleanly"
                        );
                        break;
                    }
                    Err(e) => {
                        info!(
                            keyspace = %spec.keyspace,
                            table = %table.schema().name,
                            %e,
                            "reshape round failed"
                        );
                        break;
                    }
                }
            }
        }

        // Resharding redistributes runs *across* shards; the keyspace
        // driver coordinates it and shards only execute their slice.
        OpKind::Reshard => {}
    }
    Ok(())
}
