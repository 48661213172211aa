//! # Database Handle
//!
//! The coordinator over the shard actors: table topology, the global
//! compaction manager, the task registry, and the keyspace-level operation
//! surface (`compact`, `cleanup`, `offstrategy`, `upgradesstables`, `scrub`,
//! `reshape`, `reshard`, `refresh`).
//!
//! A keyspace operation resolves the table list, starts the root task node,
//! fans a shard-op spec out to every shard in parallel, and aggregates the
//! per-shard outcomes after all shards have quiesced. Any per-table failure
//! makes the report non-successful (a CLI maps that straight to a non-zero
//! exit code); cancellation surfaces as an error and outranks everything
//! else.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::compaction::CompactionError;
use crate::compaction::options::StrategyOptions;
use crate::loader::{Sharder, SstableOpener};
use crate::manager::{
    CompactionManager, CompactionRunner, CompactionStats, JobContext, JobKind, ManagerConfig,
    OwnedRanges, ScrubMode, ScrubStats,
};
use crate::shard::ShardPool;
use crate::sstable::{ShardId, SortedRun, Timestamp};
use crate::table::{TableId, TableSchema, TableState};
use crate::tasks::{AbortHandle, OpKind, ShardOpSpec, TaskRegistry, TaskState, run_shard_op};

/// Configuration of a [`Database`] instance.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Root of the on-disk layout: `<data_dir>/<keyspace>/<table>/...`.
    pub data_dir: PathBuf,

    /// Number of shard actors.
    pub shard_count: usize,

    /// Compaction manager tunables.
    pub manager: ManagerConfig,
}

impl DatabaseConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        DatabaseConfig {
            data_dir: data_dir.into(),
            shard_count: 4,
            manager: ManagerConfig::default(),
        }
    }
}

/// Driver-side table record.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub id: TableId,
    pub name: String,
}

pub(crate) struct KeyspaceMeta {
    pub tables: Vec<TableMeta>,
    pub owned_ranges: Option<Arc<OwnedRanges>>,
}

/// Current wall-clock time in microseconds.
pub(crate) fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

// ------------------------------------------------------------------------------------------------
// Operation reports
// ------------------------------------------------------------------------------------------------

/// One table that failed during a keyspace operation.
#[derive(Debug, Clone)]
pub struct TableFailure {
    pub shard: ShardId,
    pub table: String,
    pub error: String,
}

/// Aggregated outcome of a keyspace operation. All shards have quiesced by
/// the time this is returned.
#[derive(Debug, Clone)]
pub struct OpReport {
    pub op: OpKind,
    pub keyspace: String,
    pub failures: Vec<TableFailure>,
    pub offstrategy_needed: bool,
    pub scrub: ScrubStats,
}

impl OpReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// CLI mapping: zero on full success, non-zero on any per-table failure.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// First per-table error, surfaced after every sibling finished.
    pub fn first_failure(&self) -> Option<&TableFailure> {
        self.failures.first()
    }
}

/// Optional knobs for [`Database::run_op`].
#[derive(Clone, Default)]
pub struct OpOptions {
    pub scrub_mode: Option<ScrubMode>,
    pub include_all_versions: bool,
    pub deadline: Option<Instant>,
    pub abort: Option<AbortHandle>,
}

// ------------------------------------------------------------------------------------------------
// Database
// ------------------------------------------------------------------------------------------------

/// The engine-wide handle owning shard actors and topology.
pub struct Database {
    pub(crate) config: DatabaseConfig,
    pub(crate) shards: ShardPool,
    pub(crate) manager: Arc<CompactionManager>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) sharder: Arc<dyn Sharder>,
    pub(crate) opener: Arc<dyn SstableOpener>,
    pub(crate) topology: Mutex<BTreeMap<String, KeyspaceMeta>>,
    next_table_id: AtomicU64,
}

impl Database {
    /// Opens a database rooted at `config.data_dir`.
    ///
    /// The runner, sharder and opener are the environment seams: the merge
    /// machinery, the shard geometry, and the on-disk metadata reader.
    pub fn open(
        config: DatabaseConfig,
        runner: Arc<dyn CompactionRunner>,
        sharder: Arc<dyn Sharder>,
        opener: Arc<dyn SstableOpener>,
    ) -> Result<Self, CompactionError> {
        fs::create_dir_all(&config.data_dir)?;
        let shards = ShardPool::new(config.shard_count)?;
        let manager = Arc::new(CompactionManager::new(runner, config.manager.clone()));
        info!(
            data_dir = %config.data_dir.display(),
            shard_count = shards.shard_count(),
            "database open"
        );
        Ok(Database {
            config,
            shards,
            manager,
            registry: Arc::new(TaskRegistry::new()),
            sharder,
            opener,
            topology: Mutex::new(BTreeMap::new()),
            next_table_id: AtomicU64::new(0),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.shard_count()
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.manager.stats()
    }

    /// Directory holding one table's runs.
    pub fn table_dir(&self, keyspace: &str, table: &str) -> PathBuf {
        self.config.data_dir.join(keyspace).join(table)
    }

    fn topology_lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, KeyspaceMeta>> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --------------------------------------------------------------------------------------------
    // Topology
    // --------------------------------------------------------------------------------------------

    /// Creates a table on every shard. Option problems are fatal here,
    /// before anything starts.
    pub fn create_table(
        &self,
        schema: TableSchema,
        options: &BTreeMap<String, String>,
    ) -> Result<TableId, CompactionError> {
        let parsed = StrategyOptions::parse(options)?;
        let id = self.next_table_id.fetch_add(1, Ordering::SeqCst) + 1;
        let generations = Arc::new(AtomicU64::new(0));

        fs::create_dir_all(self.table_dir(&schema.keyspace, &schema.name))?;

        let keyspace = schema.keyspace.clone();
        let name = schema.name.clone();
        let strategy = parsed.kind.name();
        self.shards.submit_all(move |state| {
            state.tables.insert(
                id,
                TableState::new(schema.clone(), parsed.clone(), Arc::clone(&generations)),
            );
        })?;

        let mut topology = self.topology_lock();
        let meta = topology.entry(keyspace.clone()).or_insert_with(|| KeyspaceMeta {
            tables: Vec::new(),
            owned_ranges: None,
        });
        meta.tables.push(TableMeta {
            id,
            name: name.clone(),
        });
        info!(keyspace = %keyspace, table = %name, strategy, "table created");
        Ok(id)
    }

    /// Drops a table everywhere. In-flight per-table ops observe the absence
    /// and skip with a warning.
    pub fn drop_table(&self, keyspace: &str, table: &str) -> Result<(), CompactionError> {
        let id = {
            let mut topology = self.topology_lock();
            let meta = topology
                .get_mut(keyspace)
                .ok_or_else(|| CompactionError::NoSuchKeyspace(keyspace.to_string()))?;
            let idx = meta
                .tables
                .iter()
                .position(|t| t.name == table)
                .ok_or_else(|| CompactionError::TableDropped {
                    keyspace: keyspace.to_string(),
                    table: table.to_string(),
                })?;
            meta.tables.remove(idx).id
        };
        self.shards.submit_all(move |state| {
            state.tables.remove(&id);
        })?;
        info!(keyspace, table, "table dropped");
        Ok(())
    }

    /// Declares the key ranges this node owns in a keyspace; cleanup and
    /// reshard-with-cleanup drop data outside them.
    pub fn set_owned_ranges(&self, keyspace: &str, ranges: OwnedRanges) {
        let mut topology = self.topology_lock();
        let meta = topology.entry(keyspace.to_string()).or_insert_with(|| KeyspaceMeta {
            tables: Vec::new(),
            owned_ranges: None,
        });
        meta.owned_ranges = Some(Arc::new(ranges));
    }

    pub(crate) fn owned_ranges(&self, keyspace: &str) -> Option<Arc<OwnedRanges>> {
        self.topology_lock()
            .get(keyspace)
            .and_then(|m| m.owned_ranges.clone())
    }

    /// Resolves a keyspace operation's table list; an empty filter means
    /// every table in the keyspace.
    pub(crate) fn resolve_tables(
        &self,
        keyspace: &str,
        tables: &[&str],
    ) -> Result<Vec<(TableId, String)>, CompactionError> {
        let topology = self.topology_lock();
        let meta = topology
            .get(keyspace)
            .ok_or_else(|| CompactionError::NoSuchKeyspace(keyspace.to_string()))?;
        if tables.is_empty() {
            return Ok(meta
                .tables
                .iter()
                .map(|t| (t.id, t.name.clone()))
                .collect());
        }
        tables
            .iter()
            .map(|name| {
                meta.tables
                    .iter()
                    .find(|t| t.name == *name)
                    .map(|t| (t.id, t.name.clone()))
                    .ok_or_else(|| CompactionError::TableDropped {
                        keyspace: keyspace.to_string(),
                        table: name.to_string(),
                    })
            })
            .collect()
    }

    pub(crate) fn table_id(
        &self,
        keyspace: &str,
        table: &str,
    ) -> Result<TableId, CompactionError> {
        Ok(self.resolve_tables(keyspace, &[table])?[0].0)
    }

    // --------------------------------------------------------------------------------------------
    // Run ingestion and introspection
    // --------------------------------------------------------------------------------------------

    /// Adds an unshared run to its owner shard's main set; the normal path
    /// for flush outputs. Shared runs must go through the loader.
    pub fn add_sorted_run(
        &self,
        keyspace: &str,
        table: &str,
        run: SortedRun,
    ) -> Result<(), CompactionError> {
        let id = self.table_id(keyspace, table)?;
        let Some(owner) = run.natural_owner() else {
            return Err(CompactionError::InvariantViolation(format!(
                "run generation {} is shared; it must be resharded by the loader",
                run.generation
            )));
        };
        let keyspace = keyspace.to_string();
        let table = table.to_string();
        self.shards.submit_to(owner, move |state| {
            let state_table = state
                .tables
                .get_mut(&id)
                .ok_or(CompactionError::TableDropped { keyspace, table })?;
            state_table.ensure_generation_at_least(run.generation);
            state_table.replace_sstables(&[], &[Arc::new(run)])
        })?
    }

    /// Summed backlog of one table across shards. Infinite when any shard's
    /// tracker is disabled.
    pub fn table_backlog(&self, keyspace: &str, table: &str) -> Result<f64, CompactionError> {
        let id = self.table_id(keyspace, table)?;
        let per_shard = self.shards.submit_all(move |state| {
            state.tables.get(&id).map(TableState::backlog).unwrap_or(0.0)
        })?;
        Ok(per_shard.into_iter().sum())
    }

    /// Summed pending-compaction estimate of one table across shards.
    pub fn pending_compactions(
        &self,
        keyspace: &str,
        table: &str,
    ) -> Result<i64, CompactionError> {
        let id = self.table_id(keyspace, table)?;
        let per_shard = self.shards.submit_all(move |state| {
            state
                .tables
                .get(&id)
                .map(TableState::pending_compactions)
                .unwrap_or(0)
        })?;
        Ok(per_shard.into_iter().sum())
    }

    /// Per-table run counts and sizes, summed across shards.
    pub fn table_stats(&self, keyspace: &str, table: &str) -> Result<TableStats, CompactionError> {
        let id = self.table_id(keyspace, table)?;
        let per_shard = self.shards.submit_all(move |state| {
            state
                .tables
                .get(&id)
                .map(|t| TableStats {
                    main_runs: t.set().main_len(),
                    maintenance_runs: t.set().maintenance_len(),
                    shared_runs: t.set().main_runs().filter(|sr| sr.is_shared()).count(),
                    total_bytes: t.live_disk_space_used(),
                    backlog: t.backlog(),
                })
                .unwrap_or_default()
        })?;
        Ok(per_shard.into_iter().fold(TableStats::default(), |mut acc, s| {
            acc.main_runs += s.main_runs;
            acc.maintenance_runs += s.maintenance_runs;
            acc.shared_runs += s.shared_runs;
            acc.total_bytes += s.total_bytes;
            acc.backlog += s.backlog;
            acc
        }))
    }

    /// Runs one strategy-selected compaction round on every shard. Returns
    /// whether any shard had work.
    pub fn maybe_compact(&self, keyspace: &str, table: &str) -> Result<bool, CompactionError> {
        let id = self.table_id(keyspace, table)?;
        let manager = Arc::clone(&self.manager);
        let now = now_micros();
        let results = self.shards.submit_all(move |state| {
            let Some(table) = state.tables.get_mut(&id) else {
                return Ok(false);
            };
            let descriptor = table.select_compaction(now);
            if descriptor.is_empty() {
                return Ok(false);
            }
            let ctx = JobContext::new(AbortHandle::new());
            manager
                .run_table_compaction(table, descriptor, JobKind::Regular, &ctx)
                .map(|_| true)
        })?;
        let mut compacted = false;
        for result in results {
            compacted |= result?;
        }
        Ok(compacted)
    }

    // --------------------------------------------------------------------------------------------
    // Keyspace operations
    // --------------------------------------------------------------------------------------------

    /// Runs a keyspace operation over the task tree: one shard op per shard
    /// in parallel; table ops per the operation's ordering rule.
    pub fn run_op(
        &self,
        op: OpKind,
        keyspace: &str,
        tables: &[&str],
        opts: OpOptions,
    ) -> Result<OpReport, CompactionError> {
        if op == OpKind::Reshard {
            return self.reshard_op(keyspace, tables, opts);
        }
        let table_list = self.resolve_tables(keyspace, tables)?;
        let abort = opts.abort.unwrap_or_default();
        let parent_task = self.registry.start(None, None, keyspace, None, op);
        debug!(keyspace, %op, tables = table_list.len(), "starting keyspace operation");

        let spec = ShardOpSpec {
            op,
            keyspace: keyspace.to_string(),
            tables: table_list,
            parent_task,
            include_all_versions: opts.include_all_versions,
        };
        let manager = Arc::clone(&self.manager);
        let registry = Arc::clone(&self.registry);
        let owned_ranges = self.owned_ranges(keyspace);
        let scrub_mode = opts.scrub_mode;
        let deadline = opts.deadline;
        let abort_for_shards = abort.clone();

        let outcomes = self.shards.submit_all(move |state| {
            let ctx = JobContext {
                abort: abort_for_shards.child(),
                deadline,
                scrub_mode,
                owned_ranges: owned_ranges.clone(),
            };
            run_shard_op(state, &manager, &registry, &spec, &ctx)
        })?;

        // All shards have quiesced; aggregate and surface.
        let mut report = OpReport {
            op,
            keyspace: keyspace.to_string(),
            failures: Vec::new(),
            offstrategy_needed: false,
            scrub: ScrubStats::default(),
        };
        let mut cancelled = false;
        for outcome in outcomes {
            report.offstrategy_needed |= outcome.offstrategy_needed;
            report.scrub += outcome.scrub;
            for (table, error) in outcome.failed_tables {
                report.failures.push(TableFailure {
                    shard: outcome.shard,
                    table,
                    error,
                });
            }
            if matches!(outcome.first_error, Some(CompactionError::Stopped(_))) {
                cancelled = true;
            }
        }

        if cancelled {
            self.registry.finish(parent_task, TaskState::Aborted);
            return Err(CompactionError::Stopped("operation aborted"));
        }
        let terminal = match report.first_failure() {
            Some(failure) => TaskState::Failed(failure.error.clone()),
            None => TaskState::Done,
        };
        self.registry.finish(parent_task, terminal);
        info!(
            keyspace,
            %op,
            failures = report.failures.len(),
            "keyspace operation finished"
        );
        Ok(report)
    }

    /// `compact <ks> [tables...]` — major compaction, smallest table first
    /// per shard.
    pub fn compact_keyspace(
        &self,
        keyspace: &str,
        tables: &[&str],
    ) -> Result<OpReport, CompactionError> {
        self.run_op(OpKind::Major, keyspace, tables, OpOptions::default())
    }

    /// `cleanup <ks> [tables...]` — drop out-of-range data, smallest table
    /// first per shard.
    pub fn cleanup_keyspace(
        &self,
        keyspace: &str,
        tables: &[&str],
    ) -> Result<OpReport, CompactionError> {
        self.run_op(OpKind::Cleanup, keyspace, tables, OpOptions::default())
    }

    /// Absorbs maintenance-set runs into the main set. The report says
    /// whether any table actually needed it.
    pub fn offstrategy_keyspace(
        &self,
        keyspace: &str,
        tables: &[&str],
    ) -> Result<OpReport, CompactionError> {
        self.run_op(OpKind::Offstrategy, keyspace, tables, OpOptions::default())
    }

    /// `upgradesstables <ks> [tables...] [--include-all-sstables]`.
    pub fn upgrade_sstables(
        &self,
        keyspace: &str,
        tables: &[&str],
        include_all: bool,
    ) -> Result<OpReport, CompactionError> {
        self.run_op(
            OpKind::Upgrade,
            keyspace,
            tables,
            OpOptions {
                include_all_versions: include_all,
                ..OpOptions::default()
            },
        )
    }

    /// `scrub <ks> [tables...] [--mode ...]`.
    pub fn scrub_keyspace(
        &self,
        keyspace: &str,
        tables: &[&str],
        mode: ScrubMode,
    ) -> Result<OpReport, CompactionError> {
        self.run_op(
            OpKind::Scrub,
            keyspace,
            tables,
            OpOptions {
                scrub_mode: Some(mode),
                ..OpOptions::default()
            },
        )
    }

    /// Repeated layout repair until every strategy is satisfied.
    pub fn reshape_keyspace(
        &self,
        keyspace: &str,
        tables: &[&str],
    ) -> Result<OpReport, CompactionError> {
        self.run_op(OpKind::Reshape, keyspace, tables, OpOptions::default())
    }

    /// Splits shared runs into per-shard disjoint ones, rebalancing by total
    /// size. Implemented by the loader pipeline over the live sets.
    fn reshard_op(
        &self,
        keyspace: &str,
        tables: &[&str],
        opts: OpOptions,
    ) -> Result<OpReport, CompactionError> {
        let table_list = self.resolve_tables(keyspace, tables)?;
        let abort = opts.abort.unwrap_or_default();
        let parent_task = self
            .registry
            .start(None, None, keyspace, None, OpKind::Reshard);
        let mut report = OpReport {
            op: OpKind::Reshard,
            keyspace: keyspace.to_string(),
            failures: Vec::new(),
            offstrategy_needed: false,
            scrub: ScrubStats::default(),
        };
        for (table_id, name) in table_list {
            match self.reshard_table_sets(keyspace, table_id, &name, &abort) {
                Ok(_) => {}
                Err(e @ CompactionError::Stopped(_)) => {
                    self.registry.finish(parent_task, TaskState::Aborted);
                    return Err(e);
                }
                Err(e) => {
                    report.failures.push(TableFailure {
                        shard: 0,
                        table: name,
                        error: e.to_string(),
                    });
                }
            }
        }
        let terminal = match report.first_failure() {
            Some(failure) => TaskState::Failed(failure.error.clone()),
            None => TaskState::Done,
        };
        self.registry.finish(parent_task, terminal);
        Ok(report)
    }
}

/// Per-table run counts and sizes.
#[derive(Debug, Clone, Default)]
pub struct TableStats {
    pub main_runs: usize,
    pub maintenance_runs: usize,
    pub shared_runs: usize,
    pub total_bytes: u64,
    pub backlog: f64,
}
