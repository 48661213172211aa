//! # Distributed Loader
//!
//! Brings on-disk sorted runs safely online. Given a directory of component
//! files, the pipeline runs in fixed stages:
//!
//! 1. **Scan & open** — every shard opens its slice of the TOC entries in
//!    parallel; each discovered run gets its owner set from the sharder.
//!    Runs with one owner are routed to that shard; the rest are **shared**
//!    and queued for resharding.
//! 2. **Reshard distribution** — the driver (coordinator) sorts shared runs
//!    by descending size and greedily assigns each to the owner shard with
//!    the smallest accumulated workload, ties broken by shard id.
//! 3. **Reshard execution** — each shard splits its slice into
//!    `⌈n / max_threshold⌉` near-equal jobs and compacts them through the
//!    manager's reshard gate; the sharder-aware merge emits per-shard
//!    disjoint outputs. Cleanup piggy-backs when owned ranges are supplied.
//! 4. **Reshape** — loop `reshape_job` → compact → collect until the
//!    strategy accepts the layout. A filter predicate lets boot exclude
//!    repair-origin runs.
//! 5. **Publish** — remaining unshared runs enter the table's main set (or
//!    the staging/quarantine maintenance set), and off-strategy absorption
//!    is triggered when allowed.
//!
//! The shards never talk to each other: the driver owns the distribution
//! state and workers receive their slices as immutable messages.

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::compaction::{
    CompactionDescriptor, CompactionError, DEFAULT_MAX_OUTPUT_SIZE, ReshapeMode, Strategy,
};
use crate::engine::Database;
use crate::manager::{JobContext, JobKind, OwnedRanges};
use crate::sstable::{
    Component, ComponentDescriptor, Generation, ShardId, SortedRun, SstOrigin,
};
use crate::table::{TableId, TableSchema};
use crate::tasks::AbortHandle;

// ------------------------------------------------------------------------------------------------
// Environment seams
// ------------------------------------------------------------------------------------------------

/// Shard geometry: maps a run's key range to the shards that must own it.
/// Supplied by the environment as a pure function.
pub trait Sharder: Send + Sync {
    fn owning_shards(&self, first_key: &[u8], last_key: &[u8], shard_count: usize) -> Vec<ShardId>;
}

/// Turns a discovered TOC entry into run metadata. The on-disk encoding is
/// not this subsystem's business; corrupt entries surface as
/// [`CompactionError::Corruption`].
pub trait SstableOpener: Send + Sync {
    fn open(
        &self,
        toc_path: &Path,
        descriptor: &ComponentDescriptor,
    ) -> Result<SortedRun, CompactionError>;
}

/// Per-table subdirectories of the on-disk layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDir {
    Base,
    Staging,
    Quarantine,
    Upload,
}

impl SubDir {
    pub fn dirname(&self) -> &'static str {
        match self {
            SubDir::Base => "",
            SubDir::Staging => "staging",
            SubDir::Quarantine => "quarantine",
            SubDir::Upload => "upload",
        }
    }

    fn path(&self, table_dir: &Path) -> PathBuf {
        match self {
            SubDir::Base => table_dir.to_path_buf(),
            _ => table_dir.join(self.dirname()),
        }
    }
}

/// One-shot boot configuration. Replaces any process-wide registry: the
/// caller decides up front which keyspaces populate first.
#[derive(Debug, Clone, Default)]
pub struct BootstrapConfig {
    load_priority: HashSet<String>,
}

impl BootstrapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_priority<I, S>(keyspaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BootstrapConfig {
            load_priority: keyspaces.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_load_priority(&self, keyspace: &str) -> bool {
        self.load_priority.contains(keyspace)
    }
}

/// Scan behavior knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessFlags {
    /// Force discovered runs to level 0; imports may overlap runs already
    /// sitting on higher levels.
    pub need_mutate_level: bool,
}

/// Predicate selecting which runs a reshape round may touch.
pub type RunFilter = Arc<dyn Fn(&SortedRun) -> bool + Send + Sync>;

fn accept_all() -> RunFilter {
    Arc::new(|_| true)
}

/// Where publish puts the surviving runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishTarget {
    /// Main set; repair-origin runs divert to off-strategy maintenance when
    /// allowed.
    Main { allow_offstrategy: bool },
    Staging,
    Quarantine,
}

// ------------------------------------------------------------------------------------------------
// Directory scanning
// ------------------------------------------------------------------------------------------------

fn verify_owner_and_mode(dir: &Path) -> Result<(), CompactionError> {
    let metadata = fs::metadata(dir)?;
    if !metadata.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotADirectory,
            format!("{} is not a directory", dir.display()),
        )
        .into());
    }
    if metadata.permissions().readonly() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{} is not writable", dir.display()),
        )
        .into());
    }
    Ok(())
}

/// Enumerates complete runs: a run exists once its TOC component does.
fn list_toc_entries(
    keyspace: &str,
    table: &str,
    dir: &Path,
) -> Result<Vec<(PathBuf, ComponentDescriptor)>, CompactionError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(Component::Toc.suffix()) {
            continue;
        }
        match ComponentDescriptor::parse(name) {
            Ok((descriptor, Component::Toc)) => {
                if descriptor.keyspace != keyspace || descriptor.table != table {
                    debug!(file = name, "skipping TOC for another table");
                    continue;
                }
                entries.push((path, descriptor));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(file = name, %e, "skipping unparsable TOC filename");
            }
        }
    }
    entries.sort_by_key(|(_, d)| d.generation);
    Ok(entries)
}

/// Moves every component of a corrupt run into the quarantine subdirectory.
fn move_components_to_quarantine(dir: &Path, descriptor: &ComponentDescriptor) {
    let quarantine = dir.join(SubDir::Quarantine.dirname());
    if let Err(e) = fs::create_dir_all(&quarantine) {
        warn!(%e, "failed to create quarantine directory");
        return;
    }
    for component in [
        Component::Data,
        Component::Index,
        Component::Filter,
        Component::Summary,
        Component::Statistics,
        // TOC last, so a crashed quarantine move never leaves a complete
        // run behind.
        Component::Toc,
    ] {
        let name = descriptor.filename(component);
        let from = dir.join(&name);
        if from.exists()
            && let Err(e) = fs::rename(&from, quarantine.join(&name))
        {
            warn!(file = %name, %e, "failed to quarantine component");
        }
    }
}

impl Database {
    /// Stage 1: open the directory on every shard in parallel. Entries are
    /// partitioned by generation so each is opened exactly once.
    fn scan_dir(
        &self,
        table_id: TableId,
        keyspace: &str,
        table: &str,
        dir: &Path,
        flags: ProcessFlags,
    ) -> Result<Vec<Arc<SortedRun>>, CompactionError> {
        verify_owner_and_mode(dir)?;
        let entries = Arc::new(list_toc_entries(keyspace, table, dir)?);
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let opener = Arc::clone(&self.opener);
        let sharder = Arc::clone(&self.sharder);
        let shard_count = self.shard_count();
        let dir_owned = dir.to_path_buf();
        let results = self.shards.submit_all(move |state| {
            let mut opened: Vec<Arc<SortedRun>> = Vec::new();
            for (path, descriptor) in entries
                .iter()
                .filter(|(_, d)| d.generation as usize % shard_count == state.shard)
            {
                match opener.open(path, descriptor) {
                    Ok(mut run) => {
                        run.generation = descriptor.generation;
                        run.version = descriptor.version.clone();
                        if flags.need_mutate_level {
                            run.level = 0;
                        }
                        run.owning_shards =
                            sharder.owning_shards(&run.first_key, &run.last_key, shard_count);
                        opened.push(Arc::new(run));
                    }
                    Err(e @ CompactionError::Corruption { .. }) => {
                        warn!(
                            file = %path.display(),
                            %e,
                            "corrupt run found while scanning; quarantining"
                        );
                        move_components_to_quarantine(&dir_owned, descriptor);
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(opened)
        })?;

        let mut runs = Vec::new();
        for result in results {
            runs.extend(result?);
        }

        // Future allocations must not collide with anything seen on disk.
        if let Some(max_generation) = runs.iter().map(|sr| sr.generation).max() {
            self.shards.submit_to(0, move |state| {
                if let Some(table) = state.tables.get(&table_id) {
                    table.ensure_generation_at_least(max_generation);
                }
            })?;
        }
        Ok(runs)
    }

    // --------------------------------------------------------------------------------------------
    // Full pipeline
    // --------------------------------------------------------------------------------------------

    /// Runs stages 1–5 over one directory and returns how many runs were
    /// published.
    #[allow(clippy::too_many_arguments)]
    fn load_dir(
        &self,
        table_id: TableId,
        keyspace: &str,
        table: &str,
        dir: &Path,
        flags: ProcessFlags,
        reshape_mode: ReshapeMode,
        filter: RunFilter,
        target: PublishTarget,
        fresh_generations: bool,
        owned_ranges: Option<Arc<OwnedRanges>>,
        abort: &AbortHandle,
    ) -> Result<usize, CompactionError> {
        let runs = self.scan_dir(table_id, keyspace, table, dir, flags)?;
        if runs.is_empty() {
            return Ok(0);
        }

        let shard_count = self.shard_count();
        let (mut per_shard, shared) = partition_by_owner(runs, shard_count);
        debug!(
            keyspace,
            table,
            unshared = per_shard.iter().map(Vec::len).sum::<usize>(),
            shared = shared.len(),
            "directory scan complete"
        );

        let plans = distribute_reshard_jobs(shared, shard_count);
        let outputs =
            self.run_reshard_jobs(table_id, keyspace, table, plans, owned_ranges, abort)?;
        for run in outputs {
            let owner = run.natural_owner().ok_or_else(|| {
                CompactionError::InvariantViolation(format!(
                    "reshard output generation {} is still shared",
                    run.generation
                ))
            })?;
            per_shard[owner].push(run);
        }

        let (per_shard, _reshaped) =
            self.run_reshape_jobs(table_id, keyspace, table, per_shard, reshape_mode, filter, abort)?;

        self.publish_runs(table_id, keyspace, table, per_shard, target, fresh_generations)
    }

    /// Stage 3: execute the reshard plans, one slice per shard.
    fn run_reshard_jobs(
        &self,
        table_id: TableId,
        keyspace: &str,
        table: &str,
        plans: Vec<ReshardPlan>,
        owned_ranges: Option<Arc<OwnedRanges>>,
        abort: &AbortHandle,
    ) -> Result<Vec<Arc<SortedRun>>, CompactionError> {
        let total: u64 = plans.iter().map(|p| p.total).sum();
        if total == 0 {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        info!(keyspace, table, total_bytes = total, "resharding");

        let plans = Arc::new(plans);
        let manager = Arc::clone(&self.manager);
        let abort = abort.clone();
        let keyspace_owned = keyspace.to_string();
        let table_owned = table.to_string();
        let results: Vec<Result<Vec<Arc<SortedRun>>, CompactionError>> =
            self.shards.submit_all(move |state| {
            let plan = &plans[state.shard];
            if plan.runs.is_empty() {
                return Ok::<Vec<Arc<SortedRun>>, CompactionError>(Vec::new());
            }
            let table_state = state.tables.get(&table_id).ok_or_else(|| {
                CompactionError::TableDropped {
                    keyspace: keyspace_owned.clone(),
                    table: table_owned.clone(),
                }
            })?;
            let schema = table_state.schema().clone();
            let generations = table_state.generation_source();
            let ctx = JobContext {
                abort: abort.child(),
                deadline: None,
                scrub_mode: None,
                owned_ranges: owned_ranges.clone(),
            };

            let mut outputs: Vec<Arc<SortedRun>> = Vec::new();
            for chunk in near_equal_jobs(&plan.runs, schema.max_compaction_threshold) {
                let mut descriptor =
                    CompactionDescriptor::new(chunk, 0, DEFAULT_MAX_OUTPUT_SIZE);
                descriptor.reshard = true;
                descriptor.cleanup = owned_ranges.is_some();
                outputs.extend(manager.run_detached_job(
                    &schema,
                    &generations,
                    descriptor,
                    JobKind::Reshard,
                    &ctx,
                )?);
            }
            Ok(outputs)
        })?;

        let mut outputs = Vec::new();
        for result in results {
            outputs.extend(result?);
        }
        info!(
            keyspace,
            table,
            total_bytes = total,
            elapsed_secs = start.elapsed().as_secs_f64(),
            "resharded"
        );
        Ok(outputs)
    }

    /// Stage 4: loop layout repair per shard until the strategy is content.
    #[allow(clippy::type_complexity)]
    fn run_reshape_jobs(
        &self,
        table_id: TableId,
        keyspace: &str,
        table: &str,
        per_shard: Vec<Vec<Arc<SortedRun>>>,
        mode: ReshapeMode,
        filter: RunFilter,
        abort: &AbortHandle,
    ) -> Result<(Vec<Vec<Arc<SortedRun>>>, u64), CompactionError> {
        let start = Instant::now();
        let input = Arc::new(per_shard);
        let manager = Arc::clone(&self.manager);
        let abort = abort.clone();
        let keyspace_owned = keyspace.to_string();
        let table_owned = table.to_string();
        let results: Vec<Result<(Vec<Arc<SortedRun>>, u64), CompactionError>> =
            self.shards.submit_all(move |state| {
            let mut local: Vec<Arc<SortedRun>> = input[state.shard].clone();
            let table_state = state.tables.get(&table_id).ok_or_else(|| {
                CompactionError::TableDropped {
                    keyspace: keyspace_owned.clone(),
                    table: table_owned.clone(),
                }
            })?;
            let strategy: Strategy = table_state.strategy().clone();
            let schema: TableSchema = table_state.schema().clone();
            let generations = table_state.generation_source();
            let ctx = JobContext::new(abort.child());

            let mut reshaped = 0u64;
            loop {
                if ctx.check().is_err() {
                    break;
                }
                let candidates: Vec<Arc<SortedRun>> =
                    local.iter().filter(|sr| filter(sr)).cloned().collect();
                let descriptor = strategy.reshape_job(candidates, &schema, mode);
                if descriptor.is_empty() {
                    break;
                }
                if reshaped == 0 {
                    info!(
                        keyspace = %schema.keyspace,
                        table = %schema.name,
                        strategy = strategy.name(),
                        "runs need reshape; starting reshape process"
                    );
                }
                let inputs: HashSet<Generation> =
                    descriptor.inputs.iter().map(|sr| sr.generation).collect();
                let input_bytes = descriptor.total_input_size();
                match manager.run_detached_job(
                    &schema,
                    &generations,
                    descriptor,
                    JobKind::Reshape,
                    &ctx,
                ) {
                    Ok(outputs) => {
                        local.retain(|sr| !inputs.contains(&sr.generation));
                        local.extend(outputs);
                        reshaped += input_bytes;
                    }
                    Err(CompactionError::Stopped(_)) => {
                        info!(
                            keyspace = %schema.keyspace,
                            table = %schema.name,
                            "reshape successfully aborted"
                        );
                        break;
                    }
                    Err(e) => {
                        info!(
                            keyspace = %schema.keyspace,
                            table = %schema.name,
                            %e,
                            "reshape failed"
                        );
                        break;
                    }
                }
            }
            Ok((local, reshaped))
        })?;

        let mut per_shard = Vec::with_capacity(results.len());
        let mut reshaped_total = 0u64;
        for result in results {
            let (local, reshaped) = result?;
            per_shard.push(local);
            reshaped_total += reshaped;
        }
        if reshaped_total > 0 {
            info!(
                keyspace,
                table,
                reshaped_bytes = reshaped_total,
                elapsed_secs = start.elapsed().as_secs_f64(),
                "reshaped"
            );
        }
        Ok((per_shard, reshaped_total))
    }

    /// Stage 5: make the runs visible.
    fn publish_runs(
        &self,
        table_id: TableId,
        keyspace: &str,
        table: &str,
        per_shard: Vec<Vec<Arc<SortedRun>>>,
        target: PublishTarget,
        fresh_generations: bool,
    ) -> Result<usize, CompactionError> {
        let input = Arc::new(per_shard);
        let keyspace_owned = keyspace.to_string();
        let table_owned = table.to_string();
        let results: Vec<Result<usize, CompactionError>> = self.shards.submit_all(move |state| {
            let table_state = state.tables.get_mut(&table_id).ok_or_else(|| {
                CompactionError::TableDropped {
                    keyspace: keyspace_owned.clone(),
                    table: table_owned.clone(),
                }
            })?;
            let mut published = 0usize;
            for run in &input[state.shard] {
                let run = if fresh_generations {
                    let mut fresh = (**run).clone();
                    fresh.generation = table_state.next_generation();
                    Arc::new(fresh)
                } else {
                    table_state.ensure_generation_at_least(run.generation);
                    Arc::clone(run)
                };
                match target {
                    PublishTarget::Main { allow_offstrategy } => {
                        // Repair streams emit disjoint runs that ignore the
                        // strategy's layout; absorbing them off-strategy
                        // lets the node come online without reshaping first.
                        if allow_offstrategy && run.origin == SstOrigin::Repair {
                            table_state
                                .set_mut()
                                .add_maintenance(crate::sstable::MaintenanceKind::OffStrategy, run);
                        } else {
                            table_state.replace_sstables(&[], &[run])?;
                        }
                    }
                    PublishTarget::Staging => {
                        table_state
                            .set_mut()
                            .add_maintenance(crate::sstable::MaintenanceKind::Staging, run);
                    }
                    PublishTarget::Quarantine => {
                        table_state
                            .set_mut()
                            .add_maintenance(crate::sstable::MaintenanceKind::Quarantine, run);
                    }
                }
                published += 1;
            }
            Ok(published)
        })?;

        let mut published = 0usize;
        for result in results {
            published += result?;
        }
        Ok(published)
    }

    // --------------------------------------------------------------------------------------------
    // Public entry points
    // --------------------------------------------------------------------------------------------

    /// `refresh <ks> <table>`: reshard and reshape the `upload/`
    /// subdirectory, then publish with fresh generations. Cleanup
    /// piggy-backs on resharding when owned ranges are declared.
    pub fn refresh(&self, keyspace: &str, table: &str) -> Result<usize, CompactionError> {
        let table_id = self.table_id(keyspace, table)?;
        let dir = SubDir::Upload.path(&self.table_dir(keyspace, table));
        if !dir.is_dir() {
            info!(keyspace, table, "no upload directory; nothing to refresh");
            return Ok(0);
        }
        let abort = AbortHandle::new();
        let loaded = self.load_dir(
            table_id,
            keyspace,
            table,
            &dir,
            ProcessFlags {
                need_mutate_level: true,
            },
            ReshapeMode::Strict,
            accept_all(),
            PublishTarget::Main {
                allow_offstrategy: false,
            },
            true,
            self.owned_ranges(keyspace),
            &abort,
        )?;
        info!(keyspace, table, loaded, "loaded sorted runs");
        Ok(loaded)
    }

    /// Boot-time population of one table: staging, then quarantine (which
    /// may not exist), then the base directory. Only the base directory may
    /// hand runs to off-strategy compaction.
    pub fn populate_table(&self, keyspace: &str, table: &str) -> Result<usize, CompactionError> {
        let table_id = self.table_id(keyspace, table)?;
        let base = self.table_dir(keyspace, table);
        let abort = AbortHandle::new();
        let flags = ProcessFlags::default();
        let not_repair: RunFilter = Arc::new(|sr: &SortedRun| sr.origin != SstOrigin::Repair);
        let mut loaded = 0usize;

        for (subdir, target) in [
            (SubDir::Staging, PublishTarget::Staging),
            (SubDir::Quarantine, PublishTarget::Quarantine),
        ] {
            let dir = subdir.path(&base);
            if !dir.is_dir() {
                continue;
            }
            debug!(keyspace, table, subdir = subdir.dirname(), "populating subdirectory");
            loaded += self.load_dir(
                table_id,
                keyspace,
                table,
                &dir,
                flags,
                ReshapeMode::Relaxed,
                Arc::clone(&not_repair),
                target,
                false,
                None,
                &abort,
            )?;
        }

        loaded += self.load_dir(
            table_id,
            keyspace,
            table,
            &base,
            flags,
            ReshapeMode::Relaxed,
            Arc::clone(&not_repair),
            PublishTarget::Main {
                allow_offstrategy: true,
            },
            false,
            None,
            &abort,
        )?;

        let report = self.offstrategy_keyspace(keyspace, &[table])?;
        if report.offstrategy_needed {
            debug!(keyspace, table, "off-strategy compaction absorbed boot runs");
        }
        Ok(loaded)
    }

    /// Populates every table of a keyspace.
    pub fn populate_keyspace(&self, keyspace: &str) -> Result<usize, CompactionError> {
        info!(keyspace, "populating keyspace");
        let tables = self.resolve_tables(keyspace, &[])?;
        let mut loaded = 0usize;
        for (_, name) in tables {
            loaded += self.populate_table(keyspace, &name)?;
        }
        Ok(loaded)
    }

    /// Populates every known keyspace, load-priority keyspaces first.
    pub fn populate_all(&self, bootstrap: &BootstrapConfig) -> Result<usize, CompactionError> {
        let keyspaces: Vec<String> = {
            let topology = self.topology.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            topology.keys().cloned().collect()
        };
        let mut loaded = 0usize;
        for priority_pass in [true, false] {
            for keyspace in &keyspaces {
                if bootstrap.is_load_priority(keyspace) != priority_pass {
                    continue;
                }
                loaded += self.populate_keyspace(keyspace)?;
            }
        }
        Ok(loaded)
    }

    /// Keyspace `reshard` op over live sets: extract shared runs everywhere,
    /// distribute, execute, and land the outputs on their owner shards.
    pub(crate) fn reshard_table_sets(
        &self,
        keyspace: &str,
        table_id: TableId,
        table: &str,
        abort: &AbortHandle,
    ) -> Result<u64, CompactionError> {
        let extracted = self.shards.submit_all(move |state| {
            let Some(table_state) = state.tables.get_mut(&table_id) else {
                return Ok(Vec::new());
            };
            let shared: Vec<Arc<SortedRun>> = table_state
                .set()
                .main_runs()
                .filter(|sr| sr.is_shared())
                .cloned()
                .collect();
            if !shared.is_empty() {
                table_state.replace_sstables(&shared, &[])?;
            }
            Ok::<_, CompactionError>(shared)
        })?;

        let mut shared: Vec<Arc<SortedRun>> = Vec::new();
        let mut extracted_per_shard: Vec<Vec<Arc<SortedRun>>> = Vec::new();
        for result in extracted {
            let runs = result?;
            shared.extend(runs.iter().cloned());
            extracted_per_shard.push(runs);
        }
        if shared.is_empty() {
            return Ok(0);
        }
        let total: u64 = shared.iter().map(|sr| sr.data_size).sum();

        let plans = distribute_reshard_jobs(shared, self.shard_count());
        let outputs =
            match self.run_reshard_jobs(table_id, keyspace, table, plans, None, abort) {
                Ok(outputs) => outputs,
                Err(e) => {
                    // Put the extracted runs back where they were; the op
                    // failed but the table must stay complete.
                    let restore = Arc::new(extracted_per_shard);
                    let _ = self.shards.submit_all(move |state| {
                        if let Some(table_state) = state.tables.get_mut(&table_id) {
                            let runs = &restore[state.shard];
                            let _ = table_state.replace_sstables(&[], runs);
                        }
                    });
                    return Err(e);
                }
            };

        let mut outputs_per_shard: Vec<Vec<Arc<SortedRun>>> =
            vec![Vec::new(); self.shard_count()];
        for run in outputs {
            let owner = run.natural_owner().ok_or_else(|| {
                CompactionError::InvariantViolation(format!(
                    "reshard output generation {} is still shared",
                    run.generation
                ))
            })?;
            outputs_per_shard[owner].push(run);
        }
        let outputs_per_shard = Arc::new(outputs_per_shard);
        let keyspace_owned = keyspace.to_string();
        let table_owned = table.to_string();
        let results = self.shards.submit_all(move |state| {
            let table_state = state.tables.get_mut(&table_id).ok_or_else(|| {
                CompactionError::TableDropped {
                    keyspace: keyspace_owned.clone(),
                    table: table_owned.clone(),
                }
            })?;
            for run in &outputs_per_shard[state.shard] {
                table_state.ensure_generation_at_least(run.generation);
            }
            table_state.replace_sstables(&[], &outputs_per_shard[state.shard])
        })?;
        for result in results {
            result?;
        }
        Ok(total)
    }
}

// ------------------------------------------------------------------------------------------------
// Distribution helpers
// ------------------------------------------------------------------------------------------------

/// Reshard work assigned to one shard, with its accumulated size for
/// balancing.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReshardPlan {
    pub runs: Vec<Arc<SortedRun>>,
    pub total: u64,
}

/// Splits discovered runs into per-owner lists and the shared remainder.
fn partition_by_owner(
    runs: Vec<Arc<SortedRun>>,
    shard_count: usize,
) -> (Vec<Vec<Arc<SortedRun>>>, Vec<Arc<SortedRun>>) {
    let mut per_shard: Vec<Vec<Arc<SortedRun>>> = vec![Vec::new(); shard_count];
    let mut shared = Vec::new();
    for run in runs {
        match run.natural_owner() {
            Some(owner) if owner < shard_count => per_shard[owner].push(run),
            _ => shared.push(run),
        }
    }
    (per_shard, shared)
}

/// Stage 2: biggest runs first, each to the owner shard with the least
/// accumulated work, ties to the lowest shard id.
pub(crate) fn distribute_reshard_jobs(
    mut shared: Vec<Arc<SortedRun>>,
    shard_count: usize,
) -> Vec<ReshardPlan> {
    shared.sort_by(|a, b| {
        b.data_size
            .cmp(&a.data_size)
            .then_with(|| a.generation.cmp(&b.generation))
    });

    let mut plans: Vec<ReshardPlan> = vec![ReshardPlan::default(); shard_count];
    for run in shared {
        let destination = run
            .owning_shards
            .iter()
            .copied()
            .filter(|shard| *shard < shard_count)
            .min_by_key(|shard| (plans[*shard].total, *shard));
        match destination {
            Some(shard) => {
                plans[shard].total += run.data_size;
                plans[shard].runs.push(run);
            }
            None => {
                warn!(
                    generation = run.generation,
                    "shared run has no valid owner shard; skipping"
                );
            }
        }
    }
    plans
}

/// Splits runs into `⌈n / max_per_job⌉` jobs of near-equal count; leftovers
/// land in the last job.
fn near_equal_jobs(runs: &[Arc<SortedRun>], max_per_job: usize) -> Vec<Vec<Arc<SortedRun>>> {
    let max_per_job = max_per_job.max(1);
    let num_jobs = runs.len().div_ceil(max_per_job);
    if num_jobs == 0 {
        return Vec::new();
    }
    let per_job = runs.len() / num_jobs;
    let mut jobs: Vec<Vec<Arc<SortedRun>>> = vec![Vec::new()];
    for run in runs {
        if jobs
            .last()
            .is_some_and(|last| last.len() >= per_job && jobs.len() < num_jobs)
        {
            jobs.push(Vec::new());
        }
        if let Some(last) = jobs.last_mut() {
            last.push(Arc::clone(run));
        }
    }
    jobs
}
