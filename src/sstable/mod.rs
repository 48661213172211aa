//! # Sorted Runs
//!
//! Metadata model for **sorted runs** (SRs) — the immutable, sorted, on-disk
//! artifacts produced by flushes, compactions, repair streams and imports.
//! This subsystem never touches SR *data*; the on-disk encoding lives behind
//! the loader's opener seam. What it does own:
//!
//! - [`SortedRun`] — the per-run descriptor every strategy, tracker and task
//!   operates on (size, level, timestamps, run identity, owner shards,
//!   tombstone statistics).
//! - [`ComponentDescriptor`] — the `(keyspace, table, version, generation,
//!   format)` naming tuple for component files. An SR is complete on disk
//!   once its TOC component exists; the loader discovers SRs by TOC files.
//! - [`SortedRunSet`] — the per-table partition of SRs into the **main** set
//!   used for reads and a **maintenance** set (staging, quarantine,
//!   off-strategy), mutated only through atomic [`SortedRunSet::replace`].
//!
//! SRs are reference-shared (`Arc`): a reader scan, a background compaction
//! and the set may all hold a run concurrently. The file is only eligible for
//! deletion after the run has been removed from the set *and* every reference
//! is gone.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

/// Write timestamps, microseconds since the epoch.
pub type Timestamp = i64;

/// Monotonically-assigned per-table SR identifier.
pub type Generation = u64;

/// Index of a shard within the local shard group.
pub type ShardId = usize;

// ------------------------------------------------------------------------------------------------
// Run identity and origin
// ------------------------------------------------------------------------------------------------

/// Groups the SRs produced by a single compaction so they can be treated as
/// one logical unit by selection and reshape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    /// Allocates a fresh run identity.
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an SR came into existence. Loader and off-strategy policies key off
/// this (repair-origin runs bypass boot-time reshape, imports get level 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SstOrigin {
    Flush,
    Repair,
    Compaction,
    Import,
}

impl fmt::Display for SstOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SstOrigin::Flush => "memtable",
            SstOrigin::Repair => "repair",
            SstOrigin::Compaction => "compaction",
            SstOrigin::Import => "import",
        };
        f.write_str(s)
    }
}

// ------------------------------------------------------------------------------------------------
// Tombstone statistics
// ------------------------------------------------------------------------------------------------

/// Droppable-tombstone estimate for one SR.
///
/// Holds a coarse deletion-time histogram: each point `(deletion_time,
/// fraction)` says that `fraction` of the run's data becomes droppable once
/// the GC horizon passes `deletion_time`. The estimate at a given horizon is
/// the sum of fractions whose deletion time precedes it.
#[derive(Debug, Clone, Default)]
pub struct TombstoneStats {
    points: Vec<(Timestamp, f64)>,
}

impl TombstoneStats {
    /// A run with no droppable tombstones.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builds stats from `(deletion_time, fraction)` points.
    pub fn new(mut points: Vec<(Timestamp, f64)>) -> Self {
        points.sort_by_key(|(ts, _)| *ts);
        TombstoneStats { points }
    }

    /// Estimated droppable ratio once everything deleted before `gc_before`
    /// may be purged. Clamped to `[0, 1]`.
    pub fn droppable_ratio(&self, gc_before: Timestamp) -> f64 {
        let sum: f64 = self
            .points
            .iter()
            .take_while(|(ts, _)| *ts < gc_before)
            .map(|(_, frac)| frac)
            .sum();
        sum.clamp(0.0, 1.0)
    }
}

// ------------------------------------------------------------------------------------------------
// SortedRun
// ------------------------------------------------------------------------------------------------

/// Descriptor of one immutable sorted run.
///
/// Once materialized an SR never changes; replacement happens only through
/// [`SortedRunSet::replace`] with compaction outputs.
#[derive(Debug, Clone)]
pub struct SortedRun {
    /// Monotonically-assigned id, unique within the owning table.
    pub generation: Generation,

    /// Uncompressed data size in bytes. Runs with `data_size == 0` are
    /// skipped by both selection and backlog accounting.
    pub data_size: u64,

    /// Level in the leveled hierarchy; always 0 for size-tiered and
    /// time-window tables.
    pub level: u32,

    /// Identity of the compaction run that produced this SR.
    pub run_id: RunId,

    /// Smallest write timestamp contained in the run (µs).
    pub min_timestamp: Timestamp,

    /// Largest write timestamp contained in the run (µs). Time-window
    /// bucketing keys off this.
    pub max_timestamp: Timestamp,

    /// How the run came to exist.
    pub origin: SstOrigin,

    /// Droppable-tombstone estimate.
    pub tombstones: TombstoneStats,

    /// Shards that must each hold a replica of this run. More than one owner
    /// means the run is *shared* and must be resharded before normal
    /// operation.
    pub owning_shards: Vec<ShardId>,

    /// First partition key covered by the run (inclusive).
    pub first_key: Vec<u8>,

    /// Last partition key covered by the run (inclusive).
    pub last_key: Vec<u8>,

    /// Wall-clock time the data file was sealed (µs). Tombstone-only
    /// compaction ignores runs younger than the configured interval.
    pub written_at: Timestamp,

    /// On-disk format version tag (e.g. `"me"`). Lexicographic order matches
    /// release order.
    pub version: String,
}

impl SortedRun {
    /// True when more than one shard owns the run.
    pub fn is_shared(&self) -> bool {
        self.owning_shards.len() > 1
    }

    /// The single owner of an unshared run.
    pub fn natural_owner(&self) -> Option<ShardId> {
        match self.owning_shards.as_slice() {
            [owner] => Some(*owner),
            _ => None,
        }
    }

    /// Inclusive key-range intersection test.
    pub fn overlaps_key_range(&self, first: &[u8], last: &[u8]) -> bool {
        self.first_key.as_slice() <= last && first <= self.last_key.as_slice()
    }

    /// Inclusive key-range intersection with another run.
    pub fn overlaps(&self, other: &SortedRun) -> bool {
        self.overlaps_key_range(&other.first_key, &other.last_key)
    }

    /// Estimated fraction of the run droppable under the supplied GC horizon.
    pub fn estimate_droppable_tombstone_ratio(&self, gc_before: Timestamp) -> f64 {
        self.tombstones.droppable_ratio(gc_before)
    }
}

impl fmt::Display for SortedRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sr(gen={}, level={}, size={}, origin={})",
            self.generation, self.level, self.data_size, self.origin
        )
    }
}

// ------------------------------------------------------------------------------------------------
// On-disk component naming
// ------------------------------------------------------------------------------------------------

/// Component files that together form one on-disk SR.
///
/// The TOC is written last; its existence marks the run as complete, and the
/// loader enumerates runs by scanning for TOC files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Toc,
    Data,
    Index,
    Filter,
    Summary,
    Statistics,
}

impl Component {
    /// File suffix for this component.
    pub fn suffix(&self) -> &'static str {
        match self {
            Component::Toc => "TOC.txt",
            Component::Data => "Data.db",
            Component::Index => "Index.db",
            Component::Filter => "Filter.db",
            Component::Summary => "Summary.db",
            Component::Statistics => "Statistics.db",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        Some(match s {
            "TOC.txt" => Component::Toc,
            "Data.db" => Component::Data,
            "Index.db" => Component::Index,
            "Filter.db" => Component::Filter,
            "Summary.db" => Component::Summary,
            "Statistics.db" => Component::Statistics,
            _ => return None,
        })
    }
}

/// Identity tuple of an on-disk SR: `(keyspace, table, version, generation,
/// format)`. Component filenames are
/// `<keyspace>-<table>-<version>-<generation>-<format>-<suffix>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDescriptor {
    pub keyspace: String,
    pub table: String,
    pub version: String,
    pub generation: Generation,
    pub format: String,
}

/// Errors raised while parsing component filenames.
#[derive(Debug, Error)]
pub enum ComponentNameError {
    #[error("malformed component filename: {0}")]
    Malformed(String),

    #[error("unknown component suffix in {0}")]
    UnknownComponent(String),
}

impl ComponentDescriptor {
    /// Filename for the given component of this SR.
    pub fn filename(&self, component: Component) -> String {
        format!(
            "{}-{}-{}-{}-{}-{}",
            self.keyspace,
            self.table,
            self.version,
            self.generation,
            self.format,
            component.suffix()
        )
    }

    /// Parses a component filename back into `(descriptor, component)`.
    ///
    /// Keyspace and table names must not contain `-`; the loader rejects
    /// files that do not split into exactly six fields.
    pub fn parse(name: &str) -> Result<(ComponentDescriptor, Component), ComponentNameError> {
        let parts: Vec<&str> = name.splitn(6, '-').collect();
        let [keyspace, table, version, generation, format, suffix] = parts.as_slice() else {
            return Err(ComponentNameError::Malformed(name.to_string()));
        };
        let generation: Generation = generation
            .parse()
            .map_err(|_| ComponentNameError::Malformed(name.to_string()))?;
        let component = Component::from_suffix(suffix)
            .ok_or_else(|| ComponentNameError::UnknownComponent(name.to_string()))?;
        Ok((
            ComponentDescriptor {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
                version: version.to_string(),
                generation,
                format: format.to_string(),
            },
            component,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SortedRunSet
// ------------------------------------------------------------------------------------------------

/// Why a run sits in the maintenance set instead of the main set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    /// Loaded but awaiting view building before becoming readable.
    Staging,
    /// Moved aside after corruption was detected.
    Quarantine,
    /// Awaiting off-strategy absorption into the main set.
    OffStrategy,
}

/// Errors from set mutation. A failed `replace` means the caller and the set
/// disagree about membership, which is an engine invariant violation.
#[derive(Debug, Error)]
pub enum SortedRunSetError {
    #[error("replace: generation {0} is not in the main set")]
    MissingRun(Generation),

    #[error("replace: generation {0} is already in the main set")]
    DuplicateRun(Generation),
}

/// Per-table set of live sorted runs.
///
/// Partitioned into the **main** set consulted by reads and selection, and a
/// **maintenance** set for runs that must not participate in normal strategy
/// flow. The main set is mutated only via [`SortedRunSet::replace`], so a
/// strategy never observes a half-applied compaction result.
#[derive(Debug, Default)]
pub struct SortedRunSet {
    main: BTreeMap<Generation, Arc<SortedRun>>,
    maintenance: BTreeMap<Generation, (MaintenanceKind, Arc<SortedRun>)>,
}

impl SortedRunSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs in the main set, ascending generation order.
    pub fn main_runs(&self) -> impl Iterator<Item = &Arc<SortedRun>> {
        self.main.values()
    }

    /// Cloned snapshot of the main set.
    pub fn main_snapshot(&self) -> Vec<Arc<SortedRun>> {
        self.main.values().cloned().collect()
    }

    /// Runs in the maintenance set, optionally filtered by kind.
    pub fn maintenance_runs(&self, kind: Option<MaintenanceKind>) -> Vec<Arc<SortedRun>> {
        self.maintenance
            .values()
            .filter(|(k, _)| kind.is_none_or(|want| *k == want))
            .map(|(_, sr)| Arc::clone(sr))
            .collect()
    }

    pub fn main_len(&self) -> usize {
        self.main.len()
    }

    pub fn maintenance_len(&self) -> usize {
        self.maintenance.len()
    }

    /// Total bytes across both partitions; the orchestrator sorts tables by
    /// this before per-shard serialized operations.
    pub fn live_data_size(&self) -> u64 {
        let main: u64 = self.main.values().map(|sr| sr.data_size).sum();
        let maint: u64 = self.maintenance.values().map(|(_, sr)| sr.data_size).sum();
        main + maint
    }

    /// Atomically removes `old` and inserts `new` in the main set.
    ///
    /// `replace(&[], &[])` is a no-op. The whole call is validated before any
    /// mutation, so a failed replace leaves the set untouched.
    pub fn replace(
        &mut self,
        old: &[Arc<SortedRun>],
        new: &[Arc<SortedRun>],
    ) -> Result<(), SortedRunSetError> {
        for sr in old {
            if !self.main.contains_key(&sr.generation) {
                return Err(SortedRunSetError::MissingRun(sr.generation));
            }
        }
        for sr in new {
            let replaced = old.iter().any(|o| o.generation == sr.generation);
            if !replaced && self.main.contains_key(&sr.generation) {
                return Err(SortedRunSetError::DuplicateRun(sr.generation));
            }
        }
        for sr in old {
            self.main.remove(&sr.generation);
        }
        for sr in new {
            self.main.insert(sr.generation, Arc::clone(sr));
        }
        Ok(())
    }

    /// Adds a run to the maintenance set.
    pub fn add_maintenance(&mut self, kind: MaintenanceKind, sr: Arc<SortedRun>) {
        self.maintenance.insert(sr.generation, (kind, sr));
    }

    /// Removes and returns every maintenance run of the given kind.
    pub fn take_maintenance(&mut self, kind: MaintenanceKind) -> Vec<Arc<SortedRun>> {
        let generations: Vec<Generation> = self
            .maintenance
            .iter()
            .filter(|(_, (k, _))| *k == kind)
            .map(|(g, _)| *g)
            .collect();
        generations
            .into_iter()
            .filter_map(|g| self.maintenance.remove(&g))
            .map(|(_, sr)| sr)
            .collect()
    }

    /// Moves a main-set run into quarantine. Returns false when the
    /// generation is not present (already replaced by a racing compaction).
    pub fn quarantine(&mut self, generation: Generation) -> bool {
        match self.main.remove(&generation) {
            Some(sr) => {
                self.maintenance
                    .insert(generation, (MaintenanceKind::Quarantine, sr));
                true
            }
            None => false,
        }
    }
}
