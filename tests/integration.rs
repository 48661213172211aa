//! End-to-end scenarios through the public API: a database with synthetic
//! runner/sharder/opener seams, exercising selection, keyspace operations
//! and the loader pipeline.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use meridiandb::compaction::CompactionError;
use meridiandb::engine::{Database, DatabaseConfig};
use meridiandb::loader::{Sharder, SstableOpener, SubDir};
use meridiandb::manager::{CompactionRequest, CompactionRunner, ManagerConfig, ScrubMode};
use meridiandb::sstable::{
    Component, ComponentDescriptor, RunId, ShardId, SortedRun, SstOrigin, TombstoneStats,
};
use meridiandb::table::{CompactionJobRecord, TableSchema};

const MIB: u64 = 1024 * 1024;
const DAY_US: i64 = 86_400 * 1_000_000;

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_micros() as i64
}

fn base_run(generation: u64, data_size: u64) -> SortedRun {
    SortedRun {
        generation,
        data_size,
        level: 0,
        run_id: RunId::new(),
        min_timestamp: 0,
        max_timestamp: 1_000,
        origin: SstOrigin::Flush,
        tombstones: TombstoneStats::none(),
        owning_shards: vec![0],
        first_key: b"a".to_vec(),
        last_key: b"z".to_vec(),
        written_at: 0,
        version: "me".to_string(),
    }
}

/// Metadata-level merge: sums inputs, splits per owner when resharding.
struct MergeRunner;

impl CompactionRunner for MergeRunner {
    fn run(
        &self,
        request: &CompactionRequest<'_>,
        progress: &mut CompactionJobRecord,
    ) -> Result<Vec<SortedRun>, CompactionError> {
        let descriptor = &request.descriptor;
        for (index, input) in descriptor.inputs.iter().enumerate() {
            request.check_abort()?;
            progress.set_compacted(index, input.data_size);
        }
        let total: u64 = descriptor.inputs.iter().map(|sr| sr.data_size).sum();
        if total == 0 {
            return Ok(Vec::new());
        }
        let template = |generation: u64, data_size: u64, owner: ShardId| SortedRun {
            generation,
            data_size,
            level: descriptor.target_level,
            run_id: descriptor.run_id,
            min_timestamp: descriptor
                .inputs
                .iter()
                .map(|sr| sr.min_timestamp)
                .min()
                .unwrap_or(0),
            max_timestamp: descriptor
                .inputs
                .iter()
                .map(|sr| sr.max_timestamp)
                .max()
                .unwrap_or(0),
            origin: SstOrigin::Compaction,
            tombstones: TombstoneStats::none(),
            owning_shards: vec![owner],
            first_key: descriptor
                .inputs
                .iter()
                .map(|sr| sr.first_key.clone())
                .min()
                .unwrap_or_default(),
            last_key: descriptor
                .inputs
                .iter()
                .map(|sr| sr.last_key.clone())
                .max()
                .unwrap_or_default(),
            written_at: 0,
            version: request.schema.current_version.clone(),
        };

        let mut owners: Vec<ShardId> = descriptor
            .inputs
            .iter()
            .flat_map(|sr| sr.owning_shards.iter().copied())
            .collect();
        owners.sort_unstable();
        owners.dedup();

        let outputs = if descriptor.reshard || owners.len() > 1 {
            owners
                .iter()
                .map(|owner| {
                    template(request.next_generation(), (total / owners.len() as u64).max(1), *owner)
                })
                .collect()
        } else {
            vec![template(request.next_generation(), total, owners[0])]
        };
        for output in &outputs {
            progress.add_written(output.data_size);
        }
        Ok(outputs)
    }
}

/// First key byte picks the shard; a multi-shard byte range means shared.
struct FirstByteSharder;

impl Sharder for FirstByteSharder {
    fn owning_shards(&self, first_key: &[u8], last_key: &[u8], shard_count: usize) -> Vec<ShardId> {
        let lo = first_key.first().copied().unwrap_or(0);
        let hi = last_key.first().copied().unwrap_or(lo).max(lo);
        let mut owners: Vec<ShardId> = (lo..=hi).map(|b| b as usize % shard_count).collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }
}

/// TOC contents: `key=value` lines for size and key range.
struct TocOpener;

impl SstableOpener for TocOpener {
    fn open(
        &self,
        toc_path: &Path,
        descriptor: &ComponentDescriptor,
    ) -> Result<SortedRun, CompactionError> {
        let text = fs::read_to_string(toc_path)?;
        let mut sr = base_run(descriptor.generation, MIB);
        sr.version = descriptor.version.clone();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (key, value) = line.split_once('=').ok_or(CompactionError::Corruption {
                generation: descriptor.generation,
                reason: format!("bad TOC line: {line}"),
            })?;
            match key {
                "size" => sr.data_size = value.parse().unwrap_or(MIB),
                "first" => sr.first_key = value.as_bytes().to_vec(),
                "last" => sr.last_key = value.as_bytes().to_vec(),
                _ => {}
            }
        }
        Ok(sr)
    }
}

fn open_db(root: &Path, shard_count: usize) -> Database {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Database::open(
        DatabaseConfig {
            data_dir: root.join("data"),
            shard_count,
            manager: ManagerConfig::default(),
        },
        Arc::new(MergeRunner),
        Arc::new(FirstByteSharder),
        Arc::new(TocOpener),
    )
    .unwrap()
}

fn add_runs(db: &Database, table: &str, sizes_mib: &[u64]) {
    for (i, size) in sizes_mib.iter().enumerate() {
        let mut sr = base_run(i as u64 + 1, size * MIB);
        sr.owning_shards = vec![0];
        db.add_sorted_run("ks", table, sr).unwrap();
    }
}

/// # Scenario
/// The canonical size-tiered pick through the whole stack.
///
/// # Starting environment
/// Runs sized `[10, 11, 12, 13, 100, 1000]` MiB on one shard.
///
/// # Expected behavior
/// One round merges the four small runs; the outliers survive; a second
/// round finds nothing.
#[test]
fn size_tiered_pick_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_db(tmp.path(), 2);
    db.create_table(TableSchema::new("ks", "events"), &BTreeMap::new())
        .unwrap();
    add_runs(&db, "events", &[10, 11, 12, 13, 100, 1000]);

    let backlog_before = db.table_backlog("ks", "events").unwrap();
    assert!(backlog_before > 0.0);

    assert!(db.maybe_compact("ks", "events").unwrap());
    let stats = db.table_stats("ks", "events").unwrap();
    assert_eq!(stats.main_runs, 3, "merged small bucket plus two outliers");
    assert_eq!(stats.total_bytes, 1146 * MIB);
    assert!(db.table_backlog("ks", "events").unwrap() <= backlog_before);

    assert!(!db.maybe_compact("ks", "events").unwrap());
}

/// With dissimilar sizes there is nothing to do at all.
#[test]
fn size_tiered_noop_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_db(tmp.path(), 2);
    db.create_table(TableSchema::new("ks", "events"), &BTreeMap::new())
        .unwrap();
    add_runs(&db, "events", &[10, 100, 1000]);

    assert!(!db.maybe_compact("ks", "events").unwrap());
    assert_eq!(db.table_stats("ks", "events").unwrap().main_runs, 3);
}

/// # Scenario
/// A leveled table with an overflowing L0 merges it size-tiered first.
#[test]
fn leveled_l0_merge_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_db(tmp.path(), 2);
    let mut options = BTreeMap::new();
    options.insert("class".to_string(), "LeveledCompactionStrategy".to_string());
    db.create_table(TableSchema::new("ks", "events"), &options)
        .unwrap();
    add_runs(&db, "events", &[200, 200, 200, 200]);

    assert!(db.maybe_compact("ks", "events").unwrap());
    assert_eq!(db.table_stats("ks", "events").unwrap().main_runs, 1);
}

/// # Scenario
/// A time-window table collapses a sealed window and leaves the hot window
/// alone.
#[test]
fn time_window_old_window_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_db(tmp.path(), 2);
    let mut options = BTreeMap::new();
    options.insert(
        "class".to_string(),
        "TimeWindowCompactionStrategy".to_string(),
    );
    db.create_table(TableSchema::new("ks", "events"), &options)
        .unwrap();

    let now = now_us();
    let old_window = now - 3 * DAY_US;
    for (generation, max_ts) in [(1, old_window), (2, old_window + 1_000), (3, now)] {
        let mut sr = base_run(generation, 50 * MIB);
        sr.min_timestamp = max_ts - 500;
        sr.max_timestamp = max_ts;
        sr.owning_shards = vec![0];
        db.add_sorted_run("ks", "events", sr).unwrap();
    }

    assert!(db.maybe_compact("ks", "events").unwrap());
    let stats = db.table_stats("ks", "events").unwrap();
    assert_eq!(stats.main_runs, 2, "two old runs collapsed, hot run kept");

    assert!(!db.maybe_compact("ks", "events").unwrap());
}

/// # Scenario
/// `compact` over a keyspace: every table on every shard converges to one
/// run; the report maps to exit code 0.
#[test]
fn keyspace_major_compaction() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_db(tmp.path(), 2);
    for table in ["events", "metrics"] {
        db.create_table(TableSchema::new("ks", table), &BTreeMap::new())
            .unwrap();
        for shard in 0..2usize {
            for g in 0..3u64 {
                let mut sr = base_run(shard as u64 * 10 + g + 1, 64 * MIB);
                sr.owning_shards = vec![shard];
                db.add_sorted_run("ks", table, sr).unwrap();
            }
        }
    }

    let report = db.compact_keyspace("ks", &[]).unwrap();
    assert_eq!(report.exit_code(), 0);
    for table in ["events", "metrics"] {
        assert_eq!(db.table_stats("ks", table).unwrap().main_runs, 2);
    }
}

/// Scrub in validate mode touches nothing and still reports.
#[test]
fn keyspace_scrub_validate() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_db(tmp.path(), 2);
    db.create_table(TableSchema::new("ks", "events"), &BTreeMap::new())
        .unwrap();
    add_runs(&db, "events", &[10, 20]);

    let report = db.scrub_keyspace("ks", &[], ScrubMode::Validate).unwrap();
    assert!(report.is_success());
    assert_eq!(report.scrub.scrubbed, 2);
    assert_eq!(db.table_stats("ks", "events").unwrap().main_runs, 2);
}

/// # Scenario
/// `refresh` brings uploaded runs online: the shared one is resharded into
/// per-owner disjoint outputs, nothing stays shared, and the loaded runs
/// are readable.
#[test]
fn refresh_upload_pipeline() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_db(tmp.path(), 2);
    db.create_table(TableSchema::new("ks", "events"), &BTreeMap::new())
        .unwrap();

    let upload = db.table_dir("ks", "events").join(SubDir::Upload.dirname());
    fs::create_dir_all(&upload).unwrap();
    let write_run = |generation: u64, contents: &str| {
        let descriptor = ComponentDescriptor {
            keyspace: "ks".to_string(),
            table: "events".to_string(),
            version: "me".to_string(),
            generation,
            format: "big".to_string(),
        };
        fs::write(upload.join(descriptor.filename(Component::Data)), b"data").unwrap();
        fs::write(upload.join(descriptor.filename(Component::Toc)), contents).unwrap();
    };
    // Key range a..b spans both shards: must be resharded.
    write_run(1, "size=104857600\nfirst=a\nlast=b\n");
    write_run(2, "size=10485760\nfirst=a\nlast=a\n");

    let loaded = db.refresh("ks", "events").unwrap();
    assert_eq!(loaded, 3, "one unshared plus one output per owner");

    let stats = db.table_stats("ks", "events").unwrap();
    assert_eq!(stats.main_runs, 3);
    assert_eq!(stats.shared_runs, 0);
}
