//! Shared test fixtures: run builders and synthetic implementations of the
//! environment seams (runner, sharder, opener). Metadata-level only — the
//! simulated merge aggregates descriptor inputs into plausible outputs
//! without touching run data.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::compaction::options::TimestampResolution;
use crate::compaction::time_window::{to_resolution, window_lower_bound};
use crate::compaction::{CompactionError, OutputShaping};
use crate::loader::{Sharder, SstableOpener};
use crate::manager::{CompactionRequest, CompactionRunner};
use crate::sstable::{
    Component, ComponentDescriptor, Generation, RunId, ShardId, SortedRun, SstOrigin, Timestamp,
    TombstoneStats,
};
use crate::table::CompactionJobRecord;

pub(crate) const MIB: u64 = 1024 * 1024;

/// One microsecond day, handy for time-window tests.
pub(crate) const DAY_US: i64 = 86_400 * 1_000_000;

pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A plain unshared run: level 0, flush origin, keys `a..z`, owner shard 0.
pub(crate) fn run(generation: Generation, data_size: u64) -> Arc<SortedRun> {
    Arc::new(run_raw(generation, data_size))
}

pub(crate) fn run_raw(generation: Generation, data_size: u64) -> SortedRun {
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

pub(crate) fn run_at_level(generation: Generation, data_size: u64, level: u32) -> Arc<SortedRun> {
    let mut sr = run_raw(generation, data_size);
    sr.level = level;
    Arc::new(sr)
}

pub(crate) fn run_with_keys(
    generation: Generation,
    data_size: u64,
    level: u32,
    first: &[u8],
    last: &[u8],
) -> Arc<SortedRun> {
    let mut sr = run_raw(generation, data_size);
    sr.level = level;
    sr.first_key = first.to_vec();
    sr.last_key = last.to_vec();
    Arc::new(sr)
}

pub(crate) fn run_with_timestamps(
    generation: Generation,
    data_size: u64,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
) -> Arc<SortedRun> {
    let mut sr = run_raw(generation, data_size);
    sr.min_timestamp = min_timestamp;
    sr.max_timestamp = max_timestamp;
    Arc::new(sr)
}

// ------------------------------------------------------------------------------------------------
// Simulated runner
// ------------------------------------------------------------------------------------------------

/// Metadata-level merge: consumes the descriptor's inputs and fabricates
/// outputs that honor the reshard, shaping and size-bound rules.
pub(crate) struct SimRunner;

impl SimRunner {
    fn aggregate(inputs: &[Arc<SortedRun>]) -> (u64, Timestamp, Timestamp, Vec<u8>, Vec<u8>, i64) {
        let total: u64 = inputs.iter().map(|sr| sr.data_size).sum();
        let min_ts = inputs.iter().map(|sr| sr.min_timestamp).min().unwrap_or(0);
        let max_ts = inputs.iter().map(|sr| sr.max_timestamp).max().unwrap_or(0);
        let first = inputs
            .iter()
            .map(|sr| sr.first_key.clone())
            .min()
            .unwrap_or_default();
        let last = inputs
            .iter()
            .map(|sr| sr.last_key.clone())
            .max()
            .unwrap_or_default();
        let written_at = inputs.iter().map(|sr| sr.written_at).max().unwrap_or(0);
        (total, min_ts, max_ts, first, last, written_at)
    }

    fn blank_output(
        request: &CompactionRequest<'_>,
        inputs: &[Arc<SortedRun>],
        owners: &[ShardId],
    ) -> SortedRun {
        let (total, min_ts, max_ts, first, last, written_at) = Self::aggregate(inputs);
        SortedRun {
            generation: request.next_generation(),
            data_size: total,
            level: request.descriptor.target_level,
            run_id: request.descriptor.run_id,
            min_timestamp: min_ts,
            max_timestamp: max_ts,
            origin: SstOrigin::Compaction,
            tombstones: TombstoneStats::none(),
            owning_shards: owners.to_vec(),
            first_key: first,
            last_key: last,
            written_at,
            version: request.schema.current_version.clone(),
        }
    }
}

impl CompactionRunner for SimRunner {
    fn run(
        &self,
        request: &CompactionRequest<'_>,
        progress: &mut CompactionJobRecord,
    ) -> Result<Vec<SortedRun>, CompactionError> {
        let descriptor = request.descriptor;
        for (index, input) in descriptor.inputs.iter().enumerate() {
            request.check_abort()?;
            progress.set_compacted(index, input.data_size);
        }

        let inputs = &descriptor.inputs;
        let owners: Vec<ShardId> = {
            let mut all: Vec<ShardId> = inputs
                .iter()
                .flat_map(|sr| sr.owning_shards.iter().copied())
                .collect();
            all.sort_unstable();
            all.dedup();
            all
        };

        let mut outputs = Vec::new();
        if descriptor.reshard || owners.len() > 1 {
            // One disjoint output per original owner, covering the same key
            // range so every owner keeps its replica share.
            let share = inputs.iter().map(|sr| sr.data_size).sum::<u64>() / owners.len() as u64;
            for owner in &owners {
                let mut out = Self::blank_output(request, inputs, &[*owner]);
                out.data_size = share.max(1);
                outputs.push(out);
            }
        } else if let OutputShaping::SplitByWindow {
            window_size,
            resolution,
        } = descriptor.shaping
        {
            outputs = split_by_window(request, inputs, &owners, window_size, resolution);
        } else {
            let (total, ..) = Self::aggregate(inputs);
            if total > descriptor.max_output_size {
                let pieces = total.div_ceil(descriptor.max_output_size.max(1));
                for piece in 0..pieces {
                    let mut out = Self::blank_output(request, inputs, &owners);
                    out.data_size = (total / pieces).max(1);
                    // Slice the key space so sibling outputs stay disjoint.
                    out.first_key = [inputs[0].first_key.as_slice(), &[piece as u8]].concat();
                    out.last_key = [inputs[0].first_key.as_slice(), &[piece as u8, 0xff]].concat();
                    outputs.push(out);
                }
            } else if total > 0 {
                outputs.push(Self::blank_output(request, inputs, &owners));
            }
        }

        for out in &outputs {
            progress.add_written(out.data_size);
        }
        Ok(outputs)
    }
}

fn us_per_tick(resolution: TimestampResolution) -> i64 {
    1_000_000 / resolution.per_second()
}

fn split_by_window(
    request: &CompactionRequest<'_>,
    inputs: &[Arc<SortedRun>],
    owners: &[ShardId],
    window_size: i64,
    resolution: TimestampResolution,
) -> Vec<SortedRun> {
    let (total, min_ts, max_ts, ..) = SimRunner::aggregate(inputs);
    if total == 0 {
        return Vec::new();
    }
    let lo = window_lower_bound(window_size, to_resolution(min_ts, resolution));
    let hi = window_lower_bound(window_size, to_resolution(max_ts, resolution));
    let windows = ((hi - lo) / window_size + 1).max(1);
    let mut outputs = Vec::new();
    for w in 0..windows {
        let start_tick = lo + w * window_size;
        let start_us = start_tick * us_per_tick(resolution);
        let end_us = (start_tick + window_size) * us_per_tick(resolution) - 1;
        let mut out = SimRunner::blank_output(request, inputs, owners);
        out.data_size = (total / windows as u64).max(1);
        out.min_timestamp = start_us.max(min_ts);
        out.max_timestamp = end_us.min(max_ts);
        outputs.push(out);
    }
    outputs
}

/// Fails with a transient I/O error a fixed number of times, then behaves
/// like [`SimRunner`].
pub(crate) struct FlakyRunner {
    pub failures_left: AtomicUsize,
}

impl FlakyRunner {
    pub fn failing(times: usize) -> Self {
        FlakyRunner {
            failures_left: AtomicUsize::new(times),
        }
    }
}

impl CompactionRunner for FlakyRunner {
    fn run(
        &self,
        request: &CompactionRequest<'_>,
        progress: &mut CompactionJobRecord,
    ) -> Result<Vec<SortedRun>, CompactionError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(std::io::Error::other("simulated transient failure").into());
        }
        SimRunner.run(request, progress)
    }
}

/// Reports corruption for a chosen set of generations; otherwise simulates.
pub(crate) struct CorruptingRunner {
    pub corrupt: Vec<Generation>,
}

impl CompactionRunner for CorruptingRunner {
    fn run(
        &self,
        request: &CompactionRequest<'_>,
        progress: &mut CompactionJobRecord,
    ) -> Result<Vec<SortedRun>, CompactionError> {
        for input in &request.descriptor.inputs {
            if self.corrupt.contains(&input.generation) {
                return Err(CompactionError::Corruption {
                    generation: input.generation,
                    reason: "simulated checksum mismatch".to_string(),
                });
            }
        }
        SimRunner.run(request, progress)
    }
}

// ------------------------------------------------------------------------------------------------
// Sharder and opener
// ------------------------------------------------------------------------------------------------

/// Maps a key's first byte to a shard; a run owns every shard its byte range
/// touches. Keys chosen by tests fully control owner sets.
pub(crate) struct ByteSharder;

impl Sharder for ByteSharder {
    fn owning_shards(&self, first_key: &[u8], last_key: &[u8], shard_count: usize) -> Vec<ShardId> {
        let lo = first_key.first().copied().unwrap_or(0);
        let hi = last_key.first().copied().unwrap_or(lo).max(lo);
        let mut owners: Vec<ShardId> = (lo..=hi)
            .map(|b| b as usize % shard_count)
            .collect();
        owners.sort_unstable();
        owners.dedup();
        owners
    }
}

/// Reads run metadata from the TOC file contents: one `key=value` per line.
/// Unparsable contents surface as corruption.
pub(crate) struct StubOpener;

impl SstableOpener for StubOpener {
    fn open(
        &self,
        toc_path: &Path,
        descriptor: &ComponentDescriptor,
    ) -> Result<SortedRun, CompactionError> {
        let text = fs::read_to_string(toc_path)?;
        let mut sr = run_raw(descriptor.generation, MIB);
        sr.version = descriptor.version.clone();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(CompactionError::Corruption {
                    generation: descriptor.generation,
                    reason: format!("bad TOC line: {line}"),
                });
            };
            let parsed = match key {
                "size" => value.parse().map(|v| sr.data_size = v).is_ok(),
                "level" => value.parse().map(|v| sr.level = v).is_ok(),
                "min_ts" => value.parse().map(|v| sr.min_timestamp = v).is_ok(),
                "max_ts" => value.parse().map(|v| sr.max_timestamp = v).is_ok(),
                "written_at" => value.parse().map(|v| sr.written_at = v).is_ok(),
                "first" => {
                    sr.first_key = value.as_bytes().to_vec();
                    true
                }
                "last" => {
                    sr.last_key = value.as_bytes().to_vec();
                    true
                }
                "origin" => {
                    let origin = match value {
                        "flush" => Some(SstOrigin::Flush),
                        "repair" => Some(SstOrigin::Repair),
                        "compaction" => Some(SstOrigin::Compaction),
                        "import" => Some(SstOrigin::Import),
                        _ => None,
                    };
                    origin.map(|o| sr.origin = o).is_some()
                }
                _ => false,
            };
            if !parsed {
                return Err(CompactionError::Corruption {
                    generation: descriptor.generation,
                    reason: format!("bad TOC line: {line}"),
                });
            }
        }
        Ok(sr)
    }
}

/// Writes a complete on-disk run (TOC + data component) for loader tests.
pub(crate) fn write_run_files(
    dir: &Path,
    keyspace: &str,
    table: &str,
    generation: Generation,
    toc_contents: &str,
) -> ComponentDescriptor {
    let descriptor = ComponentDescriptor {
        keyspace: keyspace.to_string(),
        table: table.to_string(),
        version: "me".to_string(),
        generation,
        format: "big".to_string(),
    };
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(descriptor.filename(Component::Data)), b"data").unwrap();
    fs::write(dir.join(descriptor.filename(Component::Toc)), toc_contents).unwrap();
    descriptor
}
