//! Size-Tiered Compaction Strategy (STCS).
//!
//! Partitions runs into **buckets** of similar size and merges the cheapest
//! bucket once it holds enough runs. Runs below `min_sstable_size` all share
//! one bucket so a stream of tiny flush outputs cannot fragment into
//! singleton buckets. The bucketing functions are reused by the leveled
//! strategy (L0), the time-window strategy (current window) and the
//! size-tiered backlog tracker.

use std::mem;
use std::sync::Arc;

use tracing::debug;

use crate::sstable::SortedRun;
use crate::table::{TableSchema, TableState};

use super::backlog::{BacklogTracker, SizeTieredBacklogTracker};
use super::options::{CommonOptions, StcsOptions};
use super::{
    CompactionDescriptor, DEFAULT_MAX_OUTPUT_SIZE, ReshapeMode, StrategyControl,
    tombstone_fallback,
};

// ------------------------------------------------------------------------------------------------
// Bucketing
// ------------------------------------------------------------------------------------------------

/// Groups runs into buckets of similar size.
///
/// Runs are visited in ascending size order; a run joins the current bucket
/// when both it and the bucket average sit below `min_sstable_size`, or when
/// its size falls within `[avg × bucket_low, avg × bucket_high]`. Zero-sized
/// runs are excluded entirely.
pub(crate) fn size_tiered_buckets(
    runs: &[Arc<SortedRun>],
    opts: &StcsOptions,
) -> Vec<Vec<Arc<SortedRun>>> {
    let mut sorted: Vec<Arc<SortedRun>> = runs
        .iter()
        .filter(|sr| sr.data_size > 0)
        .cloned()
        .collect();
    sorted.sort_by_key(|sr| (sr.data_size, sr.generation));

    let mut buckets: Vec<Vec<Arc<SortedRun>>> = Vec::new();
    let mut current: Vec<Arc<SortedRun>> = Vec::new();
    let mut current_avg = 0.0f64;

    for sr in sorted {
        let size = sr.data_size as f64;
        if current.is_empty() {
            current_avg = size;
            current.push(sr);
            continue;
        }

        let both_small =
            current_avg < opts.min_sstable_size as f64 && size < opts.min_sstable_size as f64;
        let similar = size >= current_avg * opts.bucket_low && size <= current_avg * opts.bucket_high;

        if both_small || similar {
            current.push(sr);
            let total: f64 = current.iter().map(|s| s.data_size as f64).sum();
            current_avg = total / current.len() as f64;
        } else {
            buckets.push(mem::take(&mut current));
            current_avg = size;
            current.push(sr);
        }
    }

    if !current.is_empty() {
        buckets.push(current);
    }
    buckets
}

/// A bucket is worth compacting once it reaches the fan-in threshold.
pub(crate) fn is_bucket_interesting(bucket: &[Arc<SortedRun>], min_threshold: usize) -> bool {
    bucket.len() >= min_threshold
}

fn bucket_avg_size(bucket: &[Arc<SortedRun>]) -> f64 {
    if bucket.is_empty() {
        return 0.0;
    }
    bucket.iter().map(|sr| sr.data_size as f64).sum::<f64>() / bucket.len() as f64
}

/// Among the interesting buckets, picks the one with the smallest average
/// size (most write-amplification relief per byte), capped to the
/// `max_threshold` smallest members.
pub(crate) fn most_interesting_bucket(
    buckets: Vec<Vec<Arc<SortedRun>>>,
    min_threshold: usize,
    max_threshold: usize,
) -> Option<Vec<Arc<SortedRun>>> {
    buckets
        .into_iter()
        .filter(|b| is_bucket_interesting(b, min_threshold))
        .min_by(|a, b| bucket_avg_size(a).total_cmp(&bucket_avg_size(b)))
        .map(|mut bucket| {
            // Buckets are built size-ascending; keep the smallest runs.
            bucket.truncate(max_threshold);
            bucket
        })
}

// ------------------------------------------------------------------------------------------------
// Strategy
// ------------------------------------------------------------------------------------------------

/// The size-tiered family.
#[derive(Debug, Clone)]
pub struct SizeTieredStrategy {
    common: CommonOptions,
    opts: StcsOptions,
}

impl SizeTieredStrategy {
    pub fn new(common: CommonOptions, opts: StcsOptions) -> Self {
        SizeTieredStrategy { common, opts }
    }

    pub(crate) fn select_compaction(
        &self,
        table: &TableState,
        control: &StrategyControl,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        let buckets = size_tiered_buckets(&candidates, &self.opts);
        if let Some(bucket) = most_interesting_bucket(
            buckets,
            self.common.min_threshold,
            self.common.max_threshold,
        ) {
            debug!(
                selected = bucket.len(),
                total = candidates.len(),
                "size-tiered: found interesting bucket"
            );
            return CompactionDescriptor::new(bucket, 0, DEFAULT_MAX_OUTPUT_SIZE);
        }
        tombstone_fallback(&candidates, &self.common, table.gc_state(), control.now)
    }

    pub(crate) fn major_job(
        &self,
        _table: &TableState,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        CompactionDescriptor::new(candidates, 0, DEFAULT_MAX_OUTPUT_SIZE)
    }

    /// Bucket-aware cleanup: runs of a similar size are rewritten together
    /// instead of one job per run.
    pub(crate) fn cleanup_jobs(
        &self,
        _table: &TableState,
        candidates: Vec<Arc<SortedRun>>,
    ) -> Vec<CompactionDescriptor> {
        let mut jobs = Vec::new();
        for bucket in size_tiered_buckets(&candidates, &self.opts) {
            for chunk in bucket.chunks(self.common.max_threshold) {
                let mut desc =
                    CompactionDescriptor::new(chunk.to_vec(), 0, DEFAULT_MAX_OUTPUT_SIZE);
                desc.cleanup = true;
                jobs.push(desc);
            }
        }
        jobs
    }

    /// Repairs over-stuffed buckets. Never merges across buckets.
    pub(crate) fn reshape_job(
        &self,
        input: Vec<Arc<SortedRun>>,
        _schema: &TableSchema,
        mode: ReshapeMode,
    ) -> CompactionDescriptor {
        let threshold = match mode {
            ReshapeMode::Strict => self.common.max_threshold,
            ReshapeMode::Relaxed => self.common.max_threshold * 3 / 2,
        };
        let offender = size_tiered_buckets(&input, &self.opts)
            .into_iter()
            .filter(|b| b.len() > threshold)
            .max_by_key(|b| b.len());
        match offender {
            Some(mut bucket) => {
                bucket.truncate(self.common.max_threshold);
                CompactionDescriptor::new(bucket, 0, DEFAULT_MAX_OUTPUT_SIZE)
            }
            None => CompactionDescriptor::none(),
        }
    }

    pub(crate) fn pending_compactions(&self, table: &TableState) -> i64 {
        let runs = table.set().main_snapshot();
        size_tiered_buckets(&runs, &self.opts)
            .iter()
            .filter(|b| is_bucket_interesting(b, self.common.min_threshold))
            .map(|b| b.len().div_ceil(self.common.max_threshold) as i64)
            .sum()
    }

    pub(crate) fn make_backlog_tracker(&self, schema: &TableSchema) -> BacklogTracker {
        BacklogTracker::SizeTiered(SizeTieredBacklogTracker::new(
            self.opts.clone(),
            schema.min_compaction_threshold,
        ))
    }
}
