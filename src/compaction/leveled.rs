//! Leveled Compaction Strategy (LCS).
//!
//! Runs live on numbered levels; the goal layout has every populated level
//! `fan_out` times smaller than the next, keeping space amplification near
//! `1.111 × size(max_level)`. L0 absorbs flushes and behaves size-tiered
//! until it can be promoted; higher levels hold non-overlapping runs capped
//! at `sstable_size_in_mb`.

use std::array;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::sstable::SortedRun;
use crate::table::{TableSchema, TableState};

use super::backlog::{BacklogTracker, LeveledBacklogTracker, SizeTieredBacklogTracker};
use super::options::{CommonOptions, LcsOptions, StcsOptions};
use super::stcs::{most_interesting_bucket, size_tiered_buckets};
use super::{
    CompactionDescriptor, DEFAULT_MAX_OUTPUT_SIZE, ReshapeMode, StrategyControl,
    tombstone_fallback,
};

/// Size ratio between consecutive levels in the goal layout.
pub const LEVELED_FAN_OUT: u64 = 10;

/// Number of levels; a run's level is always below this.
pub const MAX_LEVELS: usize = 9;

/// Space-amplification goal: total size stays within this factor of the
/// largest level.
pub const SPACE_AMPLIFICATION_GOAL: f64 = 1.111;

/// Partitions runs by level, clamping out-of-range levels into the top one.
fn runs_per_level(candidates: &[Arc<SortedRun>]) -> [Vec<Arc<SortedRun>>; MAX_LEVELS] {
    let mut levels: [Vec<Arc<SortedRun>>; MAX_LEVELS] = array::from_fn(|_| Vec::new());
    for sr in candidates {
        if sr.data_size == 0 {
            continue;
        }
        let mut level = sr.level as usize;
        if level >= MAX_LEVELS {
            warn!(generation = sr.generation, level, "run level out of range");
            level = MAX_LEVELS - 1;
        }
        levels[level].push(Arc::clone(sr));
    }
    levels
}

/// Goal size for one level given the currently-populated hierarchy.
///
/// The largest level targets `total / 1.111`; every level below is `fan_out`
/// times smaller, floored at one full-size run.
pub(crate) fn target_level_size(
    level: usize,
    max_populated: usize,
    total: u64,
    max_run_size: u64,
) -> u64 {
    let target_max = (total as f64 / SPACE_AMPLIFICATION_GOAL).ceil();
    let r = (target_max / (LEVELED_FAN_OUT as f64).powi((max_populated - level) as i32)).ceil();
    (r as u64).max(max_run_size)
}

// ------------------------------------------------------------------------------------------------
// Strategy
// ------------------------------------------------------------------------------------------------

/// The leveled family.
#[derive(Debug, Clone)]
pub struct LeveledStrategy {
    common: CommonOptions,
    stcs_opts: StcsOptions,
    lcs_opts: LcsOptions,
}

impl LeveledStrategy {
    pub fn new(common: CommonOptions, stcs_opts: StcsOptions, lcs_opts: LcsOptions) -> Self {
        LeveledStrategy {
            common,
            stcs_opts,
            lcs_opts,
        }
    }

    fn max_run_size(&self) -> u64 {
        self.lcs_opts.max_run_size()
    }

    pub(crate) fn select_compaction(
        &self,
        table: &TableState,
        control: &StrategyControl,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        let levels = runs_per_level(&candidates);

        // L0 accumulates overlapping flush outputs; merge them size-tiered
        // before promotion so one promotion carries many runs at once.
        if levels[0].len() >= self.common.min_threshold
            && let Some(bucket) = most_interesting_bucket(
                size_tiered_buckets(&levels[0], &self.stcs_opts),
                self.common.min_threshold,
                self.common.max_threshold,
            )
        {
            debug!(selected = bucket.len(), "leveled: size-tiered merge in L0");
            return CompactionDescriptor::new(bucket, 0, DEFAULT_MAX_OUTPUT_SIZE);
        }

        if let Some(desc) = self.promotion_job(&levels) {
            return desc;
        }

        tombstone_fallback(&candidates, &self.common, table.gc_state(), control.now)
    }

    /// Promotes from the lowest level over its target size: the stalest run
    /// there plus everything it overlaps one level up.
    fn promotion_job(
        &self,
        levels: &[Vec<Arc<SortedRun>>; MAX_LEVELS],
    ) -> Option<CompactionDescriptor> {
        let size_per_level: Vec<u64> = levels
            .iter()
            .map(|l| l.iter().map(|sr| sr.data_size).sum())
            .collect();
        let max_populated = size_per_level.iter().rposition(|&s| s > 0).unwrap_or(0);
        let total: u64 = size_per_level.iter().sum();

        for level in 0..max_populated {
            let target = target_level_size(level, max_populated, total, self.max_run_size());
            if size_per_level[level] <= target {
                continue;
            }

            // Oldest max-timestamp first; ties resolved toward the smallest
            // overlap set, then generation for determinism.
            let picked = levels[level].iter().min_by_key(|sr| {
                let overlap = levels[level + 1]
                    .iter()
                    .filter(|next| next.overlaps(sr))
                    .count();
                (sr.max_timestamp, overlap, sr.generation)
            })?;

            let mut inputs = vec![Arc::clone(picked)];
            inputs.extend(
                levels[level + 1]
                    .iter()
                    .filter(|next| next.overlaps(picked))
                    .cloned(),
            );
            debug!(
                level,
                over_target = size_per_level[level] - target,
                inputs = inputs.len(),
                "leveled: promoting into next level"
            );
            return Some(CompactionDescriptor::new(
                inputs,
                level as u32 + 1,
                self.max_run_size(),
            ));
        }
        None
    }

    pub(crate) fn major_job(
        &self,
        _table: &TableState,
        candidates: Vec<Arc<SortedRun>>,
    ) -> CompactionDescriptor {
        let target = candidates.iter().map(|sr| sr.level).max().unwrap_or(0);
        CompactionDescriptor::new(candidates, target, self.max_run_size())
    }

    /// Repairs L0 overcrowding and illegal overlap within a level.
    pub(crate) fn reshape_job(
        &self,
        input: Vec<Arc<SortedRun>>,
        _schema: &TableSchema,
        mode: ReshapeMode,
    ) -> CompactionDescriptor {
        let levels = runs_per_level(&input);
        let limit = match mode {
            ReshapeMode::Strict => self.common.max_threshold,
            ReshapeMode::Relaxed => self.common.max_threshold * 3 / 2,
        };

        if levels[0].len() > limit {
            let mut l0 = levels[0].clone();
            l0.sort_by_key(|sr| (sr.data_size, sr.generation));
            l0.truncate(self.common.max_threshold);
            return CompactionDescriptor::new(l0, 0, self.max_run_size());
        }

        for (level, runs) in levels.iter().enumerate().skip(1) {
            if let Some(cluster) = overlapping_cluster(runs) {
                let mut inputs = cluster;
                inputs.truncate(self.common.max_threshold);
                return CompactionDescriptor::new(inputs, level as u32, self.max_run_size());
            }
        }
        CompactionDescriptor::none()
    }

    pub(crate) fn pending_compactions(&self, table: &TableState) -> i64 {
        let runs = table.set().main_snapshot();
        let levels = runs_per_level(&runs);
        let size_per_level: Vec<u64> = levels
            .iter()
            .map(|l| l.iter().map(|sr| sr.data_size).sum())
            .collect();
        let max_populated = size_per_level.iter().rposition(|&s| s > 0).unwrap_or(0);
        let total: u64 = size_per_level.iter().sum();

        let mut pending = 0i64;
        if levels[0].len() >= self.common.min_threshold {
            pending += 1;
        }
        for level in 0..max_populated {
            let target = target_level_size(level, max_populated, total, self.max_run_size());
            if size_per_level[level] > target {
                let overflow = size_per_level[level] - target;
                pending += overflow.div_ceil(self.max_run_size()) as i64;
            }
        }
        pending
    }

    pub(crate) fn make_backlog_tracker(&self, schema: &TableSchema) -> BacklogTracker {
        BacklogTracker::Leveled(LeveledBacklogTracker::new(
            self.max_run_size(),
            SizeTieredBacklogTracker::new(
                self.stcs_opts.clone(),
                schema.min_compaction_threshold,
            ),
        ))
    }
}

/// Finds a maximal chain of mutually-reachable overlapping runs within one
/// level, or `None` when the level is properly disjoint.
fn overlapping_cluster(runs: &[Arc<SortedRun>]) -> Option<Vec<Arc<SortedRun>>> {
    if runs.len() < 2 {
        return None;
    }
    let mut sorted: Vec<Arc<SortedRun>> = runs.to_vec();
    sorted.sort_by(|a, b| {
        a.first_key
            .cmp(&b.first_key)
            .then_with(|| a.generation.cmp(&b.generation))
    });

    let mut cluster: Vec<Arc<SortedRun>> = vec![Arc::clone(&sorted[0])];
    let mut reach = sorted[0].last_key.clone();
    for sr in &sorted[1..] {
        if sr.first_key <= reach {
            if sr.last_key > reach {
                reach = sr.last_key.clone();
            }
            cluster.push(Arc::clone(sr));
        } else if cluster.len() >= 2 {
            return Some(cluster);
        } else {
            cluster = vec![Arc::clone(sr)];
            reach = sr.last_key.clone();
        }
    }
    (cluster.len() >= 2).then_some(cluster)
}
