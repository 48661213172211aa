//! Reshard distribution tests.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::loader::distribute_reshard_jobs;
    use crate::sstable::{ShardId, SortedRun};
    use crate::testing::{MIB, run_raw};

    fn shared_run(generation: u64, size_mib: u64, owners: &[ShardId]) -> Arc<SortedRun> {
        let mut sr = run_raw(generation, size_mib * MIB);
        sr.owning_shards = owners.to_vec();
        Arc::new(sr)
    }

    /// # Scenario
    /// Six shared runs `[100, 90, 80, 70, 60, 50]` MiB, all owned by shards
    /// `{0, 1}`.
    ///
    /// # Expected behavior
    /// Greedy by descending size, ties to the lower shard id:
    /// `100→0, 90→1, 80→1, 70→0, 60→0 (tie at 170), 50→1`. The totals end
    /// size-balanced well within half the larger share.
    #[test]
    fn greedy_assignment_balances_totals() {
        let shared = vec![
            shared_run(1, 100, &[0, 1]),
            shared_run(2, 90, &[0, 1]),
            shared_run(3, 80, &[0, 1]),
            shared_run(4, 70, &[0, 1]),
            shared_run(5, 60, &[0, 1]),
            shared_run(6, 50, &[0, 1]),
        ];
        let plans = distribute_reshard_jobs(shared, 2);

        let sizes = |shard: usize| -> Vec<u64> {
            plans[shard].runs.iter().map(|sr| sr.data_size / MIB).collect()
        };
        assert_eq!(sizes(0), vec![100, 70, 60]);
        assert_eq!(sizes(1), vec![90, 80, 50]);
        assert_eq!(plans[0].total, 230 * MIB);
        assert_eq!(plans[1].total, 220 * MIB);

        let spread = plans[1].total.abs_diff(plans[0].total);
        assert!(spread <= plans.iter().map(|p| p.total).max().unwrap() / 2);
    }

    /// Assignment respects each run's owner set even when another shard is
    /// idle.
    #[test]
    fn assignment_respects_owner_sets() {
        let shared = vec![
            shared_run(1, 100, &[1, 2]),
            shared_run(2, 90, &[1, 2]),
            shared_run(3, 80, &[1, 2]),
        ];
        let plans = distribute_reshard_jobs(shared, 4);
        assert!(plans[0].runs.is_empty());
        assert!(plans[3].runs.is_empty());
        assert_eq!(plans[1].runs.len() + plans[2].runs.len(), 3);
    }

    /// Ties in accumulated work go to the lowest shard id.
    #[test]
    fn ties_break_toward_lower_shard_ids() {
        let shared = vec![shared_run(1, 100, &[2, 0, 1])];
        let plans = distribute_reshard_jobs(shared, 3);
        assert_eq!(plans[0].runs.len(), 1);
    }

    /// Owners outside the shard group are ignored; a run with none is
    /// dropped rather than misplaced.
    #[test]
    fn invalid_owners_are_skipped() {
        let shared = vec![
            shared_run(1, 100, &[7, 1]),
            shared_run(2, 50, &[9, 12]),
        ];
        let plans = distribute_reshard_jobs(shared, 2);
        assert_eq!(plans[1].runs.len(), 1);
        assert_eq!(plans[0].runs.len(), 0);
    }
}
