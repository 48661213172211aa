//! Shard-level operation tests: ordering, error isolation, cancellation.

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    use crate::compaction::CompactionError;
    use crate::manager::{CompactionManager, JobContext, ManagerConfig, ScrubMode};
    use crate::shard::ShardState;
    use crate::sstable::{MaintenanceKind, SortedRun};
    use crate::table::{TableId, TableSchema, TableState};
    use crate::tasks::{AbortHandle, OpKind, ShardOpSpec, TaskRegistry, run_shard_op};
    use crate::testing::{CorruptingRunner, MIB, SimRunner, init_test_logging, run};

    fn table_state(name: &str, runs: Vec<Arc<SortedRun>>) -> TableState {
        let mut state = TableState::from_option_map(
            TableSchema::new("ks", name),
            &BTreeMap::new(),
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap();
        state.replace_sstables(&[], &runs).unwrap();
        state.ensure_generation_at_least(1_000);
        state
    }

    fn shard_with(tables: Vec<(TableId, &str, Vec<Arc<SortedRun>>)>) -> ShardState {
        init_test_logging();
        let mut map = HashMap::new();
        for (id, name, runs) in tables {
            map.insert(id, table_state(name, runs));
        }
        ShardState {
            shard: 0,
            tables: map,
        }
    }

    fn spec(registry: &TaskRegistry, op: OpKind, tables: &[(TableId, &str)]) -> ShardOpSpec {
        let parent = registry.start(None, None, "ks", None, op);
        ShardOpSpec {
            op,
            keyspace: "ks".to_string(),
            tables: tables
                .iter()
                .map(|(id, name)| (*id, name.to_string()))
                .collect(),
            parent_task: parent,
            include_all_versions: false,
        }
    }

    fn manager() -> CompactionManager {
        CompactionManager::new(Arc::new(SimRunner), ManagerConfig::default())
    }

    fn ctx() -> JobContext {
        JobContext::new(AbortHandle::new())
    }

    fn table_op_order(registry: &TaskRegistry) -> Vec<String> {
        registry
            .snapshot()
            .into_iter()
            .filter_map(|t| t.table)
            .collect()
    }

    fn runs_of(count: u64, base_generation: u64, size: u64) -> Vec<Arc<SortedRun>> {
        (0..count).map(|g| run(base_generation + g, size)).collect()
    }

    /// # Invariant
    /// Major compaction visits tables in ascending live-size order,
    /// re-sampled before each pick.
    #[test]
    fn major_runs_smallest_table_first() {
        let mut state = shard_with(vec![
            (1, "big", runs_of(3, 1, 100 * MIB)),
            (2, "small", runs_of(1, 1, 100 * MIB)),
            (3, "mid", runs_of(2, 1, 100 * MIB)),
        ]);
        let registry = TaskRegistry::new();
        let spec = spec(
            &registry,
            OpKind::Major,
            &[(1, "big"), (2, "small"), (3, "mid")],
        );

        let outcome = run_shard_op(&mut state, &manager(), &registry, &spec, &ctx());
        assert!(outcome.first_error.is_none());
        assert_eq!(table_op_order(&registry), vec!["small", "mid", "big"]);

        for table in state.tables.values() {
            assert_eq!(table.set().main_len(), 1, "major merges everything");
        }
    }

    /// # Scenario
    /// One table fails; it is recorded and its siblings still run. The
    /// first error surfaces only after all tables finished.
    #[test]
    fn per_table_failure_does_not_short_circuit() {
        let mut state = shard_with(vec![
            (1, "poisoned", runs_of(2, 1, 100 * MIB)),
            (2, "healthy", runs_of(2, 1, 200 * MIB)),
        ]);
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Major, &[(1, "poisoned"), (2, "healthy")]);
        let manager = CompactionManager::new(
            Arc::new(CorruptingRunner { corrupt: vec![1] }),
            ManagerConfig::default(),
        );

        let outcome = run_shard_op(&mut state, &manager, &registry, &spec, &ctx());
        assert!(matches!(
            outcome.first_error,
            Some(CompactionError::Corruption { .. })
        ));
        assert_eq!(outcome.failed_tables.len(), 1);
        assert_eq!(outcome.failed_tables[0].0, "poisoned");

        assert_eq!(
            state.tables[&2].set().main_len(),
            1,
            "the healthy sibling still compacted"
        );
        assert_eq!(state.tables[&1].set().main_len(), 2, "failed table untouched");
    }

    /// # Scenario
    /// A pre-aborted operation runs nothing and reports the stop; stops
    /// outrank any recorded error.
    #[test]
    fn cancellation_outranks_errors() {
        let mut state = shard_with(vec![(1, "events", runs_of(4, 1, 100 * MIB))]);
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Major, &[(1, "events")]);

        let abort = AbortHandle::new();
        abort.abort();
        let outcome = run_shard_op(&mut state, &manager(), &registry, &spec, &JobContext::new(abort));
        assert!(matches!(
            outcome.first_error,
            Some(CompactionError::Stopped(_))
        ));
        assert_eq!(state.tables[&1].set().main_len(), 4, "nothing ran");
    }

    /// A dropped table is skipped with a warning; the op still succeeds.
    #[test]
    fn dropped_tables_are_skipped() {
        let mut state = shard_with(vec![(1, "events", runs_of(2, 1, 100 * MIB))]);
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Major, &[(99, "ghost"), (1, "events")]);

        let outcome = run_shard_op(&mut state, &manager(), &registry, &spec, &ctx());
        assert!(outcome.first_error.is_none());
        assert!(outcome.failed_tables.is_empty());
        assert_eq!(state.tables[&1].set().main_len(), 1);
    }

    /// # Scenario
    /// Off-strategy absorbs maintenance runs into the main set and reports
    /// whether any table needed it.
    #[test]
    fn offstrategy_absorbs_maintenance_runs() {
        let mut state = shard_with(vec![(1, "events", runs_of(1, 1, 100 * MIB))]);
        {
            let table = state.tables.get_mut(&1).unwrap();
            for g in 0..3 {
                table
                    .set_mut()
                    .add_maintenance(MaintenanceKind::OffStrategy, run(10 + g, 50 * MIB));
            }
        }
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Offstrategy, &[(1, "events")]);

        let outcome = run_shard_op(&mut state, &manager(), &registry, &spec, &ctx());
        assert!(outcome.first_error.is_none());
        assert!(outcome.offstrategy_needed);

        let table = &state.tables[&1];
        assert_eq!(
            table.set().maintenance_runs(Some(MaintenanceKind::OffStrategy)).len(),
            0
        );
        assert_eq!(table.set().main_len(), 2, "original run plus absorbed output");

        // Second round: nothing left to absorb.
        let spec = spec2(&registry);
        let outcome = run_shard_op(&mut state, &manager(), &registry, &spec, &ctx());
        assert!(!outcome.offstrategy_needed);

        fn spec2(registry: &TaskRegistry) -> ShardOpSpec {
            let parent = registry.start(None, None, "ks", None, OpKind::Offstrategy);
            ShardOpSpec {
                op: OpKind::Offstrategy,
                keyspace: "ks".to_string(),
                tables: vec![(1, "events".to_string())],
                parent_task: parent,
                include_all_versions: false,
            }
        }
    }

    /// # Scenario
    /// Scrub in quarantine mode: corrupt runs move aside, the rest are
    /// rewritten, and the stats add up.
    #[test]
    fn scrub_quarantines_corruption() {
        let mut state = shard_with(vec![(1, "events", runs_of(3, 1, 100 * MIB))]);
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Scrub, &[(1, "events")]);
        let manager = CompactionManager::new(
            Arc::new(CorruptingRunner { corrupt: vec![2] }),
            ManagerConfig::default(),
        );
        let mut ctx = ctx();
        ctx.scrub_mode = Some(ScrubMode::Quarantine);

        let outcome = run_shard_op(&mut state, &manager, &registry, &spec, &ctx);
        assert!(outcome.first_error.is_none(), "quarantine is non-fatal");
        assert_eq!(outcome.scrub.scrubbed, 2);
        assert_eq!(outcome.scrub.corrupted, 1);
        assert_eq!(outcome.scrub.quarantined, 1);

        let table = &state.tables[&1];
        assert_eq!(table.set().main_len(), 2);
        assert_eq!(
            table.set().maintenance_runs(Some(MaintenanceKind::Quarantine)).len(),
            1
        );
    }

    /// Scrub in abort mode stops at the first corruption.
    #[test]
    fn scrub_abort_mode_fails_fast() {
        let mut state = shard_with(vec![(1, "events", runs_of(3, 1, 100 * MIB))]);
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Scrub, &[(1, "events")]);
        let manager = CompactionManager::new(
            Arc::new(CorruptingRunner { corrupt: vec![1] }),
            ManagerConfig::default(),
        );
        let mut ctx = ctx();
        ctx.scrub_mode = Some(ScrubMode::Abort);

        let outcome = run_shard_op(&mut state, &manager, &registry, &spec, &ctx);
        assert!(matches!(
            outcome.first_error,
            Some(CompactionError::Corruption { .. })
        ));
        assert_eq!(outcome.scrub.quarantined, 0);
    }

    /// # Scenario
    /// Upgrade rewrites only runs on an old format version unless told to
    /// include everything.
    #[test]
    fn upgrade_rewrites_old_versions_only() {
        let mut old_a = (*run(1, 100 * MIB)).clone();
        old_a.version = "ka".to_string();
        let mut old_b = (*run(2, 100 * MIB)).clone();
        old_b.version = "ka".to_string();
        let current = run(3, 100 * MIB);
        let current_generation = current.generation;

        let mut state = shard_with(vec![(
            1,
            "events",
            vec![Arc::new(old_a), Arc::new(old_b), current],
        )]);
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Upgrade, &[(1, "events")]);

        let outcome = run_shard_op(&mut state, &manager(), &registry, &spec, &ctx());
        assert!(outcome.first_error.is_none());

        let table = &state.tables[&1];
        assert_eq!(table.set().main_len(), 3);
        assert!(table.set().main_runs().all(|sr| sr.version == "me"));
        assert!(
            table
                .set()
                .main_runs()
                .any(|sr| sr.generation == current_generation),
            "current-version run was not rewritten"
        );
    }

    /// # Scenario
    /// Keyspace reshape loops until the strategy accepts the layout.
    #[test]
    fn reshape_loops_until_layout_is_clean() {
        let mut state = shard_with(vec![(1, "events", runs_of(40, 1, 100 * MIB))]);
        let registry = TaskRegistry::new();
        let spec = spec(&registry, OpKind::Reshape, &[(1, "events")]);

        let outcome = run_shard_op(&mut state, &manager(), &registry, &spec, &ctx());
        assert!(outcome.first_error.is_none());

        let table = &state.tables[&1];
        assert_eq!(table.set().main_len(), 9, "32 runs merged, 8 untouched");
    }
}
