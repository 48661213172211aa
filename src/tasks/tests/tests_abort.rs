//! Abort-tree and task-registry tests.

#[cfg(test)]
mod tests {
    use crate::compaction::CompactionError;
    use crate::tasks::{AbortHandle, OpKind, TaskRegistry, TaskState};

    /// # Scenario
    /// Aborting a parent reaches every descendant; children derived after
    /// the abort are born aborted.
    #[test]
    fn abort_broadcasts_down_the_tree() {
        let root = AbortHandle::new();
        let child = root.child();
        let grandchild = child.child();
        assert!(!grandchild.is_aborted());
        assert!(grandchild.check().is_ok());

        root.abort();
        assert!(root.is_aborted());
        assert!(child.is_aborted());
        assert!(grandchild.is_aborted());
        assert!(matches!(
            grandchild.check(),
            Err(CompactionError::Stopped(_))
        ));

        let late = root.child();
        assert!(late.is_aborted(), "children of an aborted parent start aborted");
    }

    /// Aborting a child leaves the parent and siblings running.
    #[test]
    fn child_abort_stays_local() {
        let root = AbortHandle::new();
        let left = root.child();
        let right = root.child();
        left.abort();
        assert!(left.is_aborted());
        assert!(!root.is_aborted());
        assert!(!right.is_aborted());
    }

    /// Aborting twice is idempotent.
    #[test]
    fn abort_is_idempotent() {
        let root = AbortHandle::new();
        root.abort();
        root.abort();
        assert!(root.is_aborted());
    }

    /// # Scenario
    /// Task nodes publish identity, hierarchy and progress, and reach
    /// terminal states.
    #[test]
    fn registry_tracks_the_task_tree() {
        let registry = TaskRegistry::new();
        let parent = registry.start(None, None, "ks", None, OpKind::Major);
        let shard_task = registry.start(Some(parent), Some(1), "ks", None, OpKind::Major);
        let table_task =
            registry.start(Some(shard_task), Some(1), "ks", Some("events"), OpKind::Major);

        registry.set_total(table_task, 1_000);
        registry.add_done(table_task, 400);
        registry.add_done(table_task, 600);
        registry.finish(table_task, TaskState::Done);
        registry.finish(shard_task, TaskState::Done);
        registry.finish(parent, TaskState::Failed("boom".to_string()));

        let status = registry.get(table_task).unwrap();
        assert_eq!(status.parent, Some(shard_task));
        assert_eq!(status.shard, Some(1));
        assert_eq!(status.table.as_deref(), Some("events"));
        assert_eq!(status.bytes_total, 1_000);
        assert_eq!(status.bytes_done, 1_000);
        assert_eq!(status.state, TaskState::Done);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(
            registry.get(parent).unwrap().state,
            TaskState::Failed("boom".to_string())
        );
    }
}
