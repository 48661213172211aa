//! # MeridianDB
//!
//! The **compaction subsystem** of a sharded, log-structured,
//! column-oriented storage engine: the decision engine that picks which
//! sorted runs to merge, the backlog trackers that continuously quantify
//! outstanding compaction work for the I/O admission controller, and the
//! orchestration that runs compaction, cleanup, scrub, reshape and reshard
//! operations across many shards and tables with correct ordering,
//! cancellation and failure semantics.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Database                              │
//! │  ┌─────────────┐ ┌─────────────┐        ┌─────────────┐      │
//! │  │  shard 0     │ │  shard 1    │  ...   │  shard N-1  │      │
//! │  │  TableState  │ │  TableState │        │  TableState │      │
//! │  │  · run set   │ │  · run set  │        │  · run set  │      │
//! │  │  · strategy  │ │  · strategy │        │  · strategy │      │
//! │  │  · tracker   │ │  · tracker  │        │  · tracker  │      │
//! │  └──────┬──────┘ └──────┬──────┘        └──────┬──────┘      │
//! │         │   submit_to(shard, fn) message passing │            │
//! │  ┌──────┴──────────────┴───────────────────────┴──────────┐  │
//! │  │  compaction manager (permits, retries, custom gates)   │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! │  ┌─────────────────────────────────────────────────────────┐  │
//! │  │  task tree (keyspace → shard → table) + loader pipeline │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`sstable`] | Sorted-run descriptors, component/TOC naming, the per-table run set |
//! | [`compaction`] | Strategy families (null / size-tiered / leveled / time-window), options, backlog trackers |
//! | [`table`] | Per-(table, shard) state: run set + strategy + tracker + job records |
//! | [`shard`] | Thread-per-shard actors and cross-shard message passing |
//! | [`manager`] | Compaction permits, bounded retries, per-kind custom-job gates, the runner seam |
//! | [`tasks`] | Three-level task tree, cancellation, progress reporting |
//! | [`loader`] | Directory scan, reshard distribution/execution, reshape loop, publish |
//! | [`engine`] | The `Database` handle and the keyspace operation surface |
//!
//! ## Key properties
//!
//! - **Shard isolation** — per-shard state is owned by its actor thread;
//!   coordination is message passing, never shared memory.
//! - **Atomic replacement** — a compaction's inputs leave the run set and
//!   the backlog tracker in the same step its outputs enter; a strategy
//!   never sees a half-applied result.
//! - **Continuous backlog** — trackers subtract in-flight progress, so the
//!   admission controller sees a smooth estimate during concurrent writes
//!   and compactions.
//! - **Ordered maintenance** — per-shard major/cleanup runs strictly one
//!   table at a time, smallest first, re-sampled before every pick.
//! - **Cooperative cancellation** — aborts propagate down the task tree and
//!   surface as the compaction-stopped condition at run boundaries, never as
//!   failures.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use meridiandb::engine::{Database, DatabaseConfig};
//! use meridiandb::table::TableSchema;
//!
//! # fn runner() -> Arc<dyn meridiandb::manager::CompactionRunner> { unimplemented!() }
//! # fn sharder() -> Arc<dyn meridiandb::loader::Sharder> { unimplemented!() }
//! # fn opener() -> Arc<dyn meridiandb::loader::SstableOpener> { unimplemented!() }
//! let db = Database::open(
//!     DatabaseConfig::new("/var/lib/meridian"),
//!     runner(),
//!     sharder(),
//!     opener(),
//! ).unwrap();
//!
//! let mut options = BTreeMap::new();
//! options.insert("class".to_string(), "LeveledCompactionStrategy".to_string());
//! options.insert("sstable_size_in_mb".to_string(), "160".to_string());
//! db.create_table(TableSchema::new("ks", "events"), &options).unwrap();
//!
//! // Run one strategy-selected round, then a full major compaction.
//! db.maybe_compact("ks", "events").unwrap();
//! let report = db.compact_keyspace("ks", &[]).unwrap();
//! assert_eq!(report.exit_code(), 0);
//! ```

#![allow(dead_code)]

#[cfg(test)]
pub(crate) mod testing;

pub mod compaction;
pub mod engine;
pub mod loader;
pub mod manager;
pub mod shard;
pub mod sstable;
pub mod table;
pub mod tasks;
