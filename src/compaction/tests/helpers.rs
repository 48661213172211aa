//! Strategy test helpers: tables built from raw option maps.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::compaction::StrategyControl;
use crate::table::{TableSchema, TableState};
use crate::testing::init_test_logging;

/// Builds a table state from `key=value` option pairs.
pub fn table_with_options(options: &[(&str, &str)]) -> TableState {
    init_test_logging();
    let map: BTreeMap<String, String> = options
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    TableState::from_option_map(
        TableSchema::new("ks", "events"),
        &map,
        Arc::new(AtomicU64::new(0)),
    )
    .unwrap()
}

pub fn control_at(now: i64) -> StrategyControl {
    StrategyControl {
        now,
        has_ongoing_compaction: false,
    }
}
