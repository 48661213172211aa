//! Strategy option parsing.
//!
//! Options arrive as a string map (the schema's `compaction = {...}` clause).
//! Parsing happens once, at table-open time; invalid or unknown options are
//! fatal before anything starts, never during operation. Each strategy family
//! accepts the common options plus its own block; a key outside that union is
//! rejected.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

pub const CLASS_OPTION: &str = "class";
pub const MIN_THRESHOLD_OPTION: &str = "min_threshold";
pub const MAX_THRESHOLD_OPTION: &str = "max_threshold";
pub const TOMBSTONE_THRESHOLD_OPTION: &str = "tombstone_threshold";
pub const TOMBSTONE_COMPACTION_INTERVAL_OPTION: &str = "tombstone_compaction_interval";
pub const MIN_SSTABLE_SIZE_OPTION: &str = "min_sstable_size";
pub const BUCKET_LOW_OPTION: &str = "bucket_low";
pub const BUCKET_HIGH_OPTION: &str = "bucket_high";
pub const SSTABLE_SIZE_OPTION: &str = "sstable_size_in_mb";
pub const TIMESTAMP_RESOLUTION_OPTION: &str = "timestamp_resolution";
pub const COMPACTION_WINDOW_UNIT_OPTION: &str = "compaction_window_unit";
pub const COMPACTION_WINDOW_SIZE_OPTION: &str = "compaction_window_size";

pub const DEFAULT_MIN_THRESHOLD: usize = 4;
pub const DEFAULT_MAX_THRESHOLD: usize = 32;
pub const DEFAULT_TOMBSTONE_THRESHOLD: f64 = 0.2;
pub const DEFAULT_TOMBSTONE_COMPACTION_INTERVAL_SECS: u64 = 86_400;
pub const DEFAULT_MIN_SSTABLE_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_BUCKET_LOW: f64 = 0.5;
pub const DEFAULT_BUCKET_HIGH: f64 = 1.5;
pub const DEFAULT_SSTABLE_SIZE_IN_MB: u64 = 160;

/// Errors raised while parsing strategy options. Always fatal to table open.
#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("unknown compaction option: {0}")]
    UnknownOption(String),

    #[error("unknown compaction strategy class: {0}")]
    UnknownClass(String),

    #[error("invalid value for {name}: {value} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

fn get<'a>(options: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    options.get(name).map(String::as_str)
}

fn to_f64(name: &'static str, value: Option<&str>, default: f64) -> Result<f64, OptionsError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| OptionsError::InvalidValue {
            name,
            value: v.to_string(),
            reason: "not a number",
        }),
    }
}

fn to_u64(name: &'static str, value: Option<&str>, default: u64) -> Result<u64, OptionsError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| OptionsError::InvalidValue {
            name,
            value: v.to_string(),
            reason: "not a non-negative integer",
        }),
    }
}

fn to_usize(name: &'static str, value: Option<&str>, default: usize) -> Result<usize, OptionsError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| OptionsError::InvalidValue {
            name,
            value: v.to_string(),
            reason: "not a non-negative integer",
        }),
    }
}

// ------------------------------------------------------------------------------------------------
// Strategy selector
// ------------------------------------------------------------------------------------------------

/// Which strategy family a table runs. Picked once from the `class` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Null,
    SizeTiered,
    Leveled,
    TimeWindow,
}

impl StrategyKind {
    pub fn parse(class: &str) -> Result<Self, OptionsError> {
        match class {
            "NullCompactionStrategy" => Ok(StrategyKind::Null),
            "SizeTieredCompactionStrategy" => Ok(StrategyKind::SizeTiered),
            "LeveledCompactionStrategy" => Ok(StrategyKind::Leveled),
            "TimeWindowCompactionStrategy" => Ok(StrategyKind::TimeWindow),
            other => Err(OptionsError::UnknownClass(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Null => "NullCompactionStrategy",
            StrategyKind::SizeTiered => "SizeTieredCompactionStrategy",
            StrategyKind::Leveled => "LeveledCompactionStrategy",
            StrategyKind::TimeWindow => "TimeWindowCompactionStrategy",
        }
    }

    fn accepts(&self, key: &str) -> bool {
        const COMMON: &[&str] = &[
            CLASS_OPTION,
            MIN_THRESHOLD_OPTION,
            MAX_THRESHOLD_OPTION,
            TOMBSTONE_THRESHOLD_OPTION,
            TOMBSTONE_COMPACTION_INTERVAL_OPTION,
        ];
        const STCS: &[&str] = &[
            MIN_SSTABLE_SIZE_OPTION,
            BUCKET_LOW_OPTION,
            BUCKET_HIGH_OPTION,
        ];
        const LCS: &[&str] = &[SSTABLE_SIZE_OPTION];
        const TWCS: &[&str] = &[
            TIMESTAMP_RESOLUTION_OPTION,
            COMPACTION_WINDOW_UNIT_OPTION,
            COMPACTION_WINDOW_SIZE_OPTION,
        ];
        if COMMON.contains(&key) {
            return true;
        }
        match self {
            StrategyKind::Null => false,
            StrategyKind::SizeTiered => STCS.contains(&key),
            // Leveled and time-window both embed size-tiered behavior
            // (L0 / current window), so the STCS knobs stay accepted.
            StrategyKind::Leveled => LCS.contains(&key) || STCS.contains(&key),
            StrategyKind::TimeWindow => TWCS.contains(&key) || STCS.contains(&key),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Common options
// ------------------------------------------------------------------------------------------------

/// Options every strategy family honors.
#[derive(Debug, Clone)]
pub struct CommonOptions {
    /// Minimum fan-in before a bucket (or window, or L0) is worth compacting.
    pub min_threshold: usize,

    /// Maximum number of SRs merged by one job.
    pub max_threshold: usize,

    /// Minimum droppable-tombstone ratio to trigger a tombstone-only rewrite.
    pub tombstone_threshold: f64,

    /// Minimum SR age before it is considered for a tombstone-only rewrite.
    pub tombstone_compaction_interval: Duration,

    /// Set for time-window tables that did not opt in to tombstone
    /// compaction explicitly.
    pub tombstone_compaction_disabled: bool,
}

impl Default for CommonOptions {
    fn default() -> Self {
        CommonOptions {
            min_threshold: DEFAULT_MIN_THRESHOLD,
            max_threshold: DEFAULT_MAX_THRESHOLD,
            tombstone_threshold: DEFAULT_TOMBSTONE_THRESHOLD,
            tombstone_compaction_interval: Duration::from_secs(
                DEFAULT_TOMBSTONE_COMPACTION_INTERVAL_SECS,
            ),
            tombstone_compaction_disabled: false,
        }
    }
}

impl CommonOptions {
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self, OptionsError> {
        let min_threshold = to_usize(
            MIN_THRESHOLD_OPTION,
            get(options, MIN_THRESHOLD_OPTION),
            DEFAULT_MIN_THRESHOLD,
        )?;
        if min_threshold < 2 {
            return Err(OptionsError::InvalidValue {
                name: MIN_THRESHOLD_OPTION,
                value: min_threshold.to_string(),
                reason: "must be at least 2",
            });
        }
        let max_threshold = to_usize(
            MAX_THRESHOLD_OPTION,
            get(options, MAX_THRESHOLD_OPTION),
            DEFAULT_MAX_THRESHOLD,
        )?;
        if max_threshold < min_threshold {
            return Err(OptionsError::InvalidValue {
                name: MAX_THRESHOLD_OPTION,
                value: max_threshold.to_string(),
                reason: "must be at least min_threshold",
            });
        }
        let tombstone_threshold = to_f64(
            TOMBSTONE_THRESHOLD_OPTION,
            get(options, TOMBSTONE_THRESHOLD_OPTION),
            DEFAULT_TOMBSTONE_THRESHOLD,
        )?;
        if !(0.0..=1.0).contains(&tombstone_threshold) {
            return Err(OptionsError::InvalidValue {
                name: TOMBSTONE_THRESHOLD_OPTION,
                value: tombstone_threshold.to_string(),
                reason: "must be within [0, 1]",
            });
        }
        let interval_secs = to_u64(
            TOMBSTONE_COMPACTION_INTERVAL_OPTION,
            get(options, TOMBSTONE_COMPACTION_INTERVAL_OPTION),
            DEFAULT_TOMBSTONE_COMPACTION_INTERVAL_SECS,
        )?;
        Ok(CommonOptions {
            min_threshold,
            max_threshold,
            tombstone_threshold,
            tombstone_compaction_interval: Duration::from_secs(interval_secs),
            tombstone_compaction_disabled: false,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Size-tiered options
// ------------------------------------------------------------------------------------------------

/// Bucketing knobs for the size-tiered family. Also used by leveled (L0) and
/// time-window (current window).
#[derive(Debug, Clone)]
pub struct StcsOptions {
    /// Lower bound multiplier: a run joins a bucket when its size is at
    /// least `bucket_avg × bucket_low`.
    pub bucket_low: f64,

    /// Upper bound multiplier for bucket membership.
    pub bucket_high: f64,

    /// Runs smaller than this all land in one bucket, regardless of ratio.
    pub min_sstable_size: u64,
}

impl Default for StcsOptions {
    fn default() -> Self {
        StcsOptions {
            bucket_low: DEFAULT_BUCKET_LOW,
            bucket_high: DEFAULT_BUCKET_HIGH,
            min_sstable_size: DEFAULT_MIN_SSTABLE_SIZE,
        }
    }
}

impl StcsOptions {
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self, OptionsError> {
        let bucket_low = to_f64(
            BUCKET_LOW_OPTION,
            get(options, BUCKET_LOW_OPTION),
            DEFAULT_BUCKET_LOW,
        )?;
        let bucket_high = to_f64(
            BUCKET_HIGH_OPTION,
            get(options, BUCKET_HIGH_OPTION),
            DEFAULT_BUCKET_HIGH,
        )?;
        if bucket_low <= 0.0 {
            return Err(OptionsError::InvalidValue {
                name: BUCKET_LOW_OPTION,
                value: bucket_low.to_string(),
                reason: "must be positive",
            });
        }
        if bucket_high <= bucket_low {
            return Err(OptionsError::InvalidValue {
                name: BUCKET_HIGH_OPTION,
                value: bucket_high.to_string(),
                reason: "must exceed bucket_low",
            });
        }
        let min_sstable_size = to_u64(
            MIN_SSTABLE_SIZE_OPTION,
            get(options, MIN_SSTABLE_SIZE_OPTION),
            DEFAULT_MIN_SSTABLE_SIZE,
        )?;
        Ok(StcsOptions {
            bucket_low,
            bucket_high,
            min_sstable_size,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Leveled options
// ------------------------------------------------------------------------------------------------

/// Options specific to the leveled family.
#[derive(Debug, Clone)]
pub struct LcsOptions {
    /// Target SR size, megabytes.
    pub sstable_size_in_mb: u64,
}

impl Default for LcsOptions {
    fn default() -> Self {
        LcsOptions {
            sstable_size_in_mb: DEFAULT_SSTABLE_SIZE_IN_MB,
        }
    }
}

impl LcsOptions {
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self, OptionsError> {
        let mb = to_u64(
            SSTABLE_SIZE_OPTION,
            get(options, SSTABLE_SIZE_OPTION),
            DEFAULT_SSTABLE_SIZE_IN_MB,
        )?;
        if mb == 0 {
            return Err(OptionsError::InvalidValue {
                name: SSTABLE_SIZE_OPTION,
                value: mb.to_string(),
                reason: "must be positive",
            });
        }
        if mb >= 1000 {
            warn!(
                sstable_size_in_mb = mb,
                "max sstable size this large makes a very coarse unit of compaction"
            );
        } else if mb < 50 {
            warn!(
                sstable_size_in_mb = mb,
                "max sstable size below 50MB; measured performance improves up to 160MB"
            );
        }
        Ok(LcsOptions {
            sstable_size_in_mb: mb,
        })
    }

    /// Target SR size in bytes.
    pub fn max_run_size(&self) -> u64 {
        self.sstable_size_in_mb * 1024 * 1024
    }
}

// ------------------------------------------------------------------------------------------------
// Time-window options
// ------------------------------------------------------------------------------------------------

/// Granularity of write timestamps as seen by window math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampResolution {
    Seconds,
    Milliseconds,
    #[default]
    Microseconds,
}

impl TimestampResolution {
    fn parse(value: &str) -> Result<Self, OptionsError> {
        match value {
            "SECONDS" => Ok(TimestampResolution::Seconds),
            "MILLISECONDS" => Ok(TimestampResolution::Milliseconds),
            "MICROSECONDS" => Ok(TimestampResolution::Microseconds),
            other => Err(OptionsError::InvalidValue {
                name: TIMESTAMP_RESOLUTION_OPTION,
                value: other.to_string(),
                reason: "expected SECONDS, MILLISECONDS or MICROSECONDS",
            }),
        }
    }

    /// Ticks per second at this resolution.
    pub fn per_second(&self) -> i64 {
        match self {
            TimestampResolution::Seconds => 1,
            TimestampResolution::Milliseconds => 1_000,
            TimestampResolution::Microseconds => 1_000_000,
        }
    }
}

/// Time unit of one compaction window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowUnit {
    Minutes,
    Hours,
    #[default]
    Days,
}

impl WindowUnit {
    fn parse(value: &str) -> Result<Self, OptionsError> {
        match value {
            "MINUTES" => Ok(WindowUnit::Minutes),
            "HOURS" => Ok(WindowUnit::Hours),
            "DAYS" => Ok(WindowUnit::Days),
            other => Err(OptionsError::InvalidValue {
                name: COMPACTION_WINDOW_UNIT_OPTION,
                value: other.to_string(),
                reason: "expected MINUTES, HOURS or DAYS",
            }),
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            WindowUnit::Minutes => 60,
            WindowUnit::Hours => 3_600,
            WindowUnit::Days => 86_400,
        }
    }
}

/// Options specific to the time-window family.
#[derive(Debug, Clone)]
pub struct TwcsOptions {
    pub timestamp_resolution: TimestampResolution,
    pub window_unit: WindowUnit,
    pub window_size: u64,
}

impl TwcsOptions {
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self, OptionsError> {
        let timestamp_resolution = match get(options, TIMESTAMP_RESOLUTION_OPTION) {
            Some(v) => TimestampResolution::parse(v)?,
            None => TimestampResolution::default(),
        };
        let window_unit = match get(options, COMPACTION_WINDOW_UNIT_OPTION) {
            Some(v) => WindowUnit::parse(v)?,
            None => WindowUnit::default(),
        };
        let window_size = to_u64(
            COMPACTION_WINDOW_SIZE_OPTION,
            get(options, COMPACTION_WINDOW_SIZE_OPTION),
            1,
        )?;
        if window_size == 0 {
            return Err(OptionsError::InvalidValue {
                name: COMPACTION_WINDOW_SIZE_OPTION,
                value: window_size.to_string(),
                reason: "must be positive",
            });
        }
        Ok(TwcsOptions {
            timestamp_resolution,
            window_unit,
            window_size,
        })
    }

    /// Window length in ticks of the configured resolution.
    pub fn window_size_in_resolution(&self) -> i64 {
        self.window_size as i64
            * self.window_unit.seconds()
            * self.timestamp_resolution.per_second()
    }
}

impl Default for TwcsOptions {
    fn default() -> Self {
        TwcsOptions {
            timestamp_resolution: TimestampResolution::default(),
            window_unit: WindowUnit::default(),
            window_size: 1,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Combined options
// ------------------------------------------------------------------------------------------------

/// Fully-parsed strategy configuration for one table.
#[derive(Debug, Clone)]
pub struct StrategyOptions {
    pub kind: StrategyKind,
    pub common: CommonOptions,
    pub stcs: StcsOptions,
    pub lcs: LcsOptions,
    pub twcs: TwcsOptions,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        StrategyOptions {
            kind: StrategyKind::SizeTiered,
            common: CommonOptions::default(),
            stcs: StcsOptions::default(),
            lcs: LcsOptions::default(),
            twcs: TwcsOptions::default(),
        }
    }
}

impl StrategyOptions {
    /// Parses and validates a full option map.
    pub fn parse(options: &BTreeMap<String, String>) -> Result<Self, OptionsError> {
        let kind = match get(options, CLASS_OPTION) {
            Some(class) => StrategyKind::parse(class)?,
            None => StrategyKind::SizeTiered,
        };
        if let Some(key) = options.keys().find(|k| !kind.accepts(k)) {
            return Err(OptionsError::UnknownOption(key.clone()));
        }

        let mut common = CommonOptions::parse(options)?;
        if kind == StrategyKind::TimeWindow
            && !options.contains_key(TOMBSTONE_THRESHOLD_OPTION)
            && !options.contains_key(TOMBSTONE_COMPACTION_INTERVAL_OPTION)
        {
            // Expired data leaves through whole-window compactions; only an
            // explicit opt-in enables single-run tombstone rewrites.
            common.tombstone_compaction_disabled = true;
        }

        Ok(StrategyOptions {
            kind,
            common,
            stcs: StcsOptions::parse(options)?,
            lcs: LcsOptions::parse(options)?,
            twcs: TwcsOptions::parse(options)?,
        })
    }
}
