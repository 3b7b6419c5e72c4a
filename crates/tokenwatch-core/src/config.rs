use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Largest session file the parser will open.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Largest single JSONL line the parser will decode.
pub const DEFAULT_MAX_LINE_BYTES: u64 = 1024 * 1024;

/// Read attempts before a transient error is returned to the caller.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the reader's exponential backoff.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Quiet interval the watcher waits for before emitting a change event.
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive backend failures before the watcher stops draining.
pub const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// Cadence of the live monitor's periodic sweep.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the bounded update channel.
pub const DEFAULT_UPDATE_CHANNEL_CAPACITY: usize = 16;

// ── Reader ────────────────────────────────────────────────────────────────────

/// Tuning knobs for the incremental reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Retry attempts for transient errors.
    pub max_retries: u32,
    /// Base backoff delay; attempt `n` sleeps `retry_delay * 2^(n-1)`.
    pub retry_delay: Duration,
    /// Files larger than this are rejected outright.
    pub max_file_size: u64,
    /// Lines longer than this are skipped.
    pub max_line_bytes: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

// ── Watcher ───────────────────────────────────────────────────────────────────

/// Tuning knobs for the debounced directory watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Quiet interval before a burst of raw events is flushed as one.
    pub debounce_interval: Duration,
    /// Consecutive backend failures that open the circuit breaker.
    pub circuit_breaker_threshold: u32,
    /// Capacity of the bounded event channel; full sends are dropped.
    pub event_channel_capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_interval: DEFAULT_DEBOUNCE_INTERVAL,
            circuit_breaker_threshold: DEFAULT_CIRCUIT_BREAKER_THRESHOLD,
            event_channel_capacity: 256,
        }
    }
}

// ── Aggregator ────────────────────────────────────────────────────────────────

/// Dimensions a group key may be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// The record's model string.
    Model,
    /// The record's session id.
    Session,
    /// The record's UTC date, `YYYY-MM-DD`.
    Date,
    /// The record's UTC hour, `YYYY-MM-DD HH:00`.
    Hour,
}

impl Dimension {
    /// Parse a dimension name as it appears in configuration.
    pub fn parse(name: &str) -> Option<Dimension> {
        match name {
            "model" => Some(Dimension::Model),
            "session" => Some(Dimension::Session),
            "date" => Some(Dimension::Date),
            "hour" => Some(Dimension::Hour),
            _ => None,
        }
    }

    /// Configuration name of the dimension.
    pub fn name(&self) -> &'static str {
        match self {
            Dimension::Model => "model",
            Dimension::Session => "session",
            Dimension::Date => "date",
            Dimension::Hour => "hour",
        }
    }
}

/// Configuration of the statistics aggregator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Dimensions joined (in order) into the group key; empty disables
    /// grouping.
    pub group_by: Vec<Dimension>,
    /// Whether the percentile reservoir is maintained.
    pub percentiles: bool,
}

// ── Monitor ───────────────────────────────────────────────────────────────────

/// Configuration of the live monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sessions to monitor; empty means every discovered session.
    pub session_ids: Vec<String>,
    /// Cadence of the periodic sweep and minimum update frequency.
    pub refresh_interval: Duration,
    /// Renderer hint forwarded on every update.
    pub clear_screen: bool,
    /// Capacity of the bounded update channel.
    pub update_channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            session_ids: Vec::new(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            clear_screen: false,
            update_channel_capacity: DEFAULT_UPDATE_CHANNEL_CAPACITY,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_defaults() {
        let cfg = ReaderConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay, Duration::from_millis(100));
        assert_eq!(cfg.max_file_size, 100 * 1024 * 1024);
        assert_eq!(cfg.max_line_bytes, 1024 * 1024);
    }

    #[test]
    fn test_watcher_defaults() {
        let cfg = WatcherConfig::default();
        assert_eq!(cfg.debounce_interval, Duration::from_millis(100));
        assert_eq!(cfg.circuit_breaker_threshold, 5);
    }

    #[test]
    fn test_monitor_defaults() {
        let cfg = MonitorConfig::default();
        assert!(cfg.session_ids.is_empty());
        assert_eq!(cfg.refresh_interval, Duration::from_secs(1));
        assert!(!cfg.clear_screen);
    }

    #[test]
    fn test_dimension_parse_round_trip() {
        for name in ["model", "session", "date", "hour"] {
            let dim = Dimension::parse(name).unwrap();
            assert_eq!(dim.name(), name);
        }
        assert!(Dimension::parse("project").is_none());
    }
}
