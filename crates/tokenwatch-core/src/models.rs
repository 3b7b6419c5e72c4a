use std::collections::BTreeMap;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session_id::is_valid_session_id;

/// Token counters carried by a single usage record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input (prompt) tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output (completion) tokens generated.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens written into the prompt cache.
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    /// Tokens read from the prompt cache.
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Sum of all four token categories.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// A single usage record decoded from one JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// UTC instant the record was emitted.
    pub timestamp: DateTime<Utc>,
    /// Canonical UUID of the session that produced the record.
    pub session_id: String,
    /// Short model identifier string.
    pub model: String,
    /// Token counters for this record.
    pub usage: TokenUsage,
    /// Monetary cost in US dollars, when the producer recorded one.
    #[serde(default)]
    pub cost_usd: Option<f64>,
    /// Unique message identifier.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Unique request identifier.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Producer version string.
    #[serde(default)]
    pub version: Option<String>,
    /// Working directory of the producing process.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl UsageRecord {
    /// Sum of the record's four token counters.
    pub fn total_tokens(&self) -> u64 {
        self.usage.total_tokens()
    }

    /// Check the record invariants.
    ///
    /// Returns `Err(reason)` when the record must be discarded:
    /// * zero timestamp,
    /// * session id not a canonical UUID,
    /// * empty model string.
    ///
    /// Token counters are unsigned and therefore non-negative by type.
    pub fn validate(&self) -> Result<(), String> {
        if self.timestamp.timestamp() == 0 && self.timestamp.timestamp_subsec_nanos() == 0 {
            return Err("zero timestamp".to_string());
        }
        if !is_valid_session_id(&self.session_id) {
            return Err(format!("invalid session id {:?}", self.session_id));
        }
        if self.model.is_empty() {
            return Err("empty model".to_string());
        }
        Ok(())
    }

    /// Deduplication hash `"{message_id}:{request_id}"`.
    ///
    /// Returns `None` when either component is absent. The ingestion
    /// pipeline itself is at-least-once and does not deduplicate; this
    /// is for downstream consumers that want to.
    pub fn unique_hash(&self) -> Option<String> {
        match (self.message_id.as_deref(), self.request_id.as_deref()) {
            (Some(mid), Some(rid)) => Some(format!("{}:{}", mid, rid)),
            _ => None,
        }
    }
}

/// A session log file located by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFile {
    /// UUID parsed from the filename (without the `.jsonl` suffix).
    pub session_id: String,
    /// Absolute path of the file.
    pub file_path: std::path::PathBuf,
    /// Directory containing the file.
    pub project_path: std::path::PathBuf,
    /// File size in bytes at discovery time.
    pub size: u64,
    /// Modification time at discovery time.
    pub mod_time: DateTime<Utc>,
}

/// A point-in-time copy of aggregated statistics.
///
/// Snapshots are fully owned: no field references live aggregator state,
/// so holders may read them without any locking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    /// Number of records aggregated.
    pub count: u64,
    /// Sum of per-record total tokens.
    pub total_tokens: u64,
    /// Sum of input tokens.
    pub input_tokens: u64,
    /// Sum of output tokens.
    pub output_tokens: u64,
    /// Smallest per-record total observed (0 when count is 0).
    pub min_tokens: u64,
    /// Largest per-record total observed.
    pub max_tokens: u64,
    /// `total_tokens / count` when count > 0.
    pub avg_tokens: f64,
    /// 50th percentile of per-record totals, when percentiles are enabled.
    #[serde(default)]
    pub p50: Option<f64>,
    /// 95th percentile of per-record totals.
    #[serde(default)]
    pub p95: Option<f64>,
    /// 99th percentile of per-record totals.
    #[serde(default)]
    pub p99: Option<f64>,
    /// Earliest record timestamp seen.
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    /// Latest record timestamp seen.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Per-group statistics, keyed by the joined dimension key.
    ///
    /// Ordered so grouped views render deterministically. Nested group
    /// maps are always empty.
    #[serde(default)]
    pub groups: BTreeMap<String, Statistics>,
}

impl Statistics {
    /// `true` when no records have been aggregated.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Field-wise non-negative difference `self - earlier` over the
    /// monotone counters.
    ///
    /// Min/max/percentiles and timestamps are not meaningful for a delta
    /// and are left at their defaults; `avg_tokens` is recomputed from the
    /// delta counters.
    pub fn delta_since(&self, earlier: &Statistics) -> Statistics {
        let count = self.count.saturating_sub(earlier.count);
        let total_tokens = self.total_tokens.saturating_sub(earlier.total_tokens);
        Statistics {
            count,
            total_tokens,
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            avg_tokens: if count > 0 {
                total_tokens as f64 / count as f64
            } else {
                0.0
            },
            ..Statistics::default()
        }
    }
}

/// Token consumption rate over a sliding window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BurnRate {
    /// Total tokens per minute across the window.
    pub tokens_per_minute: f64,
    /// Total tokens per hour (`tokens_per_minute * 60`).
    pub tokens_per_hour: f64,
    /// Input tokens per minute.
    pub input_per_minute: f64,
    /// Output tokens per minute.
    pub output_per_minute: f64,
    /// Number of entries inside the window.
    pub entry_count: u64,
    /// Sum of total tokens inside the window.
    pub total_tokens: u64,
    /// The window the rate was computed over.
    pub window_duration: Duration,
    /// `floor(tokens_per_minute * 60)`.
    pub projected_hourly_tokens: u64,
}

impl BurnRate {
    /// A zero rate for the given window.
    pub fn zero(window: Duration) -> Self {
        BurnRate {
            window_duration: window,
            ..BurnRate::default()
        }
    }
}

/// A fixed five-hour UTC accounting window.
///
/// Blocks start at UTC hours 0, 5, 10, 15 and 20; the 20:00 block crosses
/// midnight and ends at 01:00 the next day. Ends are exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingBlock {
    /// Inclusive start of the window.
    pub start_time: DateTime<Utc>,
    /// Exclusive end of the window, exactly five hours after the start.
    pub end_time: DateTime<Utc>,
    /// Whether the current UTC instant falls inside this window.
    pub is_active: bool,
    /// Sum of total tokens attributed to the window.
    pub total_tokens: u64,
    /// Sum of input tokens.
    pub input_tokens: u64,
    /// Sum of output tokens.
    pub output_tokens: u64,
    /// Number of entries attributed to the window.
    pub entry_count: u64,
}

/// One event on the live update stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    /// When this update was produced.
    pub timestamp: DateTime<Utc>,
    /// Current aggregator snapshot.
    pub stats: Statistics,
    /// The most recent non-zero change between consecutive updates.
    ///
    /// Holding the last non-zero delta keeps consumers showing the latest
    /// burst instead of flashing to zero between changes.
    pub delta: Statistics,
    /// Change accumulated since the monitor started.
    pub cumulative: Statistics,
    /// Burn rate over the trailing five minutes.
    pub burn_rate: BurnRate,
    /// The billing block containing the current instant (may be empty).
    pub current_block: BillingBlock,
    /// Session filter in effect, when exactly one session is monitored.
    #[serde(default)]
    pub session_filter: Option<String>,
    /// Renderer hint: clear the screen before drawing this update.
    #[serde(default)]
    pub clear_screen: bool,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
