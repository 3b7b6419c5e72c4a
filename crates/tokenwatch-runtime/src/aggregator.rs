//! Running usage statistics under concurrent access.
//!
//! One reader-writer lock guards all aggregator state: the overall
//! accumulator, the per-group accumulators, the percentile reservoir and
//! the chronological entry log used for burn-rate and billing-block
//! queries. Every query returns an independent snapshot, so callers never
//! hold aggregator references across their own work.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokenwatch_core::blocks::{block_contains, block_end, block_start, empty_block_at};
use tokenwatch_core::config::{AggregatorConfig, Dimension};
use tokenwatch_core::models::{BillingBlock, BurnRate, Statistics, UsageRecord};
use tokenwatch_core::percentile::compute_percentiles;

// ── Entry log ─────────────────────────────────────────────────────────────────

/// One ingested record reduced to what the time-window queries need.
#[derive(Debug, Clone)]
pub struct TimestampedEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TimestampedEntry {
    fn matches(&self, session_filter: &str) -> bool {
        session_filter.is_empty() || self.session_id == session_filter
    }
}

// ── Accumulator ───────────────────────────────────────────────────────────────

/// Mutable running statistics for one bucket (overall or one group).
#[derive(Debug, Default, Clone)]
struct StatsAccum {
    count: u64,
    total_tokens: u64,
    input_tokens: u64,
    output_tokens: u64,
    min_tokens: Option<u64>,
    max_tokens: u64,
    first_seen: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    /// Per-record totals, kept only when percentiles are enabled.
    reservoir: Vec<u64>,
}

impl StatsAccum {
    fn add(&mut self, record: &UsageRecord, keep_reservoir: bool) {
        let total = record.total_tokens();
        self.count += 1;
        self.total_tokens += total;
        self.input_tokens += record.usage.input_tokens;
        self.output_tokens += record.usage.output_tokens;
        self.min_tokens = Some(self.min_tokens.map_or(total, |m| m.min(total)));
        self.max_tokens = self.max_tokens.max(total);
        self.first_seen = Some(
            self.first_seen
                .map_or(record.timestamp, |t| t.min(record.timestamp)),
        );
        self.last_seen = Some(
            self.last_seen
                .map_or(record.timestamp, |t| t.max(record.timestamp)),
        );
        if keep_reservoir {
            self.reservoir.push(total);
        }
    }

    fn merge(&mut self, other: &StatsAccum) {
        self.count += other.count;
        self.total_tokens += other.total_tokens;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.min_tokens = match (self.min_tokens, other.min_tokens) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_tokens = self.max_tokens.max(other.max_tokens);
        self.first_seen = match (self.first_seen, other.first_seen) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_seen = match (self.last_seen, other.last_seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.reservoir.extend_from_slice(&other.reservoir);
    }

    fn snapshot(&self) -> Statistics {
        let percentiles = compute_percentiles(&self.reservoir);
        Statistics {
            count: self.count,
            total_tokens: self.total_tokens,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            min_tokens: self.min_tokens.unwrap_or(0),
            max_tokens: self.max_tokens,
            avg_tokens: if self.count > 0 {
                self.total_tokens as f64 / self.count as f64
            } else {
                0.0
            },
            p50: percentiles.map(|p| p.p50),
            p95: percentiles.map(|p| p.p95),
            p99: percentiles.map(|p| p.p99),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            groups: BTreeMap::new(),
        }
    }
}

// ── Top sessions ──────────────────────────────────────────────────────────────

/// A group key split back into its dimension components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupKeyParts {
    pub model: Option<String>,
    pub session: Option<String>,
    pub date: Option<String>,
    pub hour: Option<String>,
}

/// Merged statistics for one session, as returned by
/// [`UsageAggregator::top_sessions`].
#[derive(Debug, Clone)]
pub struct SessionUsage {
    /// The session id extracted from the group key.
    pub session_id: String,
    /// The model component of the key, when every group key for this
    /// session names the same model.
    pub model: Option<String>,
    /// Merged statistics across all group keys of the session.
    pub stats: Statistics,
}

// ── Aggregator ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Inner {
    overall: StatsAccum,
    groups: BTreeMap<String, StatsAccum>,
    entries: Vec<TimestampedEntry>,
}

/// Concurrent statistics aggregator.
pub struct UsageAggregator {
    config: AggregatorConfig,
    inner: RwLock<Inner>,
}

impl UsageAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Aggregator with grouping and percentiles disabled.
    pub fn ungrouped() -> Self {
        Self::new(AggregatorConfig::default())
    }

    // ── Ingestion ─────────────────────────────────────────────────────────

    /// Fold one record into the running statistics.
    pub fn add(&self, record: &UsageRecord) {
        let mut inner = self.write();
        inner.overall.add(record, self.config.percentiles);
        inner.entries.push(TimestampedEntry {
            timestamp: record.timestamp,
            session_id: record.session_id.clone(),
            input_tokens: record.usage.input_tokens,
            output_tokens: record.usage.output_tokens,
            total_tokens: record.total_tokens(),
        });
        if !self.config.group_by.is_empty() {
            let key = self.group_key(record);
            inner
                .groups
                .entry(key)
                .or_default()
                .add(record, self.config.percentiles);
        }
    }

    /// Zero every counter and empty every collection.
    pub fn reset(&self) {
        *self.write() = Inner::default();
    }

    // ── Snapshots ─────────────────────────────────────────────────────────

    /// Current overall statistics, with per-group sub-snapshots attached.
    pub fn stats(&self) -> Statistics {
        let inner = self.read();
        let mut snapshot = inner.overall.snapshot();
        snapshot.groups = inner
            .groups
            .iter()
            .map(|(key, accum)| (key.clone(), accum.snapshot()))
            .collect();
        snapshot
    }

    /// Number of entries in the chronological log.
    pub fn entry_count(&self) -> usize {
        self.read().entries.len()
    }

    /// The sessions with the highest total token counts.
    ///
    /// Requires the `session` dimension in the group-by configuration;
    /// returns an empty vector otherwise. `n <= 0` returns every session.
    pub fn top_sessions(&self, n: i64) -> Vec<SessionUsage> {
        if self.dimension_index(Dimension::Session).is_none() {
            return Vec::new();
        }

        let inner = self.read();
        let mut merged: BTreeMap<String, (Option<Option<String>>, StatsAccum)> = BTreeMap::new();

        for (key, accum) in &inner.groups {
            let parts = self.parse_group_key(key);
            let Some(session_id) = parts.session else {
                continue;
            };
            let model = parts.model;

            let slot = merged
                .entry(session_id)
                .or_insert_with(|| (None, StatsAccum::default()));
            // A session seen under two different models loses its model tag.
            slot.0 = match slot.0.take() {
                None => Some(model),
                Some(prev) if prev == model => Some(prev),
                Some(_) => Some(None),
            };
            slot.1.merge(accum);
        }

        let mut sessions: Vec<SessionUsage> = merged
            .into_iter()
            .map(|(session_id, (model, accum))| SessionUsage {
                session_id,
                model: model.flatten(),
                stats: accum.snapshot(),
            })
            .collect();
        sessions.sort_by(|a, b| b.stats.total_tokens.cmp(&a.stats.total_tokens));

        if n > 0 {
            sessions.truncate(n as usize);
        }
        sessions
    }

    // ── Burn rate ─────────────────────────────────────────────────────────

    /// Token consumption rate over the trailing `window`.
    ///
    /// An empty entry log yields a zero rate carrying the requested
    /// window. A zero window means "since the first logged entry". The
    /// rate divides by the full window even when the earliest matching
    /// entry is more recent, so a sparsely filled window reads low.
    pub fn burn_rate(&self, session_filter: &str, window: Duration) -> BurnRate {
        self.burn_rate_at(session_filter, window, Utc::now())
    }

    fn burn_rate_at(
        &self,
        session_filter: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BurnRate {
        let inner = self.read();
        if inner.entries.is_empty() {
            return BurnRate::zero(window);
        }

        let effective = if window.is_zero() {
            let first = inner
                .entries
                .iter()
                .map(|e| e.timestamp)
                .min()
                .unwrap_or(now);
            match (now - first).to_std() {
                Ok(elapsed) if !elapsed.is_zero() => elapsed,
                _ => return BurnRate::zero(window),
            }
        } else {
            window
        };

        let cutoff = now
            - chrono::Duration::from_std(effective).unwrap_or_else(|_| chrono::Duration::zero());

        let mut total = 0u64;
        let mut input = 0u64;
        let mut output = 0u64;
        let mut entry_count = 0u64;
        for entry in &inner.entries {
            if entry.timestamp >= cutoff && entry.matches(session_filter) {
                total += entry.total_tokens;
                input += entry.input_tokens;
                output += entry.output_tokens;
                entry_count += 1;
            }
        }

        let minutes = effective.as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return BurnRate::zero(effective);
        }

        let tokens_per_minute = total as f64 / minutes;
        BurnRate {
            tokens_per_minute,
            tokens_per_hour: tokens_per_minute * 60.0,
            input_per_minute: input as f64 / minutes,
            output_per_minute: output as f64 / minutes,
            entry_count,
            total_tokens: total,
            window_duration: effective,
            projected_hourly_tokens: (tokens_per_minute * 60.0).floor() as u64,
        }
    }

    // ── Billing blocks ────────────────────────────────────────────────────

    /// Entries grouped into five-hour UTC blocks, newest first.
    pub fn billing_blocks(&self, session_filter: &str) -> Vec<BillingBlock> {
        self.billing_blocks_at(session_filter, Utc::now())
    }

    fn billing_blocks_at(&self, session_filter: &str, now: DateTime<Utc>) -> Vec<BillingBlock> {
        let inner = self.read();
        let active_start = block_start(now);

        let mut by_start: BTreeMap<DateTime<Utc>, BillingBlock> = BTreeMap::new();
        for entry in &inner.entries {
            if !entry.matches(session_filter) {
                continue;
            }
            let start = block_start(entry.timestamp);
            let block = by_start.entry(start).or_insert_with(|| BillingBlock {
                start_time: start,
                end_time: block_end(entry.timestamp),
                is_active: start == active_start,
                total_tokens: 0,
                input_tokens: 0,
                output_tokens: 0,
                entry_count: 0,
            });
            block.total_tokens += entry.total_tokens;
            block.input_tokens += entry.input_tokens;
            block.output_tokens += entry.output_tokens;
            block.entry_count += 1;
        }

        by_start.into_values().rev().collect()
    }

    /// The (possibly empty) block containing the current UTC instant.
    pub fn current_billing_block(&self, session_filter: &str) -> BillingBlock {
        self.current_billing_block_at(session_filter, Utc::now())
    }

    fn current_billing_block_at(
        &self,
        session_filter: &str,
        now: DateTime<Utc>,
    ) -> BillingBlock {
        let active_start = block_start(now);
        self.billing_blocks_at(session_filter, now)
            .into_iter()
            .find(|b| block_contains(b.start_time, now) && b.start_time == active_start)
            .unwrap_or_else(|| empty_block_at(now))
    }

    // ── Group keys ────────────────────────────────────────────────────────

    /// The group key of a record under the configured dimensions.
    pub fn group_key(&self, record: &UsageRecord) -> String {
        self.config
            .group_by
            .iter()
            .map(|dim| dimension_component(*dim, record))
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }

    /// Invert [`group_key`]: split a key back into its dimension
    /// components using the configured layout.
    ///
    /// Components beyond the configured dimension count (a separator
    /// inside a model string, say) are ignored; missing components stay
    /// `None`.
    ///
    /// [`group_key`]: UsageAggregator::group_key
    pub fn parse_group_key(&self, key: &str) -> GroupKeyParts {
        let mut parts = GroupKeyParts::default();
        for (component, dim) in key.split(KEY_SEPARATOR).zip(self.config.group_by.iter()) {
            let value = Some(component.to_string());
            match dim {
                Dimension::Model => parts.model = value,
                Dimension::Session => parts.session = value,
                Dimension::Date => parts.date = value,
                Dimension::Hour => parts.hour = value,
            }
        }
        parts
    }

    /// Position of `dim` in the configured key layout.
    fn dimension_index(&self, dim: Dimension) -> Option<usize> {
        self.config.group_by.iter().position(|d| *d == dim)
    }

    // ── Locking ───────────────────────────────────────────────────────────

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Separator between key components.
const KEY_SEPARATOR: &str = "|";

fn dimension_component(dim: Dimension, record: &UsageRecord) -> String {
    match dim {
        Dimension::Model => record.model.clone(),
        Dimension::Session => record.session_id.clone(),
        Dimension::Date => record.timestamp.format("%Y-%m-%d").to_string(),
        Dimension::Hour => record.timestamp.format("%Y-%m-%d %H:00").to_string(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokenwatch_core::models::TokenUsage;

    const SESSION_A: &str = "2c84a9ff-12de-4f08-9be1-30c6f3f19a8a";
    const SESSION_B: &str = "7b1d03aa-45cd-4e11-9f02-aa10b94c2d17";

    fn record(ts: DateTime<Utc>, session: &str, model: &str, input: u64, output: u64) -> UsageRecord {
        UsageRecord {
            timestamp: ts,
            session_id: session.to_string(),
            model: model.to_string(),
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
            },
            cost_usd: None,
            message_id: None,
            request_id: None,
            version: None,
            cwd: None,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, h, m, 0).unwrap()
    }

    fn grouped(dims: &[Dimension]) -> UsageAggregator {
        UsageAggregator::new(AggregatorConfig {
            group_by: dims.to_vec(),
            percentiles: false,
        })
    }

    // ── overall stats ─────────────────────────────────────────────────────

    #[test]
    fn test_stats_reduction() {
        let agg = UsageAggregator::ungrouped();
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 100, 50));
        agg.add(&record(at(10, 5), SESSION_A, "sonnet", 200, 100));

        let stats = agg.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_tokens, 450);
        assert_eq!(stats.input_tokens, 300);
        assert_eq!(stats.output_tokens, 150);
        assert_eq!(stats.min_tokens, 150);
        assert_eq!(stats.max_tokens, 300);
        assert!((stats.avg_tokens - 225.0).abs() < f64::EPSILON);
        assert_eq!(stats.first_seen, Some(at(10, 0)));
        assert_eq!(stats.last_seen, Some(at(10, 5)));
    }

    #[test]
    fn test_first_last_seen_track_timestamps_not_ingestion_order() {
        let agg = UsageAggregator::ungrouped();
        agg.add(&record(at(12, 0), SESSION_A, "sonnet", 1, 1));
        agg.add(&record(at(9, 0), SESSION_A, "sonnet", 1, 1));

        let stats = agg.stats();
        assert_eq!(stats.first_seen, Some(at(9, 0)));
        assert_eq!(stats.last_seen, Some(at(12, 0)));
    }

    #[test]
    fn test_count_increases_by_one_per_add() {
        let agg = UsageAggregator::ungrouped();
        for i in 0..5 {
            let before = agg.stats().count;
            agg.add(&record(at(10, i), SESSION_A, "sonnet", 10, 5));
            assert_eq!(agg.stats().count, before + 1);
        }
    }

    #[test]
    fn test_empty_stats() {
        let stats = UsageAggregator::ungrouped().stats();
        assert!(stats.is_empty());
        assert_eq!(stats.min_tokens, 0);
        assert_eq!(stats.max_tokens, 0);
        assert_eq!(stats.avg_tokens, 0.0);
        assert!(stats.first_seen.is_none());
    }

    // ── reset ─────────────────────────────────────────────────────────────

    #[test]
    fn test_reset_clears_everything() {
        let agg = UsageAggregator::new(AggregatorConfig {
            group_by: vec![Dimension::Session],
            percentiles: true,
        });
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 100, 50));
        assert_eq!(agg.stats().count, 1);

        agg.reset();
        let stats = agg.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.total_tokens, 0);
        assert!(stats.groups.is_empty());
        assert!(stats.p50.is_none());
        assert_eq!(agg.entry_count(), 0);
    }

    // ── percentiles ───────────────────────────────────────────────────────

    #[test]
    fn test_percentiles_when_enabled() {
        let agg = UsageAggregator::new(AggregatorConfig {
            group_by: vec![],
            percentiles: true,
        });
        for (input, output) in [(50, 50), (75, 75), (100, 100), (125, 125), (150, 150)] {
            agg.add(&record(at(10, 0), SESSION_A, "sonnet", input, output));
        }
        // Totals: 100, 150, 200, 250, 300.
        let stats = agg.stats();
        assert_eq!(stats.p50, Some(200.0));
        let p95 = stats.p95.unwrap();
        let p99 = stats.p99.unwrap();
        assert!((280.0..=300.0).contains(&p95));
        assert!((290.0..=300.0).contains(&p99));
    }

    #[test]
    fn test_percentiles_absent_when_disabled() {
        let agg = UsageAggregator::ungrouped();
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 100, 100));
        assert!(agg.stats().p50.is_none());
    }

    // ── grouping ──────────────────────────────────────────────────────────

    #[test]
    fn test_group_key_order_follows_config() {
        let rec = record(at(14, 30), SESSION_A, "sonnet", 1, 1);

        let by_model_session = grouped(&[Dimension::Model, Dimension::Session]);
        assert_eq!(
            by_model_session.group_key(&rec),
            format!("sonnet|{SESSION_A}")
        );

        let by_date_hour = grouped(&[Dimension::Date, Dimension::Hour]);
        assert_eq!(
            by_date_hour.group_key(&rec),
            "2024-06-15|2024-06-15 14:00"
        );
    }

    #[test]
    fn test_grouped_buckets_accumulate() {
        let agg = grouped(&[Dimension::Session]);
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 100, 50));
        agg.add(&record(at(10, 1), SESSION_A, "sonnet", 100, 50));
        agg.add(&record(at(10, 2), SESSION_B, "sonnet", 10, 5));

        let stats = agg.stats();
        assert_eq!(stats.groups.len(), 2);
        assert_eq!(stats.groups[SESSION_A].count, 2);
        assert_eq!(stats.groups[SESSION_A].total_tokens, 300);
        assert_eq!(stats.groups[SESSION_B].count, 1);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let agg = UsageAggregator::ungrouped();
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 100, 50));
        let before = agg.stats();
        agg.add(&record(at(10, 1), SESSION_A, "sonnet", 100, 50));
        // The earlier snapshot is unaffected by later ingestion.
        assert_eq!(before.count, 1);
        assert_eq!(agg.stats().count, 2);
    }

    // ── top_sessions ──────────────────────────────────────────────────────

    #[test]
    fn test_top_sessions_sorted_desc() {
        let agg = grouped(&[Dimension::Session]);
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 10, 5));
        agg.add(&record(at(10, 1), SESSION_B, "sonnet", 1_000, 500));

        let top = agg.top_sessions(10);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].session_id, SESSION_B);
        assert_eq!(top[0].stats.total_tokens, 1_500);
        assert_eq!(top[1].session_id, SESSION_A);
    }

    #[test]
    fn test_top_sessions_merges_across_keys() {
        // Grouped by session and date: one session spread over two days.
        let agg = grouped(&[Dimension::Session, Dimension::Date]);
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 100, 0));
        let next_day = Utc.with_ymd_and_hms(2024, 6, 16, 10, 0, 0).unwrap();
        agg.add(&record(next_day, SESSION_A, "sonnet", 200, 0));

        let top = agg.top_sessions(0);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].stats.count, 2);
        assert_eq!(top[0].stats.total_tokens, 300);
    }

    #[test]
    fn test_top_sessions_model_component() {
        let agg = grouped(&[Dimension::Session, Dimension::Model]);
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 10, 0));
        agg.add(&record(at(10, 1), SESSION_B, "sonnet", 10, 0));
        agg.add(&record(at(10, 2), SESSION_B, "opus", 10, 0));

        let top = agg.top_sessions(0);
        let a = top.iter().find(|s| s.session_id == SESSION_A).unwrap();
        let b = top.iter().find(|s| s.session_id == SESSION_B).unwrap();
        assert_eq!(a.model.as_deref(), Some("sonnet"));
        // Two models under one session: no single model tag.
        assert!(b.model.is_none());
    }

    #[test]
    fn test_top_sessions_limit() {
        let agg = grouped(&[Dimension::Session]);
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 10, 0));
        agg.add(&record(at(10, 1), SESSION_B, "sonnet", 20, 0));
        assert_eq!(agg.top_sessions(1).len(), 1);
        assert_eq!(agg.top_sessions(0).len(), 2);
        assert_eq!(agg.top_sessions(-1).len(), 2);
    }

    #[test]
    fn test_top_sessions_without_session_dimension() {
        let agg = grouped(&[Dimension::Model]);
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 10, 0));
        assert!(agg.top_sessions(5).is_empty());
    }

    // ── parse_group_key ───────────────────────────────────────────────────

    #[test]
    fn test_parse_group_key_round_trip() {
        let agg = grouped(&[Dimension::Model, Dimension::Session, Dimension::Date]);
        let rec = record(at(14, 30), SESSION_A, "sonnet", 1, 1);
        let key = agg.group_key(&rec);

        let parts = agg.parse_group_key(&key);
        assert_eq!(parts.model.as_deref(), Some("sonnet"));
        assert_eq!(parts.session.as_deref(), Some(SESSION_A));
        assert_eq!(parts.date.as_deref(), Some("2024-06-15"));
        assert!(parts.hour.is_none());
    }

    #[test]
    fn test_parse_group_key_short_key() {
        let agg = grouped(&[Dimension::Session, Dimension::Hour]);
        let parts = agg.parse_group_key(SESSION_A);
        assert_eq!(parts.session.as_deref(), Some(SESSION_A));
        assert!(parts.hour.is_none());
    }

    // ── burn rate ─────────────────────────────────────────────────────────

    #[test]
    fn test_burn_rate_five_minute_window() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        agg.add(&record(now - chrono::Duration::minutes(4), SESSION_A, "sonnet", 100, 50));
        agg.add(&record(now - chrono::Duration::minutes(2), SESSION_A, "sonnet", 200, 100));
        agg.add(&record(now - chrono::Duration::minutes(1), SESSION_A, "sonnet", 150, 75));

        let rate = agg.burn_rate_at("", Duration::from_secs(300), now);
        assert_eq!(rate.total_tokens, 675);
        assert_eq!(rate.entry_count, 3);
        assert!((rate.tokens_per_minute - 135.0).abs() < 1e-9);
        assert!((rate.tokens_per_hour - 8_100.0).abs() < 1e-6);
        assert_eq!(rate.projected_hourly_tokens, 8_100);
    }

    #[test]
    fn test_burn_rate_empty_log_is_zero() {
        let agg = UsageAggregator::ungrouped();
        let rate = agg.burn_rate("", Duration::from_secs(300));
        assert_eq!(rate.tokens_per_minute, 0.0);
        assert_eq!(rate.window_duration, Duration::from_secs(300));
    }

    #[test]
    fn test_burn_rate_excludes_entries_before_cutoff() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        agg.add(&record(now - chrono::Duration::minutes(30), SESSION_A, "sonnet", 999, 0));
        agg.add(&record(now - chrono::Duration::minutes(1), SESSION_A, "sonnet", 100, 0));

        let rate = agg.burn_rate_at("", Duration::from_secs(300), now);
        assert_eq!(rate.total_tokens, 100);
        assert_eq!(rate.entry_count, 1);
    }

    #[test]
    fn test_burn_rate_session_filter() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        agg.add(&record(now - chrono::Duration::minutes(1), SESSION_A, "sonnet", 100, 0));
        agg.add(&record(now - chrono::Duration::minutes(1), SESSION_B, "sonnet", 900, 0));

        let rate = agg.burn_rate_at(SESSION_A, Duration::from_secs(300), now);
        assert_eq!(rate.total_tokens, 100);
        let all = agg.burn_rate_at("", Duration::from_secs(300), now);
        assert_eq!(all.total_tokens, 1_000);
    }

    #[test]
    fn test_burn_rate_zero_window_uses_elapsed() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        // First entry ten minutes ago: 600 tokens over 10 minutes.
        agg.add(&record(now - chrono::Duration::minutes(10), SESSION_A, "sonnet", 300, 0));
        agg.add(&record(now - chrono::Duration::minutes(5), SESSION_A, "sonnet", 300, 0));

        let rate = agg.burn_rate_at("", Duration::ZERO, now);
        assert!((rate.tokens_per_minute - 60.0).abs() < 1e-9);
        assert_eq!(rate.window_duration, Duration::from_secs(600));
    }

    #[test]
    fn test_burn_rate_zero_window_no_elapsed() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        agg.add(&record(now, SESSION_A, "sonnet", 100, 0));
        let rate = agg.burn_rate_at("", Duration::ZERO, now);
        assert_eq!(rate.tokens_per_minute, 0.0);
    }

    // ── billing blocks ────────────────────────────────────────────────────

    #[test]
    fn test_billing_blocks_two_windows() {
        let agg = UsageAggregator::ungrouped();
        // "Now" inside the [10:00, 15:00) block.
        let now = at(12, 0);
        agg.add(&record(now, SESSION_A, "sonnet", 100, 50));
        agg.add(&record(now - chrono::Duration::hours(6), SESSION_A, "sonnet", 10, 5));

        let blocks = agg.billing_blocks_at("", now);
        assert_eq!(blocks.len(), 2);
        // Newest first, marked active, carrying the current entry.
        assert!(blocks[0].is_active);
        assert_eq!(blocks[0].start_time, at(10, 0));
        assert_eq!(blocks[0].end_time, at(15, 0));
        assert_eq!(blocks[0].total_tokens, 150);
        assert_eq!(blocks[0].entry_count, 1);
        // The older block holds the older entry and is inactive.
        assert!(!blocks[1].is_active);
        assert_eq!(blocks[1].total_tokens, 15);
        assert!(blocks[1].start_time < blocks[0].start_time);
    }

    #[test]
    fn test_billing_blocks_window_math() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        agg.add(&record(at(10, 0), SESSION_A, "sonnet", 1, 0));
        agg.add(&record(at(14, 59), SESSION_A, "sonnet", 2, 0));

        // Both entries land in the same [10:00, 15:00) block.
        let blocks = agg.billing_blocks_at("", now);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].entry_count, 2);
        assert_eq!(blocks[0].total_tokens, 3);
    }

    #[test]
    fn test_current_billing_block_with_entries() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        agg.add(&record(now, SESSION_A, "sonnet", 100, 50));

        let block = agg.current_billing_block_at("", now);
        assert!(block.is_active);
        assert_eq!(block.total_tokens, 150);
        assert_eq!(block.start_time, at(10, 0));
    }

    #[test]
    fn test_current_billing_block_empty() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        let block = agg.current_billing_block_at("", now);
        assert!(block.is_active);
        assert_eq!(block.entry_count, 0);
        assert_eq!(block.total_tokens, 0);
        assert_eq!(block.start_time, at(10, 0));
        assert_eq!(block.end_time, at(15, 0));
    }

    #[test]
    fn test_current_billing_block_session_filter() {
        let agg = UsageAggregator::ungrouped();
        let now = at(12, 0);
        agg.add(&record(now, SESSION_A, "sonnet", 100, 0));
        agg.add(&record(now, SESSION_B, "sonnet", 900, 0));

        let block = agg.current_billing_block_at(SESSION_A, now);
        assert_eq!(block.total_tokens, 100);
    }

    // ── concurrency ───────────────────────────────────────────────────────

    #[test]
    fn test_concurrent_adds() {
        use std::sync::Arc;
        let agg = Arc::new(UsageAggregator::ungrouped());
        let mut handles = Vec::new();
        for t in 0..4 {
            let agg = Arc::clone(&agg);
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    agg.add(&record(at(10, 0), SESSION_A, "sonnet", t + i, 0));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(agg.stats().count, 1_000);
        assert_eq!(agg.entry_count(), 1_000);
    }
}
