use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::models::BillingBlock;

/// Width of one billing block.
pub const BLOCK_HOURS: i64 = 5;

/// The UTC start of the billing block containing `t`.
///
/// Blocks align to UTC midnight at multiples of five hours: a timestamp
/// with UTC hour H lives in the block starting at `(H / 5) * 5` on the
/// same UTC date.
pub fn block_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let start_hour = (t.hour() / BLOCK_HOURS as u32) * BLOCK_HOURS as u32;
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), start_hour, 0, 0)
        .single()
        .unwrap_or(t)
}

/// The exclusive UTC end of the block containing `t`.
///
/// The 20:00 block crosses midnight and ends at 01:00 the next day.
pub fn block_end(t: DateTime<Utc>) -> DateTime<Utc> {
    block_start(t) + Duration::hours(BLOCK_HOURS)
}

/// `true` when `t` falls inside the block starting at `start`.
pub fn block_contains(start: DateTime<Utc>, t: DateTime<Utc>) -> bool {
    t >= start && t < start + Duration::hours(BLOCK_HOURS)
}

/// An empty block spanning the window that contains `now`.
pub fn empty_block_at(now: DateTime<Utc>) -> BillingBlock {
    let start = block_start(now);
    BillingBlock {
        start_time: start,
        end_time: start + Duration::hours(BLOCK_HOURS),
        is_active: true,
        total_tokens: 0,
        input_tokens: 0,
        output_tokens: 0,
        entry_count: 0,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
