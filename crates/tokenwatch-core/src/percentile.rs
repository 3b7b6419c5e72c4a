// ── Percentile helper ─────────────────────────────────────────────────────────

/// Compute the `p`-th percentile of a **sorted** slice using linear
/// interpolation between closest ranks (the NumPy `percentile` algorithm).
///
/// Rank is `p / 100 * (n - 1)`; percentiles at the extremes return the
/// boundary elements. Returns `0.0` for an empty slice.
pub fn percentile(sorted_data: &[u64], p: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }
    let len = sorted_data.len();
    if len == 1 {
        return sorted_data[0] as f64;
    }
    let rank = (p / 100.0) * (len as f64 - 1.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted_data[lo] as f64;
    }
    let frac = rank - lo as f64;
    let lo_val = sorted_data[lo] as f64;
    let hi_val = sorted_data[hi] as f64;
    lo_val + frac * (hi_val - lo_val)
}

/// The P50/P95/P99 triple reported in statistics snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileSet {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Compute P50/P95/P99 from an unsorted reservoir of per-record totals.
///
/// The input is copied and sorted; the reservoir itself is untouched.
/// Returns `None` for an empty reservoir.
pub fn compute_percentiles(reservoir: &[u64]) -> Option<PercentileSet> {
    if reservoir.is_empty() {
        return None;
    }
    let mut sorted = reservoir.to_vec();
    sorted.sort_unstable();
    Some(PercentileSet {
        p50: percentile(&sorted, 50.0),
        p95: percentile(&sorted, 95.0),
        p99: percentile(&sorted, 99.0),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
