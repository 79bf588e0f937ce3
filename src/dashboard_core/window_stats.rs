use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::Outcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_normal: u64,
    pub total_fallback: u64,
    /// Percent of all requests that ended on the fallback upstream.
    pub fallback_rate: f64,
    pub window_seconds: u64,
    pub window_normal: usize,
    pub window_fallback: usize,
    pub window_total: usize,
    pub window_fallback_rate: f64,
    pub rpm_normal: f64,
    pub rpm_fallback: f64,
    pub rpm_total: f64,
    pub uptime_seconds: u64,
    pub uptime_formatted: String,
}

pub fn compute_stats_snapshot<I>(
    window_outcomes: I,
    total_normal: u64,
    total_fallback: u64,
    window: Duration,
    uptime: Duration,
) -> StatsSnapshot
where
    I: IntoIterator<Item = Outcome>,
{
    fn percent(part: f64, whole: f64) -> f64 {
        if whole > 0.0 {
            round2(part / whole * 100.0)
        } else {
            0.0
        }
    }

    let mut out = StatsSnapshot::default();
    for outcome in window_outcomes {
        out.window_total += 1;
        if outcome.is_fallback() {
            out.window_fallback += 1;
        } else {
            out.window_normal += 1;
        }
    }

    let window_secs = window.as_secs().max(1);
    let per_minute = 60.0 / window_secs as f64;

    out.total_normal = total_normal;
    out.total_fallback = total_fallback;
    out.total_requests = total_normal.saturating_add(total_fallback);
    out.fallback_rate = percent(total_fallback as f64, out.total_requests as f64);
    out.window_seconds = window_secs;
    out.window_fallback_rate = percent(out.window_fallback as f64, out.window_total as f64);
    out.rpm_normal = round2(out.window_normal as f64 * per_minute);
    out.rpm_fallback = round2(out.window_fallback as f64 * per_minute);
    out.rpm_total = round2(out.window_total as f64 * per_minute);
    out.uptime_seconds = uptime.as_secs();
    out.uptime_formatted = format_uptime(uptime);
    out
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `1h 2m 3s`, `2m 3s` or `3s`; sub-second precision is dropped.
pub fn format_uptime(uptime: Duration) -> String {
    humantime::format_duration(Duration::from_secs(uptime.as_secs())).to_string()
}
