use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dashboard_core::{StatsSnapshot, compute_stats_snapshot};

pub const DEFAULT_STATS_WINDOW: Duration = Duration::from_secs(60);

/// Final routing verdict of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Normal,
    Fallback,
}

impl Outcome {
    pub fn is_fallback(self) -> bool {
        matches!(self, Outcome::Fallback)
    }
}

/// Receives exactly one outcome per completed request. Must not block.
pub trait OutcomeSink: Send + Sync {
    fn record(&self, outcome: Outcome);
}

#[derive(Debug)]
struct StatsInner {
    recent: VecDeque<(Instant, Outcome)>,
    total_normal: u64,
    total_fallback: u64,
}

/// In-memory request counters: lifetime totals plus a sliding window for RPM.
#[derive(Debug)]
pub struct RequestStats {
    window: Duration,
    started_at: Instant,
    inner: Mutex<StatsInner>,
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new(DEFAULT_STATS_WINDOW)
    }
}

impl RequestStats {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_secs(1)),
            started_at: Instant::now(),
            inner: Mutex::new(StatsInner {
                recent: VecDeque::new(),
                total_normal: 0,
                total_fallback: 0,
            }),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        prune(&mut inner.recent, now, self.window);
        compute_stats_snapshot(
            inner.recent.iter().map(|(_, o)| *o),
            inner.total_normal,
            inner.total_fallback,
            self.window,
            now.saturating_duration_since(self.started_at),
        )
    }

    pub(crate) fn record_at(&self, outcome: Outcome, now: Instant) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        inner.recent.push_back((now, outcome));
        match outcome {
            Outcome::Normal => inner.total_normal = inner.total_normal.saturating_add(1),
            Outcome::Fallback => inner.total_fallback = inner.total_fallback.saturating_add(1),
        }
        debug!(
            outcome = ?outcome,
            total_normal = inner.total_normal,
            total_fallback = inner.total_fallback,
            "recorded request outcome"
        );
        prune(&mut inner.recent, now, self.window);
    }
}

impl OutcomeSink for RequestStats {
    fn record(&self, outcome: Outcome) {
        self.record_at(outcome, Instant::now());
    }
}

fn prune(recent: &mut VecDeque<(Instant, Outcome)>, now: Instant, window: Duration) {
    while let Some((at, _)) = recent.front() {
        if now.saturating_duration_since(*at) > window {
            recent.pop_front();
        } else {
            break;
        }
    }
}
