pub mod window_stats;

pub use window_stats::{StatsSnapshot, compute_stats_snapshot};
