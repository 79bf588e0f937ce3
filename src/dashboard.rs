use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::routing::get;

use crate::dashboard_core::StatsSnapshot;
use crate::state::RequestStats;

/// Stats surface served on its own port, next to the proxy listener.
pub fn router(stats: Arc<RequestStats>) -> Router {
    async fn api_stats(stats: Arc<RequestStats>) -> Json<StatsSnapshot> {
        Json(stats.snapshot())
    }

    Router::new().route("/api/stats", get(move || api_stats(stats.clone())))
}
