//! Operator routes for presence and connection housekeeping.
//!
//! The background sweepers do the same work on a timer; these let an
//! operator force a pass with a custom threshold.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Json;
use serde::Deserialize;
use tracing::info;

use crate::services::presence::PresenceStatistics;
use crate::state::AppState;

/// `GET /api/presence/stats`: record counts per document.
pub async fn presence_stats(State(state): State<AppState>) -> Json<PresenceStatistics> {
    Json(state.presence.statistics().await)
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub timeout_minutes: Option<u64>,
}

/// `POST /api/presence/cleanup?timeout_minutes=N`: drop idle presence records.
/// Defaults to the configured activity timeout.
pub async fn presence_cleanup(State(state): State<AppState>, Query(query): Query<CleanupQuery>) -> Json<serde_json::Value> {
    let timeout = query
        .timeout_minutes
        .map_or(state.config.presence.activity_timeout, |minutes| Duration::from_secs(minutes.saturating_mul(60)));
    let removed = state.presence.cleanup_inactive(timeout).await;
    info!(removed, timeout_secs = timeout.as_secs(), "admin: presence cleanup");
    Json(serde_json::json!({ "ok": true, "removed": removed }))
}

#[derive(Debug, Deserialize)]
pub struct SweepQuery {
    pub timeout_secs: Option<u64>,
}

/// `POST /api/connections/sweep?timeout_secs=N`: drop silent connections.
/// Defaults to the configured stale timeout.
pub async fn sweep_connections(State(state): State<AppState>, Query(query): Query<SweepQuery>) -> Json<serde_json::Value> {
    let timeout = query
        .timeout_secs
        .map_or(state.config.stale_connection_timeout, Duration::from_secs);
    let removed = state.connections.sweep_stale(timeout).await;
    info!(removed, timeout_secs = timeout.as_secs(), "admin: connection sweep");
    Json(serde_json::json!({
        "ok": true,
        "removed": removed,
        "remaining": state.connections.connection_count().await,
    }))
}
