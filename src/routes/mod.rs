//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router carries the collaboration WebSocket at `/api/ws`, a small
//! REST surface for inspecting and administering documents, presence and
//! connections, and `/healthz` for load balancers.

pub mod admin;
pub mod documents;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route(
            "/api/documents/{id}",
            get(documents::get_document).post(documents::create_document),
        )
        .route("/api/documents/{id}/text", get(documents::get_document_text))
        .route("/api/documents/{id}/operations", get(documents::get_operations))
        .route("/api/documents/{id}/snapshot", post(documents::create_snapshot))
        .route("/api/documents/{id}/persist", post(documents::persist_document))
        .route("/api/documents/{id}/queue", post(documents::queue_operation))
        .route("/api/documents/{id}/queue/{user_id}", get(documents::get_queue))
        .route("/api/documents/{id}/resolve", post(documents::resolve_operations))
        .route("/api/documents/{id}/presence", get(documents::get_presence))
        .route("/api/documents/{id}/presence/{user_id}", get(documents::get_user_presence))
        .route("/api/presence/stats", get(admin::presence_stats))
        .route("/api/presence/cleanup", post(admin::presence_cleanup))
        .route("/api/connections/sweep", post(admin::sweep_connections))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
