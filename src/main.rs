use std::sync::Arc;

use cadms_collab::config::{CollabConfig, FlushPolicy};
use cadms_collab::message::ServerMessage;
use cadms_collab::services::connection::ConnectionRegistry;
use cadms_collab::services::store::{DocumentStore, MemoryDocumentStore, PgDocumentStore};
use cadms_collab::{db, routes, services, state};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = CollabConfig::from_env();
    let port = config.port;

    let store: Arc<dyn DocumentStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::init_pool(url).await.expect("database init failed");
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; documents are kept in memory only");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let state = state::AppState::new(config, store);
    let config = Arc::clone(&state.config);

    // Spawn background housekeeping.
    let _sweeper = services::sweeper::spawn_stale_sweeper(
        state.connections.clone(),
        config.stale_sweep_interval,
        config.stale_connection_timeout,
    );
    let _presence_cleanup = config
        .presence_cleanup_interval
        .map(|period| services::sweeper::spawn_presence_cleanup(state.presence.clone(), period));
    let _flush = match state.documents.flush_policy() {
        FlushPolicy::Interval(period) => Some(services::persistence::spawn_flush_task(Arc::clone(&state.documents), period)),
        FlushPolicy::EveryOps(_) | FlushPolicy::OnDemand => None,
    };

    let documents = Arc::clone(&state.documents);
    let connections = state.connections.clone();
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, flush_policy = ?config.flush_policy, "cadms collaboration server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(connections))
        .await
        .expect("server failed");

    // Write back whatever the policy had not flushed yet.
    let dirty = documents.dirty_documents().await;
    tracing::info!(dirty = dirty.len(), "flushing documents before exit");
    let report = documents.flush_dirty().await;
    tracing::info!(flushed = report.flushed, failed = report.failed, "final document flush");
}

/// Resolve on Ctrl-C after telling every client the server is going away.
/// Their socket loops end on `connection_closed`, which lets the graceful
/// shutdown finish.
async fn shutdown_signal(connections: ConnectionRegistry) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    let notified = connections
        .broadcast(&ServerMessage::ConnectionClosed { reason: "shutdown".into() }, None)
        .await;
    tracing::info!(notified, "shutdown signal received");
}
