//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is built once at startup and injected into Axum handlers via
//! the `State` extractor. Every field is a cheap handle to process-wide
//! state: the connection registry (with room membership), the presence
//! tracker, and the document engine. Tests build their own instance, so no
//! state is global.

use std::sync::Arc;

use crate::config::CollabConfig;
use crate::services::connection::ConnectionRegistry;
use crate::services::document::DocumentEngine;
use crate::services::presence::PresenceTracker;
use crate::services::store::DocumentStore;

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all fields are handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CollabConfig>,
    pub connections: ConnectionRegistry,
    pub presence: PresenceTracker,
    pub documents: Arc<DocumentEngine>,
}

impl AppState {
    #[must_use]
    pub fn new(config: CollabConfig, store: Arc<dyn DocumentStore>) -> Self {
        let documents = Arc::new(DocumentEngine::with_store(store, config.flush_policy));
        Self {
            presence: PresenceTracker::new(config.presence),
            connections: ConnectionRegistry::new(),
            documents,
            config: Arc::new(config),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
