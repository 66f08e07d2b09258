//! Document inspection and administration routes.
//!
//! These sit beside the WebSocket protocol for tooling and operators. They
//! call the same engine the socket does and never broadcast; peers learn
//! about queued operations when their author rejoins.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::delta::{Delta, extract_text_from_delta};
use crate::ids::{DocumentId, UserId};
use crate::services::document::{DocumentError, DocumentSnapshot, DocumentState, OperationLogEntry, QueuedOperation};
use crate::services::presence::PresenceView;
use crate::state::AppState;

pub(crate) fn document_error_to_status(err: &DocumentError) -> StatusCode {
    match err {
        DocumentError::NotFound(_) => StatusCode::NOT_FOUND,
        DocumentError::AlreadyExists(_) => StatusCode::CONFLICT,
        DocumentError::Malformed(_) | DocumentError::BaseVersionUnavailable { .. } => StatusCode::BAD_REQUEST,
        DocumentError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        DocumentError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn log_and_map(document_id: &DocumentId, err: DocumentError) -> StatusCode {
    let status = document_error_to_status(&err);
    if status.is_server_error() {
        warn!(%document_id, error = %err, "documents: request failed");
    }
    status
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateDocumentBody {
    #[serde(default)]
    pub content: Option<Delta>,
}

/// `POST /api/documents/:id`: create a document at version 0.
pub async fn create_document(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
    body: Option<Json<CreateDocumentBody>>,
) -> Result<(StatusCode, Json<DocumentState>), StatusCode> {
    let content = body
        .and_then(|Json(body)| body.content)
        .unwrap_or_default();
    let document = state
        .documents
        .create_document(&document_id, content)
        .await
        .map_err(|e| log_and_map(&document_id, e))?;
    Ok((StatusCode::CREATED, Json(document)))
}

/// `GET /api/documents/:id`: current content and version.
pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> Result<Json<DocumentState>, StatusCode> {
    state
        .documents
        .get_document_state(&document_id)
        .await
        .map(Json)
        .map_err(|e| log_and_map(&document_id, e))
}

#[derive(Debug, Serialize)]
pub struct DocumentTextResponse {
    pub document_id: DocumentId,
    pub version: u64,
    pub text: String,
}

/// `GET /api/documents/:id/text`: plain text for search and previews.
pub async fn get_document_text(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> Result<Json<DocumentTextResponse>, StatusCode> {
    let document = state
        .documents
        .get_document_state(&document_id)
        .await
        .map_err(|e| log_and_map(&document_id, e))?;
    Ok(Json(DocumentTextResponse {
        text: extract_text_from_delta(&document.content),
        version: document.version,
        document_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    #[serde(default)]
    pub since: u64,
}

/// `GET /api/documents/:id/operations?since=N`: logged operations after N.
pub async fn get_operations(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
    Query(query): Query<SinceQuery>,
) -> Json<Vec<OperationLogEntry>> {
    Json(
        state
            .documents
            .get_operations_since(&document_id, query.since)
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    pub truncate: bool,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub snapshot: DocumentSnapshot,
    pub truncated: usize,
}

/// `POST /api/documents/:id/snapshot?truncate=bool`: checkpoint, and
/// optionally drop the log entries it covers.
pub async fn create_snapshot(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Json<SnapshotResponse>, StatusCode> {
    let snapshot = state
        .documents
        .create_document_snapshot(&document_id)
        .await
        .map_err(|e| log_and_map(&document_id, e))?;
    let truncated = if query.truncate {
        state
            .documents
            .truncate_log(&document_id, snapshot.version)
            .await
    } else {
        0
    };
    Ok(Json(SnapshotResponse { snapshot, truncated }))
}

/// `POST /api/documents/:id/persist`: write the working copy through now.
pub async fn persist_document(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let written = state
        .documents
        .persist_document(&document_id)
        .await
        .map_err(|e| log_and_map(&document_id, e))?;
    Ok(Json(serde_json::json!({ "ok": true, "written": written })))
}

#[derive(Debug, Deserialize)]
pub struct QueueOperationBody {
    pub user_id: UserId,
    pub operation: Delta,
    #[serde(default)]
    pub base_version: Option<u64>,
}

/// `POST /api/documents/:id/queue`: buffer an operation authored offline.
pub async fn queue_operation(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
    Json(body): Json<QueueOperationBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let queued = state
        .documents
        .queue_operation(&document_id, &body.user_id, body.operation, body.base_version)
        .await
        .map_err(|e| log_and_map(&document_id, e))?;
    Ok(Json(serde_json::json!({ "ok": true, "queued": queued })))
}

/// `GET /api/documents/:id/queue/:user_id`: pending offline operations.
pub async fn get_queue(
    State(state): State<AppState>,
    Path((document_id, user_id)): Path<(DocumentId, UserId)>,
) -> Json<Vec<QueuedOperation>> {
    Json(
        state
            .documents
            .get_queued_operations(&document_id, &user_id)
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub operations: Vec<Delta>,
}

/// `POST /api/documents/:id/resolve`: rebase a batch authored against the
/// current version so it can be applied in order. Nothing is applied.
pub async fn resolve_operations(
    State(state): State<AppState>,
    Path(document_id): Path<DocumentId>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Vec<Delta>>, StatusCode> {
    state
        .documents
        .resolve_conflicts(&body.operations, &document_id)
        .await
        .map(Json)
        .map_err(|e| log_and_map(&document_id, e))
}

/// `GET /api/documents/:id/presence`: active users and their cursors.
pub async fn get_presence(State(state): State<AppState>, Path(document_id): Path<DocumentId>) -> Json<Vec<PresenceView>> {
    Json(state.presence.get_document_presence(&document_id).await)
}

/// `GET /api/documents/:id/presence/:user_id`: one user's presence record.
pub async fn get_user_presence(
    State(state): State<AppState>,
    Path((document_id, user_id)): Path<(DocumentId, UserId)>,
) -> Result<Json<PresenceView>, StatusCode> {
    state
        .presence
        .get_user_presence(&user_id, &document_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
#[path = "documents_test.rs"]
mod tests;
