//! WebSocket handler for the collaboration protocol endpoint.
//!
//! DESIGN
//! ======
//! On upgrade, the connection is registered with a bounded outbound channel
//! and the task enters a `select!` loop:
//! - Incoming client messages → parse + dispatch by type
//! - Messages from the registry (peer fan-out, pings) → forward to client
//! - Heartbeat tick → ping through the registry
//!
//! The heartbeat is an arm of the loop rather than a spawned task, so it
//! ends exactly when the connection does.
//!
//! Handler functions validate, call services, and return an `Outcome`. The
//! dispatch layer owns all outbound concerns: reply to sender, fan-out to
//! the rest of the room.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register → `connection_established`
//! 2. Client sends messages → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply / broadcast / both)
//! 4. Close, failed send, or registry drop → disconnect → presence cleanup
//!    and `user_left` for every joined document (unless replaced)

use std::collections::BTreeSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::delta::Delta;
use crate::ids::{ConnectionId, DocumentId, UserId};
use crate::message::{ClientMessage, ServerMessage};
use crate::services::presence::{CursorUpdate, PresenceUser, Selection};
use crate::state::AppState;

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what; handlers never send directly.
enum Outcome {
    /// Nothing to send.
    Silent,
    /// Send to the sender only.
    Reply(Vec<ServerMessage>),
    /// Send to the document's room, excluding the sender.
    Broadcast { document_id: DocumentId, messages: Vec<ServerMessage> },
    /// Reply to the sender and broadcast different messages to the room.
    ReplyAndBroadcast { reply: Vec<ServerMessage>, document_id: DocumentId, broadcast: Vec<ServerMessage> },
}

/// Per-connection context owned by the connection task.
struct Session {
    conn_id: ConnectionId,
    user: PresenceUser,
    /// Documents this connection joined (plus rooms carried over on reconnect).
    joined: BTreeSet<DocumentId>,
}

impl Session {
    fn new(conn_id: ConnectionId, user: PresenceUser) -> Self {
        Self { conn_id, user, joined: BTreeSet::new() }
    }
}

// =============================================================================
// UPGRADE
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    user_id: Option<String>,
    user_name: Option<String>,
}

pub async fn handle_ws(State(state): State<AppState>, Query(params): Query<ConnectParams>, ws: WebSocketUpgrade) -> Response {
    let Some(user_id) = params.user_id.filter(|id| !id.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "user_id required").into_response();
    };
    let name = params
        .user_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| user_id.clone());
    let user = PresenceUser { id: UserId::new(user_id), name };

    ws.on_upgrade(move |socket| run_ws(socket, state, user))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user: PresenceUser) {
    let conn_id = ConnectionId::new();

    // The registry holds the only sender; dropping it there ends this loop.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.outbound_capacity);
    state.connections.connect(conn_id, user.id.clone(), tx).await;

    let mut session = Session::new(conn_id, user);
    session.joined = state
        .connections
        .rooms_of(&session.user.id)
        .await
        .into_iter()
        .collect();
    info!(%conn_id, user_id = %session.user.id, carried_rooms = session.joined.len(), "ws: client connected");

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick is immediate; the ack already proved the channel works.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, &mut session, text.as_str()).await;
                        if !send_all(&mut socket, &replies).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                let closing = matches!(msg, ServerMessage::ConnectionClosed { .. });
                if send_message(&mut socket, &msg).await.is_err() || closing {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if !state.connections.ping(&session.user.id).await {
                    break;
                }
            }
        }
    }

    finish_session(&state, &session).await;
    info!(%conn_id, user_id = %session.user.id, "ws: client disconnected");
}

/// Unregister and tell every joined room the user left.
///
/// Skipped when a newer connection for the same user took over: its rooms
/// and presence belong to that connection now.
async fn finish_session(state: &AppState, session: &Session) {
    let user_id = &session.user.id;
    let removed = state.connections.disconnect(session.conn_id).await;
    if removed.is_none() && state.connections.is_connected(user_id).await {
        info!(conn_id = %session.conn_id, %user_id, "ws: superseded connection closed");
        return;
    }

    let mut rooms = session.joined.clone();
    if let Some(removed) = removed {
        rooms.extend(removed.rooms);
    }
    for document_id in rooms {
        state.presence.leave_document(user_id, &document_id).await;
        let left = ServerMessage::UserLeft { document_id: document_id.clone(), user_id: user_id.clone() };
        state
            .connections
            .send_to_room(&document_id, &left, Some(user_id))
            .await;
    }
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse and process one inbound text message and return messages for the
/// sender. Peer fan-out happens here too, through the registry.
async fn process_inbound_text(state: &AppState, session: &mut Session, text: &str) -> Vec<ServerMessage> {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(conn_id = %session.conn_id, error = %e, "ws: invalid inbound message");
            return vec![ServerMessage::error("E_INVALID_MESSAGE", format!("invalid message: {e}"))];
        }
    };

    let result = match msg {
        ClientMessage::JoinDocument { document_id } => handle_join(state, session, document_id).await,
        ClientMessage::LeaveDocument { document_id } => Ok(handle_leave(state, session, document_id).await),
        ClientMessage::DocumentOperation { document_id, operation, base_version } => {
            handle_operation(state, session, document_id, operation, base_version).await
        }
        ClientMessage::CursorPosition { document_id, position, selection } => {
            handle_cursor(state, session, document_id, position, selection).await
        }
        ClientMessage::Pong { .. } => {
            if let Some(rtt) = state.connections.handle_pong(&session.user.id).await {
                debug!(user_id = %session.user.id, rtt_ms = rtt.as_millis(), "ws: pong");
            }
            Ok(Outcome::Silent)
        }
        ClientMessage::SyncRequest { document_id, since_version } => {
            let operations = state
                .documents
                .get_operations_since(&document_id, since_version)
                .await;
            Ok(Outcome::Reply(vec![ServerMessage::Operations { document_id, operations }]))
        }
        ClientMessage::Undo { document_id } => handle_undo(state, session, document_id).await,
        ClientMessage::Redo { document_id } => {
            if state.documents.redo_operation(&document_id, &session.user.id) {
                Ok(Outcome::Silent)
            } else {
                Err(ServerMessage::error("E_REDO_UNSUPPORTED", "redo is not supported"))
            }
        }
    };

    // Apply outcome; the dispatch layer owns all outbound logic.
    let user_id = &session.user.id;
    match result {
        Ok(Outcome::Silent) => Vec::new(),
        Ok(Outcome::Reply(reply)) => reply,
        Ok(Outcome::Broadcast { document_id, messages }) => {
            for message in &messages {
                state
                    .connections
                    .send_to_room(&document_id, message, Some(user_id))
                    .await;
            }
            Vec::new()
        }
        Ok(Outcome::ReplyAndBroadcast { reply, document_id, broadcast }) => {
            for message in &broadcast {
                state
                    .connections
                    .send_to_room(&document_id, message, Some(user_id))
                    .await;
            }
            reply
        }
        Err(error) => vec![error],
    }
}

// =============================================================================
// DOCUMENT HANDLERS
// =============================================================================

async fn handle_join(state: &AppState, session: &mut Session, document_id: DocumentId) -> Result<Outcome, ServerMessage> {
    // Load first so an unknown document never gets a room.
    let document = state
        .documents
        .get_document_state(&document_id)
        .await
        .map_err(|e| ServerMessage::error_from(&e))?;

    if !state
        .connections
        .join_room(&session.user.id, &document_id)
        .await
    {
        return Err(ServerMessage::error("E_NOT_CONNECTED", "connection is not registered"));
    }
    session.joined.insert(document_id.clone());

    let view = state
        .presence
        .join_document(&session.user, &document_id)
        .await;
    let members = state.presence.get_document_presence(&document_id).await;

    let mut reply = vec![
        document.to_message(),
        ServerMessage::RoomMembers { document_id: document_id.clone(), members },
    ];
    let mut broadcast = vec![ServerMessage::UserJoined { document_id: document_id.clone(), user: view }];

    // Operations authored while offline go out as if just sent.
    let queued = state
        .documents
        .process_operation_queue(&document_id, &session.user.id)
        .await;
    for applied in queued.applied {
        reply.push(applied.ack());
        broadcast.push(applied.to_message());
    }

    Ok(Outcome::ReplyAndBroadcast { reply, document_id, broadcast })
}

async fn handle_leave(state: &AppState, session: &mut Session, document_id: DocumentId) -> Outcome {
    session.joined.remove(&document_id);
    let left_room = state
        .connections
        .leave_room(&session.user.id, &document_id)
        .await;
    let left_presence = state
        .presence
        .leave_document(&session.user.id, &document_id)
        .await;
    if !left_room && !left_presence {
        return Outcome::Silent;
    }

    let user_id = session.user.id.clone();
    Outcome::Broadcast { document_id: document_id.clone(), messages: vec![ServerMessage::UserLeft { document_id, user_id }] }
}

async fn handle_operation(
    state: &AppState,
    session: &Session,
    document_id: DocumentId,
    operation: Delta,
    base_version: Option<u64>,
) -> Result<Outcome, ServerMessage> {
    require_room(state, session, &document_id).await?;

    let result = match base_version {
        Some(base) => {
            state
                .documents
                .apply_operation_at_base(&document_id, operation, &session.user.id, base)
                .await
        }
        None => {
            state
                .documents
                .apply_operation(&document_id, operation, &session.user.id)
                .await
        }
    };
    let applied = result.map_err(|e| {
        warn!(%document_id, user_id = %session.user.id, error = %e, "ws: operation rejected");
        ServerMessage::error_from(&e)
    })?;

    Ok(Outcome::ReplyAndBroadcast { reply: vec![applied.ack()], document_id, broadcast: vec![applied.to_message()] })
}

async fn handle_cursor(
    state: &AppState,
    session: &Session,
    document_id: DocumentId,
    position: Option<u64>,
    selection: Option<Selection>,
) -> Result<Outcome, ServerMessage> {
    let mut messages = Vec::new();
    let mut update = state
        .presence
        .update_cursor(&session.user.id, &document_id, position, selection)
        .await;

    // Presence cleanup may have dropped the record of a user who never left
    // the room. Restore it and announce the user again.
    if update == CursorUpdate::Unknown && state.connections.in_room(&session.user.id, &document_id).await {
        let view = state
            .presence
            .join_document(&session.user, &document_id)
            .await;
        debug!(%document_id, user_id = %session.user.id, "ws: presence restored on cursor move");
        messages.push(ServerMessage::UserJoined { document_id: document_id.clone(), user: view });
        update = state
            .presence
            .update_cursor(&session.user.id, &document_id, position, selection)
            .await;
    }

    match update {
        CursorUpdate::Applied(view) => {
            messages.push(ServerMessage::CursorUpdate {
                document_id: document_id.clone(),
                user_id: view.user_id,
                user_name: view.user_name,
                position: view.cursor_position,
                selection: view.selection,
                color: view.color,
            });
            Ok(Outcome::Broadcast { document_id, messages })
        }
        CursorUpdate::Debounced if messages.is_empty() => Ok(Outcome::Silent),
        CursorUpdate::Debounced => Ok(Outcome::Broadcast { document_id, messages }),
        CursorUpdate::Unknown => Err(ServerMessage::error("E_NOT_IN_DOCUMENT", format!("join {document_id} before moving the cursor"))),
    }
}

async fn handle_undo(state: &AppState, session: &Session, document_id: DocumentId) -> Result<Outcome, ServerMessage> {
    require_room(state, session, &document_id).await?;

    let Some(applied) = state
        .documents
        .undo_operation(&document_id, &session.user.id)
        .await
    else {
        return Err(ServerMessage::error("E_NOTHING_TO_UNDO", "nothing to undo"));
    };
    Ok(Outcome::ReplyAndBroadcast { reply: vec![applied.ack()], document_id, broadcast: vec![applied.to_message()] })
}

async fn require_room(state: &AppState, session: &Session, document_id: &DocumentId) -> Result<(), ServerMessage> {
    if state.connections.in_room(&session.user.id, document_id).await {
        Ok(())
    } else {
        Err(ServerMessage::error("E_NOT_IN_ROOM", format!("join {document_id} first")))
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_all(socket: &mut WebSocket, messages: &[ServerMessage]) -> bool {
    for message in messages {
        if send_message(socket, message).await.is_err() {
            return false;
        }
    }
    true
}

async fn send_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let json = match serde_json::to_string(message) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, kind = message.kind(), "ws: failed to serialize message");
            return Err(());
        }
    };
    if let ServerMessage::Error { code, message } = message {
        warn!(code, message, "ws: send error");
    } else if !message.is_ephemeral() {
        debug!(kind = message.kind(), "ws: send");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
