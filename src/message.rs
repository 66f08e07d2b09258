//! Message: the wire contract between editors and the collaboration core.
//!
//! ARCHITECTURE
//! ============
//! Every WebSocket text frame carries one JSON object tagged by `type`.
//! Clients send [`ClientMessage`]s; the server answers and fans out
//! [`ServerMessage`]s. The dispatch layer in `routes::ws` is the only place
//! that translates between the two.
//!
//! DESIGN
//! ======
//! - Tags and fields are `snake_case`; ids serialize as plain strings.
//! - Timestamps are milliseconds since the Unix epoch.
//! - Errors carry a grepable `code` from [`ErrorCode`] plus a message.
//! - `document_operation` versions are contiguous per document but delivery
//!   order across authors is not; receivers buffer and apply in version order.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::delta::Delta;
use crate::ids::{DocumentId, UserId};
use crate::services::document::OperationLogEntry;
use crate::services::presence::{PresenceView, Selection};

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error messages.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// INBOUND
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinDocument {
        document_id: DocumentId,
    },
    LeaveDocument {
        document_id: DocumentId,
    },
    DocumentOperation {
        document_id: DocumentId,
        operation: Delta,
        /// Version the client authored against. Absent means "current".
        #[serde(default)]
        base_version: Option<u64>,
    },
    CursorPosition {
        document_id: DocumentId,
        #[serde(default)]
        position: Option<u64>,
        #[serde(default)]
        selection: Option<Selection>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    SyncRequest {
        document_id: DocumentId,
        since_version: u64,
    },
    Undo {
        document_id: DocumentId,
    },
    Redo {
        document_id: DocumentId,
    },
}

// =============================================================================
// OUTBOUND
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        user_id: UserId,
        timestamp: i64,
    },
    ConnectionClosed {
        reason: String,
    },
    UserJoined {
        document_id: DocumentId,
        user: PresenceView,
    },
    UserLeft {
        document_id: DocumentId,
        user_id: UserId,
    },
    RoomMembers {
        document_id: DocumentId,
        members: Vec<PresenceView>,
    },
    DocumentState {
        document_id: DocumentId,
        version: u64,
        content: Delta,
        last_modified: i64,
    },
    /// Fan-out runs after the document lock is released, so two peers'
    /// operations can arrive in either order. Clients apply them by `version`.
    DocumentOperation {
        document_id: DocumentId,
        version: u64,
        operation: Delta,
        user_id: UserId,
        timestamp: i64,
    },
    OperationApplied {
        document_id: DocumentId,
        version: u64,
    },
    Operations {
        document_id: DocumentId,
        operations: Vec<OperationLogEntry>,
    },
    CursorUpdate {
        document_id: DocumentId,
        user_id: UserId,
        user_name: String,
        position: Option<u64>,
        selection: Option<Selection>,
        color: String,
    },
    Ping {
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    /// Error message from a plain string and code.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error { code: code.to_owned(), message: message.into() }
    }

    /// Structured error message from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self::Error { code: err.error_code().to_owned(), message: err.to_string() }
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::Ping { timestamp: now_ms() }
    }

    /// Wire tag, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::RoomMembers { .. } => "room_members",
            Self::DocumentState { .. } => "document_state",
            Self::DocumentOperation { .. } => "document_operation",
            Self::OperationApplied { .. } => "operation_applied",
            Self::Operations { .. } => "operations",
            Self::CursorUpdate { .. } => "cursor_update",
            Self::Ping { .. } => "ping",
            Self::Error { .. } => "error",
        }
    }

    /// Chatty messages are not logged per send.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::CursorUpdate { .. } | Self::Ping { .. })
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
