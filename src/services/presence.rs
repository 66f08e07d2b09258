//! Presence tracker: who is looking at which document, and where.
//!
//! DESIGN
//! ======
//! One record per (document, user), stored in a single map with a
//! by-document index next to it. "Active" is purely time based: a record is
//! active while its last update is younger than the activity timeout. It
//! does not consult the connection registry.
//!
//! Cursor updates are debounced per record. An update inside the window is
//! accepted but parked in a pending slot (latest wins) instead of touching
//! the visible state. The next read or update after the window closes
//! promotes it, so the last update of a burst is what peers eventually see.
//!
//! Colors are derived from a hash of the user id, so the same user gets the
//! same color everywhere without storing a table.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::ids::{DocumentId, UserId};
use crate::message::now_ms;

pub const DEFAULT_CURSOR_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Presence palette. Index chosen by [`color_for`].
pub const PRESENCE_COLORS: [&str; 10] = [
    "#E6194B", "#3CB44B", "#4363D8", "#F58231", "#911EB4", "#42D4F4", "#F032E6", "#469990", "#9A6324", "#800000",
];

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: u64,
    pub end: u64,
}

/// The user as known to the surrounding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUser {
    pub id: UserId,
    pub name: String,
}

/// Serialized view of one presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceView {
    pub user_id: UserId,
    pub user_name: String,
    pub document_id: DocumentId,
    pub cursor_position: Option<u64>,
    pub selection: Option<Selection>,
    /// Milliseconds since epoch.
    pub last_seen: i64,
    pub color: String,
    pub is_active: bool,
}

/// Outcome of `update_cursor`.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorUpdate {
    /// Visible state changed.
    Applied(PresenceView),
    /// Accepted inside the debounce window; parked for later.
    Debounced,
    /// No presence record for this (user, document).
    Unknown,
}

impl CursorUpdate {
    #[must_use]
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentPresenceStats {
    pub document_id: DocumentId,
    pub active: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceStatistics {
    pub documents_tracked: usize,
    pub total_records: usize,
    /// Distinct users with at least one active record.
    pub active_users: usize,
    /// Records an inactivity sweep would remove right now.
    pub cleanup_candidates: usize,
    pub documents: Vec<DocumentPresenceStats>,
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceSettings {
    pub cursor_debounce: Duration,
    pub activity_timeout: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self { cursor_debounce: DEFAULT_CURSOR_DEBOUNCE, activity_timeout: DEFAULT_ACTIVITY_TIMEOUT }
    }
}

#[derive(Debug, Clone)]
struct PendingCursor {
    position: Option<u64>,
    selection: Option<Selection>,
    received: Instant,
    received_ms: i64,
}

#[derive(Debug, Clone)]
struct PresenceRecord {
    user_id: UserId,
    user_name: String,
    document_id: DocumentId,
    cursor_position: Option<u64>,
    selection: Option<Selection>,
    last_seen: Instant,
    last_seen_ms: i64,
    color: &'static str,
    last_cursor_update: Option<Instant>,
    pending: Option<PendingCursor>,
}

impl PresenceRecord {
    fn is_active(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) < timeout
    }

    fn view(&self, now: Instant, timeout: Duration) -> PresenceView {
        PresenceView {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            document_id: self.document_id.clone(),
            cursor_position: self.cursor_position,
            selection: self.selection,
            last_seen: self.last_seen_ms,
            color: self.color.to_owned(),
            is_active: self.is_active(now, timeout),
        }
    }

    /// Promote a parked update once the debounce window has passed.
    fn settle(&mut self, now: Instant, debounce: Duration) {
        let Some(last) = self.last_cursor_update else {
            return;
        };
        if now.saturating_duration_since(last) < debounce {
            return;
        }
        if let Some(pending) = self.pending.take() {
            self.cursor_position = pending.position;
            self.selection = pending.selection;
            self.last_seen = pending.received;
            self.last_seen_ms = pending.received_ms;
            self.last_cursor_update = Some(pending.received);
        }
    }
}

type PresenceKey = (DocumentId, UserId);

#[derive(Default)]
struct PresenceInner {
    records: HashMap<PresenceKey, PresenceRecord>,
    by_document: HashMap<DocumentId, HashSet<UserId>>,
}

impl PresenceInner {
    fn remove(&mut self, document_id: &DocumentId, user_id: &UserId) -> bool {
        let removed = self
            .records
            .remove(&(document_id.clone(), user_id.clone()))
            .is_some();
        if let Some(users) = self.by_document.get_mut(document_id) {
            users.remove(user_id);
            if users.is_empty() {
                self.by_document.remove(document_id);
            }
        }
        removed
    }
}

/// Deterministic presence color for a user.
#[must_use]
pub fn color_for(user_id: &UserId) -> &'static str {
    let digest = Sha256::digest(user_id.as_str().as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let bucket = u64::from_be_bytes(head) % PRESENCE_COLORS.len() as u64;
    PRESENCE_COLORS[usize::try_from(bucket).unwrap_or(0)]
}

// =============================================================================
// TRACKER
// =============================================================================

/// Process-wide presence state. Cheap to clone.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    inner: Arc<RwLock<PresenceInner>>,
    settings: PresenceSettings,
}

impl PresenceTracker {
    #[must_use]
    pub fn new(settings: PresenceSettings) -> Self {
        Self { inner: Arc::default(), settings }
    }

    #[must_use]
    pub fn settings(&self) -> PresenceSettings {
        self.settings
    }

    /// Create (or reset) the record for `user` in `document_id`.
    pub async fn join_document(&self, user: &PresenceUser, document_id: &DocumentId) -> PresenceView {
        self.join_document_at(user, document_id, Instant::now()).await
    }

    async fn join_document_at(&self, user: &PresenceUser, document_id: &DocumentId, now: Instant) -> PresenceView {
        let record = PresenceRecord {
            user_id: user.id.clone(),
            user_name: user.name.clone(),
            document_id: document_id.clone(),
            cursor_position: None,
            selection: None,
            last_seen: now,
            last_seen_ms: now_ms(),
            color: color_for(&user.id),
            last_cursor_update: None,
            pending: None,
        };
        let view = record.view(now, self.settings.activity_timeout);

        let mut inner = self.inner.write().await;
        inner
            .records
            .insert((document_id.clone(), user.id.clone()), record);
        inner
            .by_document
            .entry(document_id.clone())
            .or_default()
            .insert(user.id.clone());
        info!(user_id = %user.id, %document_id, "presence: joined document");
        view
    }

    /// Remove the record. False if there was none.
    pub async fn leave_document(&self, user_id: &UserId, document_id: &DocumentId) -> bool {
        let removed = self.inner.write().await.remove(document_id, user_id);
        if removed {
            info!(%user_id, %document_id, "presence: left document");
        }
        removed
    }

    /// Record a cursor move. See the module docs for debounce behaviour.
    pub async fn update_cursor(
        &self,
        user_id: &UserId,
        document_id: &DocumentId,
        position: Option<u64>,
        selection: Option<Selection>,
    ) -> CursorUpdate {
        self.update_cursor_at(user_id, document_id, position, selection, Instant::now())
            .await
    }

    async fn update_cursor_at(
        &self,
        user_id: &UserId,
        document_id: &DocumentId,
        position: Option<u64>,
        selection: Option<Selection>,
        now: Instant,
    ) -> CursorUpdate {
        let settings = self.settings;
        let mut inner = self.inner.write().await;
        let Some(record) = inner
            .records
            .get_mut(&(document_id.clone(), user_id.clone()))
        else {
            return CursorUpdate::Unknown;
        };

        let within_window = record
            .last_cursor_update
            .is_some_and(|last| now.saturating_duration_since(last) < settings.cursor_debounce);
        if within_window {
            record.pending = Some(PendingCursor { position, selection, received: now, received_ms: now_ms() });
            debug!(%user_id, %document_id, "presence: cursor update debounced");
            return CursorUpdate::Debounced;
        }

        record.cursor_position = position;
        record.selection = selection;
        record.last_seen = now;
        record.last_seen_ms = now_ms();
        record.last_cursor_update = Some(now);
        record.pending = None;
        CursorUpdate::Applied(record.view(now, settings.activity_timeout))
    }

    /// Active records for a document, ordered by user id.
    pub async fn get_document_presence(&self, document_id: &DocumentId) -> Vec<PresenceView> {
        self.get_document_presence_at(document_id, Instant::now()).await
    }

    async fn get_document_presence_at(&self, document_id: &DocumentId, now: Instant) -> Vec<PresenceView> {
        let settings = self.settings;
        let mut inner = self.inner.write().await;
        let Some(users) = inner.by_document.get(document_id).cloned() else {
            return Vec::new();
        };

        let mut views: Vec<PresenceView> = users
            .into_iter()
            .filter_map(|user_id| {
                let record = inner.records.get_mut(&(document_id.clone(), user_id))?;
                record.settle(now, settings.cursor_debounce);
                record
                    .is_active(now, settings.activity_timeout)
                    .then(|| record.view(now, settings.activity_timeout))
            })
            .collect();
        views.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        views
    }

    /// The user's record in a document, if present and active.
    pub async fn get_user_presence(&self, user_id: &UserId, document_id: &DocumentId) -> Option<PresenceView> {
        self.get_user_presence_at(user_id, document_id, Instant::now())
            .await
    }

    async fn get_user_presence_at(&self, user_id: &UserId, document_id: &DocumentId, now: Instant) -> Option<PresenceView> {
        let settings = self.settings;
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(&(document_id.clone(), user_id.clone()))?;
        record.settle(now, settings.cursor_debounce);
        record
            .is_active(now, settings.activity_timeout)
            .then(|| record.view(now, settings.activity_timeout))
    }

    /// Remove every record older than `timeout`. Returns how many.
    pub async fn cleanup_inactive(&self, timeout: Duration) -> usize {
        self.cleanup_inactive_at(timeout, Instant::now()).await
    }

    async fn cleanup_inactive_at(&self, timeout: Duration, now: Instant) -> usize {
        let mut inner = self.inner.write().await;
        let expired: Vec<PresenceKey> = inner
            .records
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_seen) > timeout)
            .map(|(key, _)| key.clone())
            .collect();

        for (document_id, user_id) in &expired {
            inner.remove(document_id, user_id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), timeout_secs = timeout.as_secs(), "presence: cleaned up inactive records");
        }
        expired.len()
    }

    /// Aggregate counts for observability.
    pub async fn statistics(&self) -> PresenceStatistics {
        self.statistics_at(Instant::now()).await
    }

    async fn statistics_at(&self, now: Instant) -> PresenceStatistics {
        let timeout = self.settings.activity_timeout;
        let inner = self.inner.read().await;

        let mut documents: Vec<DocumentPresenceStats> = inner
            .by_document
            .iter()
            .map(|(document_id, users)| {
                let active = users
                    .iter()
                    .filter_map(|user_id| inner.records.get(&(document_id.clone(), user_id.clone())))
                    .filter(|record| record.is_active(now, timeout))
                    .count();
                DocumentPresenceStats { document_id: document_id.clone(), active, total: users.len() }
            })
            .collect();
        documents.sort_by(|a, b| a.document_id.cmp(&b.document_id));

        let active_users: HashSet<&UserId> = inner
            .records
            .values()
            .filter(|record| record.is_active(now, timeout))
            .map(|record| &record.user_id)
            .collect();
        let cleanup_candidates = inner
            .records
            .values()
            .filter(|record| !record.is_active(now, timeout))
            .count();

        PresenceStatistics {
            documents_tracked: inner.by_document.len(),
            total_records: inner.records.len(),
            active_users: active_users.len(),
            cleanup_candidates,
            documents,
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
