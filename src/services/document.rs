//! Document engine: authoritative working copies and their operation logs.
//!
//! DESIGN
//! ======
//! Each document, once touched, lives in memory as a `WorkingCopy` behind
//! its own `tokio::sync::Mutex`; the map of copies sits behind a `RwLock`.
//! Every mutation of one document holds its mutex, so operations on a
//! document are applied one at a time in arrival order and each accepted
//! operation bumps the version by exactly one. Different documents never
//! contend beyond the brief map lookup.
//!
//! Documents load lazily from the `DocumentStore`. The load runs without
//! any engine lock held; if two callers race, the copy inserted first wins
//! and the other is discarded.
//!
//! The engine never broadcasts. It returns what changed and the dispatch
//! layer fans it out.
//!
//! PERSISTENCE
//! ===========
//! The working copy is a write-behind cache. A document is dirty while
//! `version > persisted_version`. Writes snapshot `(content, version)` under
//! the document lock, save outside it, then raise `persisted_version` to
//! the saved version. An operation that lands during the save keeps the
//! document dirty. Store failures are logged and retried on the next flush.
//!
//! UNDO
//! ====
//! Applying an operation records its inverse (computed against the content
//! it was applied to) on the author's stack. Undo pops the newest entry,
//! rebases the inverse over everything applied since, and applies the
//! result as a fresh operation. This is best effort: if the log no longer
//! reaches back far enough, or the rebased inverse is empty, there is
//! nothing to undo.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::FlushPolicy;
use crate::delta::{Delta, DeltaError};
use crate::ids::{DocumentId, UserId};
use crate::message::{ErrorCode, ServerMessage, now_ms};
use crate::services::conflict::{BestEffortTransform, ConflictStrategy, rebase, resolve_batch};
use crate::services::store::{DocumentStore, StoreError, StoredDocument};

/// Undo history kept per user per document.
const MAX_UNDO_DEPTH: usize = 100;
/// Offline operations accepted per user per document.
pub const MAX_QUEUED_OPERATIONS: usize = 1000;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub version: u64,
    pub operation: Delta,
    pub user_id: UserId,
    /// Milliseconds since epoch.
    pub timestamp: i64,
}

/// An operation accepted by the engine, as it was actually applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedOperation {
    pub document_id: DocumentId,
    pub version: u64,
    pub operation: Delta,
    pub user_id: UserId,
    pub timestamp: i64,
}

impl AppliedOperation {
    /// The fan-out message for other room members.
    #[must_use]
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::DocumentOperation {
            document_id: self.document_id.clone(),
            version: self.version,
            operation: self.operation.clone(),
            user_id: self.user_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// The acknowledgement for the author.
    #[must_use]
    pub fn ack(&self) -> ServerMessage {
        ServerMessage::OperationApplied { document_id: self.document_id.clone(), version: self.version }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentState {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: Delta,
    pub last_modified: i64,
}

impl DocumentState {
    #[must_use]
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::DocumentState {
            document_id: self.document_id.clone(),
            version: self.version,
            content: self.content.clone(),
            last_modified: self.last_modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub version: u64,
    pub content: Delta,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub operation: Delta,
    #[serde(default)]
    pub base_version: Option<u64>,
    pub queued_at: i64,
}

/// Result of draining an offline queue.
#[derive(Debug, Default, Serialize)]
pub struct QueueOutcome {
    pub applied: Vec<AppliedOperation>,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document {0} not found")]
    NotFound(DocumentId),
    #[error("document {0} already exists")]
    AlreadyExists(DocumentId),
    #[error("malformed operation: {0}")]
    Malformed(#[from] DeltaError),
    #[error("base version {base} is not available (current version {current})")]
    BaseVersionUnavailable { base: u64, current: u64 },
    #[error("offline queue is full ({limit} operations)")]
    QueueFull { limit: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorCode for DocumentError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_DOCUMENT_NOT_FOUND",
            Self::AlreadyExists(_) => "E_DOCUMENT_EXISTS",
            Self::Malformed(e) => e.error_code(),
            Self::BaseVersionUnavailable { .. } => "E_BASE_VERSION_UNAVAILABLE",
            Self::QueueFull { .. } => "E_QUEUE_FULL",
            Self::Store(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.retryable(),
            Self::QueueFull { .. } => true,
            _ => false,
        }
    }
}

// =============================================================================
// WORKING COPY
// =============================================================================

#[derive(Debug, Clone)]
struct UndoEntry {
    /// Version produced by the operation this entry undoes.
    version: u64,
    inverse: Delta,
}

struct WorkingCopy {
    content: Delta,
    version: u64,
    last_modified: i64,
    persisted_version: u64,
    /// Contiguous, ascending. Truncation only removes a prefix.
    log: VecDeque<OperationLogEntry>,
    snapshot: Option<DocumentSnapshot>,
    undo: HashMap<UserId, VecDeque<UndoEntry>>,
}

impl WorkingCopy {
    fn from_stored(stored: StoredDocument) -> Self {
        Self {
            content: stored.content,
            version: stored.version,
            last_modified: stored.updated_at,
            persisted_version: stored.version,
            log: VecDeque::new(),
            snapshot: None,
            undo: HashMap::new(),
        }
    }

    fn is_dirty(&self) -> bool {
        self.version > self.persisted_version
    }

    fn unflushed(&self) -> u64 {
        self.version.saturating_sub(self.persisted_version)
    }

    fn state(&self, document_id: &DocumentId) -> DocumentState {
        DocumentState {
            document_id: document_id.clone(),
            version: self.version,
            content: self.content.clone(),
            last_modified: self.last_modified,
        }
    }

    /// Log entries with version in `base+1..=version`, or `None` when the
    /// log no longer reaches back to `base`.
    fn operations_after(&self, base: u64) -> Option<Vec<&OperationLogEntry>> {
        if base >= self.version {
            return Some(Vec::new());
        }
        let first = self.log.front()?.version;
        if first > base + 1 {
            return None;
        }
        let skip = usize::try_from(base + 1 - first).ok()?;
        Some(self.log.iter().skip(skip).collect())
    }

    /// Apply an already-rebased operation. Nothing changes on error.
    fn apply(
        &mut self,
        document_id: &DocumentId,
        operation: Delta,
        user_id: &UserId,
        record_undo: bool,
    ) -> Result<AppliedOperation, DeltaError> {
        let content = operation.apply_to(&self.content)?;
        let inverse = if record_undo { Some(operation.invert(&self.content)?) } else { None };

        let timestamp = now_ms();
        self.content = content;
        self.version += 1;
        self.last_modified = timestamp;
        self.log.push_back(OperationLogEntry {
            version: self.version,
            operation: operation.clone(),
            user_id: user_id.clone(),
            timestamp,
        });

        if let Some(inverse) = inverse {
            let stack = self.undo.entry(user_id.clone()).or_default();
            stack.push_back(UndoEntry { version: self.version, inverse });
            if stack.len() > MAX_UNDO_DEPTH {
                stack.pop_front();
            }
        }

        Ok(AppliedOperation {
            document_id: document_id.clone(),
            version: self.version,
            operation,
            user_id: user_id.clone(),
            timestamp,
        })
    }
}

type DocumentHandle = Arc<Mutex<WorkingCopy>>;
type QueueKey = (DocumentId, UserId);

// =============================================================================
// ENGINE
// =============================================================================

pub struct DocumentEngine {
    store: Arc<dyn DocumentStore>,
    strategy: Arc<dyn ConflictStrategy>,
    flush_policy: FlushPolicy,
    documents: RwLock<HashMap<DocumentId, DocumentHandle>>,
    queues: Mutex<HashMap<QueueKey, VecDeque<QueuedOperation>>>,
}

impl DocumentEngine {
    pub fn new(store: Arc<dyn DocumentStore>, strategy: Arc<dyn ConflictStrategy>, flush_policy: FlushPolicy) -> Self {
        info!(strategy = strategy.name(), ?flush_policy, "document engine configured");
        Self {
            store,
            strategy,
            flush_policy,
            documents: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Engine with the default conflict strategy.
    pub fn with_store(store: Arc<dyn DocumentStore>, flush_policy: FlushPolicy) -> Self {
        Self::new(store, Arc::new(BestEffortTransform), flush_policy)
    }

    #[must_use]
    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush_policy
    }

    /// The loaded copy for `document_id`, loading it from the store first.
    async fn handle(&self, document_id: &DocumentId) -> Result<DocumentHandle, DocumentError> {
        if let Some(handle) = self.documents.read().await.get(document_id) {
            return Ok(handle.clone());
        }

        let stored = self
            .store
            .load(document_id)
            .await?
            .ok_or_else(|| DocumentError::NotFound(document_id.clone()))?;
        if !stored.content.is_document() {
            return Err(DeltaError::NotADocument.into());
        }
        let version = stored.version;

        let mut documents = self.documents.write().await;
        let handle = documents
            .entry(document_id.clone())
            .or_insert_with(|| {
                info!(%document_id, version, "document loaded");
                Arc::new(Mutex::new(WorkingCopy::from_stored(stored)))
            })
            .clone();
        Ok(handle)
    }

    async fn loaded(&self, document_id: &DocumentId) -> Option<DocumentHandle> {
        self.documents.read().await.get(document_id).cloned()
    }

    /// Save a brand-new document and load it. Content must be inserts only.
    pub async fn create_document(&self, document_id: &DocumentId, content: Delta) -> Result<DocumentState, DocumentError> {
        if !content.is_document() {
            return Err(DeltaError::NotADocument.into());
        }
        if self.loaded(document_id).await.is_some() || self.store.load(document_id).await?.is_some() {
            return Err(DocumentError::AlreadyExists(document_id.clone()));
        }

        self.store.save(document_id, &content, 0).await?;
        let copy = WorkingCopy::from_stored(StoredDocument { content, version: 0, updated_at: now_ms() });
        let state = copy.state(document_id);
        self.documents
            .write()
            .await
            .entry(document_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(copy)));
        info!(%document_id, "document created");
        Ok(state)
    }

    // -------------------------------------------------------------------------
    // operations
    // -------------------------------------------------------------------------

    /// Apply `operation` to the current content as the next version.
    pub async fn apply_operation(
        &self,
        document_id: &DocumentId,
        operation: Delta,
        user_id: &UserId,
    ) -> Result<AppliedOperation, DocumentError> {
        self.apply_with_base(document_id, operation, user_id, None).await
    }

    /// Apply an operation authored against `base_version`, rebasing it over
    /// everything applied since.
    pub async fn apply_operation_at_base(
        &self,
        document_id: &DocumentId,
        operation: Delta,
        user_id: &UserId,
        base_version: u64,
    ) -> Result<AppliedOperation, DocumentError> {
        self.apply_with_base(document_id, operation, user_id, Some(base_version))
            .await
    }

    async fn apply_with_base(
        &self,
        document_id: &DocumentId,
        operation: Delta,
        user_id: &UserId,
        base_version: Option<u64>,
    ) -> Result<AppliedOperation, DocumentError> {
        operation.validate()?;
        let handle = self.handle(document_id).await?;

        let (applied, pending_flush) = {
            let mut copy = handle.lock().await;
            let operation = match base_version {
                Some(base) if base != copy.version => {
                    let later = match copy.operations_after(base) {
                        Some(later) if base < copy.version => later,
                        _ => return Err(DocumentError::BaseVersionUnavailable { base, current: copy.version }),
                    };
                    let rebased = rebase(self.strategy.as_ref(), later.iter().map(|e| &e.operation), &operation);
                    debug!(%document_id, base, current = copy.version, "operation rebased");
                    rebased
                }
                _ => operation,
            };

            let applied = copy.apply(document_id, operation, user_id, true)?;
            let pending_flush = self
                .flush_policy
                .due(copy.unflushed())
                .then(|| (copy.content.clone(), copy.version));
            (applied, pending_flush)
        };

        debug!(%document_id, %user_id, version = applied.version, "operation applied");
        if let Some((content, version)) = pending_flush {
            if let Err(e) = self.write_back(document_id, &handle, content, version).await {
                error!(%document_id, version, error = %e, "document flush failed; will retry");
            }
        }
        Ok(applied)
    }

    pub async fn get_document_state(&self, document_id: &DocumentId) -> Result<DocumentState, DocumentError> {
        let handle = self.handle(document_id).await?;
        let copy = handle.lock().await;
        Ok(copy.state(document_id))
    }

    /// Retained log entries with version > `since_version`, ascending.
    ///
    /// If the log was truncated past `since_version` the slice starts later;
    /// a first version other than `since_version + 1` means the caller must
    /// resync from [`Self::get_document_state`].
    pub async fn get_operations_since(&self, document_id: &DocumentId, since_version: u64) -> Vec<OperationLogEntry> {
        let Some(handle) = self.loaded(document_id).await else {
            return Vec::new();
        };
        let copy = handle.lock().await;
        copy.log
            .iter()
            .filter(|entry| entry.version > since_version)
            .cloned()
            .collect()
    }

    /// Rebase a batch of concurrent operations so they apply in order on
    /// the current content. Nothing is applied.
    pub async fn resolve_conflicts(&self, operations: &[Delta], document_id: &DocumentId) -> Result<Vec<Delta>, DocumentError> {
        for operation in operations {
            operation.validate()?;
        }
        let resolved = resolve_batch(self.strategy.as_ref(), operations);

        let handle = self.handle(document_id).await?;
        let mut scratch = handle.lock().await.content.clone();
        for operation in &resolved {
            scratch = operation.apply_to(&scratch)?;
        }
        Ok(resolved)
    }

    /// Checkpoint the current content. The latest snapshot bounds `truncate_log`.
    pub async fn create_document_snapshot(&self, document_id: &DocumentId) -> Result<DocumentSnapshot, DocumentError> {
        let handle = self.handle(document_id).await?;
        let mut copy = handle.lock().await;
        let snapshot = DocumentSnapshot {
            document_id: document_id.clone(),
            version: copy.version,
            content: copy.content.clone(),
            created_at: now_ms(),
        };
        copy.snapshot = Some(snapshot.clone());
        info!(%document_id, version = snapshot.version, "snapshot created");
        Ok(snapshot)
    }

    /// Drop log entries up to `up_to_version`, never past the latest
    /// snapshot. Returns how many were removed.
    pub async fn truncate_log(&self, document_id: &DocumentId, up_to_version: u64) -> usize {
        let Some(handle) = self.loaded(document_id).await else {
            return 0;
        };
        let mut copy = handle.lock().await;
        let Some(limit) = copy.snapshot.as_ref().map(|s| s.version.min(up_to_version)) else {
            return 0;
        };

        let mut removed = 0;
        while copy.log.front().is_some_and(|entry| entry.version <= limit) {
            copy.log.pop_front();
            removed += 1;
        }
        if removed > 0 {
            info!(%document_id, removed, through = limit, "operation log truncated");
        }
        removed
    }

    // -------------------------------------------------------------------------
    // offline queue
    // -------------------------------------------------------------------------

    /// Buffer an operation for later. Returns the queue length.
    pub async fn queue_operation(
        &self,
        document_id: &DocumentId,
        user_id: &UserId,
        operation: Delta,
        base_version: Option<u64>,
    ) -> Result<usize, DocumentError> {
        operation.validate()?;
        let mut queues = self.queues.lock().await;
        let queue = queues
            .entry((document_id.clone(), user_id.clone()))
            .or_default();
        if queue.len() >= MAX_QUEUED_OPERATIONS {
            return Err(DocumentError::QueueFull { limit: MAX_QUEUED_OPERATIONS });
        }
        queue.push_back(QueuedOperation { operation, base_version, queued_at: now_ms() });
        debug!(%document_id, %user_id, queued = queue.len(), "operation queued");
        Ok(queue.len())
    }

    pub async fn get_queued_operations(&self, document_id: &DocumentId, user_id: &UserId) -> Vec<QueuedOperation> {
        self.queues
            .lock()
            .await
            .get(&(document_id.clone(), user_id.clone()))
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drain the queue and apply each entry in order. Failures are logged
    /// and dropped.
    pub async fn process_operation_queue(&self, document_id: &DocumentId, user_id: &UserId) -> QueueOutcome {
        let drained = self
            .queues
            .lock()
            .await
            .remove(&(document_id.clone(), user_id.clone()))
            .unwrap_or_default();

        let mut outcome = QueueOutcome::default();
        for queued in drained {
            match self
                .apply_with_base(document_id, queued.operation, user_id, queued.base_version)
                .await
            {
                Ok(applied) => outcome.applied.push(applied),
                Err(e) => {
                    warn!(%document_id, %user_id, error = %e, "queued operation dropped");
                    outcome.failed += 1;
                }
            }
        }
        if !outcome.applied.is_empty() || outcome.failed > 0 {
            info!(%document_id, %user_id, applied = outcome.applied.len(), failed = outcome.failed, "offline queue processed");
        }
        outcome
    }

    // -------------------------------------------------------------------------
    // undo / redo
    // -------------------------------------------------------------------------

    /// Undo the user's most recent operation. `None` when there is nothing
    /// that can be undone.
    pub async fn undo_operation(&self, document_id: &DocumentId, user_id: &UserId) -> Option<AppliedOperation> {
        let handle = self.loaded(document_id).await?;
        let (applied, pending_flush) = {
            let mut copy = handle.lock().await;
            let stack = copy.undo.get_mut(user_id)?;
            let entry = stack.pop_back()?;
            if stack.is_empty() {
                copy.undo.remove(user_id);
            }

            let Some(later) = copy.operations_after(entry.version) else {
                info!(%document_id, %user_id, version = entry.version, "undo: log truncated past target");
                return None;
            };
            let inverse = rebase(self.strategy.as_ref(), later.iter().map(|e| &e.operation), &entry.inverse);
            if inverse.is_empty() {
                debug!(%document_id, %user_id, "undo: nothing left to revert");
                return None;
            }

            let applied = match copy.apply(document_id, inverse, user_id, false) {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(%document_id, %user_id, error = %e, "undo: inverse no longer applies");
                    return None;
                }
            };
            let pending_flush = self
                .flush_policy
                .due(copy.unflushed())
                .then(|| (copy.content.clone(), copy.version));
            (applied, pending_flush)
        };

        if let Some((content, version)) = pending_flush {
            if let Err(e) = self.write_back(document_id, &handle, content, version).await {
                error!(%document_id, version, error = %e, "document flush failed; will retry");
            }
        }
        info!(%document_id, %user_id, version = applied.version, "undo applied");
        Some(applied)
    }

    /// Redo is not supported.
    #[must_use]
    pub fn redo_operation(&self, _document_id: &DocumentId, _user_id: &UserId) -> bool {
        false
    }

    // -------------------------------------------------------------------------
    // persistence
    // -------------------------------------------------------------------------

    async fn write_back(
        &self,
        document_id: &DocumentId,
        handle: &DocumentHandle,
        content: Delta,
        version: u64,
    ) -> Result<(), StoreError> {
        self.store.save(document_id, &content, version).await?;
        let mut copy = handle.lock().await;
        // EDGE: an operation applied during the save leaves version > persisted.
        copy.persisted_version = copy.persisted_version.max(version);
        debug!(%document_id, version, dirty = copy.is_dirty(), "document flushed");
        Ok(())
    }

    /// Write one document if dirty. False if it was clean or not loaded.
    pub async fn persist_document(&self, document_id: &DocumentId) -> Result<bool, DocumentError> {
        let Some(handle) = self.loaded(document_id).await else {
            return Ok(false);
        };
        let pending = {
            let copy = handle.lock().await;
            copy.is_dirty().then(|| (copy.content.clone(), copy.version))
        };
        let Some((content, version)) = pending else {
            return Ok(false);
        };
        self.write_back(document_id, &handle, content, version).await?;
        Ok(true)
    }

    /// Write every dirty document.
    pub async fn flush_dirty(&self) -> FlushReport {
        let handles: Vec<(DocumentId, DocumentHandle)> = self
            .documents
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut report = FlushReport::default();
        for (document_id, handle) in handles {
            let pending = {
                let copy = handle.lock().await;
                copy.is_dirty().then(|| (copy.content.clone(), copy.version))
            };
            let Some((content, version)) = pending else {
                continue;
            };
            match self.write_back(&document_id, &handle, content, version).await {
                Ok(()) => report.flushed += 1,
                Err(e) => {
                    error!(%document_id, version, error = %e, "document flush failed; will retry");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Loaded documents with unsaved operations, sorted.
    pub async fn dirty_documents(&self) -> Vec<DocumentId> {
        let handles: Vec<(DocumentId, DocumentHandle)> = self
            .documents
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut dirty = Vec::new();
        for (document_id, handle) in handles {
            if handle.lock().await.is_dirty() {
                dirty.push(document_id);
            }
        }
        dirty.sort();
        dirty
    }
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;
