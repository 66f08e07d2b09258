//! Document store: durable home of document content.
//!
//! DESIGN
//! ======
//! The engine keeps a working copy in memory and only talks to the store on
//! first access (load) and on flush (save). The trait is the seam; Postgres
//! backs it in production and an in-memory map backs it in tests and when no
//! database is configured.
//!
//! Content is stored as the JSON delta document in a `JSONB` column next to
//! the version it corresponds to.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::delta::Delta;
use crate::ids::DocumentId;
use crate::message::{ErrorCode, now_ms};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub content: Delta,
    pub version: u64,
    /// Milliseconds since epoch.
    pub updated_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored content for {document_id} is not a valid delta: {reason}")]
    Corrupt { document_id: DocumentId, reason: String },
    #[error("version {0} is out of range for the store")]
    VersionRange(i128),
}

impl ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_STORE_UNAVAILABLE",
            Self::Corrupt { .. } => "E_CORRUPT_DOCUMENT",
            Self::VersionRange(_) => "E_STORE_VERSION",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// `None` when the document has never been saved.
    async fn load(&self, document_id: &DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    async fn save(&self, document_id: &DocumentId, content: &Delta, version: u64) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn load(&self, document_id: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let row = sqlx::query_as::<_, (serde_json::Value, i64, i64)>(
            "SELECT content, version, (EXTRACT(EPOCH FROM updated_at) * 1000)::BIGINT
             FROM collab_documents
             WHERE id = $1",
        )
        .bind(document_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((content, version, updated_at)) = row else {
            return Ok(None);
        };
        let content: Delta = serde_json::from_value(content)
            .map_err(|e| StoreError::Corrupt { document_id: document_id.clone(), reason: e.to_string() })?;
        let version = u64::try_from(version).map_err(|_| StoreError::VersionRange(i128::from(version)))?;
        Ok(Some(StoredDocument { content, version, updated_at }))
    }

    async fn save(&self, document_id: &DocumentId, content: &Delta, version: u64) -> Result<(), StoreError> {
        let version = i64::try_from(version).map_err(|_| StoreError::VersionRange(i128::from(version)))?;
        let content = serde_json::to_value(content)
            .map_err(|e| StoreError::Corrupt { document_id: document_id.clone(), reason: e.to_string() })?;

        sqlx::query(
            "INSERT INTO collab_documents (id, content, version, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (id) DO UPDATE SET \
                 content = EXCLUDED.content, version = EXCLUDED.version, updated_at = now() \
             WHERE collab_documents.version <= EXCLUDED.version",
        )
        .bind(document_id.as_str())
        .bind(content)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// Map-backed store. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<RwLock<HashMap<DocumentId, StoredDocument>>>,
}

impl MemoryDocumentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document as if it had been saved earlier.
    pub async fn insert(&self, document_id: DocumentId, content: Delta, version: u64) {
        self.documents
            .write()
            .await
            .insert(document_id, StoredDocument { content, version, updated_at: now_ms() });
    }

    pub async fn get(&self, document_id: &DocumentId) -> Option<StoredDocument> {
        self.documents.read().await.get(document_id).cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, document_id: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.get(document_id).await)
    }

    async fn save(&self, document_id: &DocumentId, content: &Delta, version: u64) -> Result<(), StoreError> {
        let mut documents = self.documents.write().await;
        if documents
            .get(document_id)
            .is_some_and(|existing| existing.version > version)
        {
            return Ok(());
        }
        documents.insert(
            document_id.clone(),
            StoredDocument { content: content.clone(), version, updated_at: now_ms() },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryDocumentStore::new();
        let id = DocumentId::new("d");
        assert_eq!(store.load(&id).await.unwrap(), None);

        store.save(&id, &Delta::new().insert("hi"), 3).await.unwrap();
        let loaded = store.load(&id).await.unwrap().expect("saved");
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.content.to_plain_text(), "hi");
    }

    #[tokio::test]
    async fn memory_store_ignores_older_versions() {
        let store = MemoryDocumentStore::new();
        let id = DocumentId::new("d");
        store.save(&id, &Delta::new().insert("new"), 5).await.unwrap();
        store.save(&id, &Delta::new().insert("old"), 4).await.unwrap();

        let loaded = store.get(&id).await.expect("saved");
        assert_eq!(loaded.version, 5);
        assert_eq!(loaded.content.to_plain_text(), "new");
    }

    #[test]
    fn database_errors_are_retryable() {
        let err = StoreError::Database(sqlx::Error::PoolTimedOut);
        assert_eq!(err.error_code(), "E_STORE_UNAVAILABLE");
        assert!(err.retryable());
        assert!(!StoreError::VersionRange(-1).retryable());
    }
}
