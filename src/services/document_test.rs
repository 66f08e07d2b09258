use super::*;
use crate::services::store::MemoryDocumentStore;
use async_trait::async_trait;

fn doc(id: &str) -> DocumentId {
    DocumentId::new(id)
}

fn user(id: &str) -> UserId {
    UserId::new(id)
}

async fn engine_with(text: &str, policy: FlushPolicy) -> (DocumentEngine, MemoryDocumentStore) {
    let store = MemoryDocumentStore::new();
    store.insert(doc("doc-1"), Delta::new().insert(text), 0).await;
    (DocumentEngine::with_store(Arc::new(store.clone()), policy), store)
}

async fn text_of(engine: &DocumentEngine, id: &str) -> String {
    engine
        .get_document_state(&doc(id))
        .await
        .unwrap()
        .content
        .to_plain_text()
}

/// Saves always fail; loads come from the wrapped memory store.
struct FailingStore {
    inner: MemoryDocumentStore,
}

#[async_trait]
impl DocumentStore for FailingStore {
    async fn load(&self, document_id: &DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.load(document_id).await
    }

    async fn save(&self, _document_id: &DocumentId, _content: &Delta, _version: u64) -> Result<(), StoreError> {
        Err(StoreError::Database(sqlx::Error::PoolTimedOut))
    }
}

// =============================================================================
// apply / state / log
// =============================================================================

#[tokio::test]
async fn apply_appends_to_hello_world() {
    let (engine, _) = engine_with("Hello World\n", FlushPolicy::OnDemand).await;
    let applied = engine
        .apply_operation(&doc("doc-1"), Delta::new().retain(11).insert(" there"), &user("A"))
        .await
        .unwrap();
    assert_eq!(applied.version, 1);

    let state = engine.get_document_state(&doc("doc-1")).await.unwrap();
    assert_eq!(state.version, 1);
    assert!(extract_text(&state.content).contains("Hello World there"));

    let ops = engine.get_operations_since(&doc("doc-1"), 0).await;
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].version, 1);
    assert_eq!(ops[0].user_id, user("A"));
}

fn extract_text(content: &Delta) -> String {
    crate::delta::extract_text_from_delta(content)
}

#[tokio::test]
async fn versions_increase_by_one_per_operation() {
    let store = MemoryDocumentStore::new();
    store.insert(doc("d"), Delta::new().insert("x"), 7).await;
    let engine = DocumentEngine::with_store(Arc::new(store), FlushPolicy::OnDemand);

    for i in 0..5 {
        let applied = engine
            .apply_operation(&doc("d"), Delta::new().insert("a"), &user("u"))
            .await
            .unwrap();
        assert_eq!(applied.version, 8 + i);
    }
    let versions: Vec<u64> = engine
        .get_operations_since(&doc("d"), 7)
        .await
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, vec![8, 9, 10, 11, 12]);
    assert!(engine.get_operations_since(&doc("d"), 12).await.is_empty());
}

#[tokio::test]
async fn concurrent_applies_are_serialized() {
    let (engine, _) = engine_with("", FlushPolicy::OnDemand).await;
    let engine = Arc::new(engine);

    let mut tasks = Vec::new();
    for i in 0..50 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .apply_operation(&doc("doc-1"), Delta::new().insert("x"), &UserId::new(format!("u{i}")))
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let state = engine.get_document_state(&doc("doc-1")).await.unwrap();
    assert_eq!(state.version, 50);
    assert_eq!(state.content.to_plain_text(), "x".repeat(50));
    let versions: Vec<u64> = engine
        .get_operations_since(&doc("doc-1"), 0)
        .await
        .iter()
        .map(|e| e.version)
        .collect();
    assert_eq!(versions, (1..=50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn unknown_document_is_not_found() {
    let (engine, _) = engine_with("", FlushPolicy::OnDemand).await;
    let err = engine
        .apply_operation(&doc("missing"), Delta::new().insert("x"), &user("u"))
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::NotFound(_)));
    assert_eq!(err.error_code(), "E_DOCUMENT_NOT_FOUND");
    assert!(engine.get_operations_since(&doc("missing"), 0).await.is_empty());
}

#[tokio::test]
async fn malformed_operations_change_nothing() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;

    let empty = engine
        .apply_operation(&doc("doc-1"), Delta::new(), &user("u"))
        .await
        .unwrap_err();
    assert!(matches!(empty, DocumentError::Malformed(DeltaError::Empty)));

    let past_end = engine
        .apply_operation(&doc("doc-1"), Delta::new().retain(2).delete(5), &user("u"))
        .await
        .unwrap_err();
    assert!(matches!(past_end, DocumentError::Malformed(DeltaError::OutOfBounds { .. })));
    assert_eq!(past_end.error_code(), "E_MALFORMED_OPERATION");

    let state = engine.get_document_state(&doc("doc-1")).await.unwrap();
    assert_eq!(state.version, 0);
    assert_eq!(state.content.to_plain_text(), "abc");
    assert!(engine.get_operations_since(&doc("doc-1"), 0).await.is_empty());
}

#[tokio::test]
async fn stored_content_with_retains_is_rejected_on_load() {
    let store = MemoryDocumentStore::new();
    store.insert(doc("bad"), Delta::new().retain(3), 0).await;
    let engine = DocumentEngine::with_store(Arc::new(store), FlushPolicy::OnDemand);

    let err = engine.get_document_state(&doc("bad")).await.unwrap_err();
    assert_eq!(err.error_code(), "E_CORRUPT_DOCUMENT");
}

#[tokio::test]
async fn create_document_then_reject_duplicate() {
    let (engine, store) = engine_with("", FlushPolicy::OnDemand).await;
    let state = engine
        .create_document(&doc("new"), Delta::new().insert("fresh\n"))
        .await
        .unwrap();
    assert_eq!(state.version, 0);
    assert_eq!(store.get(&doc("new")).await.unwrap().content.to_plain_text(), "fresh\n");

    let dup = engine
        .create_document(&doc("new"), Delta::new().insert("again"))
        .await
        .unwrap_err();
    assert!(matches!(dup, DocumentError::AlreadyExists(_)));
    let stored_dup = engine
        .create_document(&doc("doc-1"), Delta::new().insert("again"))
        .await
        .unwrap_err();
    assert!(matches!(stored_dup, DocumentError::AlreadyExists(_)));

    let not_a_doc = engine
        .create_document(&doc("other"), Delta::new().retain(1))
        .await
        .unwrap_err();
    assert!(matches!(not_a_doc, DocumentError::Malformed(DeltaError::NotADocument)));
}

// =============================================================================
// base versions / conflicts
// =============================================================================

#[tokio::test]
async fn stale_base_is_rebased_over_later_operations() {
    let (engine, _) = engine_with("Hello", FlushPolicy::OnDemand).await;
    engine
        .apply_operation_at_base(&doc("doc-1"), Delta::new().retain(5).insert("!"), &user("A"), 0)
        .await
        .unwrap();
    let applied = engine
        .apply_operation_at_base(&doc("doc-1"), Delta::new().insert(">"), &user("B"), 0)
        .await
        .unwrap();

    assert_eq!(applied.version, 2);
    assert_eq!(text_of(&engine, "doc-1").await, ">Hello!");
}

#[tokio::test]
async fn same_position_tie_keeps_earlier_insert_first() {
    let (engine, _) = engine_with("Hello", FlushPolicy::OnDemand).await;
    engine
        .apply_operation_at_base(&doc("doc-1"), Delta::new().retain(5).insert("!"), &user("A"), 0)
        .await
        .unwrap();
    engine
        .apply_operation_at_base(&doc("doc-1"), Delta::new().retain(5).insert("?"), &user("B"), 0)
        .await
        .unwrap();
    assert_eq!(text_of(&engine, "doc-1").await, "Hello!?");
}

#[tokio::test]
async fn current_base_applies_unchanged() {
    let (engine, _) = engine_with("ab", FlushPolicy::OnDemand).await;
    let op = Delta::new().retain(1).insert("-");
    let applied = engine
        .apply_operation_at_base(&doc("doc-1"), op.clone(), &user("A"), 0)
        .await
        .unwrap();
    assert_eq!(applied.operation, op);
}

#[tokio::test]
async fn future_or_truncated_base_is_unavailable() {
    let (engine, _) = engine_with("ab", FlushPolicy::OnDemand).await;
    let future = engine
        .apply_operation_at_base(&doc("doc-1"), Delta::new().insert("x"), &user("A"), 4)
        .await
        .unwrap_err();
    assert!(matches!(future, DocumentError::BaseVersionUnavailable { base: 4, current: 0 }));

    for _ in 0..3 {
        engine
            .apply_operation(&doc("doc-1"), Delta::new().insert("y"), &user("A"))
            .await
            .unwrap();
    }
    engine.create_document_snapshot(&doc("doc-1")).await.unwrap();
    assert_eq!(engine.truncate_log(&doc("doc-1"), 2).await, 2);

    let truncated = engine
        .apply_operation_at_base(&doc("doc-1"), Delta::new().insert("x"), &user("A"), 1)
        .await
        .unwrap_err();
    assert_eq!(truncated.error_code(), "E_BASE_VERSION_UNAVAILABLE");

    // Base 2 still has entry 3 retained.
    engine
        .apply_operation_at_base(&doc("doc-1"), Delta::new().insert("x"), &user("A"), 2)
        .await
        .unwrap();
}

#[tokio::test]
async fn resolve_conflicts_returns_applicable_batch() {
    let (engine, _) = engine_with("0123456789", FlushPolicy::OnDemand).await;
    let batch = vec![Delta::new().retain(2).insert("A"), Delta::new().retain(5).delete(2)];
    let resolved = engine.resolve_conflicts(&batch, &doc("doc-1")).await.unwrap();

    for op in resolved {
        engine.apply_operation(&doc("doc-1"), op, &user("u")).await.unwrap();
    }
    assert_eq!(text_of(&engine, "doc-1").await, "01A234789");
}

#[tokio::test]
async fn resolve_conflicts_rejects_batch_that_does_not_fit() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    let batch = vec![Delta::new().retain(10).insert("x")];
    let err = engine.resolve_conflicts(&batch, &doc("doc-1")).await.unwrap_err();
    assert!(matches!(err, DocumentError::Malformed(DeltaError::OutOfBounds { .. })));
}

// =============================================================================
// snapshots
// =============================================================================

#[tokio::test]
async fn truncate_without_snapshot_removes_nothing() {
    let (engine, _) = engine_with("", FlushPolicy::OnDemand).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().insert("a"), &user("u"))
        .await
        .unwrap();
    assert_eq!(engine.truncate_log(&doc("doc-1"), 10).await, 0);
    assert_eq!(engine.truncate_log(&doc("unloaded"), 10).await, 0);
}

#[tokio::test]
async fn truncate_stops_at_latest_snapshot() {
    let (engine, _) = engine_with("", FlushPolicy::OnDemand).await;
    for _ in 0..3 {
        engine
            .apply_operation(&doc("doc-1"), Delta::new().insert("a"), &user("u"))
            .await
            .unwrap();
    }
    let snapshot = engine.create_document_snapshot(&doc("doc-1")).await.unwrap();
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.content.to_plain_text(), "aaa");

    for _ in 0..2 {
        engine
            .apply_operation(&doc("doc-1"), Delta::new().insert("b"), &user("u"))
            .await
            .unwrap();
    }
    assert_eq!(engine.truncate_log(&doc("doc-1"), 100).await, 3);

    let remaining = engine.get_operations_since(&doc("doc-1"), 0).await;
    assert_eq!(remaining.first().map(|e| e.version), Some(4));
    assert_eq!(remaining.len(), 2);
}

// =============================================================================
// offline queue
// =============================================================================

#[tokio::test]
async fn queue_is_fifo_and_drained_on_process() {
    let (engine, _) = engine_with("", FlushPolicy::OnDemand).await;
    for text in ["a", "b", "c"] {
        engine
            .queue_operation(&doc("doc-1"), &user("u"), Delta::new().insert(text), None)
            .await
            .unwrap();
    }
    let queued = engine.get_queued_operations(&doc("doc-1"), &user("u")).await;
    assert_eq!(queued.len(), 3);
    assert!(engine.get_queued_operations(&doc("doc-1"), &user("other")).await.is_empty());

    let outcome = engine.process_operation_queue(&doc("doc-1"), &user("u")).await;
    assert_eq!(outcome.applied.len(), 3);
    assert_eq!(outcome.failed, 0);
    // Each insert lands at the start, so the last queued ends up first.
    assert_eq!(text_of(&engine, "doc-1").await, "cba");
    assert!(engine.get_queued_operations(&doc("doc-1"), &user("u")).await.is_empty());

    let again = engine.process_operation_queue(&doc("doc-1"), &user("u")).await;
    assert!(again.applied.is_empty());
}

#[tokio::test]
async fn queued_failures_are_counted_and_dropped() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    engine
        .queue_operation(&doc("doc-1"), &user("u"), Delta::new().retain(3).insert("!"), Some(0))
        .await
        .unwrap();
    engine
        .queue_operation(&doc("doc-1"), &user("u"), Delta::new().retain(50).delete(1), None)
        .await
        .unwrap();

    let outcome = engine.process_operation_queue(&doc("doc-1"), &user("u")).await;
    assert_eq!(outcome.applied.len(), 1);
    assert_eq!(outcome.failed, 1);
    assert!(engine.get_queued_operations(&doc("doc-1"), &user("u")).await.is_empty());
}

#[tokio::test]
async fn queue_rejects_malformed_and_does_not_need_loaded_document() {
    let (engine, _) = engine_with("", FlushPolicy::OnDemand).await;
    assert!(matches!(
        engine
            .queue_operation(&doc("elsewhere"), &user("u"), Delta::new(), None)
            .await,
        Err(DocumentError::Malformed(DeltaError::Empty))
    ));
    assert_eq!(
        engine
            .queue_operation(&doc("elsewhere"), &user("u"), Delta::new().insert("x"), None)
            .await
            .unwrap(),
        1
    );
}

// =============================================================================
// undo / redo
// =============================================================================

#[tokio::test]
async fn undo_reverts_last_operation_as_new_version() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().retain(1).insert("X"), &user("A"))
        .await
        .unwrap();

    let undone = engine.undo_operation(&doc("doc-1"), &user("A")).await.expect("undoable");
    assert_eq!(undone.version, 2);
    assert_eq!(text_of(&engine, "doc-1").await, "abc");

    // The undo itself is not undoable.
    assert!(engine.undo_operation(&doc("doc-1"), &user("A")).await.is_none());
}

#[tokio::test]
async fn undo_is_rebased_over_other_users_edits() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().retain(1).insert("X"), &user("A"))
        .await
        .unwrap();
    engine
        .apply_operation(&doc("doc-1"), Delta::new().insert("Y"), &user("B"))
        .await
        .unwrap();

    engine.undo_operation(&doc("doc-1"), &user("A")).await.expect("undoable");
    assert_eq!(text_of(&engine, "doc-1").await, "Yabc");
}

#[tokio::test]
async fn undo_restores_deleted_text() {
    let (engine, _) = engine_with("hello world", FlushPolicy::OnDemand).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().retain(5).delete(6), &user("A"))
        .await
        .unwrap();
    assert_eq!(text_of(&engine, "doc-1").await, "hello");

    engine.undo_operation(&doc("doc-1"), &user("A")).await.expect("undoable");
    assert_eq!(text_of(&engine, "doc-1").await, "hello world");
}

#[tokio::test]
async fn undo_of_text_already_deleted_by_others_is_nothing() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().retain(1).insert("X"), &user("A"))
        .await
        .unwrap();
    engine
        .apply_operation(&doc("doc-1"), Delta::new().retain(1).delete(1), &user("B"))
        .await
        .unwrap();

    assert!(engine.undo_operation(&doc("doc-1"), &user("A")).await.is_none());
    assert_eq!(text_of(&engine, "doc-1").await, "abc");
}

#[tokio::test]
async fn undo_with_nothing_to_undo() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    assert!(engine.undo_operation(&doc("doc-1"), &user("A")).await.is_none());
    assert!(engine.undo_operation(&doc("never-loaded"), &user("A")).await.is_none());
}

#[tokio::test]
async fn undo_after_log_truncation_is_nothing() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().insert("1"), &user("A"))
        .await
        .unwrap();
    engine
        .apply_operation(&doc("doc-1"), Delta::new().insert("2"), &user("B"))
        .await
        .unwrap();
    engine.create_document_snapshot(&doc("doc-1")).await.unwrap();
    engine.truncate_log(&doc("doc-1"), 2).await;

    assert!(engine.undo_operation(&doc("doc-1"), &user("A")).await.is_none());
}

#[tokio::test]
async fn redo_is_never_supported() {
    let (engine, _) = engine_with("abc", FlushPolicy::OnDemand).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().insert("x"), &user("A"))
        .await
        .unwrap();
    engine.undo_operation(&doc("doc-1"), &user("A")).await;
    assert!(!engine.redo_operation(&doc("doc-1"), &user("A")));
}

// =============================================================================
// persistence
// =============================================================================

#[tokio::test]
async fn every_ops_policy_writes_after_threshold() {
    let (engine, store) = engine_with("", FlushPolicy::EveryOps(2)).await;
    engine
        .apply_operation(&doc("doc-1"), Delta::new().insert("a"), &user("u"))
        .await
        .unwrap();
    assert_eq!(store.get(&doc("doc-1")).await.unwrap().version, 0);
    assert_eq!(engine.dirty_documents().await, vec![doc("doc-1")]);

    engine
        .apply_operation(&doc("doc-1"), Delta::new().insert("b"), &user("u"))
        .await
        .unwrap();
    let stored = store.get(&doc("doc-1")).await.unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.content.to_plain_text(), "ba");
    assert!(engine.dirty_documents().await.is_empty());
}

#[tokio::test]
async fn on_demand_policy_waits_for_explicit_persist() {
    let (engine, store) = engine_with("", FlushPolicy::OnDemand).await;
    for _ in 0..30 {
        engine
            .apply_operation(&doc("doc-1"), Delta::new().insert("a"), &user("u"))
            .await
            .unwrap();
    }
    assert_eq!(store.get(&doc("doc-1")).await.unwrap().version, 0);

    assert!(engine.persist_document(&doc("doc-1")).await.unwrap());
    assert_eq!(store.get(&doc("doc-1")).await.unwrap().version, 30);
    assert!(!engine.persist_document(&doc("doc-1")).await.unwrap());
    assert!(!engine.persist_document(&doc("unloaded")).await.unwrap());
}

#[tokio::test]
async fn flush_dirty_writes_only_dirty_documents() {
    let store = MemoryDocumentStore::new();
    store.insert(doc("a"), Delta::new().insert("a"), 0).await;
    store.insert(doc("b"), Delta::new().insert("b"), 0).await;
    let engine = DocumentEngine::with_store(Arc::new(store.clone()), FlushPolicy::OnDemand);

    engine.get_document_state(&doc("a")).await.unwrap();
    engine
        .apply_operation(&doc("b"), Delta::new().insert("x"), &user("u"))
        .await
        .unwrap();

    let report = engine.flush_dirty().await;
    assert_eq!(report, FlushReport { flushed: 1, failed: 0 });
    assert_eq!(store.get(&doc("b")).await.unwrap().version, 1);
    assert_eq!(engine.flush_dirty().await, FlushReport::default());
}

#[tokio::test]
async fn failed_flush_keeps_document_dirty() {
    let inner = MemoryDocumentStore::new();
    inner.insert(doc("d"), Delta::new().insert("x"), 0).await;
    let engine = DocumentEngine::with_store(Arc::new(FailingStore { inner }), FlushPolicy::EveryOps(1));

    // Apply still succeeds; the write-behind failure is only logged.
    engine
        .apply_operation(&doc("d"), Delta::new().insert("y"), &user("u"))
        .await
        .unwrap();
    assert_eq!(engine.dirty_documents().await, vec![doc("d")]);

    let report = engine.flush_dirty().await;
    assert_eq!(report, FlushReport { flushed: 0, failed: 1 });

    let err = engine.persist_document(&doc("d")).await.unwrap_err();
    assert!(matches!(err, DocumentError::Store(_)));
    assert!(err.retryable());
}
