use super::*;

fn user(id: &str) -> UserId {
    UserId::new(id)
}

fn doc(id: &str) -> DocumentId {
    DocumentId::new(id)
}

fn presence_user(id: &str) -> PresenceUser {
    PresenceUser { id: user(id), name: format!("User {id}") }
}

const MS: Duration = Duration::from_millis(1);

// =============================================================================
// join / leave
// =============================================================================

#[tokio::test]
async fn join_creates_active_record_without_cursor() {
    let tracker = PresenceTracker::default();
    let view = tracker.join_document(&presence_user("u"), &doc("doc-1")).await;

    assert_eq!(view.user_id, user("u"));
    assert_eq!(view.user_name, "User u");
    assert_eq!(view.cursor_position, None);
    assert_eq!(view.selection, None);
    assert!(view.is_active);
    assert!(PRESENCE_COLORS.contains(&view.color.as_str()));
}

#[tokio::test]
async fn cursor_round_trip_then_leave() {
    let tracker = PresenceTracker::default();
    tracker.join_document(&presence_user("u"), &doc("doc-2")).await;

    let update = tracker
        .update_cursor(&user("u"), &doc("doc-2"), Some(42), Some(Selection { start: 40, end: 45 }))
        .await;
    assert!(update.accepted());
    assert!(matches!(update, CursorUpdate::Applied(_)));

    let view = tracker
        .get_user_presence(&user("u"), &doc("doc-2"))
        .await
        .expect("present");
    assert_eq!(view.cursor_position, Some(42));
    assert_eq!(view.selection, Some(Selection { start: 40, end: 45 }));

    assert!(tracker.leave_document(&user("u"), &doc("doc-2")).await);
    assert!(tracker.get_user_presence(&user("u"), &doc("doc-2")).await.is_none());
    assert!(!tracker.leave_document(&user("u"), &doc("doc-2")).await);
}

#[tokio::test]
async fn rejoin_resets_cursor() {
    let tracker = PresenceTracker::default();
    tracker.join_document(&presence_user("u"), &doc("d")).await;
    tracker.update_cursor(&user("u"), &doc("d"), Some(7), None).await;
    tracker.join_document(&presence_user("u"), &doc("d")).await;

    let view = tracker.get_user_presence(&user("u"), &doc("d")).await.expect("present");
    assert_eq!(view.cursor_position, None);
    assert_eq!(tracker.get_document_presence(&doc("d")).await.len(), 1);
}

#[tokio::test]
async fn update_cursor_without_record_is_rejected() {
    let tracker = PresenceTracker::default();
    let update = tracker.update_cursor(&user("ghost"), &doc("d"), Some(1), None).await;
    assert_eq!(update, CursorUpdate::Unknown);
    assert!(!update.accepted());
}

#[tokio::test]
async fn records_are_per_document() {
    let tracker = PresenceTracker::default();
    tracker.join_document(&presence_user("u"), &doc("a")).await;
    tracker.join_document(&presence_user("u"), &doc("b")).await;
    tracker.update_cursor(&user("u"), &doc("a"), Some(3), None).await;

    let b = tracker.get_user_presence(&user("u"), &doc("b")).await.expect("present");
    assert_eq!(b.cursor_position, None);
    tracker.leave_document(&user("u"), &doc("a")).await;
    assert!(tracker.get_user_presence(&user("u"), &doc("b")).await.is_some());
}

#[tokio::test]
async fn document_presence_is_sorted_by_user() {
    let tracker = PresenceTracker::default();
    for id in ["carol", "alice", "bob"] {
        tracker.join_document(&presence_user(id), &doc("d")).await;
    }
    let ids: Vec<String> = tracker
        .get_document_presence(&doc("d"))
        .await
        .into_iter()
        .map(|v| v.user_id.to_string())
        .collect();
    assert_eq!(ids, vec!["alice", "bob", "carol"]);
    assert!(tracker.get_document_presence(&doc("empty")).await.is_empty());
}

// =============================================================================
// debounce
// =============================================================================

#[tokio::test]
async fn flood_inside_window_settles_on_last_update() {
    let tracker = PresenceTracker::default();
    let t0 = Instant::now();
    tracker.join_document_at(&presence_user("u"), &doc("d"), t0).await;

    let first = tracker.update_cursor_at(&user("u"), &doc("d"), Some(1), None, t0).await;
    assert!(matches!(first, CursorUpdate::Applied(_)));

    for (i, pos) in (2..=10).enumerate() {
        let at = t0 + MS * (u32::try_from(i).unwrap() * 5 + 5);
        let update = tracker.update_cursor_at(&user("u"), &doc("d"), Some(pos), None, at).await;
        assert_eq!(update, CursorUpdate::Debounced);
    }

    // Window still open: visible state unchanged.
    let early = tracker
        .get_user_presence_at(&user("u"), &doc("d"), t0 + MS * 60)
        .await
        .expect("present");
    assert_eq!(early.cursor_position, Some(1));

    let settled = tracker
        .get_user_presence_at(&user("u"), &doc("d"), t0 + MS * 150)
        .await
        .expect("present");
    assert_eq!(settled.cursor_position, Some(10));
}

#[tokio::test]
async fn update_after_window_applies_immediately() {
    let tracker = PresenceTracker::default();
    let t0 = Instant::now();
    tracker.join_document_at(&presence_user("u"), &doc("d"), t0).await;
    tracker.update_cursor_at(&user("u"), &doc("d"), Some(1), None, t0).await;

    let later = tracker
        .update_cursor_at(&user("u"), &doc("d"), Some(2), None, t0 + MS * 100)
        .await;
    let CursorUpdate::Applied(view) = later else {
        panic!("expected applied update");
    };
    assert_eq!(view.cursor_position, Some(2));
}

#[tokio::test]
async fn newer_update_replaces_pending_one() {
    let tracker = PresenceTracker::default();
    let t0 = Instant::now();
    tracker.join_document_at(&presence_user("u"), &doc("d"), t0).await;
    tracker.update_cursor_at(&user("u"), &doc("d"), Some(1), None, t0).await;
    tracker
        .update_cursor_at(&user("u"), &doc("d"), Some(5), None, t0 + MS * 50)
        .await;

    let view = tracker
        .update_cursor_at(&user("u"), &doc("d"), Some(9), None, t0 + MS * 200)
        .await;
    assert!(matches!(view, CursorUpdate::Applied(ref v) if v.cursor_position == Some(9)));
    let read = tracker
        .get_user_presence_at(&user("u"), &doc("d"), t0 + MS * 400)
        .await
        .expect("present");
    assert_eq!(read.cursor_position, Some(9));
}

// =============================================================================
// activity
// =============================================================================

#[tokio::test]
async fn silent_record_becomes_inactive_after_timeout() {
    let tracker = PresenceTracker::default();
    let t0 = Instant::now();
    tracker.join_document_at(&presence_user("u"), &doc("d"), t0).await;

    let before = t0 + DEFAULT_ACTIVITY_TIMEOUT - Duration::from_secs(1);
    let after = t0 + DEFAULT_ACTIVITY_TIMEOUT + Duration::from_secs(1);

    assert!(tracker.get_user_presence_at(&user("u"), &doc("d"), before).await.is_some());
    assert!(tracker.get_user_presence_at(&user("u"), &doc("d"), after).await.is_none());
    assert!(tracker.get_document_presence_at(&doc("d"), after).await.is_empty());

    let stats = tracker.statistics_at(after).await;
    assert_eq!(stats.total_records, 1);
    assert_eq!(stats.active_users, 0);
    assert_eq!(stats.cleanup_candidates, 1);
}

#[tokio::test]
async fn cursor_update_keeps_record_active() {
    let tracker = PresenceTracker::default();
    let t0 = Instant::now();
    tracker.join_document_at(&presence_user("u"), &doc("d"), t0).await;
    let midway = t0 + Duration::from_secs(200);
    tracker.update_cursor_at(&user("u"), &doc("d"), Some(4), None, midway).await;

    let at = t0 + Duration::from_secs(400);
    assert!(tracker.get_user_presence_at(&user("u"), &doc("d"), at).await.is_some());
}

#[tokio::test]
async fn cleanup_removes_only_records_older_than_timeout() {
    let tracker = PresenceTracker::default();
    let t0 = Instant::now();
    tracker.join_document_at(&presence_user("old"), &doc("d"), t0).await;
    tracker
        .join_document_at(&presence_user("fresh"), &doc("d"), t0 + Duration::from_secs(200))
        .await;

    let removed = tracker
        .cleanup_inactive_at(Duration::from_secs(300), t0 + Duration::from_secs(400))
        .await;
    assert_eq!(removed, 1);

    let stats = tracker.statistics_at(t0 + Duration::from_secs(400)).await;
    assert_eq!(stats.total_records, 1);
    assert_eq!(stats.documents_tracked, 1);
    assert_eq!(stats.documents[0].total, 1);
}

#[tokio::test]
async fn cleanup_prunes_empty_documents() {
    let tracker = PresenceTracker::default();
    let t0 = Instant::now();
    tracker.join_document_at(&presence_user("u"), &doc("d"), t0).await;

    let removed = tracker
        .cleanup_inactive_at(Duration::from_secs(60), t0 + Duration::from_secs(61))
        .await;
    assert_eq!(removed, 1);
    assert_eq!(tracker.statistics().await.documents_tracked, 0);
}

#[tokio::test]
async fn statistics_count_distinct_active_users() {
    let tracker = PresenceTracker::default();
    tracker.join_document(&presence_user("a"), &doc("d1")).await;
    tracker.join_document(&presence_user("a"), &doc("d2")).await;
    tracker.join_document(&presence_user("b"), &doc("d2")).await;

    let stats = tracker.statistics().await;
    assert_eq!(stats.documents_tracked, 2);
    assert_eq!(stats.total_records, 3);
    assert_eq!(stats.active_users, 2);
    assert_eq!(stats.cleanup_candidates, 0);
    assert_eq!(stats.documents[1].document_id, doc("d2"));
    assert_eq!(stats.documents[1].active, 2);
}

// =============================================================================
// colors
// =============================================================================

#[test]
fn color_is_stable_per_user() {
    assert_eq!(color_for(&user("alice")), color_for(&user("alice")));
    assert!(PRESENCE_COLORS.contains(&color_for(&user("bob"))));
}

#[tokio::test]
async fn color_is_shared_across_documents() {
    let tracker = PresenceTracker::default();
    let a = tracker.join_document(&presence_user("u"), &doc("a")).await;
    let b = tracker.join_document(&presence_user("u"), &doc("b")).await;
    assert_eq!(a.color, b.color);
}

#[test]
fn colors_spread_across_palette() {
    let used: HashSet<&str> = (0..100)
        .map(|i| color_for(&UserId::new(format!("user-{i}"))))
        .collect();
    assert!(used.len() > 5, "only {} colors used", used.len());
}
