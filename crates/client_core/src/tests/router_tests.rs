use super::*;
use std::time::Duration;

use crate::{
    conversation::ConversationState,
    test_support::{direct_payload, push_frame, room_payload},
};

fn router(identity: &str) -> (EventRouter, SharedConversationState, broadcast::Receiver<ClientEvent>) {
    let state = ConversationState::shared(Duration::from_secs(5));
    let (events, rx) = broadcast::channel(64);
    (EventRouter::new(identity, state.clone(), events), state, rx)
}

#[test]
fn classifies_wire_event_names() {
    assert_eq!(EventKind::classify("private_message"), EventKind::DirectMessage);
    assert_eq!(EventKind::classify("direct_message"), EventKind::DirectMessage);
    assert_eq!(EventKind::classify("room_message"), EventKind::GroupMessage);
    assert_eq!(EventKind::classify("group_message"), EventKind::GroupMessage);
    assert_eq!(EventKind::classify("public_message"), EventKind::Other);
    assert_eq!(EventKind::classify(""), EventKind::Other);
}

#[tokio::test]
async fn direct_message_for_active_peer_is_applied() {
    let (router, state, mut events) = router("alice");
    state.lock().await.activate(Conversation::direct("bob"));

    let frame = push_frame(
        "private_message",
        &direct_payload("bob", "alice", "hey", "2024-01-01T10:00:00"),
    );
    assert_eq!(
        router.route_frame(&frame).await,
        RouteOutcome::Applied(InsertOutcome::Inserted)
    );

    let guard = state.lock().await;
    assert_eq!(guard.store().len(), 1);
    let record = guard.store().ordered().next().expect("record");
    assert_eq!(record.origin, MessageOrigin::Remote);
    drop(guard);

    assert!(matches!(
        events.recv().await.expect("preview event"),
        ClientEvent::PreviewUpdated { .. }
    ));
    assert_eq!(
        events.recv().await.expect("timeline event"),
        ClientEvent::TimelineUpdated {
            conversation: Conversation::direct("bob")
        }
    );
}

#[tokio::test]
async fn direct_message_from_other_peer_only_updates_preview() {
    let (router, state, _events) = router("alice");
    state.lock().await.activate(Conversation::direct("bob"));

    let frame = push_frame(
        "private_message",
        &direct_payload("carol", "alice", "psst", "2024-01-01T10:00:00"),
    );
    assert_eq!(router.route_frame(&frame).await, RouteOutcome::NotActive);

    let guard = state.lock().await;
    assert!(guard.store().is_empty());
    let preview = guard
        .preview(&Conversation::direct("carol"))
        .expect("carol preview");
    assert_eq!(preview.unread, 1);
    assert_eq!(preview.last_text.as_deref(), Some("psst"));
}

#[tokio::test]
async fn group_events_match_only_active_room() {
    let (router, state, _events) = router("alice");
    state.lock().await.activate(Conversation::group("rust"));

    let other_room = push_frame(
        "room_message",
        &room_payload("bob", "go", "hi", "2024-01-01T10:00:00"),
    );
    assert_eq!(router.route_frame(&other_room).await, RouteOutcome::NotActive);

    let same_room = push_frame(
        "group_message",
        &room_payload("bob", "rust", "hi", "2024-01-01T10:00:00"),
    );
    assert_eq!(
        router.route_frame(&same_room).await,
        RouteOutcome::Applied(InsertOutcome::Inserted)
    );

    // A direct event naming the room is not a room message.
    let direct = push_frame(
        "private_message",
        &direct_payload("bob", "rust", "hi", "2024-01-01T10:00:10"),
    );
    assert_eq!(router.route_frame(&direct).await, RouteOutcome::NotActive);
    assert_eq!(state.lock().await.store().len(), 1);
}

#[tokio::test]
async fn own_echo_from_other_session_is_deduplicated() {
    let (router, state, _events) = router("alice");
    state.lock().await.activate(Conversation::direct("bob"));
    let frame = push_frame(
        "private_message",
        &direct_payload("alice", "bob", "hi", "2024-01-01T10:00:00"),
    );

    assert_eq!(
        router.route_frame(&frame).await,
        RouteOutcome::Applied(InsertOutcome::Inserted)
    );
    assert_eq!(
        router.route_frame(&frame).await,
        RouteOutcome::Applied(InsertOutcome::Duplicate)
    );
    let guard = state.lock().await;
    assert_eq!(guard.store().len(), 1);
    assert_eq!(
        guard
            .preview(&Conversation::direct("bob"))
            .expect("preview")
            .unread,
        0
    );
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_dropped() {
    let (router, state, _events) = router("alice");
    state.lock().await.activate(Conversation::direct("bob"));

    assert_eq!(
        router
            .route_frame(r#"{"event":"typing","data":{"sender":"bob"}}"#)
            .await,
        RouteOutcome::Ignored
    );
    assert_eq!(router.route_frame("not json").await, RouteOutcome::Malformed);
    assert_eq!(
        router
            .route_frame(r#"{"event":"private_message","data":[1,2]}"#)
            .await,
        RouteOutcome::Malformed
    );
    let blank = push_frame(
        "private_message",
        &direct_payload("bob", "alice", "   ", "2024-01-01T10:00:00"),
    );
    assert_eq!(router.route_frame(&blank).await, RouteOutcome::Malformed);
    assert!(state.lock().await.store().is_empty());
}

#[tokio::test]
async fn events_without_active_conversation_are_not_applied() {
    let (router, state, _events) = router("alice");
    let frame = push_frame(
        "private_message",
        &direct_payload("bob", "alice", "hey", "2024-01-01T10:00:00"),
    );
    assert_eq!(router.route_frame(&frame).await, RouteOutcome::NotActive);
    assert!(state.lock().await.store().is_empty());
}

#[tokio::test]
async fn selecting_conversation_clears_unread() {
    let (router, state, _events) = router("alice");
    let frame = push_frame(
        "private_message",
        &direct_payload("bob", "alice", "hey", "2024-01-01T10:00:00"),
    );
    router.route_frame(&frame).await;
    router.route_frame(&frame.replace("hey", "again")).await;
    assert_eq!(
        state
            .lock()
            .await
            .preview(&Conversation::direct("bob"))
            .expect("preview")
            .unread,
        2
    );

    let mut guard = state.lock().await;
    guard.activate(Conversation::direct("bob"));
    assert_eq!(
        guard
            .preview(&Conversation::direct("bob"))
            .expect("preview")
            .unread,
        0
    );
}

#[tokio::test]
async fn redelivered_message_counts_once_toward_unread() {
    let (router, state, mut events) = router("alice");
    state.lock().await.activate(Conversation::direct("carol"));

    let mut relayed = direct_payload("bob", "alice", "hey", "2024-01-01T10:00:00.100Z");
    relayed.correlation_id = Some("c-1".into());
    let persisted = direct_payload("bob", "alice", "hey", "2024-01-01T10:00:00.400");

    assert_eq!(
        router
            .route_frame(&push_frame("private_message", &relayed))
            .await,
        RouteOutcome::NotActive
    );
    assert_eq!(
        router
            .route_frame(&push_frame("private_message", &persisted))
            .await,
        RouteOutcome::NotActive
    );

    let bob = Conversation::direct("bob");
    assert_eq!(
        state.lock().await.preview(&bob).expect("preview").unread,
        1
    );
    assert!(matches!(
        events.recv().await.expect("preview event"),
        ClientEvent::PreviewUpdated { preview, .. } if preview.unread == 1
    ));
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    // the same text sent again later is a new message
    let again = direct_payload("bob", "alice", "hey", "2024-01-01T10:01:00");
    router
        .route_frame(&push_frame("private_message", &again))
        .await;
    assert_eq!(
        state.lock().await.preview(&bob).expect("preview").unread,
        2
    );
}
