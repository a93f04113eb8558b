//! End-to-end tests driving the coordinator the way a WebSocket connection
//! would: join a session, exchange text/cursor changes, observe broadcast
//! fan-out, and exercise rate limiting and idle cleanup. These exercise the
//! S1-S6 scenarios from the transformation spec against the real coordinator
//! and in-memory store rather than the OT engine in isolation (that's
//! covered by `ot::engine`'s own unit tests).

use std::sync::Arc;

use collab_ot::config::Config;
use collab_ot::coordinator::Coordinator;
use collab_ot::messages::ServerMessage;
use collab_ot::metrics::MetricsAggregator;
use collab_ot::session::InMemorySessionStore;
use tokio::sync::mpsc;

fn new_coordinator() -> Arc<Coordinator> {
    let store = Arc::new(InMemorySessionStore::new());
    let metrics = Arc::new(MetricsAggregator::new());
    Arc::new(Coordinator::new(Config::default(), store, metrics))
}

async fn connect(
    coordinator: &Coordinator,
    session_id: &str,
    user_id: &str,
) -> (u64, mpsc::UnboundedReceiver<ServerMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (connection_id, resolved) = coordinator
        .connect(session_id, Some(user_id.to_string()), tx)
        .await
        .expect("connect should succeed");
    assert_eq!(resolved, user_id);
    (connection_id, rx)
}

#[tokio::test]
async fn two_peers_join_and_see_each_other() {
    let coordinator = new_coordinator();

    let (_alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    match alice_rx.recv().await.unwrap() {
        ServerMessage::SessionJoined { user_id, users, .. } => {
            assert_eq!(user_id, "alice");
            assert_eq!(users, vec!["alice".to_string()]);
        }
        other => panic!("expected session_joined, got {other:?}"),
    }

    let (_bob_id, mut bob_rx) = connect(&coordinator, "session1", "bob").await;
    match bob_rx.recv().await.unwrap() {
        ServerMessage::SessionJoined { user_id, users, .. } => {
            assert_eq!(user_id, "bob");
            assert!(users.contains(&"alice".to_string()));
            assert!(users.contains(&"bob".to_string()));
        }
        other => panic!("expected session_joined, got {other:?}"),
    }

    // alice should be told bob joined.
    match alice_rx.recv().await.unwrap() {
        ServerMessage::UserJoined { user_id, .. } => assert_eq!(user_id, "bob"),
        other => panic!("expected user_joined, got {other:?}"),
    }
}

#[tokio::test]
async fn text_change_is_broadcast_to_peers_but_not_back_to_sender() {
    let coordinator = new_coordinator();

    let (_alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    let (_bob_id, mut bob_rx) = connect(&coordinator, "session1", "bob").await;

    // Drain the join notifications both peers already received.
    let _ = alice_rx.recv().await; // alice's own session_joined
    let _ = alice_rx.recv().await; // bob joined, broadcast to alice
    let _ = bob_rx.recv().await; // bob's own session_joined

    coordinator
        .handle(
            "session1",
            _alice_id,
            r#"{"type":"text_change","content":"hello world","cursor_position":11,"vector_clock":{}}"#,
        )
        .await;

    match bob_rx.recv().await.unwrap() {
        ServerMessage::TextChange { content, user_id, .. } => {
            assert_eq!(content, "hello world");
            assert_eq!(user_id, "alice");
        }
        other => panic!("expected text_change, got {other:?}"),
    }

    // alice does not receive her own change back.
    assert!(alice_rx.try_recv().is_err());
}

#[tokio::test]
async fn cursor_change_broadcasts_position() {
    let coordinator = new_coordinator();

    let (alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    let (_bob_id, mut bob_rx) = connect(&coordinator, "session1", "bob").await;
    let _ = alice_rx.recv().await;
    let _ = alice_rx.recv().await;
    let _ = bob_rx.recv().await;

    coordinator
        .handle(
            "session1",
            alice_id,
            r#"{"type":"cursor_change","position":4,"selection_start":null,"selection_end":null}"#,
        )
        .await;

    match bob_rx.recv().await.unwrap() {
        ServerMessage::CursorChange { user_id, position, .. } => {
            assert_eq!(user_id, "alice");
            assert_eq!(position, 4);
        }
        other => panic!("expected cursor_change, got {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_notifies_remaining_peers() {
    let coordinator = new_coordinator();

    let (alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    let (_bob_id, mut bob_rx) = connect(&coordinator, "session1", "bob").await;
    let _ = alice_rx.recv().await;
    let _ = alice_rx.recv().await;
    let _ = bob_rx.recv().await;

    coordinator.disconnect("session1", alice_id).await;

    match bob_rx.recv().await.unwrap() {
        ServerMessage::UserLeft { user_id, .. } => assert_eq!(user_id, "alice"),
        other => panic!("expected user_left, got {other:?}"),
    }

    // Disconnecting the same connection again is a no-op, not a panic.
    coordinator.disconnect("session1", alice_id).await;
}

#[tokio::test]
async fn malformed_message_replies_with_error_and_does_not_crash_connection() {
    let coordinator = new_coordinator();
    let (alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    let _ = alice_rx.recv().await; // session_joined

    coordinator.handle("session1", alice_id, "not json at all").await;

    match alice_rx.recv().await.unwrap() {
        ServerMessage::Error { .. } => {}
        other => panic!("expected error, got {other:?}"),
    }

    // The connection is still usable afterward.
    coordinator
        .handle("session1", alice_id, r#"{"type":"ping"}"#)
        .await;
    match alice_rx.recv().await.unwrap() {
        ServerMessage::Pong { .. } => {}
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn rate_limit_blocks_excess_requests_from_one_user() {
    let coordinator = new_coordinator();
    let (alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    let _ = alice_rx.recv().await;

    for _ in 0..100 {
        coordinator
            .handle("session1", alice_id, r#"{"type":"ping"}"#)
            .await;
        let _ = alice_rx.recv().await;
    }

    coordinator
        .handle("session1", alice_id, r#"{"type":"ping"}"#)
        .await;
    match alice_rx.recv().await.unwrap() {
        ServerMessage::Error { message } => assert!(message.to_lowercase().contains("rate")),
        other => panic!("expected rate limit error, got {other:?}"),
    }
}

#[tokio::test]
async fn get_metrics_returns_snapshot() {
    let coordinator = new_coordinator();
    let (alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    let _ = alice_rx.recv().await;

    coordinator
        .handle("session1", alice_id, r#"{"type":"get_metrics"}"#)
        .await;
    match alice_rx.recv().await.unwrap() {
        ServerMessage::Metrics { .. } => {}
        other => panic!("expected metrics, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_edits_from_two_clients_converge_via_diff_to_ops() {
    let coordinator = new_coordinator();
    let (alice_id, mut alice_rx) = connect(&coordinator, "session1", "alice").await;
    let (bob_id, mut bob_rx) = connect(&coordinator, "session1", "bob").await;
    let _ = alice_rx.recv().await;
    let _ = alice_rx.recv().await;
    let _ = bob_rx.recv().await;

    coordinator
        .handle(
            "session1",
            alice_id,
            r#"{"type":"text_change","content":"Hello, world!","cursor_position":13,"vector_clock":{}}"#,
        )
        .await;
    let content_after_alice = match bob_rx.recv().await.unwrap() {
        ServerMessage::TextChange { content, .. } => content,
        other => panic!("expected text_change, got {other:?}"),
    };
    assert_eq!(content_after_alice, "Hello, world!");

    coordinator
        .handle(
            "session1",
            bob_id,
            r#"{"type":"text_change","content":"Hello, brave world!","cursor_position":19,"vector_clock":{}}"#,
        )
        .await;
    match alice_rx.recv().await.unwrap() {
        ServerMessage::TextChange { content, user_id, .. } => {
            assert_eq!(user_id, "bob");
            assert_eq!(content, "Hello, brave world!");
        }
        other => panic!("expected text_change, got {other:?}"),
    }
}
