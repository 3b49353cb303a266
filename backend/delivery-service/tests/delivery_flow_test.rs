//! End-to-end delivery through the registries, router and dispatcher,
//! wired the way the server wires them.

use std::sync::Arc;
use std::time::Duration;

use delivery_service::config::WebSocketConfig;
use delivery_service::models::{
    ChatMessage, ChatMessageEnvelope, Decision, NewGroup, NewUser, Notification,
    NotificationKind, RequestKey,
};
use delivery_service::store::{MemoryStore, Store};
use delivery_service::websocket::{Connection, Outbound};
use delivery_service::AppState;
use tokio::sync::mpsc::UnboundedReceiver;

fn app_state() -> (Arc<MemoryStore>, AppState) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        store.clone(),
        "test-secret",
        WebSocketConfig {
            heartbeat_interval_secs: 5,
            client_timeout_secs: 30,
        },
    );
    (store, state)
}

async fn user(store: &MemoryStore, nickname: &str, is_public: bool) -> i64 {
    store
        .create_user(NewUser {
            nickname: nickname.into(),
            is_public,
        })
        .await
        .unwrap()
        .id
}

async fn next_text(rx: &mut UnboundedReceiver<Outbound>) -> String {
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(Outbound::Text(text))) => text,
        other => panic!("expected a text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_follow_then_private_chat_round_trip() {
    let (store, state) = app_state();
    let alice = user(&store, "alice", false).await;
    let bob = user(&store, "bob", true).await;

    let outcome = state.requests.follow(alice, bob).await.unwrap();
    let chat = outcome.private_chat.expect("private chat created on follow");

    let (alice_conn, mut alice_rx) = Connection::open(alice);
    let (bob_conn, mut bob_rx) = Connection::open(bob);
    state.chat_registry.register(alice_conn).await;
    state.chat_registry.register(bob_conn).await;

    for text in ["hi bob", "are you there?"] {
        state
            .router
            .route(
                alice,
                ChatMessageEnvelope {
                    content: text.into(),
                    private_chat_id: chat.id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    // Both participants see the same order, the sender included.
    for rx in [&mut alice_rx, &mut bob_rx] {
        let first: ChatMessage = serde_json::from_str(&next_text(rx).await).unwrap();
        let second: ChatMessage = serde_json::from_str(&next_text(rx).await).unwrap();
        assert_eq!(first.content, "hi bob");
        assert_eq!(second.content, "are you there?");
        assert!(first.id < second.id);
    }
}

#[tokio::test]
async fn test_spoofed_sender_is_overridden() {
    let (store, state) = app_state();
    let alice = user(&store, "alice", false).await;
    let bob = user(&store, "bob", false).await;
    let chat = store.get_or_create_private_chat(alice, bob).await.unwrap();

    let report = state
        .router
        .route(
            alice,
            ChatMessageEnvelope {
                sender_id: bob,
                content: "not really bob".into(),
                private_chat_id: chat.id,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.message.sender_id, alice);
}

#[tokio::test]
async fn test_reconnect_routes_to_newest_connection_only() {
    let (store, state) = app_state();
    let alice = user(&store, "alice", false).await;
    let bob = user(&store, "bob", false).await;
    let chat = store.get_or_create_private_chat(alice, bob).await.unwrap();

    let (first, mut first_rx) = Connection::open(bob);
    let first_id = first.id();
    state.chat_registry.register(first).await;
    let (second, mut second_rx) = Connection::open(bob);
    state.chat_registry.register(second).await;

    assert_eq!(first_rx.recv().await, Some(Outbound::Close));

    // Cleanup from the superseded session arrives late and must not evict.
    assert!(!state.chat_registry.unregister(bob, first_id).await);

    state
        .router
        .route(
            alice,
            ChatMessageEnvelope {
                content: "ping".into(),
                private_chat_id: chat.id,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let msg: ChatMessage = serde_json::from_str(&next_text(&mut second_rx).await).unwrap();
    assert_eq!(msg.content, "ping");
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_group_event_queued_offline_and_flushed_on_connect() {
    let (store, state) = app_state();
    let owner = user(&store, "owner", false).await;
    let carol = user(&store, "carol", false).await;
    let group = state
        .requests
        .create_group(
            owner,
            NewGroup {
                title: "Book club".into(),
                description: String::new(),
            },
        )
        .await
        .unwrap();

    state.requests.request_join(carol, group.id).await.unwrap();
    state
        .requests
        .respond(owner, RequestKey::membership(carol, group.id), Decision::Accept)
        .await
        .unwrap();
    state
        .dispatcher
        .announce_group_event(owner, group.id, "Monthly meetup")
        .await
        .unwrap();

    // Carol was offline for the join response and the event.
    let (conn, mut rx) = Connection::open(carol);
    state.notification_registry.register(conn).await;
    let flushed = state.dispatcher.flush_offline(carol).await.unwrap();
    assert_eq!(flushed, 2);

    let first: Notification = serde_json::from_str(&next_text(&mut rx).await).unwrap();
    let second: Notification = serde_json::from_str(&next_text(&mut rx).await).unwrap();
    assert_eq!(
        first.kind,
        NotificationKind::JoinRequestResponse { group_id: group.id }
    );
    assert_eq!(second.kind, NotificationKind::Event { group_id: group.id });

    // Nothing left to replay.
    assert_eq!(state.dispatcher.flush_offline(carol).await.unwrap(), 0);
}

#[tokio::test]
async fn test_member_added_mid_conversation_receives_later_messages() {
    let (store, state) = app_state();
    let owner = user(&store, "owner", false).await;
    let dave = user(&store, "dave", false).await;
    let group = state
        .requests
        .create_group(
            owner,
            NewGroup {
                title: "Climbers".into(),
                description: String::new(),
            },
        )
        .await
        .unwrap();

    let (conn, mut dave_rx) = Connection::open(dave);
    state.chat_registry.register(conn).await;

    let send = |text: &'static str| ChatMessageEnvelope {
        content: text.into(),
        group_chat_id: group.id,
        ..Default::default()
    };

    let before = state.router.route(owner, send("before")).await.unwrap();
    assert_eq!(before.delivered, Vec::<i64>::new());

    state.requests.invite(owner, group.id, &[dave]).await.unwrap();
    state
        .requests
        .respond(dave, RequestKey::membership(dave, group.id), Decision::Accept)
        .await
        .unwrap();

    let after = state.router.route(owner, send("after")).await.unwrap();
    assert_eq!(after.delivered, vec![dave]);
    let msg: ChatMessage = serde_json::from_str(&next_text(&mut dave_rx).await).unwrap();
    assert_eq!(msg.content, "after");

    let history = state
        .router
        .history(dave, msg.target, None)
        .await
        .unwrap();
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["before", "after"]);
}

#[tokio::test]
async fn test_status_reflects_both_channels() {
    let (store, state) = app_state();
    let erin = user(&store, "erin", false).await;

    let (conn, _rx) = Connection::open(erin);
    let conn_id = conn.id();
    state.notification_registry.register(conn).await;

    assert!(state.notification_registry.is_online(erin).await);
    assert!(!state.chat_registry.is_online(erin).await);

    assert!(state.notification_registry.unregister(erin, conn_id).await);
    assert!(!state.notification_registry.is_online(erin).await);
}
