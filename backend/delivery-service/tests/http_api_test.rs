use std::sync::Arc;

use actix_web::{http::StatusCode, test, web, App};
use delivery_service::auth::Claims;
use delivery_service::config::WebSocketConfig;
use delivery_service::handlers;
use delivery_service::models::{NewUser, Notification};
use delivery_service::store::{MemoryStore, Store};
use delivery_service::AppState;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};

const SECRET: &str = "http-test-secret";

fn bearer(user_id: i64) -> (&'static str, String) {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now().timestamp() + 600) as usize,
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();
    ("Authorization", format!("Bearer {}", token))
}

fn state() -> (Arc<MemoryStore>, AppState) {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        store.clone(),
        SECRET,
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

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(handlers::configure),
        )
        .await
    };
}

#[actix_rt::test]
async fn test_missing_token_is_unauthorized() {
    let (_, state) = state();
    let app = app!(state);

    let req = test::TestRequest::post().uri("/api/v1/follows/2").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "unauthorized");
}

#[actix_rt::test]
async fn test_websocket_upgrade_requires_token() {
    let (_, state) = state();
    let app = app!(state);

    let req = test::TestRequest::get().uri("/ws/notifications").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_rt::test]
async fn test_follow_flow_over_http() {
    let (store, state) = state();
    let alice = user(&store, "alice", false).await;
    let bob = user(&store, "bob", false).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/follows/{}", bob))
        .insert_header(bearer(alice))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["request"]["state"], "PENDING");
    assert_eq!(body["delivery"], "offline");
    assert!(body["privateChat"]["id"].is_i64());

    // A second proposal on the same key conflicts.
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/follows/{}", bob))
        .insert_header(bearer(alice))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let req = test::TestRequest::get()
        .uri("/api/v1/follows/requests")
        .insert_header(bearer(bob))
        .to_request();
    let pending: Vec<Value> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(pending.len(), 1);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/follows/requests/{}", alice))
        .insert_header(bearer(bob))
        .set_json(json!({ "decision": "accept" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["state"], "ACCEPTED");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/follows/{}/status", bob))
        .insert_header(bearer(alice))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["state"], "ACCEPTED");
    assert_eq!(body["followsYou"], "NONE");

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/follows/{}/followers", bob))
        .insert_header(bearer(alice))
        .to_request();
    let followers: Vec<i64> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(followers, vec![alice]);

    let req = test::TestRequest::delete()
        .uri(&format!("/api/v1/follows/{}", bob))
        .insert_header(bearer(alice))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["state"], "NONE");
}

#[actix_rt::test]
async fn test_group_join_and_event_over_http() {
    let (store, state) = state();
    let owner = user(&store, "owner", false).await;
    let carol = user(&store, "carol", false).await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/groups")
        .insert_header(bearer(owner))
        .set_json(json!({ "title": "Runners", "description": "5k on sundays" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let group: Value = test::read_body_json(resp).await;
    let group_id = group["id"].as_i64().unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/groups/{}/join", group_id))
        .insert_header(bearer(carol))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // Only the owner may answer.
    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/groups/{}/join/{}", group_id, carol))
        .insert_header(bearer(carol))
        .set_json(json!({ "decision": "accept" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/groups/{}/join/{}", group_id, carol))
        .insert_header(bearer(owner))
        .set_json(json!({ "decision": "accept" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["state"], "ACCEPTED");

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/groups/{}/events", group_id))
        .insert_header(bearer(owner))
        .set_json(json!({ "title": "Spring race" }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["notified"], 2);

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications")
        .insert_header(bearer(carol))
        .to_request();
    let notifications: Vec<Notification> = test::call_and_read_body_json(&app, req).await;
    let kinds: Vec<_> = notifications.iter().map(|n| n.kind.as_str()).collect();
    assert_eq!(kinds, vec!["event", "join_request_response"]);

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/groups/{}/leave", group_id))
        .insert_header(bearer(carol))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[actix_rt::test]
async fn test_chat_history_forbidden_for_outsiders() {
    let (store, state) = state();
    let alice = user(&store, "alice", false).await;
    let bob = user(&store, "bob", false).await;
    let mallory = user(&store, "mallory", false).await;
    let chat = store.get_or_create_private_chat(alice, bob).await.unwrap();
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/chats/private/{}/messages", chat.id))
        .insert_header(bearer(alice))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/chats/private/{}/messages", chat.id))
        .insert_header(bearer(mallory))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/chats/channel/{}/messages", chat.id))
        .insert_header(bearer(alice))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_rt::test]
async fn test_ws_status_requires_token_and_reports_offline() {
    let (store, state) = state();
    let viewer = user(&store, "viewer", false).await;
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/v1/ws/status/7").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri("/api/v1/ws/status/7")
        .insert_header(bearer(viewer))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["user_id"], 7);
    assert_eq!(body["chat"], false);
    assert_eq!(body["notifications"], false);
}

#[actix_rt::test]
async fn test_chat_list_shows_callers_conversations() {
    let (store, state) = state();
    let alice = user(&store, "alice", false).await;
    let bob = user(&store, "bob", false).await;
    let carol = user(&store, "carol", false).await;
    let chat = store.get_or_create_private_chat(alice, bob).await.unwrap();
    store.get_or_create_private_chat(bob, carol).await.unwrap();
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/groups")
        .insert_header(bearer(alice))
        .set_json(json!({ "title": "Trail crew" }))
        .to_request();
    let group: Value = test::call_and_read_body_json(&app, req).await;

    let req = test::TestRequest::get()
        .uri("/api/v1/chats")
        .insert_header(bearer(alice))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["userInfo"]["nickname"], "alice");

    let chats = body["chats"].as_array().unwrap();
    assert_eq!(chats.len(), 2);
    assert!(chats.iter().any(|c| c["type"] == "private"
        && c["chatId"] == chat.id
        && c["title"] == "bob"));
    assert!(chats
        .iter()
        .any(|c| c["type"] == "group" && c["chatId"] == group["id"] && c["title"] == "Trail crew"));

    let req = test::TestRequest::get().uri("/api/v1/chats").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
