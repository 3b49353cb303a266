/// WebSocket upgrade endpoints
///
/// Both channels authenticate before the upgrade; an invalid token is
/// answered with 401 and no socket is opened.
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde_json::json;
use tracing::info;

use crate::auth::AuthenticatedUser;
use crate::state::AppState;
use crate::websocket::{Channel, WsSession};

/// WebSocket message size limit (64 KB)
const WS_MESSAGE_SIZE_LIMIT: usize = 64 * 1024;

fn start_session(
    channel: Channel,
    user: AuthenticatedUser,
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState,
) -> Result<HttpResponse, Error> {
    info!(user_id = user.id(), channel = channel.as_str(), "websocket upgrade");
    let session = WsSession::new(user.id(), channel, state.clone());
    ws::WsResponseBuilder::new(session, req, stream)
        .frame_size(WS_MESSAGE_SIZE_LIMIT)
        .start()
}

/// GET /ws/messages
pub async fn chat_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, Error> {
    start_session(Channel::Chat, user, &req, stream, &state)
}

/// GET /ws/notifications
pub async fn notifications_ws(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> Result<HttpResponse, Error> {
    start_session(Channel::Notifications, user, &req, stream, &state)
}

/// Get WebSocket connection status for a user
///
/// Endpoint: GET /api/v1/ws/status/{user_id}
pub async fn ws_status(
    path: web::Path<i64>,
    state: web::Data<AppState>,
    _user: AuthenticatedUser,
) -> HttpResponse {
    let user_id = path.into_inner();
    let chat = state.chat_registry.is_online(user_id).await;
    let notifications = state.notification_registry.is_online(user_id).await;

    HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "chat": chat,
        "notifications": notifications,
    }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/messages", web::get().to(chat_ws))
        .route("/ws/notifications", web::get().to(notifications_ws))
        .route("/api/v1/ws/status/{user_id}", web::get().to(ws_status));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_message_size_limit() {
        assert_eq!(WS_MESSAGE_SIZE_LIMIT, 65_536);
    }
}
