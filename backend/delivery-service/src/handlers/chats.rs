use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::models::ChatTarget;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/chats
///
/// The caller's private and group conversations, most recently active first.
pub async fn list_chats(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> AppResult<HttpResponse> {
    let profile = state
        .store
        .get_user(user.id())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", user.id())))?;
    let chats = state.router.conversations(user.id()).await?;
    Ok(HttpResponse::Ok().json(json!({
        "chats": chats,
        "userInfo": profile,
    })))
}

/// GET /api/v1/chats/{kind}/{id}/messages
///
/// `kind` is `private` or `group`. Oldest first.
pub async fn history(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<(String, i64)>,
    query: web::Query<HistoryQuery>,
) -> AppResult<HttpResponse> {
    let (kind, id) = path.into_inner();
    let target = match kind.as_str() {
        "private" => ChatTarget::Private(id),
        "group" => ChatTarget::Group(id),
        other => return Err(AppError::Validation(format!("unknown chat kind: {}", other))),
    };
    let messages = state.router.history(user.id(), target, query.limit).await?;
    Ok(HttpResponse::Ok().json(messages))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/v1/chats", web::get().to(list_chats))
        .route("/api/v1/chats/{kind}/{id}/messages", web::get().to(history));
}
