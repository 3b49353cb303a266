use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/notifications
///
/// Both categories, newest first.
pub async fn list_notifications(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    query: web::Query<ListQuery>,
) -> AppResult<HttpResponse> {
    let notifications = state.dispatcher.list(user.id(), query.limit).await?;
    Ok(HttpResponse::Ok().json(notifications))
}

/// PUT /api/v1/notifications/{id}/read
pub async fn mark_as_read(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    state
        .dispatcher
        .acknowledge(user.id(), path.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/notifications")
            .route("", web::get().to(list_notifications))
            .route("/{id}/read", web::put().to(mark_as_read)),
    );
}
