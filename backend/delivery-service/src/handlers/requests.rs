/// Follow proposal endpoints
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::{Decision, RequestKey};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RespondPayload {
    pub decision: Decision,
}

/// POST /api/v1/follows/{user_id}
pub async fn follow(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let outcome = state.requests.follow(user.id(), path.into_inner()).await?;
    Ok(HttpResponse::Created().json(outcome))
}

/// DELETE /api/v1/follows/{user_id}
///
/// Withdraws a pending request or unfollows.
pub async fn unfollow(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let key = RequestKey::follow(user.id(), path.into_inner());
    let state_after = state.requests.withdraw(user.id(), key).await?;
    Ok(HttpResponse::Ok().json(json!({ "state": state_after })))
}

/// POST /api/v1/follows/requests/{requester_id}
pub async fn respond(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
    payload: web::Json<RespondPayload>,
) -> AppResult<HttpResponse> {
    let key = RequestKey::follow(path.into_inner(), user.id());
    let state_after = state
        .requests
        .respond(user.id(), key, payload.decision)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "state": state_after })))
}

/// GET /api/v1/follows/requests
pub async fn incoming(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
) -> AppResult<HttpResponse> {
    let requests = state.requests.incoming_follow_requests(user.id()).await?;
    Ok(HttpResponse::Ok().json(requests))
}

/// GET /api/v1/follows/{user_id}/status
pub async fn status(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let target_id = path.into_inner();
    let outgoing = state
        .requests
        .state_of(&RequestKey::follow(user.id(), target_id))
        .await?;
    let incoming = state
        .requests
        .state_of(&RequestKey::follow(target_id, user.id()))
        .await?;
    Ok(HttpResponse::Ok().json(json!({
        "userId": target_id,
        "state": outgoing,
        "followsYou": incoming,
    })))
}

/// GET /api/v1/follows/{user_id}/followers
pub async fn followers(
    state: web::Data<AppState>,
    _user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let ids = state.requests.followers(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ids))
}

/// GET /api/v1/follows/{user_id}/following
pub async fn following(
    state: web::Data<AppState>,
    _user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let ids = state.requests.following(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ids))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/follows")
            .route("/requests", web::get().to(incoming))
            .route("/requests/{requester_id}", web::post().to(respond))
            .route("/{user_id}", web::post().to(follow))
            .route("/{user_id}", web::delete().to(unfollow))
            .route("/{user_id}/status", web::get().to(status))
            .route("/{user_id}/followers", web::get().to(followers))
            .route("/{user_id}/following", web::get().to(following)),
    );
}
