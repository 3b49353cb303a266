/// Group membership endpoints: create, join, invite, leave, events
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::auth::AuthenticatedUser;
use crate::error::AppResult;
use crate::models::{Decision, NewGroup, RequestKey};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DecisionPayload {
    pub decision: Decision,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitePayload {
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EventPayload {
    pub title: String,
}

/// POST /api/v1/groups
pub async fn create_group(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    payload: web::Json<NewGroup>,
) -> AppResult<HttpResponse> {
    let group = state
        .requests
        .create_group(user.id(), payload.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(group))
}

/// POST /api/v1/groups/{id}/join
pub async fn request_join(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let outcome = state
        .requests
        .request_join(user.id(), path.into_inner())
        .await?;
    Ok(HttpResponse::Created().json(outcome))
}

/// DELETE /api/v1/groups/{id}/join
pub async fn withdraw_join(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let key = RequestKey::membership(user.id(), path.into_inner());
    let state_after = state.requests.withdraw(user.id(), key).await?;
    Ok(HttpResponse::Ok().json(json!({ "state": state_after })))
}

/// POST /api/v1/groups/{id}/join/{requester_id}
///
/// The group owner answers a join request.
pub async fn respond_join(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<(i64, i64)>,
    payload: web::Json<DecisionPayload>,
) -> AppResult<HttpResponse> {
    let (group_id, requester_id) = path.into_inner();
    let state_after = state
        .requests
        .respond(
            user.id(),
            RequestKey::membership(requester_id, group_id),
            payload.decision,
        )
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "state": state_after })))
}

/// POST /api/v1/groups/{id}/invites
pub async fn invite(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
    payload: web::Json<InvitePayload>,
) -> AppResult<HttpResponse> {
    let outcomes = state
        .requests
        .invite(user.id(), path.into_inner(), &payload.user_ids)
        .await?;
    Ok(HttpResponse::Ok().json(outcomes))
}

/// POST /api/v1/groups/{id}/invites/respond
pub async fn respond_invite(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
    payload: web::Json<DecisionPayload>,
) -> AppResult<HttpResponse> {
    let key = RequestKey::membership(user.id(), path.into_inner());
    let state_after = state
        .requests
        .respond(user.id(), key, payload.decision)
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "state": state_after })))
}

/// POST /api/v1/groups/{id}/leave
pub async fn leave(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    state
        .requests
        .leave_group(user.id(), path.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

/// POST /api/v1/groups/{id}/events
pub async fn create_event(
    state: web::Data<AppState>,
    user: AuthenticatedUser,
    path: web::Path<i64>,
    payload: web::Json<EventPayload>,
) -> AppResult<HttpResponse> {
    let sent = state
        .dispatcher
        .announce_group_event(user.id(), path.into_inner(), &payload.title)
        .await?;
    Ok(HttpResponse::Created().json(json!({ "notified": sent.len() })))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/groups")
            .route("", web::post().to(create_group))
            .route("/{id}/join", web::post().to(request_join))
            .route("/{id}/join", web::delete().to(withdraw_join))
            .route("/{id}/join/{requester_id}", web::post().to(respond_join))
            .route("/{id}/invites", web::post().to(invite))
            .route("/{id}/invites/respond", web::post().to(respond_invite))
            .route("/{id}/leave", web::post().to(leave))
            .route("/{id}/events", web::post().to(create_event)),
    );
}
