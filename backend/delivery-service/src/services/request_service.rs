use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::models::{
    Decision, Group, NewGroup, NewNotification, NewRequest, Notification, NotificationKind,
    NotificationStatus, PrivateChat, Request, RequestKey, RequestKind, Subject, User,
};
use crate::services::notification_dispatcher::NotificationDispatcher;
use crate::services::request_state::{RequestEvent, RequestState};
use crate::store::Store;
use crate::websocket::Delivery;

/// Result of a successful proposal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalOutcome {
    pub request: Request,
    pub notification: Notification,
    pub delivery: Delivery,
    /// Set for follow proposals; absent if chat creation failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_chat: Option<PrivateChat>,
}

/// Per-invitee result of a group invite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum InviteResult {
    Invited {
        #[serde(rename = "requestId")]
        request_id: i64,
    },
    AlreadyMember,
    AlreadyPending,
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteOutcome {
    pub user_id: i64,
    #[serde(flatten)]
    pub result: InviteResult,
}

/// Drives follow, join and invite proposals through their lifecycle.
///
/// Every transition and its durable side effect commit together in the store.
/// Notifications linked to a proposal are written in that same unit; response
/// notifications go out after commit and a failure there is only logged.
pub struct RequestService {
    store: Arc<dyn Store>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl RequestService {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Current state of a key as seen by the state machine.
    pub async fn state_of(&self, key: &RequestKey) -> AppResult<RequestState> {
        if self.store.relation_exists(key).await? {
            return Ok(RequestState::Accepted);
        }
        Ok(self
            .store
            .find_request(key)
            .await?
            .map(|r| r.state)
            .unwrap_or(RequestState::None))
    }

    // Generic lifecycle

    /// NONE to PENDING, or straight to ACCEPTED for a follow to a public profile.
    pub async fn propose(&self, request: NewRequest) -> AppResult<ProposalOutcome> {
        request.validate()?;
        let requester = self.require_user(request.requester_id).await?;

        match request.kind {
            RequestKind::Follow => self.propose_follow(requester, request).await,
            RequestKind::Join => self.propose_join(requester, request).await,
            RequestKind::Invite => self.propose_invite(requester, request).await,
        }
    }

    /// PENDING to ACCEPTED or DECLINED, decided by the party the proposal waits on.
    pub async fn respond(
        &self,
        responder_id: i64,
        key: RequestKey,
        decision: Decision,
    ) -> AppResult<RequestState> {
        let request = self
            .store
            .find_request(&key)
            .await?
            .ok_or_else(|| AppError::NotFound("no pending request".into()))?;
        let group = match key.subject {
            Subject::Group(group_id) => Some(self.require_group(group_id).await?),
            Subject::User(_) => None,
        };
        self.authorize_response(responder_id, &request, group.as_ref())?;

        let event = match decision {
            Decision::Accept => RequestEvent::Accept,
            Decision::Decline => RequestEvent::Decline,
        };
        // Early check; the store re-checks under its lock or row lock.
        request.state.apply(event)?;

        let new_state = match decision {
            Decision::Accept => {
                let accepted = self.store.accept_request(request.id).await?;
                accepted.request.state
            }
            Decision::Decline => self.store.decline_request(request.id).await?.state,
        };

        info!(
            request_id = request.id,
            kind = request.kind.as_str(),
            responder_id,
            state = new_state.as_str(),
            "request answered"
        );

        if let Some(group) = group {
            self.notify_response(responder_id, &request, &group, decision)
                .await;
        }
        Ok(new_state)
    }

    /// Any state to NONE. Follow keys also drop the edge in both directions.
    ///
    /// A pending proposal may be withdrawn by the keyed user or its requester;
    /// an established relation only by the keyed user.
    pub async fn withdraw(&self, actor_id: i64, key: RequestKey) -> AppResult<RequestState> {
        let current = self.state_of(&key).await?;
        let allowed = actor_id == key.user_id
            || (current == RequestState::Pending
                && self
                    .store
                    .find_request(&key)
                    .await?
                    .map(|r| r.requester_id == actor_id)
                    .unwrap_or(false));
        if !allowed {
            return Err(AppError::Forbidden("cannot withdraw another user's request".into()));
        }

        let next = current.apply(RequestEvent::Withdraw)?;
        let removed = match key.subject {
            Subject::Group(group_id) if current == RequestState::Accepted => {
                self.store.leave_group(group_id, key.user_id).await?
            }
            _ => self.store.withdraw_request(&key).await?,
        };
        info!(
            actor_id,
            user_id = key.user_id,
            subject = key.subject.id(),
            removed,
            "request withdrawn"
        );
        Ok(next)
    }

    // Typed entry points

    pub async fn follow(&self, follower_id: i64, target_id: i64) -> AppResult<ProposalOutcome> {
        self.propose(NewRequest {
            kind: RequestKind::Follow,
            requester_id: follower_id,
            key: RequestKey::follow(follower_id, target_id),
        })
        .await
    }

    pub async fn request_join(&self, user_id: i64, group_id: i64) -> AppResult<ProposalOutcome> {
        self.propose(NewRequest {
            kind: RequestKind::Join,
            requester_id: user_id,
            key: RequestKey::membership(user_id, group_id),
        })
        .await
    }

    /// Invites several users at once; one outcome per distinct invitee.
    pub async fn invite(
        &self,
        inviter_id: i64,
        group_id: i64,
        invitee_ids: &[i64],
    ) -> AppResult<Vec<InviteOutcome>> {
        self.require_group(group_id).await?;
        if !self.store.is_member(group_id, inviter_id).await? {
            return Err(AppError::Forbidden("only members can invite".into()));
        }

        let unique: BTreeSet<i64> = invitee_ids.iter().copied().collect();
        let mut outcomes = Vec::with_capacity(unique.len());
        for user_id in unique {
            let result = match self
                .propose(NewRequest {
                    kind: RequestKind::Invite,
                    requester_id: inviter_id,
                    key: RequestKey::membership(user_id, group_id),
                })
                .await
            {
                Ok(outcome) => InviteResult::Invited {
                    request_id: outcome.request.id,
                },
                Err(AppError::Conflict(_)) => {
                    match self.state_of(&RequestKey::membership(user_id, group_id)).await? {
                        RequestState::Accepted => InviteResult::AlreadyMember,
                        _ => InviteResult::AlreadyPending,
                    }
                }
                Err(e @ (AppError::Database(_) | AppError::Internal(_))) => return Err(e),
                Err(e) => InviteResult::Rejected {
                    reason: e.to_string(),
                },
            };
            outcomes.push(InviteOutcome { user_id, result });
        }
        Ok(outcomes)
    }

    pub async fn create_group(&self, creator_id: i64, group: NewGroup) -> AppResult<Group> {
        group.validate()?;
        self.require_user(creator_id).await?;
        let group = self.store.create_group(creator_id, group).await?;
        info!(group_id = group.id, creator_id, "group created");
        Ok(group)
    }

    /// Drops the membership and any proposal row for the same key.
    pub async fn leave_group(&self, user_id: i64, group_id: i64) -> AppResult<()> {
        self.require_group(group_id).await?;
        if !self.store.leave_group(group_id, user_id).await? {
            return Err(AppError::NotFound(format!(
                "user {} is not a member of group {}",
                user_id, group_id
            )));
        }
        info!(user_id, group_id, "left group");
        Ok(())
    }

    pub async fn incoming_follow_requests(&self, user_id: i64) -> AppResult<Vec<Request>> {
        self.store.incoming_follow_requests(user_id).await
    }

    pub async fn followers(&self, user_id: i64) -> AppResult<Vec<i64>> {
        self.require_user(user_id).await?;
        self.store.followers(user_id).await
    }

    pub async fn following(&self, user_id: i64) -> AppResult<Vec<i64>> {
        self.require_user(user_id).await?;
        self.store.following(user_id).await
    }

    // Internals

    async fn propose_follow(&self, follower: User, request: NewRequest) -> AppResult<ProposalOutcome> {
        let target = self.require_user(request.key.subject.id()).await?;
        let current = self.state_of(&request.key).await?;

        let (stored, notification) = if target.is_public {
            current.apply(RequestEvent::AutoAccept)?;
            let notification = NewNotification::new(
                follower.id,
                target.id,
                NotificationKind::FollowRequest,
                format!("{} started following you", follower.nickname),
            );
            self.store.create_accepted_follow(request, notification).await?
        } else {
            current.apply(RequestEvent::Propose)?;
            let notification = NewNotification::new(
                follower.id,
                target.id,
                NotificationKind::FollowRequest,
                format!("{} wants to follow you", follower.nickname),
            )
            .with_status(NotificationStatus::Pending);
            self.store.create_pending_request(request, notification).await?
        };

        info!(
            follower_id = follower.id,
            target_id = target.id,
            state = stored.state.as_str(),
            "follow proposed"
        );

        let delivery = self.dispatcher.deliver(&notification).await;
        let private_chat = match self
            .store
            .get_or_create_private_chat(follower.id, target.id)
            .await
        {
            Ok(chat) => Some(chat),
            Err(e) => {
                warn!(follower_id = follower.id, target_id = target.id, error = %e, "private chat creation failed");
                None
            }
        };

        Ok(ProposalOutcome {
            request: stored,
            notification,
            delivery,
            private_chat,
        })
    }

    async fn propose_join(&self, requester: User, request: NewRequest) -> AppResult<ProposalOutcome> {
        let group = self.require_group(request.key.subject.id()).await?;
        self.state_of(&request.key)
            .await?
            .apply(RequestEvent::Propose)?;

        let notification = NewNotification::new(
            requester.id,
            group.creator_id,
            NotificationKind::JoinRequest { group_id: group.id },
            format!("{} wants to join the group '{}'", requester.nickname, group.title),
        )
        .with_status(NotificationStatus::Pending);
        self.finish_pending(request, notification).await
    }

    async fn propose_invite(&self, inviter: User, request: NewRequest) -> AppResult<ProposalOutcome> {
        let group = self.require_group(request.key.subject.id()).await?;
        if !self.store.is_member(group.id, inviter.id).await? {
            return Err(AppError::Forbidden("only members can invite".into()));
        }
        let invitee = self.require_user(request.key.user_id).await?;
        self.state_of(&request.key)
            .await?
            .apply(RequestEvent::Propose)?;

        let notification = NewNotification::new(
            inviter.id,
            invitee.id,
            NotificationKind::InviteGroupRequest { group_id: group.id },
            format!("{} invited you to the group '{}'", inviter.nickname, group.title),
        )
        .with_status(NotificationStatus::Pending);
        self.finish_pending(request, notification).await
    }

    async fn finish_pending(
        &self,
        request: NewRequest,
        notification: NewNotification,
    ) -> AppResult<ProposalOutcome> {
        let (stored, notification) = self
            .store
            .create_pending_request(request, notification)
            .await?;
        info!(
            request_id = stored.id,
            kind = stored.kind.as_str(),
            user_id = stored.key.user_id,
            subject = stored.key.subject.id(),
            "request pending"
        );
        let delivery = self.dispatcher.deliver(&notification).await;
        Ok(ProposalOutcome {
            request: stored,
            notification,
            delivery,
            private_chat: None,
        })
    }

    fn authorize_response(
        &self,
        responder_id: i64,
        request: &Request,
        group: Option<&Group>,
    ) -> AppResult<()> {
        let allowed = match (request.kind, group) {
            (RequestKind::Follow, _) => request.key.subject == Subject::User(responder_id),
            (RequestKind::Join, Some(group)) => group.creator_id == responder_id,
            (RequestKind::Invite, _) => request.key.user_id == responder_id,
            (RequestKind::Join, None) => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "user {} cannot answer this {} request",
                responder_id,
                request.kind.as_str()
            )))
        }
    }

    async fn notify_response(
        &self,
        responder_id: i64,
        request: &Request,
        group: &Group,
        decision: Decision,
    ) {
        let status = match decision {
            Decision::Accept => NotificationStatus::Accepted,
            Decision::Decline => NotificationStatus::Declined,
        };
        let notification = match (request.kind, decision) {
            (RequestKind::Join, _) => NewNotification::new(
                responder_id,
                request.key.user_id,
                NotificationKind::JoinRequestResponse { group_id: group.id },
                match decision {
                    Decision::Accept => format!("Your request to join '{}' was accepted", group.title),
                    Decision::Decline => format!("Your request to join '{}' was declined", group.title),
                },
            ),
            (RequestKind::Invite, Decision::Accept) => {
                let responder = match self.require_user(responder_id).await {
                    Ok(user) => user,
                    Err(e) => {
                        warn!(request_id = request.id, responder_id, error = %e, "responder lookup failed");
                        return;
                    }
                };
                NewNotification::new(
                    responder.id,
                    group.creator_id,
                    NotificationKind::InviteGroupRequest { group_id: group.id },
                    format!("{} accepted the invitation to '{}'", responder.nickname, group.title),
                )
            }
            _ => return,
        }
        .with_status(status);

        if let Err(e) = self.dispatcher.dispatch(notification).await {
            warn!(
                request_id = request.id,
                group_id = group.id,
                error = %e,
                "response notification failed after commit"
            );
        }
    }

    async fn require_user(&self, user_id: i64) -> AppResult<User> {
        self.store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))
    }

    async fn require_group(&self, group_id: i64) -> AppResult<Group> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("group {}", group_id)))
    }
}
