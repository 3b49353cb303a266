use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::services::request_state::RequestState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Follow,
    Join,
    Invite,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Follow => "follow",
            RequestKind::Join => "join",
            RequestKind::Invite => "invite",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "follow" => Ok(RequestKind::Follow),
            "join" => Ok(RequestKind::Join),
            "invite" => Ok(RequestKind::Invite),
            other => Err(AppError::Internal(format!("unknown request kind: {}", other))),
        }
    }
}

/// What a proposal is about: another user (follow) or a group (join/invite).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Subject {
    User(i64),
    Group(i64),
}

impl Subject {
    pub fn id(&self) -> i64 {
        match self {
            Subject::User(id) | Subject::Group(id) => *id,
        }
    }
}

/// Identity of a proposal. At most one request row exists per key.
///
/// `user_id` is the user who ends up holding the relation: the follower,
/// the joining user or the invitee. Join and invite therefore share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestKey {
    pub user_id: i64,
    pub subject: Subject,
}

impl RequestKey {
    pub fn follow(follower_id: i64, target_id: i64) -> Self {
        Self {
            user_id: follower_id,
            subject: Subject::User(target_id),
        }
    }

    pub fn membership(user_id: i64, group_id: i64) -> Self {
        Self {
            user_id,
            subject: Subject::Group(group_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRequest {
    pub kind: RequestKind,
    /// Who initiated the proposal (differs from `key.user_id` only for invites)
    pub requester_id: i64,
    pub key: RequestKey,
}

impl NewRequest {
    pub fn validate(&self) -> AppResult<()> {
        let subject_ok = matches!(
            (self.kind, self.key.subject),
            (RequestKind::Follow, Subject::User(_))
                | (RequestKind::Join, Subject::Group(_))
                | (RequestKind::Invite, Subject::Group(_))
        );
        if !subject_ok {
            return Err(AppError::Validation(format!(
                "{} request has mismatched subject",
                self.kind.as_str()
            )));
        }
        if self.kind == RequestKind::Follow && self.key.subject == Subject::User(self.key.user_id) {
            return Err(AppError::Validation("users cannot follow themselves".into()));
        }
        if self.kind == RequestKind::Invite && self.requester_id == self.key.user_id {
            return Err(AppError::Validation("users cannot invite themselves".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: i64,
    pub kind: RequestKind,
    pub requester_id: i64,
    pub key: RequestKey,
    pub state: RequestState,
    pub created_at: DateTime<Utc>,
}

/// Answer to a pending proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Accept,
    Decline,
}
