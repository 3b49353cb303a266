use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Notification payload kinds, discriminated on the wire by `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    FollowRequest,
    JoinRequest {
        #[serde(rename = "groupId")]
        group_id: i64,
    },
    InviteGroupRequest {
        #[serde(rename = "groupId")]
        group_id: i64,
    },
    Event {
        #[serde(rename = "groupId")]
        group_id: i64,
    },
    JoinRequestResponse {
        #[serde(rename = "groupId")]
        group_id: i64,
    },
}

/// Which inbox a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationCategory {
    User,
    Group,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::User => "user",
            NotificationCategory::Group => "group",
        }
    }
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::FollowRequest => "follow_request",
            NotificationKind::JoinRequest { .. } => "join_request",
            NotificationKind::InviteGroupRequest { .. } => "invite_group_request",
            NotificationKind::Event { .. } => "event",
            NotificationKind::JoinRequestResponse { .. } => "join_request_response",
        }
    }

    pub fn category(&self) -> NotificationCategory {
        match self {
            NotificationKind::FollowRequest => NotificationCategory::User,
            _ => NotificationCategory::Group,
        }
    }

    pub fn group_id(&self) -> Option<i64> {
        match self {
            NotificationKind::FollowRequest => None,
            NotificationKind::JoinRequest { group_id }
            | NotificationKind::InviteGroupRequest { group_id }
            | NotificationKind::Event { group_id }
            | NotificationKind::JoinRequestResponse { group_id } => Some(*group_id),
        }
    }

    /// Rebuilds a kind from its stored column pair.
    pub fn from_parts(kind: &str, group_id: Option<i64>) -> AppResult<Self> {
        let group = |name: &str| {
            group_id.ok_or_else(|| {
                AppError::Internal(format!("{} notification stored without group id", name))
            })
        };
        Ok(match kind {
            "follow_request" => NotificationKind::FollowRequest,
            "join_request" => NotificationKind::JoinRequest {
                group_id: group(kind)?,
            },
            "invite_group_request" => NotificationKind::InviteGroupRequest {
                group_id: group(kind)?,
            },
            "event" => NotificationKind::Event {
                group_id: group(kind)?,
            },
            "join_request_response" => NotificationKind::JoinRequestResponse {
                group_id: group(kind)?,
            },
            other => {
                return Err(AppError::Internal(format!(
                    "unknown notification type: {}",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    Pending,
    Accepted,
    Declined,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Unset => "",
            NotificationStatus::Pending => "pending",
            NotificationStatus::Accepted => "accepted",
            NotificationStatus::Declined => "declined",
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        match s {
            "" => Ok(NotificationStatus::Unset),
            "pending" => Ok(NotificationStatus::Pending),
            "accepted" => Ok(NotificationStatus::Accepted),
            "declined" => Ok(NotificationStatus::Declined),
            other => Err(AppError::Internal(format!(
                "unknown notification status: {}",
                other
            ))),
        }
    }
}

/// A notification not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotification {
    pub requester_id: i64,
    pub receiver_id: i64,
    pub kind: NotificationKind,
    pub content: String,
    pub status: NotificationStatus,
    /// Proposal this notification represents, if any
    pub request_id: Option<i64>,
}

impl NewNotification {
    pub fn new(requester_id: i64, receiver_id: i64, kind: NotificationKind, content: String) -> Self {
        Self {
            requester_id,
            receiver_id,
            kind,
            content,
            status: NotificationStatus::Unset,
            request_id: None,
        }
    }

    pub fn with_status(mut self, status: NotificationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn linked_to(mut self, request_id: i64) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Persisted notification.
///
/// Wire shape: `{id, requesterId, receiverId, groupId?, content, type, status, read}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub requester_id: i64,
    pub receiver_id: i64,
    #[serde(flatten)]
    pub kind: NotificationKind,
    pub content: String,
    pub status: NotificationStatus,
    pub read: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn category(&self) -> NotificationCategory {
        self.kind.category()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: NotificationKind) -> Notification {
        Notification {
            id: 1,
            requester_id: 2,
            receiver_id: 3,
            kind,
            content: "hello".into(),
            status: NotificationStatus::Pending,
            read: false,
            request_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_category_derivation() {
        assert_eq!(
            NotificationKind::FollowRequest.category(),
            NotificationCategory::User
        );
        for kind in [
            NotificationKind::JoinRequest { group_id: 1 },
            NotificationKind::InviteGroupRequest { group_id: 1 },
            NotificationKind::Event { group_id: 1 },
            NotificationKind::JoinRequestResponse { group_id: 1 },
        ] {
            assert_eq!(kind.category(), NotificationCategory::Group);
        }
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(sample(NotificationKind::JoinRequest { group_id: 8 })).unwrap();
        assert_eq!(value["type"], "join_request");
        assert_eq!(value["groupId"], 8);
        assert_eq!(value["requesterId"], 2);
        assert_eq!(value["receiverId"], 3);
        assert_eq!(value["status"], "pending");

        let value = serde_json::to_value(sample(NotificationKind::FollowRequest)).unwrap();
        assert_eq!(value["type"], "follow_request");
        assert!(value.get("groupId").is_none());
    }

    #[test]
    fn test_unset_status_serializes_empty() {
        let mut n = sample(NotificationKind::Event { group_id: 4 });
        n.status = NotificationStatus::Unset;
        let value = serde_json::to_value(n).unwrap();
        assert_eq!(value["status"], "");
    }

    #[test]
    fn test_discriminated_parse() {
        let kind: NotificationKind =
            serde_json::from_str(r#"{"type":"invite_group_request","groupId":5}"#).unwrap();
        assert_eq!(kind, NotificationKind::InviteGroupRequest { group_id: 5 });

        let bad = serde_json::from_str::<NotificationKind>(r#"{"type":"join_request"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_from_parts_requires_group_for_group_kinds() {
        assert_eq!(
            NotificationKind::from_parts("follow_request", None).unwrap(),
            NotificationKind::FollowRequest
        );
        assert!(NotificationKind::from_parts("event", None).is_err());
        assert!(NotificationKind::from_parts("nope", Some(1)).is_err());
    }
}
