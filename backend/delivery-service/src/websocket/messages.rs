/// Control frames exchanged on the websocket channels.
///
/// Chat payloads travel as bare `ChatMessage` JSON and notifications as bare
/// `Notification` JSON; only the frames below carry a `type` tag of their own.
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Client frames accepted on the notification channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationInbound {
    /// Marks a delivered notification consumed
    Ack { id: i64 },

    /// Proposes following `receiverId`
    FollowRequest {
        #[serde(rename = "receiverId")]
        receiver_id: i64,
    },

    /// Asks to join `groupId`
    JoinRequest {
        #[serde(rename = "groupId")]
        group_id: i64,
    },
}

impl NotificationInbound {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Server frames other than chat or notification payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection accepted and registered
    Connected { user_id: i64, channel: String },

    /// A client frame was processed
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<i64>,
    },

    /// A client frame was rejected
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn connected(user_id: i64, channel: &str) -> Self {
        ServerEvent::Connected {
            user_id,
            channel: channel.to_string(),
        }
    }

    pub fn ack(id: Option<i64>) -> Self {
        ServerEvent::Ack { id }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&AppError> for ServerEvent {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::Validation(_) => "validation_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Forbidden(_) => "forbidden",
            AppError::Unauthorized => "unauthorized",
            AppError::Database(_) => "store_unavailable",
            AppError::Config(_) | AppError::Internal(_) => "internal_error",
        };
        ServerEvent::error(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ack() {
        let msg = NotificationInbound::from_json(r#"{"type":"ack","id":42}"#).unwrap();
        assert_eq!(msg, NotificationInbound::Ack { id: 42 });
    }

    #[test]
    fn test_parse_follow_request() {
        let msg =
            NotificationInbound::from_json(r#"{"type":"follow_request","receiverId":3}"#).unwrap();
        assert_eq!(msg, NotificationInbound::FollowRequest { receiver_id: 3 });
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(NotificationInbound::from_json(r#"{"type":"poke"}"#).is_err());
    }

    #[test]
    fn test_error_event_from_app_error() {
        let event = ServerEvent::from(&AppError::Conflict("dup".into()));
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""code":"conflict""#));
    }
}
