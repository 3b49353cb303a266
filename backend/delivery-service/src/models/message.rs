use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Maximum accepted chat message body, in bytes
pub const MAX_CONTENT_BYTES: usize = 8 * 1024;

/// Where a chat message is addressed. Exactly one conversation, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatTarget {
    #[serde(rename = "privateChatId")]
    Private(i64),
    #[serde(rename = "groupChatId")]
    Group(i64),
}

impl ChatTarget {
    pub fn id(&self) -> i64 {
        match self {
            ChatTarget::Private(id) | ChatTarget::Group(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChatTarget::Private(_) => "private",
            ChatTarget::Group(_) => "group",
        }
    }
}

/// Inbound chat frame as sent by clients.
///
/// Zero or a missing field means "unset" for either chat id.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEnvelope {
    #[serde(default)]
    pub sender_id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub private_chat_id: i64,
    #[serde(default)]
    pub group_chat_id: i64,
}

impl ChatMessageEnvelope {
    pub fn target(&self) -> AppResult<ChatTarget> {
        match (self.private_chat_id, self.group_chat_id) {
            (p, 0) if p > 0 => Ok(ChatTarget::Private(p)),
            (0, g) if g > 0 => Ok(ChatTarget::Group(g)),
            (0, 0) => Err(AppError::Validation(
                "message must set privateChatId or groupChatId".into(),
            )),
            (p, g) if p != 0 && g != 0 => Err(AppError::Validation(
                "message must not set both privateChatId and groupChatId".into(),
            )),
            _ => Err(AppError::Validation("chat ids must be positive".into())),
        }
    }

    /// Validates the frame and binds it to the authenticated sender.
    ///
    /// The `senderId` on the wire is ignored; the connection owner is authoritative.
    pub fn into_new_message(self, sender_id: i64) -> AppResult<NewChatMessage> {
        let target = self.target()?;
        if self.content.trim().is_empty() {
            return Err(AppError::Validation("message content must not be empty".into()));
        }
        if self.content.len() > MAX_CONTENT_BYTES {
            return Err(AppError::Validation(format!(
                "message content exceeds {} bytes",
                MAX_CONTENT_BYTES
            )));
        }
        Ok(NewChatMessage {
            sender_id,
            content: self.content,
            target,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChatMessage {
    pub sender_id: i64,
    pub content: String,
    pub target: ChatTarget,
}

/// A persisted chat message; serialises with `privateChatId` or `groupChatId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: i64,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub target: ChatTarget,
}

/// Two-party conversation, one per unordered pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PrivateChat {
    pub id: i64,
    pub user1_id: i64,
    pub user2_id: i64,
}

impl PrivateChat {
    pub fn participants(&self) -> [i64; 2] {
        [self.user1_id, self.user2_id]
    }

    pub fn includes(&self, user_id: i64) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }
}

/// Canonical (low, high) ordering used as the private chat key.
pub fn ordered_pair(a: i64, b: i64) -> (i64, i64) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
