//! Durable store seam.
//!
//! Every method is one all-or-nothing unit: either every row it touches is
//! written or none is. `PgStore` runs each multi-row method inside a single
//! transaction; `MemoryStore` holds one lock for the whole call.

use crate::error::AppResult;
use crate::models::{
    ChatMessage, ChatTarget, Group, NewChatMessage, NewGroup, NewNotification, NewRequest,
    NewUser, Notification, NotificationCategory, PrivateChat, Request, RequestKey, User,
};

pub mod memory;
pub mod postgres;

pub use memory::{FailPoint, MemoryStore};
pub use postgres::PgStore;

/// Result of accepting a pending proposal.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub request: Request,
    /// The proposal's own notification, now carrying `accepted`
    pub notifications: Vec<Notification>,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // Users and groups

    async fn create_user(&self, user: NewUser) -> AppResult<User>;

    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>>;

    /// Creates the group and the creator's membership together.
    async fn create_group(&self, creator_id: i64, group: NewGroup) -> AppResult<Group>;

    async fn get_group(&self, group_id: i64) -> AppResult<Option<Group>>;

    /// Current member ids, ascending.
    async fn group_member_ids(&self, group_id: i64) -> AppResult<Vec<i64>>;

    async fn is_member(&self, group_id: i64, user_id: i64) -> AppResult<bool>;

    /// Groups the user currently belongs to, by id.
    async fn groups_for(&self, user_id: i64) -> AppResult<Vec<Group>>;

    /// Removes the membership and any request row for the same key.
    /// Returns false if the user was not a member.
    async fn leave_group(&self, group_id: i64, user_id: i64) -> AppResult<bool>;

    // Chats

    /// Looks the pair up in either order and inserts it if absent.
    async fn get_or_create_private_chat(&self, user_a: i64, user_b: i64) -> AppResult<PrivateChat>;

    async fn get_private_chat(&self, chat_id: i64) -> AppResult<Option<PrivateChat>>;

    /// Private chats the user is part of, by id.
    async fn private_chats_for(&self, user_id: i64) -> AppResult<Vec<PrivateChat>>;

    /// Assigns id and server timestamp.
    async fn insert_message(&self, message: NewChatMessage) -> AppResult<ChatMessage>;

    /// Most recent `limit` messages of a conversation, oldest first.
    async fn list_messages(&self, target: ChatTarget, limit: i64) -> AppResult<Vec<ChatMessage>>;

    // Notifications

    async fn insert_notification(&self, notification: NewNotification) -> AppResult<Notification>;

    async fn get_notification(&self, notification_id: i64) -> AppResult<Option<Notification>>;

    /// Unread notifications of one category for a receiver, in stored order.
    async fn unread_notifications(
        &self,
        receiver_id: i64,
        category: NotificationCategory,
    ) -> AppResult<Vec<Notification>>;

    /// Marks every id read in one update; returns rows changed.
    async fn mark_read(&self, notification_ids: &[i64]) -> AppResult<u64>;

    /// All notifications for a receiver, newest first.
    async fn list_notifications(&self, receiver_id: i64, limit: i64) -> AppResult<Vec<Notification>>;

    // Relations

    async fn is_following(&self, follower_id: i64, following_id: i64) -> AppResult<bool>;

    async fn followers(&self, user_id: i64) -> AppResult<Vec<i64>>;

    async fn following(&self, user_id: i64) -> AppResult<Vec<i64>>;

    /// Whether the relation a key stands for already exists
    /// (follow edge or group membership).
    async fn relation_exists(&self, key: &RequestKey) -> AppResult<bool>;

    // Proposals

    async fn find_request(&self, key: &RequestKey) -> AppResult<Option<Request>>;

    /// PENDING follow requests targeting a user, oldest first.
    async fn incoming_follow_requests(&self, user_id: i64) -> AppResult<Vec<Request>>;

    /// Inserts a PENDING request and its notification, linked by request id.
    /// Conflict if a row already exists for the key.
    async fn create_pending_request(
        &self,
        request: NewRequest,
        notification: NewNotification,
    ) -> AppResult<(Request, Notification)>;

    /// Inserts an ACCEPTED follow request, its notification and the follow edge.
    async fn create_accepted_follow(
        &self,
        request: NewRequest,
        notification: NewNotification,
    ) -> AppResult<(Request, Notification)>;

    /// PENDING to ACCEPTED: flips the request and its linked notifications to
    /// accepted and creates the relation. Conflict if the row is not pending.
    async fn accept_request(&self, request_id: i64) -> AppResult<Accepted>;

    /// Deletes a PENDING request and its linked notifications.
    async fn decline_request(&self, request_id: i64) -> AppResult<Request>;

    /// Deletes the request row for the key and its notifications. For follow
    /// keys, also deletes the reverse request row and the follow edge in both
    /// directions. Returns whether anything was removed.
    async fn withdraw_request(&self, key: &RequestKey) -> AppResult<bool>;
}
