use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{Accepted, Store};
use crate::error::{AppError, AppResult};
use crate::models::{
    ChatMessage, ChatTarget, Group, NewChatMessage, NewGroup, NewNotification, NewRequest,
    NewUser, Notification, NotificationCategory, NotificationKind, NotificationStatus,
    PrivateChat, Request, RequestKey, RequestKind, Subject, User,
};
use crate::services::request_state::{RequestEvent, RequestState};

const NOTIFICATION_COLUMNS: &str = "id, requester_id, receiver_id, type, group_id, content, \
     status, is_read, request_id, created_at";

const REQUEST_COLUMNS: &str = "id, kind, requester_id, user_id, subject_user_id, \
     subject_group_id, status, created_at";

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    requester_id: i64,
    receiver_id: i64,
    #[sqlx(rename = "type")]
    kind: String,
    group_id: Option<i64>,
    content: String,
    status: String,
    is_read: bool,
    request_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = AppError;

    fn try_from(row: NotificationRow) -> AppResult<Self> {
        Ok(Notification {
            id: row.id,
            requester_id: row.requester_id,
            receiver_id: row.receiver_id,
            kind: NotificationKind::from_parts(&row.kind, row.group_id)?,
            content: row.content,
            status: NotificationStatus::parse(&row.status)?,
            read: row.is_read,
            request_id: row.request_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: i64,
    kind: String,
    requester_id: i64,
    user_id: i64,
    subject_user_id: Option<i64>,
    subject_group_id: Option<i64>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<RequestRow> for Request {
    type Error = AppError;

    fn try_from(row: RequestRow) -> AppResult<Self> {
        let subject = match (row.subject_user_id, row.subject_group_id) {
            (Some(user), None) => Subject::User(user),
            (None, Some(group)) => Subject::Group(group),
            _ => {
                return Err(AppError::Internal(format!(
                    "request {} has an invalid subject",
                    row.id
                )))
            }
        };
        Ok(Request {
            id: row.id,
            kind: RequestKind::parse(&row.kind)?,
            requester_id: row.requester_id,
            key: RequestKey {
                user_id: row.user_id,
                subject,
            },
            state: RequestState::parse_stored(&row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    sender_id: i64,
    content: String,
    private_chat_id: Option<i64>,
    group_chat_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for ChatMessage {
    type Error = AppError;

    fn try_from(row: MessageRow) -> AppResult<Self> {
        let target = match (row.private_chat_id, row.group_chat_id) {
            (Some(id), None) => ChatTarget::Private(id),
            (None, Some(id)) => ChatTarget::Group(id),
            _ => {
                return Err(AppError::Internal(format!(
                    "message {} has an invalid target",
                    row.id
                )))
            }
        };
        Ok(ChatMessage {
            id: row.id,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            target,
        })
    }
}

fn subject_columns(subject: Subject) -> (Option<i64>, Option<i64>) {
    match subject {
        Subject::User(id) => (Some(id), None),
        Subject::Group(id) => (None, Some(id)),
    }
}

/// `Store` backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_notification_tx(
        tx: &mut Transaction<'_, Postgres>,
        n: NewNotification,
    ) -> AppResult<Notification> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            INSERT INTO notifications
                (requester_id, receiver_id, type, category, group_id, content, status, request_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            NOTIFICATION_COLUMNS
        ))
        .bind(n.requester_id)
        .bind(n.receiver_id)
        .bind(n.kind.as_str())
        .bind(n.kind.category().as_str())
        .bind(n.kind.group_id())
        .bind(&n.content)
        .bind(n.status.as_str())
        .bind(n.request_id)
        .fetch_one(&mut **tx)
        .await?;
        row.try_into()
    }

    async fn insert_request_tx(
        tx: &mut Transaction<'_, Postgres>,
        r: &NewRequest,
        state: RequestState,
    ) -> AppResult<Request> {
        let (subject_user, subject_group) = subject_columns(r.key.subject);
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            INSERT INTO relationship_requests
                (kind, requester_id, user_id, subject_user_id, subject_group_id, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        ))
        .bind(r.kind.as_str())
        .bind(r.requester_id)
        .bind(r.key.user_id)
        .bind(subject_user)
        .bind(subject_group)
        .bind(state.stored_str())
        .fetch_one(&mut **tx)
        .await?;
        row.try_into()
    }

    async fn lock_request_tx(
        tx: &mut Transaction<'_, Postgres>,
        request_id: i64,
    ) -> AppResult<Request> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM relationship_requests WHERE id = $1 FOR UPDATE",
            REQUEST_COLUMNS
        ))
        .bind(request_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("request {} not found", request_id)))?;
        row.try_into()
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn create_user(&self, user: NewUser) -> AppResult<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (nickname, is_public)
            VALUES ($1, $2)
            RETURNING id, nickname, is_public
            "#,
        )
        .bind(&user.nickname)
        .bind(user.is_public)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, nickname, is_public FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn create_group(&self, creator_id: i64, group: NewGroup) -> AppResult<Group> {
        let mut tx = self.pool.begin().await?;
        let group = sqlx::query_as::<_, Group>(
            r#"
            INSERT INTO groups (creator_id, title, description)
            VALUES ($1, $2, $3)
            RETURNING id, creator_id, title, description, created_at
            "#,
        )
        .bind(creator_id)
        .bind(&group.title)
        .bind(&group.description)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO group_members (group_id, user_id) VALUES ($1, $2)")
            .bind(group.id)
            .bind(creator_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(group)
    }

    async fn get_group(&self, group_id: i64) -> AppResult<Option<Group>> {
        let group = sqlx::query_as::<_, Group>(
            "SELECT id, creator_id, title, description, created_at FROM groups WHERE id = $1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(group)
    }

    async fn group_member_ids(&self, group_id: i64) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM group_members WHERE group_id = $1 ORDER BY user_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn is_member(&self, group_id: i64, user_id: i64) -> AppResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM group_members WHERE group_id = $1 AND user_id = $2)",
        )
        .bind(group_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn groups_for(&self, user_id: i64) -> AppResult<Vec<Group>> {
        let groups = sqlx::query_as::<_, Group>(
            r#"
            SELECT g.id, g.creator_id, g.title, g.description, g.created_at
            FROM groups g
            JOIN group_members gm ON gm.group_id = g.id
            WHERE gm.user_id = $1
            ORDER BY g.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(groups)
    }

    async fn leave_group(&self, group_id: i64, user_id: i64) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
            .bind(group_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            "DELETE FROM relationship_requests WHERE user_id = $1 AND subject_group_id = $2",
        )
        .bind(user_id)
        .bind(group_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn get_or_create_private_chat(&self, user_a: i64, user_b: i64) -> AppResult<PrivateChat> {
        // The pair index makes the insert a no-op when a concurrent caller won.
        sqlx::query(
            r#"
            INSERT INTO private_chats (user1_id, user2_id)
            VALUES ($1, $2)
            ON CONFLICT ((LEAST(user1_id, user2_id)), (GREATEST(user1_id, user2_id))) DO NOTHING
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .execute(&self.pool)
        .await?;

        let chat = sqlx::query_as::<_, PrivateChat>(
            r#"
            SELECT id, user1_id, user2_id FROM private_chats
            WHERE (user1_id = $1 AND user2_id = $2) OR (user1_id = $2 AND user2_id = $1)
            "#,
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_one(&self.pool)
        .await?;
        Ok(chat)
    }

    async fn get_private_chat(&self, chat_id: i64) -> AppResult<Option<PrivateChat>> {
        let chat = sqlx::query_as::<_, PrivateChat>(
            "SELECT id, user1_id, user2_id FROM private_chats WHERE id = $1",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(chat)
    }

    async fn private_chats_for(&self, user_id: i64) -> AppResult<Vec<PrivateChat>> {
        let chats = sqlx::query_as::<_, PrivateChat>(
            "SELECT id, user1_id, user2_id FROM private_chats \
             WHERE user1_id = $1 OR user2_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chats)
    }

    async fn insert_message(&self, message: NewChatMessage) -> AppResult<ChatMessage> {
        let (private_chat_id, group_chat_id) = match message.target {
            ChatTarget::Private(id) => (Some(id), None),
            ChatTarget::Group(id) => (None, Some(id)),
        };
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO chat_messages (sender_id, content, private_chat_id, group_chat_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id, sender_id, content, private_chat_id, group_chat_id, created_at
            "#,
        )
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(private_chat_id)
        .bind(group_chat_id)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn list_messages(&self, target: ChatTarget, limit: i64) -> AppResult<Vec<ChatMessage>> {
        let column = match target {
            ChatTarget::Private(_) => "private_chat_id",
            ChatTarget::Group(_) => "group_chat_id",
        };
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            r#"
            SELECT * FROM (
                SELECT id, sender_id, content, private_chat_id, group_chat_id, created_at
                FROM chat_messages
                WHERE {} = $1
                ORDER BY id DESC
                LIMIT $2
            ) recent
            ORDER BY id ASC
            "#,
            column
        ))
        .bind(target.id())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_notification(&self, notification: NewNotification) -> AppResult<Notification> {
        let mut tx = self.pool.begin().await?;
        let notification = Self::insert_notification_tx(&mut tx, notification).await?;
        tx.commit().await?;
        Ok(notification)
    }

    async fn get_notification(&self, notification_id: i64) -> AppResult<Option<Notification>> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications WHERE id = $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(notification_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn unread_notifications(
        &self,
        receiver_id: i64,
        category: NotificationCategory,
    ) -> AppResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            SELECT {} FROM notifications
            WHERE receiver_id = $1 AND category = $2 AND is_read = FALSE
            ORDER BY id ASC
            "#,
            NOTIFICATION_COLUMNS
        ))
        .bind(receiver_id)
        .bind(category.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_read(&self, notification_ids: &[i64]) -> AppResult<u64> {
        if notification_ids.is_empty() {
            return Ok(0);
        }
        let changed = sqlx::query(
            "UPDATE notifications SET is_read = TRUE WHERE id = ANY($1) AND is_read = FALSE",
        )
        .bind(notification_ids)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed)
    }

    async fn list_notifications(&self, receiver_id: i64, limit: i64) -> AppResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            SELECT {} FROM notifications
            WHERE receiver_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
            NOTIFICATION_COLUMNS
        ))
        .bind(receiver_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn is_following(&self, follower_id: i64, following_id: i64) -> AppResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = $1 AND following_id = $2)",
        )
        .bind(follower_id)
        .bind(following_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn followers(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT follower_id FROM follows WHERE following_id = $1 ORDER BY follower_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn following(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT following_id FROM follows WHERE follower_id = $1 ORDER BY following_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn relation_exists(&self, key: &RequestKey) -> AppResult<bool> {
        match key.subject {
            Subject::User(target) => self.is_following(key.user_id, target).await,
            Subject::Group(group_id) => self.is_member(group_id, key.user_id).await,
        }
    }

    async fn find_request(&self, key: &RequestKey) -> AppResult<Option<Request>> {
        let (subject_user, subject_group) = subject_columns(key.subject);
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            SELECT {} FROM relationship_requests
            WHERE user_id = $1
              AND subject_user_id IS NOT DISTINCT FROM $2
              AND subject_group_id IS NOT DISTINCT FROM $3
            "#,
            REQUEST_COLUMNS
        ))
        .bind(key.user_id)
        .bind(subject_user)
        .bind(subject_group)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn incoming_follow_requests(&self, user_id: i64) -> AppResult<Vec<Request>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            r#"
            SELECT {} FROM relationship_requests
            WHERE kind = 'follow' AND status = 'pending' AND subject_user_id = $1
            ORDER BY id ASC
            "#,
            REQUEST_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn create_pending_request(
        &self,
        request: NewRequest,
        notification: NewNotification,
    ) -> AppResult<(Request, Notification)> {
        let mut tx = self.pool.begin().await?;
        let request = Self::insert_request_tx(&mut tx, &request, RequestState::Pending).await?;
        let notification =
            Self::insert_notification_tx(&mut tx, notification.linked_to(request.id)).await?;
        tx.commit().await?;
        Ok((request, notification))
    }

    async fn create_accepted_follow(
        &self,
        request: NewRequest,
        notification: NewNotification,
    ) -> AppResult<(Request, Notification)> {
        let Subject::User(target) = request.key.subject else {
            return Err(AppError::Validation("follow request must target a user".into()));
        };
        let mut tx = self.pool.begin().await?;
        let stored = Self::insert_request_tx(&mut tx, &request, RequestState::Accepted).await?;
        let notification = Self::insert_notification_tx(
            &mut tx,
            notification
                .with_status(NotificationStatus::Accepted)
                .linked_to(stored.id),
        )
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO follows (follower_id, following_id)
            VALUES ($1, $2)
            ON CONFLICT (follower_id, following_id) DO NOTHING
            "#,
        )
        .bind(request.key.user_id)
        .bind(target)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            // Dropping the transaction rolls back the request and notification.
            return Err(AppError::Conflict("already following".into()));
        }

        tx.commit().await?;
        Ok((stored, notification))
    }

    async fn accept_request(&self, request_id: i64) -> AppResult<Accepted> {
        let mut tx = self.pool.begin().await?;
        let request = Self::lock_request_tx(&mut tx, request_id).await?;
        let next_state = request.state.apply(RequestEvent::Accept)?;

        match request.key.subject {
            Subject::User(target) => {
                sqlx::query(
                    r#"
                    INSERT INTO follows (follower_id, following_id)
                    VALUES ($1, $2)
                    ON CONFLICT (follower_id, following_id) DO NOTHING
                    "#,
                )
                .bind(request.key.user_id)
                .bind(target)
                .execute(&mut *tx)
                .await?;
            }
            Subject::Group(group_id) => {
                sqlx::query(
                    r#"
                    INSERT INTO group_members (group_id, user_id)
                    VALUES ($1, $2)
                    ON CONFLICT (group_id, user_id) DO NOTHING
                    "#,
                )
                .bind(group_id)
                .bind(request.key.user_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE relationship_requests SET status = $2 WHERE id = $1")
            .bind(request_id)
            .bind(next_state.stored_str())
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            r#"
            UPDATE notifications SET status = 'accepted'
            WHERE request_id = $1
            RETURNING {}
            "#,
            NOTIFICATION_COLUMNS
        ))
        .bind(request_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let notifications = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<AppResult<Vec<Notification>>>()?;
        Ok(Accepted {
            request: Request {
                state: next_state,
                ..request
            },
            notifications,
        })
    }

    async fn decline_request(&self, request_id: i64) -> AppResult<Request> {
        let mut tx = self.pool.begin().await?;
        let request = Self::lock_request_tx(&mut tx, request_id).await?;
        let next_state = request.state.apply(RequestEvent::Decline)?;

        // Linked notifications go with the row (ON DELETE CASCADE).
        sqlx::query("DELETE FROM relationship_requests WHERE id = $1")
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Request {
            state: next_state,
            ..request
        })
    }

    async fn withdraw_request(&self, key: &RequestKey) -> AppResult<bool> {
        let (subject_user, subject_group) = subject_columns(key.subject);
        let mut tx = self.pool.begin().await?;

        let mut removed = sqlx::query(
            r#"
            DELETE FROM relationship_requests
            WHERE user_id = $1
              AND subject_user_id IS NOT DISTINCT FROM $2
              AND subject_group_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(key.user_id)
        .bind(subject_user)
        .bind(subject_group)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if let Subject::User(target) = key.subject {
            removed += sqlx::query(
                r#"
                DELETE FROM relationship_requests
                WHERE kind = 'follow' AND user_id = $2 AND subject_user_id = $1
                "#,
            )
            .bind(key.user_id)
            .bind(target)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            removed += sqlx::query(
                r#"
                DELETE FROM follows
                WHERE (follower_id = $1 AND following_id = $2)
                   OR (follower_id = $2 AND following_id = $1)
                "#,
            )
            .bind(key.user_id)
            .bind(target)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(removed > 0)
    }
}
