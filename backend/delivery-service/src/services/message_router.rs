use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{ChatMessage, ChatMessageEnvelope, ChatTarget};
use crate::store::Store;
use crate::websocket::{ConnectionRegistry, Delivery};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;

/// Where one routed message went.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteReport {
    pub message: ChatMessage,
    pub delivered: Vec<i64>,
    pub offline: Vec<i64>,
}

/// One entry of a user's conversation list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub chat_id: i64,
    pub title: String,
    pub participants: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ChatMessage>,
}

/// Persists chat messages and fans them out to the conversation's
/// participants over the chat registry.
pub struct MessageRouter {
    store: Arc<dyn Store>,
    registry: ConnectionRegistry,
}

impl MessageRouter {
    pub fn new(store: Arc<dyn Store>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    /// Validates, persists, then pushes a message to every resolved recipient.
    ///
    /// Only a current participant may send. Offline recipients are skipped; their copy is the persisted history.
    pub async fn route(
        &self,
        sender_id: i64,
        envelope: ChatMessageEnvelope,
    ) -> AppResult<RouteReport> {
        let new_message = envelope.into_new_message(sender_id)?;
        self.ensure_participant(sender_id, new_message.target).await?;

        let message = self.store.insert_message(new_message).await?;
        metrics::record_chat_message(message.target.kind());

        let mut report = RouteReport {
            message,
            delivered: Vec::new(),
            offline: Vec::new(),
        };

        // Membership is read now, not cached, so joins and leaves apply immediately.
        let recipients = match self.recipients(report.message.target).await {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!(
                    message_id = report.message.id,
                    error = %e,
                    "recipient lookup failed after persist; message kept in history only"
                );
                return Ok(report);
            }
        };

        let payload = serde_json::to_string(&report.message)
            .map_err(|e| AppError::Internal(e.to_string()))?;

        for recipient in recipients {
            match self.registry.send_to(recipient, &payload).await {
                Delivery::Delivered => report.delivered.push(recipient),
                Delivery::Offline => report.offline.push(recipient),
            }
        }

        debug!(
            message_id = report.message.id,
            target = report.message.target.kind(),
            delivered = report.delivered.len(),
            offline = report.offline.len(),
            "chat message routed"
        );
        Ok(report)
    }

    /// Participant ids of a conversation at this instant.
    pub async fn recipients(&self, target: ChatTarget) -> AppResult<Vec<i64>> {
        match target {
            ChatTarget::Private(chat_id) => {
                let chat = self
                    .store
                    .get_private_chat(chat_id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("private chat {}", chat_id)))?;
                Ok(chat.participants().to_vec())
            }
            ChatTarget::Group(group_id) => self.store.group_member_ids(group_id).await,
        }
    }

    /// Recent messages of a conversation the caller belongs to, oldest first.
    pub async fn history(
        &self,
        user_id: i64,
        target: ChatTarget,
        limit: Option<i64>,
    ) -> AppResult<Vec<ChatMessage>> {
        self.ensure_participant(user_id, target).await?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        self.store.list_messages(target, limit).await
    }

    /// Private and group conversations the user takes part in, most recently
    /// active first. Conversations without messages come last.
    pub async fn conversations(&self, user_id: i64) -> AppResult<Vec<ChatSummary>> {
        let mut summaries = Vec::new();

        for chat in self.store.private_chats_for(user_id).await? {
            let other = if chat.user1_id == user_id {
                chat.user2_id
            } else {
                chat.user1_id
            };
            let title = self
                .store
                .get_user(other)
                .await?
                .map(|u| u.nickname)
                .unwrap_or_default();
            let target = ChatTarget::Private(chat.id);
            summaries.push(ChatSummary {
                kind: target.kind(),
                chat_id: chat.id,
                title,
                participants: chat.participants().to_vec(),
                last_message: self.latest_message(target).await?,
            });
        }

        for group in self.store.groups_for(user_id).await? {
            let target = ChatTarget::Group(group.id);
            summaries.push(ChatSummary {
                kind: target.kind(),
                chat_id: group.id,
                title: group.title,
                participants: self.store.group_member_ids(group.id).await?,
                last_message: self.latest_message(target).await?,
            });
        }

        summaries.sort_by_key(|s| std::cmp::Reverse(s.last_message.as_ref().map(|m| m.id)));
        Ok(summaries)
    }

    async fn latest_message(&self, target: ChatTarget) -> AppResult<Option<ChatMessage>> {
        Ok(self.store.list_messages(target, 1).await?.pop())
    }

    async fn ensure_participant(&self, user_id: i64, target: ChatTarget) -> AppResult<()> {
        self.ensure_conversation_exists(target).await?;
        if self.recipients(target).await?.contains(&user_id) {
            return Ok(());
        }
        Err(AppError::Forbidden(format!(
            "not a participant of {} chat {}",
            target.kind(),
            target.id()
        )))
    }

    async fn ensure_conversation_exists(&self, target: ChatTarget) -> AppResult<()> {
        let exists = match target {
            ChatTarget::Private(id) => self.store.get_private_chat(id).await?.is_some(),
            ChatTarget::Group(id) => self.store.get_group(id).await?.is_some(),
        };
        if exists {
            Ok(())
        } else {
            Err(AppError::NotFound(format!(
                "{} chat {} not found",
                target.kind(),
                target.id()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewGroup, NewUser};
    use crate::store::MemoryStore;
    use crate::websocket::{Channel, Connection, Outbound};

    async fn user(store: &MemoryStore, name: &str) -> i64 {
        store
            .create_user(NewUser {
                nickname: name.into(),
                is_public: false,
            })
            .await
            .unwrap()
            .id
    }

    fn setup() -> (Arc<MemoryStore>, ConnectionRegistry, MessageRouter) {
        let store = Arc::new(MemoryStore::new());
        let registry = ConnectionRegistry::new(Channel::Chat);
        let router = MessageRouter::new(store.clone(), registry.clone());
        (store, registry, router)
    }

    fn private(chat_id: i64, content: &str) -> ChatMessageEnvelope {
        ChatMessageEnvelope {
            content: content.into(),
            private_chat_id: chat_id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_target_never_persisted() {
        let (store, _, router) = setup();
        let a = user(&store, "a").await;

        let both = ChatMessageEnvelope {
            content: "x".into(),
            private_chat_id: 1,
            group_chat_id: 1,
            ..Default::default()
        };
        let neither = ChatMessageEnvelope {
            content: "x".into(),
            ..Default::default()
        };

        assert!(matches!(router.route(a, both).await, Err(AppError::Validation(_))));
        assert!(matches!(router.route(a, neither).await, Err(AppError::Validation(_))));
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_chat_is_not_found() {
        let (store, _, router) = setup();
        let a = user(&store, "a").await;
        let err = router.route(a, private(404, "hi")).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(store.message_count().await, 0);
    }

    #[tokio::test]
    async fn test_private_message_reaches_online_participants_only() {
        let (store, registry, router) = setup();
        let a = user(&store, "a").await;
        let b = user(&store, "b").await;
        let chat = store.get_or_create_private_chat(a, b).await.unwrap();

        let (conn, mut rx) = Connection::open(a);
        registry.register(conn).await;

        let report = router.route(a, private(chat.id, "hello")).await.unwrap();
        assert_eq!(report.delivered, vec![a]);
        assert_eq!(report.offline, vec![b]);
        assert_eq!(store.message_count().await, 1);

        match rx.recv().await {
            Some(Outbound::Text(json)) => {
                let msg: ChatMessage = serde_json::from_str(&json).unwrap();
                assert_eq!(msg.content, "hello");
                assert_eq!(msg.sender_id, a);
                assert_eq!(msg.target, ChatTarget::Private(chat.id));
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_group_recipients_resolved_at_delivery_time() {
        let (store, registry, router) = setup();
        let owner = user(&store, "owner").await;
        let late = user(&store, "late").await;
        let group = store
            .create_group(
                owner,
                NewGroup {
                    title: "g".into(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();

        let (conn, mut late_rx) = Connection::open(late);
        registry.register(conn).await;

        let envelope = |text: &str| ChatMessageEnvelope {
            content: text.into(),
            group_chat_id: group.id,
            ..Default::default()
        };

        let first = router.route(owner, envelope("before")).await.unwrap();
        assert!(!first.delivered.contains(&late));

        // Membership via accepted request
        let key = crate::models::RequestKey::membership(late, group.id);
        let (request, _) = store
            .create_pending_request(
                crate::models::NewRequest {
                    kind: crate::models::RequestKind::Join,
                    requester_id: late,
                    key,
                },
                crate::models::NewNotification::new(
                    late,
                    owner,
                    crate::models::NotificationKind::JoinRequest { group_id: group.id },
                    "join".into(),
                ),
            )
            .await
            .unwrap();
        store.accept_request(request.id).await.unwrap();

        let second = router.route(owner, envelope("after")).await.unwrap();
        assert!(second.delivered.contains(&late));
        assert!(matches!(late_rx.recv().await, Some(Outbound::Text(_))));
    }

    #[tokio::test]
    async fn test_outsider_cannot_post_into_conversation() {
        let (store, registry, router) = setup();
        let a = user(&store, "a").await;
        let b = user(&store, "b").await;
        let c = user(&store, "c").await;
        let chat = store.get_or_create_private_chat(a, b).await.unwrap();
        let group = store
            .create_group(
                a,
                NewGroup {
                    title: "g".into(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();

        let (conn, mut a_rx) = Connection::open(a);
        registry.register(conn).await;

        let err = router.route(c, private(chat.id, "spam")).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        let err = router
            .route(
                c,
                ChatMessageEnvelope {
                    content: "spam".into(),
                    group_chat_id: group.id,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        assert_eq!(store.message_count().await, 0);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_conversations_list_private_and_group_chats() {
        let (store, _, router) = setup();
        let a = user(&store, "a").await;
        let b = user(&store, "b").await;
        let c = user(&store, "c").await;
        let quiet = store.get_or_create_private_chat(a, c).await.unwrap();
        let chat = store.get_or_create_private_chat(b, a).await.unwrap();
        store.get_or_create_private_chat(b, c).await.unwrap();
        let group = store
            .create_group(
                a,
                NewGroup {
                    title: "crew".into(),
                    description: String::new(),
                },
            )
            .await
            .unwrap();

        router.route(b, private(chat.id, "first")).await.unwrap();
        router
            .route(
                a,
                ChatMessageEnvelope {
                    content: "latest".into(),
                    group_chat_id: group.id,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let list = router.conversations(a).await.unwrap();
        let order: Vec<_> = list.iter().map(|s| (s.kind, s.chat_id)).collect();
        assert_eq!(
            order,
            vec![("group", group.id), ("private", chat.id), ("private", quiet.id)]
        );
        assert_eq!(list[0].title, "crew");
        assert_eq!(list[0].participants, vec![a]);
        assert_eq!(list[1].title, "b");
        assert_eq!(list[1].last_message.as_ref().map(|m| m.content.as_str()), Some("first"));
        assert_eq!(list[2].title, "c");
        assert!(list[2].last_message.is_none());
    }

    #[tokio::test]
    async fn test_history_requires_participation() {
        let (store, _, router) = setup();
        let a = user(&store, "a").await;
        let b = user(&store, "b").await;
        let c = user(&store, "c").await;
        let chat = store.get_or_create_private_chat(a, b).await.unwrap();
        router.route(a, private(chat.id, "one")).await.unwrap();
        router.route(b, private(chat.id, "two")).await.unwrap();

        let history = router
            .history(b, ChatTarget::Private(chat.id), None)
            .await
            .unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);

        let err = router
            .history(c, ChatTarget::Private(chat.id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
