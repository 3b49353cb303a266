use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{NewNotification, Notification, NotificationCategory, NotificationKind};
use crate::store::Store;
use crate::websocket::{ConnectionRegistry, Delivery};

pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Persists notifications and pushes them to receivers that are online.
///
/// A pushed notification is marked read; anything still unread in the group
/// category is replayed by [`flush_offline`](Self::flush_offline) when the
/// receiver next connects. Marking happens after the push, so a failure in
/// between replays the notification again (at-least-once).
pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    registry: ConnectionRegistry,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn Store>, registry: ConnectionRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Persists then delivers. A persistence failure aborts before any push.
    pub async fn dispatch(&self, notification: NewNotification) -> AppResult<Notification> {
        let stored = self.store.insert_notification(notification).await?;
        metrics::record_notification(stored.kind.as_str());
        self.deliver(&stored).await;
        Ok(stored)
    }

    /// Pushes an already persisted notification if its receiver is online.
    pub async fn deliver(&self, notification: &Notification) -> Delivery {
        let payload = match notification.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(notification_id = notification.id, error = %e, "failed to encode notification");
                return Delivery::Offline;
            }
        };

        let delivery = self
            .registry
            .send_to(notification.receiver_id, &payload)
            .await;

        match delivery {
            Delivery::Delivered => {
                if let Err(e) = self.store.mark_read(&[notification.id]).await {
                    warn!(
                        notification_id = notification.id,
                        error = %e,
                        "pushed notification left unread; it may be replayed"
                    );
                }
            }
            Delivery::Offline => {
                debug!(
                    notification_id = notification.id,
                    receiver_id = notification.receiver_id,
                    kind = notification.kind.as_str(),
                    "receiver offline, notification kept for later"
                );
            }
        }
        delivery
    }

    /// Replays unread group-category notifications to a freshly registered user.
    ///
    /// Pushes in stored order and then marks everything pushed read in one
    /// update. Stops early if the connection goes away; the rest stay unread.
    pub async fn flush_offline(&self, user_id: i64) -> AppResult<usize> {
        let pending = self
            .store
            .unread_notifications(user_id, NotificationCategory::Group)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut pushed = Vec::with_capacity(pending.len());
        for notification in &pending {
            let payload = notification.to_json()?;
            match self.registry.send_to(user_id, &payload).await {
                Delivery::Delivered => pushed.push(notification.id),
                Delivery::Offline => break,
            }
        }

        if let Err(e) = self.store.mark_read(&pushed).await {
            metrics::record_offline_flush("unmarked", pushed.len());
            warn!(
                user_id,
                pushed = pushed.len(),
                error = %e,
                "offline flush pushed but could not mark read; will replay on next connect"
            );
            return Err(e);
        }

        metrics::record_offline_flush("delivered", pushed.len());
        info!(user_id, delivered = pushed.len(), total = pending.len(), "offline notifications flushed");
        Ok(pushed.len())
    }

    /// Client acknowledgement of a notification it received.
    pub async fn acknowledge(&self, user_id: i64, notification_id: i64) -> AppResult<()> {
        let notification = self
            .store
            .get_notification(notification_id)
            .await?
            .filter(|n| n.receiver_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("notification {}", notification_id)))?;
        self.store.mark_read(&[notification.id]).await?;
        Ok(())
    }

    /// Notifies every current member of a group that an event was created.
    ///
    /// Individual dispatch failures are logged and skipped.
    pub async fn announce_group_event(
        &self,
        creator_id: i64,
        group_id: i64,
        title: &str,
    ) -> AppResult<Vec<Notification>> {
        if title.trim().is_empty() {
            return Err(AppError::Validation("event title must not be empty".into()));
        }
        let group = self
            .store
            .get_group(group_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("group {}", group_id)))?;
        if !self.store.is_member(group_id, creator_id).await? {
            return Err(AppError::Forbidden("only members can create group events".into()));
        }

        let content = format!("Event '{}' was created in the group '{}'", title.trim(), group.title);
        let mut sent = Vec::new();
        for member in self.store.group_member_ids(group_id).await? {
            let notification = NewNotification::new(
                creator_id,
                member,
                NotificationKind::Event { group_id },
                content.clone(),
            );
            match self.dispatch(notification).await {
                Ok(n) => sent.push(n),
                Err(e) => warn!(group_id, member, error = %e, "event notification failed"),
            }
        }
        Ok(sent)
    }

    /// A user's notifications of both categories, newest first.
    pub async fn list(&self, user_id: i64, limit: Option<i64>) -> AppResult<Vec<Notification>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);
        self.store.list_notifications(user_id, limit).await
    }
}
