//! In-process store used in development (no `DATABASE_URL`) and in tests.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Utc;
use tokio::sync::Mutex;

use super::{Accepted, Store};
use crate::error::{AppError, AppResult};
use crate::models::{
    ordered_pair, ChatMessage, ChatTarget, Group, NewChatMessage, NewGroup, NewNotification,
    NewRequest, NewUser, Notification, NotificationCategory, NotificationStatus, PrivateChat,
    Request, RequestKey, RequestKind, Subject, User,
};
use crate::services::request_state::{RequestEvent, RequestState};

/// Write steps that tests can make fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    MembershipInsert,
    FollowInsert,
    NotificationInsert,
    MarkRead,
}

#[derive(Default)]
struct Sequences {
    user: i64,
    group: i64,
    chat: i64,
    message: i64,
    notification: i64,
    request: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

#[derive(Default)]
struct Tables {
    seq: Sequences,
    users: BTreeMap<i64, User>,
    groups: BTreeMap<i64, Group>,
    /// (group_id, user_id)
    memberships: BTreeSet<(i64, i64)>,
    private_chats: BTreeMap<i64, PrivateChat>,
    messages: Vec<ChatMessage>,
    notifications: BTreeMap<i64, Notification>,
    /// (follower_id, following_id)
    follows: BTreeSet<(i64, i64)>,
    requests: BTreeMap<i64, Request>,
    armed: HashSet<FailPoint>,
}

impl Tables {
    fn trip(&mut self, point: FailPoint) -> AppResult<()> {
        if self.armed.remove(&point) {
            return Err(AppError::Database(format!("injected failure at {:?}", point)));
        }
        Ok(())
    }

    fn request_by_key(&self, key: &RequestKey) -> Option<&Request> {
        self.requests.values().find(|r| r.key == *key)
    }

    fn relation_exists(&self, key: &RequestKey) -> bool {
        match key.subject {
            Subject::User(target) => self.follows.contains(&(key.user_id, target)),
            Subject::Group(group_id) => self.memberships.contains(&(group_id, key.user_id)),
        }
    }

    fn build_notification(&mut self, new: NewNotification) -> Notification {
        Notification {
            id: next(&mut self.seq.notification),
            requester_id: new.requester_id,
            receiver_id: new.receiver_id,
            kind: new.kind,
            content: new.content,
            status: new.status,
            read: false,
            request_id: new.request_id,
            created_at: Utc::now(),
        }
    }

    fn build_request(&mut self, new: NewRequest, state: RequestState) -> Request {
        Request {
            id: next(&mut self.seq.request),
            kind: new.kind,
            requester_id: new.requester_id,
            key: new.key,
            state,
            created_at: Utc::now(),
        }
    }

    fn drop_request(&mut self, request_id: i64) {
        self.requests.remove(&request_id);
        self.notifications
            .retain(|_, n| n.request_id != Some(request_id));
    }
}

/// `Store` backed by in-memory tables behind one async mutex.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next write at `point` fail with a transient store error.
    pub async fn fail_next(&self, point: FailPoint) {
        self.tables.lock().await.armed.insert(point);
    }

    pub async fn request_count(&self) -> usize {
        self.tables.lock().await.requests.len()
    }

    pub async fn message_count(&self) -> usize {
        self.tables.lock().await.messages.len()
    }

    pub async fn follow_edge_count(&self) -> usize {
        self.tables.lock().await.follows.len()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, user: NewUser) -> AppResult<User> {
        let mut t = self.tables.lock().await;
        let user = User {
            id: next(&mut t.seq.user),
            nickname: user.nickname,
            is_public: user.is_public,
        };
        t.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: i64) -> AppResult<Option<User>> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn create_group(&self, creator_id: i64, group: NewGroup) -> AppResult<Group> {
        let mut t = self.tables.lock().await;
        t.trip(FailPoint::MembershipInsert)?;
        let group = Group {
            id: next(&mut t.seq.group),
            creator_id,
            title: group.title,
            description: group.description,
            created_at: Utc::now(),
        };
        t.groups.insert(group.id, group.clone());
        t.memberships.insert((group.id, creator_id));
        Ok(group)
    }

    async fn get_group(&self, group_id: i64) -> AppResult<Option<Group>> {
        Ok(self.tables.lock().await.groups.get(&group_id).cloned())
    }

    async fn group_member_ids(&self, group_id: i64) -> AppResult<Vec<i64>> {
        let t = self.tables.lock().await;
        Ok(t.memberships
            .range((group_id, i64::MIN)..=(group_id, i64::MAX))
            .map(|(_, user_id)| *user_id)
            .collect())
    }

    async fn is_member(&self, group_id: i64, user_id: i64) -> AppResult<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .memberships
            .contains(&(group_id, user_id)))
    }

    async fn groups_for(&self, user_id: i64) -> AppResult<Vec<Group>> {
        let t = self.tables.lock().await;
        Ok(t.memberships
            .iter()
            .filter(|(_, member)| *member == user_id)
            .filter_map(|(group_id, _)| t.groups.get(group_id).cloned())
            .collect())
    }

    async fn leave_group(&self, group_id: i64, user_id: i64) -> AppResult<bool> {
        let mut t = self.tables.lock().await;
        let removed = t.memberships.remove(&(group_id, user_id));
        let key = RequestKey::membership(user_id, group_id);
        if let Some(id) = t.request_by_key(&key).map(|r| r.id) {
            t.drop_request(id);
        }
        Ok(removed)
    }

    async fn get_or_create_private_chat(&self, user_a: i64, user_b: i64) -> AppResult<PrivateChat> {
        let mut t = self.tables.lock().await;
        let (low, high) = ordered_pair(user_a, user_b);
        if let Some(chat) = t
            .private_chats
            .values()
            .find(|c| ordered_pair(c.user1_id, c.user2_id) == (low, high))
        {
            return Ok(chat.clone());
        }
        let chat = PrivateChat {
            id: next(&mut t.seq.chat),
            user1_id: user_a,
            user2_id: user_b,
        };
        t.private_chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn get_private_chat(&self, chat_id: i64) -> AppResult<Option<PrivateChat>> {
        Ok(self.tables.lock().await.private_chats.get(&chat_id).cloned())
    }

    async fn private_chats_for(&self, user_id: i64) -> AppResult<Vec<PrivateChat>> {
        let t = self.tables.lock().await;
        Ok(t.private_chats
            .values()
            .filter(|chat| chat.includes(user_id))
            .cloned()
            .collect())
    }

    async fn insert_message(&self, message: NewChatMessage) -> AppResult<ChatMessage> {
        let mut t = self.tables.lock().await;
        let message = ChatMessage {
            id: next(&mut t.seq.message),
            sender_id: message.sender_id,
            content: message.content,
            created_at: Utc::now(),
            target: message.target,
        };
        t.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, target: ChatTarget, limit: i64) -> AppResult<Vec<ChatMessage>> {
        let t = self.tables.lock().await;
        let matching: Vec<&ChatMessage> = t.messages.iter().filter(|m| m.target == target).collect();
        let skip = matching.len().saturating_sub(limit.max(0) as usize);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    async fn insert_notification(&self, notification: NewNotification) -> AppResult<Notification> {
        let mut t = self.tables.lock().await;
        t.trip(FailPoint::NotificationInsert)?;
        let notification = t.build_notification(notification);
        t.notifications.insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn get_notification(&self, notification_id: i64) -> AppResult<Option<Notification>> {
        Ok(self
            .tables
            .lock()
            .await
            .notifications
            .get(&notification_id)
            .cloned())
    }

    async fn unread_notifications(
        &self,
        receiver_id: i64,
        category: NotificationCategory,
    ) -> AppResult<Vec<Notification>> {
        let t = self.tables.lock().await;
        Ok(t.notifications
            .values()
            .filter(|n| n.receiver_id == receiver_id && !n.read && n.category() == category)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, notification_ids: &[i64]) -> AppResult<u64> {
        let mut t = self.tables.lock().await;
        t.trip(FailPoint::MarkRead)?;
        let mut changed = 0;
        for id in notification_ids {
            if let Some(n) = t.notifications.get_mut(id) {
                if !n.read {
                    n.read = true;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn list_notifications(&self, receiver_id: i64, limit: i64) -> AppResult<Vec<Notification>> {
        let t = self.tables.lock().await;
        Ok(t.notifications
            .values()
            .rev()
            .filter(|n| n.receiver_id == receiver_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn is_following(&self, follower_id: i64, following_id: i64) -> AppResult<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .follows
            .contains(&(follower_id, following_id)))
    }

    async fn followers(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let t = self.tables.lock().await;
        Ok(t.follows
            .iter()
            .filter(|(_, following)| *following == user_id)
            .map(|(follower, _)| *follower)
            .collect())
    }

    async fn following(&self, user_id: i64) -> AppResult<Vec<i64>> {
        let t = self.tables.lock().await;
        Ok(t.follows
            .range((user_id, i64::MIN)..=(user_id, i64::MAX))
            .map(|(_, following)| *following)
            .collect())
    }

    async fn relation_exists(&self, key: &RequestKey) -> AppResult<bool> {
        Ok(self.tables.lock().await.relation_exists(key))
    }

    async fn find_request(&self, key: &RequestKey) -> AppResult<Option<Request>> {
        Ok(self.tables.lock().await.request_by_key(key).cloned())
    }

    async fn incoming_follow_requests(&self, user_id: i64) -> AppResult<Vec<Request>> {
        let t = self.tables.lock().await;
        Ok(t.requests
            .values()
            .filter(|r| {
                r.kind == RequestKind::Follow
                    && r.state == RequestState::Pending
                    && r.key.subject == Subject::User(user_id)
            })
            .cloned()
            .collect())
    }

    async fn create_pending_request(
        &self,
        request: NewRequest,
        notification: NewNotification,
    ) -> AppResult<(Request, Notification)> {
        let mut t = self.tables.lock().await;
        if t.request_by_key(&request.key).is_some() {
            return Err(AppError::Conflict("a request already exists for this key".into()));
        }
        t.trip(FailPoint::NotificationInsert)?;
        let request = t.build_request(request, RequestState::Pending);
        let notification = t.build_notification(notification.linked_to(request.id));
        t.requests.insert(request.id, request.clone());
        t.notifications.insert(notification.id, notification.clone());
        Ok((request, notification))
    }

    async fn create_accepted_follow(
        &self,
        request: NewRequest,
        notification: NewNotification,
    ) -> AppResult<(Request, Notification)> {
        let mut t = self.tables.lock().await;
        let Subject::User(target) = request.key.subject else {
            return Err(AppError::Validation("follow request must target a user".into()));
        };
        if t.request_by_key(&request.key).is_some() || t.relation_exists(&request.key) {
            return Err(AppError::Conflict("already following or requested".into()));
        }
        t.trip(FailPoint::NotificationInsert)?;
        t.trip(FailPoint::FollowInsert)?;
        let follower = request.key.user_id;
        let request = t.build_request(request, RequestState::Accepted);
        let notification = t.build_notification(
            notification
                .with_status(NotificationStatus::Accepted)
                .linked_to(request.id),
        );
        t.requests.insert(request.id, request.clone());
        t.notifications.insert(notification.id, notification.clone());
        t.follows.insert((follower, target));
        Ok((request, notification))
    }

    async fn accept_request(&self, request_id: i64) -> AppResult<Accepted> {
        let mut t = self.tables.lock().await;
        let request = t
            .requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("request {} not found", request_id)))?;
        let next_state = request.state.apply(RequestEvent::Accept)?;

        // Relation first: a failure here must leave the request untouched.
        match request.key.subject {
            Subject::User(_) => t.trip(FailPoint::FollowInsert)?,
            Subject::Group(_) => t.trip(FailPoint::MembershipInsert)?,
        }
        match request.key.subject {
            Subject::User(target) => {
                t.follows.insert((request.key.user_id, target));
            }
            Subject::Group(group_id) => {
                t.memberships.insert((group_id, request.key.user_id));
            }
        }

        let mut updated = request;
        updated.state = next_state;
        t.requests.insert(updated.id, updated.clone());

        let mut notifications = Vec::new();
        for n in t.notifications.values_mut() {
            if n.request_id == Some(request_id) {
                n.status = NotificationStatus::Accepted;
                notifications.push(n.clone());
            }
        }
        Ok(Accepted {
            request: updated,
            notifications,
        })
    }

    async fn decline_request(&self, request_id: i64) -> AppResult<Request> {
        let mut t = self.tables.lock().await;
        let request = t
            .requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("request {} not found", request_id)))?;
        let next_state = request.state.apply(RequestEvent::Decline)?;
        t.drop_request(request_id);
        Ok(Request {
            state: next_state,
            ..request
        })
    }

    async fn withdraw_request(&self, key: &RequestKey) -> AppResult<bool> {
        let mut t = self.tables.lock().await;
        let mut removed = false;
        if let Some(id) = t.request_by_key(key).map(|r| r.id) {
            t.drop_request(id);
            removed = true;
        }
        if let Subject::User(target) = key.subject {
            let reverse = RequestKey::follow(target, key.user_id);
            if let Some(id) = t.request_by_key(&reverse).map(|r| r.id) {
                t.drop_request(id);
                removed = true;
            }
            removed |= t.follows.remove(&(key.user_id, target));
            removed |= t.follows.remove(&(target, key.user_id));
        }
        Ok(removed)
    }
}
