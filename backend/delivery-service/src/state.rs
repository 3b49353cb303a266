use std::sync::Arc;

use crate::auth::JwtValidator;
use crate::config::WebSocketConfig;
use crate::services::{MessageRouter, NotificationDispatcher, RequestService};
use crate::store::Store;
use crate::websocket::{Channel, ConnectionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub chat_registry: ConnectionRegistry,
    pub notification_registry: ConnectionRegistry,
    pub router: Arc<MessageRouter>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub requests: Arc<RequestService>,
    pub auth: Arc<JwtValidator>,
    pub ws: WebSocketConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, jwt_secret: &str, ws: WebSocketConfig) -> Self {
        let chat_registry = ConnectionRegistry::new(Channel::Chat);
        let notification_registry = ConnectionRegistry::new(Channel::Notifications);

        let router = Arc::new(MessageRouter::new(store.clone(), chat_registry.clone()));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            notification_registry.clone(),
        ));
        let requests = Arc::new(RequestService::new(store.clone(), dispatcher.clone()));

        Self {
            store,
            chat_registry,
            notification_registry,
            router,
            dispatcher,
            requests,
            auth: Arc::new(JwtValidator::new(jwt_secret)),
            ws,
        }
    }

    pub fn registry(&self, channel: Channel) -> &ConnectionRegistry {
        match channel {
            Channel::Chat => &self.chat_registry,
            Channel::Notifications => &self.notification_registry,
        }
    }
}
