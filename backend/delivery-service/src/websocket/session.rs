use std::time::{Duration, Instant};

use actix::{Actor, ActorContext, ActorFutureExt, AsyncContext, StreamHandler, WrapFuture};
use actix_web_actors::ws;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::ChatMessageEnvelope;
use crate::state::AppState;
use crate::websocket::messages::{NotificationInbound, ServerEvent};
use crate::websocket::registry::{Channel, Connection, Outbound};

/// One authenticated socket on either channel.
///
/// Everything written to the client goes through the connection queue, so
/// pushes from other sessions and this session's own replies keep one order.
/// Client frames are handled one at a time in arrival order.
pub struct WsSession {
    user_id: i64,
    channel: Channel,
    connection: Connection,
    rx: Option<UnboundedReceiver<Outbound>>,
    state: AppState,
    hb: Instant,
}

impl WsSession {
    pub fn new(user_id: i64, channel: Channel, state: AppState) -> Self {
        let (connection, rx) = Connection::open(user_id);
        Self {
            user_id,
            channel,
            connection,
            rx: Some(rx),
            state,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let interval = Duration::from_secs(self.state.ws.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.state.ws.client_timeout_secs);
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.hb) > timeout {
                warn!(
                    user_id = act.user_id,
                    channel = act.channel.as_str(),
                    "websocket heartbeat timed out, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn reply(&self, event: ServerEvent) {
        match event.to_json() {
            Ok(json) => {
                if self.connection.send_text(json).is_err() {
                    debug!(user_id = self.user_id, "reply dropped, connection closed");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode server event"),
        }
    }

    /// Runs after the connection is in the registry.
    fn on_registered(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.reply(ServerEvent::connected(self.user_id, self.channel.as_str()));

        if self.channel == Channel::Notifications {
            let dispatcher = self.state.dispatcher.clone();
            let user_id = self.user_id;
            ctx.spawn(
                async move {
                    if let Err(e) = dispatcher.flush_offline(user_id).await {
                        warn!(user_id, error = %e, "offline notification flush failed");
                    }
                }
                .into_actor(self),
            );
        }
    }

    fn handle_text(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let state = self.state.clone();
        let user_id = self.user_id;
        let channel = self.channel;

        let fut = async move {
            match channel {
                Channel::Chat => handle_chat_frame(&state, user_id, &text).await,
                Channel::Notifications => handle_notification_frame(&state, user_id, &text).await,
            }
        };

        ctx.wait(fut.into_actor(self).map(|result, act, _ctx| match result {
            Ok(Some(event)) => act.reply(event),
            Ok(None) => {}
            Err(e) => {
                debug!(user_id = act.user_id, error = %e, "client frame rejected");
                act.reply(ServerEvent::from(&e));
            }
        }));
    }
}

async fn handle_chat_frame(state: &AppState, user_id: i64, text: &str) -> AppResult<Option<ServerEvent>> {
    let envelope: ChatMessageEnvelope = serde_json::from_str(text)?;
    // The sender receives the persisted message through its own connection.
    state.router.route(user_id, envelope).await?;
    Ok(None)
}

async fn handle_notification_frame(
    state: &AppState,
    user_id: i64,
    text: &str,
) -> AppResult<Option<ServerEvent>> {
    match NotificationInbound::from_json(text)? {
        NotificationInbound::Ack { id } => {
            state.dispatcher.acknowledge(user_id, id).await?;
            Ok(Some(ServerEvent::ack(Some(id))))
        }
        NotificationInbound::FollowRequest { receiver_id } => {
            let outcome = state.requests.follow(user_id, receiver_id).await?;
            Ok(Some(ServerEvent::ack(Some(outcome.request.id))))
        }
        NotificationInbound::JoinRequest { group_id } => {
            let outcome = state.requests.request_join(user_id, group_id).await?;
            Ok(Some(ServerEvent::ack(Some(outcome.request.id))))
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            user_id = self.user_id,
            channel = self.channel.as_str(),
            connection_id = %self.connection.id(),
            "websocket session started"
        );

        self.hb(ctx);

        if let Some(rx) = self.rx.take() {
            ctx.add_stream(UnboundedReceiverStream::new(rx));
        }

        let registry = self.state.registry(self.channel).clone();
        let connection = self.connection.clone();
        ctx.wait(
            async move { registry.register(connection).await }
                .into_actor(self)
                .map(|superseded, act, ctx| {
                    if let Some(previous) = superseded {
                        debug!(user_id = act.user_id, previous = %previous, "earlier connection superseded");
                    }
                    act.on_registered(ctx);
                }),
        );
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(
            user_id = self.user_id,
            channel = self.channel.as_str(),
            connection_id = %self.connection.id(),
            "websocket session stopped"
        );

        let registry = self.state.registry(self.channel).clone();
        let user_id = self.user_id;
        let connection_id = self.connection.id();
        actix_rt::spawn(async move {
            registry.unregister(user_id, connection_id).await;
        });
    }
}

// Frames queued by the registry or by this session
impl StreamHandler<Outbound> for WsSession {
    fn handle(&mut self, item: Outbound, ctx: &mut Self::Context) {
        match item {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Close => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Policy,
                    description: Some("superseded by a newer connection".into()),
                }));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                self.handle_text(text.to_string(), ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                self.reply(ServerEvent::from(&AppError::Validation(
                    "binary frames are not supported".into(),
                )));
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(user_id = self.user_id, ?reason, "client closed websocket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(user_id = self.user_id, error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}
