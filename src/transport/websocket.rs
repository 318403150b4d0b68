use super::{Connection, TransportAdapter, TransportKind};
use crate::context::RequestContext;
use crate::error::AppResult;
use crate::event::{DataType, Event, WireMessage};
use crate::push::manager::EventManager;
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web_actors::ws;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

fn message_bytes(message: &WireMessage) -> AppResult<Bytes> {
    Ok(Bytes::from(message.to_json()?))
}

/// JSON messages over a WebSocket. Control messages use reserved names and
/// `SELF` scope so clients can tell them from application events.
pub struct WebSocketAdapter;

impl WebSocketAdapter {
    fn control(name: &str, data_type: DataType, data: serde_json::Value) -> Bytes {
        let message = WireMessage::control(name, data_type, data);
        message_bytes(&message).unwrap_or_else(|_| Bytes::from_static(b"{}"))
    }
}

impl TransportAdapter for WebSocketAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn connected(&mut self, heartbeat_ms: u64) -> Bytes {
        Self::control(
            "__connected",
            DataType::Json,
            json!({ "heartbeat": heartbeat_ms }),
        )
    }

    fn event(&mut self, event: &Event) -> AppResult<Bytes> {
        message_bytes(&event.to_message())
    }

    fn text(&mut self, text: &str) -> AppResult<Bytes> {
        message_bytes(&WireMessage::control(
            "message",
            DataType::String,
            serde_json::Value::String(text.to_string()),
        ))
    }

    fn heartbeat(&mut self) -> Bytes {
        Self::control("__heartbeat", DataType::Json, serde_json::Value::Null)
    }

    fn disconnect(&mut self) -> Option<Bytes> {
        Some(Self::control(
            "__disconnect",
            DataType::Json,
            serde_json::Value::Null,
        ))
    }

    fn error(&mut self, code: u16, message: &str) -> Bytes {
        Self::control(
            "__error",
            DataType::Status,
            json!({ "code": code, "message": message }),
        )
    }
}

/// Outbound bytes from the connection channel.
struct Outbound(Bytes);

/// Actor bridging one WebSocket to its [`Connection`].
///
/// Frames written to the connection arrive through the channel stream and go
/// out as text messages; inbound text is parsed as a [`WireMessage`] and
/// fired as an event from this connection.
pub struct PushSocket {
    connection: Arc<Connection>,
    manager: Arc<EventManager>,
    context: RequestContext,
    receiver: Option<mpsc::Receiver<Bytes>>,
    hb: Instant,
}

impl PushSocket {
    pub fn new(
        connection: Arc<Connection>,
        receiver: mpsc::Receiver<Bytes>,
        manager: Arc<EventManager>,
        context: RequestContext,
    ) -> Self {
        let context = context.with_connection(connection.id());
        Self {
            connection,
            manager,
            context,
            receiver: Some(receiver),
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(PING_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                warn!(connection_id = %act.connection.id(), "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn handle_inbound(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match WireMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection_id = %self.connection.id(), error = %e, "ignoring malformed inbound message");
                return;
            }
        };

        if message.is_status() {
            let status = message.payload().ok();
            info!(
                connection_id = %self.connection.id(),
                status = ?status,
                "client sent status frame, closing"
            );
            self.connection.terminate(false);
            ctx.stop();
            return;
        }

        let ttl = self.manager.event_ttl();
        let event = match message.into_event(None, ttl) {
            Ok(event) => event.with_from(self.connection.id()),
            Err(e) => {
                warn!(connection_id = %self.connection.id(), error = %e, "ignoring inbound message with invalid payload");
                return;
            }
        };

        let manager = self.manager.clone();
        let context = self.context.clone();
        actix::spawn(async move {
            if let Err(e) = manager.fire_event(event, &context).await {
                debug!(error = %e, "inbound event not delivered");
            }
        });
    }
}

impl Actor for PushSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection.id(), "WebSocket session started");
        self.hb(ctx);
        if let Some(receiver) = self.receiver.take() {
            ctx.add_stream(ReceiverStream::new(receiver).map(Outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // no-op if the server already terminated it
        self.connection.terminate(false);
    }
}

impl StreamHandler<Outbound> for PushSocket {
    fn handle(&mut self, frame: Outbound, ctx: &mut Self::Context) {
        match String::from_utf8(frame.0.to_vec()) {
            Ok(text) => ctx.text(text),
            Err(_) => ctx.binary(frame.0),
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // channel closed: the connection was terminated
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PushSocket {
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
                self.handle_inbound(&text, ctx);
            }
            Ok(ws::Message::Binary(_)) => {
                warn!(connection_id = %self.connection.id(), "binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(connection_id = %self.connection.id(), reason = ?reason, "WebSocket close received");
                self.connection.terminate(false);
                ctx.stop();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(connection_id = %self.connection.id(), error = %e, "WebSocket protocol error");
                self.connection.terminate(false);
                ctx.stop();
            }
        }
    }
}
