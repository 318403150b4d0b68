use crate::error::AppResult;
use crate::event::{Event, EventTarget, Scope};
use crate::transport::TransportKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Reserved connection id of the in-process monitoring queue.
pub const SERVER_SINK_ID: &str = "__server_sink__";

/// Where a queue's events end up: a live connection or the server sink.
pub trait EventSink: Send + Sync {
    fn put_event(&self, event: &Event) -> AppResult<()>;

    fn close(&self);
}

/// Address of a queue. Carries no transport handle, so it can be published
/// to the shared directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub connection_id: String,
    pub channel: Option<String>,
    pub user_key: Option<String>,
    pub session_id: Option<String>,
    pub node_id: String,
    pub transport: TransportKind,
    pub connected_at: DateTime<Utc>,
}

impl QueueDescriptor {
    pub fn server_sink(node_id: impl Into<String>) -> Self {
        Self {
            connection_id: SERVER_SINK_ID.to_string(),
            channel: None,
            user_key: None,
            session_id: None,
            node_id: node_id.into(),
            transport: TransportKind::ServerSink,
            connected_at: Utc::now(),
        }
    }

    pub fn is_server_sink(&self) -> bool {
        self.connection_id == SERVER_SINK_ID
    }

    /// Delivery predicate. An event is never echoed back to the connection
    /// it came from.
    pub fn matches(&self, event: &Event) -> bool {
        if event.from.as_deref() == Some(self.connection_id.as_str()) {
            return false;
        }
        self.is_server_sink() || self.accepts(&event.target)
    }

    /// Whether this client queue is addressed by `target`.
    pub fn accepts(&self, target: &EventTarget) -> bool {
        match target.scope() {
            Scope::World => true,
            Scope::Channel => {
                target.channel_id().is_some() && target.channel_id() == self.channel.as_deref()
            }
            Scope::User => {
                target.user_key().is_some() && target.user_key() == self.user_key.as_deref()
            }
            Scope::SelfOnly => target.connection_id() == Some(self.connection_id.as_str()),
        }
    }
}

/// One registered queue.
pub struct EventQueue {
    id: Uuid,
    descriptor: QueueDescriptor,
    sink: Arc<dyn EventSink>,
}

impl EventQueue {
    pub fn new(descriptor: QueueDescriptor, sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            sink,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    pub fn connection_id(&self) -> &str {
        &self.descriptor.connection_id
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.descriptor.matches(event)
    }

    pub fn put_event(&self, event: &Event) -> AppResult<()> {
        self.sink.put_event(event)
    }

    pub fn close(&self) {
        self.sink.close();
    }
}

impl std::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueue")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Server-side queue that sees every event dispatched on this node. Lagging
/// subscribers lose events; the sink itself never fails.
pub struct ServerSink {
    tx: broadcast::Sender<Event>,
}

impl ServerSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for ServerSink {
    fn put_event(&self, event: &Event) -> AppResult<()> {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
        Ok(())
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTarget;

    fn descriptor(id: &str, channel: Option<&str>, user: Option<&str>) -> QueueDescriptor {
        QueueDescriptor {
            connection_id: id.to_string(),
            channel: channel.map(String::from),
            user_key: user.map(String::from),
            session_id: None,
            node_id: "n1".to_string(),
            transport: TransportKind::Streaming,
            connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_world_matches_everyone_but_origin() {
        let q1 = descriptor("q1", None, None);
        let q2 = descriptor("q2", Some("c"), Some("u"));
        let event = Event::text("ping", EventTarget::world(), "").with_from("q1");

        assert!(!q1.matches(&event));
        assert!(q2.matches(&event));
    }

    #[test]
    fn test_channel_match() {
        let inside = descriptor("a", Some("abc"), None);
        let outside = descriptor("b", Some("xyz"), None);
        let none = descriptor("c", None, None);
        let event = Event::text("e", EventTarget::channel("abc"), "");

        assert!(inside.matches(&event));
        assert!(!outside.matches(&event));
        assert!(!none.matches(&event));

        let unresolved = Event::text("e", EventTarget::unresolved(Scope::Channel), "");
        assert!(!none.matches(&unresolved));
    }

    #[test]
    fn test_user_and_self_match() {
        let q = descriptor("conn-1", Some("c"), Some("alice"));
        assert!(q.matches(&Event::text("e", EventTarget::user("alice"), "")));
        assert!(!q.matches(&Event::text("e", EventTarget::user("bob"), "")));
        assert!(q.matches(&Event::text("e", EventTarget::connection("conn-1"), "")));
        assert!(!q.matches(&Event::text("e", EventTarget::connection("conn-2"), "")));
    }

    #[test]
    fn test_self_event_from_same_connection_is_not_echoed() {
        let q = descriptor("conn-1", None, None);
        let event = Event::text("e", EventTarget::connection("conn-1"), "").with_from("conn-1");
        assert!(!q.matches(&event));
    }

    #[test]
    fn test_server_sink_matches_all() {
        let sink = QueueDescriptor::server_sink("n1");
        assert!(sink.matches(&Event::text("e", EventTarget::channel("any"), "")));
        assert!(sink.matches(&Event::text("e", EventTarget::connection("x"), "")));
        let own = Event::text("e", EventTarget::world(), "").with_from(SERVER_SINK_ID);
        assert!(!sink.matches(&own));
    }

    #[tokio::test]
    async fn test_server_sink_broadcasts() {
        let sink = ServerSink::new(8);
        let mut rx = sink.subscribe();
        let event = Event::text("e", EventTarget::world(), "x");

        sink.put_event(&event).unwrap();
        assert_eq!(rx.recv().await.unwrap().id, event.id);
    }

    #[test]
    fn test_descriptor_serializes_without_handles() {
        let value = serde_json::to_value(descriptor("a", Some("c"), None)).unwrap();
        assert_eq!(value["connection_id"], "a");
        assert_eq!(value["transport"], "streaming");
        let back: QueueDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back.connection_id, "a");
    }
}
