use super::heartbeat::{spawn_heartbeat, spawn_session_keepalive, HeartbeatPolicy};
use super::manager::EventManager;
use super::queue::QueueDescriptor;
use super::session::SessionRegistry;
use crate::config::PushConfig;
use crate::context::RequestContext;
use crate::error::AppResult;
use crate::transport::{build_adapter, Connection, PushParams, TransportKind};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Builds connections for the push endpoint and wires each one into the
/// queue registry, its session and the heartbeat timers.
pub struct ConnectionHub {
    manager: Arc<EventManager>,
    sessions: Arc<SessionRegistry>,
    config: PushConfig,
    policy: HeartbeatPolicy,
}

impl ConnectionHub {
    pub fn new(manager: Arc<EventManager>, sessions: Arc<SessionRegistry>, config: PushConfig) -> Self {
        let policy = HeartbeatPolicy::from_config(&config);
        Self {
            manager,
            sessions,
            config,
            policy,
        }
    }

    pub fn manager(&self) -> &Arc<EventManager> {
        &self.manager
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Opens a connected connection and returns it with the receiving end
    /// of its byte channel. Must run inside a tokio runtime.
    pub fn open(
        &self,
        kind: TransportKind,
        params: &PushParams,
        ctx: &RequestContext,
    ) -> AppResult<(Arc<Connection>, mpsc::Receiver<Bytes>)> {
        let heartbeat = self.policy.negotiate(params.heartbeat);
        let adapter = build_adapter(kind, params, &self.config)?;
        let (tx, rx) = mpsc::channel(self.config.connection_buffer);
        let connection_id = ctx
            .connection_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection = Connection::new(
            connection_id.clone(),
            adapter,
            tx,
            heartbeat,
            self.config.max_frame_bytes,
        );

        let session = ctx.session_id.as_deref().map(|session_id| {
            connection.add_listener(self.sessions.listener(session_id));
            self.sessions
                .get_or_create_session(session_id, ctx.user_key.clone(), ctx.channel.clone())
        });

        connection.connect()?;

        let descriptor = QueueDescriptor {
            connection_id: connection_id.clone(),
            channel: ctx
                .channel
                .clone()
                .or_else(|| session.as_ref().and_then(|s| s.channel().map(String::from))),
            user_key: ctx
                .user_key
                .clone()
                .or_else(|| session.as_ref().and_then(|s| s.user_key().map(String::from))),
            session_id: ctx.session_id.clone(),
            node_id: self.manager.node_id().to_string(),
            transport: kind,
            connected_at: connection.opened_at(),
        };
        self.manager.open_queue(descriptor, connection.clone());

        if let Some(session) = session {
            session.attach(connection.clone());
            spawn_session_keepalive(
                connection.clone(),
                Arc::downgrade(&self.sessions),
                session.id().to_string(),
                self.config.session_keepalive(),
            );
        }
        spawn_heartbeat(connection.clone());

        info!(
            connection_id = %connection_id,
            transport = %kind,
            heartbeat_ms = heartbeat.as_millis() as u64,
            session_id = ?ctx.session_id,
            "push connection opened"
        );
        Ok((connection, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventTarget, Frame};
    use crate::push::directory::{MemoryDirectoryStore, QueueDirectory};
    use crate::transport::connection::tests::drain;
    use crate::transport::ConnectionState;
    use std::time::Duration;

    fn hub() -> ConnectionHub {
        let directory = Arc::new(QueueDirectory::new("n1", Arc::new(MemoryDirectoryStore::new())));
        let manager = Arc::new(EventManager::local("n1", directory, Duration::from_secs(60)));
        let sessions = Arc::new(SessionRegistry::new(100));
        let config = PushConfig {
            padding_bytes: 0,
            ..PushConfig::default()
        };
        ConnectionHub::new(manager, sessions, config)
    }

    #[tokio::test]
    async fn test_open_registers_queue_with_context_address() {
        let hub = hub();
        let ctx = RequestContext::default()
            .with_session("s1")
            .with_user("alice")
            .with_channel("abc")
            .with_connection("c1");
        let (conn, mut rx) = hub
            .open(TransportKind::Streaming, &PushParams::default(), &ctx)
            .unwrap();

        assert_eq!(conn.id(), "c1");
        assert_eq!(conn.state(), ConnectionState::Connected);
        let queue = hub.manager().find_queue("c1").unwrap();
        assert_eq!(queue.descriptor().channel.as_deref(), Some("abc"));
        assert_eq!(queue.descriptor().user_key.as_deref(), Some("alice"));
        assert_eq!(
            hub.sessions().get("s1").unwrap().attached_id().as_deref(),
            Some("c1")
        );
        assert_eq!(drain(&mut rx), vec![Frame::Connected { heartbeat_ms: 15000 }]);
    }

    #[tokio::test]
    async fn test_requested_heartbeat_is_clamped() {
        let hub = hub();
        let params = PushParams {
            heartbeat: Some(100),
            ..Default::default()
        };
        let (conn, _rx) = hub
            .open(TransportKind::Streaming, &params, &RequestContext::default())
            .unwrap();
        assert_eq!(conn.heartbeat_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_events_reach_opened_connection_until_closed() {
        let hub = hub();
        let ctx = RequestContext::default().with_user("alice");
        let (conn, mut rx) = hub
            .open(TransportKind::Streaming, &PushParams::default(), &ctx)
            .unwrap();

        let event = Event::text("note", EventTarget::user("alice"), "hi");
        assert_eq!(hub.manager().process_event(&event), 1);
        assert!(drain(&mut rx).iter().any(|f| matches!(f, Frame::Object { .. })));

        conn.terminate(false);
        assert_eq!(hub.manager().queue_count(), 0);
        assert_eq!(hub.manager().process_event(&event), 0);
    }

    #[tokio::test]
    async fn test_session_reconnect_through_hub() {
        let hub = hub();
        let ctx = RequestContext::default().with_session("s1");
        let (first, _rx1) = hub
            .open(TransportKind::Streaming, &PushParams::default(), &ctx)
            .unwrap();
        let (second, _rx2) = hub
            .open(TransportKind::Sse, &PushParams::default(), &ctx)
            .unwrap();

        assert_eq!(first.state(), ConnectionState::Terminated);
        assert!(second.is_open());
        assert_eq!(hub.manager().queue_count(), 1);
        assert_eq!(
            hub.sessions().get("s1").unwrap().attached_id().as_deref(),
            Some(second.id())
        );
    }
}
