use super::{TransportAdapter, TransportKind};
use crate::error::{AppError, AppResult};
use crate::event::Event;
use crate::push::queue::EventSink;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Suspended,
    Terminated,
}

/// Lifecycle callbacks. Invoked outside the connection lock, so listeners
/// may call back into the connection.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, _connection: &Connection, _heartbeat_ms: u64) {}

    fn on_heartbeat(&self, _connection: &Connection) {}

    fn on_disconnected(&self, _connection: &Connection, _server_initiated: bool) {}

    fn on_error(&self, _connection: &Connection, _cause: &AppError, _was_connected: bool) {}
}

struct Inner {
    state: ConnectionState,
    adapter: Box<dyn TransportAdapter>,
    sink: Option<mpsc::Sender<Bytes>>,
    last_write: Instant,
}

enum WriteOutcome {
    Written { complete: bool },
    Unencodable(AppError),
    Failed(AppError),
}

/// One client connection: the transport adapter, the outbound byte channel
/// and the lifecycle state machine.
///
/// Every write, suspend and terminate goes through `inner`, so frames from
/// concurrent writers never interleave. `Terminated` is entered exactly once.
pub struct Connection {
    id: String,
    kind: TransportKind,
    heartbeat: Duration,
    max_frame_bytes: usize,
    opened_at: DateTime<Utc>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    closed: watch::Sender<bool>,
}

impl Connection {
    pub fn new(
        id: impl Into<String>,
        adapter: Box<dyn TransportAdapter>,
        sink: mpsc::Sender<Bytes>,
        heartbeat: Duration,
        max_frame_bytes: usize,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            kind: adapter.kind(),
            heartbeat,
            max_frame_bytes,
            opened_at: Utc::now(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Connecting,
                adapter,
                sink: Some(sink),
                last_write: Instant::now(),
            }),
            listeners: Mutex::new(Vec::new()),
            closed,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn content_type(&self) -> &'static str {
        self.inner.lock().adapter.content_type()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Suspended
        )
    }

    /// Time of the last successful write of any frame.
    pub fn last_write(&self) -> Instant {
        self.inner.lock().last_write
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.lock().push(listener);
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.lock().clone()
    }

    /// Resolves once the connection has been terminated.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn write_locked(id: &str, inner: &mut Inner, bytes: Bytes) -> AppResult<()> {
        let Some(sink) = inner.sink.as_ref() else {
            return Err(AppError::ConnectionClosed(id.to_string()));
        };
        sink.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => AppError::ConnectionClosed(format!("{id} (client stalled)")),
            TrySendError::Closed(_) => AppError::ConnectionClosed(id.to_string()),
        })?;
        inner.last_write = Instant::now();
        Ok(())
    }

    /// Writes the preamble and the connected frame: `CONNECTING -> CONNECTED`.
    pub fn connect(&self) -> AppResult<()> {
        let heartbeat_ms = self.heartbeat.as_millis() as u64;
        let result = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connecting {
                return Err(AppError::Internal(format!(
                    "connection {} already {:?}",
                    self.id, inner.state
                )));
            }
            let preamble = inner.adapter.preamble();
            let connected = inner.adapter.connected(heartbeat_ms);
            let written = match preamble {
                Some(bytes) => Self::write_locked(&self.id, &mut inner, bytes),
                None => Ok(()),
            }
            .and_then(|_| Self::write_locked(&self.id, &mut inner, connected));
            if written.is_ok() {
                inner.state = ConnectionState::Connected;
            }
            written
        };

        match result {
            Ok(()) => {
                debug!(connection_id = %self.id, transport = %self.kind, heartbeat_ms, "connection established");
                for listener in self.listeners() {
                    listener.on_connected(self, heartbeat_ms);
                }
                Ok(())
            }
            Err(e) => {
                self.fail(&e, false);
                Err(e)
            }
        }
    }

    /// `CONNECTED -> SUSPENDED`: setup is done and the connection now waits
    /// for frames.
    pub fn suspend(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Connected {
            inner.state = ConnectionState::Suspended;
            true
        } else {
            false
        }
    }

    pub fn write_event(&self, event: &Event) -> AppResult<()> {
        self.write_frame(|adapter| adapter.event(event), false)
    }

    pub fn write_text(&self, text: &str) -> AppResult<()> {
        self.write_frame(|adapter| adapter.text(text), false)
    }

    pub fn write_heartbeat(&self) -> AppResult<()> {
        self.write_frame(|adapter| Ok(adapter.heartbeat()), true)
    }

    fn write_frame(
        &self,
        encode: impl FnOnce(&mut Box<dyn TransportAdapter>) -> AppResult<Bytes>,
        heartbeat: bool,
    ) -> AppResult<()> {
        let outcome = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::Connected | ConnectionState::Suspended => {}
                _ => return Err(AppError::ConnectionClosed(self.id.clone())),
            }
            let encoded = encode(&mut inner.adapter).and_then(|bytes| {
                if bytes.len() > self.max_frame_bytes {
                    Err(AppError::FrameTooLarge {
                        size: bytes.len(),
                        max: self.max_frame_bytes,
                    })
                } else {
                    Ok(bytes)
                }
            });
            match encoded {
                Err(e) => WriteOutcome::Unencodable(e),
                Ok(bytes) => match Self::write_locked(&self.id, &mut inner, bytes) {
                    Ok(()) => WriteOutcome::Written {
                        complete: inner.adapter.completes_after_write()
                            || inner.adapter.needs_refresh(),
                    },
                    Err(e) => WriteOutcome::Failed(e),
                },
            }
        };

        match outcome {
            WriteOutcome::Written { complete } => {
                if heartbeat {
                    for listener in self.listeners() {
                        listener.on_heartbeat(self);
                    }
                }
                if complete {
                    // long-poll ends its response here; the legacy document asks for a refresh
                    let refresh = self.inner.lock().adapter.needs_refresh();
                    self.shutdown(true, refresh);
                }
                Ok(())
            }
            WriteOutcome::Unencodable(e) => {
                warn!(connection_id = %self.id, transport = %self.kind, error = %e, "payload cannot be encoded for this connection");
                for listener in self.listeners() {
                    listener.on_error(self, &e, true);
                }
                Ok(())
            }
            WriteOutcome::Failed(e) => {
                self.fail(&e, true);
                Err(e)
            }
        }
    }

    /// Unexpected disconnection: report, then tear down without writing.
    fn fail(&self, cause: &AppError, was_connected: bool) {
        debug!(connection_id = %self.id, error = %cause, "connection write failed");
        for listener in self.listeners() {
            listener.on_error(self, cause, was_connected);
        }
        self.terminate(false);
    }

    /// Sends a status frame, which the client treats as an error plus
    /// disconnect, then terminates.
    pub fn terminate_with_status(&self, code: u16, message: &str) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Terminated {
                return false;
            }
            if inner.state != ConnectionState::Connecting {
                let bytes = inner.adapter.error(code, message);
                let _ = Self::write_locked(&self.id, &mut inner, bytes);
            }
            inner.state = ConnectionState::Terminated;
            inner.sink = None;
        }
        self.finish(true);
        true
    }

    /// Moves to `TERMINATED`. Returns `false` if the connection was already
    /// terminated, in which case nothing happens.
    ///
    /// Server-initiated termination writes the transport's disconnect (or
    /// refresh) notice before closing the channel; otherwise the client is
    /// already gone and the fact is only recorded.
    pub fn terminate(&self, server_initiated: bool) -> bool {
        self.shutdown(server_initiated, server_initiated)
    }

    fn shutdown(&self, server_initiated: bool, farewell: bool) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Terminated {
                return false;
            }
            let was_open = inner.state != ConnectionState::Connecting;
            if farewell && was_open {
                let farewell = if inner.adapter.needs_refresh() {
                    inner.adapter.refresh()
                } else {
                    inner.adapter.disconnect()
                };
                if let Some(bytes) = farewell {
                    let _ = Self::write_locked(&self.id, &mut inner, bytes);
                }
            }
            inner.state = ConnectionState::Terminated;
            inner.sink = None;
        }
        self.finish(server_initiated);
        true
    }

    fn finish(&self, server_initiated: bool) {
        self.closed.send_replace(true);
        info!(
            connection_id = %self.id,
            transport = %self.kind,
            server_initiated,
            "connection terminated"
        );
        for listener in self.listeners() {
            listener.on_disconnected(self, server_initiated);
        }
    }
}

impl EventSink for Connection {
    fn put_event(&self, event: &Event) -> AppResult<()> {
        self.write_event(event)
    }

    fn close(&self) {
        self.terminate(true);
    }
}
