//! Push sessions: one per client session, holding pending text messages and
//! the currently attached connection.

use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::transport::{Connection, ConnectionListener};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

struct SessionState {
    pending: VecDeque<String>,
    connection: Option<Arc<Connection>>,
    last_access: Instant,
}

pub struct PushSession {
    id: String,
    user_key: Option<String>,
    channel: Option<String>,
    state: Mutex<SessionState>,
    /// Keeps concurrent flushes from reordering messages.
    flush_lock: Mutex<()>,
    pending_limit: usize,
}

impl PushSession {
    pub fn new(
        id: impl Into<String>,
        user_key: Option<String>,
        channel: Option<String>,
        pending_limit: usize,
    ) -> Self {
        Self {
            id: id.into(),
            user_key,
            channel,
            state: Mutex::new(SessionState {
                pending: VecDeque::new(),
                connection: None,
                last_access: Instant::now(),
            }),
            flush_lock: Mutex::new(()),
            pending_limit: pending_limit.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_key(&self) -> Option<&str> {
        self.user_key.as_deref()
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn touch(&self) {
        self.state.lock().last_access = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn attached_id(&self) -> Option<String> {
        self.state
            .lock()
            .connection
            .as_ref()
            .map(|c| c.id().to_string())
    }

    /// Makes `connection` the attached connection and flushes pending
    /// messages through it. The previous connection is terminated only
    /// afterwards, so there is no moment without an attached connection.
    pub fn attach(&self, connection: Arc<Connection>) {
        let previous = {
            let mut state = self.state.lock();
            state.last_access = Instant::now();
            state.connection.replace(connection.clone())
        };
        debug!(session_id = %self.id, connection_id = %connection.id(), "connection attached");

        self.flush();

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &connection) {
                debug!(session_id = %self.id, connection_id = %previous.id(), "terminating replaced connection");
                previous.terminate(true);
            }
        }
    }

    /// Clears the attachment if `connection` is still the attached one.
    pub fn detach(&self, connection: &Connection) -> bool {
        let mut state = self.state.lock();
        let attached = state
            .connection
            .as_ref()
            .is_some_and(|c| std::ptr::eq(c.as_ref(), connection));
        if attached {
            state.connection = None;
        }
        attached
    }

    /// Appends a message and signals a flush. Returns the pending count at
    /// the time of the append. The oldest message is dropped when full.
    pub fn enqueue(self: &Arc<Self>, message: impl Into<String>) -> usize {
        let pending = {
            let mut state = self.state.lock();
            state.last_access = Instant::now();
            if state.pending.len() >= self.pending_limit {
                state.pending.pop_front();
                warn!(session_id = %self.id, limit = self.pending_limit, "pending queue full, dropping oldest message");
            }
            state.pending.push_back(message.into());
            state.pending.len()
        };

        match Handle::try_current() {
            Ok(handle) => {
                let session = Arc::clone(self);
                handle.spawn(async move {
                    session.flush();
                });
            }
            Err(_) => {
                self.flush();
            }
        }
        pending
    }

    /// Writes pending messages through the attached connection while it
    /// accepts them. Unsent messages stay pending in order.
    pub fn flush(&self) -> usize {
        let _flushing = self.flush_lock.lock();
        let (connection, mut batch) = {
            let mut state = self.state.lock();
            match state.connection.clone() {
                Some(connection) if connection.is_open() && !state.pending.is_empty() => {
                    (connection, std::mem::take(&mut state.pending))
                }
                _ => return 0,
            }
        };

        let mut sent = 0;
        while let Some(message) = batch.pop_front() {
            if let Err(e) = connection.write_text(&message) {
                debug!(session_id = %self.id, error = %e, "flush interrupted");
                batch.push_front(message);
                break;
            }
            sent += 1;
            // long-poll completes after one payload
            if !connection.is_open() {
                break;
            }
        }

        if !batch.is_empty() {
            let mut state = self.state.lock();
            while let Some(message) = batch.pop_back() {
                state.pending.push_front(message);
            }
            while state.pending.len() > self.pending_limit {
                state.pending.pop_front();
            }
        }
        sent
    }

    /// Detaches the connection and drops pending messages. Returns the
    /// connection so the caller can terminate it.
    fn invalidate(&self) -> Option<Arc<Connection>> {
        let mut state = self.state.lock();
        state.pending.clear();
        state.connection.take()
    }
}

/// Detaches a connection from its session when it ends.
struct SessionListener {
    sessions: Weak<SessionRegistry>,
    session_id: String,
}

impl ConnectionListener for SessionListener {
    fn on_disconnected(&self, connection: &Connection, _server_initiated: bool) {
        if let Some(sessions) = self.sessions.upgrade() {
            if let Some(session) = sessions.get(&self.session_id) {
                session.detach(connection);
            }
        }
    }
}

/// All push sessions on this node.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<PushSession>>,
    pending_limit: usize,
}

impl SessionRegistry {
    pub fn new(pending_limit: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            pending_limit,
        }
    }

    pub fn get_or_create_session(
        &self,
        session_id: &str,
        user_key: Option<String>,
        channel: Option<String>,
    ) -> Arc<PushSession> {
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "creating push session");
                Arc::new(PushSession::new(
                    session_id,
                    user_key,
                    channel,
                    self.pending_limit,
                ))
            })
            .clone();
        session.touch();
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<PushSession>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Copies `ctx`, taking a missing channel or user key from the session it
    /// names. The connection id is left alone since it marks the origin.
    pub fn fill_context(&self, ctx: &RequestContext) -> RequestContext {
        let mut filled = ctx.clone();
        let Some(session) = ctx.session_id.as_deref().and_then(|id| self.get(id)) else {
            return filled;
        };
        if filled.channel.is_none() {
            filled.channel = session.channel().map(str::to_string);
        }
        if filled.user_key.is_none() {
            filled.user_key = session.user_key().map(str::to_string);
        }
        filled
    }

    pub fn listener(self: &Arc<Self>, session_id: &str) -> Arc<dyn ConnectionListener> {
        Arc::new(SessionListener {
            sessions: Arc::downgrade(self),
            session_id: session_id.to_string(),
        })
    }

    pub fn enqueue(&self, session_id: &str, message: impl Into<String>) -> AppResult<usize> {
        let session = self
            .get(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
        Ok(session.enqueue(message))
    }

    /// Refreshes last access. Returns `false` if the session no longer exists.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.get(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Logout: removes the session and terminates its connection, which also
    /// removes the connection's queue.
    pub fn invalidate(&self, session_id: &str) -> bool {
        let Some(connection) = self.remove(session_id) else {
            return false;
        };
        if let Some(connection) = connection {
            connection.terminate(true);
        }
        info!(session_id = %session_id, "session invalidated");
        true
    }

    /// Removes sessions idle for at least `max_idle`. Their connections get
    /// a 401 status frame so clients know to re-authenticate rather than
    /// reconnect.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.value().last_access()) >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut count = 0;
        for session_id in &expired {
            let Some(connection) = self.remove(session_id) else {
                continue;
            };
            if let Some(connection) = connection {
                connection.terminate_with_status(401, "session expired");
            }
            debug!(session_id = %session_id, "session expired");
            count += 1;
        }
        count
    }

    /// `None` if the session did not exist, otherwise its detached connection.
    fn remove(&self, session_id: &str) -> Option<Option<Arc<Connection>>> {
        let (_, session) = self.sessions.remove(session_id)?;
        Some(session.invalidate())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub fn spawn_session_sweeper(sessions: Arc<SessionRegistry>, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = (max_idle / 4).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let expired = sessions.expire_idle(max_idle);
            if expired > 0 {
                info!(expired, "expired idle push sessions");
            }
        }
    })
}
