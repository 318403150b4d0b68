use super::session::SessionRegistry;
use crate::config::PushConfig;
use crate::transport::Connection;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Heartbeat interval negotiation: clients may ask for any interval that is
/// not below the configured minimum.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatPolicy {
    default: Duration,
    min: Duration,
}

impl HeartbeatPolicy {
    pub fn new(default: Duration, min: Duration) -> Self {
        Self {
            default: default.max(min),
            min,
        }
    }

    pub fn from_config(config: &PushConfig) -> Self {
        Self::new(config.heartbeat(), config.min_heartbeat())
    }

    pub fn negotiate(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            None | Some(0) => self.default,
            Some(ms) => Duration::from_millis(ms).max(self.min),
        }
    }
}

/// Writes a heartbeat whenever the connection has been silent for a full
/// interval. The deadline is recomputed from the last write, so a heartbeat
/// never follows a data frame within the interval. A failed heartbeat write
/// has already terminated the connection; the task then exits.
pub fn spawn_heartbeat(connection: Arc<Connection>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = connection.heartbeat_interval();
        loop {
            let due = connection.last_write() + interval;
            tokio::select! {
                _ = connection.closed() => break,
                _ = tokio::time::sleep_until(due) => {}
            }
            if connection.last_write() + interval > Instant::now() {
                continue;
            }
            if let Err(e) = connection.write_heartbeat() {
                debug!(connection_id = %connection.id(), error = %e, "heartbeat write failed");
                break;
            }
        }
    })
}

/// Touches the session's last-access time every `every` while the
/// connection is open.
pub fn spawn_session_keepalive(
    connection: Arc<Connection>,
    sessions: Weak<SessionRegistry>,
    session_id: String,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = connection.closed() => break,
                _ = ticker.tick() => {
                    let Some(sessions) = sessions.upgrade() else { break };
                    if !sessions.touch(&session_id) {
                        debug!(session_id = %session_id, "session gone, stopping keep-alive");
                        break;
                    }
                }
            }
        }
    })
}
