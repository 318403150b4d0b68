use super::streaming::line;
use super::{TransportAdapter, TransportKind};
use crate::error::AppResult;
use crate::event::{Event, Frame, SerialMode};
use bytes::Bytes;

/// Blocking long-poll: the request stays parked until one payload (or a
/// heartbeat) is available, then the response completes and the client polls
/// again.
pub struct LongPollAdapter {
    mode: SerialMode,
}

impl LongPollAdapter {
    pub fn new(mode: SerialMode) -> Self {
        Self { mode }
    }
}

impl TransportAdapter for LongPollAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPoll
    }

    fn content_type(&self) -> &'static str {
        "text/plain; charset=utf-8"
    }

    fn connected(&mut self, heartbeat_ms: u64) -> Bytes {
        line(&Frame::Connected { heartbeat_ms })
    }

    fn event(&mut self, event: &Event) -> AppResult<Bytes> {
        Ok(line(&Frame::event(event, self.mode)?))
    }

    fn text(&mut self, text: &str) -> AppResult<Bytes> {
        Ok(line(&Frame::Text(text.to_string())))
    }

    fn heartbeat(&mut self) -> Bytes {
        line(&Frame::Heartbeat)
    }

    fn disconnect(&mut self) -> Option<Bytes> {
        Some(line(&Frame::Disconnect))
    }

    fn error(&mut self, code: u16, message: &str) -> Bytes {
        line(&Frame::Status {
            code,
            message: (!message.is_empty()).then(|| message.to_string()),
        })
    }

    fn completes_after_write(&self) -> bool {
        true
    }
}
