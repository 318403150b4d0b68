use super::{TransportAdapter, TransportKind};
use crate::error::AppResult;
use crate::event::{Event, Frame, SerialMode};
use bytes::Bytes;

pub(super) fn line(frame: &Frame) -> Bytes {
    Bytes::from(frame.encode_line())
}

/// Chunked HTTP streaming (`application/comet`): newline-delimited frames
/// on one long-lived response.
pub struct StreamingAdapter {
    mode: SerialMode,
    padding_bytes: usize,
}

impl StreamingAdapter {
    pub fn new(mode: SerialMode, padding_bytes: usize) -> Self {
        Self {
            mode,
            padding_bytes,
        }
    }
}

impl TransportAdapter for StreamingAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    fn content_type(&self) -> &'static str {
        "application/comet; charset=utf-8"
    }

    /// Some proxies buffer small responses; padding pushes the first chunk through.
    fn preamble(&mut self) -> Option<Bytes> {
        (self.padding_bytes > 0).then(|| line(&Frame::Padding(self.padding_bytes)))
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTarget;

    #[test]
    fn test_padding_preamble() {
        let mut adapter = StreamingAdapter::new(SerialMode::Json, 16);
        let preamble = adapter.preamble().unwrap();
        assert_eq!(preamble.len(), 1 + 16 + 1);
        assert!(StreamingAdapter::new(SerialMode::Json, 0).preamble().is_none());
    }

    #[test]
    fn test_frames_are_newline_terminated() {
        let mut adapter = StreamingAdapter::new(SerialMode::Rpc, 0);
        let event = Event::text("note", EventTarget::world(), "hi");

        assert_eq!(adapter.connected(500), Bytes::from("!500\n"));
        assert_eq!(adapter.heartbeat(), Bytes::from("#\n"));
        assert_eq!(adapter.error(503, ""), Bytes::from("503\n"));

        let frame = adapter.event(&event).unwrap();
        assert!(frame.starts_with(b"R{"));
        assert!(frame.ends_with(b"\n"));
    }
}
