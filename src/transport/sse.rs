use super::{TransportAdapter, TransportKind};
use crate::error::AppResult;
use crate::event::{DataType, Event, WireMessage};
use bytes::Bytes;
use serde_json::json;
use std::fmt::Write as _;

/// Renders one SSE record. Multi-line data is split into several `data:`
/// fields as the format requires.
pub fn record(event: Option<&str>, id: Option<&str>, data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 32);
    if let Some(id) = id {
        let _ = writeln!(out, "id: {id}");
    }
    if let Some(event) = event {
        let _ = writeln!(out, "event: {event}");
    }
    for line in data.split('\n') {
        let _ = writeln!(out, "data: {}", line.trim_end_matches('\r'));
    }
    out.push('\n');
    out
}

/// SSE record for an event, also used by the monitor stream.
pub fn encode_event(event: &Event) -> AppResult<String> {
    let id = event.id.to_string();
    Ok(record(
        Some(&event.name),
        Some(&id),
        &event.to_message().to_json()?,
    ))
}

/// Server-Sent Events (`text/event-stream`).
///
/// Clients reconnect on their own and may send `Last-Event-ID`; a reconnect
/// is always a fresh connection, so ids are informational only.
pub struct SseAdapter {
    retry_ms: u64,
}

impl SseAdapter {
    pub fn new(retry_ms: u64) -> Self {
        Self { retry_ms }
    }
}

impl TransportAdapter for SseAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn content_type(&self) -> &'static str {
        "text/event-stream"
    }

    fn preamble(&mut self) -> Option<Bytes> {
        Some(Bytes::from(format!("retry: {}\n\n", self.retry_ms)))
    }

    fn connected(&mut self, heartbeat_ms: u64) -> Bytes {
        Bytes::from(record(
            Some("connected"),
            None,
            &json!({ "heartbeat": heartbeat_ms }).to_string(),
        ))
    }

    fn event(&mut self, event: &Event) -> AppResult<Bytes> {
        Ok(Bytes::from(encode_event(event)?))
    }

    fn text(&mut self, text: &str) -> AppResult<Bytes> {
        Ok(Bytes::from(record(Some("message"), None, text)))
    }

    fn heartbeat(&mut self) -> Bytes {
        Bytes::from_static(b": heartbeat\n\n")
    }

    fn disconnect(&mut self) -> Option<Bytes> {
        Some(Bytes::from(record(Some("disconnect"), None, "")))
    }

    fn error(&mut self, code: u16, message: &str) -> Bytes {
        let status = WireMessage::control(
            "error",
            DataType::Status,
            json!({ "code": code, "message": message }),
        );
        let data = status
            .to_json()
            .unwrap_or_else(|_| format!("{{\"code\":{code}}}"));
        Bytes::from(record(Some("error"), None, &data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventTarget;

    #[test]
    fn test_record_splits_lines() {
        assert_eq!(
            record(Some("message"), None, "a\nb"),
            "event: message\ndata: a\ndata: b\n\n"
        );
    }

    #[test]
    fn test_event_record_carries_json_message() {
        let mut adapter = SseAdapter::new(3000);
        let event = Event::text("greet", EventTarget::world(), "hello");
        let bytes = adapter.event(&event).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with(&format!("id: {}\nevent: greet\n", event.id)));
        let data = text
            .lines()
            .find_map(|l| l.strip_prefix("data: "))
            .unwrap();
        let message = WireMessage::from_json(data).unwrap();
        assert_eq!(message, event.to_message());
    }

    #[test]
    fn test_preamble_and_heartbeat() {
        let mut adapter = SseAdapter::new(2500);
        assert_eq!(adapter.preamble().unwrap(), Bytes::from("retry: 2500\n\n"));
        assert!(adapter.heartbeat().starts_with(b":"));
    }
}
