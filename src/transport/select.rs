use super::TransportKind;
use actix_web::http::header::{HeaderMap, ACCEPT, UPGRADE, USER_AGENT};

pub const EVENT_STREAM: &str = "text/event-stream";
pub const COMET_STREAM: &str = "application/comet";

fn header<'a>(headers: &'a HeaderMap, name: &actix_web::http::header::HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Picks the transport for a push request from its headers alone.
pub fn select_transport(headers: &HeaderMap, legacy_user_agents: &[String]) -> TransportKind {
    if header(headers, &UPGRADE).eq_ignore_ascii_case("websocket") {
        return TransportKind::WebSocket;
    }

    let accept = header(headers, &ACCEPT).to_ascii_lowercase();
    if accept.contains(EVENT_STREAM) {
        return TransportKind::Sse;
    }
    if accept.contains(COMET_STREAM) {
        return TransportKind::Streaming;
    }

    let agent = header(headers, &USER_AGENT);
    if legacy_user_agents
        .iter()
        .any(|pattern| !pattern.is_empty() && agent.contains(pattern.as_str()))
    {
        return TransportKind::Legacy;
    }

    TransportKind::LongPoll
}
