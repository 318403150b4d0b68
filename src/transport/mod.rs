//! Transport adapters.
//!
//! Each client capability gets one [`TransportAdapter`] that knows how to
//! render frames for its wire format. The shared [`Connection`] owns the
//! lifecycle and calls into the adapter under its lock, so adapters are free
//! to keep per-connection state (the legacy document counts bytes, for one).

pub mod connection;
pub mod legacy;
pub mod long_poll;
pub mod select;
pub mod sse;
pub mod streaming;
pub mod suspend;
pub mod websocket;

use crate::config::PushConfig;
use crate::error::{AppError, AppResult};
use crate::event::{Event, SerialMode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use connection::{Connection, ConnectionListener, ConnectionState};
pub use select::select_transport;
pub use suspend::{SuspendMode, SuspendedBody, Suspension};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    LongPoll,
    Streaming,
    Sse,
    Legacy,
    WebSocket,
    /// In-process monitoring queue; never selected for a client.
    ServerSink,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LongPoll => "long-poll",
            TransportKind::Streaming => "streaming",
            TransportKind::Sse => "sse",
            TransportKind::Legacy => "legacy",
            TransportKind::WebSocket => "web-socket",
            TransportKind::ServerSink => "server-sink",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query parameters accepted on the push endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushParams {
    /// Requested heartbeat interval in milliseconds.
    pub heartbeat: Option<u64>,
    /// Client deserializer module for serialized object frames.
    pub module: Option<String>,
    pub version: Option<String>,
    /// Parent document domain for the legacy transport.
    pub domain: Option<String>,
}

pub trait TransportAdapter: Send {
    fn kind(&self) -> TransportKind;

    fn content_type(&self) -> &'static str;

    /// Bytes written ahead of the connected frame (headers, padding).
    fn preamble(&mut self) -> Option<Bytes> {
        None
    }

    fn connected(&mut self, heartbeat_ms: u64) -> Bytes;

    fn event(&mut self, event: &Event) -> AppResult<Bytes>;

    fn text(&mut self, text: &str) -> AppResult<Bytes>;

    fn heartbeat(&mut self) -> Bytes;

    /// Clean-disconnect notice, if the wire format has one.
    fn disconnect(&mut self) -> Option<Bytes>;

    fn refresh(&mut self) -> Option<Bytes> {
        None
    }

    fn error(&mut self, code: u16, message: &str) -> Bytes;

    /// One payload per response: the connection ends after the first write.
    fn completes_after_write(&self) -> bool {
        false
    }

    /// The client should reopen; checked after every successful write.
    fn needs_refresh(&self) -> bool {
        false
    }
}

pub fn build_adapter(
    kind: TransportKind,
    params: &PushParams,
    config: &PushConfig,
) -> AppResult<Box<dyn TransportAdapter>> {
    let mode = || SerialMode::negotiate(params.module.as_deref(), params.version.as_deref());

    let adapter: Box<dyn TransportAdapter> = match kind {
        TransportKind::LongPoll => Box::new(long_poll::LongPollAdapter::new(mode()?)),
        TransportKind::Streaming => Box::new(streaming::StreamingAdapter::new(
            mode()?,
            config.padding_bytes,
        )),
        TransportKind::Sse => Box::new(sse::SseAdapter::new(config.sse_retry_ms)),
        TransportKind::Legacy => Box::new(legacy::LegacyAdapter::new(
            mode()?,
            legacy::LegacyOptions {
                domain: params.domain.clone(),
                padding_bytes: config.padding_bytes,
                max_bytes: config.legacy_max_bytes,
                collect_every: config.legacy_collect_every,
            },
        )),
        TransportKind::WebSocket => Box::new(websocket::WebSocketAdapter),
        TransportKind::ServerSink => {
            return Err(AppError::BadRequest(
                "server sink is not a client transport".into(),
            ))
        }
    };
    Ok(adapter)
}
