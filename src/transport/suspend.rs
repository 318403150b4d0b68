//! Suspend bridge between transports and the HTTP server.
//!
//! Streaming transports detach from the request handler and keep writing
//! through a streaming response body; blocking transports park the handler
//! until the connection completes. Either way the transport sees the same
//! [`Connection`] API, and a dropped body or handler future is reported to
//! the connection as a client-initiated disconnect.

use super::{Connection, TransportKind};
use actix_web::http::Version;
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendMode {
    /// Response body streams frames as they are written.
    Detached,
    /// Handler waits for the connection to finish and returns one body.
    Blocking,
}

/// Settles the transport against what the request can support. HTTP/1.0 has
/// no chunked transfer encoding, so open-ended responses fall back to
/// long-poll there.
pub fn negotiate(kind: TransportKind, version: Version) -> (TransportKind, SuspendMode) {
    match kind {
        TransportKind::WebSocket => (kind, SuspendMode::Detached),
        TransportKind::LongPoll | TransportKind::ServerSink => (kind, SuspendMode::Blocking),
        _ if version < Version::HTTP_11 => {
            debug!(requested = %kind, "HTTP/1.0 client, falling back to long-poll");
            (TransportKind::LongPoll, SuspendMode::Blocking)
        }
        _ => (kind, SuspendMode::Detached),
    }
}

/// Terminates the connection as client-initiated when dropped. A no-op if
/// the connection already ended.
struct DisconnectGuard(Arc<Connection>);

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.0.terminate(false) {
            debug!(connection_id = %self.0.id(), "client went away");
        }
    }
}

/// A connected connection handed to the HTTP layer.
pub struct Suspension {
    connection: Arc<Connection>,
    receiver: mpsc::Receiver<Bytes>,
    mode: SuspendMode,
}

impl Suspension {
    pub fn new(connection: Arc<Connection>, receiver: mpsc::Receiver<Bytes>, mode: SuspendMode) -> Self {
        connection.suspend();
        Self {
            connection,
            receiver,
            mode,
        }
    }

    pub fn mode(&self) -> SuspendMode {
        self.mode
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn into_body(self) -> SuspendedBody {
        SuspendedBody {
            receiver: self.receiver,
            _guard: DisconnectGuard(self.connection),
        }
    }

    /// Parks until the connection completes and returns everything it wrote.
    pub async fn wait(self) -> Bytes {
        let Suspension {
            connection,
            mut receiver,
            ..
        } = self;
        let _guard = DisconnectGuard(connection);

        let mut body = BytesMut::new();
        while let Some(chunk) = receiver.recv().await {
            body.extend_from_slice(&chunk);
        }
        body.freeze()
    }
}

/// Streaming response body fed by the connection channel. Ends when the
/// connection terminates.
pub struct SuspendedBody {
    receiver: mpsc::Receiver<Bytes>,
    _guard: DisconnectGuard,
}

impl Stream for SuspendedBody {
    type Item = Result<Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}
