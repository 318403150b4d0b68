//! Push endpoint
//!
//! One URL for every transport. The transport is chosen once from the
//! request headers and never revisited for the life of the connection.
//!
//! **Endpoint**: `GET /push`

use crate::context::RequestContext;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transport::suspend::{self, SuspendMode, Suspension};
use crate::transport::websocket::PushSocket;
use crate::transport::{select_transport, PushParams, TransportKind};
use actix_web::http::header::CACHE_CONTROL;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tracing::debug;

const LAST_EVENT_ID: &str = "Last-Event-ID";

pub async fn push(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    params: web::Query<PushParams>,
    ctx: RequestContext,
) -> AppResult<HttpResponse> {
    let requested = select_transport(req.headers(), &state.config.push.legacy_user_agents);
    let (kind, mode) = suspend::negotiate(requested, req.version());

    if kind == TransportKind::WebSocket {
        return start_websocket(&req, stream, &state, &params, ctx);
    }

    if let Some(last_id) = req.headers().get(LAST_EVENT_ID) {
        // resumed SSE clients get a fresh connection
        debug!(last_event_id = ?last_id, "client resuming event stream");
    }

    let (connection, receiver) = state.hub.open(kind, &params, &ctx)?;
    let content_type = connection.content_type();
    let suspension = Suspension::new(connection, receiver, mode);

    let mut response = HttpResponse::Ok();
    response
        .content_type(content_type)
        .insert_header((CACHE_CONTROL, "no-cache"));
    if kind == TransportKind::Sse {
        response.insert_header(("X-Accel-Buffering", "no"));
    }

    Ok(match mode {
        SuspendMode::Detached => response.streaming(suspension.into_body()),
        SuspendMode::Blocking => response.body(suspension.wait().await),
    })
}

fn start_websocket(
    req: &HttpRequest,
    stream: web::Payload,
    state: &AppState,
    params: &PushParams,
    ctx: RequestContext,
) -> AppResult<HttpResponse> {
    // reject a bad handshake before any connection exists
    let mut response =
        ws::handshake(req).map_err(|e| AppError::BadRequest(format!("websocket handshake: {e}")))?;

    let (connection, receiver) = state.hub.open(TransportKind::WebSocket, params, &ctx)?;
    connection.suspend();
    let socket = PushSocket::new(connection, receiver, state.manager.clone(), ctx);

    response.insert_header((CACHE_CONTROL, "no-cache"));
    Ok(response.streaming(ws::WebsocketContext::create(socket, stream)))
}
