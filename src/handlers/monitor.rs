use crate::state::AppState;
use crate::transport::sse;
use actix_web::http::header::CACHE_CONTROL;
use actix_web::{web, HttpResponse};
use bytes::Bytes;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;
use tracing::warn;

/// Live SSE feed of every event dispatched on this node, read from the
/// server sink queue.
///
/// GET /api/v1/monitor
pub async fn monitor(state: web::Data<AppState>) -> HttpResponse {
    let events = BroadcastStream::new(state.manager.server_sink().subscribe());

    let body = tokio_stream::once(Ok(Bytes::from_static(b": monitor\n\n"))).chain(
        events.filter_map(|item| match item {
            Ok(event) => match sse::encode_event(&event) {
                Ok(record) => Some(Ok::<_, actix_web::Error>(Bytes::from(record))),
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "monitor could not encode event");
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                Some(Ok(Bytes::from(format!(": lagged {skipped}\n\n"))))
            }
        }),
    );

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((CACHE_CONTROL, "no-cache"))
        .streaming(body)
}
