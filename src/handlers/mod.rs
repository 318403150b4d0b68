//! HTTP handlers for the push service

pub mod events;
pub mod monitor;
pub mod push;
pub mod queues;
pub mod sessions;

use crate::metrics;
use actix_web::web;

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/push", web::get().to(push::push))
        .service(
            web::scope("/api/v1")
                .route("/events", web::post().to(events::fire_event))
                .route(
                    "/sessions/{session_id}/messages",
                    web::post().to(sessions::enqueue_message),
                )
                .route(
                    "/sessions/{session_id}",
                    web::delete().to(sessions::invalidate_session),
                )
                .route("/queues", web::get().to(queues::combined_queues))
                .route("/queues/local", web::get().to(queues::local_queues))
                .route("/monitor", web::get().to(monitor::monitor)),
        )
        .route("/metrics", web::get().to(metrics::serve_metrics))
        .route("/health", web::get().to(|| async { "OK" }));
}
