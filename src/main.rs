use actix_web::{web, App, HttpServer};
use push_service::{
    config,
    error::AppError,
    handlers, logging,
    push::{session::spawn_session_sweeper, worker::spawn_bus_listener, Backoff},
    redis_client::RedisClient,
    state::AppState,
};
use std::time::Duration;

const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;

    let redis = match cfg.redis.as_ref() {
        Some(redis_cfg) => Some(
            RedisClient::from_url(&redis_cfg.url)
                .await
                .map_err(|e| AppError::StartServer(format!("redis: {e}")))?,
        ),
        None => None,
    };

    let state = AppState::build(cfg, redis)?;
    let cfg = state.config.clone();

    // Cross-node delivery: every node, this one included, dispatches from the bus
    let _bus_listener = match (state.bus_status.as_ref(), state.redis.as_ref(), cfg.redis.as_ref()) {
        (Some(status), Some(redis), Some(redis_cfg)) => Some(spawn_bus_listener(
            redis.client().clone(),
            redis_cfg.bus_channel.clone(),
            state.manager.registry().clone(),
            status.clone(),
            Backoff::default(),
        )),
        _ => None,
    };

    let directory_refresh = cfg
        .redis
        .as_ref()
        .map(|r| Duration::from_secs(r.directory_ttl_secs / 2))
        .unwrap_or(Duration::from_secs(30));
    let _publisher = state.manager.spawn_directory_publisher(directory_refresh);
    let _sweeper = spawn_session_sweeper(state.sessions.clone(), cfg.push.session_idle());

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(
        %bind_addr,
        node_id = %cfg.node_id,
        delivery = ?cfg.delivery,
        "starting push-service"
    );

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .configure(handlers::register_routes)
    })
    .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind: {e}")))?
    .run();

    let result = server
        .await
        .map_err(|e| AppError::StartServer(format!("server: {e}")));

    let closed = state.manager.close_all();
    state.manager.directory().withdraw().await;
    tracing::info!(closed, "push-service stopped");

    result
}
