use crate::{
    config::{Config, DeliveryMode},
    error::{AppError, AppResult},
    push::{
        BusStatus, ConnectionHub, DeliveryWorker, DirectoryStore, EventManager,
        LocalDeliveryWorker, MemoryDirectoryStore, QueueDirectory, QueueRegistry, RedisBusWorker,
        RedisDirectoryStore, SessionRegistry,
    },
    redis_client::RedisClient,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<EventManager>,
    pub sessions: Arc<SessionRegistry>,
    pub hub: Arc<ConnectionHub>,
    /// Present when a Redis URL is configured.
    pub redis: Option<RedisClient>,
    /// Subscription state shared with the bus listener; bus delivery only.
    pub bus_status: Option<Arc<BusStatus>>,
}

impl AppState {
    /// Wires the registries for `config`. With Redis the directory lives in
    /// Redis and, in bus mode, events travel over its pub/sub channel.
    pub fn build(config: Config, redis: Option<RedisClient>) -> AppResult<Self> {
        let store: Arc<dyn DirectoryStore> = match (&redis, &config.redis) {
            (Some(client), Some(redis_config)) => Arc::new(RedisDirectoryStore::new(
                client.clone(),
                redis_config.directory_prefix.clone(),
                redis_config.directory_ttl_secs,
            )),
            _ => Arc::new(MemoryDirectoryStore::new()),
        };

        let registry = Arc::new(QueueRegistry::new());
        let (worker, bus_status): (Arc<dyn DeliveryWorker>, _) = match config.delivery {
            DeliveryMode::Local => (Arc::new(LocalDeliveryWorker::new(registry.clone())), None),
            DeliveryMode::Redis => {
                let (client, redis_config) = redis
                    .as_ref()
                    .zip(config.redis.as_ref())
                    .ok_or_else(|| AppError::Config("redis delivery needs a Redis client".into()))?;
                let status = Arc::new(BusStatus::new());
                let worker = Arc::new(RedisBusWorker::new(
                    Arc::new(client.clone()),
                    redis_config.bus_channel.clone(),
                    config.node_id.clone(),
                    registry.clone(),
                    status.clone(),
                ));
                (worker, Some(status))
            }
        };

        let mut state = Self::assemble(config, registry, worker, store, redis);
        state.bus_status = bus_status;
        Ok(state)
    }

    /// Process-local delivery over a caller-provided directory store, so
    /// several in-process nodes can share one directory.
    pub fn local(config: Config, store: Arc<dyn DirectoryStore>) -> Self {
        let registry = Arc::new(QueueRegistry::new());
        let worker = Arc::new(LocalDeliveryWorker::new(registry.clone()));
        Self::assemble(config, registry, worker, store, None)
    }

    fn assemble(
        config: Config,
        registry: Arc<QueueRegistry>,
        worker: Arc<dyn DeliveryWorker>,
        store: Arc<dyn DirectoryStore>,
        redis: Option<RedisClient>,
    ) -> Self {
        let directory = Arc::new(QueueDirectory::new(config.node_id.clone(), store));
        let sessions = Arc::new(SessionRegistry::new(config.push.session_pending_limit));
        let manager = Arc::new(
            EventManager::new(
                config.node_id.clone(),
                registry,
                worker,
                directory,
                config.push.event_ttl(),
            )
            .with_sessions(sessions.clone()),
        );
        let hub = Arc::new(ConnectionHub::new(
            manager.clone(),
            sessions.clone(),
            config.push.clone(),
        ));

        Self {
            config: Arc::new(config),
            manager,
            sessions,
            hub,
            redis,
            bus_status: None,
        }
    }
}
