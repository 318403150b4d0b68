use super::manager::QueueRegistry;
use crate::error::AppResult;
use crate::event::Event;
use crate::metrics;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Moves a fired event to the queues that should see it.
#[async_trait]
pub trait DeliveryWorker: Send + Sync {
    /// Returns the number of local recipients, or for bus delivery the
    /// number of nodes that received the event.
    async fn deliver(&self, event: Event) -> AppResult<usize>;

    fn name(&self) -> &'static str;
}

/// Single-node delivery straight into the local registry.
pub struct LocalDeliveryWorker {
    registry: Arc<QueueRegistry>,
}

impl LocalDeliveryWorker {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DeliveryWorker for LocalDeliveryWorker {
    async fn deliver(&self, event: Event) -> AppResult<usize> {
        Ok(self.registry.dispatch(&event))
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Bus message between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub origin_node: String,
    pub event: Event,
}

/// Publishing half of the event bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Returns how many subscribers received the payload.
    async fn publish(&self, channel: &str, payload: String) -> AppResult<usize>;
}

#[async_trait]
impl BusPublisher for RedisClient {
    async fn publish(&self, channel: &str, payload: String) -> AppResult<usize> {
        let mut conn = self.get_multiplexed_async_connection().await?;
        let receivers: usize = conn.publish(channel, payload).await?;
        Ok(receivers)
    }
}

/// Whether this node's bus subscription is live. Shared between the
/// listener, which flips it, and the worker, which falls back to local
/// dispatch while it is down.
#[derive(Debug, Default)]
pub struct BusStatus {
    subscribed: AtomicBool,
    failures: AtomicU64,
}

impl BusStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Subscribe attempts that failed plus subscriptions that ended.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        self.set_subscribed(false);
    }
}

/// Publishes every event on a Redis channel. Each node, this one included,
/// dispatches to its own queues from [`spawn_bus_listener`].
///
/// If the publish fails, or this node is not subscribed, the event goes
/// straight to the local registry and the local recipient count is
/// returned instead.
pub struct RedisBusWorker {
    publisher: Arc<dyn BusPublisher>,
    channel: String,
    node_id: String,
    registry: Arc<QueueRegistry>,
    status: Arc<BusStatus>,
}

impl RedisBusWorker {
    pub fn new(
        publisher: Arc<dyn BusPublisher>,
        channel: impl Into<String>,
        node_id: impl Into<String>,
        registry: Arc<QueueRegistry>,
        status: Arc<BusStatus>,
    ) -> Self {
        Self {
            publisher,
            channel: channel.into(),
            node_id: node_id.into(),
            registry,
            status,
        }
    }

    fn deliver_locally(&self, event: &Event, reason: &str) -> usize {
        metrics::record_bus_fallback(reason);
        let delivered = self.registry.dispatch(event);
        debug!(event_id = %event.id, reason, delivered, "event delivered locally");
        delivered
    }
}

#[async_trait]
impl DeliveryWorker for RedisBusWorker {
    async fn deliver(&self, event: Event) -> AppResult<usize> {
        let envelope = BusEnvelope {
            origin_node: self.node_id.clone(),
            event,
        };
        let payload = serde_json::to_string(&envelope)?;
        let subscribed = self.status.is_subscribed();

        match self.publisher.publish(&self.channel, payload).await {
            Ok(nodes) if subscribed => {
                debug!(
                    event_id = %envelope.event.id,
                    channel = %self.channel,
                    nodes,
                    "event published on bus"
                );
                Ok(nodes)
            }
            Ok(_) => Ok(self.deliver_locally(&envelope.event, "unsubscribed")),
            Err(e) => {
                warn!(
                    event_id = %envelope.event.id,
                    channel = %self.channel,
                    error = %e,
                    "bus publish failed, delivering to local queues only"
                );
                Ok(self.deliver_locally(&envelope.event, "publish"))
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Doubling delay between resubscribe attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Subscribes to the bus and dispatches every received event locally.
/// Unreadable messages are logged and skipped. When the subscription
/// cannot be opened or its stream ends, the task retries with `backoff`
/// and keeps `status` down until it is subscribed again.
pub fn spawn_bus_listener(
    client: redis::Client,
    channel: String,
    registry: Arc<QueueRegistry>,
    status: Arc<BusStatus>,
    mut backoff: Backoff,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match subscribe(&client, &channel).await {
                Ok(pubsub) => {
                    info!(channel = %channel, "subscribed to event bus");
                    status.set_subscribed(true);
                    backoff.reset();
                    consume(pubsub, &registry).await;

                    warn!(channel = %channel, "event bus subscription ended");
                    metrics::record_bus_failure("stream_ended");
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "event bus subscribe failed");
                    metrics::record_bus_failure("subscribe");
                }
            }
            status.record_failure();

            let delay = backoff.next_delay();
            debug!(channel = %channel, delay_ms = delay.as_millis() as u64, "resubscribing to event bus");
            tokio::time::sleep(delay).await;
        }
    })
}

async fn subscribe(client: &redis::Client, channel: &str) -> AppResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

async fn consume(mut pubsub: redis::aio::PubSub, registry: &QueueRegistry) {
    let mut stream = pubsub.on_message();

    while let Some(msg) = stream.next().await {
        let payload = match msg.get_payload::<String>() {
            Ok(p) => p,
            Err(e) => {
                error!(error = ?e, "failed to read bus payload");
                continue;
            }
        };

        let envelope: BusEnvelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = ?e, "failed to deserialize bus envelope");
                continue;
            }
        };

        let delivered = registry.dispatch(&envelope.event);
        debug!(
            event_id = %envelope.event.id,
            origin_node = %envelope.origin_node,
            delivered,
            "bus event dispatched"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::event::{EventTarget, Frame};
    use crate::push::queue::{EventQueue, EventSink, QueueDescriptor};
    use crate::transport::connection::tests::{drain, streaming};
    use crate::transport::TransportKind;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    struct StubPublisher {
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubPublisher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BusPublisher for StubPublisher {
        async fn publish(&self, _channel: &str, _payload: String) -> AppResult<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AppError::ServiceUnavailable("store down".into()))
            } else {
                Ok(3)
            }
        }
    }

    fn registry_with_queue(id: &str) -> (Arc<QueueRegistry>, tokio::sync::mpsc::Receiver<bytes::Bytes>) {
        let registry = Arc::new(QueueRegistry::new());
        let (conn, rx, _) = streaming(id, 32);
        conn.connect().unwrap();
        let descriptor = QueueDescriptor {
            connection_id: id.to_string(),
            channel: None,
            user_key: None,
            session_id: None,
            node_id: "n1".to_string(),
            transport: TransportKind::Streaming,
            connected_at: Utc::now(),
        };
        registry.register(EventQueue::new(descriptor, conn as Arc<dyn EventSink>));
        (registry, rx)
    }

    fn worker(
        publisher: Arc<StubPublisher>,
        registry: Arc<QueueRegistry>,
        subscribed: bool,
    ) -> RedisBusWorker {
        let status = Arc::new(BusStatus::new());
        status.set_subscribed(subscribed);
        RedisBusWorker::new(publisher, "push:events", "n1", registry, status)
    }

    fn has_event(frames: &[Frame]) -> bool {
        frames.iter().any(|f| matches!(f, Frame::Object { .. }))
    }

    #[tokio::test]
    async fn test_local_worker_dispatches_to_registry() {
        let registry = Arc::new(QueueRegistry::new());
        let worker = LocalDeliveryWorker::new(registry.clone());
        let delivered = worker
            .deliver(Event::text("e", EventTarget::world(), "x"))
            .await
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(worker.name(), "local");
    }

    #[test]
    fn test_envelope_roundtrip_keeps_target() {
        let envelope = BusEnvelope {
            origin_node: "n1".into(),
            event: Event::text("e", EventTarget::channel("abc"), "x").with_from("c1"),
        };
        let back: BusEnvelope =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(back.origin_node, "n1");
        assert_eq!(back.event.target, EventTarget::channel("abc"));
        assert_eq!(back.event.from.as_deref(), Some("c1"));
        assert_eq!(back.event.id, envelope.event.id);
    }

    #[tokio::test]
    async fn test_failed_publish_still_reaches_local_queues() {
        let (registry, mut rx) = registry_with_queue("c1");
        drain(&mut rx);
        let publisher = StubPublisher::new(true);
        let worker = worker(publisher.clone(), registry, true);

        let delivered = worker
            .deliver(Event::text("e", EventTarget::world(), "x"))
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        assert!(has_event(&drain(&mut rx)));
    }

    #[tokio::test]
    async fn test_fire_event_survives_bus_outage() {
        use crate::context::RequestContext;
        use crate::push::directory::{MemoryDirectoryStore, QueueDirectory};
        use crate::push::EventManager;

        let (registry, mut rx) = registry_with_queue("c1");
        drain(&mut rx);
        let worker = Arc::new(worker(StubPublisher::new(true), registry.clone(), true));
        let directory = Arc::new(QueueDirectory::new("n1", Arc::new(MemoryDirectoryStore::new())));
        let manager = EventManager::new("n1", registry, worker, directory, Duration::from_secs(60));

        let delivered = manager
            .fire_event(
                Event::text("e", EventTarget::world(), "x"),
                &RequestContext::default(),
            )
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert!(has_event(&drain(&mut rx)));
    }

    #[tokio::test]
    async fn test_unsubscribed_node_publishes_and_delivers_locally() {
        let (registry, mut rx) = registry_with_queue("c1");
        drain(&mut rx);
        let publisher = StubPublisher::new(false);
        let worker = worker(publisher.clone(), registry, false);

        let delivered = worker
            .deliver(Event::text("e", EventTarget::world(), "x"))
            .await
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        assert!(has_event(&drain(&mut rx)));
    }

    #[tokio::test]
    async fn test_subscribed_node_leaves_dispatch_to_listener() {
        let (registry, mut rx) = registry_with_queue("c1");
        drain(&mut rx);
        let worker = worker(StubPublisher::new(false), registry, true);

        let nodes = worker
            .deliver(Event::text("e", EventTarget::world(), "x"))
            .await
            .unwrap();

        assert_eq!(nodes, 3);
        assert!(!has_event(&drain(&mut rx)));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_listener_keeps_retrying_unreachable_bus() {
        // nothing listens on port 1
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let status = Arc::new(BusStatus::new());
        let handle = spawn_bus_listener(
            client,
            "push:events".into(),
            Arc::new(QueueRegistry::new()),
            status.clone(),
            Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while status.failures() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(status.failures() >= 3);
        assert!(!status.is_subscribed());
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    #[ignore] // needs a live Redis at REDIS_URL
    async fn test_bus_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let redis = RedisClient::from_url(&url).await.unwrap();
        let channel = format!("push:test:{}", uuid::Uuid::new_v4());
        let (registry, mut rx) = registry_with_queue("c1");
        drain(&mut rx);
        let status = Arc::new(BusStatus::new());

        let handle = spawn_bus_listener(
            redis.client().clone(),
            channel.clone(),
            registry.clone(),
            status.clone(),
            Backoff::default(),
        );
        while !status.is_subscribed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let worker = RedisBusWorker::new(Arc::new(redis), channel, "n1", registry, status);
        let nodes = worker
            .deliver(Event::text("e", EventTarget::world(), "x"))
            .await
            .unwrap();
        assert_eq!(nodes, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(has_event(&drain(&mut rx)));
        handle.abort();
    }
}
