use super::directory::QueueDirectory;
use super::queue::{EventQueue, EventSink, QueueDescriptor, ServerSink};
use super::session::SessionRegistry;
use super::worker::{DeliveryWorker, LocalDeliveryWorker};
use crate::context::RequestContext;
use crate::error::AppResult;
use crate::event::{Event, EventTarget};
use crate::metrics;
use crate::transport::{Connection, ConnectionListener};
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SERVER_SINK_CAPACITY: usize = 1024;

/// Queues owned by this node.
///
/// Copy-on-write: dispatch iterates an `Arc` snapshot and never holds the
/// lock, while writers clone the list, modify it and swap it in. Every
/// change bumps a generation so the directory publisher knows to republish.
pub struct QueueRegistry {
    queues: RwLock<Arc<Vec<Arc<EventQueue>>>>,
    generation: watch::Sender<u64>,
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueRegistry {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            queues: RwLock::new(Arc::new(Vec::new())),
            generation,
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<EventQueue>>> {
        self.queues.read().clone()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Adds a queue. A queue already registered for the same connection id
    /// is replaced and closed.
    pub fn register(&self, queue: EventQueue) -> Arc<EventQueue> {
        let queue = Arc::new(queue);
        let replaced = {
            let mut guard = self.queues.write();
            let mut next: Vec<Arc<EventQueue>> = Vec::with_capacity(guard.len() + 1);
            let mut replaced = None;
            for existing in guard.iter() {
                if existing.connection_id() == queue.connection_id() {
                    replaced = Some(existing.clone());
                } else {
                    next.push(existing.clone());
                }
            }
            next.push(queue.clone());
            *guard = Arc::new(next);
            replaced
        };
        self.bump();

        if let Some(old) = replaced {
            debug!(connection_id = %old.connection_id(), "replacing queue for reused connection id");
            old.close();
        }
        queue
    }

    fn remove_where(&self, pred: impl Fn(&EventQueue) -> bool) -> Option<Arc<EventQueue>> {
        let removed = {
            let mut guard = self.queues.write();
            let position = guard.iter().position(|q| pred(q.as_ref()))?;
            let mut next = guard.as_ref().clone();
            let removed = next.remove(position);
            *guard = Arc::new(next);
            removed
        };
        self.bump();
        Some(removed)
    }

    /// Removes one specific queue. A later queue that reused the same
    /// connection id is left alone.
    pub fn remove_queue(&self, queue_id: Uuid) -> Option<Arc<EventQueue>> {
        self.remove_where(|q| q.id() == queue_id)
    }

    pub fn remove(&self, connection_id: &str) -> Option<Arc<EventQueue>> {
        self.remove_where(|q| q.connection_id() == connection_id)
    }

    pub fn find(&self, connection_id: &str) -> Option<Arc<EventQueue>> {
        self.snapshot()
            .iter()
            .find(|q| q.connection_id() == connection_id)
            .cloned()
    }

    /// Client queues, without the server sink.
    pub fn descriptors(&self) -> Vec<QueueDescriptor> {
        self.snapshot()
            .iter()
            .filter(|q| !q.descriptor().is_server_sink())
            .map(|q| q.descriptor().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|q| !q.descriptor().is_server_sink())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hands the event to every matching queue and returns how many client
    /// queues took it. A queue that fails (or panics) is closed and evicted;
    /// nothing propagates to the caller.
    pub fn dispatch(&self, event: &Event) -> usize {
        if event.is_expired() {
            debug!(event_id = %event.id, name = %event.name, "dropping expired event");
            metrics::record_event_dropped("expired");
            return 0;
        }

        let snapshot = self.snapshot();
        let mut delivered = 0;
        for queue in snapshot.iter().filter(|q| q.matches(event)) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| queue.put_event(event)));
            match outcome {
                Ok(Ok(())) => {
                    if !queue.descriptor().is_server_sink() {
                        delivered += 1;
                    }
                }
                Ok(Err(e)) => {
                    warn!(
                        connection_id = %queue.connection_id(),
                        event_id = %event.id,
                        error = %e,
                        "queue write failed, evicting"
                    );
                    self.evict(queue);
                }
                Err(_) => {
                    error!(
                        connection_id = %queue.connection_id(),
                        event_id = %event.id,
                        "queue panicked during dispatch, evicting"
                    );
                    self.evict(queue);
                }
            }
        }

        metrics::record_events_delivered(delivered);
        delivered
    }

    fn evict(&self, queue: &Arc<EventQueue>) {
        self.remove_queue(queue.id());
        queue.close();
        metrics::record_queue_evicted();
    }

    /// Server-initiated close of every client queue.
    pub fn close_all(&self) -> usize {
        let queues = self.snapshot();
        let mut closed = 0;
        for queue in queues.iter().filter(|q| !q.descriptor().is_server_sink()) {
            queue.close();
            self.remove_queue(queue.id());
            closed += 1;
        }
        closed
    }
}

/// Removes a connection's queue when the connection ends.
struct QueueListener {
    registry: Weak<QueueRegistry>,
    queue_id: Uuid,
}

impl ConnectionListener for QueueListener {
    fn on_disconnected(&self, connection: &Connection, server_initiated: bool) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove_queue(self.queue_id).is_some() {
                debug!(connection_id = %connection.id(), server_initiated, "queue removed");
            }
        }
        metrics::connection_closed(connection.kind().as_str());
    }
}

/// Entry point for producers and owner of this node's queues.
pub struct EventManager {
    node_id: String,
    registry: Arc<QueueRegistry>,
    worker: Arc<dyn DeliveryWorker>,
    directory: Arc<QueueDirectory>,
    server_sink: Arc<ServerSink>,
    event_ttl: Duration,
    /// Source of channel and user key for producers that only name a session.
    sessions: Option<Arc<SessionRegistry>>,
}

impl EventManager {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<QueueRegistry>,
        worker: Arc<dyn DeliveryWorker>,
        directory: Arc<QueueDirectory>,
        event_ttl: Duration,
    ) -> Self {
        let node_id = node_id.into();
        let server_sink = Arc::new(ServerSink::new(SERVER_SINK_CAPACITY));
        registry.register(EventQueue::new(
            QueueDescriptor::server_sink(node_id.clone()),
            server_sink.clone(),
        ));
        info!(node_id = %node_id, worker = worker.name(), "event manager ready");
        Self {
            node_id,
            registry,
            worker,
            directory,
            server_sink,
            event_ttl,
            sessions: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Single-node manager delivering straight into its own registry.
    pub fn local(node_id: impl Into<String>, directory: Arc<QueueDirectory>, event_ttl: Duration) -> Self {
        let registry = Arc::new(QueueRegistry::new());
        let worker = Arc::new(LocalDeliveryWorker::new(registry.clone()));
        Self::new(node_id, registry, worker, directory, event_ttl)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<QueueDirectory> {
        &self.directory
    }

    pub fn server_sink(&self) -> &Arc<ServerSink> {
        &self.server_sink
    }

    pub fn event_ttl(&self) -> Duration {
        self.event_ttl
    }

    /// Resolves the target against the request context and hands the event
    /// to the delivery worker. An empty key is filled from the context, or
    /// from the session the context names, when the scope needs one; if
    /// nothing fills it the event is dropped and `UnresolvedTarget` returned.
    /// Events still carrying the built-in time-to-live get this manager's.
    pub async fn fire_event(&self, mut event: Event, ctx: &RequestContext) -> AppResult<usize> {
        if event.has_default_ttl() {
            event = event.with_ttl(self.event_ttl);
        }
        if event.is_expired() {
            debug!(event_id = %event.id, name = %event.name, "event expired before firing");
            metrics::record_event_dropped("expired");
            return Ok(0);
        }

        let ctx = match &self.sessions {
            Some(sessions) => sessions.fill_context(ctx),
            None => ctx.clone(),
        };
        event.target = match event.target.require_resolved(&ctx, &event.name) {
            Ok(target) => target,
            Err(e) => {
                warn!(name = %event.name, scope = %event.scope(), "event target could not be resolved, dropping");
                metrics::record_event_dropped("unresolved");
                return Err(e);
            }
        };
        if event.from.is_none() {
            event.from = ctx.connection_id.clone();
        }

        metrics::record_event_fired(event.scope().as_str());
        debug!(
            event_id = %event.id,
            name = %event.name,
            scope = %event.scope(),
            worker = self.worker.name(),
            "firing event"
        );
        self.worker.deliver(event).await
    }

    /// Dispatches to local queues only.
    pub fn process_event(&self, event: &Event) -> usize {
        self.registry.dispatch(event)
    }

    /// Registers the queue for a connected connection. The queue leaves the
    /// registry when the connection terminates.
    pub fn open_queue(&self, descriptor: QueueDescriptor, connection: Arc<Connection>) -> Arc<EventQueue> {
        let queue = EventQueue::new(descriptor, connection.clone() as Arc<dyn EventSink>);
        connection.add_listener(Arc::new(QueueListener {
            registry: Arc::downgrade(&self.registry),
            queue_id: queue.id(),
        }));
        metrics::connection_opened(connection.kind().as_str());
        let queue = self.registry.register(queue);
        // terminated before registration finished
        if !connection.is_open() {
            self.registry.remove_queue(queue.id());
        }
        queue
    }

    pub fn remove_queue(&self, connection_id: &str) -> Option<Arc<EventQueue>> {
        self.registry.remove(connection_id)
    }

    pub fn find_queue(&self, connection_id: &str) -> Option<Arc<EventQueue>> {
        self.registry.find(connection_id)
    }

    pub fn queues(&self) -> Vec<QueueDescriptor> {
        self.registry.descriptors()
    }

    pub fn queue_count(&self) -> usize {
        self.registry.len()
    }

    pub fn close_all(&self) -> usize {
        let closed = self.registry.close_all();
        info!(node_id = %self.node_id, closed, "closed all connections");
        closed
    }

    pub async fn sync_directory(&self) {
        self.directory
            .set_queue_list_for_node(self.registry.descriptors())
            .await;
    }

    /// Every queue on every node, as far as the directory knows.
    pub async fn combined_queues(&self) -> Vec<QueueDescriptor> {
        self.directory.get_combined_node_list().await
    }

    /// Cluster-wide recipient estimate for a resolved target.
    pub async fn count_recipients(&self, target: &EventTarget) -> usize {
        self.combined_queues()
            .await
            .iter()
            .filter(|q| q.accepts(target))
            .count()
    }

    /// Republishes this node's queues after registry changes. Bursts of
    /// changes coalesce into one publish; the list is also refreshed every
    /// `refresh` so the shared entry does not expire.
    pub fn spawn_directory_publisher(self: &Arc<Self>, refresh: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut changes = self.registry.subscribe_changes();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {}
                }
                manager.sync_directory().await;
            }
            debug!("directory publisher stopped");
        })
    }
}
