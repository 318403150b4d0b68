//! Event routing: queues, the event manager, delivery workers, the shared
//! queue directory, sessions and heartbeats.

pub mod directory;
pub mod heartbeat;
pub mod hub;
pub mod manager;
pub mod queue;
pub mod session;
pub mod worker;

pub use directory::{DirectoryStore, MemoryDirectoryStore, QueueDirectory, RedisDirectoryStore};
pub use heartbeat::HeartbeatPolicy;
pub use hub::ConnectionHub;
pub use manager::{EventManager, QueueRegistry};
pub use queue::{EventQueue, EventSink, QueueDescriptor, ServerSink, SERVER_SINK_ID};
pub use session::{PushSession, SessionRegistry};
pub use worker::{
    Backoff, BusPublisher, BusStatus, DeliveryWorker, LocalDeliveryWorker, RedisBusWorker,
};
