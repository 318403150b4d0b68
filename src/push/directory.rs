//! Shared directory of every node's queues.
//!
//! Each node publishes the descriptors of the queues it owns under its own
//! entry and never touches another node's entry; readers union all entries.
//! The directory is informational: delivery across nodes goes over the bus.

use super::queue::QueueDescriptor;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub type NodeMap = HashMap<String, Vec<QueueDescriptor>>;

#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn put_node(&self, node_id: &str, queues: &[QueueDescriptor]) -> AppResult<()>;

    async fn all_nodes(&self) -> AppResult<NodeMap>;

    async fn remove_node(&self, node_id: &str) -> AppResult<()>;
}

/// Process-local store. Several in-process nodes may share one instance.
#[derive(Default)]
pub struct MemoryDirectoryStore {
    nodes: DashMap<String, Vec<QueueDescriptor>>,
    unavailable: AtomicBool,
}

impl MemoryDirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a store outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AppError::ServiceUnavailable("directory store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DirectoryStore for MemoryDirectoryStore {
    async fn put_node(&self, node_id: &str, queues: &[QueueDescriptor]) -> AppResult<()> {
        self.check()?;
        self.nodes.insert(node_id.to_string(), queues.to_vec());
        Ok(())
    }

    async fn all_nodes(&self) -> AppResult<NodeMap> {
        self.check()?;
        Ok(self
            .nodes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn remove_node(&self, node_id: &str) -> AppResult<()> {
        self.check()?;
        self.nodes.remove(node_id);
        Ok(())
    }
}

/// Redis layout: `{prefix}:node:{id}` holds the JSON descriptor list with a
/// TTL refreshed on every publish; `{prefix}:nodes` is the set of node ids.
/// A node whose key expired is dropped from the set on the next read.
pub struct RedisDirectoryStore {
    redis: RedisClient,
    prefix: String,
    ttl_secs: u64,
}

impl RedisDirectoryStore {
    pub fn new(redis: RedisClient, prefix: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            ttl_secs: ttl_secs.max(1),
        }
    }

    fn node_key(&self, node_id: &str) -> String {
        format!("{}:node:{}", self.prefix, node_id)
    }

    fn nodes_key(&self) -> String {
        format!("{}:nodes", self.prefix)
    }
}

#[async_trait]
impl DirectoryStore for RedisDirectoryStore {
    async fn put_node(&self, node_id: &str, queues: &[QueueDescriptor]) -> AppResult<()> {
        let payload = serde_json::to_string(queues)?;
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        pipe.set_ex(self.node_key(node_id), payload, self.ttl_secs)
            .ignore()
            .sadd(self.nodes_key(), node_id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn all_nodes(&self) -> AppResult<NodeMap> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let node_ids: Vec<String> = conn.smembers(self.nodes_key()).await?;

        let mut nodes = NodeMap::with_capacity(node_ids.len());
        for node_id in node_ids {
            let raw: Option<String> = conn.get(self.node_key(&node_id)).await?;
            match raw {
                Some(raw) => match serde_json::from_str::<Vec<QueueDescriptor>>(&raw) {
                    Ok(queues) => {
                        nodes.insert(node_id, queues);
                    }
                    Err(e) => warn!(node_id = %node_id, error = %e, "skipping unreadable directory entry"),
                },
                None => {
                    debug!(node_id = %node_id, "pruning expired directory node");
                    conn.srem::<_, _, ()>(self.nodes_key(), &node_id).await?;
                }
            }
        }
        Ok(nodes)
    }

    async fn remove_node(&self, node_id: &str) -> AppResult<()> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let mut pipe = redis::pipe();
        pipe.del(self.node_key(node_id))
            .ignore()
            .srem(self.nodes_key(), node_id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// This node's view of the directory.
pub struct QueueDirectory {
    node_id: String,
    store: Arc<dyn DirectoryStore>,
    /// Last list this node published; also the fallback view.
    published: Mutex<Vec<QueueDescriptor>>,
}

impl QueueDirectory {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn DirectoryStore>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Replaces this node's entry. Store errors are logged and swallowed;
    /// the next call publishes the full list again.
    pub async fn set_queue_list_for_node(&self, queues: Vec<QueueDescriptor>) {
        let mut published = self.published.lock().await;
        if let Err(e) = self.store.put_node(&self.node_id, &queues).await {
            warn!(node_id = %self.node_id, error = %e, "failed to publish queue list, continuing with local delivery");
            metrics::record_directory_failure("publish");
        } else {
            debug!(node_id = %self.node_id, queues = queues.len(), "published queue list");
        }
        *published = queues;
    }

    /// Every queue on every node. Falls back to this node's own list when
    /// the store cannot be read.
    pub async fn get_combined_node_list(&self) -> Vec<QueueDescriptor> {
        let nodes = self.node_map().await;
        let mut node_ids: Vec<&String> = nodes.keys().collect();
        node_ids.sort();
        node_ids
            .into_iter()
            .flat_map(|node_id| nodes[node_id].iter().cloned())
            .collect()
    }

    /// Per-node entries, with this node's entry taken from its own copy.
    pub async fn node_map(&self) -> NodeMap {
        let local = self.published.lock().await.clone();
        let mut nodes = match self.store.all_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(node_id = %self.node_id, error = %e, "directory unavailable, returning local queues only");
                metrics::record_directory_failure("read");
                NodeMap::new()
            }
        };
        nodes.insert(self.node_id.clone(), local);
        nodes
    }

    /// Removes this node's entry on shutdown.
    pub async fn withdraw(&self) {
        let mut published = self.published.lock().await;
        if let Err(e) = self.store.remove_node(&self.node_id).await {
            warn!(node_id = %self.node_id, error = %e, "failed to withdraw from directory");
            metrics::record_directory_failure("withdraw");
        }
        published.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;
    use chrono::Utc;

    fn queue(id: &str, node: &str) -> QueueDescriptor {
        QueueDescriptor {
            connection_id: id.to_string(),
            channel: Some("c".into()),
            user_key: None,
            session_id: None,
            node_id: node.to_string(),
            transport: TransportKind::Sse,
            connected_at: Utc::now(),
        }
    }

    fn ids(list: &[QueueDescriptor]) -> Vec<&str> {
        list.iter().map(|q| q.connection_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_combined_list_unions_nodes() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let n1 = QueueDirectory::new("n1", store.clone());
        let n2 = QueueDirectory::new("n2", store.clone());

        n1.set_queue_list_for_node(vec![queue("a", "n1"), queue("b", "n1")]).await;
        n2.set_queue_list_for_node(vec![queue("c", "n2")]).await;

        assert_eq!(ids(&n1.get_combined_node_list().await), vec!["a", "b", "c"]);
        assert_eq!(ids(&n2.get_combined_node_list().await), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_publish_replaces_only_own_entry() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let n1 = QueueDirectory::new("n1", store.clone());
        let n2 = QueueDirectory::new("n2", store.clone());

        n1.set_queue_list_for_node(vec![queue("a", "n1")]).await;
        n2.set_queue_list_for_node(vec![queue("c", "n2")]).await;
        n1.set_queue_list_for_node(vec![]).await;

        assert_eq!(ids(&n2.get_combined_node_list().await), vec!["c"]);
    }

    #[tokio::test]
    async fn test_outage_falls_back_to_local_list() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let n1 = QueueDirectory::new("n1", store.clone());
        let n2 = QueueDirectory::new("n2", store.clone());
        n2.set_queue_list_for_node(vec![queue("c", "n2")]).await;

        store.set_available(false);
        n1.set_queue_list_for_node(vec![queue("a", "n1")]).await;
        assert_eq!(ids(&n1.get_combined_node_list().await), vec!["a"]);

        // next publish after recovery makes n1 visible to everyone
        store.set_available(true);
        n1.set_queue_list_for_node(vec![queue("a", "n1")]).await;
        assert_eq!(ids(&n2.get_combined_node_list().await), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_withdraw_removes_entry() {
        let store = Arc::new(MemoryDirectoryStore::new());
        let n1 = QueueDirectory::new("n1", store.clone());
        let n2 = QueueDirectory::new("n2", store.clone());
        n1.set_queue_list_for_node(vec![queue("a", "n1")]).await;

        n1.withdraw().await;
        assert!(n2.get_combined_node_list().await.is_empty());
    }

    #[tokio::test]
    #[ignore] // needs a live Redis at REDIS_URL
    async fn test_redis_store_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let redis = RedisClient::from_url(&url).await.unwrap();
        let prefix = format!("push:test:{}", uuid::Uuid::new_v4());
        let store = RedisDirectoryStore::new(redis, prefix, 30);

        store.put_node("n1", &[queue("a", "n1")]).await.unwrap();
        let nodes = store.all_nodes().await.unwrap();
        assert_eq!(ids(&nodes["n1"]), vec!["a"]);

        store.remove_node("n1").await.unwrap();
        assert!(store.all_nodes().await.unwrap().is_empty());
    }
}
