//! # Sharded Store Router
//!
//! [`ShardedStore`] maps logical shards onto named backend connections and
//! owns those connections for the life of the store. Store operations
//! borrow a connection per call; nothing above the router dials or closes
//! anything.
//!
//! ## Connection Table
//!
//! Connections are dialed lazily with double-checked locking: a read-locked
//! fast path, then a write lock with a re-check before dialing, so a burst
//! of first requests to a shard dials it exactly once. The default shard is
//! dialed eagerly at construction — a store that cannot reach its default
//! shard should fail fast, not on the first request.
//!
//! ## Policy
//!
//! Two policy functions route to shard names:
//!
//! - history: a logical history shard id falls into one of the configured
//!   `[start, end)` ranges
//! - task lists: `(domain_id, task_list, task_type)` hashes onto the
//!   configured task-list shard list
//!
//! The policy is parsed and validated once at construction; a policy entry
//! naming an unknown connection fails construction.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::backend::{BackendConnector, HistoryBackend};
use crate::config::{HistoryShardRange, StoreConfig};
use crate::error::{Error, Result};
use crate::types::ShardId;

// =============================================================================
// Sharding Policy
// =============================================================================

/// Validated routing policy, parsed from
/// [`ShardingPolicyConfig`](crate::config::ShardingPolicyConfig).
#[derive(Debug, Clone)]
pub struct ShardingPolicy {
    history_ranges: Vec<HistoryShardRange>,
    task_list_shards: Vec<String>,
}

impl ShardingPolicy {
    /// Parses and validates the policy embedded in `config`.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` when a policy entry names a connection that does not
    /// exist or a range is inverted.
    pub fn parse(config: &StoreConfig) -> Result<Self> {
        let (history_ranges, task_list_shards) = match &config.sharding {
            Some(policy) => (
                policy.history_shard_mapping.clone(),
                policy.task_list_shards.clone(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        for range in &history_ranges {
            if !config.connections.contains_key(&range.name) {
                return Err(Error::invalid_request(format!(
                    "history shard mapping names unknown connection '{}'",
                    range.name
                )));
            }
            if range.start >= range.end {
                return Err(Error::invalid_request(format!(
                    "history shard range [{}, {}) for '{}' is empty",
                    range.start, range.end, range.name
                )));
            }
        }
        for name in &task_list_shards {
            if !config.connections.contains_key(name) {
                return Err(Error::invalid_request(format!(
                    "task list shard list names unknown connection '{}'",
                    name
                )));
            }
        }

        Ok(Self {
            history_ranges,
            task_list_shards,
        })
    }

    /// True when history data is spread over more than the default shard.
    ///
    /// Global tree enumeration is refused on such deployments: it would see
    /// only one connection's rows.
    pub fn has_sharded_history(&self) -> bool {
        !self.history_ranges.is_empty()
    }

    /// Resolves the connection name serving a logical history shard.
    fn history_shard_name<'a>(&'a self, default: &'a str, shard_id: ShardId) -> Result<&'a str> {
        if self.history_ranges.is_empty() {
            return Ok(default);
        }
        let id = shard_id.as_raw();
        for range in &self.history_ranges {
            if id >= range.start && id < range.end {
                return Ok(&range.name);
            }
        }
        Err(Error::invalid_request(format!(
            "history shard {} is not mapped to any store shard",
            id
        )))
    }

    /// Resolves the connection name serving a task list.
    fn task_list_shard_name<'a>(
        &'a self,
        default: &'a str,
        domain_id: &str,
        task_list: &str,
        task_type: i32,
    ) -> &'a str {
        if self.task_list_shards.is_empty() {
            return default;
        }
        let mut key = Vec::with_capacity(domain_id.len() + task_list.len() + 6);
        key.extend_from_slice(domain_id.as_bytes());
        key.push(0);
        key.extend_from_slice(task_list.as_bytes());
        key.push(0);
        key.extend_from_slice(&task_type.to_le_bytes());
        let hash = xxhash_rust::xxh3::xxh3_64(&key);
        let index = (hash % self.task_list_shards.len() as u64) as usize;
        &self.task_list_shards[index]
    }
}

// =============================================================================
// Router
// =============================================================================

/// A store that may have one or more shards.
///
/// Cloneable handles are not provided; share the store behind an `Arc`.
pub struct ShardedStore<C: BackendConnector> {
    config: StoreConfig,
    connector: C,
    policy: ShardingPolicy,
    connected: RwLock<HashMap<String, Arc<C::Backend>>>,
}

impl<C: BackendConnector> std::fmt::Debug for ShardedStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedStore")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<C: BackendConnector> ShardedStore<C> {
    /// Builds the router: validates the policy and dials the default shard.
    pub async fn new(config: StoreConfig, connector: C) -> Result<Self> {
        if !config.connections.contains_key(&config.default_shard) {
            return Err(Error::invalid_request(format!(
                "default shard '{}' has no connection entry",
                config.default_shard
            )));
        }
        let policy = ShardingPolicy::parse(&config)?;

        let store = Self {
            config,
            connector,
            policy,
            connected: RwLock::new(HashMap::new()),
        };
        let default = store.config.default_shard.clone();
        store.get_shard(&default).await?;
        Ok(store)
    }

    /// The backend serving a logical history shard.
    pub async fn shard_for_history_shard(&self, shard_id: ShardId) -> Result<Arc<C::Backend>> {
        let name = self
            .policy
            .history_shard_name(&self.config.default_shard, shard_id)?
            .to_string();
        self.get_shard(&name).await
    }

    /// The backend serving a task list.
    pub async fn shard_for_task_list(
        &self,
        domain_id: &str,
        task_list: &str,
        task_type: i32,
    ) -> Result<Arc<C::Backend>> {
        let name = self
            .policy
            .task_list_shard_name(&self.config.default_shard, domain_id, task_list, task_type)
            .to_string();
        self.get_shard(&name).await
    }

    /// The eagerly connected default shard.
    pub async fn default_shard(&self) -> Result<Arc<C::Backend>> {
        let default = self.config.default_shard.clone();
        self.get_shard(&default).await
    }

    /// True when the history policy spreads data over multiple connections.
    pub fn has_sharded_history(&self) -> bool {
        self.policy.has_sharded_history()
    }

    /// Number of logical history shards the deployment addresses.
    pub fn num_history_shards(&self) -> i64 {
        self.config.num_history_shards
    }

    /// Closes every connected shard. Operations after close re-dial, so
    /// close last.
    pub async fn close(&self) {
        let mut connected = self.connected.write().await;
        for (name, backend) in connected.drain() {
            warn!(shard = %name, backend = backend.name(), "closing store shard");
            backend.close().await;
        }
    }

    /// Read-locked fast path, then write lock + re-check before dialing.
    async fn get_shard(&self, shard_name: &str) -> Result<Arc<C::Backend>> {
        {
            let connected = self.connected.read().await;
            if let Some(backend) = connected.get(shard_name) {
                return Ok(Arc::clone(backend));
            }
        }

        let connection = self.config.connections.get(shard_name).ok_or_else(|| {
            Error::internal(format!("unknown store shard name: {}", shard_name))
        })?;

        let mut connected = self.connected.write().await;
        if let Some(backend) = connected.get(shard_name) {
            // another task dialed while we waited for the write lock
            return Ok(Arc::clone(backend));
        }

        info!(shard = %shard_name, "connecting to store shard");
        let backend = Arc::new(self.connector.connect(shard_name, connection).await?);
        connected.insert(shard_name.to_string(), Arc::clone(&backend));
        info!(shard = %shard_name, backend = backend.name(), "connected to store shard");
        Ok(backend)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShardConnection, ShardingPolicyConfig};
    use crate::memory::{MemoryBackend, MemoryConnector};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts dials so the tests can observe double-checked locking.
    #[derive(Default)]
    struct CountingConnector {
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BackendConnector for CountingConnector {
        type Backend = MemoryBackend;

        async fn connect(
            &self,
            shard_name: &str,
            connection: &ShardConnection,
        ) -> Result<Self::Backend> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            MemoryConnector.connect(shard_name, connection).await
        }
    }

    fn two_shard_config() -> StoreConfig {
        let mut connections = HashMap::new();
        connections.insert("a".to_string(), ShardConnection::in_memory());
        connections.insert("b".to_string(), ShardConnection::in_memory());
        StoreConfig {
            default_shard: "a".to_string(),
            connections,
            sharding: Some(ShardingPolicyConfig {
                history_shard_mapping: vec![
                    HistoryShardRange {
                        name: "a".to_string(),
                        start: 0,
                        end: 2,
                    },
                    HistoryShardRange {
                        name: "b".to_string(),
                        start: 2,
                        end: 4,
                    },
                ],
                task_list_shards: vec!["a".to_string(), "b".to_string()],
            }),
            num_history_shards: 4,
        }
    }

    #[tokio::test]
    async fn test_unknown_policy_name_fails_construction() {
        let mut config = two_shard_config();
        config
            .sharding
            .as_mut()
            .unwrap()
            .history_shard_mapping
            .push(HistoryShardRange {
                name: "ghost".to_string(),
                start: 4,
                end: 8,
            });
        let err = ShardedStore::new(config, MemoryConnector).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_empty_range_fails_construction() {
        let mut config = two_shard_config();
        config.sharding.as_mut().unwrap().history_shard_mapping[0].end = 0;
        let err = ShardedStore::new(config, MemoryConnector).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_unmapped_history_shard_is_invalid_request() {
        let store = ShardedStore::new(two_shard_config(), MemoryConnector).await.unwrap();
        let err = store
            .shard_for_history_shard(ShardId::from_raw(99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_history_ranges_route_and_connect_lazily() {
        let dials = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            dials: Arc::clone(&dials),
        };
        let store = ShardedStore::new(two_shard_config(), connector).await.unwrap();
        // default shard dialed eagerly
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        store.shard_for_history_shard(ShardId::from_raw(1)).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1, "shard 1 reuses the default connection");

        store.shard_for_history_shard(ShardId::from_raw(3)).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2, "shard 3 dials 'b'");

        store.shard_for_history_shard(ShardId::from_raw(3)).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2, "repeat hits the fast path");
    }

    #[tokio::test]
    async fn test_concurrent_first_use_dials_once() {
        let dials = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            dials: Arc::clone(&dials),
        };
        let store = Arc::new(ShardedStore::new(two_shard_config(), connector).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.shard_for_history_shard(ShardId::from_raw(3)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // one dial for the default, one for 'b'
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_task_list_routing_is_deterministic() {
        let store = ShardedStore::new(two_shard_config(), MemoryConnector).await.unwrap();
        let first = store
            .shard_for_task_list("domain-1", "orders", 0)
            .await
            .unwrap();
        for _ in 0..5 {
            let again = store
                .shard_for_task_list("domain-1", "orders", 0)
                .await
                .unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
    }

    #[tokio::test]
    async fn test_no_policy_routes_everything_to_default() {
        let config = StoreConfig::single_shard("only", ShardConnection::in_memory());
        let store = ShardedStore::new(config, MemoryConnector).await.unwrap();
        assert!(!store.has_sharded_history());

        let default = store.default_shard().await.unwrap();
        let by_history = store
            .shard_for_history_shard(ShardId::from_raw(7))
            .await
            .unwrap();
        let by_task_list = store.shard_for_task_list("d", "tl", 1).await.unwrap();
        assert!(Arc::ptr_eq(&default, &by_history));
        assert!(Arc::ptr_eq(&default, &by_task_list));
    }

    #[tokio::test]
    async fn test_close_drains_the_connection_table() {
        let dials = Arc::new(AtomicUsize::new(0));
        let connector = CountingConnector {
            dials: Arc::clone(&dials),
        };
        let store = ShardedStore::new(two_shard_config(), connector).await.unwrap();
        store.close().await;
        // a later call re-dials; the table was drained
        store.default_shard().await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }
}
