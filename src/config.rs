//! # Store Configuration
//!
//! Plain data describing a sharded deployment: named shard connections, the
//! default shard, and the optional sharding policy. Higher layers
//! deserialize these from their YAML/JSON config files; this crate only
//! defines the shapes and their defaults.
//!
//! ```yaml
//! default_shard: shard-a
//! num_history_shards: 4
//! connections:
//!   shard-a: { database: /var/lib/branchdb/a.db }
//!   shard-b: { database: /var/lib/branchdb/b.db, db_shards: 2 }
//! sharding:
//!   history_shard_mapping:
//!     - { name: shard-a, start: 0, end: 2 }
//!     - { name: shard-b, start: 2, end: 4 }
//!   task_list_shards: [shard-a, shard-b]
//! ```
//!
//! The policy is parsed and validated once, at router construction
//! ([`ShardingPolicy`](crate::router::ShardingPolicy)); a policy naming a
//! connection that does not exist fails construction rather than the first
//! request.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration of a sharded history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name of the shard used when no policy routes elsewhere, and for
    /// operations that are inherently single-shard (tree enumeration).
    pub default_shard: String,

    /// Named shard connections the router may dial.
    pub connections: HashMap<String, ShardConnection>,

    /// Optional sharding policy. Absent means everything lands on the
    /// default shard.
    #[serde(default)]
    pub sharding: Option<ShardingPolicyConfig>,

    /// Number of logical history shards higher layers address. Tree
    /// enumeration walks shard ids `0..num_history_shards`.
    #[serde(default = "default_num_history_shards")]
    pub num_history_shards: i64,
}

fn default_num_history_shards() -> i64 {
    1
}

impl StoreConfig {
    /// A single-connection config, the common test and dev shape.
    pub fn single_shard(name: impl Into<String>, connection: ShardConnection) -> Self {
        let name = name.into();
        let mut connections = HashMap::new();
        connections.insert(name.clone(), connection);
        Self {
            default_shard: name,
            connections,
            sharding: None,
            num_history_shards: 1,
        }
    }
}

/// One named backend connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardConnection {
    /// Database file path. `None` opens an in-memory database (tests, dev).
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Number of db shards the SQL backend splits this connection into;
    /// trees are placed by `hash(tree_id) mod db_shards`.
    #[serde(default = "default_db_shards")]
    pub db_shards: usize,
}

fn default_db_shards() -> usize {
    1
}

impl ShardConnection {
    /// An in-memory, single-db-shard connection.
    pub fn in_memory() -> Self {
        Self {
            database: None,
            db_shards: 1,
        }
    }

    /// A file-backed connection.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            database: Some(path.into()),
            db_shards: 1,
        }
    }
}

/// Raw sharding policy as it appears in config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingPolicyConfig {
    /// Ranges of logical history shard ids per connection name. Present and
    /// non-empty means history data is spread over multiple connections.
    #[serde(default)]
    pub history_shard_mapping: Vec<HistoryShardRange>,

    /// Connection names task lists are hashed across. Empty means the
    /// default shard serves all task lists.
    #[serde(default)]
    pub task_list_shards: Vec<String>,
}

/// Routes logical history shards `[start, end)` to one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryShardRange {
    /// Connection name; must exist in [`StoreConfig::connections`].
    pub name: String,
    /// First shard id of the range, inclusive.
    pub start: i64,
    /// Last shard id of the range, exclusive.
    pub end: i64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_shard_config() {
        let cfg = StoreConfig::single_shard("only", ShardConnection::in_memory());
        assert_eq!(cfg.default_shard, "only");
        assert_eq!(cfg.connections.len(), 1);
        assert!(cfg.sharding.is_none());
        assert_eq!(cfg.num_history_shards, 1);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let cfg: StoreConfig = serde_json::from_str(
            r#"{
                "default_shard": "a",
                "connections": { "a": {} }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.num_history_shards, 1);
        let conn = &cfg.connections["a"];
        assert!(conn.database.is_none());
        assert_eq!(conn.db_shards, 1);
    }

    #[test]
    fn test_deserialize_sharded() {
        let cfg: StoreConfig = serde_json::from_str(
            r#"{
                "default_shard": "a",
                "num_history_shards": 4,
                "connections": {
                    "a": { "database": "/tmp/a.db" },
                    "b": { "database": "/tmp/b.db", "db_shards": 2 }
                },
                "sharding": {
                    "history_shard_mapping": [
                        { "name": "a", "start": 0, "end": 2 },
                        { "name": "b", "start": 2, "end": 4 }
                    ],
                    "task_list_shards": ["a", "b"]
                }
            }"#,
        )
        .unwrap();
        let policy = cfg.sharding.unwrap();
        assert_eq!(policy.history_shard_mapping.len(), 2);
        assert_eq!(policy.history_shard_mapping[1].name, "b");
        assert_eq!(policy.task_list_shards, vec!["a", "b"]);
        assert_eq!(cfg.connections["b"].db_shards, 2);
    }
}
