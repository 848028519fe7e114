//! # Backend Driver Contract
//!
//! This module defines what any storage backend must implement to serve the
//! history store: row and filter types plus the [`HistoryBackend`] trait.
//! Two implementations ship with the crate:
//!
//! - [`sqlite`](crate::sqlite): tabular SQL, trees placed on db shards by a
//!   deterministic hash
//! - [`memory`](crate::memory): partition-oriented, rows co-resident per
//!   `(shard_id, tree_id)` partition
//!
//! ## Contract Highlights
//!
//! - `select_nodes` returns rows sorted by `(node_id asc, txn_id desc)` so a
//!   reader that has accepted a node id knows every later row with the same
//!   node id is a stale retry.
//! - `insert_tree_and_node` is atomic: when a tree row is supplied, either
//!   both rows land or neither does.
//! - `delete_nodes` may be chunked; it reports rows affected (or
//!   [`UNKNOWN_ROWS_AFFECTED`]) so the caller can keep going until the range
//!   is drained.
//! - Backend-native errors are translated into the crate taxonomy inside the
//!   backend; nothing else sees them.
//!
//! Every method is a suspension point. Cancellation is the future-drop kind
//! and deadlines are the caller's (`tokio::time::timeout` around the call);
//! backends must not hold locks across their own I/O.

use async_trait::async_trait;

use crate::config::ShardConnection;
use crate::error::Result;
use crate::types::{BranchId, EventBlob, NodeId, ShardId, TreeId, TreeInfo, TxnId};

// =============================================================================
// Rows
// =============================================================================

/// One node row: a single event batch on a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRow {
    /// Logical shard the row belongs to.
    pub shard_id: ShardId,
    /// Tree id.
    pub tree_id: TreeId,
    /// Branch id.
    pub branch_id: BranchId,
    /// First event id of the batch.
    pub node_id: NodeId,
    /// Write epoch; the highest per `(branch, node)` wins.
    pub txn_id: TxnId,
    /// The encoded event batch, stored verbatim.
    pub events: EventBlob,
}

/// One tree row: branch metadata (ancestors, creation time, info).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeRow {
    /// Logical shard the row belongs to.
    pub shard_id: ShardId,
    /// Tree id.
    pub tree_id: TreeId,
    /// Branch id this metadata row describes.
    pub branch_id: BranchId,
    /// The branch's ancestors, creation time, and info string.
    pub tree_info: TreeInfo,
}

// =============================================================================
// Filters
// =============================================================================

/// Selects node rows of one branch within a node-id range.
#[derive(Debug, Clone)]
pub struct NodeFilter {
    /// Logical shard.
    pub shard_id: ShardId,
    /// Tree id.
    pub tree_id: TreeId,
    /// Branch id.
    pub branch_id: BranchId,
    /// Minimum node id, inclusive.
    pub min_node_id: NodeId,
    /// Maximum node id, exclusive.
    pub max_node_id: NodeId,
    /// Upper bound on rows returned.
    pub page_size: usize,
    /// Backend-native continuation token from a previous page, if the
    /// backend produces them (see [`HistoryBackend::native_paging`]).
    pub page_token: Option<Vec<u8>>,
}

/// Selects node rows of one branch from a minimum node id to the end.
#[derive(Debug, Clone)]
pub struct NodeDeleteFilter {
    /// Logical shard.
    pub shard_id: ShardId,
    /// Tree id.
    pub tree_id: TreeId,
    /// Branch id whose rows are deleted.
    pub branch_id: BranchId,
    /// Delete rows with `node_id >= min_node_id`.
    pub min_node_id: NodeId,
}

/// Selects tree rows of one tree, optionally narrowed to one branch.
#[derive(Debug, Clone)]
pub struct TreeFilter {
    /// Logical shard.
    pub shard_id: ShardId,
    /// Tree id.
    pub tree_id: TreeId,
    /// When set, only this branch's row.
    pub branch_id: Option<BranchId>,
}

/// A page of node rows plus an optional backend-native continuation token.
#[derive(Debug, Clone)]
pub struct NodePage {
    /// Rows sorted `(node_id asc, txn_id desc)`.
    pub rows: Vec<NodeRow>,
    /// Non-empty when the backend knows more rows follow.
    pub next_page_token: Option<Vec<u8>>,
}

/// Reported when a backend cannot count deleted rows.
///
/// Deletion loops treat this as "assume drained".
pub const UNKNOWN_ROWS_AFFECTED: i64 = -1;

/// Rows deleted per `delete_nodes` call before the caller must loop.
pub const NODE_DELETE_BATCH: usize = 1000;

// =============================================================================
// The Driver Trait
// =============================================================================

/// Operations any storage backend must implement.
///
/// Implementations translate their native errors into the crate taxonomy:
/// duplicate keys become `ConditionFailed`, I/O becomes `Transient`, and
/// undecodable stored blobs become `Corruption`.
#[async_trait]
pub trait HistoryBackend: Send + Sync + 'static {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// True when `select_nodes` produces its own continuation tokens.
    ///
    /// The store hands the caller's page token through opaquely on such
    /// backends; on the rest it decodes the token itself and rewrites
    /// `min_node_id`.
    fn native_paging(&self) -> bool {
        false
    }

    /// Inserts one node row.
    ///
    /// A backend that enforces `(shard, tree, branch, node, txn)` uniqueness
    /// rejects exact duplicates with `ConditionFailed`; an upserting backend
    /// overwrites in place. Either way the read path's transaction-id
    /// deduplication is what makes the winner authoritative.
    async fn insert_node(&self, row: NodeRow) -> Result<()>;

    /// Inserts one tree row. Duplicate `(shard, tree, branch)` maps to
    /// `ConditionFailed`.
    async fn insert_tree(&self, row: TreeRow) -> Result<()>;

    /// Atomically inserts the node row and, when present, the tree row.
    ///
    /// SQL backends wrap a transaction; partition-oriented backends apply a
    /// single-partition batch (`shard_id` + `tree_id` keep both rows in one
    /// partition).
    async fn insert_tree_and_node(&self, tree: Option<TreeRow>, node: NodeRow) -> Result<()>;

    /// Reads node rows matching the filter, sorted `(node_id asc, txn_id
    /// desc)`, at most `page_size` of them.
    async fn select_nodes(&self, filter: NodeFilter) -> Result<NodePage>;

    /// Reads every tree row of one tree.
    async fn select_tree(&self, filter: TreeFilter) -> Result<Vec<TreeRow>>;

    /// Enumerates tree rows of one logical shard, ordered by `(tree_id,
    /// branch_id)`, starting strictly after `after` when given.
    ///
    /// Backends that cannot enumerate without missing rows must fail
    /// `Unsupported` instead of returning partial data.
    async fn select_all_trees(
        &self,
        shard_id: ShardId,
        after: Option<(TreeId, BranchId)>,
        page_size: usize,
    ) -> Result<Vec<TreeRow>>;

    /// Deletes one tree row.
    async fn delete_tree_row(&self, filter: TreeFilter) -> Result<()>;

    /// Deletes up to [`NODE_DELETE_BATCH`] node rows matching the filter and
    /// reports how many went, or [`UNKNOWN_ROWS_AFFECTED`].
    async fn delete_nodes(&self, filter: NodeDeleteFilter) -> Result<i64>;

    /// Deletes one tree row and every node row selected by the filters, as
    /// one backend operation.
    async fn delete_tree_and_nodes(
        &self,
        tree: TreeFilter,
        nodes: Vec<NodeDeleteFilter>,
    ) -> Result<()>;

    /// Releases connections and stops workers. Operations after close are
    /// undefined; in practice they fail `Transient`.
    async fn close(&self);
}

// =============================================================================
// Connector
// =============================================================================

/// Dials one named shard connection; consumed by the router.
///
/// Separated from [`HistoryBackend`] so the router can lazily connect shards
/// without knowing backend construction details.
#[async_trait]
pub trait BackendConnector: Send + Sync + 'static {
    /// The backend this connector produces.
    type Backend: HistoryBackend;

    /// Opens a backend for the named shard.
    async fn connect(&self, shard_name: &str, connection: &ShardConnection)
        -> Result<Self::Backend>;
}
