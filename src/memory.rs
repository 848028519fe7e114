//! # Partition-Oriented Backend
//!
//! An in-memory [`HistoryBackend`] organized the way a partitioned
//! key-value store lays history out: one partition per `(shard_id,
//! tree_id)`, holding both the tree's metadata rows and its node rows, so
//! every atomic operation touches exactly one partition.
//!
//! ```text
//! partitions: BTreeMap<(shard_id, tree_id), Partition>
//!
//! Partition
//! ├── trees: BTreeMap<branch_id, TreeRow>
//! └── nodes: BTreeMap<(branch_id, node_id asc, txn_id desc), NodeRow>
//! ```
//!
//! The node map's key ordering bakes in the read contract: iterating a
//! branch range yields rows by `node_id` ascending with the highest
//! `txn_id` first within a node. `select_nodes` produces **native**
//! continuation tokens (a position cursor), which exercises the store's
//! opaque-token path the same way a real partition store's paging state
//! does.
//!
//! Writes take the single partition-map lock for the duration of the
//! mutation; that lock is the stand-in for the logged batch — there is no
//! I/O inside it. Node inserts upsert in place, so replaying a suffix of
//! writes is a no-op.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::backend::{
    BackendConnector, HistoryBackend, NodeDeleteFilter, NodeFilter, NodePage, NodeRow, TreeFilter,
    TreeRow, NODE_DELETE_BATCH,
};
use crate::config::ShardConnection;
use crate::error::{Error, Result};
use crate::types::{BranchId, NodeId, ShardId, TreeId, TxnId};

/// Version byte of the native node cursor.
const CURSOR_VERSION: u8 = 1;

// =============================================================================
// Keys
// =============================================================================

/// Node map key: orders rows `(branch, node asc, txn desc)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct NodeKey {
    branch_id: BranchId,
    node_id: NodeId,
    txn_desc: Reverse<i64>,
}

impl NodeKey {
    fn new(branch_id: BranchId, node_id: NodeId, txn_id: TxnId) -> Self {
        Self {
            branch_id,
            node_id,
            txn_desc: Reverse(txn_id.as_raw()),
        }
    }

    /// The smallest key of `(branch, node)`: the row with the highest txn.
    fn first_of_node(branch_id: BranchId, node_id: NodeId) -> Self {
        Self {
            branch_id,
            node_id,
            txn_desc: Reverse(i64::MAX),
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    trees: BTreeMap<BranchId, TreeRow>,
    nodes: BTreeMap<NodeKey, NodeRow>,
}

impl Partition {
    fn is_empty(&self) -> bool {
        self.trees.is_empty() && self.nodes.is_empty()
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Partition-oriented in-memory backend.
///
/// Suitable for tests and single-process deployments; the partition layout
/// and native paging mirror what a real partitioned store would do.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    partitions: RwLock<BTreeMap<(ShardId, TreeId), Partition>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<(ShardId, TreeId), Partition>> {
        self.partitions.read().expect("partition map poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<(ShardId, TreeId), Partition>> {
        self.partitions.write().expect("partition map poisoned")
    }
}

fn encode_cursor(node_id: NodeId, txn_id: TxnId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(17);
    buf.push(CURSOR_VERSION);
    buf.extend_from_slice(&node_id.as_raw().to_le_bytes());
    buf.extend_from_slice(&txn_id.as_raw().to_le_bytes());
    buf
}

fn decode_cursor(token: &[u8]) -> Result<(NodeId, TxnId)> {
    if token.len() != 17 || token[0] != CURSOR_VERSION {
        return Err(Error::invalid_request("invalid node page token"));
    }
    let node = i64::from_le_bytes(token[1..9].try_into().unwrap());
    let txn = i64::from_le_bytes(token[9..17].try_into().unwrap());
    Ok((NodeId::from_raw(node), TxnId::from_raw(txn)))
}

#[async_trait]
impl HistoryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn native_paging(&self) -> bool {
        true
    }

    async fn insert_node(&self, row: NodeRow) -> Result<()> {
        let mut partitions = self.write();
        let partition = partitions.entry((row.shard_id, row.tree_id)).or_default();
        let key = NodeKey::new(row.branch_id, row.node_id, row.txn_id);
        partition.nodes.insert(key, row);
        Ok(())
    }

    async fn insert_tree(&self, row: TreeRow) -> Result<()> {
        let mut partitions = self.write();
        let partition = partitions.entry((row.shard_id, row.tree_id)).or_default();
        if partition.trees.contains_key(&row.branch_id) {
            return Err(Error::condition_failed(format!(
                "branch {} already exists in tree {}",
                row.branch_id, row.tree_id
            )));
        }
        partition.trees.insert(row.branch_id, row);
        Ok(())
    }

    async fn insert_tree_and_node(&self, tree: Option<TreeRow>, node: NodeRow) -> Result<()> {
        let mut partitions = self.write();
        let partition = partitions.entry((node.shard_id, node.tree_id)).or_default();
        if let Some(tree_row) = tree {
            if partition.trees.contains_key(&tree_row.branch_id) {
                return Err(Error::condition_failed(format!(
                    "branch {} already exists in tree {}",
                    tree_row.branch_id, tree_row.tree_id
                )));
            }
            partition.trees.insert(tree_row.branch_id, tree_row);
        }
        let key = NodeKey::new(node.branch_id, node.node_id, node.txn_id);
        partition.nodes.insert(key, node);
        Ok(())
    }

    async fn select_nodes(&self, filter: NodeFilter) -> Result<NodePage> {
        let partitions = self.read();
        let partition = match partitions.get(&(filter.shard_id, filter.tree_id)) {
            Some(p) => p,
            None => {
                return Ok(NodePage {
                    rows: Vec::new(),
                    next_page_token: None,
                })
            }
        };

        let lower = match &filter.page_token {
            Some(token) => {
                let (node_id, txn_id) = decode_cursor(token)?;
                Bound::Excluded(NodeKey::new(filter.branch_id, node_id, txn_id))
            }
            None => Bound::Included(NodeKey::first_of_node(filter.branch_id, filter.min_node_id)),
        };
        let upper = Bound::Excluded(NodeKey::first_of_node(filter.branch_id, filter.max_node_id));

        let mut rows = Vec::new();
        let mut more = false;
        for (_, row) in partition.nodes.range((lower, upper)) {
            if rows.len() >= filter.page_size {
                more = true;
                break;
            }
            rows.push(row.clone());
        }

        let next_page_token = if more {
            let last = rows.last().expect("page-full implies rows");
            Some(encode_cursor(last.node_id, last.txn_id))
        } else {
            None
        };

        Ok(NodePage {
            rows,
            next_page_token,
        })
    }

    async fn select_tree(&self, filter: TreeFilter) -> Result<Vec<TreeRow>> {
        let partitions = self.read();
        let partition = match partitions.get(&(filter.shard_id, filter.tree_id)) {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        let rows = match filter.branch_id {
            Some(branch_id) => partition.trees.get(&branch_id).cloned().into_iter().collect(),
            None => partition.trees.values().cloned().collect(),
        };
        Ok(rows)
    }

    async fn select_all_trees(
        &self,
        shard_id: ShardId,
        after: Option<(TreeId, BranchId)>,
        page_size: usize,
    ) -> Result<Vec<TreeRow>> {
        let partitions = self.read();
        let lower = (shard_id, TreeId::from_bytes([0u8; 16]));
        let upper = (shard_id, TreeId::from_bytes([0xffu8; 16]));

        let mut rows = Vec::new();
        'partitions: for ((_, tree_id), partition) in
            partitions.range((Bound::Included(lower), Bound::Included(upper)))
        {
            for (branch_id, row) in &partition.trees {
                if let Some((after_tree, after_branch)) = after {
                    if (*tree_id, *branch_id) <= (after_tree, after_branch) {
                        continue;
                    }
                }
                rows.push(row.clone());
                if rows.len() >= page_size {
                    break 'partitions;
                }
            }
        }
        Ok(rows)
    }

    async fn delete_tree_row(&self, filter: TreeFilter) -> Result<()> {
        let branch_id = filter
            .branch_id
            .ok_or_else(|| Error::invalid_request("tree row delete requires a branch id"))?;
        let mut partitions = self.write();
        if let Some(partition) = partitions.get_mut(&(filter.shard_id, filter.tree_id)) {
            partition.trees.remove(&branch_id);
            if partition.is_empty() {
                partitions.remove(&(filter.shard_id, filter.tree_id));
            }
        }
        Ok(())
    }

    async fn delete_nodes(&self, filter: NodeDeleteFilter) -> Result<i64> {
        let mut partitions = self.write();
        let partition = match partitions.get_mut(&(filter.shard_id, filter.tree_id)) {
            Some(p) => p,
            None => return Ok(0),
        };
        let deleted = delete_branch_range(partition, filter.branch_id, filter.min_node_id, Some(NODE_DELETE_BATCH));
        if partition.is_empty() {
            partitions.remove(&(filter.shard_id, filter.tree_id));
        }
        Ok(deleted as i64)
    }

    async fn delete_tree_and_nodes(
        &self,
        tree: TreeFilter,
        nodes: Vec<NodeDeleteFilter>,
    ) -> Result<()> {
        let branch_id = tree
            .branch_id
            .ok_or_else(|| Error::invalid_request("tree row delete requires a branch id"))?;
        let mut partitions = self.write();
        if let Some(partition) = partitions.get_mut(&(tree.shard_id, tree.tree_id)) {
            partition.trees.remove(&branch_id);
            for filter in &nodes {
                delete_branch_range(partition, filter.branch_id, filter.min_node_id, None);
            }
            if partition.is_empty() {
                partitions.remove(&(tree.shard_id, tree.tree_id));
            }
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Removes node rows of `branch_id` with `node_id >= min_node_id`, up to
/// `limit` rows when given. Returns the number removed.
fn delete_branch_range(
    partition: &mut Partition,
    branch_id: BranchId,
    min_node_id: NodeId,
    limit: Option<usize>,
) -> usize {
    let lower = Bound::Included(NodeKey::first_of_node(branch_id, min_node_id));
    let upper = Bound::Excluded(NodeKey::first_of_node(branch_id, NodeId::from_raw(i64::MAX)));
    let mut keys: Vec<NodeKey> = partition
        .nodes
        .range((lower, upper))
        .map(|(k, _)| *k)
        .collect();
    if let Some(limit) = limit {
        keys.truncate(limit);
    }
    for key in &keys {
        partition.nodes.remove(key);
    }
    keys.len()
}

// =============================================================================
// Connector
// =============================================================================

/// Connector producing a fresh [`MemoryBackend`] per shard name.
#[derive(Debug, Default, Clone)]
pub struct MemoryConnector;

#[async_trait]
impl BackendConnector for MemoryConnector {
    type Backend = MemoryBackend;

    async fn connect(
        &self,
        _shard_name: &str,
        _connection: &ShardConnection,
    ) -> Result<Self::Backend> {
        Ok(MemoryBackend::new())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::types::{Encoding, EventBlob, HistoryEvent, TreeInfo};

    fn blob(marker: &str) -> EventBlob {
        codec::encode_event_batch(&[HistoryEvent::new(1, marker.as_bytes().to_vec())], Encoding::Compact)
            .unwrap()
    }

    fn node_row(
        shard: i64,
        tree: TreeId,
        branch: BranchId,
        node: i64,
        txn: i64,
        marker: &str,
    ) -> NodeRow {
        NodeRow {
            shard_id: ShardId::from_raw(shard),
            tree_id: tree,
            branch_id: branch,
            node_id: NodeId::from_raw(node),
            txn_id: TxnId::from_raw(txn),
            events: blob(marker),
        }
    }

    fn tree_row(shard: i64, tree: TreeId, branch: BranchId) -> TreeRow {
        TreeRow {
            shard_id: ShardId::from_raw(shard),
            tree_id: tree,
            branch_id: branch,
            tree_info: TreeInfo {
                ancestors: vec![],
                created_at_nanos: 1,
                info: String::new(),
            },
        }
    }

    fn filter(shard: i64, tree: TreeId, branch: BranchId, min: i64, max: i64, page: usize) -> NodeFilter {
        NodeFilter {
            shard_id: ShardId::from_raw(shard),
            tree_id: tree,
            branch_id: branch,
            min_node_id: NodeId::from_raw(min),
            max_node_id: NodeId::from_raw(max),
            page_size: page,
            page_token: None,
        }
    }

    #[tokio::test]
    async fn test_select_orders_node_asc_txn_desc() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        let branch = BranchId::generate();

        backend.insert_node(node_row(0, tree, branch, 3, 100, "a")).await.unwrap();
        backend.insert_node(node_row(0, tree, branch, 1, 50, "b")).await.unwrap();
        backend.insert_node(node_row(0, tree, branch, 3, 200, "c")).await.unwrap();

        let page = backend.select_nodes(filter(0, tree, branch, 1, 10, 10)).await.unwrap();
        let got: Vec<(i64, i64)> = page
            .rows
            .iter()
            .map(|r| (r.node_id.as_raw(), r.txn_id.as_raw()))
            .collect();
        assert_eq!(got, vec![(1, 50), (3, 200), (3, 100)]);
        assert!(page.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_native_paging_resumes_mid_node() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        let branch = BranchId::generate();

        for (node, txn) in [(1i64, 10i64), (3, 20), (3, 10), (6, 30)] {
            backend
                .insert_node(node_row(0, tree, branch, node, txn, "x"))
                .await
                .unwrap();
        }

        let mut token = None;
        let mut seen = Vec::new();
        loop {
            let mut f = filter(0, tree, branch, 1, 100, 1);
            f.page_token = token.clone();
            let page = backend.select_nodes(f).await.unwrap();
            seen.extend(
                page.rows
                    .iter()
                    .map(|r| (r.node_id.as_raw(), r.txn_id.as_raw())),
            );
            token = page.next_page_token;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(seen, vec![(1, 10), (3, 20), (3, 10), (6, 30)]);
    }

    #[tokio::test]
    async fn test_max_node_is_exclusive() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        let branch = BranchId::generate();
        backend.insert_node(node_row(0, tree, branch, 5, 1, "x")).await.unwrap();
        backend.insert_node(node_row(0, tree, branch, 6, 1, "y")).await.unwrap();

        let page = backend.select_nodes(filter(0, tree, branch, 1, 6, 10)).await.unwrap();
        assert_eq!(page.rows.len(), 1);
        assert_eq!(page.rows[0].node_id.as_raw(), 5);
    }

    #[tokio::test]
    async fn test_insert_node_upserts_same_txn() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        let branch = BranchId::generate();
        backend.insert_node(node_row(0, tree, branch, 1, 5, "first")).await.unwrap();
        backend.insert_node(node_row(0, tree, branch, 1, 5, "first")).await.unwrap();

        let page = backend.select_nodes(filter(0, tree, branch, 1, 10, 10)).await.unwrap();
        assert_eq!(page.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_insert_tree_duplicate_fails() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        let branch = BranchId::generate();
        backend.insert_tree(tree_row(0, tree, branch)).await.unwrap();
        let err = backend.insert_tree(tree_row(0, tree, branch)).await.unwrap_err();
        assert!(matches!(err, Error::ConditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_atomic_insert_rolls_nothing_on_tree_conflict() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        let branch = BranchId::generate();
        backend.insert_tree(tree_row(0, tree, branch)).await.unwrap();

        let err = backend
            .insert_tree_and_node(Some(tree_row(0, tree, branch)), node_row(0, tree, branch, 1, 1, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConditionFailed { .. }));

        // the node must not have landed
        let page = backend.select_nodes(filter(0, tree, branch, 1, 10, 10)).await.unwrap();
        assert!(page.rows.is_empty());
    }

    #[tokio::test]
    async fn test_delete_nodes_respects_min_and_branch() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        let b1 = BranchId::generate();
        let b2 = BranchId::generate();
        for node in [1i64, 3, 6, 8] {
            backend.insert_node(node_row(0, tree, b1, node, 1, "x")).await.unwrap();
        }
        backend.insert_node(node_row(0, tree, b2, 6, 1, "y")).await.unwrap();

        let deleted = backend
            .delete_nodes(NodeDeleteFilter {
                shard_id: ShardId::from_raw(0),
                tree_id: tree,
                branch_id: b1,
                min_node_id: NodeId::from_raw(6),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 2);

        let b1_rows = backend.select_nodes(filter(0, tree, b1, 1, 100, 10)).await.unwrap();
        assert_eq!(b1_rows.rows.len(), 2);
        let b2_rows = backend.select_nodes(filter(0, tree, b2, 1, 100, 10)).await.unwrap();
        assert_eq!(b2_rows.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_select_all_trees_pages_in_order() {
        let backend = MemoryBackend::new();
        let shard = ShardId::from_raw(0);
        let mut expected = Vec::new();
        for _ in 0..3 {
            let tree = TreeId::generate();
            for _ in 0..2 {
                let branch = BranchId::generate();
                backend.insert_tree(tree_row(0, tree, branch)).await.unwrap();
            }
        }
        // collect everything in one go to learn the order
        let all = backend.select_all_trees(shard, None, 100).await.unwrap();
        assert_eq!(all.len(), 6);
        for row in &all {
            expected.push((row.tree_id, row.branch_id));
        }

        // page two at a time using the cursor
        let mut after = None;
        let mut seen = Vec::new();
        loop {
            let page = backend.select_all_trees(shard, after, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            for row in &page {
                seen.push((row.tree_id, row.branch_id));
            }
            let last = page.last().unwrap();
            after = Some((last.tree_id, last.branch_id));
            if page.len() < 2 {
                break;
            }
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_select_all_trees_filters_by_shard() {
        let backend = MemoryBackend::new();
        let tree = TreeId::generate();
        backend.insert_tree(tree_row(0, tree, BranchId::generate())).await.unwrap();
        backend.insert_tree(tree_row(1, TreeId::generate(), BranchId::generate())).await.unwrap();

        let shard0 = backend.select_all_trees(ShardId::from_raw(0), None, 10).await.unwrap();
        assert_eq!(shard0.len(), 1);
        assert_eq!(shard0[0].tree_id, tree);
    }
}
