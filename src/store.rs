//! # History Store
//!
//! The core of branchdb: six operations over the branchable history model,
//! generic over the backend a [`ShardedStore`] routes to.
//!
//! - [`append_history_nodes`](HistoryStore::append_history_nodes) — upsert
//!   one event batch as a node, creating the branch atomically when asked
//! - [`read_history_branch`](HistoryStore::read_history_branch) — ordered,
//!   paginated, stale-tolerant reads of one branch range
//! - [`fork_history_branch`](HistoryStore::fork_history_branch) — derive a
//!   new branch's ancestor list and persist its metadata row
//! - [`delete_history_branch`](HistoryStore::delete_history_branch) —
//!   reference-counted deletion across overlapping branches
//! - [`get_history_tree`](HistoryStore::get_history_tree) — all branches of
//!   one tree
//! - [`get_all_history_tree_branches`](HistoryStore::get_all_history_tree_branches)
//!   — global enumeration, walking logical shards
//!
//! ## Forking
//!
//! A fork point must be the first event id of some batch reachable from the
//! source branch, never an id inside a batch. With branch B1 holding nodes
//! `1[1,2] 3[3,4,5] 6[6,7]` and B2 forked from B1 at 6 with native nodes
//! `6[6,7] 8[8]`, the valid fork points on B2 are 3, 6 and 8:
//!
//! ```text
//! fork B3 at 6:  B3.ancestors = [{B1, 1, 6}]            (B2 not referenced)
//! fork B3 at 8:  B3.ancestors = [{B1, 1, 6}, {B2, 6, 8}]
//! ```
//!
//! ## Concurrency
//!
//! Operations are safe from any number of tasks. Writers do not serialize:
//! two appends racing on the same `(branch, node)` both land and the higher
//! transaction id wins at read time. Fork and delete on the same branch are
//! NOT mutually exclusive — callers serialize those at a higher layer.
//! The store performs no retries; `Transient` errors are the caller's to
//! retry.

use std::collections::HashMap;

use tracing::debug;

use crate::backend::{
    BackendConnector, HistoryBackend, NodeDeleteFilter, NodeFilter, NodeRow, TreeFilter, TreeRow,
};
use crate::codec::{self, TreePagePosition};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::router::ShardedStore;
use crate::types::{
    BranchId, BranchInfo, BranchRange, EventBlob, NodeId, ShardId, TreeBranchDetail, TreeId,
    TreeInfo, TxnId, MAX_BRANCH_INFO_BYTES,
};

// =============================================================================
// Requests and Responses
// =============================================================================

/// Append one event batch to a branch.
#[derive(Debug, Clone)]
pub struct AppendHistoryNodesRequest {
    /// Logical shard routing the write.
    pub shard_id: ShardId,
    /// The branch appended to.
    pub branch: BranchInfo,
    /// First event id of the batch; must be at least the branch's begin
    /// node id.
    pub node_id: NodeId,
    /// Write epoch; higher supersedes lower on the same node.
    pub txn_id: TxnId,
    /// The encoded event batch, stored verbatim.
    pub events: EventBlob,
    /// When true, also materialize the branch's tree row atomically with
    /// the node. Used for root branches created by the first append.
    pub is_new_branch: bool,
    /// Info string persisted with a new branch's tree row.
    pub info: String,
}

/// Read a node range of one branch.
///
/// `(last_node_id, last_txn_id)` is the caller's watermark from the
/// previous page; it carries the deduplication state across pages. Start
/// with `(0, 0)` (or anything below the range) on the first page.
#[derive(Debug, Clone)]
pub struct ReadHistoryBranchRequest {
    /// Logical shard routing the read.
    pub shard_id: ShardId,
    /// Tree id.
    pub tree_id: TreeId,
    /// Branch read from; ancestors are NOT followed — issue one read per
    /// ancestor range, informed by
    /// [`get_history_tree`](HistoryStore::get_history_tree).
    pub branch_id: BranchId,
    /// Minimum node id, inclusive.
    pub min_node_id: NodeId,
    /// Maximum node id, exclusive.
    pub max_node_id: NodeId,
    /// Batches per page.
    pub page_size: usize,
    /// Continuation token from the previous response, opaque.
    pub page_token: Option<Vec<u8>>,
    /// Watermark: last node id accepted on a previous page.
    pub last_node_id: NodeId,
    /// Watermark: transaction id of that node.
    pub last_txn_id: TxnId,
}

/// One page of a branch read.
#[derive(Debug, Clone)]
pub struct ReadHistoryBranchResponse {
    /// Accepted event batches, node id ascending, one per distinct node.
    pub batches: Vec<EventBlob>,
    /// Token for the next page; `None` when the range is exhausted.
    pub next_page_token: Option<Vec<u8>>,
    /// Watermark to echo into the next request.
    pub last_node_id: NodeId,
    /// Watermark to echo into the next request.
    pub last_txn_id: TxnId,
    /// Total bytes of the accepted batches, for accounting.
    pub size: usize,
}

impl ReadHistoryBranchResponse {
    /// Builds the follow-up request for the next page, or `None` at the end
    /// of the range.
    pub fn next_request(&self, prev: &ReadHistoryBranchRequest) -> Option<ReadHistoryBranchRequest> {
        let token = self.next_page_token.clone()?;
        let mut next = prev.clone();
        next.page_token = Some(token);
        next.last_node_id = self.last_node_id;
        next.last_txn_id = self.last_txn_id;
        Some(next)
    }
}

/// Fork a new branch off an existing one.
#[derive(Debug, Clone)]
pub struct ForkHistoryBranchRequest {
    /// Logical shard routing the write.
    pub shard_id: ShardId,
    /// The branch forked from.
    pub source: BranchInfo,
    /// First event id the new branch owns natively. Must be the first id of
    /// a batch in the source branch or one of its ancestors, and cannot be
    /// the first node of the tree.
    pub fork_node_id: NodeId,
    /// Id of the branch being created.
    pub new_branch_id: BranchId,
    /// Info string persisted with the new branch.
    pub info: String,
}

/// The forked branch.
#[derive(Debug, Clone)]
pub struct ForkHistoryBranchResponse {
    /// Descriptor of the new branch, ancestors fully derived.
    pub new_branch: BranchInfo,
}

/// Delete one branch and every node row no surviving branch references.
#[derive(Debug, Clone)]
pub struct DeleteHistoryBranchRequest {
    /// Logical shard routing the write.
    pub shard_id: ShardId,
    /// The branch to delete, with its ancestor list.
    pub branch: BranchInfo,
}

/// Fetch all branches of one tree.
#[derive(Debug, Clone)]
pub struct GetHistoryTreeRequest {
    /// Logical shard routing the read.
    pub shard_id: ShardId,
    /// The tree.
    pub tree_id: TreeId,
}

/// All branches of one tree.
#[derive(Debug, Clone)]
pub struct GetHistoryTreeResponse {
    /// Branch descriptors; empty when the tree does not exist.
    pub branches: Vec<BranchInfo>,
}

/// Enumerate every tree branch across the cluster.
#[derive(Debug, Clone)]
pub struct GetAllHistoryTreeBranchesRequest {
    /// Branch rows per page.
    pub page_size: usize,
    /// Continuation token from the previous response, opaque.
    pub page_token: Option<Vec<u8>>,
}

/// One page of global tree enumeration.
#[derive(Debug, Clone)]
pub struct GetAllHistoryTreeBranchesResponse {
    /// Branch details, ordered by `(shard, tree, branch)`.
    pub branches: Vec<TreeBranchDetail>,
    /// Token for the next page; `None` when every shard is exhausted.
    pub next_page_token: Option<Vec<u8>>,
}

// =============================================================================
// The Store
// =============================================================================

/// The history store over a sharded router.
pub struct HistoryStore<C: BackendConnector> {
    router: ShardedStore<C>,
}

impl<C: BackendConnector> HistoryStore<C> {
    /// Builds the store: parses and validates the config's sharding policy
    /// and dials the default shard.
    pub async fn new(config: StoreConfig, connector: C) -> Result<Self> {
        let router = ShardedStore::new(config, connector).await?;
        Ok(Self { router })
    }

    /// The underlying router, for task-list routing and introspection.
    pub fn router(&self) -> &ShardedStore<C> {
        &self.router
    }

    /// Closes every connected shard.
    pub async fn close(&self) {
        self.router.close().await;
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Upserts a batch of events as a single node of a branch.
    ///
    /// Appending above the branch's begin node only — the nodes below it
    /// belong to ancestors. With `is_new_branch`, the branch's tree row is
    /// written atomically with the node so a crash cannot leave a branch
    /// whose ancestors are untraversable.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` — node below the begin node, empty events blob,
    ///   over-long info
    /// - `ConditionFailed` — the exact `(tree, branch, node, txn)` row
    ///   already exists on a backend enforcing uniqueness
    /// - `Transient` — backend I/O
    pub async fn append_history_nodes(&self, request: AppendHistoryNodesRequest) -> Result<()> {
        if request.events.is_empty() {
            return Err(Error::invalid_request("events blob cannot be empty"));
        }
        let begin_node_id = request.branch.begin_node_id();
        if request.node_id < begin_node_id {
            return Err(Error::invalid_request("cannot append to ancestors' nodes"));
        }

        let tree_row = if request.is_new_branch {
            validate_info(&request.info)?;
            Some(TreeRow {
                shard_id: request.shard_id,
                tree_id: request.branch.tree_id,
                branch_id: request.branch.branch_id,
                tree_info: TreeInfo {
                    ancestors: request.branch.ancestors.clone(),
                    created_at_nanos: codec::current_time_nanos(),
                    info: request.info.clone(),
                },
            })
        } else {
            None
        };
        let node_row = NodeRow {
            shard_id: request.shard_id,
            tree_id: request.branch.tree_id,
            branch_id: request.branch.branch_id,
            node_id: request.node_id,
            txn_id: request.txn_id,
            events: request.events,
        };

        let backend = self.router.shard_for_history_shard(request.shard_id).await?;
        backend.insert_tree_and_node(tree_row, node_row).await
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Reads one page of a branch's node range.
    ///
    /// Rows arrive from the backend sorted `(node_id asc, txn_id desc)`;
    /// the walk accepts the first row of each node id and skips stale
    /// retries, carrying the `(last_node_id, last_txn_id)` watermark across
    /// pages. A missing branch reads as an empty range.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` — empty range, zero page size, undecodable token
    /// - `Corruption` — the backend's ordering contract was violated
    /// - `Transient` — backend I/O
    pub async fn read_history_branch(
        &self,
        request: ReadHistoryBranchRequest,
    ) -> Result<ReadHistoryBranchResponse> {
        if request.page_size == 0 {
            return Err(Error::invalid_request("page size must be at least 1"));
        }
        if request.min_node_id >= request.max_node_id {
            return Err(Error::invalid_request(
                "min node id must be below max node id",
            ));
        }

        let backend = self.router.shard_for_history_shard(request.shard_id).await?;

        let mut filter = NodeFilter {
            shard_id: request.shard_id,
            tree_id: request.tree_id,
            branch_id: request.branch_id,
            min_node_id: request.min_node_id,
            max_node_id: request.max_node_id,
            page_size: request.page_size,
            page_token: None,
        };
        if backend.native_paging() {
            filter.page_token = request.page_token.clone().filter(|t| !t.is_empty());
        } else if let Some(token) = request.page_token.as_deref().filter(|t| !t.is_empty()) {
            // resume just past the last node the previous page observed
            filter.min_node_id = codec::decode_node_token(token)?.next();
        }

        let page = backend.select_nodes(filter).await?;
        let page_full = page.rows.len() >= request.page_size;

        let (batches, last_node_id, last_txn_id, size) =
            reduce_node_rows(page.rows, request.last_node_id, request.last_txn_id)?;

        let next_page_token = if backend.native_paging() {
            page.next_page_token.filter(|t| !t.is_empty())
        } else if page_full {
            Some(codec::encode_node_token(last_node_id))
        } else {
            None
        };

        Ok(ReadHistoryBranchResponse {
            batches,
            next_page_token,
            last_node_id,
            last_txn_id,
            size,
        })
    }

    // =========================================================================
    // Fork
    // =========================================================================

    /// Forks a new branch at `fork_node_id` and persists its tree row.
    ///
    /// Two shapes, depending on where the fork point falls:
    ///
    /// - inside an inherited ancestor (`begin >= fork_node_id`): the new
    ///   branch copies the ancestor prefix, truncating the range that
    ///   crosses the fork point — the source branch itself is not
    ///   referenced
    /// - inside the source's native range: the new branch inherits every
    ///   ancestor plus `{source, begin, fork_node_id}`
    ///
    /// Either way the inherited ranges plus the new branch's future appends
    /// cover event ids from 1 contiguously.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` — fork at the first node, over-long info
    /// - `ConditionFailed` — the new branch id already exists in the tree
    /// - `Transient` / `Internal` — backend I/O / impossible row count
    pub async fn fork_history_branch(
        &self,
        request: ForkHistoryBranchRequest,
    ) -> Result<ForkHistoryBranchResponse> {
        if request.fork_node_id <= NodeId::FIRST {
            return Err(Error::invalid_request("cannot fork from the first node"));
        }
        validate_info(&request.info)?;

        let source = &request.source;
        let begin_node_id = source.begin_node_id();
        let mut ancestors = Vec::with_capacity(source.ancestors.len() + 1);

        if begin_node_id >= request.fork_node_id {
            // fork point lies in an inherited range: copy the prefix and
            // truncate the range that crosses it
            for range in &source.ancestors {
                if range.end_node_id >= request.fork_node_id {
                    ancestors.push(BranchRange {
                        branch_id: range.branch_id,
                        begin_node_id: range.begin_node_id,
                        end_node_id: request.fork_node_id,
                    });
                    break;
                }
                ancestors.push(*range);
            }
        } else {
            // fork point lies in the source's native range: inherit
            // everything plus the source itself
            ancestors.extend_from_slice(&source.ancestors);
            ancestors.push(BranchRange {
                branch_id: source.branch_id,
                begin_node_id,
                end_node_id: request.fork_node_id,
            });
        }

        let new_branch = BranchInfo {
            tree_id: source.tree_id,
            branch_id: request.new_branch_id,
            ancestors: ancestors.clone(),
        };
        let tree_row = TreeRow {
            shard_id: request.shard_id,
            tree_id: source.tree_id,
            branch_id: request.new_branch_id,
            tree_info: TreeInfo {
                ancestors,
                created_at_nanos: codec::current_time_nanos(),
                info: request.info.clone(),
            },
        };

        let backend = self.router.shard_for_history_shard(request.shard_id).await?;
        backend.insert_tree(tree_row).await?;

        debug!(
            tree = %source.tree_id,
            source = %source.branch_id,
            new = %request.new_branch_id,
            fork_node = %request.fork_node_id,
            "forked history branch"
        );
        Ok(ForkHistoryBranchResponse { new_branch })
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Deletes a branch: its tree row, and its node rows in every range no
    /// other branch still reaches.
    ///
    /// The live-reference map is derived on demand from the tree's branch
    /// rows — the maximum `end_node_id` any ancestor list records per
    /// branch. The ranges to delete are walked leaf-to-root; once a range
    /// is still referenced, everything above it is transitively referenced
    /// too, so deletion trims to the referenced end and stops.
    ///
    /// # Errors
    ///
    /// - `NotFound` — the tree has no branch rows
    /// - `Transient` — backend I/O
    pub async fn delete_history_branch(&self, request: DeleteHistoryBranchRequest) -> Result<()> {
        let branch = &request.branch;
        let begin_node_id = branch.begin_node_id();

        // ranges this branch holds, leaf last: inherited ones, then its own
        let mut ranges: Vec<(BranchId, NodeId)> = branch
            .ancestors
            .iter()
            .map(|range| (range.branch_id, range.begin_node_id))
            .collect();
        ranges.push((branch.branch_id, begin_node_id));

        let tree = self
            .get_history_tree(GetHistoryTreeRequest {
                shard_id: request.shard_id,
                tree_id: branch.tree_id,
            })
            .await?;
        if tree.branches.is_empty() {
            return Err(Error::not_found(format!(
                "tree {} has no branches",
                branch.tree_id
            )));
        }

        let referenced = max_referred_node_ids(&tree.branches);

        let tree_filter = TreeFilter {
            shard_id: request.shard_id,
            tree_id: branch.tree_id,
            branch_id: Some(branch.branch_id),
        };
        let mut node_filters = Vec::new();
        for (branch_id, range_begin) in ranges.iter().rev() {
            match referenced.get(branch_id) {
                Some(max_end) => {
                    // still inherited by someone: trim to the referenced end
                    // and stop — every range above is referenced through it
                    node_filters.push(NodeDeleteFilter {
                        shard_id: request.shard_id,
                        tree_id: branch.tree_id,
                        branch_id: *branch_id,
                        min_node_id: *max_end,
                    });
                    break;
                }
                None => {
                    node_filters.push(NodeDeleteFilter {
                        shard_id: request.shard_id,
                        tree_id: branch.tree_id,
                        branch_id: *branch_id,
                        min_node_id: *range_begin,
                    });
                }
            }
        }

        let backend = self.router.shard_for_history_shard(request.shard_id).await?;
        backend.delete_tree_and_nodes(tree_filter, node_filters).await?;

        debug!(
            tree = %branch.tree_id,
            branch = %branch.branch_id,
            "deleted history branch"
        );
        Ok(())
    }

    // =========================================================================
    // Tree Reads
    // =========================================================================

    /// Returns every branch of one tree. A missing tree reads as empty.
    pub async fn get_history_tree(
        &self,
        request: GetHistoryTreeRequest,
    ) -> Result<GetHistoryTreeResponse> {
        let backend = self.router.shard_for_history_shard(request.shard_id).await?;
        let rows = backend
            .select_tree(TreeFilter {
                shard_id: request.shard_id,
                tree_id: request.tree_id,
                branch_id: None,
            })
            .await?;

        let branches = rows
            .into_iter()
            .map(|row| BranchInfo {
                tree_id: request.tree_id,
                branch_id: row.branch_id,
                ancestors: row.tree_info.ancestors,
            })
            .collect();
        Ok(GetHistoryTreeResponse { branches })
    }

    /// Enumerates every tree branch, walking logical shards
    /// `0..num_history_shards` through the token.
    ///
    /// When a shard's page comes back under-full the enumeration advances
    /// to the next shard and keeps filling, so exhausting one shard never
    /// ends the listing early.
    ///
    /// # Errors
    ///
    /// - `Unsupported` — history data is spread across multiple store
    ///   shards; enumeration would silently miss rows
    /// - `InvalidRequest` — zero page size, undecodable token
    pub async fn get_all_history_tree_branches(
        &self,
        request: GetAllHistoryTreeBranchesRequest,
    ) -> Result<GetAllHistoryTreeBranchesResponse> {
        if self.router.has_sharded_history() {
            return Err(Error::unsupported(
                "tree enumeration is not available when history is sharded across connections",
            ));
        }
        if request.page_size == 0 {
            return Err(Error::invalid_request("page size must be at least 1"));
        }

        let (mut shard_id, mut after) = match request.page_token.as_deref().filter(|t| !t.is_empty())
        {
            Some(token) => {
                let pos = codec::decode_tree_token(token)?;
                (pos.shard_id, Some((pos.tree_id, pos.branch_id)))
            }
            None => (ShardId::from_raw(0), None),
        };

        let backend = self.router.default_shard().await?;
        let num_shards = self.router.num_history_shards();
        let mut branches: Vec<TreeBranchDetail> = Vec::with_capacity(request.page_size);

        loop {
            let remaining = request.page_size - branches.len();
            let rows = backend.select_all_trees(shard_id, after, remaining).await?;
            let got = rows.len();
            for row in rows.iter() {
                branches.push(TreeBranchDetail {
                    tree_id: row.tree_id,
                    branch_id: row.branch_id,
                    fork_time_nanos: row.tree_info.created_at_nanos,
                    info: row.tree_info.info.clone(),
                });
            }

            if got >= remaining {
                // page filled inside this shard; resume here next time
                let last = rows.last().expect("full page implies rows");
                let token = codec::encode_tree_token(&TreePagePosition {
                    shard_id,
                    tree_id: last.tree_id,
                    branch_id: last.branch_id,
                });
                return Ok(GetAllHistoryTreeBranchesResponse {
                    branches,
                    next_page_token: Some(token),
                });
            }

            // shard exhausted: move to the next one
            shard_id = ShardId::from_raw(shard_id.as_raw() + 1);
            after = None;
            if shard_id.as_raw() >= num_shards {
                return Ok(GetAllHistoryTreeBranchesResponse {
                    branches,
                    next_page_token: None,
                });
            }
        }
    }
}

// =============================================================================
// Read Walk
// =============================================================================

/// Walks backend rows sorted `(node_id asc, txn_id desc)` and keeps one
/// authoritative batch per node id.
///
/// A row with a lower transaction id than the watermark is a stale retry:
/// skipped, but still moving `last_node_id` forward so the cursor makes
/// progress even when a whole page is stale. Rows that move node ids
/// backwards, or repeat an accepted node id without a lower transaction id,
/// violate the backend's ordering contract and surface as `Corruption`.
fn reduce_node_rows(
    rows: Vec<NodeRow>,
    mut last_node_id: NodeId,
    mut last_txn_id: TxnId,
) -> Result<(Vec<EventBlob>, NodeId, TxnId, usize)> {
    let mut batches = Vec::new();
    let mut size = 0usize;

    for row in rows {
        if row.txn_id < last_txn_id {
            // stale retry of an earlier batch:
            //   smaller node id  -> impossible, rows are sorted
            //   same node id     -> the accepted row already superseded it
            //   larger node id   -> a superseded batch; skip, but advance
            //                       the cursor so pagination progresses
            if row.node_id < last_node_id {
                return Err(Error::corruption("nodeID cannot decrease"));
            }
            if row.node_id > last_node_id {
                last_node_id = row.node_id;
            }
            continue;
        }

        if row.node_id < last_node_id {
            return Err(Error::corruption("nodeID cannot decrease"));
        }
        if row.node_id == last_node_id {
            // the first row of a node id carries its highest txn id; seeing
            // the node again without a lower txn id breaks the sort contract
            return Err(Error::corruption("same nodeID must have smaller txnID"));
        }

        last_node_id = row.node_id;
        last_txn_id = row.txn_id;
        size += row.events.len();
        batches.push(row.events);
    }

    Ok((batches, last_node_id, last_txn_id, size))
}

/// Maximum node id each branch is referenced up to, over every ancestor
/// list in the tree.
fn max_referred_node_ids(branches: &[BranchInfo]) -> HashMap<BranchId, NodeId> {
    let mut referenced = HashMap::new();
    for branch in branches {
        for range in &branch.ancestors {
            let entry = referenced.entry(range.branch_id).or_insert(range.end_node_id);
            if *entry < range.end_node_id {
                *entry = range.end_node_id;
            }
        }
    }
    referenced
}

fn validate_info(info: &str) -> Result<()> {
    if info.len() > MAX_BRANCH_INFO_BYTES {
        return Err(Error::invalid_request(format!(
            "branch info is {} bytes, limit is {}",
            info.len(),
            MAX_BRANCH_INFO_BYTES
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
