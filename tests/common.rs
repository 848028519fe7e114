#![allow(dead_code)]

use std::path::PathBuf;

use branchdb::codec::encode_event_batch;
use branchdb::{
    AppendHistoryNodesRequest, BranchId, BranchInfo, Encoding, EventBlob, HistoryEvent,
    HistoryStore, MemoryConnector, NodeId, ReadHistoryBranchRequest, ShardConnection, ShardId,
    SqliteConnector, StoreConfig, TreeId, TxnId,
};

pub async fn sqlite_store(name: &str) -> (tempfile::TempDir, HistoryStore<SqliteConnector>) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path: PathBuf = dir.path().join(name);
    let config = StoreConfig::single_shard("default", ShardConnection::at_path(path));
    let store = HistoryStore::new(config, SqliteConnector)
        .await
        .expect("open sqlite-backed store");
    (dir, store)
}

pub async fn memory_store() -> HistoryStore<MemoryConnector> {
    let config = StoreConfig::single_shard("default", ShardConnection::in_memory());
    HistoryStore::new(config, MemoryConnector)
        .await
        .expect("open memory-backed store")
}

/// A batch of `count` events with contiguous ids starting at
/// `first_event_id`.
pub fn batch(first_event_id: i64, count: usize) -> EventBlob {
    let events: Vec<HistoryEvent> = (0..count as i64)
        .map(|i| HistoryEvent::new(first_event_id + i, format!("event-{}", first_event_id + i)))
        .collect();
    encode_event_batch(&events, Encoding::Compact).expect("encode batch")
}

/// A batch whose payload also carries a marker, to tell overwrites apart.
pub fn marked_batch(first_event_id: i64, count: usize, marker: &str) -> EventBlob {
    let events: Vec<HistoryEvent> = (0..count as i64)
        .map(|i| {
            HistoryEvent::new(
                first_event_id + i,
                format!("{}-{}", marker, first_event_id + i),
            )
        })
        .collect();
    encode_event_batch(&events, Encoding::Compact).expect("encode batch")
}

pub fn append_req(
    branch: &BranchInfo,
    node: i64,
    txn: i64,
    events: EventBlob,
    is_new_branch: bool,
) -> AppendHistoryNodesRequest {
    AppendHistoryNodesRequest {
        shard_id: ShardId::from_raw(0),
        branch: branch.clone(),
        node_id: NodeId::from_raw(node),
        txn_id: TxnId::from_raw(txn),
        events,
        is_new_branch,
        info: "integration test".to_string(),
    }
}

pub fn read_req(branch: &BranchInfo, min: i64, max: i64, page_size: usize) -> ReadHistoryBranchRequest {
    ReadHistoryBranchRequest {
        shard_id: ShardId::from_raw(0),
        tree_id: branch.tree_id,
        branch_id: branch.branch_id,
        min_node_id: NodeId::from_raw(min),
        max_node_id: NodeId::from_raw(max),
        page_size,
        page_token: None,
        last_node_id: NodeId::from_raw(0),
        last_txn_id: TxnId::from_raw(0),
    }
}

/// A read request against an inherited ancestor range: same tree, the
/// ancestor's branch id, bounded by the range.
pub fn read_ancestor_req(
    tree_id: TreeId,
    ancestor: BranchId,
    min: i64,
    max: i64,
    page_size: usize,
) -> ReadHistoryBranchRequest {
    ReadHistoryBranchRequest {
        shard_id: ShardId::from_raw(0),
        tree_id,
        branch_id: ancestor,
        min_node_id: NodeId::from_raw(min),
        max_node_id: NodeId::from_raw(max),
        page_size,
        page_token: None,
        last_node_id: NodeId::from_raw(0),
        last_txn_id: TxnId::from_raw(0),
    }
}

pub fn root_branch() -> BranchInfo {
    BranchInfo::root(TreeId::generate(), BranchId::generate())
}
