//! End-to-end branch lifecycle against the SQL backend: root creation,
//! stale overwrites, both fork shapes, and append preconditions.

mod common;

use branchdb::{
    BranchId, BranchRange, DeleteHistoryBranchRequest, Error, ForkHistoryBranchRequest,
    GetHistoryTreeRequest, NodeId, ShardId, TxnId,
};

#[tokio::test]
async fn root_append_and_read_back() {
    let (_dir, store) = common::sqlite_store("root.db").await;
    let b1 = common::root_branch();

    store
        .append_history_nodes(common::append_req(&b1, 1, 100, common::batch(1, 2), true))
        .await
        .unwrap();
    store
        .append_history_nodes(common::append_req(&b1, 3, 101, common::batch(3, 3), false))
        .await
        .unwrap();

    let resp = store
        .read_history_branch(common::read_req(&b1, 1, 6, 10))
        .await
        .unwrap();
    assert_eq!(resp.batches.len(), 2);
    assert_eq!(resp.batches[0], common::batch(1, 2));
    assert_eq!(resp.batches[1], common::batch(3, 3));
    assert_eq!(resp.last_node_id, NodeId::from_raw(3));
    assert_eq!(resp.last_txn_id, TxnId::from_raw(101));
    assert!(resp.next_page_token.is_none());
}

#[tokio::test]
async fn stale_overwrite_loses_to_higher_txn() {
    let (_dir, store) = common::sqlite_store("stale.db").await;
    let b1 = common::root_branch();

    store
        .append_history_nodes(common::append_req(&b1, 1, 100, common::batch(1, 2), true))
        .await
        .unwrap();
    store
        .append_history_nodes(common::append_req(
            &b1,
            3,
            101,
            common::marked_batch(3, 3, "winner"),
            false,
        ))
        .await
        .unwrap();
    // a retry from an earlier attempt arrives late with a lower txn id
    store
        .append_history_nodes(common::append_req(
            &b1,
            3,
            99,
            common::marked_batch(3, 2, "loser"),
            false,
        ))
        .await
        .unwrap();

    let resp = store
        .read_history_branch(common::read_req(&b1, 1, 6, 10))
        .await
        .unwrap();
    assert_eq!(resp.batches.len(), 2);
    assert_eq!(resp.batches[1], common::marked_batch(3, 3, "winner"));
    assert_eq!(resp.last_txn_id, TxnId::from_raw(101));
}

#[tokio::test]
async fn exact_duplicate_append_is_condition_failed() {
    let (_dir, store) = common::sqlite_store("dup.db").await;
    let b1 = common::root_branch();

    let req = common::append_req(&b1, 1, 100, common::batch(1, 2), true);
    store.append_history_nodes(req).await.unwrap();

    // same (tree, branch, node, txn) again, without the tree row this time
    let err = store
        .append_history_nodes(common::append_req(&b1, 1, 100, common::batch(1, 2), false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConditionFailed { .. }));
}

/// The worked fork example. B1 holds 1[1,2] 3[3,4,5] 6[6,7]; B2 forked
/// from B1 at 6 holds 6[6,7] 8[8].
async fn build_example(
    store: &branchdb::HistoryStore<branchdb::SqliteConnector>,
) -> (branchdb::BranchInfo, branchdb::BranchInfo) {
    let b1 = common::root_branch();
    store
        .append_history_nodes(common::append_req(&b1, 1, 1, common::batch(1, 2), true))
        .await
        .unwrap();
    store
        .append_history_nodes(common::append_req(&b1, 3, 2, common::batch(3, 3), false))
        .await
        .unwrap();
    store
        .append_history_nodes(common::append_req(&b1, 6, 3, common::batch(6, 2), false))
        .await
        .unwrap();

    let b2 = store
        .fork_history_branch(ForkHistoryBranchRequest {
            shard_id: ShardId::from_raw(0),
            source: b1.clone(),
            fork_node_id: NodeId::from_raw(6),
            new_branch_id: BranchId::generate(),
            info: "first reset".to_string(),
        })
        .await
        .unwrap()
        .new_branch;
    store
        .append_history_nodes(common::append_req(&b2, 6, 4, common::batch(6, 2), false))
        .await
        .unwrap();
    store
        .append_history_nodes(common::append_req(&b2, 8, 5, common::batch(8, 1), false))
        .await
        .unwrap();
    (b1, b2)
}

#[tokio::test]
async fn fork_at_ancestor_node_references_only_the_root() {
    let (_dir, store) = common::sqlite_store("fork_ancestor.db").await;
    let (b1, b2) = build_example(&store).await;

    let b3 = store
        .fork_history_branch(ForkHistoryBranchRequest {
            shard_id: ShardId::from_raw(0),
            source: b2.clone(),
            fork_node_id: NodeId::from_raw(6),
            new_branch_id: BranchId::generate(),
            info: "second reset".to_string(),
        })
        .await
        .unwrap()
        .new_branch;

    assert_eq!(
        b3.ancestors,
        vec![BranchRange {
            branch_id: b1.branch_id,
            begin_node_id: NodeId::from_raw(1),
            end_node_id: NodeId::from_raw(6),
        }],
        "B2 is not referenced when forking at an inherited node"
    );

    store
        .append_history_nodes(common::append_req(&b3, 6, 6, common::batch(6, 4), false))
        .await
        .unwrap();
    let own = store
        .read_history_branch(common::read_req(&b3, 6, 10, 10))
        .await
        .unwrap();
    assert_eq!(own.batches, vec![common::batch(6, 4)]);
}

#[tokio::test]
async fn fork_at_native_node_references_both_branches() {
    let (_dir, store) = common::sqlite_store("fork_native.db").await;
    let (b1, b2) = build_example(&store).await;

    let b3 = store
        .fork_history_branch(ForkHistoryBranchRequest {
            shard_id: ShardId::from_raw(0),
            source: b2.clone(),
            fork_node_id: NodeId::from_raw(8),
            new_branch_id: BranchId::generate(),
            info: "second reset".to_string(),
        })
        .await
        .unwrap()
        .new_branch;

    assert_eq!(
        b3.ancestors,
        vec![
            BranchRange {
                branch_id: b1.branch_id,
                begin_node_id: NodeId::from_raw(1),
                end_node_id: NodeId::from_raw(6),
            },
            BranchRange {
                branch_id: b2.branch_id,
                begin_node_id: NodeId::from_raw(6),
                end_node_id: NodeId::from_raw(8),
            },
        ]
    );

    store
        .append_history_nodes(common::append_req(&b3, 8, 6, common::batch(8, 2), false))
        .await
        .unwrap();
    let err = store
        .append_history_nodes(common::append_req(&b3, 7, 7, common::batch(7, 1), false))
        .await
        .unwrap_err();
    match err {
        Error::InvalidRequest { msg } => assert_eq!(msg, "cannot append to ancestors' nodes"),
        other => panic!("expected InvalidRequest, got {:?}", other),
    }
}

#[tokio::test]
async fn append_into_inherited_range_is_rejected() {
    let (_dir, store) = common::sqlite_store("precondition.db").await;
    let (_b1, b2) = build_example(&store).await;

    let err = store
        .append_history_nodes(common::append_req(&b2, 5, 10, common::batch(5, 1), false))
        .await
        .unwrap_err();
    match err {
        Error::InvalidRequest { msg } => assert_eq!(msg, "cannot append to ancestors' nodes"),
        other => panic!("expected InvalidRequest, got {:?}", other),
    }
}

#[tokio::test]
async fn reading_a_forked_branch_walks_ancestor_ranges() {
    let (_dir, store) = common::sqlite_store("walk.db").await;
    let (_b1, b2) = build_example(&store).await;

    // the store reads one branch at a time; the caller walks the ancestor
    // list from the tree metadata
    let tree = store
        .get_history_tree(GetHistoryTreeRequest {
            shard_id: ShardId::from_raw(0),
            tree_id: b2.tree_id,
        })
        .await
        .unwrap();
    let stored_b2 = tree
        .branches
        .iter()
        .find(|b| b.branch_id == b2.branch_id)
        .expect("forked branch is in the tree");
    assert_eq!(stored_b2.ancestors, b2.ancestors);

    let mut batches = Vec::new();
    for range in &stored_b2.ancestors {
        let resp = store
            .read_history_branch(common::read_ancestor_req(
                b2.tree_id,
                range.branch_id,
                range.begin_node_id.as_raw(),
                range.end_node_id.as_raw(),
                10,
            ))
            .await
            .unwrap();
        batches.extend(resp.batches);
    }
    let own = store
        .read_history_branch(common::read_req(&b2, 6, 100, 10))
        .await
        .unwrap();
    batches.extend(own.batches);

    assert_eq!(
        batches,
        vec![
            common::batch(1, 2),
            common::batch(3, 3),
            common::batch(6, 2),
            common::batch(8, 1),
        ]
    );
}

#[tokio::test]
async fn sqlite_pagination_resumes_from_node_token() {
    let (_dir, store) = common::sqlite_store("paging.db").await;
    let b1 = common::root_branch();
    for i in 0..5i64 {
        let node = 1 + 2 * i;
        store
            .append_history_nodes(common::append_req(
                &b1,
                node,
                100 + i,
                common::batch(node, 2),
                i == 0,
            ))
            .await
            .unwrap();
    }

    let mut req = common::read_req(&b1, 1, 100, 2);
    let mut collected = Vec::new();
    let mut pages = 0;
    loop {
        let resp = store.read_history_branch(req.clone()).await.unwrap();
        collected.extend(resp.batches.clone());
        pages += 1;
        match resp.next_request(&req) {
            Some(next) => req = next,
            None => break,
        }
    }
    assert!(pages >= 3, "five nodes at page size two take several pages");
    assert_eq!(collected.len(), 5);
    for (i, blob) in collected.iter().enumerate() {
        assert_eq!(*blob, common::batch(1 + 2 * i as i64, 2));
    }
}

#[tokio::test]
async fn delete_of_missing_tree_is_not_found() {
    let (_dir, store) = common::sqlite_store("missing.db").await;
    let err = store
        .delete_history_branch(DeleteHistoryBranchRequest {
            shard_id: ShardId::from_raw(0),
            branch: common::root_branch(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}
