//! # SQL Backend
//!
//! A [`HistoryBackend`] over SQLite. Trees are placed on **db shards** — N
//! independent database files per connection — by a deterministic hash of
//! the tree id, so every operation on one tree lands on exactly one file.
//!
//! ## Schema
//!
//! ```text
//! history_node (shard_id, tree_id, branch_id, node_id, txn_id,
//!               data, data_encoding)
//!              PRIMARY KEY (shard_id, tree_id, branch_id, node_id, txn_id)
//!
//! history_tree (shard_id, tree_id, branch_id, data, data_encoding)
//!              PRIMARY KEY (shard_id, tree_id, branch_id)
//! ```
//!
//! Node selects return `(node_id asc, txn_id desc)`, which is the whole
//! read contract: the first row of a node id carries the winning
//! transaction id. The node primary key makes an exact duplicate append a
//! constraint violation, surfaced as `ConditionFailed`.
//!
//! ## Threading
//!
//! `rusqlite::Connection` is `!Sync`, so each db shard gets a dedicated
//! worker thread owning its connection. Async callers talk to workers
//! through a bounded request channel with oneshot replies:
//!
//! ```text
//! async caller ── mpsc ──► worker thread (db shard 0, owns Connection)
//!              ── mpsc ──► worker thread (db shard 1, owns Connection)
//! ```
//!
//! rusqlite errors are translated to the crate taxonomy here and nowhere
//! else: constraint violations become `ConditionFailed`, undecodable stored
//! rows become `Corruption`, everything else becomes `Transient`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use crate::backend::{
    BackendConnector, HistoryBackend, NodeDeleteFilter, NodeFilter, NodePage, NodeRow, TreeFilter,
    TreeRow, NODE_DELETE_BATCH,
};
use crate::codec;
use crate::config::ShardConnection;
use crate::error::{Error, Result};
use crate::types::{BranchId, Encoding, EventBlob, NodeId, ShardId, TreeId, TxnId};

// =============================================================================
// Configuration
// =============================================================================

/// Size of each db shard's request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// DDL
// =============================================================================

const CREATE_HISTORY_NODE: &str = r#"
CREATE TABLE IF NOT EXISTS history_node (
    shard_id      INTEGER NOT NULL,
    tree_id       BLOB NOT NULL,
    branch_id     BLOB NOT NULL,
    node_id       INTEGER NOT NULL,
    txn_id        INTEGER NOT NULL,
    data          BLOB NOT NULL,
    data_encoding INTEGER NOT NULL,
    PRIMARY KEY (shard_id, tree_id, branch_id, node_id, txn_id)
)
"#;

const CREATE_HISTORY_TREE: &str = r#"
CREATE TABLE IF NOT EXISTS history_tree (
    shard_id      INTEGER NOT NULL,
    tree_id       BLOB NOT NULL,
    branch_id     BLOB NOT NULL,
    data          BLOB NOT NULL,
    data_encoding INTEGER NOT NULL,
    PRIMARY KEY (shard_id, tree_id, branch_id)
)
"#;

// =============================================================================
// Error Translation
// =============================================================================

/// Translates a rusqlite error once, at this boundary.
fn map_sqlite_error(op: &str, err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(inner, _) = &err {
        if inner.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::condition_failed(format!("{}: row already exists", op));
        }
    }
    Error::transient(format!("{}: {}", op, err))
}

fn id_from_column(op: &str, bytes: Vec<u8>) -> Result<[u8; 16]> {
    bytes
        .try_into()
        .map_err(|_| Error::corruption(format!("{}: id column is not 16 bytes", op)))
}

// =============================================================================
// Worker Protocol
// =============================================================================

enum DbRequest {
    InsertNode {
        row: NodeRow,
        resp: oneshot::Sender<Result<()>>,
    },
    InsertTree {
        row: TreeRow,
        resp: oneshot::Sender<Result<()>>,
    },
    InsertTreeAndNode {
        tree: Option<TreeRow>,
        node: NodeRow,
        resp: oneshot::Sender<Result<()>>,
    },
    SelectNodes {
        filter: NodeFilter,
        resp: oneshot::Sender<Result<NodePage>>,
    },
    SelectTree {
        filter: TreeFilter,
        resp: oneshot::Sender<Result<Vec<TreeRow>>>,
    },
    SelectAllTrees {
        shard_id: ShardId,
        after: Option<(TreeId, BranchId)>,
        page_size: usize,
        resp: oneshot::Sender<Result<Vec<TreeRow>>>,
    },
    DeleteTreeRow {
        filter: TreeFilter,
        resp: oneshot::Sender<Result<()>>,
    },
    DeleteNodes {
        filter: NodeDeleteFilter,
        resp: oneshot::Sender<Result<i64>>,
    },
    DeleteTreeAndNodes {
        tree: TreeFilter,
        nodes: Vec<NodeDeleteFilter>,
        resp: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

// =============================================================================
// Backend
// =============================================================================

/// SQLite-backed history backend with hash-placed db shards.
pub struct SqliteBackend {
    db_shards: Vec<mpsc::Sender<DbRequest>>,
}

impl SqliteBackend {
    /// Opens the backend described by `connection`: one worker per db
    /// shard, schema initialized on each.
    ///
    /// With `db_shards > 1` and a file path, shard `i` lives at
    /// `<path>.<i>`; an in-memory connection opens independent in-memory
    /// databases.
    pub fn open(connection: &ShardConnection) -> Result<Self> {
        let count = connection.db_shards.max(1);
        let mut db_shards = Vec::with_capacity(count);
        for index in 0..count {
            let path = connection
                .database
                .as_ref()
                .map(|p| db_shard_path(p, index, count));
            let conn = open_connection(path.as_deref())?;
            let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
            std::thread::Builder::new()
                .name(format!("branchdb-sqlite-{}", index))
                .spawn(move || run_db_shard(conn, rx))
                .map_err(|e| Error::transient(format!("spawn db shard worker: {}", e)))?;
            db_shards.push(tx);
        }
        Ok(Self { db_shards })
    }

    /// The worker owning `tree_id`, by `xxh3(tree_id) mod N`.
    fn shard_for(&self, tree_id: &TreeId) -> &mpsc::Sender<DbRequest> {
        let index = db_shard_index(tree_id, self.db_shards.len());
        &self.db_shards[index]
    }

    async fn dispatch<T>(
        &self,
        shard: &mpsc::Sender<DbRequest>,
        request: DbRequest,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        shard
            .send(request)
            .await
            .map_err(|_| Error::transient("history db shard worker unavailable"))?;
        rx.await
            .map_err(|_| Error::transient("history db shard worker dropped the reply"))?
    }
}

/// Deterministic placement of a tree on a db shard.
fn db_shard_index(tree_id: &TreeId, count: usize) -> usize {
    (xxhash_rust::xxh3::xxh3_64(tree_id.as_bytes()) % count as u64) as usize
}

fn db_shard_path(path: &Path, index: usize, count: usize) -> PathBuf {
    if count == 1 {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.{}", path.display(), index))
    }
}

fn open_connection(path: Option<&Path>) -> Result<Connection> {
    let conn = match path {
        Some(path) => Connection::open(path)
            .map_err(|e| Error::transient(format!("open {}: {}", path.display(), e)))?,
        None => Connection::open_in_memory()
            .map_err(|e| Error::transient(format!("open in-memory db: {}", e)))?,
    };
    if path.is_some() {
        // WAL lets readers on other connections see a consistent snapshot
        // while a worker commits.
        conn.execute_batch("PRAGMA journal_mode = WAL")
            .map_err(|e| map_sqlite_error("set journal_mode", e))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")
            .map_err(|e| map_sqlite_error("set synchronous", e))?;
    }
    conn.execute_batch(&format!("{};\n{};", CREATE_HISTORY_NODE, CREATE_HISTORY_TREE))
        .map_err(|e| map_sqlite_error("init schema", e))?;
    Ok(conn)
}

#[async_trait]
impl HistoryBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn insert_node(&self, row: NodeRow) -> Result<()> {
        let shard = self.shard_for(&row.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::InsertNode { row, resp: tx }, rx).await
    }

    async fn insert_tree(&self, row: TreeRow) -> Result<()> {
        let shard = self.shard_for(&row.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::InsertTree { row, resp: tx }, rx).await
    }

    async fn insert_tree_and_node(&self, tree: Option<TreeRow>, node: NodeRow) -> Result<()> {
        let shard = self.shard_for(&node.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::InsertTreeAndNode { tree, node, resp: tx }, rx)
            .await
    }

    async fn select_nodes(&self, filter: NodeFilter) -> Result<NodePage> {
        let shard = self.shard_for(&filter.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::SelectNodes { filter, resp: tx }, rx).await
    }

    async fn select_tree(&self, filter: TreeFilter) -> Result<Vec<TreeRow>> {
        let shard = self.shard_for(&filter.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::SelectTree { filter, resp: tx }, rx).await
    }

    async fn select_all_trees(
        &self,
        shard_id: ShardId,
        after: Option<(TreeId, BranchId)>,
        page_size: usize,
    ) -> Result<Vec<TreeRow>> {
        // Enumeration over hash-placed db shards would interleave trees from
        // independent files with no global order to resume from.
        if self.db_shards.len() > 1 {
            return Err(Error::unsupported(
                "tree enumeration is not available with multiple db shards",
            ));
        }
        let shard = &self.db_shards[0];
        let (tx, rx) = oneshot::channel();
        self.dispatch(
            shard,
            DbRequest::SelectAllTrees {
                shard_id,
                after,
                page_size,
                resp: tx,
            },
            rx,
        )
        .await
    }

    async fn delete_tree_row(&self, filter: TreeFilter) -> Result<()> {
        let shard = self.shard_for(&filter.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::DeleteTreeRow { filter, resp: tx }, rx).await
    }

    async fn delete_nodes(&self, filter: NodeDeleteFilter) -> Result<i64> {
        let shard = self.shard_for(&filter.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::DeleteNodes { filter, resp: tx }, rx).await
    }

    async fn delete_tree_and_nodes(
        &self,
        tree: TreeFilter,
        nodes: Vec<NodeDeleteFilter>,
    ) -> Result<()> {
        let shard = self.shard_for(&tree.tree_id);
        let (tx, rx) = oneshot::channel();
        self.dispatch(shard, DbRequest::DeleteTreeAndNodes { tree, nodes, resp: tx }, rx)
            .await
    }

    async fn close(&self) {
        for shard in &self.db_shards {
            let _ = shard.send(DbRequest::Shutdown).await;
        }
    }
}

// =============================================================================
// Worker Loop
// =============================================================================

fn run_db_shard(mut conn: Connection, mut rx: mpsc::Receiver<DbRequest>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            DbRequest::InsertNode { row, resp } => {
                let _ = resp.send(insert_node(&conn, &row));
            }
            DbRequest::InsertTree { row, resp } => {
                let _ = resp.send(insert_tree(&conn, &row));
            }
            DbRequest::InsertTreeAndNode { tree, node, resp } => {
                let _ = resp.send(insert_tree_and_node(&mut conn, tree.as_ref(), &node));
            }
            DbRequest::SelectNodes { filter, resp } => {
                let _ = resp.send(select_nodes(&conn, &filter));
            }
            DbRequest::SelectTree { filter, resp } => {
                let _ = resp.send(select_tree(&conn, &filter));
            }
            DbRequest::SelectAllTrees {
                shard_id,
                after,
                page_size,
                resp,
            } => {
                let _ = resp.send(select_all_trees(&conn, shard_id, after, page_size));
            }
            DbRequest::DeleteTreeRow { filter, resp } => {
                let _ = resp.send(delete_tree_row(&conn, &filter));
            }
            DbRequest::DeleteNodes { filter, resp } => {
                let _ = resp.send(delete_nodes_chunk(&conn, &filter));
            }
            DbRequest::DeleteTreeAndNodes { tree, nodes, resp } => {
                let _ = resp.send(delete_tree_and_nodes(&mut conn, &tree, &nodes));
            }
            DbRequest::Shutdown => break,
        }
    }
}

// =============================================================================
// SQL Operations
// =============================================================================

fn insert_node_stmt(conn: &Connection, row: &NodeRow) -> Result<()> {
    let affected = conn
        .execute(
            "INSERT INTO history_node
                 (shard_id, tree_id, branch_id, node_id, txn_id, data, data_encoding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.shard_id.as_raw(),
                row.tree_id.as_bytes().as_slice(),
                row.branch_id.as_bytes().as_slice(),
                row.node_id.as_raw(),
                row.txn_id.as_raw(),
                row.events.data.as_slice(),
                row.events.encoding.tag(),
            ],
        )
        .map_err(|e| map_sqlite_error("insert history node", e))?;
    if affected != 1 {
        return Err(Error::internal(format!(
            "expected 1 node row to be affected, got {}",
            affected
        )));
    }
    Ok(())
}

fn insert_tree_stmt(conn: &Connection, row: &TreeRow) -> Result<()> {
    let blob = codec::encode_tree_info(&row.tree_info, Encoding::Compact)?;
    let affected = conn
        .execute(
            "INSERT INTO history_tree (shard_id, tree_id, branch_id, data, data_encoding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.shard_id.as_raw(),
                row.tree_id.as_bytes().as_slice(),
                row.branch_id.as_bytes().as_slice(),
                blob.data.as_slice(),
                blob.encoding.tag(),
            ],
        )
        .map_err(|e| map_sqlite_error("insert history tree", e))?;
    if affected != 1 {
        return Err(Error::internal(format!(
            "expected 1 tree row to be affected, got {}",
            affected
        )));
    }
    Ok(())
}

fn insert_node(conn: &Connection, row: &NodeRow) -> Result<()> {
    insert_node_stmt(conn, row)
}

fn insert_tree(conn: &Connection, row: &TreeRow) -> Result<()> {
    insert_tree_stmt(conn, row)
}

fn insert_tree_and_node(
    conn: &mut Connection,
    tree: Option<&TreeRow>,
    node: &NodeRow,
) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| map_sqlite_error("begin tree+node transaction", e))?;
    insert_node_stmt(&tx, node)?;
    if let Some(tree_row) = tree {
        insert_tree_stmt(&tx, tree_row)?;
    }
    tx.commit()
        .map_err(|e| map_sqlite_error("commit tree+node transaction", e))
}

fn select_nodes(conn: &Connection, filter: &NodeFilter) -> Result<NodePage> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT node_id, txn_id, data, data_encoding FROM history_node
             WHERE shard_id = ?1 AND tree_id = ?2 AND branch_id = ?3
               AND node_id >= ?4 AND node_id < ?5
             ORDER BY node_id ASC, txn_id DESC
             LIMIT ?6",
        )
        .map_err(|e| map_sqlite_error("prepare node select", e))?;

    let mapped = stmt
        .query_map(
            params![
                filter.shard_id.as_raw(),
                filter.tree_id.as_bytes().as_slice(),
                filter.branch_id.as_bytes().as_slice(),
                filter.min_node_id.as_raw(),
                filter.max_node_id.as_raw(),
                filter.page_size as i64,
            ],
            |row| {
                let node_id: i64 = row.get(0)?;
                let txn_id: i64 = row.get(1)?;
                let data: Vec<u8> = row.get(2)?;
                let tag: u8 = row.get(3)?;
                Ok((node_id, txn_id, data, tag))
            },
        )
        .map_err(|e| map_sqlite_error("select history nodes", e))?;

    let mut rows = Vec::new();
    for item in mapped {
        let (node_id, txn_id, data, tag) =
            item.map_err(|e| map_sqlite_error("read history node row", e))?;
        rows.push(NodeRow {
            shard_id: filter.shard_id,
            tree_id: filter.tree_id,
            branch_id: filter.branch_id,
            node_id: NodeId::from_raw(node_id),
            txn_id: TxnId::from_raw(txn_id),
            events: EventBlob::new(Encoding::from_tag(tag)?, data),
        });
    }
    Ok(NodePage {
        rows,
        next_page_token: None,
    })
}

fn tree_row_from_blob(
    shard_id: ShardId,
    tree_id: TreeId,
    branch_id: BranchId,
    data: Vec<u8>,
    tag: u8,
) -> Result<TreeRow> {
    let blob = EventBlob::new(Encoding::from_tag(tag)?, data);
    let tree_info = codec::decode_tree_info(&blob)?;
    Ok(TreeRow {
        shard_id,
        tree_id,
        branch_id,
        tree_info,
    })
}

fn select_tree(conn: &Connection, filter: &TreeFilter) -> Result<Vec<TreeRow>> {
    let mut rows = Vec::new();
    let mut push = |branch_bytes: Vec<u8>, data: Vec<u8>, tag: u8| -> Result<()> {
        let branch_id = BranchId::from_bytes(id_from_column("select history tree", branch_bytes)?);
        rows.push(tree_row_from_blob(
            filter.shard_id,
            filter.tree_id,
            branch_id,
            data,
            tag,
        )?);
        Ok(())
    };

    match filter.branch_id {
        Some(branch_id) => {
            let found = conn
                .query_row(
                    "SELECT branch_id, data, data_encoding FROM history_tree
                     WHERE shard_id = ?1 AND tree_id = ?2 AND branch_id = ?3",
                    params![
                        filter.shard_id.as_raw(),
                        filter.tree_id.as_bytes().as_slice(),
                        branch_id.as_bytes().as_slice(),
                    ],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, u8>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| map_sqlite_error("select history tree branch", e))?;
            if let Some((branch_bytes, data, tag)) = found {
                push(branch_bytes, data, tag)?;
            }
        }
        None => {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT branch_id, data, data_encoding FROM history_tree
                     WHERE shard_id = ?1 AND tree_id = ?2
                     ORDER BY branch_id ASC",
                )
                .map_err(|e| map_sqlite_error("prepare tree select", e))?;
            let mapped = stmt
                .query_map(
                    params![
                        filter.shard_id.as_raw(),
                        filter.tree_id.as_bytes().as_slice()
                    ],
                    |row| {
                        Ok((
                            row.get::<_, Vec<u8>>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, u8>(2)?,
                        ))
                    },
                )
                .map_err(|e| map_sqlite_error("select history tree", e))?;
            for item in mapped {
                let (branch_bytes, data, tag) =
                    item.map_err(|e| map_sqlite_error("read history tree row", e))?;
                push(branch_bytes, data, tag)?;
            }
        }
    }
    Ok(rows)
}

fn select_all_trees(
    conn: &Connection,
    shard_id: ShardId,
    after: Option<(TreeId, BranchId)>,
    page_size: usize,
) -> Result<Vec<TreeRow>> {
    fn enum_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, Vec<u8>, Vec<u8>, u8)> {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, u8>(3)?,
        ))
    }

    let raw: Vec<(Vec<u8>, Vec<u8>, Vec<u8>, u8)> = match after {
        Some((tree_id, branch_id)) => {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT tree_id, branch_id, data, data_encoding FROM history_tree
                     WHERE shard_id = ?1
                       AND (tree_id > ?2 OR (tree_id = ?2 AND branch_id > ?3))
                     ORDER BY tree_id ASC, branch_id ASC
                     LIMIT ?4",
                )
                .map_err(|e| map_sqlite_error("prepare tree enumeration", e))?;
            let mapped = stmt
                .query_map(
                    params![
                        shard_id.as_raw(),
                        tree_id.as_bytes().as_slice(),
                        branch_id.as_bytes().as_slice(),
                        page_size as i64,
                    ],
                    enum_row,
                )
                .map_err(|e| map_sqlite_error("enumerate history trees", e))?;
            mapped
                .collect::<rusqlite::Result<_>>()
                .map_err(|e| map_sqlite_error("read history tree row", e))?
        }
        None => {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT tree_id, branch_id, data, data_encoding FROM history_tree
                     WHERE shard_id = ?1
                     ORDER BY tree_id ASC, branch_id ASC
                     LIMIT ?2",
                )
                .map_err(|e| map_sqlite_error("prepare tree enumeration", e))?;
            let mapped = stmt
                .query_map(params![shard_id.as_raw(), page_size as i64], enum_row)
                .map_err(|e| map_sqlite_error("enumerate history trees", e))?;
            mapped
                .collect::<rusqlite::Result<_>>()
                .map_err(|e| map_sqlite_error("read history tree row", e))?
        }
    };

    let mut collected = Vec::with_capacity(raw.len());
    for (tree_bytes, branch_bytes, data, tag) in raw {
        let tree_id = TreeId::from_bytes(id_from_column("enumerate trees", tree_bytes)?);
        let branch_id = BranchId::from_bytes(id_from_column("enumerate trees", branch_bytes)?);
        collected.push(tree_row_from_blob(shard_id, tree_id, branch_id, data, tag)?);
    }
    Ok(collected)
}

fn delete_tree_row(conn: &Connection, filter: &TreeFilter) -> Result<()> {
    let branch_id = filter
        .branch_id
        .ok_or_else(|| Error::invalid_request("tree row delete requires a branch id"))?;
    conn.execute(
        "DELETE FROM history_tree WHERE shard_id = ?1 AND tree_id = ?2 AND branch_id = ?3",
        params![
            filter.shard_id.as_raw(),
            filter.tree_id.as_bytes().as_slice(),
            branch_id.as_bytes().as_slice(),
        ],
    )
    .map_err(|e| map_sqlite_error("delete history tree row", e))?;
    Ok(())
}

/// Deletes one chunk of node rows; the caller loops while a full chunk
/// keeps coming back.
fn delete_nodes_chunk(conn: &Connection, filter: &NodeDeleteFilter) -> Result<i64> {
    let affected = conn
        .execute(
            "DELETE FROM history_node WHERE rowid IN (
                 SELECT rowid FROM history_node
                 WHERE shard_id = ?1 AND tree_id = ?2 AND branch_id = ?3 AND node_id >= ?4
                 LIMIT ?5)",
            params![
                filter.shard_id.as_raw(),
                filter.tree_id.as_bytes().as_slice(),
                filter.branch_id.as_bytes().as_slice(),
                filter.min_node_id.as_raw(),
                NODE_DELETE_BATCH as i64,
            ],
        )
        .map_err(|e| map_sqlite_error("delete history nodes", e))?;
    Ok(affected as i64)
}

fn delete_tree_and_nodes(
    conn: &mut Connection,
    tree: &TreeFilter,
    nodes: &[NodeDeleteFilter],
) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|e| map_sqlite_error("begin branch delete transaction", e))?;
    delete_tree_row(&tx, tree)?;
    for filter in nodes {
        loop {
            let affected = delete_nodes_chunk(&tx, filter)?;
            if affected < NODE_DELETE_BATCH as i64 {
                break;
            }
        }
    }
    tx.commit()
        .map_err(|e| map_sqlite_error("commit branch delete transaction", e))
}

// =============================================================================
// Connector
// =============================================================================

/// Connector producing a [`SqliteBackend`] per named shard.
#[derive(Debug, Default, Clone)]
pub struct SqliteConnector;

#[async_trait]
impl BackendConnector for SqliteConnector {
    type Backend = SqliteBackend;

    async fn connect(
        &self,
        _shard_name: &str,
        connection: &ShardConnection,
    ) -> Result<Self::Backend> {
        SqliteBackend::open(connection)
    }
}

// =============================================================================
// Tests
// =============================================================================
