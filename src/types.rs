//! # Domain Types for branchdb
//!
//! This module defines the core types of the history tree model: trees,
//! branches, ancestor ranges, nodes, and the encoded blobs that carry event
//! batches and tree metadata.
//!
//! ## The Model
//!
//! ```text
//! Tree (one workflow lifetime, including forks/resets)
//! │
//! ├── Branch B1 (root)            nodes: 1[1,2]  3[3,4,5]  6[6,7]
//! │
//! └── Branch B2                   ancestors: [{B1, begin=1, end=6}]
//!     forked from B1 at node 6    nodes: 6[6,7]  8[8]
//! ```
//!
//! A **node** is one event batch, addressed by the first event id it
//! contains. Node ids are monotonically increasing per branch but sparse: a
//! batch of events 3,4,5 has node id 3 and the next batch starts at 6.
//!
//! A **branch** inherits a prefix of its tree through an ordered list of
//! ancestor ranges. `end_node_id` is exclusive: the child reads nodes
//! `[begin, end)` from that ancestor branch. The branch's own nodes start at
//! the last ancestor's `end_node_id`, or 1 for a root branch.
//!
//! Newtypes wrap the raw integers so a [`NodeId`] can never be passed where a
//! [`TxnId`] is expected; the pattern follows the rest of our storage code.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a history tree: 16 bytes, unique per workflow lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(Uuid);

impl TreeId {
    /// Generates a fresh random tree id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reconstructs a tree id from its 16 stored bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16-byte representation for storage.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a branch within a tree: 16 bytes, unique per tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId(Uuid);

impl BranchId {
    /// Generates a fresh random branch id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Reconstructs a branch id from its 16 stored bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16-byte representation for storage.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node id: the first event id contained in the batch at this node.
///
/// Strictly increasing within a branch, but sparse — the gap to the next
/// node id is the batch size.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(i64);

impl NodeId {
    /// The first node id of a root branch (event ids start at 1).
    pub const FIRST: NodeId = NodeId(1);

    /// Creates a NodeId from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns the node id `count` events past this one.
    pub fn add(&self, count: i64) -> Self {
        Self(self.0 + count)
    }

    /// Returns the immediately following node id.
    ///
    /// Used to resume pagination past the last node observed on the
    /// previous page.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transaction id: the write epoch of a node row.
///
/// Two appends racing on the same `(branch, node)` produce two rows; the
/// one with the higher transaction id is authoritative and readers skip the
/// rest. Signed so callers can seed from any monotonic source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TxnId(i64);

impl TxnId {
    /// Creates a TxnId from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value for storage.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical shard id, owned by layers above the store.
///
/// The store never interprets it beyond routing: the sharding policy maps a
/// shard id to a named backend connection, and backends use it as a row
/// prefix for locality.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ShardId(i64);

impl ShardId {
    /// Creates a ShardId from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw i64 value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Branches and Ancestry
// =============================================================================

/// One inherited range: the child reads nodes `[begin_node_id, end_node_id)`
/// from branch `branch_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRange {
    /// The ancestor branch the nodes are read from.
    pub branch_id: BranchId,
    /// First inherited node id (inclusive).
    pub begin_node_id: NodeId,
    /// First node id NOT inherited (exclusive).
    pub end_node_id: NodeId,
}

/// A branch descriptor: identity plus the ordered ancestor list.
///
/// The ancestor list is ordered root-first. The union of the inherited
/// ranges plus the branch's own nodes covers event ids from 1 upward with no
/// gaps; [`ForkHistoryBranch`](crate::store::HistoryStore::fork_history_branch)
/// maintains that property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// The tree this branch belongs to.
    pub tree_id: TreeId,
    /// This branch's id.
    pub branch_id: BranchId,
    /// Inherited ranges, root-first. Empty for a root branch.
    pub ancestors: Vec<BranchRange>,
}

impl BranchInfo {
    /// Creates a root branch descriptor with no ancestors.
    pub fn root(tree_id: TreeId, branch_id: BranchId) -> Self {
        Self {
            tree_id,
            branch_id,
            ancestors: Vec::new(),
        }
    }

    /// Returns the first node id this branch owns natively.
    ///
    /// That is the last ancestor's exclusive end, or [`NodeId::FIRST`] for a
    /// root branch. Appends below this id are rejected: those nodes belong
    /// to an ancestor.
    pub fn begin_node_id(&self) -> NodeId {
        match self.ancestors.last() {
            Some(range) => range.end_node_id,
            None => NodeId::FIRST,
        }
    }
}

/// Tree metadata persisted alongside each branch row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeInfo {
    /// Inherited ranges of the branch this row describes.
    pub ancestors: Vec<BranchRange>,
    /// Branch creation time, UTC nanoseconds.
    pub created_at_nanos: i64,
    /// Free-form human-readable origin (cluster, reason). At most
    /// [`MAX_BRANCH_INFO_BYTES`] bytes of UTF-8.
    pub info: String,
}

/// Upper bound on the `info` string, in bytes.
pub const MAX_BRANCH_INFO_BYTES: usize = 1024;

/// One branch as seen by global tree enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBranchDetail {
    /// The tree the branch belongs to.
    pub tree_id: TreeId,
    /// The branch id.
    pub branch_id: BranchId,
    /// When the branch was created, UTC nanoseconds.
    pub fork_time_nanos: i64,
    /// The branch's info string.
    pub info: String,
}

// =============================================================================
// Encoded Blobs
// =============================================================================

/// Self-describing encoding of a stored blob.
///
/// The tag byte leads the payload on disk so multiple serialization formats
/// can coexist during rolling upgrades: writers pick one, readers accept
/// every known tag. Decoders reject unknown tags as
/// [`Corruption`](crate::error::Error::Corruption).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Encoding {
    /// Compact length-prefixed binary.
    Compact = 1,
    /// JSON, for debuggability and cross-language consumers.
    Json = 2,
}

impl Encoding {
    /// Returns the on-disk tag byte.
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Maps a tag byte back to an encoding.
    ///
    /// # Errors
    ///
    /// `Corruption` for tags this build does not know.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Encoding::Compact),
            2 => Ok(Encoding::Json),
            other => Err(Error::corruption(format!("unknown encoding tag {}", other))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Compact => write!(f, "compact"),
            Encoding::Json => write!(f, "json"),
        }
    }
}

/// An encoded blob plus its encoding tag.
///
/// Event batches are produced by callers and stored verbatim; the store
/// never decodes them on the write or read path. Tree metadata blobs are
/// produced by [`codec`](crate::codec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBlob {
    /// How `data` is encoded.
    pub encoding: Encoding,
    /// The encoded bytes.
    pub data: Vec<u8>,
}

impl EventBlob {
    /// Creates a blob from encoding and bytes.
    pub fn new(encoding: Encoding, data: Vec<u8>) -> Self {
        Self { encoding, data }
    }

    /// Returns the payload size in bytes, as accounted by read responses.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// =============================================================================
// Events
// =============================================================================

/// A single history event inside a batch.
///
/// The store treats batches as opaque; this type exists for the read
/// helpers and callers that use the built-in batch codec. Event ids within
/// a batch are contiguous and start at the batch's node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// The event's id within the branch's event sequence.
    pub event_id: i64,
    /// Opaque event payload.
    pub data: Vec<u8>,
}

impl HistoryEvent {
    /// Creates an event.
    pub fn new(event_id: i64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id,
            data: data.into(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
