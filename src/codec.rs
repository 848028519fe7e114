//! # Blob and Token Encoding
//!
//! This module is the serialization boundary of branchdb: tree metadata
//! blobs, event-batch blobs, and the two pagination tokens.
//!
//! ## Tagged Blob Format
//!
//! Every blob leads with a one-byte encoding tag so formats can coexist
//! during rolling upgrades:
//!
//! ```text
//! [tag: u8][payload...]
//!
//! tag 1 = compact:  length-prefixed little-endian binary
//! tag 2 = json:     serde_json payload
//! ```
//!
//! Writers pick one format; readers accept every known tag and reject
//! unknown tags as [`Corruption`](Error::Corruption). Compact layouts:
//!
//! ```text
//! tree metadata:  [ancestor_count: u16]
//!                 [branch_id: 16B, begin: i64, end: i64] * count
//!                 [created_at_nanos: i64]
//!                 [info_len: u16][info: utf8]
//!
//! event batch:    [event_count: u32]
//!                 [event_id: i64, data_len: u32, data] * count
//! ```
//!
//! ## Page Tokens
//!
//! Tokens are opaque to callers, byte-stable, and version-tagged:
//!
//! ```text
//! node-read token:         [version: u8 = 1][last_node_id: i64]
//! tree-enumeration token:  [version: u8 = 1][shard_id: i64]
//!                          [tree_id: 16B][branch_id: 16B]
//! ```
//!
//! A token that does not decode is the caller's fault
//! ([`InvalidRequest`](Error::InvalidRequest)); a blob that does not decode
//! is the store's ([`Corruption`](Error::Corruption)).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::types::{
    BranchId, BranchRange, Encoding, EventBlob, HistoryEvent, NodeId, ShardId, TreeId, TreeInfo,
    MAX_BRANCH_INFO_BYTES,
};

/// Version byte of both pagination token formats.
const TOKEN_VERSION: u8 = 1;

// =============================================================================
// Byte Cursor
// =============================================================================

/// Minimal forward-only reader over a byte slice.
///
/// Returns `None` on underrun; callers map that to the right error class
/// (token vs stored blob).
struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn take_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn take_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn take_i64(&mut self) -> Option<i64> {
        self.take(8).map(|b| i64::from_le_bytes(b.try_into().unwrap()))
    }

    fn take_id_bytes(&mut self) -> Option<[u8; 16]> {
        self.take(16).map(|b| b.try_into().unwrap())
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// =============================================================================
// Tree Metadata
// =============================================================================

/// Encodes tree metadata into a tagged blob.
///
/// # Errors
///
/// `InvalidRequest` if `info` exceeds [`MAX_BRANCH_INFO_BYTES`].
pub fn encode_tree_info(info: &TreeInfo, encoding: Encoding) -> Result<EventBlob> {
    if info.info.len() > MAX_BRANCH_INFO_BYTES {
        return Err(Error::invalid_request(format!(
            "branch info is {} bytes, limit is {}",
            info.info.len(),
            MAX_BRANCH_INFO_BYTES
        )));
    }

    let mut data = vec![encoding.tag()];
    match encoding {
        Encoding::Compact => {
            data.extend_from_slice(&(info.ancestors.len() as u16).to_le_bytes());
            for range in &info.ancestors {
                data.extend_from_slice(range.branch_id.as_bytes());
                data.extend_from_slice(&range.begin_node_id.as_raw().to_le_bytes());
                data.extend_from_slice(&range.end_node_id.as_raw().to_le_bytes());
            }
            data.extend_from_slice(&info.created_at_nanos.to_le_bytes());
            data.extend_from_slice(&(info.info.len() as u16).to_le_bytes());
            data.extend_from_slice(info.info.as_bytes());
        }
        Encoding::Json => {
            let payload = serde_json::to_vec(info)
                .map_err(|e| Error::internal(format!("tree info json encode: {}", e)))?;
            data.extend_from_slice(&payload);
        }
    }
    Ok(EventBlob::new(encoding, data))
}

/// Decodes a tagged tree-metadata blob.
///
/// # Errors
///
/// `Corruption` for unknown tags, truncated payloads, or malformed JSON.
pub fn decode_tree_info(blob: &EventBlob) -> Result<TreeInfo> {
    let mut cur = Cursor::new(&blob.data);
    let tag = cur
        .take_u8()
        .ok_or_else(|| Error::corruption("empty tree metadata blob"))?;

    match Encoding::from_tag(tag)? {
        Encoding::Compact => {
            decode_tree_info_compact(&mut cur).ok_or_else(|| {
                Error::corruption("truncated compact tree metadata blob")
            })
        }
        Encoding::Json => serde_json::from_slice(cur.buf)
            .map_err(|e| Error::corruption(format!("malformed json tree metadata: {}", e))),
    }
}

fn decode_tree_info_compact(cur: &mut Cursor<'_>) -> Option<TreeInfo> {
    let count = cur.take_u16()? as usize;
    let mut ancestors = Vec::with_capacity(count);
    for _ in 0..count {
        let branch_id = BranchId::from_bytes(cur.take_id_bytes()?);
        let begin_node_id = NodeId::from_raw(cur.take_i64()?);
        let end_node_id = NodeId::from_raw(cur.take_i64()?);
        ancestors.push(BranchRange {
            branch_id,
            begin_node_id,
            end_node_id,
        });
    }
    let created_at_nanos = cur.take_i64()?;
    let info_len = cur.take_u16()? as usize;
    let info = String::from_utf8(cur.take(info_len)?.to_vec()).ok()?;
    if !cur.is_empty() {
        return None;
    }
    Some(TreeInfo {
        ancestors,
        created_at_nanos,
        info,
    })
}

// =============================================================================
// Event Batches
// =============================================================================

/// Encodes a batch of events into a tagged blob.
///
/// # Errors
///
/// `InvalidRequest` when the batch is empty or event ids are not contiguous
/// — a batch is addressed by its first event id, so gaps would break node
/// addressing.
pub fn encode_event_batch(events: &[HistoryEvent], encoding: Encoding) -> Result<EventBlob> {
    validate_batch_shape(events).map_err(Error::invalid_request)?;

    let mut data = vec![encoding.tag()];
    match encoding {
        Encoding::Compact => {
            data.extend_from_slice(&(events.len() as u32).to_le_bytes());
            for event in events {
                data.extend_from_slice(&event.event_id.to_le_bytes());
                data.extend_from_slice(&(event.data.len() as u32).to_le_bytes());
                data.extend_from_slice(&event.data);
            }
        }
        Encoding::Json => {
            let payload = serde_json::to_vec(events)
                .map_err(|e| Error::internal(format!("event batch json encode: {}", e)))?;
            data.extend_from_slice(&payload);
        }
    }
    Ok(EventBlob::new(encoding, data))
}

/// Decodes a tagged event-batch blob.
///
/// # Errors
///
/// `Corruption` for unknown tags, truncated payloads, empty batches, or
/// non-contiguous event ids.
pub fn decode_event_batch(blob: &EventBlob) -> Result<Vec<HistoryEvent>> {
    let mut cur = Cursor::new(&blob.data);
    let tag = cur
        .take_u8()
        .ok_or_else(|| Error::corruption("empty event batch blob"))?;

    let events = match Encoding::from_tag(tag)? {
        Encoding::Compact => decode_event_batch_compact(&mut cur)
            .ok_or_else(|| Error::corruption("truncated compact event batch blob"))?,
        Encoding::Json => serde_json::from_slice(cur.buf)
            .map_err(|e| Error::corruption(format!("malformed json event batch: {}", e)))?,
    };

    validate_batch_shape(&events).map_err(Error::corruption)?;
    Ok(events)
}

fn decode_event_batch_compact(cur: &mut Cursor<'_>) -> Option<Vec<HistoryEvent>> {
    let count = cur.take_u32()? as usize;
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        let event_id = cur.take_i64()?;
        let len = cur.take_u32()? as usize;
        let data = cur.take(len)?.to_vec();
        events.push(HistoryEvent { event_id, data });
    }
    if !cur.is_empty() {
        return None;
    }
    Some(events)
}

/// A batch must be non-empty with contiguous event ids.
fn validate_batch_shape(events: &[HistoryEvent]) -> std::result::Result<(), String> {
    let first = match events.first() {
        Some(e) => e.event_id,
        None => return Err("event batch cannot be empty".to_string()),
    };
    for (i, event) in events.iter().enumerate() {
        let expected = first + i as i64;
        if event.event_id != expected {
            return Err(format!(
                "event ids must be contiguous: expected {} at offset {}, got {}",
                expected, i, event.event_id
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Page Tokens
// =============================================================================

/// Encodes a node-read continuation token.
pub fn encode_node_token(last_node_id: NodeId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(TOKEN_VERSION);
    buf.extend_from_slice(&last_node_id.as_raw().to_le_bytes());
    buf
}

/// Decodes a node-read continuation token.
///
/// # Errors
///
/// `InvalidRequest` — tokens come from callers, not from storage.
pub fn decode_node_token(token: &[u8]) -> Result<NodeId> {
    let mut cur = Cursor::new(token);
    let parsed = (|| {
        let version = cur.take_u8()?;
        if version != TOKEN_VERSION {
            return None;
        }
        let node = cur.take_i64()?;
        if !cur.is_empty() {
            return None;
        }
        Some(NodeId::from_raw(node))
    })();
    parsed.ok_or_else(|| Error::invalid_request("invalid node page token"))
}

/// Position of a tree-enumeration cursor: the last row already returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreePagePosition {
    /// The logical shard currently being enumerated.
    pub shard_id: ShardId,
    /// Last tree id returned within the shard.
    pub tree_id: TreeId,
    /// Last branch id returned within the tree.
    pub branch_id: BranchId,
}

/// Encodes a tree-enumeration continuation token.
pub fn encode_tree_token(pos: &TreePagePosition) -> Vec<u8> {
    let mut buf = Vec::with_capacity(41);
    buf.push(TOKEN_VERSION);
    buf.extend_from_slice(&pos.shard_id.as_raw().to_le_bytes());
    buf.extend_from_slice(pos.tree_id.as_bytes());
    buf.extend_from_slice(pos.branch_id.as_bytes());
    buf
}

/// Decodes a tree-enumeration continuation token.
///
/// # Errors
///
/// `InvalidRequest` on version or length mismatch.
pub fn decode_tree_token(token: &[u8]) -> Result<TreePagePosition> {
    let mut cur = Cursor::new(token);
    let parsed = (|| {
        let version = cur.take_u8()?;
        if version != TOKEN_VERSION {
            return None;
        }
        let shard_id = ShardId::from_raw(cur.take_i64()?);
        let tree_id = TreeId::from_bytes(cur.take_id_bytes()?);
        let branch_id = BranchId::from_bytes(cur.take_id_bytes()?);
        if !cur.is_empty() {
            return None;
        }
        Some(TreePagePosition {
            shard_id,
            tree_id,
            branch_id,
        })
    })();
    parsed.ok_or_else(|| Error::invalid_request("invalid tree page token"))
}

// =============================================================================
// Time
// =============================================================================

/// Returns the current time as UTC nanoseconds since the Unix epoch.
pub fn current_time_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as i64
}

// =============================================================================
// Tests
// =============================================================================
