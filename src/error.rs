//! # Error Handling for branchdb
//!
//! This module defines the error types used throughout branchdb. We use a
//! single error enum ([`Error`]) to represent all failure modes, which keeps
//! function signatures small and lets callers match uniformly.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | InvalidRequest | append below the branch begin, bad fork point | Fix the request |
//! | ConditionFailed | duplicate node row, duplicate branch row | Retry with fresher state |
//! | NotFound | tree/branch absent on fork or delete | Surface to caller |
//! | Corruption | non-monotonic node ids, unknown encoding tag | Do not retry; investigate |
//! | Transient | backend I/O, timeout, worker unavailable | Retry |
//! | Unsupported | full enumeration on a sharded deployment | Use a different deployment |
//! | Internal | driver reported an impossible row count | Do not retry; investigate |
//!
//! Backend-specific error codes (rusqlite, etc.) are translated into this
//! taxonomy exactly once, at the driver boundary. Nothing above a backend
//! module ever sees a backend crate's error type. The store performs no
//! retries itself; retrying `Transient` errors is the caller's concern.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in branchdb operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Caller Errors (fix the request)
    // =========================================================================

    /// The caller violated a documented precondition.
    ///
    /// Examples: appending a node below the branch's begin node
    /// (`"cannot append to ancestors' nodes"`), an over-long branch info
    /// string, a page token that does not decode, an unmapped history shard.
    #[error("invalid request: {msg}")]
    InvalidRequest {
        /// What was wrong with the request.
        msg: String,
    },

    // =========================================================================
    // Conflicts (retry with fresher state)
    // =========================================================================

    /// Optimistic conflict: the row the caller tried to create already
    /// exists.
    ///
    /// Returned when a backend that enforces uniqueness rejects a duplicate
    /// `(tree, branch, node, txn)` node row or a duplicate `(tree, branch)`
    /// tree row. The caller may re-read and retry with a higher transaction
    /// id.
    #[error("condition failed: {msg}")]
    ConditionFailed {
        /// The conflicting row, for logs.
        msg: String,
    },

    // =========================================================================
    // Absence
    // =========================================================================

    /// The tree or branch does not exist.
    ///
    /// Reads of a missing branch return an empty response instead; this
    /// error is reserved for operations that need the entity to exist, such
    /// as deleting a branch of an empty tree.
    #[error("not found: {msg}")]
    NotFound {
        /// What was missing.
        msg: String,
    },

    // =========================================================================
    // Data Inconsistency (non-retriable)
    // =========================================================================

    /// Stored data violates a store invariant.
    ///
    /// Raised when a read observes node ids going backwards, a repeated node
    /// id whose transaction id did not decrease, or a blob with an encoding
    /// tag no decoder recognizes. Retrying will observe the same bytes;
    /// the data itself needs attention.
    #[error("corrupted data: {msg}")]
    Corruption {
        /// Which invariant was violated.
        msg: String,
    },

    // =========================================================================
    // Backend I/O (retriable)
    // =========================================================================

    /// The backend failed in a way that may succeed on retry.
    ///
    /// Wraps I/O errors, timeouts, and unavailable shard workers. The
    /// original backend error is flattened into the message at the driver
    /// boundary so backend crates do not leak into the public API.
    #[error("transient backend error: {msg}")]
    Transient {
        /// The translated backend error.
        msg: String,
    },

    // =========================================================================
    // Capability
    // =========================================================================

    /// The operation is not supported by this backend or deployment.
    ///
    /// Example: enumerating every tree on a deployment whose history data is
    /// spread across multiple store shards. Partial data would be worse than
    /// an error, so the operation refuses outright.
    #[error("unsupported operation: {msg}")]
    Unsupported {
        /// Why the operation cannot be served.
        msg: String,
    },

    // =========================================================================
    // Driver Anomalies (non-retriable)
    // =========================================================================

    /// The driver reported something impossible.
    ///
    /// Example: an insert that affected a number of rows other than one.
    /// Distinct from [`Error::Corruption`]: the stored data may be fine, but
    /// the driver's report cannot be trusted.
    #[error("internal error: {msg}")]
    Internal {
        /// The anomaly.
        msg: String,
    },
}

impl Error {
    /// Creates an [`Error::InvalidRequest`].
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::InvalidRequest { msg: msg.into() }
    }

    /// Creates an [`Error::ConditionFailed`].
    pub fn condition_failed(msg: impl Into<String>) -> Self {
        Error::ConditionFailed { msg: msg.into() }
    }

    /// Creates an [`Error::NotFound`].
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound { msg: msg.into() }
    }

    /// Creates an [`Error::Corruption`].
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption { msg: msg.into() }
    }

    /// Creates an [`Error::Transient`].
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient { msg: msg.into() }
    }

    /// Creates an [`Error::Unsupported`].
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported { msg: msg.into() }
    }

    /// Creates an [`Error::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal { msg: msg.into() }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs; make sure they carry the detail.
    #[test]
    fn test_error_display() {
        let invalid = Error::invalid_request("cannot append to ancestors' nodes");
        assert_eq!(
            invalid.to_string(),
            "invalid request: cannot append to ancestors' nodes"
        );

        let corrupted = Error::corruption("nodeID cannot decrease");
        assert_eq!(corrupted.to_string(), "corrupted data: nodeID cannot decrease");

        let unsupported = Error::unsupported("enumeration on sharded history");
        assert_eq!(
            unsupported.to_string(),
            "unsupported operation: enumeration on sharded history"
        );
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::transient("connection reset").is_retriable());
        assert!(!Error::corruption("bad tag").is_retriable());
        assert!(!Error::condition_failed("row exists").is_retriable());
        assert!(!Error::internal("2 rows affected").is_retriable());
    }
}
