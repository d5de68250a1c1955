//! Error types for tierio
//!
//! This module defines the common error type used throughout the system.

use crate::types::{BlobId, BucketId, NodeId, TargetId, VBucketId};
use thiserror::Error;

/// Common result type for tierio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for tierio
#[derive(Debug, Error)]
pub enum Error {
    // Placement errors
    #[error("no placement schema found at any topology scope for {blob_size} bytes")]
    PlacementSchemaEmpty { blob_size: u64 },

    #[error("random placement found no target with {size} bytes free")]
    RandomFoundNoTarget { size: u64 },

    #[error("minimize-io-time linear program has no feasible solution")]
    MinimizeIoTimeNoSolution,

    #[error("round-robin placement found no target for {size} bytes")]
    RoundRobinFindTargetFailed { size: u64 },

    // Buffer pool errors
    #[error("target {target} cannot satisfy {requested} bytes")]
    OutOfCapacity { target: TargetId, requested: u64 },

    #[error("incomplete allocation: {allocated} of {requested} bytes buffered")]
    IncompleteAllocation { requested: u64, allocated: u64 },

    #[error("heap exhausted: requested {requested} bytes, largest free block {available} bytes")]
    HeapExhausted { requested: u64, available: u64 },

    #[error("target not found: {0}")]
    TargetNotFound(TargetId),

    // Metadata errors
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("blob id not found: {0}")]
    BlobIdNotFound(BlobId),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket id not found: {0}")]
    BucketIdNotFound(BucketId),

    #[error("vbucket not found: {0}")]
    VBucketNotFound(String),

    #[error("vbucket id not found: {0}")]
    VBucketIdNotFound(VBucketId),

    #[error("bucket {name} is still open by {ref_count} handles")]
    BucketInUse { name: String, ref_count: u32 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Device errors
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // RPC errors
    #[error("remote call {proc_name} to node {node} failed: {reason}")]
    Rpc {
        node: NodeId,
        proc_name: &'static str,
        reason: String,
    },

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an RPC error
    pub fn rpc(node: NodeId, proc_name: &'static str, reason: impl Into<String>) -> Self {
        Self::Rpc {
            node,
            proc_name,
            reason: reason.into(),
        }
    }

    /// Process-level conditions an operator has to fix (under-provisioned heap)
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HeapExhausted { .. })
    }

    /// Per-Put placement failures that a wider topology scope may resolve
    #[must_use]
    pub fn is_placement_failure(&self) -> bool {
        matches!(
            self,
            Self::PlacementSchemaEmpty { .. }
                | Self::RandomFoundNoTarget { .. }
                | Self::MinimizeIoTimeNoSolution
                | Self::RoundRobinFindTargetFailed { .. }
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BlobNotFound(_)
                | Self::BlobIdNotFound(_)
                | Self::BucketNotFound(_)
                | Self::BucketIdNotFound(_)
                | Self::VBucketNotFound(_)
                | Self::VBucketIdNotFound(_)
                | Self::TargetNotFound(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::HeapExhausted { requested: 10, available: 0 }.is_fatal());
        assert!(!Error::MinimizeIoTimeNoSolution.is_fatal());

        assert!(Error::MinimizeIoTimeNoSolution.is_placement_failure());
        assert!(Error::RandomFoundNoTarget { size: 1 }.is_placement_failure());
        assert!(!Error::OutOfCapacity { target: TargetId::default(), requested: 1 }.is_placement_failure());

        assert!(Error::BlobNotFound("a".into()).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn test_display() {
        let err = Error::rpc(NodeId::new(2), "GetBlobId", "connection reset");
        assert_eq!(
            err.to_string(),
            "remote call GetBlobId to node 2 failed: connection reset"
        );
    }
}
