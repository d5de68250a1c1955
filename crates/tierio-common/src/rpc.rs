//! Remote procedure interface between nodes
//!
//! The wire transport is pluggable: anything implementing [`Transport`] can
//! carry [`Request`]s to the owning node and bring back its [`Response`].
//! Messages are serde types and round-trip through bincode.

use crate::error::{Error, Result};
use crate::types::{BlobId, BucketId, BufferInfo, NodeId, TargetId, TargetInfo, VBucketId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Portable copy of one blob's metadata, used when a blob changes owner
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub name: String,
    pub bucket: BucketId,
    pub buffers: Vec<BufferInfo>,
    pub size: u64,
    pub user_score: f64,
    pub access_count: u64,
    pub vbuckets: Vec<VBucketId>,
}

/// A procedure call addressed to one node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    // Buckets
    GetOrCreateBucket { name: String },
    GetBucketId { name: String },
    CloseBucket { bucket: BucketId },
    DestroyBucket { bucket: BucketId },
    BucketBlobs { bucket: BucketId },
    AddBlobToBucket { bucket: BucketId, blob: BlobId },
    RemoveBlobFromBucket { bucket: BucketId, blob: BlobId },

    // Virtual buckets
    GetOrCreateVBucket { name: String },
    GetVBucketId { name: String },
    LinkBlob { vbucket: VBucketId, bucket: BucketId, blob_name: String },
    UnlinkBlob { vbucket: VBucketId, bucket: BucketId, blob_name: String },
    LinkedBlobs { vbucket: VBucketId },
    TagBlob { blob: BlobId, vbucket: VBucketId, linked: bool },
    DestroyVBucket { vbucket: VBucketId },

    // Blobs
    GetBlobId { bucket: BucketId, name: String },
    GetOrCreateBlob { bucket: BucketId, name: String },
    BufferList { blob: BlobId },
    CommitBlob { blob: BlobId, buffers: Vec<BufferInfo>, size: u64, user_score: f64 },
    ReplaceBuffers { blob: BlobId, remove: Vec<BufferInfo>, insert: Vec<BufferInfo> },
    DeleteBlob { blob: BlobId },
    DiscardBlob { blob: BlobId },
    InstallBlob { record: BlobRecord },
    BlobSize { blob: BlobId },
    BlobName { blob: BlobId },
    RecordAccess { blob: BlobId },
    LockBlob { blob: BlobId },
    UnlockBlob { blob: BlobId },

    // Targets and buffers
    TargetInfos,
    WriteSegment { target: TargetId, blob_offset: u64, data: Bytes },
    ReadBuffer { buffer: BufferInfo },
    ReleaseBuffers { buffers: Vec<BufferInfo> },
}

impl Request {
    /// Procedure name used in logs and errors
    #[must_use]
    pub const fn proc_name(&self) -> &'static str {
        match self {
            Self::GetOrCreateBucket { .. } => "GetOrCreateBucket",
            Self::GetBucketId { .. } => "GetBucketId",
            Self::CloseBucket { .. } => "CloseBucket",
            Self::DestroyBucket { .. } => "DestroyBucket",
            Self::BucketBlobs { .. } => "BucketBlobs",
            Self::AddBlobToBucket { .. } => "AddBlobToBucket",
            Self::RemoveBlobFromBucket { .. } => "RemoveBlobFromBucket",
            Self::GetOrCreateVBucket { .. } => "GetOrCreateVBucket",
            Self::GetVBucketId { .. } => "GetVBucketId",
            Self::LinkBlob { .. } => "LinkBlob",
            Self::UnlinkBlob { .. } => "UnlinkBlob",
            Self::LinkedBlobs { .. } => "LinkedBlobs",
            Self::TagBlob { .. } => "TagBlob",
            Self::DestroyVBucket { .. } => "DestroyVBucket",
            Self::GetBlobId { .. } => "GetBlobId",
            Self::GetOrCreateBlob { .. } => "GetOrCreateBlob",
            Self::BufferList { .. } => "BufferList",
            Self::CommitBlob { .. } => "CommitBlob",
            Self::ReplaceBuffers { .. } => "ReplaceBuffers",
            Self::DeleteBlob { .. } => "DeleteBlob",
            Self::DiscardBlob { .. } => "DiscardBlob",
            Self::InstallBlob { .. } => "InstallBlob",
            Self::BlobSize { .. } => "BlobSize",
            Self::BlobName { .. } => "BlobName",
            Self::RecordAccess { .. } => "RecordAccess",
            Self::LockBlob { .. } => "LockBlob",
            Self::UnlockBlob { .. } => "UnlockBlob",
            Self::TargetInfos => "TargetInfos",
            Self::WriteSegment { .. } => "WriteSegment",
            Self::ReadBuffer { .. } => "ReadBuffer",
            Self::ReleaseBuffers { .. } => "ReleaseBuffers",
        }
    }

    /// Encode for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Result of a procedure call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Unit,
    BucketId(BucketId),
    MaybeBucketId(Option<BucketId>),
    VBucketId(VBucketId),
    MaybeVBucketId(Option<VBucketId>),
    BlobId(BlobId),
    MaybeBlobId(Option<BlobId>),
    BlobCreated { blob: BlobId, created: bool },
    Committed { blob: BlobId, replaced: Vec<BufferInfo>, listed: Option<BucketId> },
    Buffers(Vec<BufferInfo>),
    BlobIds(Vec<BlobId>),
    Links(Vec<(BucketId, String)>),
    Record(BlobRecord),
    Size(u64),
    Name(String),
    Targets(Vec<TargetInfo>),
    Data(Bytes),
}

macro_rules! response_accessor {
    ($(#[$meta:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $name(self) -> Result<$ty> {
            match self {
                Self::$variant(value) => Ok(value),
                other => Err(other.mismatch(stringify!($variant))),
            }
        }
    };
}

impl Response {
    /// Encode for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn mismatch(&self, expected: &str) -> Error {
        Error::internal(format!("expected {expected} response, got {self:?}"))
    }

    /// Expect an empty acknowledgement
    pub fn into_unit(self) -> Result<()> {
        match self {
            Self::Unit => Ok(()),
            other => Err(other.mismatch("Unit")),
        }
    }

    response_accessor!(into_bucket_id, BucketId, BucketId);
    response_accessor!(into_maybe_bucket_id, MaybeBucketId, Option<BucketId>);
    response_accessor!(into_vbucket_id, VBucketId, VBucketId);
    response_accessor!(into_maybe_vbucket_id, MaybeVBucketId, Option<VBucketId>);
    response_accessor!(into_blob_id, BlobId, BlobId);
    response_accessor!(into_maybe_blob_id, MaybeBlobId, Option<BlobId>);
    response_accessor!(into_buffers, Buffers, Vec<BufferInfo>);
    response_accessor!(into_blob_ids, BlobIds, Vec<BlobId>);
    response_accessor!(into_links, Links, Vec<(BucketId, String)>);
    response_accessor!(into_record, Record, BlobRecord);
    response_accessor!(into_size, Size, u64);
    response_accessor!(into_name, Name, String);
    response_accessor!(into_targets, Targets, Vec<TargetInfo>);
    response_accessor!(into_data, Data, Bytes);

    /// Expect a `(blob, created)` pair
    pub fn into_blob_created(self) -> Result<(BlobId, bool)> {
        match self {
            Self::BlobCreated { blob, created } => Ok((blob, created)),
            other => Err(other.mismatch("BlobCreated")),
        }
    }

    /// Expect the new id, the replaced buffers and the bucket of a first commit
    pub fn into_committed(self) -> Result<(BlobId, Vec<BufferInfo>, Option<BucketId>)> {
        match self {
            Self::Committed { blob, replaced, listed } => Ok((blob, replaced, listed)),
            other => Err(other.mismatch("Committed")),
        }
    }
}

/// Carries requests to other nodes
pub trait Transport: Send + Sync {
    /// Execute `request` on `node` and wait for its response
    fn call(&self, node: NodeId, request: Request) -> Result<Response>;
}

/// Transport for single-node deployments; every remote call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTransport;

impl Transport for NoTransport {
    fn call(&self, node: NodeId, request: Request) -> Result<Response> {
        Err(Error::rpc(node, request.proc_name(), "no transport configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    #[test]
    fn test_request_wire_roundtrip() {
        let request = Request::WriteSegment {
            target: TargetId::new(NodeId::new(2), DeviceId::new(1), 1),
            blob_offset: 4096,
            data: Bytes::from_static(b"payload"),
        };
        let decoded = Request::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.proc_name(), "WriteSegment");
    }

    #[test]
    fn test_response_accessors() {
        let id = BlobId::new(3, NodeId::new(1));
        assert_eq!(Response::BlobId(id).into_blob_id().unwrap(), id);
        assert_eq!(Response::Size(9).into_size().unwrap(), 9);
        assert!(Response::Unit.into_unit().is_ok());

        let err = Response::Size(9).into_buffers().unwrap_err();
        assert!(err.to_string().contains("expected Buffers"));
    }

    #[test]
    fn test_no_transport_fails() {
        let err = NoTransport.call(NodeId::new(2), Request::TargetInfos).unwrap_err();
        assert!(matches!(err, Error::Rpc { proc_name: "TargetInfos", .. }));
    }
}
