//! Table entries and owner routing

use std::time::{Duration, Instant};
use tierio_common::{BlobId, BucketId, BufferInfo, NodeId, VBucketId};
use xxhash_rust::xxh64::xxh64;

/// Node that owns the metadata for `name`
///
/// Names hash uniformly onto `1..=num_nodes`.
#[must_use]
pub fn owner_of(name: &[u8], seed: u64, num_nodes: u32) -> NodeId {
    let n = u64::from(num_nodes.max(1));
    NodeId::new((xxh64(name, seed) % n) as u32 + 1)
}

/// Internal name of a blob, namespaced by its bucket
#[must_use]
pub fn blob_key(bucket: BucketId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + name.len());
    key.extend_from_slice(&bucket.as_u64().to_le_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// A bucket as stored by its owner
#[derive(Clone, Debug)]
pub struct BucketEntry {
    pub name: String,
    /// Open handles across all nodes
    pub ref_count: u32,
    /// Member blobs, by tiered id
    pub blobs: Vec<BlobId>,
}

/// A virtual bucket as stored by its owner
#[derive(Clone, Debug)]
pub struct VBucketEntry {
    pub name: String,
    pub links: Vec<(BucketId, String)>,
}

/// Access statistics for scoring
#[derive(Clone, Copy, Debug)]
pub struct AccessStats {
    pub count: u64,
    pub last_access: Instant,
}

impl AccessStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: 0,
            last_access: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.count += 1;
        self.last_access = Instant::now();
    }
}

impl Default for AccessStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A blob as stored by its owner
#[derive(Clone, Debug)]
pub struct BlobEntry {
    pub name: String,
    pub bucket: BucketId,
    /// Heap offset of the encoded buffer list
    pub buffers: u32,
    pub size: u64,
    pub user_score: f64,
    pub access: AccessStats,
    pub vbuckets: Vec<VBucketId>,
    /// Whether the bytes live on the swap device
    pub in_swap: bool,
    /// Created but never committed; name lookups skip it
    pub pending: bool,
}

/// Snapshot of one local blob, as the organizer sees it
#[derive(Clone, Debug)]
pub struct BlobSummary {
    pub id: BlobId,
    pub size: u64,
    pub buffers: Vec<BufferInfo>,
    pub access_count: u64,
    pub since_access: Duration,
    pub user_score: f64,
}
