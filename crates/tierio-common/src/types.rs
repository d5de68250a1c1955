//! Core type definitions for tierio
//!
//! This module defines the identifiers and placement records shared by every
//! component: node/device/target ids, blob and bucket ids, the target
//! registry entry, buffer descriptors and placement schemas.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One kibibyte
pub const KIB: u64 = 1024;
/// One mebibyte
pub const MIB: u64 = 1024 * KIB;
/// One gibibyte
pub const GIB: u64 = 1024 * MIB;

/// Identifier of a node in the deployment (1-based, 0 is NULL)
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct NodeId(u32);

impl NodeId {
    /// The reserved NULL node
    pub const NULL: Self = Self(0);

    /// Create a node id from its 1-based index
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Check whether this is the NULL node
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a device within one node's configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct DeviceId(u8);

impl DeviceId {
    /// Device id reserved for the swap device
    pub const SWAP: Self = Self(u8::MAX);

    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_swap(self) -> bool {
        self.0 == u8::MAX
    }
}

/// Identifies one (node, device, index) triple
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId {
    /// Node that owns the device
    pub node_id: NodeId,
    /// Device on that node
    pub device_id: DeviceId,
    /// Target index on that node
    pub index: u16,
}

impl TargetId {
    /// Create a new target id
    #[must_use]
    pub const fn new(node_id: NodeId, device_id: DeviceId, index: u16) -> Self {
        Self {
            node_id,
            device_id,
            index,
        }
    }

    /// Swap target of a node
    #[must_use]
    pub const fn swap(node_id: NodeId) -> Self {
        Self::new(node_id, DeviceId::SWAP, u16::MAX)
    }

    /// Check whether this target is a swap target
    #[must_use]
    pub const fn is_swap(&self) -> bool {
        self.device_id.is_swap()
    }

    /// Pack into a single integer
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        ((self.node_id.get() as u64) << 32) | ((self.device_id.get() as u64) << 16) | self.index as u64
    }

    /// Unpack from a single integer
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self {
            node_id: NodeId::new((value >> 32) as u32),
            device_id: DeviceId::new(((value >> 16) & 0xff) as u8),
            index: (value & 0xffff) as u16,
        }
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TargetId(node={}, device={}, index={})",
            self.node_id,
            self.device_id.get(),
            self.index
        )
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node_id, self.device_id.get(), self.index)
    }
}

/// Unique identifier for a blob
///
/// A negative `node_id` marks a blob whose bytes live in swap space. The
/// owning node is always `|node_id|`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobId {
    unique: u32,
    node_id: i32,
}

impl BlobId {
    /// The reserved NULL blob id
    pub const NULL: Self = Self {
        unique: 0,
        node_id: 0,
    };

    /// Create a blob id owned by `node_id`
    #[must_use]
    pub fn new(unique: u32, node_id: NodeId) -> Self {
        Self {
            unique,
            node_id: node_id.get() as i32,
        }
    }

    #[must_use]
    pub const fn unique(&self) -> u32 {
        self.unique
    }

    /// Node owning the blob's metadata
    #[must_use]
    pub const fn owner(&self) -> NodeId {
        NodeId::new(self.node_id.unsigned_abs())
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.unique == 0 && self.node_id == 0
    }

    /// Whether the blob's bytes live in swap space
    #[must_use]
    pub const fn is_in_swap(&self) -> bool {
        self.node_id < 0
    }

    /// The same blob identity, marked as living in swap
    #[must_use]
    pub const fn to_swap(self) -> Self {
        Self {
            unique: self.unique,
            node_id: -self.node_id.abs(),
        }
    }

    /// The same blob identity, marked as living in the tier hierarchy
    #[must_use]
    pub const fn to_tiered(self) -> Self {
        Self {
            unique: self.unique,
            node_id: self.node_id.abs(),
        }
    }

    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        ((self.node_id as u32 as u64) << 32) | self.unique as u64
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({}@{})", self.unique, self.node_id)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.unique, self.node_id)
    }
}

macro_rules! owned_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name {
            pub unique: u32,
            pub node_id: NodeId,
        }

        impl $name {
            pub const NULL: Self = Self {
                unique: 0,
                node_id: NodeId::NULL,
            };

            #[must_use]
            pub const fn new(unique: u32, node_id: NodeId) -> Self {
                Self { unique, node_id }
            }

            #[must_use]
            pub const fn is_null(&self) -> bool {
                self.unique == 0 && self.node_id.is_null()
            }

            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                ((self.node_id.get() as u64) << 32) | self.unique as u64
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({}@{})"), self.unique, self.node_id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}@{}", self.unique, self.node_id)
            }
        }
    };
}

owned_id!(
    /// Unique identifier for a bucket
    BucketId
);
owned_id!(
    /// Unique identifier for a virtual bucket
    VBucketId
);

/// Snapshot of one target's capacity and performance
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Target identifier
    pub id: TargetId,
    /// Total buffering capacity in bytes
    pub max_capacity: u64,
    /// Bytes still available for new buffers
    pub remaining_capacity: u64,
    /// Sustained bandwidth in MiB/s
    pub bandwidth: f64,
    /// Access latency in microseconds
    pub latency: f64,
    /// Allocation granularity; every buffer reserves a multiple of it
    #[serde(default)]
    pub block_size: u64,
}

impl TargetInfo {
    /// Capacity that buffering `size` bytes takes from this target
    #[must_use]
    pub const fn reserved_for(&self, size: u64) -> u64 {
        if self.block_size <= 1 {
            size
        } else {
            size.div_ceil(self.block_size) * self.block_size
        }
    }


    /// Fraction of the target currently in use, in `[0, 1]`
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        1.0 - self.remaining_capacity as f64 / self.max_capacity as f64
    }
}

/// One contiguous slice of a blob materialized on one target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferInfo {
    /// Target holding the bytes
    pub target_id: TargetId,
    /// Byte offset of the buffer within the target's storage region
    pub target_offset: u64,
    /// Reserved capacity of the buffer
    pub target_size: u64,
    /// Offset of this slice within the blob
    pub blob_offset: u64,
    /// Number of blob bytes stored in this buffer
    pub blob_size: u64,
}

impl BufferInfo {
    /// End of the blob range covered by this buffer (exclusive)
    #[must_use]
    pub const fn blob_end(&self) -> u64 {
        self.blob_offset + self.blob_size
    }
}

/// Check that `buffers` partition `[0, total)` exactly once
#[must_use]
pub fn buffers_cover_exactly(buffers: &[BufferInfo], total: u64) -> bool {
    let mut ranges: Vec<(u64, u64)> = buffers.iter().map(|b| (b.blob_offset, b.blob_end())).collect();
    ranges.sort_unstable();
    let mut cursor = 0;
    for (start, end) in ranges {
        if start != cursor || end < start {
            return false;
        }
        cursor = end;
    }
    cursor == total
}

/// One entry of a placement schema
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    /// Number of blob bytes to place
    pub size: u64,
    /// Destination target
    pub target: TargetId,
}

impl SchemaEntry {
    #[must_use]
    pub const fn new(size: u64, target: TargetId) -> Self {
        Self { size, target }
    }
}

/// Ordered description of how one blob's bytes are distributed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementSchema {
    entries: Vec<SchemaEntry>,
}

impl PlacementSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, size: u64, target: TargetId) {
        self.entries.push(SchemaEntry::new(size, target));
    }

    #[must_use]
    pub fn entries(&self) -> &[SchemaEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes described by the schema
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Merge entries that reference the same target
    ///
    /// The first occurrence of each target keeps its position.
    pub fn aggregate(&mut self) {
        let mut merged: Vec<SchemaEntry> = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.size == 0 {
                continue;
            }
            match merged.iter_mut().find(|e| e.target == entry.target) {
                Some(existing) => existing.size += entry.size,
                None => merged.push(entry),
            }
        }
        self.entries = merged;
    }
}

impl FromIterator<SchemaEntry> for PlacementSchema {
    fn from_iter<I: IntoIterator<Item = SchemaEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PlacementSchema {
    type Item = &'a SchemaEntry;
    type IntoIter = std::slice::Iter<'a, SchemaEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Data placement policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlacementPolicy {
    /// Uniform choice among targets large enough for each piece
    Random,
    /// Cycle through targets
    RoundRobin,
    /// Solve a linear program minimizing total transfer time
    #[default]
    MinimizeIoTime,
}

impl fmt::Display for PlacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Random => write!(f, "Random"),
            Self::RoundRobin => write!(f, "RoundRobin"),
            Self::MinimizeIoTime => write!(f, "MinimizeIoTime"),
        }
    }
}

impl std::str::FromStr for PlacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "roundrobin" | "round-robin" | "round_robin" => Ok(Self::RoundRobin),
            "minimizeiotime" | "minimize-io-time" | "minimize_io_time" => Ok(Self::MinimizeIoTime),
            other => Err(format!("unknown placement policy: {other}")),
        }
    }
}

/// Tunables of the MinimizeIoTime policy
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizeIoTimeOptions {
    /// Fraction of each target's max capacity that must stay free (0 disables)
    pub minimum_remaining_capacity: f64,
    /// Max fraction of a target's remaining capacity one batch may consume (0 disables)
    pub capacity_change_threshold: f64,
    /// Keep fill roughly proportional across the bandwidth-ordered targets
    pub use_placement_ratio: bool,
    /// Allowed fill ratio between a target and the next slower one
    pub placement_ratio: f64,
}

impl Default for MinimizeIoTimeOptions {
    fn default() -> Self {
        Self {
            minimum_remaining_capacity: 0.0,
            capacity_change_threshold: 0.0,
            use_placement_ratio: false,
            placement_ratio: 10.0,
        }
    }
}

/// Per-call placement context
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementContext {
    /// Policy to use for this call
    pub policy: PlacementPolicy,
    /// Split blobs across successive targets under RoundRobin
    pub rr_split: bool,
    /// MinimizeIoTime tunables
    pub minimize_io_time: MinimizeIoTimeOptions,
}

impl PlacementContext {
    /// Context with a specific policy and default tunables
    #[must_use]
    pub fn with_policy(policy: PlacementPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }
}
