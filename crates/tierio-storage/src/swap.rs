//! Swap space for blobs that fit nowhere in the hierarchy
//!
//! The swap device is a single file carved into byte extents. Allocation is
//! first fit over a free list sorted by start offset; freed extents merge with
//! their neighbours.

use crate::io_client::IoClient;
use parking_lot::Mutex;
use tierio_common::config::SwapConfig;
use tierio_common::{BufferInfo, Error, NodeId, Result, TargetId};
use tracing::{debug, warn};

/// A contiguous byte range of the swap device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
}

impl Extent {
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// End offset (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Merge with an adjacent extent
    #[must_use]
    pub const fn try_merge(&self, other: &Self) -> Option<Self> {
        if self.end() == other.start {
            Some(Self::new(self.start, self.length + other.length))
        } else if other.end() == self.start {
            Some(Self::new(other.start, self.length + other.length))
        } else {
            None
        }
    }
}

/// File-backed overflow space of one node
#[derive(Debug)]
pub struct SwapSpace {
    target: TargetId,
    io: IoClient,
    capacity: u64,
    free: Mutex<Vec<Extent>>,
}

impl SwapSpace {
    pub fn new(node_id: NodeId, config: &SwapConfig) -> Result<Self> {
        let file_name = format!("swap-node{node_id}.dat");
        let io = IoClient::init(config.kind, config.mount_point.as_deref(), &file_name, config.capacity)?;
        debug!("Swap space for node {}: {} bytes", node_id, config.capacity);
        Ok(Self {
            target: TargetId::swap(node_id),
            io,
            capacity: config.capacity,
            free: Mutex::new(vec![Extent::new(0, config.capacity)]),
        })
    }

    #[must_use]
    pub const fn target(&self) -> TargetId {
        self.target
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes not covered by any live extent
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free.lock().iter().map(|e| e.length).sum()
    }

    /// Store a whole blob in one extent
    pub fn write(&self, data: &[u8]) -> Result<BufferInfo> {
        let length = data.len() as u64;
        if length == 0 {
            return Err(Error::invalid_argument("cannot swap an empty blob"));
        }
        let extent = self.allocate(length)?;
        if let Err(e) = self.io.write(extent.start, data) {
            self.free_extent(extent);
            return Err(e);
        }
        Ok(BufferInfo {
            target_id: self.target,
            target_offset: extent.start,
            target_size: extent.length,
            blob_offset: 0,
            blob_size: length,
        })
    }

    /// Read the bytes of a swap buffer into `out`
    pub fn read(&self, buffer: &BufferInfo, out: &mut [u8]) -> Result<()> {
        self.check(buffer)?;
        self.io.read(buffer.target_offset, out)
    }

    /// Return a swap buffer's extent
    pub fn release(&self, buffer: &BufferInfo) -> Result<()> {
        self.check(buffer)?;
        let extent = Extent::new(buffer.target_offset, buffer.target_size);
        if self.free.lock().iter().any(|e| e.overlaps(&extent)) {
            return Err(Error::storage(format!(
                "swap extent at {} released twice",
                extent.start
            )));
        }
        self.free_extent(extent);
        Ok(())
    }

    fn allocate(&self, length: u64) -> Result<Extent> {
        let mut free = self.free.lock();
        let Some(pos) = free.iter().position(|e| e.length >= length) else {
            warn!("Swap space exhausted: {} bytes requested", length);
            return Err(Error::OutOfCapacity {
                target: self.target,
                requested: length,
            });
        };
        let extent = Extent::new(free[pos].start, length);
        if free[pos].length == length {
            free.remove(pos);
        } else {
            free[pos] = Extent::new(extent.end(), free[pos].length - length);
        }
        Ok(extent)
    }

    fn free_extent(&self, extent: Extent) {
        let mut free = self.free.lock();
        let pos = free.partition_point(|e| e.start < extent.start);
        free.insert(pos, extent);

        if let Some(next) = free.get(pos + 1).copied()
            && let Some(merged) = free[pos].try_merge(&next)
        {
            free[pos] = merged;
            free.remove(pos + 1);
        }
        if pos > 0
            && let Some(merged) = free[pos - 1].try_merge(&free[pos])
        {
            free[pos - 1] = merged;
            free.remove(pos);
        }
    }

    fn check(&self, buffer: &BufferInfo) -> Result<()> {
        if buffer.target_id != self.target || buffer.target_offset + buffer.target_size > self.capacity {
            return Err(Error::invalid_argument(format!(
                "buffer on {} is not in swap {}",
                buffer.target_id, self.target
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierio_common::config::DeviceKind;

    fn swap(capacity: u64) -> (tempfile::TempDir, SwapSpace) {
        let dir = tempfile::tempdir().unwrap();
        let config = SwapConfig {
            kind: DeviceKind::File,
            mount_point: Some(dir.path().to_path_buf()),
            capacity,
        };
        let swap = SwapSpace::new(NodeId::new(1), &config).unwrap();
        (dir, swap)
    }

    #[test]
    fn test_extent_merge() {
        let a = Extent::new(0, 10);
        let b = Extent::new(10, 5);
        assert_eq!(a.try_merge(&b), Some(Extent::new(0, 15)));
        assert_eq!(b.try_merge(&a), Some(Extent::new(0, 15)));
        assert_eq!(a.try_merge(&Extent::new(11, 1)), None);
        assert!(a.overlaps(&Extent::new(9, 2)));
    }

    #[test]
    fn test_write_read_release() {
        let (_dir, swap) = swap(1024);
        let buffer = swap.write(b"spilled bytes").unwrap();
        assert!(buffer.target_id.is_swap());
        assert_eq!(buffer.blob_size, 13);

        let mut out = vec![0u8; 13];
        swap.read(&buffer, &mut out).unwrap();
        assert_eq!(out, b"spilled bytes");

        swap.release(&buffer).unwrap();
        assert_eq!(swap.free_bytes(), 1024);
        assert!(swap.release(&buffer).is_err());
    }

    #[test]
    fn test_first_fit_and_merge() {
        let (_dir, swap) = swap(300);
        let a = swap.write(&[1u8; 100]).unwrap();
        let b = swap.write(&[2u8; 100]).unwrap();
        let c = swap.write(&[3u8; 100]).unwrap();
        assert!(swap.write(&[4u8; 1]).is_err());

        swap.release(&a).unwrap();
        swap.release(&c).unwrap();
        assert!(swap.write(&[5u8; 150]).is_err());

        swap.release(&b).unwrap();
        let big = swap.write(&[6u8; 300]).unwrap();
        assert_eq!(big.target_offset, 0);
    }
}
