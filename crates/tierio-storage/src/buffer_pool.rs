//! Buffer pool of one node
//!
//! Owns a slab allocator and an I/O client per local target plus the swap
//! space, and keeps the target registry's remaining capacity in step with the
//! allocators: every reservation consumes the buffers' reserved capacity and
//! every release gives it back.

use crate::io_client::IoClient;
use crate::slab::SlabAllocator;
use crate::swap::SwapSpace;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_common::config::{DeviceConfig, SwapConfig};
use tierio_common::{
    BufferInfo, DeviceId, Error, NodeId, PlacementSchema, Result, TargetId, TargetInfo, TargetRegistry,
};
use tracing::{debug, info, warn};

/// Buffer pool statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    pub allocations: AtomicU64,
    pub releases: AtomicU64,
    pub failed_allocations: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
    pub swap_writes: AtomicU64,
}

impl PoolStats {
    fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Device {
    target: TargetId,
    name: String,
    slab: Mutex<SlabAllocator>,
    io: IoClient,
}

/// Slab-based buffer pool over the local targets
#[derive(Debug)]
pub struct BufferPool {
    node_id: NodeId,
    devices: Vec<Device>,
    registry: Arc<TargetRegistry>,
    swap: SwapSpace,
    stats: PoolStats,
}

impl BufferPool {
    /// Build the pool and register one target per device
    pub fn new(node_id: NodeId, devices: &[DeviceConfig], swap: &SwapConfig) -> Result<Self> {
        let mut registry = TargetRegistry::new(node_id);
        let mut built = Vec::with_capacity(devices.len());

        for (index, config) in devices.iter().enumerate() {
            let device_id = u8::try_from(index)
                .ok()
                .filter(|&d| !DeviceId::new(d).is_swap())
                .ok_or_else(|| Error::configuration(format!("too many devices ({})", devices.len())))?;
            let target = TargetId::new(node_id, DeviceId::new(device_id), u16::from(device_id));

            let slab = SlabAllocator::new(config.block_size, config.capacity, &config.slabs)?;
            let capacity = slab.total_capacity();
            let file_name = format!("{}-node{}.dat", config.name, node_id);
            let io = IoClient::init(config.kind, config.mount_point.as_deref(), &file_name, config.capacity)?;

            registry.register(TargetInfo {
                id: target,
                max_capacity: capacity,
                remaining_capacity: capacity,
                bandwidth: config.bandwidth_mbps,
                latency: config.latency_us,
                block_size: config.block_size,
            })?;
            debug!(
                "Target {} ({}): {} bytes, {} MiB/s",
                target, config.name, capacity, config.bandwidth_mbps
            );

            built.push(Device {
                target,
                name: config.name.clone(),
                slab: Mutex::new(slab),
                io,
            });
        }

        let swap = SwapSpace::new(node_id, swap)?;
        info!(
            "Buffer pool for node {} ready: {} targets, {} bytes of swap",
            node_id,
            built.len(),
            swap.capacity()
        );

        Ok(Self {
            node_id,
            devices: built,
            registry: Arc::new(registry),
            swap,
            stats: PoolStats::default(),
        })
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Registry shared with the metadata manager
    #[must_use]
    pub const fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn stats(&self) -> &PoolStats {
        &self.stats
    }

    #[must_use]
    pub const fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    /// Whether `target` is served by this pool
    #[must_use]
    pub fn is_local(&self, target: TargetId) -> bool {
        target == self.swap.target() || self.registry.contains(target)
    }

    fn device(&self, target: TargetId) -> Result<&Device> {
        if target.node_id != self.node_id {
            return Err(Error::TargetNotFound(target));
        }
        self.devices
            .get(usize::from(target.device_id.get()))
            .filter(|d| d.target == target)
            .ok_or(Error::TargetNotFound(target))
    }

    /// Reserve buffers covering `size` blob bytes starting at `blob_offset`
    ///
    /// All or nothing: on failure no buffer stays reserved.
    pub fn allocate_segment(&self, target: TargetId, blob_offset: u64, size: u64) -> Result<Vec<BufferInfo>> {
        let device = self.device(target)?;
        let reserved = {
            let mut slab = device.slab.lock();
            let buffers = match slab.allocate(size) {
                Ok(buffers) => buffers,
                Err(e) => {
                    PoolStats::add(&self.stats.failed_allocations, 1);
                    debug!("Allocation of {} bytes on {} failed: {}", size, device.name, e);
                    return Err(Error::OutOfCapacity { target, requested: size });
                }
            };
            let capacity: u64 = buffers.iter().map(|b| b.capacity).sum();
            if let Err(e) = self.registry.consume(target, capacity) {
                for buffer in &buffers {
                    if let Err(release) = slab.release(buffer.offset) {
                        warn!("Buffer at {} on {} leaked: {}", buffer.offset, device.name, release);
                    }
                }
                PoolStats::add(&self.stats.failed_allocations, 1);
                return Err(e);
            }
            buffers
        };

        PoolStats::add(&self.stats.allocations, reserved.len() as u64);
        let mut cursor = 0;
        Ok(reserved
            .into_iter()
            .map(|buffer| {
                let blob_size = buffer.capacity.min(size - cursor);
                let info = BufferInfo {
                    target_id: target,
                    target_offset: buffer.offset,
                    target_size: buffer.capacity,
                    blob_offset: blob_offset + cursor,
                    blob_size,
                };
                cursor += blob_size;
                info
            })
            .collect())
    }

    /// Reserve buffers for `data` and write it; all or nothing
    pub fn write_segment(&self, target: TargetId, blob_offset: u64, data: &[u8]) -> Result<Vec<BufferInfo>> {
        let buffers = self.allocate_segment(target, blob_offset, data.len() as u64)?;
        for buffer in &buffers {
            let start = (buffer.blob_offset - blob_offset) as usize;
            let slice = &data[start..start + buffer.blob_size as usize];
            if let Err(e) = self.write_buffer(buffer, slice) {
                warn!("Write to {} failed, rolling back segment: {}", target, e);
                if let Err(release) = self.release_buffers(&buffers) {
                    warn!("Rollback on {} left buffers reserved: {}", target, release);
                }
                return Err(e);
            }
        }
        Ok(buffers)
    }

    /// Reserve buffers for every entry of `schema` without writing
    ///
    /// Used for move destinations; all or nothing across the schema.
    pub fn allocate_buffers(&self, schema: &PlacementSchema) -> Result<Vec<BufferInfo>> {
        let mut result = Vec::new();
        let mut blob_offset = 0;
        for entry in schema {
            match self.allocate_segment(entry.target, blob_offset, entry.size) {
                Ok(buffers) => result.extend(buffers),
                Err(e) => {
                    if let Err(release) = self.release_buffers(&result) {
                        warn!("Rollback of {} reserved buffers failed: {}", result.len(), release);
                    }
                    return Err(e);
                }
            }
            blob_offset += entry.size;
        }
        Ok(result)
    }

    /// Return buffers to their free lists
    ///
    /// Every buffer is attempted; the first error is reported.
    pub fn release_buffers(&self, buffers: &[BufferInfo]) -> Result<()> {
        let mut first_error = None;
        for buffer in buffers {
            if let Err(e) = self.release_buffer(buffer) {
                warn!("Failed to release buffer on {}: {}", buffer.target_id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn release_buffer(&self, buffer: &BufferInfo) -> Result<()> {
        if buffer.target_id == self.swap.target() {
            self.swap.release(buffer)?;
        } else {
            let device = self.device(buffer.target_id)?;
            let restored = device.slab.lock().release(buffer.target_offset)?;
            self.registry.restore(buffer.target_id, restored)?;
        }
        PoolStats::add(&self.stats.releases, 1);
        Ok(())
    }

    /// Write one buffer's slice of a blob
    pub fn write_buffer(&self, buffer: &BufferInfo, data: &[u8]) -> Result<()> {
        if data.len() as u64 != buffer.blob_size || buffer.blob_size > buffer.target_size {
            return Err(Error::invalid_argument(format!(
                "{} bytes do not fit buffer of {} on {}",
                data.len(),
                buffer.target_size,
                buffer.target_id
            )));
        }
        if buffer.target_id == self.swap.target() {
            return Err(Error::invalid_argument("swap buffers are written whole"));
        }
        self.device(buffer.target_id)?.io.write(buffer.target_offset, data)?;
        PoolStats::add(&self.stats.bytes_written, data.len() as u64);
        Ok(())
    }

    /// Read one buffer's slice of a blob into `out`
    pub fn read_buffer(&self, buffer: &BufferInfo, out: &mut [u8]) -> Result<()> {
        if out.len() as u64 != buffer.blob_size {
            return Err(Error::invalid_argument(format!(
                "read of {} bytes from buffer holding {}",
                out.len(),
                buffer.blob_size
            )));
        }
        if buffer.target_id == self.swap.target() {
            self.swap.read(buffer, out)?;
        } else {
            self.device(buffer.target_id)?.io.read(buffer.target_offset, out)?;
        }
        PoolStats::add(&self.stats.bytes_read, out.len() as u64);
        Ok(())
    }

    /// Store a whole blob in swap space
    pub fn write_to_swap(&self, data: &[u8]) -> Result<BufferInfo> {
        let buffer = self.swap.write(data)?;
        PoolStats::add(&self.stats.swap_writes, 1);
        info!("Spilled {} bytes to swap on node {}", data.len(), self.node_id);
        Ok(buffer)
    }

    /// Split every free buffer of `class` on `target` into the next class down
    pub fn split_free_list(&self, target: TargetId, class: usize) -> Result<usize> {
        Ok(self.device(target)?.slab.lock().split_free_list(class))
    }

    /// Merge contiguous free buffers of `class` on `target` into the next class up
    pub fn merge_free_list(&self, target: TargetId, class: usize) -> Result<usize> {
        Ok(self.device(target)?.slab.lock().merge_free_list(class))
    }

    /// Merge free buffers upward on every target
    pub fn merge_free_lists(&self) -> usize {
        self.devices
            .iter()
            .map(|d| d.slab.lock().merge_free_lists())
            .sum()
    }
}
