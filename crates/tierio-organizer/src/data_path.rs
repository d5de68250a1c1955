//! Blob bytes between callers and buffers
//!
//! Buffers on this node go straight to the [`BufferPool`]; buffers on other
//! nodes travel as [`Request`]s to the node that owns the target.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tierio_common::{BufferInfo, Error, NodeId, PlacementSchema, Request, Response, Result, TargetId, Transport};
use tierio_storage::BufferPool;
use tracing::warn;

/// Routes buffer I/O to the node holding each target
pub struct DataPath {
    pool: Arc<BufferPool>,
    transport: Arc<dyn Transport>,
}

impl DataPath {
    #[must_use]
    pub fn new(pool: Arc<BufferPool>, transport: Arc<dyn Transport>) -> Self {
        Self { pool, transport }
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn is_local(&self, node: NodeId) -> bool {
        node == self.pool.node_id()
    }

    /// Reserve and fill buffers for one schema entry; all or nothing
    pub fn write_segment(&self, target: TargetId, blob_offset: u64, data: &[u8]) -> Result<Vec<BufferInfo>> {
        if self.is_local(target.node_id) {
            return self.pool.write_segment(target, blob_offset, data);
        }
        let request = Request::WriteSegment {
            target,
            blob_offset,
            data: Bytes::copy_from_slice(data),
        };
        self.transport.call(target.node_id, request)?.into_buffers()
    }

    /// Buffer `blob` following `schema`, on whichever nodes the entries name
    ///
    /// Stops at the first entry that cannot be buffered, so the result covers
    /// less than the blob when something failed.
    pub fn allocate_and_set_buffers(&self, schema: &PlacementSchema, blob: &[u8]) -> Vec<BufferInfo> {
        let mut result = Vec::new();
        let mut blob_offset = 0u64;
        for entry in schema {
            let start = blob_offset as usize;
            blob_offset += entry.size;
            let Some(data) = blob.get(start..blob_offset as usize) else {
                warn!("Schema covers {} bytes but the blob has {}", schema.total_size(), blob.len());
                break;
            };
            match self.write_segment(entry.target, start as u64, data) {
                Ok(buffers) => result.extend(buffers),
                Err(e) => {
                    warn!("Could not buffer {} bytes on {}: {}", entry.size, entry.target, e);
                    break;
                }
            }
        }
        result
    }

    /// Write blob bytes into already reserved local buffers
    pub fn place_blob_in_buffers(&self, blob: &[u8], blob_start: u64, buffers: &[BufferInfo]) -> Result<()> {
        for buffer in buffers {
            if !self.is_local(buffer.target_id.node_id) {
                return Err(Error::invalid_argument(format!(
                    "buffer on {} is not writable from node {}",
                    buffer.target_id,
                    self.pool.node_id()
                )));
            }
            let start = buffer
                .blob_offset
                .checked_sub(blob_start)
                .ok_or_else(|| Error::invalid_argument("buffer starts before the data"))?
                as usize;
            let slice = blob
                .get(start..start + buffer.blob_size as usize)
                .ok_or_else(|| Error::invalid_argument("buffer extends past the data"))?;
            self.pool.write_buffer(buffer, slice)?;
        }
        Ok(())
    }

    /// Read one buffer's bytes, wherever it lives
    pub fn read_buffer(&self, buffer: &BufferInfo) -> Result<Bytes> {
        let node = buffer.target_id.node_id;
        if self.is_local(node) {
            let mut out = vec![0; buffer.blob_size as usize];
            self.pool.read_buffer(buffer, &mut out)?;
            return Ok(Bytes::from(out));
        }
        self.transport
            .call(node, Request::ReadBuffer { buffer: *buffer })?
            .into_data()
    }

    /// Gather the bytes of `buffers` in list order
    pub fn read_blob_from_buffers(&self, buffers: &[BufferInfo]) -> Result<Vec<u8>> {
        let total: u64 = buffers.iter().map(|b| b.blob_size).sum();
        let mut blob = Vec::with_capacity(total as usize);
        for buffer in buffers {
            let data = self.read_buffer(buffer)?;
            if data.len() as u64 != buffer.blob_size {
                return Err(Error::storage(format!(
                    "short read from {}: {} of {} bytes",
                    buffer.target_id,
                    data.len(),
                    buffer.blob_size
                )));
            }
            blob.extend_from_slice(&data);
        }
        Ok(blob)
    }

    /// Release buffers on every node that holds some of them
    ///
    /// Every node is attempted; the first error is reported.
    pub fn release_buffers(&self, buffers: &[BufferInfo]) -> Result<()> {
        let mut by_node: BTreeMap<u32, Vec<BufferInfo>> = BTreeMap::new();
        for buffer in buffers {
            by_node.entry(buffer.target_id.node_id.get()).or_default().push(*buffer);
        }

        let mut first_error = None;
        for (node, buffers) in by_node {
            let node = NodeId::new(node);
            let result = if self.is_local(node) {
                self.pool.release_buffers(&buffers)
            } else {
                self.transport
                    .call(node, Request::ReleaseBuffers { buffers })
                    .and_then(Response::into_unit)
            };
            if let Err(e) = result {
                warn!("Failed to release buffers on node {}: {}", node, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Execute a buffer request addressed to this node
    pub fn serve(&self, request: Request) -> Result<Response> {
        match request {
            Request::WriteSegment { target, blob_offset, data } => Ok(Response::Buffers(
                self.pool.write_segment(target, blob_offset, &data)?,
            )),
            Request::ReadBuffer { buffer } => {
                let mut out = vec![0; buffer.blob_size as usize];
                self.pool.read_buffer(&buffer, &mut out)?;
                Ok(Response::Data(Bytes::from(out)))
            }
            Request::ReleaseBuffers { buffers } => {
                self.pool.release_buffers(&buffers)?;
                Ok(Response::Unit)
            }
            other => Err(Error::internal(format!(
                "{} is not a buffer procedure",
                other.proc_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierio_common::config::{DeviceConfig, DeviceKind, SwapConfig};
    use tierio_common::{KIB, NoTransport};

    fn pool() -> Arc<BufferPool> {
        let devices = vec![DeviceConfig::ram("ram", 64 * KIB, 4 * KIB)];
        let swap = SwapConfig {
            kind: DeviceKind::Ram,
            mount_point: None,
            capacity: 64 * KIB,
        };
        Arc::new(BufferPool::new(NodeId::new(1), &devices, &swap).unwrap())
    }

    #[test]
    fn test_scatter_gather() {
        let path = DataPath::new(pool(), Arc::new(NoTransport));
        let target = path.pool().registry().infos()[0].id;
        let blob: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut schema = PlacementSchema::new();
        schema.push(3000, target);
        schema.push(7000, target);
        let buffers = path.allocate_and_set_buffers(&schema, &blob);
        assert_eq!(buffers.iter().map(|b| b.blob_size).sum::<u64>(), 10_000);
        assert_eq!(path.read_blob_from_buffers(&buffers).unwrap(), blob);

        path.release_buffers(&buffers).unwrap();
        let info = path.pool().registry().get(target).unwrap();
        assert_eq!(info.remaining_capacity, info.max_capacity);
    }

    #[test]
    fn test_scatter_stops_at_first_failed_entry() {
        let path = DataPath::new(pool(), Arc::new(NoTransport));
        let target = path.pool().registry().infos()[0].id;
        let blob = vec![7u8; 72 * KIB as usize];

        let mut schema = PlacementSchema::new();
        schema.push(8 * KIB, target);
        schema.push(64 * KIB, target);
        let buffers = path.allocate_and_set_buffers(&schema, &blob);
        assert_eq!(buffers.iter().map(|b| b.blob_size).sum::<u64>(), 8 * KIB);
        assert!(!tierio_common::buffers_cover_exactly(&buffers, blob.len() as u64));
        let stats = path.pool().stats();
        assert_eq!(stats.failed_allocations.load(std::sync::atomic::Ordering::Relaxed), 1);

        path.release_buffers(&buffers).unwrap();
        assert_eq!(path.pool().registry().remaining_capacity(target).unwrap(), 64 * KIB);
    }

    #[test]
    fn test_place_into_reserved_buffers() {
        let path = DataPath::new(pool(), Arc::new(NoTransport));
        let target = path.pool().registry().infos()[0].id;
        let buffers = path.pool().allocate_segment(target, 100, 5000).unwrap();
        let data = vec![7u8; 5000];

        path.place_blob_in_buffers(&data, 100, &buffers).unwrap();
        assert_eq!(path.read_blob_from_buffers(&buffers).unwrap(), data);
        assert!(path.place_blob_in_buffers(&data, 200, &buffers).is_err());
    }

    #[test]
    fn test_remote_without_transport_fails() {
        let path = DataPath::new(pool(), Arc::new(NoTransport));
        let remote = TargetId::new(NodeId::new(2), tierio_common::DeviceId::new(0), 0);
        let err = path.write_segment(remote, 0, b"abc").unwrap_err();
        assert!(matches!(err, Error::Rpc { proc_name: "WriteSegment", .. }));
    }
}
