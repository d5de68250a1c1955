//! Buffer lists stored in the metadata heap
//!
//! Every blob's `Vec<BufferInfo>` is bincode-encoded into one heap
//! allocation; the blob table keeps only the offset. Updates write the new
//! list before freeing the old one, so a full heap leaves the previous list
//! intact.

use parking_lot::Mutex;
use tierio_common::{BufferInfo, Result};
use tierio_storage::Heap;
use tracing::error;

/// Heap-backed store of encoded buffer lists
pub struct BufferListStore {
    heap: Mutex<Heap>,
}

impl BufferListStore {
    /// Create a store over a fresh heap of `heap_size` bytes
    pub fn new(heap_size: u64) -> Result<Self> {
        Ok(Self {
            heap: Mutex::new(Heap::new(heap_size)?),
        })
    }

    /// Encode and store a list, returning its offset
    pub fn put(&self, buffers: &[BufferInfo]) -> Result<u32> {
        let bytes = bincode::serialize(buffers)?;
        let offset = self.heap.lock().store(&bytes);
        if let Err(e) = &offset {
            error!("Failed to store buffer list of {} entries: {}", buffers.len(), e);
        }
        offset
    }

    /// Decode the list at `offset`
    pub fn get(&self, offset: u32) -> Result<Vec<BufferInfo>> {
        let heap = self.heap.lock();
        Ok(bincode::deserialize(heap.get(offset)?)?)
    }

    /// Store `buffers` in place of the list at `offset`; returns the new offset
    pub fn replace(&self, offset: u32, buffers: &[BufferInfo]) -> Result<u32> {
        let new_offset = self.put(buffers)?;
        self.heap.lock().free(offset)?;
        Ok(new_offset)
    }

    /// Free the list at `offset`
    pub fn delete(&self, offset: u32) -> Result<()> {
        self.heap.lock().free(offset)
    }

    /// Bytes still free in the heap
    pub fn free_bytes(&self) -> u64 {
        self.heap.lock().free_bytes()
    }
}
