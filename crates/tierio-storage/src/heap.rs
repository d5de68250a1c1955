//! Offset-addressed heap for metadata records
//!
//! The heap is one contiguous byte region. Free blocks are threaded through
//! the region itself: each free block starts with `{ size: u32, next: u32 }`
//! where `next` is the offset of the following free block (0 terminates the
//! list). The list is kept sorted by offset so a freed block can coalesce
//! with both neighbours.
//!
//! Allocated blocks carry an 8-byte header `{ size: u32, len: u32 }` and
//! callers hold the offset of the payload. The first alignment unit of the
//! region is never handed out, so offset 0 can serve as NULL.

use tierio_common::{Error, Result};

/// Allocation granularity
pub const HEAP_ALIGNMENT: u32 = 8;

const HEADER_SIZE: u32 = 8;
const MIN_BLOCK_SIZE: u32 = HEADER_SIZE + HEAP_ALIGNMENT;
const NULL: u32 = 0;

/// Heap over an owned byte region
#[derive(Debug)]
pub struct Heap {
    region: Vec<u8>,
    free_head: u32,
    free_bytes: u64,
}

impl Heap {
    /// Create a heap of `size` bytes (rounded down to the alignment)
    pub fn new(size: u64) -> Result<Self> {
        let size = u32::try_from(size)
            .map_err(|_| Error::invalid_argument(format!("heap size {size} exceeds 32-bit offsets")))?;
        let size = size - size % HEAP_ALIGNMENT;
        if size < HEAP_ALIGNMENT + MIN_BLOCK_SIZE {
            return Err(Error::invalid_argument(format!("heap size {size} too small")));
        }

        let mut heap = Self {
            region: vec![0; size as usize],
            free_head: NULL,
            free_bytes: 0,
        };
        let first = HEAP_ALIGNMENT;
        heap.write_u32(first, size - first);
        heap.write_u32(first + 4, NULL);
        heap.free_head = first;
        heap.free_bytes = u64::from(size - first);
        Ok(heap)
    }

    /// Total size of the region
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.region.len() as u64
    }

    /// Bytes currently on the free list, headers included
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Size of the largest free block
    #[must_use]
    pub fn largest_free_block(&self) -> u64 {
        self.free_blocks().map(|(_, size)| u64::from(size)).max().unwrap_or(0)
    }

    /// Allocate `len` bytes with first fit; returns the payload offset
    pub fn allocate(&mut self, len: usize) -> Result<u32> {
        let needed = u32::try_from(len)
            .ok()
            .and_then(|len| len.checked_add(HEADER_SIZE + HEAP_ALIGNMENT - 1))
            .map(|n| (n / HEAP_ALIGNMENT * HEAP_ALIGNMENT).max(MIN_BLOCK_SIZE))
            .ok_or_else(|| self.exhausted(len as u64))?;

        let mut prev = NULL;
        let mut current = self.free_head;
        while current != NULL {
            let size = self.read_u32(current);
            let next = self.read_u32(current + 4);
            if size >= needed {
                let taken = if size - needed >= MIN_BLOCK_SIZE {
                    let rest = current + needed;
                    self.write_u32(rest, size - needed);
                    self.write_u32(rest + 4, next);
                    self.relink(prev, rest);
                    needed
                } else {
                    self.relink(prev, next);
                    size
                };
                self.free_bytes -= u64::from(taken);
                self.write_u32(current, taken);
                self.write_u32(current + 4, len as u32);
                return Ok(current + HEADER_SIZE);
            }
            prev = current;
            current = next;
        }
        Err(self.exhausted(len as u64))
    }

    /// Return an allocation to the free list, merging with adjacent free blocks
    pub fn free(&mut self, offset: u32) -> Result<()> {
        let block = self.block_of(offset)?;
        let mut size = self.read_u32(block);

        let mut prev = NULL;
        let mut next = self.free_head;
        while next != NULL && next < block {
            prev = next;
            next = self.read_u32(next + 4);
        }
        if next == block || (prev != NULL && prev + self.read_u32(prev) > block) {
            return Err(Error::internal(format!("heap offset {offset} freed twice")));
        }

        self.free_bytes += u64::from(size);

        // merge with the following free block
        let mut after = next;
        if next != NULL && block + size == next {
            size += self.read_u32(next);
            after = self.read_u32(next + 4);
        }

        // merge into the preceding free block
        if prev != NULL && prev + self.read_u32(prev) == block {
            let merged = self.read_u32(prev) + size;
            self.write_u32(prev, merged);
            self.write_u32(prev + 4, after);
        } else {
            self.write_u32(block, size);
            self.write_u32(block + 4, after);
            self.relink(prev, block);
        }
        Ok(())
    }

    /// Payload of an allocation
    pub fn get(&self, offset: u32) -> Result<&[u8]> {
        let block = self.block_of(offset)?;
        let len = self.read_u32(block + 4) as usize;
        let start = offset as usize;
        Ok(&self.region[start..start + len])
    }

    /// Mutable payload of an allocation
    pub fn get_mut(&mut self, offset: u32) -> Result<&mut [u8]> {
        let block = self.block_of(offset)?;
        let len = self.read_u32(block + 4) as usize;
        let start = offset as usize;
        Ok(&mut self.region[start..start + len])
    }

    /// Allocate and fill a record
    pub fn store(&mut self, bytes: &[u8]) -> Result<u32> {
        let offset = self.allocate(bytes.len())?;
        self.get_mut(offset)?.copy_from_slice(bytes);
        Ok(offset)
    }

    fn block_of(&self, offset: u32) -> Result<u32> {
        if offset == NULL
            || offset % HEAP_ALIGNMENT != 0
            || offset < HEAP_ALIGNMENT + HEADER_SIZE
            || offset as usize >= self.region.len()
        {
            return Err(Error::invalid_argument(format!("invalid heap offset {offset}")));
        }
        let block = offset - HEADER_SIZE;
        let size = self.read_u32(block);
        let len = self.read_u32(block + 4);
        if size < MIN_BLOCK_SIZE
            || (block + size) as usize > self.region.len()
            || len > size - HEADER_SIZE
        {
            return Err(Error::invalid_argument(format!("heap offset {offset} is not an allocation")));
        }
        Ok(block)
    }

    fn relink(&mut self, prev: u32, next: u32) {
        if prev == NULL {
            self.free_head = next;
        } else {
            self.write_u32(prev + 4, next);
        }
    }

    fn free_blocks(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut current = self.free_head;
        std::iter::from_fn(move || {
            if current == NULL {
                return None;
            }
            let block = (current, self.read_u32(current));
            current = self.read_u32(current + 4);
            Some(block)
        })
    }

    fn exhausted(&self, requested: u64) -> Error {
        Error::HeapExhausted {
            requested,
            available: self.largest_free_block(),
        }
    }

    fn read_u32(&self, at: u32) -> u32 {
        let at = at as usize;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.region[at..at + 4]);
        u32::from_le_bytes(word)
    }

    fn write_u32(&mut self, at: u32, value: u32) {
        let at = at as usize;
        self.region[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_get() {
        let mut heap = Heap::new(4096).unwrap();
        let a = heap.store(b"hello").unwrap();
        let b = heap.store(b"world!!").unwrap();
        assert_ne!(a, 0);
        assert_eq!(heap.get(a).unwrap(), b"hello");
        assert_eq!(heap.get(b).unwrap(), b"world!!");
    }

    #[test]
    fn test_free_coalesces() {
        let mut heap = Heap::new(1024).unwrap();
        let initial = heap.free_bytes();

        let offsets: Vec<u32> = (0..4).map(|_| heap.allocate(100).unwrap()).collect();
        assert!(heap.free_bytes() < initial);

        // free out of order; neighbours must merge back into one block
        heap.free(offsets[1]).unwrap();
        heap.free(offsets[3]).unwrap();
        heap.free(offsets[0]).unwrap();
        heap.free(offsets[2]).unwrap();

        assert_eq!(heap.free_bytes(), initial);
        assert_eq!(heap.largest_free_block(), initial);
    }

    #[test]
    fn test_first_fit_reuses_hole() {
        let mut heap = Heap::new(1024).unwrap();
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();
        heap.free(a).unwrap();
        assert_eq!(heap.allocate(32).unwrap(), a);
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let mut heap = Heap::new(256).unwrap();
        let err = heap.allocate(1024).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::HeapExhausted { requested: 1024, .. }));
    }

    #[test]
    fn test_rejects_bad_offsets() {
        let mut heap = Heap::new(1024).unwrap();
        let a = heap.allocate(16).unwrap();
        assert!(heap.free(0).is_err());
        assert!(heap.get(a + 1).is_err());
        heap.free(a).unwrap();
        assert!(heap.free(a).is_err());
    }
}
