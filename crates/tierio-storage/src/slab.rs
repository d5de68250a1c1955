//! Slab allocator for one buffering target
//!
//! A target's blocks are partitioned into slab classes. Every class hands out
//! buffers of `unit_blocks` contiguous blocks; unit sizes ascend and each one
//! divides the next, so `factor` neighbouring buffers of one class can merge
//! into a buffer of the next class and a buffer can split back.
//!
//! Each block owns a [`BufferHeader`]. A buffer is named by the index of its
//! first block; headers of the other blocks in the buffer are dormant. Free
//! lists are threaded through the headers as `index + 1` so that 0 can mean
//! "end of list" regardless of where the allocator lives.

use std::collections::HashSet;
use tierio_common::config::SlabConfig;
use tierio_common::{Error, Result};
use tracing::debug;

const NIL: u32 = 0;

#[derive(Clone, Copy, Debug, Default)]
struct BufferHeader {
    /// Next free buffer of the same class (`index + 1`, 0 ends the list)
    next_free: u32,
    /// Length in blocks; 0 marks a dormant header
    units: u32,
    class: u8,
    in_use: bool,
}

#[derive(Clone, Copy, Debug)]
struct SlabClass {
    unit_blocks: u32,
    free_head: u32,
    free_count: usize,
}

/// A buffer handed out by the allocator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabBuffer {
    /// First block of the buffer
    pub block: u32,
    /// Byte offset within the target
    pub offset: u64,
    /// Reserved bytes
    pub capacity: u64,
}

/// Per-target slab allocator
#[derive(Debug)]
pub struct SlabAllocator {
    block_size: u64,
    headers: Vec<BufferHeader>,
    classes: Vec<SlabClass>,
    total_capacity: u64,
    free_capacity: u64,
}

impl SlabAllocator {
    /// Partition `capacity` bytes into the given slab classes
    ///
    /// Class `k` receives `floor(capacity * share_k / buffer_size_k)` buffers;
    /// blocks left over after all classes are carved into buffers of the
    /// smallest class.
    pub fn new(block_size: u64, capacity: u64, slabs: &[SlabConfig]) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::invalid_argument("block size must be non-zero"));
        }
        if slabs.is_empty() || slabs.len() > usize::from(u8::MAX) {
            return Err(Error::invalid_argument(format!(
                "{} slab classes configured",
                slabs.len()
            )));
        }
        for pair in slabs.windows(2) {
            let (small, big) = (pair[0].unit_size, pair[1].unit_size);
            if small == 0 || big <= small || big % small != 0 {
                return Err(Error::invalid_argument(format!(
                    "slab unit sizes {small} and {big} must ascend and divide"
                )));
            }
        }

        let num_blocks = u32::try_from(capacity / block_size)
            .map_err(|_| Error::invalid_argument(format!("{capacity} bytes is too many blocks")))?;

        let mut allocator = Self {
            block_size,
            headers: vec![BufferHeader::default(); num_blocks as usize],
            classes: slabs
                .iter()
                .map(|s| SlabClass {
                    unit_blocks: s.unit_size,
                    free_head: NIL,
                    free_count: 0,
                })
                .collect(),
            total_capacity: 0,
            free_capacity: 0,
        };

        let mut layout: Vec<Vec<u32>> = vec![Vec::new(); slabs.len()];
        let mut cursor: u32 = 0;
        for (class, slab) in slabs.iter().enumerate() {
            let buffer_bytes = u64::from(slab.unit_size) * block_size;
            let count = ((capacity as f64 * slab.share) / buffer_bytes as f64).floor() as u64;
            for _ in 0..count {
                if cursor + slab.unit_size > num_blocks {
                    break;
                }
                layout[class].push(cursor);
                cursor += slab.unit_size;
            }
        }
        let smallest = slabs[0].unit_size;
        while cursor + smallest <= num_blocks {
            layout[0].push(cursor);
            cursor += smallest;
        }

        for (class, blocks) in layout.iter().enumerate() {
            let units = slabs[class].unit_size;
            // push in reverse so the lowest block is handed out first
            for &block in blocks.iter().rev() {
                allocator.headers[block as usize] = BufferHeader {
                    next_free: NIL,
                    units,
                    class: class as u8,
                    in_use: true,
                };
                allocator.total_capacity += u64::from(units) * block_size;
                allocator.push_free(block);
            }
        }

        debug!(
            "Slab allocator: {} blocks of {} bytes, classes {:?}",
            num_blocks,
            block_size,
            allocator
                .classes
                .iter()
                .map(|c| (c.unit_blocks, c.free_count))
                .collect::<Vec<_>>()
        );
        Ok(allocator)
    }

    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Bytes per buffer of `class`
    #[must_use]
    pub fn buffer_size(&self, class: usize) -> u64 {
        u64::from(self.classes[class].unit_blocks) * self.block_size
    }

    /// Free buffers of `class`
    #[must_use]
    pub fn free_count(&self, class: usize) -> usize {
        self.classes[class].free_count
    }

    /// Bytes covered by buffers, free or not
    #[must_use]
    pub const fn total_capacity(&self) -> u64 {
        self.total_capacity
    }

    /// Bytes covered by free buffers
    #[must_use]
    pub const fn free_capacity(&self) -> u64 {
        self.free_capacity
    }

    /// Reserve buffers covering `size` bytes
    ///
    /// Buffers come from the largest class first. Whatever is left is served
    /// by the smallest class able to hold it, splitting a larger free buffer
    /// when that class is empty. Either the full size is covered or nothing
    /// is reserved.
    pub fn allocate(&mut self, size: u64) -> Result<Vec<SlabBuffer>> {
        let mut taken = Vec::new();
        let mut remaining = size;

        for class in (0..self.classes.len()).rev() {
            let buffer_size = self.buffer_size(class);
            while remaining >= buffer_size {
                let Some(block) = self.pop_free(class) else { break };
                taken.push(block);
                remaining -= buffer_size;
            }
        }

        if remaining > 0 {
            match self.take_tail(remaining) {
                Some(block) => taken.push(block),
                None => {
                    for &block in &taken {
                        self.push_free(block);
                    }
                    return Err(Error::storage(format!(
                        "slab allocator cannot cover {size} bytes ({} free)",
                        self.free_capacity
                    )));
                }
            }
        }

        Ok(taken.into_iter().map(|block| self.describe(block)).collect())
    }

    /// Smallest buffer able to hold `remaining`, splitting if needed
    fn take_tail(&mut self, remaining: u64) -> Option<u32> {
        let target = (0..self.classes.len()).find(|&c| self.buffer_size(c) >= remaining)?;
        if let Some(block) = self.pop_free(target) {
            return Some(block);
        }
        let donor = (target + 1..self.classes.len()).find(|&c| self.classes[c].free_count > 0)?;
        for class in (target + 1..=donor).rev() {
            self.split_one(class)?;
        }
        self.pop_free(target)
    }

    /// Return a buffer by its byte offset; yields the capacity restored
    pub fn release(&mut self, offset: u64) -> Result<u64> {
        let block = self.block_at(offset)?;
        let header = self.headers[block as usize];
        if !header.in_use {
            return Err(Error::storage(format!("buffer at offset {offset} is already free")));
        }
        self.push_free(block);
        Ok(u64::from(header.units) * self.block_size)
    }

    /// Split every free buffer of `class` into buffers of `class - 1`
    pub fn split_free_list(&mut self, class: usize) -> usize {
        if class == 0 || class >= self.classes.len() {
            return 0;
        }
        let mut splits = 0;
        while self.split_one(class).is_some() {
            splits += 1;
        }
        splits
    }

    /// Merge runs of contiguous free buffers of `class` into `class + 1`
    pub fn merge_free_list(&mut self, class: usize) -> usize {
        if class + 1 >= self.classes.len() {
            return 0;
        }
        let units = self.classes[class].unit_blocks;
        let factor = self.classes[class + 1].unit_blocks / units;

        let mut free = self.drain_free_list(class);
        free.sort_unstable();
        let mut available: HashSet<u32> = free.iter().copied().collect();

        let mut merges = 0;
        for &start in &free {
            let run_free = (0..factor).all(|i| available.contains(&(start + i * units)));
            if !run_free {
                continue;
            }
            for i in 0..factor {
                let block = start + i * units;
                available.remove(&block);
                self.headers[block as usize] = BufferHeader::default();
            }
            self.headers[start as usize] = BufferHeader {
                next_free: NIL,
                units: units * factor,
                class: (class + 1) as u8,
                in_use: true,
            };
            self.push_free(start);
            merges += 1;
        }

        for &block in free.iter().rev() {
            if available.contains(&block) {
                self.push_free(block);
            }
        }
        merges
    }

    /// Merge every class into the next, smallest first
    pub fn merge_free_lists(&mut self) -> usize {
        (0..self.classes.len().saturating_sub(1))
            .map(|class| self.merge_free_list(class))
            .sum()
    }

    fn split_one(&mut self, class: usize) -> Option<()> {
        if class == 0 {
            return None;
        }
        let block = self.pop_free(class)?;
        let smaller = self.classes[class - 1].unit_blocks;
        let factor = self.classes[class].unit_blocks / smaller;
        for i in (0..factor).rev() {
            let piece = block + i * smaller;
            self.headers[piece as usize] = BufferHeader {
                next_free: NIL,
                units: smaller,
                class: (class - 1) as u8,
                in_use: true,
            };
            self.push_free(piece);
        }
        Some(())
    }

    fn drain_free_list(&mut self, class: usize) -> Vec<u32> {
        let mut blocks = Vec::with_capacity(self.classes[class].free_count);
        while let Some(block) = self.pop_free(class) {
            blocks.push(block);
        }
        blocks
    }

    fn push_free(&mut self, block: u32) {
        let header = &mut self.headers[block as usize];
        let class = usize::from(header.class);
        header.in_use = false;
        header.next_free = self.classes[class].free_head;
        self.classes[class].free_head = block + 1;
        self.classes[class].free_count += 1;
        self.free_capacity += u64::from(header.units) * self.block_size;
    }

    fn pop_free(&mut self, class: usize) -> Option<u32> {
        let head = self.classes[class].free_head;
        if head == NIL {
            return None;
        }
        let block = head - 1;
        let header = &mut self.headers[block as usize];
        self.classes[class].free_head = header.next_free;
        self.classes[class].free_count -= 1;
        header.next_free = NIL;
        header.in_use = true;
        self.free_capacity -= u64::from(header.units) * self.block_size;
        Some(block)
    }

    fn describe(&self, block: u32) -> SlabBuffer {
        SlabBuffer {
            block,
            offset: u64::from(block) * self.block_size,
            capacity: u64::from(self.headers[block as usize].units) * self.block_size,
        }
    }

    fn block_at(&self, offset: u64) -> Result<u32> {
        let block = offset / self.block_size;
        if offset % self.block_size != 0
            || block >= self.headers.len() as u64
            || self.headers[block as usize].units == 0
        {
            return Err(Error::storage(format!("no buffer starts at offset {offset}")));
        }
        Ok(block as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierio_common::KIB;

    // 32 blocks of 4 KiB: sixteen 4 KiB buffers then four 16 KiB buffers
    fn allocator() -> SlabAllocator {
        SlabAllocator::new(
            4 * KIB,
            128 * KIB,
            &[SlabConfig::new(1, 0.5), SlabConfig::new(4, 0.5)],
        )
        .unwrap()
    }

    #[test]
    fn test_partition() {
        let slab = allocator();
        assert_eq!(slab.free_count(0), 16);
        assert_eq!(slab.free_count(1), 4);
        assert_eq!(slab.total_capacity(), 128 * KIB);
        assert_eq!(slab.free_capacity(), 128 * KIB);
    }

    #[test]
    fn test_leftover_goes_to_smallest_class() {
        let slab = SlabAllocator::new(
            4 * KIB,
            64 * KIB,
            &[
                SlabConfig::new(1, 0.25),
                SlabConfig::new(4, 0.25),
                SlabConfig::new(16, 0.25),
                SlabConfig::new(32, 0.25),
            ],
        )
        .unwrap();
        assert_eq!(slab.free_count(0), 12);
        assert_eq!(slab.free_count(1), 1);
        assert_eq!(slab.free_count(2), 0);
        assert_eq!(slab.total_capacity(), 64 * KIB);
    }

    #[test]
    fn test_rejects_bad_classes() {
        let err = SlabAllocator::new(4 * KIB, 64 * KIB, &[SlabConfig::new(2, 0.5), SlabConfig::new(3, 0.5)]);
        assert!(err.is_err());
        assert!(SlabAllocator::new(0, 64 * KIB, &[SlabConfig::new(1, 1.0)]).is_err());
    }

    #[test]
    fn test_largest_first() {
        let mut slab = allocator();
        let buffers = slab.allocate(40 * KIB).unwrap();
        let sizes: Vec<u64> = buffers.iter().map(|b| b.capacity).collect();
        assert_eq!(sizes, vec![16 * KIB, 16 * KIB, 4 * KIB, 4 * KIB]);
        assert_eq!(slab.free_capacity(), 88 * KIB);
    }

    #[test]
    fn test_tail_uses_smallest_fitting_class() {
        let mut slab = allocator();
        let buffers = slab.allocate(17 * KIB).unwrap();
        let sizes: Vec<u64> = buffers.iter().map(|b| b.capacity).collect();
        assert_eq!(sizes, vec![16 * KIB, 4 * KIB]);
    }

    #[test]
    fn test_tail_splits_larger_buffer() {
        let mut slab = allocator();
        for _ in 0..16 {
            slab.allocate(4 * KIB).unwrap();
        }
        assert_eq!(slab.free_count(0), 0);

        let buffers = slab.allocate(2 * KIB).unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].capacity, 4 * KIB);
        assert_eq!(slab.free_count(0), 3);
        assert_eq!(slab.free_count(1), 3);
        assert_eq!(slab.free_capacity(), 128 * KIB - 68 * KIB);
    }

    #[test]
    fn test_all_or_nothing() {
        let mut slab = allocator();
        slab.allocate(100 * KIB).unwrap();
        let free_before = slab.free_capacity();
        assert!(slab.allocate(64 * KIB).is_err());
        assert_eq!(slab.free_capacity(), free_before);
    }

    #[test]
    fn test_release_restores_capacity() {
        let mut slab = allocator();
        let buffers = slab.allocate(20 * KIB).unwrap();
        for buffer in &buffers {
            assert_eq!(slab.release(buffer.offset).unwrap(), buffer.capacity);
        }
        assert_eq!(slab.free_capacity(), 128 * KIB);
        assert!(slab.release(buffers[0].offset).is_err());
        assert!(slab.release(4 * KIB + 1).is_err());
    }

    #[test]
    fn test_split_then_merge_roundtrip() {
        let mut slab = allocator();
        assert_eq!(slab.split_free_list(1), 4);
        assert_eq!(slab.free_count(0), 32);
        assert_eq!(slab.free_count(1), 0);

        assert_eq!(slab.merge_free_lists(), 8);
        assert_eq!(slab.free_count(0), 0);
        assert_eq!(slab.free_count(1), 8);
        assert_eq!(slab.free_capacity(), 128 * KIB);

        let buffer = slab.allocate(16 * KIB).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer[0].capacity, 16 * KIB);
    }

    #[test]
    fn test_merge_skips_runs_with_live_buffers() {
        let mut slab = allocator();
        let live = slab.allocate(4 * KIB).unwrap();
        assert_eq!(live[0].block, 0);

        // blocks 1..16 are free: three runs of four merge, three buffers remain
        assert_eq!(slab.merge_free_list(0), 3);
        assert_eq!(slab.free_count(0), 3);
        assert_eq!(slab.free_count(1), 7);
        assert_eq!(slab.free_capacity(), 124 * KIB);
    }
}
