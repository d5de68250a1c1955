//! tierio Storage - buffering devices of one node
//!
//! This crate implements the physical side of buffering:
//! - Offset-addressed heap for metadata records
//! - Slab allocation of device blocks into buffers
//! - RAM and file device I/O
//! - Buffer pool tying allocators, devices and the target registry together
//! - File-backed swap space for blobs that fit nowhere else

pub mod buffer_pool;
pub mod heap;
pub mod io_client;
pub mod slab;
pub mod swap;

pub use buffer_pool::{BufferPool, PoolStats};
pub use heap::Heap;
pub use io_client::IoClient;
pub use slab::{SlabAllocator, SlabBuffer};
pub use swap::{Extent, SwapSpace};
