//! tierio metadata - name and id maps, buffer lists, owner routing
//!
//! Each node owns a slice of the bucket, vbucket and blob namespaces, picked
//! by hashing names. [`MetadataManager`] serves its own slice and forwards
//! everything else to the owner over a [`Transport`](tierio_common::Transport).

pub mod bucket;
pub mod manager;
pub mod object;
pub mod store;
pub mod types;

pub use bucket::{BucketTable, VBucketTable};
pub use manager::{BlobLockGuard, MetadataManager};
pub use object::BlobTable;
pub use store::BufferListStore;
pub use types::{BlobSummary, blob_key, owner_of};
