//! Metadata manager
//!
//! Every public operation decides where its data lives and either serves it
//! from this node's tables or forwards it to the owner through the
//! [`Transport`]. Bucket and vbucket names, and blob names within a bucket,
//! hash onto their owning node; ids carry their owner.

use crate::bucket::{BucketTable, VBucketTable};
use crate::object::BlobTable;
use crate::types::{BlobSummary, blob_key, owner_of};
use std::sync::Arc;
use tierio_common::config::{MetadataConfig, NodeConfig};
use tierio_common::{
    BlobId, BlobRecord, BucketId, BufferInfo, Error, NodeId, Request, Response, Result,
    TargetInfo, TargetRegistry, TicketLock, Transport, VBucketId,
};
use tierio_placement::{TargetSource, Topology};
use tracing::{debug, trace, warn};

/// Metadata for one node, plus routing to the others
pub struct MetadataManager {
    topology: Topology,
    hash_seed: u64,
    registry: Arc<TargetRegistry>,
    transport: Arc<dyn Transport>,
    buckets: BucketTable,
    vbuckets: VBucketTable,
    blobs: BlobTable,
    blob_locks: TicketLock<BlobId>,
}

/// Holds a blob lock until dropped
pub struct BlobLockGuard<'a> {
    mdm: &'a MetadataManager,
    blob: BlobId,
}

impl Drop for BlobLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mdm.unlock_blob(self.blob) {
            warn!("Failed to unlock blob {}: {}", self.blob, e);
        }
    }
}

impl MetadataManager {
    pub fn new(
        node: &NodeConfig,
        config: &MetadataConfig,
        registry: Arc<TargetRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let topology = Topology::from_config(node);
        let node_id = topology.node_id();
        if registry.node_id() != node_id {
            return Err(Error::configuration(format!(
                "target registry belongs to node {}, not {}",
                registry.node_id(),
                node_id
            )));
        }
        Ok(Self {
            topology,
            hash_seed: config.hash_seed,
            registry,
            transport,
            buckets: BucketTable::new(node_id),
            vbuckets: VBucketTable::new(node_id),
            blobs: BlobTable::new(node_id, config.heap_size)?,
            blob_locks: TicketLock::new(),
        })
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.topology.node_id()
    }

    #[must_use]
    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    fn is_local(&self, node: NodeId) -> bool {
        node == self.node_id()
    }

    fn call(&self, node: NodeId, request: Request) -> Result<Response> {
        trace!("{} -> node {}", request.proc_name(), node);
        self.transport.call(node, request)
    }

    fn name_owner(&self, name: &str) -> NodeId {
        owner_of(name.as_bytes(), self.hash_seed, self.topology.num_nodes())
    }

    /// Node holding the metadata of blob `name` in `bucket`
    #[must_use]
    pub fn blob_owner(&self, bucket: BucketId, name: &str) -> NodeId {
        owner_of(&blob_key(bucket, name), self.hash_seed, self.topology.num_nodes())
    }

    // ---- Buckets ----

    /// Open a bucket by name, creating it if needed
    pub fn get_or_create_bucket(&self, name: &str) -> Result<BucketId> {
        let owner = self.name_owner(name);
        if self.is_local(owner) {
            let id = self.buckets.get_or_create(name);
            debug!("Opened bucket '{}' as {}", name, id);
            return Ok(id);
        }
        self.call(owner, Request::GetOrCreateBucket { name: name.to_string() })?
            .into_bucket_id()
    }

    pub fn get_bucket_id(&self, name: &str) -> Result<Option<BucketId>> {
        let owner = self.name_owner(name);
        if self.is_local(owner) {
            return Ok(self.buckets.get_id(name));
        }
        self.call(owner, Request::GetBucketId { name: name.to_string() })?
            .into_maybe_bucket_id()
    }

    pub fn close_bucket(&self, bucket: BucketId) -> Result<()> {
        if self.is_local(bucket.node_id) {
            return self.buckets.close(bucket);
        }
        self.call(bucket.node_id, Request::CloseBucket { bucket })?.into_unit()
    }

    /// Remove a bucket entry; returns the blobs that still belong to it
    pub fn destroy_bucket(&self, bucket: BucketId) -> Result<Vec<BlobId>> {
        if self.is_local(bucket.node_id) {
            return self.buckets.destroy(bucket);
        }
        self.call(bucket.node_id, Request::DestroyBucket { bucket })?
            .into_blob_ids()
    }

    pub fn bucket_blobs(&self, bucket: BucketId) -> Result<Vec<BlobId>> {
        if self.is_local(bucket.node_id) {
            return self.buckets.blobs(bucket);
        }
        self.call(bucket.node_id, Request::BucketBlobs { bucket })?
            .into_blob_ids()
    }

    fn add_blob_to_bucket(&self, bucket: BucketId, blob: BlobId) -> Result<()> {
        if self.is_local(bucket.node_id) {
            return self.buckets.add_blob(bucket, blob);
        }
        self.call(bucket.node_id, Request::AddBlobToBucket { bucket, blob })?
            .into_unit()
    }

    fn remove_blob_from_bucket(&self, bucket: BucketId, blob: BlobId) -> Result<()> {
        if self.is_local(bucket.node_id) {
            return self.buckets.remove_blob(bucket, blob);
        }
        self.call(bucket.node_id, Request::RemoveBlobFromBucket { bucket, blob })?
            .into_unit()
    }

    // ---- Virtual buckets ----

    pub fn get_or_create_vbucket(&self, name: &str) -> Result<VBucketId> {
        let owner = self.name_owner(name);
        if self.is_local(owner) {
            return Ok(self.vbuckets.get_or_create(name));
        }
        self.call(owner, Request::GetOrCreateVBucket { name: name.to_string() })?
            .into_vbucket_id()
    }

    pub fn get_vbucket_id(&self, name: &str) -> Result<Option<VBucketId>> {
        let owner = self.name_owner(name);
        if self.is_local(owner) {
            return Ok(self.vbuckets.get_id(name));
        }
        self.call(owner, Request::GetVBucketId { name: name.to_string() })?
            .into_maybe_vbucket_id()
    }

    fn vbucket_link(&self, vbucket: VBucketId, bucket: BucketId, name: &str, linked: bool) -> Result<()> {
        if self.is_local(vbucket.node_id) {
            return if linked {
                self.vbuckets.link(vbucket, bucket, name)
            } else {
                self.vbuckets.unlink(vbucket, bucket, name)
            };
        }
        let blob_name = name.to_string();
        let request = if linked {
            Request::LinkBlob { vbucket, bucket, blob_name }
        } else {
            Request::UnlinkBlob { vbucket, bucket, blob_name }
        };
        self.call(vbucket.node_id, request)?.into_unit()
    }

    fn tag_blob(&self, blob: BlobId, vbucket: VBucketId, linked: bool) -> Result<()> {
        let owner = blob.owner();
        if self.is_local(owner) {
            return self.blobs.tag(blob, vbucket, linked);
        }
        self.call(owner, Request::TagBlob { blob, vbucket, linked })?.into_unit()
    }

    /// Link an existing blob into a vbucket
    pub fn link_blob(&self, vbucket: VBucketId, bucket: BucketId, name: &str) -> Result<()> {
        let blob = self
            .get_blob_id(bucket, name)?
            .ok_or_else(|| Error::BlobNotFound(name.to_string()))?;
        self.vbucket_link(vbucket, bucket, name, true)?;
        self.tag_blob(blob, vbucket, true)
    }

    pub fn unlink_blob(&self, vbucket: VBucketId, bucket: BucketId, name: &str) -> Result<()> {
        self.vbucket_link(vbucket, bucket, name, false)?;
        if let Some(blob) = self.get_blob_id(bucket, name)? {
            self.tag_blob(blob, vbucket, false)?;
        }
        Ok(())
    }

    pub fn linked_blobs(&self, vbucket: VBucketId) -> Result<Vec<(BucketId, String)>> {
        if self.is_local(vbucket.node_id) {
            return self.vbuckets.links(vbucket);
        }
        self.call(vbucket.node_id, Request::LinkedBlobs { vbucket })?
            .into_links()
    }

    /// Remove a vbucket and untag every blob it linked
    pub fn destroy_vbucket(&self, vbucket: VBucketId) -> Result<()> {
        let links = if self.is_local(vbucket.node_id) {
            self.vbuckets.destroy(vbucket)?
        } else {
            self.call(vbucket.node_id, Request::DestroyVBucket { vbucket })?
                .into_links()?
        };
        for (bucket, name) in links {
            if let Some(blob) = self.get_blob_id(bucket, &name)? {
                match self.tag_blob(blob, vbucket, false) {
                    Err(e) if !e.is_not_found() => return Err(e),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // ---- Blobs ----

    pub fn get_blob_id(&self, bucket: BucketId, name: &str) -> Result<Option<BlobId>> {
        let owner = self.blob_owner(bucket, name);
        if self.is_local(owner) {
            return Ok(self.blobs.get_id(bucket, name));
        }
        let name = name.to_string();
        self.call(owner, Request::GetBlobId { bucket, name })?
            .into_maybe_blob_id()
    }

    /// Resolve a blob, creating a pending one on first use
    ///
    /// A pending blob is hidden from lookups and from its bucket until
    /// [`Self::commit_blob`] lands; the flag is true while it is pending.
    pub fn get_or_create_blob(&self, bucket: BucketId, name: &str) -> Result<(BlobId, bool)> {
        let owner = self.blob_owner(bucket, name);
        if self.is_local(owner) {
            return self.blobs.get_or_create(bucket, name);
        }
        let name = name.to_string();
        self.call(owner, Request::GetOrCreateBlob { bucket, name })?
            .into_blob_created()
    }

    /// Drop a pending blob after a failed write; committed blobs are kept
    pub fn discard_blob(&self, blob: BlobId) -> Result<()> {
        let owner = blob.owner();
        if self.is_local(owner) {
            if self.blobs.discard(blob)? {
                debug!("Discarded uncommitted blob {}", blob);
            }
            return Ok(());
        }
        self.call(owner, Request::DiscardBlob { blob })?.into_unit()
    }

    pub fn buffer_list(&self, blob: BlobId) -> Result<Vec<BufferInfo>> {
        let owner = blob.owner();
        if self.is_local(owner) {
            return self.blobs.buffers(blob);
        }
        self.call(owner, Request::BufferList { blob })?.into_buffers()
    }

    /// Install a blob's complete buffer list
    ///
    /// Returns the blob's id afterwards (its sign tracks swap residency) and
    /// the buffers it replaced, which the caller releases. A blob's first
    /// commit also lists it in its bucket; if that fails the blob is removed
    /// again and still owns nothing.
    pub fn commit_blob(
        &self,
        blob: BlobId,
        buffers: Vec<BufferInfo>,
        size: u64,
        user_score: f64,
    ) -> Result<(BlobId, Vec<BufferInfo>)> {
        let owner = blob.owner();
        let (blob, replaced, listed) = if self.is_local(owner) {
            self.blobs.commit(blob, &buffers, size, user_score)?
        } else {
            self.call(owner, Request::CommitBlob { blob, buffers, size, user_score })?
                .into_committed()?
        };
        if let Some(bucket) = listed
            && let Err(e) = self.add_blob_to_bucket(bucket, blob)
        {
            if let Err(undo) = self.take_blob(blob) {
                warn!("Blob {} is committed but missing from bucket {}: {}", blob, bucket, undo);
            }
            return Err(e);
        }
        Ok((blob, replaced))
    }

    /// Atomically swap some of a blob's buffers for others
    pub fn replace_buffers(
        &self,
        blob: BlobId,
        remove: Vec<BufferInfo>,
        insert: Vec<BufferInfo>,
    ) -> Result<BlobId> {
        let owner = blob.owner();
        if self.is_local(owner) {
            return self.blobs.replace_buffers(blob, &remove, &insert);
        }
        self.call(owner, Request::ReplaceBuffers { blob, remove, insert })?
            .into_blob_id()
    }

    fn take_blob(&self, blob: BlobId) -> Result<BlobRecord> {
        let owner = blob.owner();
        if self.is_local(owner) {
            return self.blobs.delete(blob);
        }
        self.call(owner, Request::DeleteBlob { blob })?.into_record()
    }

    fn install_blob(&self, record: BlobRecord) -> Result<BlobId> {
        let owner = self.blob_owner(record.bucket, &record.name);
        if self.is_local(owner) {
            return self.blobs.install(record);
        }
        self.call(owner, Request::InstallBlob { record })?.into_blob_id()
    }

    /// Forget a blob everywhere; the caller releases the returned buffers
    pub fn delete_blob(&self, blob: BlobId) -> Result<BlobRecord> {
        let record = self.take_blob(blob)?;
        // the bucket may already be gone when it is being destroyed
        match self.remove_blob_from_bucket(record.bucket, blob) {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        for &vbucket in &record.vbuckets {
            self.vbucket_link(vbucket, record.bucket, &record.name, false)?;
        }
        debug!("Deleted blob '{}' ({} bytes)", record.name, record.size);
        Ok(record)
    }

    /// Give a blob a new name within its bucket
    ///
    /// The blob may move to another owner, so it gets a new id.
    pub fn rename_blob(&self, bucket: BucketId, old_name: &str, new_name: &str) -> Result<BlobId> {
        if self.get_blob_id(bucket, new_name)?.is_some() {
            return Err(Error::invalid_argument(format!(
                "blob {} already exists in bucket {}",
                new_name, bucket
            )));
        }
        let blob = self
            .get_blob_id(bucket, old_name)?
            .ok_or_else(|| Error::BlobNotFound(old_name.to_string()))?;

        let _guard = self.lock_blob(blob)?;
        let mut record = self.take_blob(blob)?;
        record.name = new_name.to_string();
        let vbuckets = record.vbuckets.clone();
        let renamed = self.install_blob(record)?;

        self.remove_blob_from_bucket(bucket, blob)?;
        self.add_blob_to_bucket(bucket, renamed)?;
        for vbucket in vbuckets {
            self.vbucket_link(vbucket, bucket, old_name, false)?;
            self.vbucket_link(vbucket, bucket, new_name, true)?;
        }
        debug!("Renamed blob '{}' to '{}' as {}", old_name, new_name, renamed);
        Ok(renamed)
    }

    pub fn blob_size(&self, blob: BlobId) -> Result<u64> {
        let owner = blob.owner();
        if self.is_local(owner) {
            return self.blobs.size(blob);
        }
        self.call(owner, Request::BlobSize { blob })?.into_size()
    }

    pub fn blob_name(&self, blob: BlobId) -> Result<String> {
        let owner = blob.owner();
        if self.is_local(owner) {
            return self.blobs.name(blob);
        }
        self.call(owner, Request::BlobName { blob })?.into_name()
    }

    pub fn record_access(&self, blob: BlobId) -> Result<()> {
        let owner = blob.owner();
        if self.is_local(owner) {
            return self.blobs.record_access(blob);
        }
        self.call(owner, Request::RecordAccess { blob })?.into_unit()
    }

    // ---- Blob locks ----

    /// Take the blob's lock on its owner, blocking until granted
    pub fn lock_blob(&self, blob: BlobId) -> Result<BlobLockGuard<'_>> {
        let owner = blob.owner();
        if self.is_local(owner) {
            self.blob_locks.lock(blob.to_tiered());
        } else {
            self.call(owner, Request::LockBlob { blob })?.into_unit()?;
        }
        Ok(BlobLockGuard { mdm: self, blob })
    }

    fn unlock_blob(&self, blob: BlobId) -> Result<()> {
        let owner = blob.owner();
        if self.is_local(owner) {
            if !self.blob_locks.unlock(blob.to_tiered()) {
                return Err(Error::internal(format!("blob {} was not locked", blob)));
            }
            return Ok(());
        }
        self.call(owner, Request::UnlockBlob { blob })?.into_unit()
    }

    /// Blobs whose metadata lives on this node
    #[must_use]
    pub fn local_blobs(&self) -> Vec<BlobSummary> {
        self.blobs.summaries()
    }

    #[must_use]
    pub fn local_blob_count(&self) -> usize {
        self.blobs.len()
    }

    // ---- Serving remote calls ----

    /// Execute a metadata request addressed to this node
    pub fn serve(&self, request: Request) -> Result<Response> {
        let response = match request {
            Request::GetOrCreateBucket { name } => Response::BucketId(self.buckets.get_or_create(&name)),
            Request::GetBucketId { name } => Response::MaybeBucketId(self.buckets.get_id(&name)),
            Request::CloseBucket { bucket } => {
                self.buckets.close(bucket)?;
                Response::Unit
            }
            Request::DestroyBucket { bucket } => Response::BlobIds(self.buckets.destroy(bucket)?),
            Request::BucketBlobs { bucket } => Response::BlobIds(self.buckets.blobs(bucket)?),
            Request::AddBlobToBucket { bucket, blob } => {
                self.buckets.add_blob(bucket, blob)?;
                Response::Unit
            }
            Request::RemoveBlobFromBucket { bucket, blob } => {
                self.buckets.remove_blob(bucket, blob)?;
                Response::Unit
            }
            Request::GetOrCreateVBucket { name } => {
                Response::VBucketId(self.vbuckets.get_or_create(&name))
            }
            Request::GetVBucketId { name } => Response::MaybeVBucketId(self.vbuckets.get_id(&name)),
            Request::LinkBlob { vbucket, bucket, blob_name } => {
                self.vbuckets.link(vbucket, bucket, &blob_name)?;
                Response::Unit
            }
            Request::UnlinkBlob { vbucket, bucket, blob_name } => {
                self.vbuckets.unlink(vbucket, bucket, &blob_name)?;
                Response::Unit
            }
            Request::LinkedBlobs { vbucket } => Response::Links(self.vbuckets.links(vbucket)?),
            Request::TagBlob { blob, vbucket, linked } => {
                self.blobs.tag(blob, vbucket, linked)?;
                Response::Unit
            }
            Request::DestroyVBucket { vbucket } => Response::Links(self.vbuckets.destroy(vbucket)?),
            Request::GetBlobId { bucket, name } => Response::MaybeBlobId(self.blobs.get_id(bucket, &name)),
            Request::GetOrCreateBlob { bucket, name } => {
                let (blob, created) = self.blobs.get_or_create(bucket, &name)?;
                Response::BlobCreated { blob, created }
            }
            Request::BufferList { blob } => Response::Buffers(self.blobs.buffers(blob)?),
            Request::CommitBlob { blob, buffers, size, user_score } => {
                let (blob, replaced, listed) = self.blobs.commit(blob, &buffers, size, user_score)?;
                Response::Committed { blob, replaced, listed }
            }
            Request::ReplaceBuffers { blob, remove, insert } => {
                Response::BlobId(self.blobs.replace_buffers(blob, &remove, &insert)?)
            }
            Request::DeleteBlob { blob } => Response::Record(self.blobs.delete(blob)?),
            Request::DiscardBlob { blob } => {
                self.blobs.discard(blob)?;
                Response::Unit
            }
            Request::InstallBlob { record } => Response::BlobId(self.blobs.install(record)?),
            Request::BlobSize { blob } => Response::Size(self.blobs.size(blob)?),
            Request::BlobName { blob } => Response::Name(self.blobs.name(blob)?),
            Request::RecordAccess { blob } => {
                self.blobs.record_access(blob)?;
                Response::Unit
            }
            Request::LockBlob { blob } => {
                self.blob_locks.lock(blob.to_tiered());
                Response::Unit
            }
            Request::UnlockBlob { blob } => {
                self.unlock_blob(blob)?;
                Response::Unit
            }
            Request::TargetInfos => Response::Targets(self.registry.infos()),
            other => {
                return Err(Error::internal(format!(
                    "{} is not a metadata procedure",
                    other.proc_name()
                )));
            }
        };
        Ok(response)
    }
}

impl TargetSource for MetadataManager {
    fn target_infos(&self, node: NodeId) -> Result<Vec<TargetInfo>> {
        if self.is_local(node) {
            return Ok(self.registry.infos());
        }
        self.call(node, Request::TargetInfos)?.into_targets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::Weak;
    use tierio_common::{DeviceId, KIB, NoTransport, TargetId};

    fn buffer(node: u32, blob_offset: u64, blob_size: u64) -> BufferInfo {
        BufferInfo {
            target_id: TargetId::new(NodeId::new(node), DeviceId::new(0), 0),
            target_offset: blob_offset,
            target_size: blob_size,
            blob_offset,
            blob_size,
        }
    }

    fn registry(node: u32) -> Arc<TargetRegistry> {
        let mut registry = TargetRegistry::new(NodeId::new(node));
        registry
            .register(TargetInfo {
                id: TargetId::new(NodeId::new(node), DeviceId::new(0), 0),
                max_capacity: 64 * KIB,
                remaining_capacity: 64 * KIB,
                bandwidth: 1000.0,
                latency: 10.0,
                block_size: 4 * KIB,
            })
            .unwrap();
        Arc::new(registry)
    }

    fn single_node() -> MetadataManager {
        MetadataManager::new(
            &NodeConfig::default(),
            &MetadataConfig::default(),
            registry(1),
            Arc::new(NoTransport),
        )
        .unwrap()
    }

    /// Delivers requests straight to the other managers
    #[derive(Default)]
    struct Mesh {
        nodes: RwLock<Vec<Weak<MetadataManager>>>,
    }

    impl Transport for Mesh {
        fn call(&self, node: NodeId, request: Request) -> Result<Response> {
            let target = self.nodes.read()[node.get() as usize - 1].upgrade();
            let target = target.ok_or_else(|| Error::rpc(node, request.proc_name(), "node gone"))?;
            let request = Request::decode(&request.encode()?)?;
            target.serve(request)
        }
    }

    fn cluster(num_nodes: u32) -> (Arc<Mesh>, Vec<Arc<MetadataManager>>) {
        let mesh = Arc::new(Mesh::default());
        let managers: Vec<Arc<MetadataManager>> = (1..=num_nodes)
            .map(|n| {
                let node = NodeConfig {
                    node_id: n,
                    num_nodes,
                    neighborhood_radius: 1,
                };
                let transport: Arc<dyn Transport> = mesh.clone();
                Arc::new(
                    MetadataManager::new(&node, &MetadataConfig::default(), registry(n), transport)
                        .unwrap(),
                )
            })
            .collect();
        *mesh.nodes.write() = managers.iter().map(Arc::downgrade).collect();
        (mesh, managers)
    }

    #[test]
    fn test_blob_lifecycle_single_node() {
        let mdm = single_node();
        let bucket = mdm.get_or_create_bucket("b").unwrap();
        let (blob, created) = mdm.get_or_create_blob(bucket, "x").unwrap();
        assert!(created);
        assert!(mdm.bucket_blobs(bucket).unwrap().is_empty());

        let (blob, replaced) = mdm.commit_blob(blob, vec![buffer(1, 0, 10)], 10, 1.0).unwrap();
        assert!(replaced.is_empty());
        assert_eq!(mdm.bucket_blobs(bucket).unwrap(), vec![blob]);
        assert_eq!(mdm.blob_size(blob).unwrap(), 10);

        let record = mdm.delete_blob(blob).unwrap();
        assert_eq!(record.buffers, vec![buffer(1, 0, 10)]);
        assert!(mdm.bucket_blobs(bucket).unwrap().is_empty());
        assert_eq!(mdm.get_blob_id(bucket, "x").unwrap(), None);
    }

    #[test]
    fn test_vbucket_link_and_delete_cleanup() {
        let mdm = single_node();
        let bucket = mdm.get_or_create_bucket("b").unwrap();
        let vbucket = mdm.get_or_create_vbucket("v").unwrap();
        assert!(mdm.link_blob(vbucket, bucket, "missing").is_err());

        let (blob, _) = mdm.get_or_create_blob(bucket, "x").unwrap();
        mdm.commit_blob(blob, vec![], 0, 1.0).unwrap();
        mdm.link_blob(vbucket, bucket, "x").unwrap();
        assert_eq!(mdm.linked_blobs(vbucket).unwrap(), vec![(bucket, "x".to_string())]);

        let record = mdm.delete_blob(blob).unwrap();
        assert_eq!(record.vbuckets, vec![vbucket]);
        assert!(mdm.linked_blobs(vbucket).unwrap().is_empty());
    }

    #[test]
    fn test_rename_keeps_links() {
        let mdm = single_node();
        let bucket = mdm.get_or_create_bucket("b").unwrap();
        let vbucket = mdm.get_or_create_vbucket("v").unwrap();
        let (blob, _) = mdm.get_or_create_blob(bucket, "old").unwrap();
        mdm.commit_blob(blob, vec![buffer(1, 0, 4)], 4, 1.0).unwrap();
        mdm.link_blob(vbucket, bucket, "old").unwrap();

        let renamed = mdm.rename_blob(bucket, "old", "new").unwrap();
        assert_eq!(mdm.get_blob_id(bucket, "old").unwrap(), None);
        assert_eq!(mdm.get_blob_id(bucket, "new").unwrap(), Some(renamed));
        assert_eq!(mdm.blob_size(renamed).unwrap(), 4);
        assert_eq!(mdm.bucket_blobs(bucket).unwrap(), vec![renamed]);
        assert_eq!(mdm.linked_blobs(vbucket).unwrap(), vec![(bucket, "new".to_string())]);
        assert!(!mdm.blob_locks.is_locked(blob.to_tiered()));
    }

    #[test]
    fn test_routes_to_owner() {
        let (_mesh, managers) = cluster(3);
        let first = &managers[0];
        let bucket = first.get_or_create_bucket("shared").unwrap();
        let owner = &managers[bucket.node_id.get() as usize - 1];
        assert_eq!(owner.get_bucket_id("shared").unwrap(), Some(bucket));

        let mut owners = Vec::new();
        for i in 0..24 {
            let name = format!("blob-{i}");
            let (blob, _) = first.get_or_create_blob(bucket, &name).unwrap();
            first.commit_blob(blob, vec![], 0, 1.0).unwrap();
            assert_eq!(blob.owner(), first.blob_owner(bucket, &name));
            owners.push(blob.owner());
            // every node resolves the same id
            for mdm in &managers {
                assert_eq!(mdm.get_blob_id(bucket, &name).unwrap(), Some(blob));
            }
        }
        owners.sort_by_key(|n| n.get());
        owners.dedup();
        assert!(owners.len() > 1);
        assert_eq!(managers[2].bucket_blobs(bucket).unwrap().len(), 24);
    }

    #[test]
    fn test_remote_lock_and_targets() {
        let (_mesh, managers) = cluster(2);
        let bucket = managers[0].get_or_create_bucket("b").unwrap();
        let (blob, _) = managers[0].get_or_create_blob(bucket, "x").unwrap();
        let owner = &managers[blob.owner().get() as usize - 1];
        let other = &managers[2 - blob.owner().get() as usize];

        let guard = other.lock_blob(blob).unwrap();
        assert!(owner.blob_locks.is_locked(blob));
        drop(guard);
        assert!(!owner.blob_locks.is_locked(blob));

        let remote = other.target_infos(owner.node_id()).unwrap();
        assert_eq!(remote[0].id.node_id, owner.node_id());
    }

    #[test]
    fn test_destroy_bucket_respects_handles() {
        let (_mesh, managers) = cluster(2);
        let bucket = managers[0].get_or_create_bucket("b").unwrap();
        managers[1].get_or_create_bucket("b").unwrap();
        assert!(matches!(
            managers[0].destroy_bucket(bucket),
            Err(Error::BucketInUse { .. })
        ));
        managers[1].close_bucket(bucket).unwrap();
        assert!(managers[0].destroy_bucket(bucket).unwrap().is_empty());
    }

    #[test]
    fn test_blob_name_and_delete_after_destroy() {
        let (_mesh, managers) = cluster(2);
        let bucket = managers[0].get_or_create_bucket("b").unwrap();
        let (blob, _) = managers[1].get_or_create_blob(bucket, "x").unwrap();
        managers[1].commit_blob(blob, vec![], 0, 1.0).unwrap();
        assert_eq!(managers[0].blob_name(blob).unwrap(), "x");

        let blobs = managers[0].destroy_bucket(bucket).unwrap();
        assert_eq!(blobs, vec![blob]);
        managers[0].delete_blob(blob).unwrap();
        assert!(managers[1].blob_name(blob).unwrap_err().is_not_found());
    }

    #[test]
    fn test_pending_blob_hidden_until_commit() {
        let (_mesh, managers) = cluster(2);
        let bucket = managers[0].get_or_create_bucket("b").unwrap();
        let vbucket = managers[0].get_or_create_vbucket("v").unwrap();
        let (blob, created) = managers[1].get_or_create_blob(bucket, "x").unwrap();
        assert!(created);
        for mdm in &managers {
            assert_eq!(mdm.get_blob_id(bucket, "x").unwrap(), None);
            assert!(mdm.bucket_blobs(bucket).unwrap().is_empty());
        }
        assert!(managers[0].link_blob(vbucket, bucket, "x").is_err());

        // a failed writer drops it without a trace
        managers[0].discard_blob(blob).unwrap();
        assert!(managers[1].blob_size(blob).unwrap_err().is_not_found());
        let (blob, created) = managers[0].get_or_create_blob(bucket, "x").unwrap();
        assert!(created);

        let (blob, _) = managers[0].commit_blob(blob, vec![buffer(1, 0, 6)], 6, 1.0).unwrap();
        assert_eq!(managers[1].get_blob_id(bucket, "x").unwrap(), Some(blob));
        assert_eq!(managers[1].bucket_blobs(bucket).unwrap(), vec![blob]);
        managers[1].discard_blob(blob).unwrap();
        assert_eq!(managers[0].blob_size(blob).unwrap(), 6);
    }
}
