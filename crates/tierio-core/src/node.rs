//! Node context
//!
//! A [`TierNode`] owns one instance of every component for one node and
//! wires them together. Blob operations run here; the bucket handles in
//! [`crate::bucket`] are thin views over them.

use crate::bucket::{Bucket, PutOptions, PutStatus, VBucket};
use std::sync::Arc;
use tierio_common::{
    BlobId, BucketId, BufferInfo, Config, Error, NodeId, PlacementContext, PlacementSchema, Request, Response,
    Result, Transport,
};
use tierio_meta::MetadataManager;
use tierio_organizer::{BorgWorker, BufferOrganizer, DataPath, OrganizeReport};
use tierio_placement::DataPlacementEngine;
use tierio_storage::BufferPool;
use tracing::{debug, info, warn};

/// Every component of one buffering node
pub struct TierNode {
    config: Config,
    pool: Arc<BufferPool>,
    mdm: Arc<MetadataManager>,
    dpe: Arc<DataPlacementEngine>,
    data: Arc<DataPath>,
    borg: Arc<BufferOrganizer>,
    worker: Option<BorgWorker>,
}

impl TierNode {
    /// Build a node from its configuration
    ///
    /// `transport` carries calls to the other nodes; single-node setups pass
    /// [`tierio_common::NoTransport`].
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let node_id = NodeId::new(config.node.node_id);

        let pool = Arc::new(BufferPool::new(node_id, &config.devices, &config.swap)?);
        let mdm = Arc::new(MetadataManager::new(
            &config.node,
            &config.metadata,
            Arc::clone(pool.registry()),
            Arc::clone(&transport),
        )?);
        let dpe = Arc::new(DataPlacementEngine::new(&config.dpe));
        let data = Arc::new(DataPath::new(Arc::clone(&pool), transport));
        let borg = Arc::new(BufferOrganizer::new(
            &config,
            Arc::clone(&data),
            Arc::clone(&mdm),
            Arc::clone(&dpe),
        ));
        let worker = if config.borg.background {
            Some(BorgWorker::spawn(Arc::clone(&borg))?)
        } else {
            None
        };

        info!(
            "Node {} up with {} targets ({} bytes buffered capacity)",
            node_id,
            pool.registry().len(),
            pool.registry().infos().iter().map(|t| t.max_capacity).sum::<u64>()
        );
        Ok(Self {
            config,
            pool,
            mdm,
            dpe,
            data,
            borg,
            worker,
        })
    }

    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.mdm.node_id()
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[must_use]
    pub const fn metadata(&self) -> &Arc<MetadataManager> {
        &self.mdm
    }

    #[must_use]
    pub const fn placement(&self) -> &Arc<DataPlacementEngine> {
        &self.dpe
    }

    #[must_use]
    pub const fn organizer(&self) -> &Arc<BufferOrganizer> {
        &self.borg
    }

    /// Open a bucket, creating it on first use
    pub fn open_bucket(&self, name: &str) -> Result<Bucket<'_>> {
        let id = self.mdm.get_or_create_bucket(name)?;
        Ok(Bucket::new(self, id, name))
    }

    /// Open a virtual bucket, creating it on first use
    pub fn open_vbucket(&self, name: &str) -> Result<VBucket<'_>> {
        let id = self.mdm.get_or_create_vbucket(name)?;
        Ok(VBucket::new(self, id, name))
    }

    /// Run one organize pass on the calling thread
    pub fn organize(&self) -> Result<OrganizeReport> {
        self.borg.organize_once()
    }

    fn notify_organizer(&self) {
        if let Some(worker) = &self.worker {
            worker.notify();
        }
    }

    /// Stop background work
    pub fn shutdown(&self) {
        if let Some(worker) = &self.worker {
            worker.shutdown();
        }
    }

    /// Execute a request sent by another node
    pub fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::WriteSegment { .. } | Request::ReleaseBuffers { .. } => {
                let response = self.data.serve(request)?;
                self.notify_organizer();
                Ok(response)
            }
            Request::ReadBuffer { .. } => self.data.serve(request),
            other => self.mdm.serve(other),
        }
    }

    // ---- Blob operations ----

    /// Current id of `name`, which tracks swap residency
    pub(crate) fn resolve(&self, bucket: BucketId, name: &str) -> Result<BlobId> {
        self.mdm
            .get_blob_id(bucket, name)?
            .ok_or_else(|| Error::BlobNotFound(name.to_string()))
    }

    /// Store a batch of blobs with one placement decision
    ///
    /// When no scope can hold the whole batch each blob is placed on its
    /// own as the earlier ones land. A blob no tier can take, or one whose
    /// buffers run short of its schema, goes to swap.
    pub(crate) fn put_batch(
        &self,
        bucket: BucketId,
        blobs: &[(&str, &[u8])],
        options: &PutOptions,
    ) -> Result<Vec<PutStatus>> {
        let sizes: Vec<u64> = blobs.iter().map(|(_, data)| data.len() as u64).collect();
        let ctx = options.context.as_ref().unwrap_or_else(|| self.dpe.default_context());

        let mut batch = self.place(&sizes, ctx)?.map(Vec::into_iter);
        if batch.is_none() && blobs.len() > 1 {
            warn!("No tier can hold a batch of {} blobs, placing them one by one", blobs.len());
        }

        let mut statuses = Vec::with_capacity(blobs.len());
        for &(name, data) in blobs {
            let schema = match batch.as_mut() {
                Some(schemas) => schemas.next(),
                None if data.is_empty() => Some(PlacementSchema::new()),
                None if blobs.len() > 1 => self.place(&[data.len() as u64], ctx)?.and_then(|mut s| s.pop()),
                None => None,
            };
            let status = match schema {
                Some(schema) => match self.put_placed(bucket, name, data, &schema, options.user_score) {
                    Err(Error::IncompleteAllocation { requested, allocated }) => {
                        warn!(
                            "Blob '{}' got {} of {} bytes from its tiers, using swap",
                            name, allocated, requested
                        );
                        self.put_swapped(bucket, name, data, options.user_score)?
                    }
                    other => other?,
                },
                None => {
                    warn!("No tier can hold blob '{}' ({} bytes), using swap", name, data.len());
                    self.put_swapped(bucket, name, data, options.user_score)?
                }
            };
            statuses.push(status);
        }
        self.notify_organizer();
        Ok(statuses)
    }

    /// Placement across the escalating scopes; `None` when nothing fits
    fn place(&self, sizes: &[u64], ctx: &PlacementContext) -> Result<Option<Vec<PlacementSchema>>> {
        match self
            .dpe
            .calculate_placement(sizes, ctx, self.mdm.topology(), &*self.mdm)
        {
            Ok(schemas) => Ok(Some(schemas)),
            Err(e) if e.is_placement_failure() => {
                debug!("Placement of {} blobs failed: {}", sizes.len(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn put_placed(
        &self,
        bucket: BucketId,
        name: &str,
        data: &[u8],
        schema: &PlacementSchema,
        user_score: f64,
    ) -> Result<PutStatus> {
        let requested = data.len() as u64;
        self.store(bucket, name, requested, user_score, || {
            let buffers = self.data.allocate_and_set_buffers(schema, data);
            let allocated: u64 = buffers.iter().map(|b| b.blob_size).sum();
            if allocated != requested {
                if let Err(e) = self.data.release_buffers(&buffers) {
                    warn!("Rollback of blob '{}' left buffers behind: {}", name, e);
                }
                return Err(Error::IncompleteAllocation { requested, allocated });
            }
            Ok(buffers)
        })?;
        debug!("Stored blob '{}' ({} bytes) in {} entries", name, requested, schema.len());
        Ok(PutStatus::Stored)
    }

    fn put_swapped(&self, bucket: BucketId, name: &str, data: &[u8], user_score: f64) -> Result<PutStatus> {
        self.store(bucket, name, data.len() as u64, user_score, || {
            Ok(vec![self.pool.write_to_swap(data)?])
        })?;
        Ok(PutStatus::Swapped)
    }

    /// Buffer a blob's bytes under its lock and commit them
    ///
    /// A blob this call created is discarded again when anything fails.
    fn store(
        &self,
        bucket: BucketId,
        name: &str,
        size: u64,
        user_score: f64,
        buffer: impl FnOnce() -> Result<Vec<BufferInfo>>,
    ) -> Result<()> {
        let (blob, pending) = self.mdm.get_or_create_blob(bucket, name)?;
        let _guard = self.mdm.lock_blob(blob)?;
        let blob = blob.to_tiered();

        let result = buffer().and_then(|buffers| self.commit(blob, buffers, size, user_score));
        if result.is_err()
            && pending
            && let Err(e) = self.mdm.discard_blob(blob)
        {
            warn!("Could not discard uncommitted blob {}: {}", blob, e);
        }
        result
    }

    fn commit(&self, blob: BlobId, buffers: Vec<BufferInfo>, size: u64, user_score: f64) -> Result<()> {
        let fresh = buffers.clone();
        match self.mdm.commit_blob(blob, buffers, size, user_score) {
            Ok((_, replaced)) => {
                if let Err(e) = self.data.release_buffers(&replaced) {
                    warn!("Could not release replaced buffers of blob {}: {}", blob, e);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(release) = self.data.release_buffers(&fresh) {
                    warn!("Could not release buffers of failed commit: {}", release);
                }
                Err(e)
            }
        }
    }

    pub(crate) fn get(&self, bucket: BucketId, name: &str) -> Result<Vec<u8>> {
        let blob = self.resolve(bucket, name)?;
        let _guard = self.mdm.lock_blob(blob)?;
        // the organizer may have moved it out of swap before the lock was granted
        let blob = self.resolve(bucket, name)?;

        let buffers = self.mdm.buffer_list(blob)?;
        let data = self.data.read_blob_from_buffers(&buffers)?;
        self.mdm.record_access(blob)?;
        Ok(data)
    }

    pub(crate) fn delete(&self, bucket: BucketId, name: &str) -> Result<()> {
        let blob = self.resolve(bucket, name)?;
        self.delete_blob(blob)
    }

    fn delete_blob(&self, blob: BlobId) -> Result<()> {
        let record = {
            let _guard = self.mdm.lock_blob(blob)?;
            self.mdm.delete_blob(blob.to_tiered())?
        };
        self.data.release_buffers(&record.buffers)?;
        self.notify_organizer();
        Ok(())
    }

    /// Delete every blob of a bucket and the bucket itself
    pub(crate) fn destroy_bucket(&self, bucket: BucketId) -> Result<()> {
        let blobs = self.mdm.destroy_bucket(bucket)?;
        let count = blobs.len();
        for blob in blobs {
            match self.delete_blob(blob) {
                Err(e) if !e.is_not_found() => return Err(e),
                _ => {}
            }
        }
        info!("Destroyed bucket {} with {} blobs", bucket, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{config, pattern};
    use tierio_common::config::DeviceConfig;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};
    use tierio_common::{KIB, MIB, NoTransport, PlacementPolicy};

    fn node(devices: Vec<DeviceConfig>) -> TierNode {
        TierNode::new(config(1, 1, devices), Arc::new(NoTransport)).unwrap()
    }

    fn remaining(node: &TierNode) -> u64 {
        node.pool().registry().infos().iter().map(|t| t.remaining_capacity).sum()
    }

    fn max_capacity(node: &TierNode) -> u64 {
        node.pool().registry().infos().iter().map(|t| t.max_capacity).sum()
    }

    #[test]
    fn test_random_put_get_across_ram_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(vec![
            DeviceConfig::ram("ram", 64 * KIB, 4 * KIB),
            DeviceConfig::file("nvme", dir.path(), MIB, 4 * KIB),
        ]);
        let bucket = node.open_bucket("b").unwrap();
        let options = PutOptions::with_policy(PlacementPolicy::Random);

        let data = pattern(96 * KIB as usize, 1);
        assert_eq!(bucket.put("x", &data, &options).unwrap(), PutStatus::Stored);
        assert_eq!(bucket.get("x").unwrap(), data);
        assert!(remaining(&node) <= max_capacity(&node) - 96 * KIB);

        // overwrite gives the old buffers back
        let next = pattern(40 * KIB as usize, 2);
        bucket.put("x", &next, &options).unwrap();
        assert_eq!(bucket.get("x").unwrap(), next);
        assert_eq!(bucket.blob_size("x").unwrap(), 40 * KIB);

        bucket.delete_blob("x").unwrap();
        assert_eq!(remaining(&node), max_capacity(&node));
        assert!(bucket.get("x").unwrap_err().is_not_found());
    }

    #[test]
    fn test_minimize_io_time_prefers_fast_tier() {
        let dir = tempfile::tempdir().unwrap();
        let node = node(vec![
            DeviceConfig::ram("ram", MIB, 4 * KIB),
            DeviceConfig::file("pfs", dir.path(), 4 * MIB, 4 * KIB).with_performance(100.0, 5000.0),
        ]);
        let bucket = node.open_bucket("b").unwrap();
        let data = pattern(64 * KIB as usize, 3);
        bucket.put("x", &data, &PutOptions::default()).unwrap();

        let ram = node.pool().registry().ids().next().unwrap();
        let blob = node.resolve(bucket.id(), "x").unwrap();
        let buffers = node.metadata().buffer_list(blob).unwrap();
        assert!(buffers.iter().all(|b| b.target_id == ram));
        assert_eq!(bucket.get("x").unwrap(), data);
    }

    #[test]
    fn test_put_spills_to_swap_when_tiers_are_full() {
        let node = node(vec![DeviceConfig::ram("ram", 16 * KIB, 4 * KIB)]);
        let bucket = node.open_bucket("b").unwrap();
        let data = pattern(64 * KIB as usize, 4);

        assert_eq!(bucket.put("big", &data, &PutOptions::default()).unwrap(), PutStatus::Swapped);
        assert!(node.resolve(bucket.id(), "big").unwrap().is_in_swap());
        assert_eq!(bucket.get("big").unwrap(), data);
        assert_eq!(remaining(&node), 16 * KIB);

        bucket.delete_blob("big").unwrap();
        let swap = node.pool().swap();
        assert_eq!(swap.free_bytes(), swap.capacity());
    }

    #[test]
    fn test_swapped_blob_moves_to_tier_once_room_frees() {
        let node = node(vec![DeviceConfig::ram("ram", 64 * KIB, 4 * KIB)]);
        let bucket = node.open_bucket("b").unwrap();
        bucket.put("resident", &pattern(48 * KIB as usize, 5), &PutOptions::default()).unwrap();
        let spilled = pattern(32 * KIB as usize, 6);
        assert_eq!(
            bucket.put("spilled", &spilled, &PutOptions::default()).unwrap(),
            PutStatus::Swapped
        );

        bucket.delete_blob("resident").unwrap();
        let report = node.organize().unwrap();
        assert_eq!(report.relocations, 1);
        assert!(!node.resolve(bucket.id(), "spilled").unwrap().is_in_swap());
        assert_eq!(bucket.get("spilled").unwrap(), spilled);
        assert_eq!(remaining(&node), 32 * KIB);
    }

    #[test]
    fn test_empty_blob() {
        let node = node(vec![DeviceConfig::ram("ram", 64 * KIB, 4 * KIB)]);
        let bucket = node.open_bucket("b").unwrap();
        assert_eq!(bucket.put("empty", &[], &PutOptions::default()).unwrap(), PutStatus::Stored);
        assert!(bucket.get("empty").unwrap().is_empty());
        assert_eq!(bucket.blob_size("empty").unwrap(), 0);
        assert_eq!(remaining(&node), 64 * KIB);
    }

    #[test]
    fn test_batch_put_shares_one_placement() {
        let node = node(vec![
            DeviceConfig::ram("fast", 512 * KIB, 4 * KIB),
            DeviceConfig::ram("slow", 4 * MIB, 4 * KIB).with_performance(500.0, 100.0),
        ]);
        let bucket = node.open_bucket("b").unwrap();
        let blobs: Vec<(String, Vec<u8>)> = (0..6u8)
            .map(|i| (format!("blob-{i}"), pattern(64 * KIB as usize, i)))
            .collect();
        let batch: Vec<(&str, &[u8])> = blobs.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();

        let statuses = bucket.put_many(&batch, &PutOptions::default()).unwrap();
        assert!(statuses.iter().all(|s| *s == PutStatus::Stored));
        for (name, data) in &blobs {
            assert_eq!(&bucket.get(name).unwrap(), data);
        }
        let ids: Vec<_> = node.pool().registry().ids().collect();
        assert_eq!(node.pool().registry().remaining_capacity(ids[0]).unwrap(), 128 * KIB);
        assert_eq!(node.pool().registry().remaining_capacity(ids[1]).unwrap(), 4 * MIB);
    }

    #[test]
    fn test_batch_over_block_rounded_capacity_spills_last_blob() {
        for policy in [PlacementPolicy::Random, PlacementPolicy::RoundRobin, PlacementPolicy::MinimizeIoTime] {
            let node = node(vec![DeviceConfig::ram("ram", 64 * KIB, 4 * KIB)]);
            let bucket = node.open_bucket("b").unwrap();
            // each one reserves six blocks, so only two fit
            let blobs: Vec<(String, Vec<u8>)> = (0..3u8)
                .map(|i| (format!("blob-{i}"), pattern(20 * KIB as usize + 1, i)))
                .collect();
            let batch: Vec<(&str, &[u8])> = blobs.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();

            let statuses = bucket.put_many(&batch, &PutOptions::with_policy(policy)).unwrap();
            assert_eq!(
                statuses,
                vec![PutStatus::Stored, PutStatus::Stored, PutStatus::Swapped],
                "{policy:?}"
            );
            for (name, data) in &blobs {
                assert_eq!(&bucket.get(name).unwrap(), data, "{policy:?}");
            }
            assert_eq!(remaining(&node), 16 * KIB);

            for (name, _) in &blobs {
                bucket.delete_blob(name).unwrap();
            }
            assert_eq!(remaining(&node), max_capacity(&node));
            assert_eq!(node.pool().swap().free_bytes(), node.pool().swap().capacity());
        }
    }

    #[test]
    fn test_failed_put_leaves_no_blob_behind() {
        let node = node(vec![DeviceConfig::ram("ram", 64 * KIB, 4 * KIB)]);
        let bucket = node.open_bucket("b").unwrap();
        let ram = node.pool().registry().ids().next().unwrap();
        let mut schema = PlacementSchema::new();
        schema.push(128 * KIB, ram);

        let data = pattern(128 * KIB as usize, 7);
        let err = node.put_placed(bucket.id(), "x", &data, &schema, 1.0).unwrap_err();
        assert!(matches!(err, Error::IncompleteAllocation { allocated: 0, .. }));
        assert!(bucket.get("x").unwrap_err().is_not_found());
        assert!(node.metadata().bucket_blobs(bucket.id()).unwrap().is_empty());
        assert_eq!(node.metadata().local_blob_count(), 0);
        assert_eq!(remaining(&node), 64 * KIB);
    }

    #[test]
    fn test_background_worker_runs_after_put() {
        let mut config = config(1, 1, vec![DeviceConfig::ram("ram", MIB, 4 * KIB)]);
        config.borg.background = true;
        let node = TierNode::new(config, Arc::new(NoTransport)).unwrap();
        let bucket = node.open_bucket("b").unwrap();
        bucket.put("x", &pattern(8 * KIB as usize, 9), &PutOptions::default()).unwrap();

        let passes = &node.organizer().stats().passes;
        let deadline = Instant::now() + Duration::from_secs(5);
        while passes.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(passes.load(Ordering::Relaxed) >= 1);
        node.shutdown();
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = TierNode::new(config(1, 1, Vec::new()), Arc::new(NoTransport)).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
