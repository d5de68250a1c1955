//! Bucket and virtual bucket handles

use crate::node::TierNode;
use tierio_common::{BucketId, PlacementContext, PlacementPolicy, Result, VBucketId};

/// Per-Put settings
#[derive(Clone, Debug)]
pub struct PutOptions {
    /// Placement override; the engine default applies when unset
    pub context: Option<PlacementContext>,
    /// Importance in `[0, 1]` the organizer weighs blob scores with
    pub user_score: f64,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            context: None,
            user_score: 1.0,
        }
    }
}

impl PutOptions {
    #[must_use]
    pub fn with_policy(policy: PlacementPolicy) -> Self {
        Self {
            context: Some(PlacementContext::with_policy(policy)),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_user_score(mut self, user_score: f64) -> Self {
        self.user_score = user_score;
        self
    }
}

/// Where a Put left the blob
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutStatus {
    /// Buffered on the tiers
    Stored,
    /// No tier had room; held in swap until the organizer moves it
    Swapped,
}

/// An open bucket
///
/// Every handle holds one reference on the bucket. [`close`](Self::close)
/// gives it back; [`destroy`](Self::destroy) needs to be the last one open.
pub struct Bucket<'a> {
    node: &'a TierNode,
    id: BucketId,
    name: String,
}

impl<'a> Bucket<'a> {
    pub(crate) fn new(node: &'a TierNode, id: BucketId, name: &str) -> Self {
        Self {
            node,
            id,
            name: name.to_string(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> BucketId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `data` under `name`, replacing any previous contents
    pub fn put(&self, name: &str, data: &[u8], options: &PutOptions) -> Result<PutStatus> {
        let mut statuses = self.node.put_batch(self.id, &[(name, data)], options)?;
        Ok(statuses.pop().unwrap_or(PutStatus::Stored))
    }

    /// Store several blobs with a single placement decision
    pub fn put_many(&self, blobs: &[(&str, &[u8])], options: &PutOptions) -> Result<Vec<PutStatus>> {
        self.node.put_batch(self.id, blobs, options)
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.node.get(self.id, name)
    }

    pub fn delete_blob(&self, name: &str) -> Result<()> {
        self.node.delete(self.id, name)
    }

    pub fn rename_blob(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.node.metadata().rename_blob(self.id, old_name, new_name)?;
        Ok(())
    }

    pub fn contains_blob(&self, name: &str) -> Result<bool> {
        Ok(self.node.metadata().get_blob_id(self.id, name)?.is_some())
    }

    pub fn blob_size(&self, name: &str) -> Result<u64> {
        let blob = self.node.resolve(self.id, name)?;
        self.node.metadata().blob_size(blob.to_tiered())
    }

    /// Names of every blob in the bucket
    pub fn blob_names(&self) -> Result<Vec<String>> {
        let mdm = self.node.metadata();
        mdm.bucket_blobs(self.id)?
            .into_iter()
            .map(|blob| mdm.blob_name(blob))
            .collect()
    }

    /// Give back this handle's reference
    pub fn close(self) -> Result<()> {
        self.node.metadata().close_bucket(self.id)
    }

    /// Delete the bucket with all of its blobs
    pub fn destroy(self) -> Result<()> {
        self.node.destroy_bucket(self.id)
    }
}

/// An open virtual bucket: a named set of links to blobs in other buckets
pub struct VBucket<'a> {
    node: &'a TierNode,
    id: VBucketId,
    name: String,
}

impl<'a> VBucket<'a> {
    pub(crate) fn new(node: &'a TierNode, id: VBucketId, name: &str) -> Self {
        Self {
            node,
            id,
            name: name.to_string(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> VBucketId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self, bucket: &Bucket<'_>, blob_name: &str) -> Result<()> {
        self.node.metadata().link_blob(self.id, bucket.id(), blob_name)
    }

    pub fn unlink(&self, bucket: &Bucket<'_>, blob_name: &str) -> Result<()> {
        self.node.metadata().unlink_blob(self.id, bucket.id(), blob_name)
    }

    pub fn contains_blob(&self, bucket: &Bucket<'_>, blob_name: &str) -> Result<bool> {
        Ok(self
            .linked_blobs()?
            .iter()
            .any(|(b, name)| *b == bucket.id() && name == blob_name))
    }

    pub fn linked_blobs(&self) -> Result<Vec<(BucketId, String)>> {
        self.node.metadata().linked_blobs(self.id)
    }

    /// Remove the vbucket; the linked blobs stay
    pub fn destroy(self) -> Result<()> {
        self.node.metadata().destroy_vbucket(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{config, pattern};
    use std::sync::Arc;
    use tierio_common::config::DeviceConfig;
    use tierio_common::{Error, KIB, MIB, NoTransport};

    fn node() -> TierNode {
        let config = config(1, 1, vec![DeviceConfig::ram("ram", MIB, 4 * KIB)]);
        TierNode::new(config, Arc::new(NoTransport)).unwrap()
    }

    #[test]
    fn test_bucket_lifecycle() {
        let node = node();
        let bucket = node.open_bucket("b").unwrap();
        let (a, b, c) = (pattern(5000, 1), pattern(9000, 2), pattern(100, 3));
        bucket
            .put_many(
                &[("a", a.as_slice()), ("b", b.as_slice()), ("c", c.as_slice())],
                &PutOptions::default(),
            )
            .unwrap();

        let mut names = bucket.blob_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(bucket.contains_blob("a").unwrap());
        assert!(!bucket.contains_blob("z").unwrap());
        assert_eq!(bucket.blob_size("b").unwrap(), 9000);

        bucket.rename_blob("a", "d").unwrap();
        assert!(!bucket.contains_blob("a").unwrap());
        assert_eq!(bucket.get("d").unwrap(), a);
        assert!(bucket.rename_blob("d", "b").is_err());

        bucket.delete_blob("c").unwrap();
        assert!(bucket.delete_blob("c").unwrap_err().is_not_found());

        let second = node.open_bucket("b").unwrap();
        assert_eq!(second.id(), bucket.id());
        assert!(matches!(
            node.metadata().destroy_bucket(bucket.id()),
            Err(Error::BucketInUse { ref_count: 2, .. })
        ));
        second.close().unwrap();
        bucket.destroy().unwrap();

        let infos = node.pool().registry().infos();
        assert_eq!(infos[0].remaining_capacity, infos[0].max_capacity);
        assert_eq!(node.metadata().get_bucket_id("b").unwrap(), None);
        assert!(node.open_bucket("b").unwrap().blob_names().unwrap().is_empty());
    }

    #[test]
    fn test_vbucket_links_follow_blobs() {
        let node = node();
        let bucket = node.open_bucket("b").unwrap();
        bucket.put("x", &pattern(4096, 1), &PutOptions::default()).unwrap();
        bucket.put("y", &pattern(4096, 2), &PutOptions::default()).unwrap();

        let vbucket = node.open_vbucket("v").unwrap();
        vbucket.link(&bucket, "x").unwrap();
        vbucket.link(&bucket, "y").unwrap();
        assert!(vbucket.contains_blob(&bucket, "x").unwrap());
        assert!(vbucket.link(&bucket, "missing").is_err());

        vbucket.unlink(&bucket, "y").unwrap();
        assert_eq!(vbucket.linked_blobs().unwrap(), vec![(bucket.id(), "x".to_string())]);

        bucket.rename_blob("x", "z").unwrap();
        assert_eq!(vbucket.linked_blobs().unwrap(), vec![(bucket.id(), "z".to_string())]);

        bucket.delete_blob("z").unwrap();
        assert!(vbucket.linked_blobs().unwrap().is_empty());

        vbucket.link(&bucket, "y").unwrap();
        vbucket.destroy().unwrap();
        assert_eq!(node.metadata().get_vbucket_id("v").unwrap(), None);
        assert_eq!(bucket.get("y").unwrap(), pattern(4096, 2));
    }

    #[test]
    fn test_put_options() {
        let options = PutOptions::with_policy(PlacementPolicy::RoundRobin).with_user_score(0.25);
        assert_eq!(options.context.map(|c| c.policy), Some(PlacementPolicy::RoundRobin));
        assert!((options.user_score - 0.25).abs() < f64::EPSILON);
        assert!(PutOptions::default().context.is_none());
    }
}
