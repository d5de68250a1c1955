//! Bucket and virtual bucket tables
//!
//! Each table keeps a name map and an id map behind one lock so the two never
//! disagree. Only the owning node of a name holds its entry.

use crate::types::{BucketEntry, VBucketEntry};
use parking_lot::RwLock;
use std::collections::HashMap;
use tierio_common::{BlobId, BucketId, Error, NodeId, Result, VBucketId};

#[derive(Default)]
struct BucketMaps {
    next_unique: u32,
    by_name: HashMap<String, BucketId>,
    entries: HashMap<BucketId, BucketEntry>,
}

/// Buckets owned by this node
pub struct BucketTable {
    node_id: NodeId,
    maps: RwLock<BucketMaps>,
}

impl BucketTable {
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            maps: RwLock::new(BucketMaps::default()),
        }
    }

    /// Open `name`, creating it on first use
    ///
    /// Every call takes one reference that [`close`](Self::close) gives back.
    pub fn get_or_create(&self, name: &str) -> BucketId {
        let mut maps = self.maps.write();
        if let Some(&id) = maps.by_name.get(name) {
            if let Some(entry) = maps.entries.get_mut(&id) {
                entry.ref_count += 1;
            }
            return id;
        }
        maps.next_unique += 1;
        let id = BucketId::new(maps.next_unique, self.node_id);
        maps.by_name.insert(name.to_string(), id);
        maps.entries.insert(
            id,
            BucketEntry {
                name: name.to_string(),
                ref_count: 1,
                blobs: Vec::new(),
            },
        );
        id
    }

    pub fn get_id(&self, name: &str) -> Option<BucketId> {
        self.maps.read().by_name.get(name).copied()
    }

    /// Drop one reference
    pub fn close(&self, id: BucketId) -> Result<()> {
        let mut maps = self.maps.write();
        let entry = maps.entries.get_mut(&id).ok_or(Error::BucketIdNotFound(id))?;
        entry.ref_count = entry.ref_count.saturating_sub(1);
        Ok(())
    }

    /// Remove the bucket and return its blobs
    ///
    /// Refused while any handle other than the caller's is open.
    pub fn destroy(&self, id: BucketId) -> Result<Vec<BlobId>> {
        let mut maps = self.maps.write();
        let entry = maps.entries.get(&id).ok_or(Error::BucketIdNotFound(id))?;
        if entry.ref_count > 1 {
            return Err(Error::BucketInUse {
                name: entry.name.clone(),
                ref_count: entry.ref_count,
            });
        }
        let name = entry.name.clone();
        maps.by_name.remove(&name);
        let entry = maps.entries.remove(&id).ok_or(Error::BucketIdNotFound(id))?;
        Ok(entry.blobs)
    }

    pub fn blobs(&self, id: BucketId) -> Result<Vec<BlobId>> {
        let maps = self.maps.read();
        let entry = maps.entries.get(&id).ok_or(Error::BucketIdNotFound(id))?;
        Ok(entry.blobs.clone())
    }

    pub fn add_blob(&self, id: BucketId, blob: BlobId) -> Result<()> {
        let mut maps = self.maps.write();
        let entry = maps.entries.get_mut(&id).ok_or(Error::BucketIdNotFound(id))?;
        let blob = blob.to_tiered();
        if !entry.blobs.contains(&blob) {
            entry.blobs.push(blob);
        }
        Ok(())
    }

    pub fn remove_blob(&self, id: BucketId, blob: BlobId) -> Result<()> {
        let mut maps = self.maps.write();
        let entry = maps.entries.get_mut(&id).ok_or(Error::BucketIdNotFound(id))?;
        let blob = blob.to_tiered();
        entry.blobs.retain(|&b| b != blob);
        Ok(())
    }

    pub fn ref_count(&self, id: BucketId) -> Option<u32> {
        self.maps.read().entries.get(&id).map(|e| e.ref_count)
    }
}

#[derive(Default)]
struct VBucketMaps {
    next_unique: u32,
    by_name: HashMap<String, VBucketId>,
    entries: HashMap<VBucketId, VBucketEntry>,
}

/// Virtual buckets owned by this node
pub struct VBucketTable {
    node_id: NodeId,
    maps: RwLock<VBucketMaps>,
}

impl VBucketTable {
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            maps: RwLock::new(VBucketMaps::default()),
        }
    }

    pub fn get_or_create(&self, name: &str) -> VBucketId {
        let mut maps = self.maps.write();
        if let Some(&id) = maps.by_name.get(name) {
            return id;
        }
        maps.next_unique += 1;
        let id = VBucketId::new(maps.next_unique, self.node_id);
        maps.by_name.insert(name.to_string(), id);
        maps.entries.insert(
            id,
            VBucketEntry {
                name: name.to_string(),
                links: Vec::new(),
            },
        );
        id
    }

    pub fn get_id(&self, name: &str) -> Option<VBucketId> {
        self.maps.read().by_name.get(name).copied()
    }

    /// Link a blob by name; linking twice is a no-op
    pub fn link(&self, id: VBucketId, bucket: BucketId, blob_name: &str) -> Result<()> {
        let mut maps = self.maps.write();
        let entry = maps.entries.get_mut(&id).ok_or(Error::VBucketIdNotFound(id))?;
        if !entry.links.iter().any(|(b, n)| *b == bucket && n == blob_name) {
            entry.links.push((bucket, blob_name.to_string()));
        }
        Ok(())
    }

    pub fn unlink(&self, id: VBucketId, bucket: BucketId, blob_name: &str) -> Result<()> {
        let mut maps = self.maps.write();
        let entry = maps.entries.get_mut(&id).ok_or(Error::VBucketIdNotFound(id))?;
        entry.links.retain(|(b, n)| !(*b == bucket && n == blob_name));
        Ok(())
    }

    pub fn links(&self, id: VBucketId) -> Result<Vec<(BucketId, String)>> {
        let maps = self.maps.read();
        let entry = maps.entries.get(&id).ok_or(Error::VBucketIdNotFound(id))?;
        Ok(entry.links.clone())
    }

    /// Remove the vbucket and return the links it held
    pub fn destroy(&self, id: VBucketId) -> Result<Vec<(BucketId, String)>> {
        let mut maps = self.maps.write();
        let entry = maps.entries.remove(&id).ok_or(Error::VBucketIdNotFound(id))?;
        maps.by_name.remove(&entry.name);
        Ok(entry.links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_ref_counting() {
        let table = BucketTable::new(NodeId::new(1));
        let id = table.get_or_create("b");
        assert_eq!(table.get_or_create("b"), id);
        assert_eq!(table.ref_count(id), Some(2));

        let err = table.destroy(id).unwrap_err();
        assert!(matches!(err, Error::BucketInUse { ref_count: 2, .. }));

        table.close(id).unwrap();
        assert!(table.destroy(id).unwrap().is_empty());
        assert_eq!(table.get_id("b"), None);
    }

    #[test]
    fn test_bucket_blob_membership() {
        let table = BucketTable::new(NodeId::new(1));
        let id = table.get_or_create("b");
        let blob = BlobId::new(4, NodeId::new(2));

        table.add_blob(id, blob).unwrap();
        table.add_blob(id, blob.to_swap()).unwrap();
        assert_eq!(table.blobs(id).unwrap(), vec![blob]);

        table.remove_blob(id, blob.to_swap()).unwrap();
        assert!(table.blobs(id).unwrap().is_empty());
    }

    #[test]
    fn test_vbucket_links() {
        let table = VBucketTable::new(NodeId::new(1));
        let id = table.get_or_create("v");
        let bucket = BucketId::new(1, NodeId::new(1));

        table.link(id, bucket, "a").unwrap();
        table.link(id, bucket, "a").unwrap();
        table.link(id, bucket, "b").unwrap();
        assert_eq!(table.links(id).unwrap().len(), 2);

        table.unlink(id, bucket, "a").unwrap();
        assert_eq!(table.destroy(id).unwrap(), vec![(bucket, "b".to_string())]);
        assert!(matches!(table.links(id), Err(Error::VBucketIdNotFound(_))));
    }
}
