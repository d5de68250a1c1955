//! Blob table
//!
//! Entries are keyed by the tiered form of the blob id; the sign of the id a
//! caller sees follows the entry's `in_swap` flag. A swap id kept after the
//! blob moved back into the tiers no longer resolves.
//!
//! A created blob stays pending until its first commit: name lookups and
//! snapshots do not see it, and a failed writer discards it.

use crate::store::BufferListStore;
use crate::types::{AccessStats, BlobEntry, BlobSummary, blob_key};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU32, Ordering};
use tierio_common::{
    BlobId, BlobRecord, BucketId, BufferInfo, Error, NodeId, Result, VBucketId,
    buffers_cover_exactly,
};

const DEFAULT_USER_SCORE: f64 = 1.0;

/// Blobs owned by this node, with their buffer lists
pub struct BlobTable {
    node_id: NodeId,
    next_unique: AtomicU32,
    names: DashMap<Vec<u8>, BlobId>,
    entries: DashMap<BlobId, BlobEntry>,
    lists: BufferListStore,
}

fn visible_id(key: BlobId, entry: &BlobEntry) -> BlobId {
    if entry.in_swap { key.to_swap() } else { key }
}

fn holds_swap(buffers: &[BufferInfo]) -> bool {
    buffers.iter().any(|b| b.target_id.is_swap())
}

fn check_cover(id: BlobId, buffers: &[BufferInfo], size: u64) -> Result<()> {
    if buffers_cover_exactly(buffers, size) {
        Ok(())
    } else {
        Err(Error::invalid_argument(format!(
            "buffer list of blob {} does not cover {} bytes exactly",
            id, size
        )))
    }
}

impl BlobTable {
    pub fn new(node_id: NodeId, heap_size: u64) -> Result<Self> {
        Ok(Self {
            node_id,
            next_unique: AtomicU32::new(1),
            names: DashMap::new(),
            entries: DashMap::new(),
            lists: BufferListStore::new(heap_size)?,
        })
    }

    fn allocate_id(&self) -> BlobId {
        BlobId::new(self.next_unique.fetch_add(1, Ordering::Relaxed), self.node_id)
    }

    fn key_of(&self, id: BlobId) -> Result<BlobId> {
        let key = id.to_tiered();
        let entry = self.entries.get(&key).ok_or(Error::BlobIdNotFound(id))?;
        if id.is_in_swap() && !entry.in_swap {
            return Err(Error::BlobIdNotFound(id));
        }
        Ok(key)
    }

    /// Number of committed blobs
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.pending).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_id(&self, bucket: BucketId, name: &str) -> Option<BlobId> {
        let key = *self.names.get(&blob_key(bucket, name))?;
        self.entries
            .get(&key)
            .filter(|e| !e.pending)
            .map(|e| visible_id(key, &e))
    }

    /// Resolve a name, creating a pending blob on first use
    ///
    /// The flag is true while the blob has never been committed.
    pub fn get_or_create(&self, bucket: BucketId, name: &str) -> Result<(BlobId, bool)> {
        match self.names.entry(blob_key(bucket, name)) {
            Entry::Occupied(slot) => {
                let key = *slot.get();
                Ok(self
                    .entries
                    .get(&key)
                    .map_or((key, false), |e| (visible_id(key, &e), e.pending)))
            }
            Entry::Vacant(slot) => {
                let id = self.allocate_id();
                let buffers = self.lists.put(&[])?;
                self.entries.insert(
                    id,
                    BlobEntry {
                        name: name.to_string(),
                        bucket,
                        buffers,
                        size: 0,
                        user_score: DEFAULT_USER_SCORE,
                        access: AccessStats::new(),
                        vbuckets: Vec::new(),
                        in_swap: false,
                        pending: true,
                    },
                );
                slot.insert(id);
                Ok((id, true))
            }
        }
    }

    pub fn buffers(&self, id: BlobId) -> Result<Vec<BufferInfo>> {
        let key = self.key_of(id)?;
        let entry = self.entries.get(&key).ok_or(Error::BlobIdNotFound(id))?;
        self.lists.get(entry.buffers)
    }

    /// Install a complete buffer list
    ///
    /// Returns the current id, the old list and, on a blob's first commit,
    /// the bucket it now has to be listed in.
    pub fn commit(
        &self,
        id: BlobId,
        buffers: &[BufferInfo],
        size: u64,
        user_score: f64,
    ) -> Result<(BlobId, Vec<BufferInfo>, Option<BucketId>)> {
        check_cover(id, buffers, size)?;
        let key = self.key_of(id)?;
        let mut entry = self.entries.get_mut(&key).ok_or(Error::BlobIdNotFound(id))?;
        let old = self.lists.get(entry.buffers)?;
        entry.buffers = self.lists.replace(entry.buffers, buffers)?;
        entry.size = size;
        entry.user_score = user_score;
        entry.in_swap = holds_swap(buffers);
        let first = std::mem::take(&mut entry.pending).then_some(entry.bucket);
        Ok((visible_id(key, &entry), old, first))
    }

    /// Drop a blob that was created but never committed
    ///
    /// Returns false, leaving the table alone, once the blob has been
    /// committed.
    pub fn discard(&self, id: BlobId) -> Result<bool> {
        let key = id.to_tiered();
        let Some((_, entry)) = self.entries.remove_if(&key, |_, e| e.pending) else {
            return Ok(false);
        };
        self.names
            .remove_if(&blob_key(entry.bucket, &entry.name), |_, &v| v == key);
        self.lists.delete(entry.buffers)?;
        Ok(true)
    }

    /// Swap `remove` for `insert` in one step
    ///
    /// Every buffer in `remove` must be present and the result must still
    /// cover the blob exactly; otherwise nothing changes.
    pub fn replace_buffers(
        &self,
        id: BlobId,
        remove: &[BufferInfo],
        insert: &[BufferInfo],
    ) -> Result<BlobId> {
        let key = self.key_of(id)?;
        let mut entry = self.entries.get_mut(&key).ok_or(Error::BlobIdNotFound(id))?;
        let mut list = self.lists.get(entry.buffers)?;
        for buffer in remove {
            let pos = list.iter().position(|b| b == buffer).ok_or_else(|| {
                Error::invalid_argument(format!("blob {} does not hold buffer {:?}", id, buffer))
            })?;
            list.swap_remove(pos);
        }
        list.extend_from_slice(insert);
        list.sort_by_key(|b| b.blob_offset);
        check_cover(id, &list, entry.size)?;

        entry.buffers = self.lists.replace(entry.buffers, &list)?;
        entry.in_swap = holds_swap(&list);
        Ok(visible_id(key, &entry))
    }

    /// Remove a blob and hand back everything it held
    pub fn delete(&self, id: BlobId) -> Result<BlobRecord> {
        let key = self.key_of(id)?;
        let (_, entry) = self.entries.remove(&key).ok_or(Error::BlobIdNotFound(id))?;
        self.names.remove(&blob_key(entry.bucket, &entry.name));
        let buffers = self.lists.get(entry.buffers)?;
        self.lists.delete(entry.buffers)?;
        Ok(BlobRecord {
            name: entry.name,
            bucket: entry.bucket,
            buffers,
            size: entry.size,
            user_score: entry.user_score,
            access_count: entry.access.count,
            vbuckets: entry.vbuckets,
        })
    }

    /// Adopt a blob removed from another table
    pub fn install(&self, record: BlobRecord) -> Result<BlobId> {
        match self.names.entry(blob_key(record.bucket, &record.name)) {
            Entry::Occupied(_) => Err(Error::invalid_argument(format!(
                "blob {} already exists in bucket {}",
                record.name, record.bucket
            ))),
            Entry::Vacant(slot) => {
                check_cover(BlobId::NULL, &record.buffers, record.size)?;
                let id = self.allocate_id();
                let in_swap = holds_swap(&record.buffers);
                let buffers = self.lists.put(&record.buffers)?;
                self.entries.insert(
                    id,
                    BlobEntry {
                        name: record.name,
                        bucket: record.bucket,
                        buffers,
                        size: record.size,
                        user_score: record.user_score,
                        access: AccessStats {
                            count: record.access_count,
                            ..AccessStats::new()
                        },
                        vbuckets: record.vbuckets,
                        in_swap,
                        pending: false,
                    },
                );
                slot.insert(id);
                Ok(if in_swap { id.to_swap() } else { id })
            }
        }
    }

    pub fn size(&self, id: BlobId) -> Result<u64> {
        let key = self.key_of(id)?;
        self.entries
            .get(&key)
            .map(|e| e.size)
            .ok_or(Error::BlobIdNotFound(id))
    }

    pub fn name(&self, id: BlobId) -> Result<String> {
        let key = self.key_of(id)?;
        self.entries
            .get(&key)
            .map(|e| e.name.clone())
            .ok_or(Error::BlobIdNotFound(id))
    }

    pub fn record_access(&self, id: BlobId) -> Result<()> {
        let key = self.key_of(id)?;
        let mut entry = self.entries.get_mut(&key).ok_or(Error::BlobIdNotFound(id))?;
        entry.access.touch();
        Ok(())
    }

    /// Add or drop a vbucket tag
    pub fn tag(&self, id: BlobId, vbucket: VBucketId, linked: bool) -> Result<()> {
        let key = self.key_of(id)?;
        let mut entry = self.entries.get_mut(&key).ok_or(Error::BlobIdNotFound(id))?;
        if linked {
            if !entry.vbuckets.contains(&vbucket) {
                entry.vbuckets.push(vbucket);
            }
        } else {
            entry.vbuckets.retain(|&v| v != vbucket);
        }
        Ok(())
    }

    /// Snapshot of every blob held here
    pub fn summaries(&self) -> Vec<BlobSummary> {
        self.entries
            .iter()
            .filter(|e| !e.pending)
            .filter_map(|e| {
                let buffers = self.lists.get(e.buffers).ok()?;
                Some(BlobSummary {
                    id: visible_id(*e.key(), e.value()),
                    size: e.size,
                    buffers,
                    access_count: e.access.count,
                    since_access: e.access.last_access.elapsed(),
                    user_score: e.user_score,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierio_common::{DeviceId, KIB, TargetId};

    fn table() -> BlobTable {
        BlobTable::new(NodeId::new(1), 64 * KIB).unwrap()
    }

    fn bucket() -> BucketId {
        BucketId::new(1, NodeId::new(1))
    }

    fn buffer(target: TargetId, blob_offset: u64, blob_size: u64) -> BufferInfo {
        BufferInfo {
            target_id: target,
            target_offset: blob_offset,
            target_size: blob_size,
            blob_offset,
            blob_size,
        }
    }

    fn ram() -> TargetId {
        TargetId::new(NodeId::new(1), DeviceId::new(0), 0)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let table = table();
        let (id, created) = table.get_or_create(bucket(), "a").unwrap();
        assert!(created);
        assert_eq!(table.get_or_create(bucket(), "a").unwrap(), (id, true));
        table.commit(id, &[], 0, 1.0).unwrap();
        assert_eq!(table.get_or_create(bucket(), "a").unwrap(), (id, false));
        assert_eq!(table.get_id(bucket(), "a"), Some(id));
        assert_eq!(table.get_id(bucket(), "b"), None);
        assert_eq!(table.size(id).unwrap(), 0);
    }

    #[test]
    fn test_uncommitted_blob_is_invisible() {
        let table = table();
        let (id, _) = table.get_or_create(bucket(), "a").unwrap();
        assert_eq!(table.get_id(bucket(), "a"), None);
        assert!(table.summaries().is_empty());
        assert!(table.is_empty());

        assert!(table.discard(id).unwrap());
        assert!(matches!(table.size(id), Err(Error::BlobIdNotFound(_))));
        let (again, created) = table.get_or_create(bucket(), "a").unwrap();
        assert!(created);
        assert_ne!(again, id);
    }

    #[test]
    fn test_discard_leaves_committed_blob() {
        let table = table();
        let (id, _) = table.get_or_create(bucket(), "a").unwrap();
        table.commit(id, &[buffer(ram(), 0, 8)], 8, 1.0).unwrap();
        assert!(!table.discard(id).unwrap());
        assert_eq!(table.get_id(bucket(), "a"), Some(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_commit_returns_previous_list() {
        let table = table();
        let (id, _) = table.get_or_create(bucket(), "a").unwrap();
        let first = vec![buffer(ram(), 0, 8)];
        let (id, old, listed) = table.commit(id, &first, 8, 1.0).unwrap();
        assert!(old.is_empty());
        assert_eq!(listed, Some(bucket()));

        let second = vec![buffer(ram(), 0, 4), buffer(ram(), 4, 12)];
        let (_, old, listed) = table.commit(id, &second, 16, 1.0).unwrap();
        assert_eq!(old, first);
        assert_eq!(listed, None);
        assert_eq!(table.buffers(id).unwrap(), second);
    }

    #[test]
    fn test_commit_rejects_gaps() {
        let table = table();
        let (id, _) = table.get_or_create(bucket(), "a").unwrap();
        let gappy = vec![buffer(ram(), 0, 4), buffer(ram(), 8, 4)];
        assert!(table.commit(id, &gappy, 12, 1.0).is_err());
    }

    #[test]
    fn test_swap_id_follows_buffers() {
        let table = table();
        let (id, _) = table.get_or_create(bucket(), "a").unwrap();
        let swapped = vec![buffer(TargetId::swap(NodeId::new(1)), 0, 10)];
        let (swap_id, _, _) = table.commit(id, &swapped, 10, 1.0).unwrap();
        assert!(swap_id.is_in_swap());
        assert_eq!(table.get_id(bucket(), "a"), Some(swap_id));

        let tiered = vec![buffer(ram(), 0, 10)];
        let new_id = table.replace_buffers(swap_id, &swapped, &tiered).unwrap();
        assert!(!new_id.is_in_swap());
        assert!(matches!(table.size(swap_id), Err(Error::BlobIdNotFound(_))));
        assert_eq!(table.size(new_id).unwrap(), 10);
    }

    #[test]
    fn test_replace_requires_present_buffers() {
        let table = table();
        let (id, _) = table.get_or_create(bucket(), "a").unwrap();
        let list = vec![buffer(ram(), 0, 10)];
        table.commit(id, &list, 10, 1.0).unwrap();

        let stranger = buffer(ram(), 0, 5);
        assert!(table.replace_buffers(id, &[stranger], &list).is_err());
        assert_eq!(table.buffers(id).unwrap(), list);
    }

    #[test]
    fn test_delete_then_install() {
        let table = table();
        let (id, _) = table.get_or_create(bucket(), "a").unwrap();
        table.commit(id, &[buffer(ram(), 0, 3)], 3, 0.5).unwrap();
        table.record_access(id).unwrap();

        let mut record = table.delete(id).unwrap();
        assert_eq!(record.access_count, 1);
        assert!(table.is_empty());
        assert_eq!(table.get_id(bucket(), "a"), None);

        record.name = "b".to_string();
        let new_id = table.install(record.clone()).unwrap();
        assert_eq!(table.get_id(bucket(), "b"), Some(new_id));
        assert!(table.install(record).is_err());
    }
}
