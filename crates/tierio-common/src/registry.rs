//! Registry of the local node's buffering targets
//!
//! Targets are registered once when a node is built; afterwards only their
//! remaining capacity changes. Capacity is tracked with atomics so placement
//! can snapshot the registry without taking the allocators' locks.

use crate::error::{Error, Result};
use crate::types::{NodeId, TargetId, TargetInfo};
use std::sync::atomic::{AtomicU64, Ordering};

/// One registered target; everything but the remaining capacity is fixed
#[derive(Debug)]
struct TargetEntry {
    info: TargetInfo,
    remaining_capacity: AtomicU64,
}

impl TargetEntry {
    fn info(&self) -> TargetInfo {
        TargetInfo {
            remaining_capacity: self.remaining_capacity.load(Ordering::Acquire),
            ..self.info
        }
    }
}

/// Local target registry
#[derive(Debug)]
pub struct TargetRegistry {
    node_id: NodeId,
    targets: Vec<TargetEntry>,
}

impl TargetRegistry {
    /// Create an empty registry for `node_id`
    #[must_use]
    pub const fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            targets: Vec::new(),
        }
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Register a target; its capacity starts fully available
    pub fn register(&mut self, info: TargetInfo) -> Result<()> {
        if info.id.node_id != self.node_id {
            return Err(Error::invalid_argument(format!(
                "target {} does not belong to node {}",
                info.id, self.node_id
            )));
        }
        if self.contains(info.id) {
            return Err(Error::invalid_argument(format!("target {} registered twice", info.id)));
        }
        self.targets.push(TargetEntry {
            remaining_capacity: AtomicU64::new(info.remaining_capacity.min(info.max_capacity)),
            info,
        });
        Ok(())
    }

    fn entry(&self, id: TargetId) -> Result<&TargetEntry> {
        self.targets
            .iter()
            .find(|t| t.info.id == id)
            .ok_or(Error::TargetNotFound(id))
    }

    #[must_use]
    pub fn contains(&self, id: TargetId) -> bool {
        self.targets.iter().any(|t| t.info.id == id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Ids in registration order
    pub fn ids(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.targets.iter().map(|t| t.info.id)
    }

    /// Snapshot one target
    pub fn get(&self, id: TargetId) -> Result<TargetInfo> {
        self.entry(id).map(TargetEntry::info)
    }

    /// Snapshot every target in registration order
    #[must_use]
    pub fn infos(&self) -> Vec<TargetInfo> {
        self.targets.iter().map(TargetEntry::info).collect()
    }

    /// Remaining capacity of a target
    pub fn remaining_capacity(&self, id: TargetId) -> Result<u64> {
        Ok(self.entry(id)?.remaining_capacity.load(Ordering::Acquire))
    }

    /// Consume `bytes` of a target's remaining capacity
    pub fn consume(&self, id: TargetId, bytes: u64) -> Result<()> {
        let entry = self.entry(id)?;
        entry
            .remaining_capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |rem| rem.checked_sub(bytes))
            .map(|_| ())
            .map_err(|_| Error::OutOfCapacity {
                target: id,
                requested: bytes,
            })
    }

    /// Give `bytes` back to a target, never exceeding its max capacity
    pub fn restore(&self, id: TargetId, bytes: u64) -> Result<()> {
        let entry = self.entry(id)?;
        let max = entry.info.max_capacity;
        let _ = entry
            .remaining_capacity
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |rem| {
                Some(rem.saturating_add(bytes).min(max))
            });
        Ok(())
    }
}
