//! Random placement
//!
//! Targets are indexed by remaining capacity in an ordered multi-map. Every
//! piece picks uniformly among the targets with room for it, and the chosen
//! target is re-keyed under its reduced capacity so later pieces of the same
//! batch see it. A piece is charged the whole blocks it will occupy.

use rand::Rng;
use std::collections::BTreeMap;
use tierio_common::{Error, KIB, MIB, PlacementSchema, Result, TargetInfo};

/// Blobs above this size may be split
pub const SPLIT_THRESHOLD: u64 = 64 * KIB;

/// Candidate split factors; larger blobs may use more of them
pub const SPLIT_FACTORS: [u64; 10] = [2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];

/// Number of split factors allowed for a blob of `size` bytes
#[must_use]
pub const fn split_choices(size: u64) -> usize {
    if size <= 256 * KIB {
        2
    } else if size <= MIB {
        5
    } else if size <= 4 * MIB {
        8
    } else {
        SPLIT_FACTORS.len()
    }
}

/// Cut `size` into `parts` pieces; the last absorbs the remainder
#[must_use]
pub fn split_sizes(size: u64, parts: u64) -> Vec<u64> {
    let piece = size / parts;
    let mut sizes = vec![piece; parts as usize];
    if let Some(last) = sizes.last_mut() {
        *last += size - piece * parts;
    }
    sizes
}

struct CapacityIndex<'a> {
    targets: &'a [TargetInfo],
    by_capacity: BTreeMap<u64, Vec<usize>>,
    capacity: Vec<u64>,
}

impl<'a> CapacityIndex<'a> {
    fn new(targets: &'a [TargetInfo]) -> Self {
        let mut index = Self {
            targets,
            by_capacity: BTreeMap::new(),
            capacity: targets.iter().map(|t| t.remaining_capacity).collect(),
        };
        for (i, &cap) in index.capacity.iter().enumerate() {
            index.by_capacity.entry(cap).or_default().push(i);
        }
        index
    }

    fn pick<R: Rng>(&mut self, size: u64, rng: &mut R) -> Option<usize> {
        let candidates: Vec<usize> = self
            .by_capacity
            .range(size..)
            .flat_map(|(_, targets)| targets.iter().copied())
            .filter(|&t| self.capacity[t] >= self.targets[t].reserved_for(size))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let chosen = candidates[rng.gen_range(0..candidates.len())];

        let old = self.capacity[chosen];
        if let Some(bucket) = self.by_capacity.get_mut(&old) {
            bucket.retain(|&t| t != chosen);
            if bucket.is_empty() {
                self.by_capacity.remove(&old);
            }
        }
        let new = old - self.targets[chosen].reserved_for(size);
        self.capacity[chosen] = new;
        self.by_capacity.entry(new).or_default().push(chosen);
        Some(chosen)
    }
}

/// Place every blob of the batch on randomly chosen targets
pub fn random_placement<R: Rng>(
    blob_sizes: &[u64],
    targets: &[TargetInfo],
    rng: &mut R,
) -> Result<Vec<PlacementSchema>> {
    let mut index = CapacityIndex::new(targets);
    let mut schemas = Vec::with_capacity(blob_sizes.len());

    for &size in blob_sizes {
        let pieces = if size > SPLIT_THRESHOLD && rng.gen_bool(0.5) {
            let factor = SPLIT_FACTORS[rng.gen_range(0..split_choices(size))];
            split_sizes(size, factor)
        } else {
            vec![size]
        };

        let mut schema = PlacementSchema::new();
        for piece in pieces {
            let chosen = index
                .pick(piece, rng)
                .ok_or(Error::RandomFoundNoTarget { size: piece })?;
            schema.push(piece, targets[chosen].id);
        }
        schemas.push(schema);
    }
    Ok(schemas)
}
