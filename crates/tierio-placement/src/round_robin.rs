//! Round-robin placement
//!
//! A cursor shared by every caller walks the target list. Each assignment
//! lands on the first target at or after the cursor with room, and moves the
//! cursor one past it. Room is counted in whole blocks of the target.

use tierio_common::{Error, PlacementSchema, Result, TargetInfo};

fn next_fit(capacity: &[u64], targets: &[TargetInfo], cursor: &mut usize, size: u64) -> Option<usize> {
    let n = capacity.len();
    let found = (0..n)
        .map(|i| (*cursor + i) % n)
        .find(|&t| capacity[t] >= targets[t].reserved_for(size))?;
    *cursor = (found + 1) % n;
    Some(found)
}

/// Place every blob of the batch round-robin
///
/// With `split` set, a blob is cut into as many equal pieces as there are
/// targets (fewer when not enough targets have room) and the pieces go to
/// successive targets.
pub fn round_robin_placement(
    blob_sizes: &[u64],
    targets: &[TargetInfo],
    split: bool,
    cursor: &mut usize,
) -> Result<Vec<PlacementSchema>> {
    let mut capacity: Vec<u64> = targets.iter().map(|t| t.remaining_capacity).collect();
    let mut schemas = Vec::with_capacity(blob_sizes.len());
    if !targets.is_empty() {
        *cursor %= targets.len();
    }

    for &size in blob_sizes {
        let failed = Error::RoundRobinFindTargetFailed { size };
        if targets.is_empty() {
            return Err(failed);
        }

        let schema = if split {
            split_across(&mut capacity, cursor, size, targets).ok_or(failed)?
        } else {
            let t = next_fit(&capacity, targets, cursor, size).ok_or(failed)?;
            capacity[t] -= targets[t].reserved_for(size);
            let mut schema = PlacementSchema::new();
            schema.push(size, targets[t].id);
            schema
        };
        schemas.push(schema);
    }
    Ok(schemas)
}

fn split_across(
    capacity: &mut [u64],
    cursor: &mut usize,
    size: u64,
    targets: &[TargetInfo],
) -> Option<PlacementSchema> {
    let max_parts = (targets.len() as u64).min(size.max(1));
    for parts in (1..=max_parts).rev() {
        let piece = size / parts;
        let last = piece + size % parts;

        let mut trial_cursor = *cursor;
        let mut trial_capacity = capacity.to_vec();
        let mut schema = PlacementSchema::new();
        let mut used = Vec::with_capacity(parts as usize);
        for p in 0..parts {
            let want = if p + 1 == parts { last } else { piece };
            // each piece goes to a distinct target
            let n = trial_capacity.len();
            let found = (0..n)
                .map(|i| (trial_cursor + i) % n)
                .find(|&t| !used.contains(&t) && trial_capacity[t] >= targets[t].reserved_for(want));
            let Some(t) = found else { break };
            trial_capacity[t] -= targets[t].reserved_for(want);
            trial_cursor = (t + 1) % n;
            used.push(t);
            schema.push(want, targets[t].id);
        }

        if used.len() as u64 == parts {
            capacity.copy_from_slice(&trial_capacity);
            *cursor = trial_cursor;
            return Some(schema);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tierio_common::{DeviceId, NodeId, TargetId};

    fn targets(capacities: &[u64]) -> Vec<TargetInfo> {
        blocked(capacities, 1)
    }

    fn blocked(capacities: &[u64], block_size: u64) -> Vec<TargetInfo> {
        capacities
            .iter()
            .enumerate()
            .map(|(i, &cap)| TargetInfo {
                id: TargetId::new(NodeId::new(1), DeviceId::new(i as u8), i as u16),
                max_capacity: cap,
                remaining_capacity: cap,
                bandwidth: 100.0,
                latency: 10.0,
                block_size,
            })
            .collect()
    }

    #[test]
    fn test_cycles_through_targets() {
        let targets = targets(&[100, 100, 100]);
        let mut cursor = 0;
        let schemas = round_robin_placement(&[10, 10, 10, 10], &targets, false, &mut cursor).unwrap();
        let chosen: Vec<u16> = schemas.iter().map(|s| s.entries()[0].target.index).collect();
        assert_eq!(chosen, vec![0, 1, 2, 0]);
        assert_eq!(cursor, 1);
    }

    #[test]
    fn test_cursor_persists_across_calls() {
        let targets = targets(&[100, 100]);
        let mut cursor = 0;
        round_robin_placement(&[1], &targets, false, &mut cursor).unwrap();
        let schemas = round_robin_placement(&[1], &targets, false, &mut cursor).unwrap();
        assert_eq!(schemas[0].entries()[0].target.index, 1);
    }

    #[test]
    fn test_skips_full_targets() {
        let targets = targets(&[5, 50, 5]);
        let mut cursor = 2;
        let schemas = round_robin_placement(&[20, 20], &targets, false, &mut cursor).unwrap();
        for schema in &schemas {
            assert_eq!(schema.entries()[0].target.index, 1);
            assert_eq!(schema.total_size(), 20);
        }

        let err = round_robin_placement(&[51], &targets, false, &mut cursor).unwrap_err();
        assert!(matches!(err, Error::RoundRobinFindTargetFailed { size: 51 }));
    }

    #[test]
    fn test_split_evenly() {
        let targets = targets(&[100, 100, 100]);
        let mut cursor = 0;
        let schemas = round_robin_placement(&[31], &targets, true, &mut cursor).unwrap();
        let sizes: Vec<u64> = schemas[0].iter().map(|e| e.size).collect();
        assert_eq!(sizes, vec![10, 10, 11]);
        assert_eq!(schemas[0].total_size(), 31);
    }

    #[test]
    fn test_split_uses_fewer_targets_when_needed() {
        let targets = targets(&[100, 1, 100]);
        let mut cursor = 0;
        let schemas = round_robin_placement(&[60], &targets, true, &mut cursor).unwrap();
        assert_eq!(schemas[0].len(), 2);
        assert_eq!(schemas[0].total_size(), 60);
        assert!(schemas[0].iter().all(|e| e.target.index != 1));
    }

    #[test]
    fn test_counts_whole_blocks() {
        let targets = blocked(&[64 * 1024], 4096);
        let mut cursor = 0;
        let err = round_robin_placement(&[20 * 1024 + 1; 3], &targets, false, &mut cursor).unwrap_err();
        assert!(matches!(err, Error::RoundRobinFindTargetFailed { .. }));

        let schemas = round_robin_placement(&[20 * 1024 + 1; 2], &targets, false, &mut cursor).unwrap();
        assert_eq!(schemas.len(), 2);
    }
}
