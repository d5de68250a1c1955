//! MinimizeIoTime placement
//!
//! One linear program per batch. Variable `x[i][j]` is the fraction of blob
//! `i` stored on target `j`; the objective is the total transfer time
//! `sum x[i][j] * s_i / bandwidth_j`. Sizes and capacities enter the program
//! in MiB to keep coefficients well scaled.
//!
//! Every share a blob leaves on a target is rounded up to whole blocks when
//! buffered, and rounding to bytes may add up to one byte per target, so
//! each target's room is cut by one block plus `m` bytes per blob.

use crate::simplex::{LinearProgram, LpError, Relation};
use tierio_common::{Error, MIB, MinimizeIoTimeOptions, PlacementSchema, Result, TargetInfo};
use tracing::debug;

fn mib(bytes: u64) -> f64 {
    bytes as f64 / MIB as f64
}

/// Build and solve the batch program, then round to whole bytes
pub fn minimize_io_time_placement(
    blob_sizes: &[u64],
    targets: &[TargetInfo],
    options: &MinimizeIoTimeOptions,
) -> Result<Vec<PlacementSchema>> {
    let blobs = blob_sizes.len();
    let m = targets.len();
    if m == 0 {
        return Err(Error::MinimizeIoTimeNoSolution);
    }
    if blobs == 0 {
        return Ok(Vec::new());
    }
    let var = |i: usize, j: usize| i * m + j;
    let sizes: Vec<f64> = blob_sizes.iter().map(|&s| mib(s)).collect();

    let mut objective = vec![0.0; blobs * m];
    for (i, &s) in sizes.iter().enumerate() {
        for (j, target) in targets.iter().enumerate() {
            objective[var(i, j)] = s / target.bandwidth.max(f64::MIN_POSITIVE);
        }
    }
    let mut lp = LinearProgram::new(objective);

    // every blob is placed completely
    for i in 0..blobs {
        let mut row = vec![0.0; blobs * m];
        for j in 0..m {
            row[var(i, j)] = 1.0;
        }
        lp.constrain(row, Relation::Equal, 1.0);
    }

    let load_row = |j: usize| {
        let mut row = vec![0.0; blobs * m];
        for (i, &s) in sizes.iter().enumerate() {
            row[var(i, j)] = s;
        }
        row
    };

    for (j, target) in targets.iter().enumerate() {
        // capacity, less the share that must stay free
        let reserve = options.minimum_remaining_capacity * mib(target.max_capacity);
        let slack = blobs as f64 * mib(target.block_size + m as u64);
        let room = (mib(target.remaining_capacity) - reserve - slack).max(0.0);
        lp.constrain(load_row(j), Relation::LessEq, room);

        if options.capacity_change_threshold > 0.0 {
            let limit = options.capacity_change_threshold * mib(target.remaining_capacity);
            lp.constrain(load_row(j), Relation::LessEq, limit);
        }
    }

    if options.use_placement_ratio && m > 1 {
        let mut order: Vec<usize> = (0..m).collect();
        order.sort_by(|&a, &b| targets[b].bandwidth.total_cmp(&targets[a].bandwidth));
        for pair in order.windows(2) {
            let (fast, slow) = (pair[0], pair[1]);
            let rem_fast = mib(targets[fast].remaining_capacity);
            let rem_slow = mib(targets[slow].remaining_capacity);
            // load_fast * rem_slow <= ratio * load_slow * rem_fast
            let mut row = vec![0.0; blobs * m];
            for (i, &s) in sizes.iter().enumerate() {
                row[var(i, fast)] = s * rem_slow;
                row[var(i, slow)] = -options.placement_ratio * s * rem_fast;
            }
            lp.constrain(row, Relation::LessEq, 0.0);
        }
    }

    let x = lp.minimize().map_err(|e| {
        debug!("MinimizeIoTime over {} targets failed: {}", m, e);
        match e {
            LpError::Infeasible | LpError::Unbounded | LpError::IterationLimit(_) => {
                Error::MinimizeIoTimeNoSolution
            }
        }
    })?;

    Ok(blob_sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| round_shares(size, &x[i * m..(i + 1) * m], targets))
        .collect())
}

/// Turn fractional shares into byte counts that sum to `size`
///
/// Every target but the one with the largest share gets `floor(x * size)`;
/// that one absorbs the rest. Ties go to the earliest target.
fn round_shares(size: u64, shares: &[f64], targets: &[TargetInfo]) -> PlacementSchema {
    let products: Vec<f64> = shares.iter().map(|&x| x.clamp(0.0, 1.0) * size as f64).collect();
    let largest = products
        .iter()
        .enumerate()
        .fold(0, |best, (j, &p)| if p > products[best] { j } else { best });

    // solver noise must not knock an exact share down a byte
    let mut amounts: Vec<u64> = products.iter().map(|&p| (p + 1e-6).floor() as u64).collect();
    amounts[largest] = 0;
    let others: u64 = amounts.iter().sum();
    amounts[largest] = size.saturating_sub(others);

    let mut schema = PlacementSchema::new();
    for (j, &amount) in amounts.iter().enumerate() {
        if amount > 0 {
            schema.push(amount, targets[j].id);
        }
    }
    schema
}
