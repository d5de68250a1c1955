//! Blob and target scores

use std::collections::HashMap;
use std::time::Duration;
use tierio_common::config::BorgConfig;
use tierio_common::{TargetId, TargetInfo};

/// Score difference below which a blob stays where it is
pub const MOVE_THRESHOLD: f64 = 0.1;

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if max <= min {
        return if value >= max { 1.0 } else { 0.0 };
    }
    ((value - min) / (max - min)).clamp(0.0, 1.0)
}

/// Importance of a blob in `[0, 1]`
///
/// The larger of a frequency score and a recency score, scaled by the user
/// score. A blob never read ages from the moment it was created.
#[must_use]
pub fn blob_score(config: &BorgConfig, access_count: u64, since_access: Duration, user_score: f64) -> f64 {
    let freq = normalize(access_count as f64, config.freq_min, config.freq_max);
    let recency = 1.0
        - normalize(
            since_access.as_secs_f64(),
            config.recency_min_secs,
            config.recency_max_secs,
        );
    (freq.max(recency) * user_score).clamp(0.0, 1.0)
}

/// Bandwidth of each target scaled onto `[0, 1]` across `targets`
#[must_use]
pub fn target_scores(targets: &[TargetInfo]) -> HashMap<TargetId, f64> {
    let min = targets.iter().map(|t| t.bandwidth).fold(f64::INFINITY, f64::min);
    let max = targets.iter().map(|t| t.bandwidth).fold(f64::NEG_INFINITY, f64::max);
    targets
        .iter()
        .map(|t| (t.id, normalize(t.bandwidth, min, max)))
        .collect()
}
