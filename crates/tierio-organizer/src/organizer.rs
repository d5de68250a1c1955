//! Buffer organizer
//!
//! Moves blob bytes between tiers. A pass first pulls blobs out of swap,
//! then walks the local targets from fastest to slowest: a target above its
//! maximum utilization pushes its least important blobs one tier down, a
//! target below its minimum pulls the most important blobs up from slower
//! tiers.
//!
//! Only blobs whose metadata lives on this node and buffers that live on this
//! node's targets take part in a pass.

use crate::data_path::DataPath;
use crate::score::{MOVE_THRESHOLD, blob_score, target_scores};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tierio_common::config::{BorgConfig, Config};
use tierio_common::{BlobId, BufferInfo, Error, Result, TargetId, TargetInfo};
use tierio_meta::{BlobSummary, MetadataManager};
use tierio_placement::DataPlacementEngine;
use tracing::{debug, info, warn};

/// Organizer statistics
#[derive(Debug, Default)]
pub struct BorgStats {
    pub passes: AtomicU64,
    pub moves: AtomicU64,
    pub failed_moves: AtomicU64,
    pub promotions: AtomicU64,
    pub demotions: AtomicU64,
    pub swap_relocations: AtomicU64,
}

/// What one organize pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrganizeReport {
    pub demotions: usize,
    pub promotions: usize,
    pub relocations: usize,
}

impl OrganizeReport {
    #[must_use]
    pub const fn moves(&self) -> usize {
        self.demotions + self.promotions + self.relocations
    }
}

/// Runs of buffers on one target covering consecutive blob bytes
fn contiguous_runs(mut buffers: Vec<BufferInfo>) -> Vec<Vec<BufferInfo>> {
    buffers.sort_by_key(|b| b.blob_offset);
    let mut runs: Vec<Vec<BufferInfo>> = Vec::new();
    for buffer in buffers {
        match runs.last_mut() {
            Some(run)
                if run.last().is_some_and(|prev| {
                    prev.target_id == buffer.target_id && prev.blob_end() == buffer.blob_offset
                }) =>
            {
                run.push(buffer);
            }
            _ => runs.push(vec![buffer]),
        }
    }
    runs
}

/// Start and end of the blob range covered by `buffers`, if they tile it
fn span(buffers: &[BufferInfo]) -> Option<(u64, u64)> {
    let mut sorted: Vec<&BufferInfo> = buffers.iter().collect();
    sorted.sort_by_key(|b| b.blob_offset);
    let start = sorted.first()?.blob_offset;
    let mut cursor = start;
    for buffer in sorted {
        if buffer.blob_offset != cursor {
            return None;
        }
        cursor = buffer.blob_end();
    }
    Some((start, cursor))
}

struct Candidate {
    blob: BlobId,
    score: f64,
    runs: Vec<Vec<BufferInfo>>,
}

/// Background tier migration for one node
pub struct BufferOrganizer {
    config: BorgConfig,
    thresholds: HashMap<TargetId, (f64, f64)>,
    data: Arc<DataPath>,
    mdm: Arc<MetadataManager>,
    dpe: Arc<DataPlacementEngine>,
    stats: BorgStats,
    pass_lock: Mutex<()>,
}

impl BufferOrganizer {
    #[must_use]
    pub fn new(
        config: &Config,
        data: Arc<DataPath>,
        mdm: Arc<MetadataManager>,
        dpe: Arc<DataPlacementEngine>,
    ) -> Self {
        let thresholds = data
            .pool()
            .registry()
            .ids()
            .zip(&config.devices)
            .map(|(target, device)| (target, config.borg.thresholds_for(device)))
            .collect();
        Self {
            config: config.borg.clone(),
            thresholds,
            data,
            mdm,
            dpe,
            stats: BorgStats::default(),
            pass_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &BorgStats {
        &self.stats
    }

    fn score(&self, summary: &BlobSummary) -> f64 {
        blob_score(
            &self.config,
            summary.access_count,
            summary.since_access,
            summary.user_score,
        )
    }

    fn utilization(&self, target: TargetId) -> Result<f64> {
        Ok(self.data.pool().registry().get(target)?.utilization())
    }

    /// Replace `src` with `dests` for one blob
    ///
    /// Runs under the blob lock: the source bytes are read, written to the
    /// already reserved destinations and the buffer list is swapped in one
    /// metadata update. Sources are released on success, destinations on
    /// failure. Returns the blob's id afterwards.
    pub fn move_buffers(&self, blob: BlobId, src: &[BufferInfo], dests: &[BufferInfo]) -> Result<BlobId> {
        let guard = self.mdm.lock_blob(blob)?;
        match self.move_locked(blob, src, dests) {
            Ok(moved) => {
                if let Err(e) = self.data.release_buffers(src) {
                    warn!("Moved blob {} but could not release its old buffers: {}", blob, e);
                }
                drop(guard);
                self.stats.moves.fetch_add(1, Ordering::Relaxed);
                Ok(moved)
            }
            Err(e) => {
                drop(guard);
                self.stats.failed_moves.fetch_add(1, Ordering::Relaxed);
                if let Err(release) = self.data.release_buffers(dests) {
                    warn!("Could not release destinations of failed move: {}", release);
                }
                Err(e)
            }
        }
    }

    fn move_locked(&self, blob: BlobId, src: &[BufferInfo], dests: &[BufferInfo]) -> Result<BlobId> {
        let current = self.mdm.buffer_list(blob)?;
        if src.iter().any(|b| !current.contains(b)) {
            return Err(Error::invalid_argument(format!(
                "blob {} no longer holds the buffers being moved",
                blob
            )));
        }
        let (start, end) = span(src)
            .ok_or_else(|| Error::invalid_argument("move sources are not contiguous"))?;
        if span(dests) != Some((start, end)) {
            return Err(Error::invalid_argument(format!(
                "move destinations do not cover blob bytes {}..{}",
                start, end
            )));
        }

        let mut region = vec![0u8; (end - start) as usize];
        for buffer in src {
            let data = self.data.read_buffer(buffer)?;
            let at = (buffer.blob_offset - start) as usize;
            region
                .get_mut(at..at + data.len())
                .ok_or_else(|| Error::storage(format!("read past move region from {}", buffer.target_id)))?
                .copy_from_slice(&data);
        }
        self.data.place_blob_in_buffers(&region, start, dests)?;
        self.mdm.replace_buffers(blob, src.to_vec(), dests.to_vec())
    }

    /// Move one run of buffers onto `target`
    fn move_run(&self, blob: BlobId, run: &[BufferInfo], target: TargetId) -> Result<BlobId> {
        let (start, end) = span(run).ok_or_else(|| Error::internal("buffer run is not contiguous"))?;
        let dests = self.data.pool().allocate_segment(target, start, end - start)?;
        self.move_buffers(blob, run, &dests)
    }

    /// One full organize pass
    pub fn organize_once(&self) -> Result<OrganizeReport> {
        let _pass = self.pass_lock.lock();
        let mut report = OrganizeReport::default();
        let mut budget = self.config.max_moves_per_pass;

        self.relocate_swap(&mut report, &mut budget);

        let mut targets = self.data.pool().registry().infos();
        targets.sort_by(|a, b| b.bandwidth.total_cmp(&a.bandwidth));
        let scores = target_scores(&targets);

        for (i, info) in targets.iter().enumerate() {
            let (min, max) = self.thresholds.get(&info.id).copied().unwrap_or((
                self.config.min_capacity_threshold,
                self.config.max_capacity_threshold,
            ));
            let slower = &targets[i + 1..];
            let utilization = self.utilization(info.id)?;
            if utilization > max {
                self.demote(info.id, max, slower, &scores, &mut report, &mut budget)?;
            } else if utilization < min {
                self.promote(info.id, min, slower, &scores, &mut report, &mut budget)?;
            }
        }

        let merged = self.data.pool().merge_free_lists();
        self.stats.passes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .demotions
            .fetch_add(report.demotions as u64, Ordering::Relaxed);
        self.stats
            .promotions
            .fetch_add(report.promotions as u64, Ordering::Relaxed);
        self.stats
            .swap_relocations
            .fetch_add(report.relocations as u64, Ordering::Relaxed);
        debug!(
            "Organize pass: {} demotions, {} promotions, {} relocations, {} buffers merged",
            report.demotions, report.promotions, report.relocations, merged
        );
        Ok(report)
    }

    fn relocate_swap(&self, report: &mut OrganizeReport, budget: &mut usize) {
        let pool = self.data.pool();
        for summary in self.mdm.local_blobs() {
            if *budget == 0 {
                return;
            }
            if !summary.id.is_in_swap() {
                continue;
            }
            // swap holds whole blobs in one buffer starting at offset 0
            let src: Vec<BufferInfo> = summary
                .buffers
                .iter()
                .filter(|b| b.target_id.is_swap() && pool.is_local(b.target_id))
                .copied()
                .collect();
            if src.is_empty() || span(&src) != Some((0, summary.size)) {
                continue;
            }

            let targets = pool.registry().infos();
            let schema = match self
                .dpe
                .placement(&[summary.size], &targets, self.dpe.default_context())
            {
                Ok(mut schemas) => schemas.remove(0),
                Err(e) => {
                    debug!("Blob {} stays in swap: {}", summary.id, e);
                    continue;
                }
            };
            let dests = match pool.allocate_buffers(&schema) {
                Ok(dests) => dests,
                Err(e) => {
                    debug!("Blob {} stays in swap: {}", summary.id, e);
                    continue;
                }
            };
            match self.move_buffers(summary.id, &src, &dests) {
                Ok(tiered) => {
                    info!("Relocated blob {} out of swap as {}", summary.id, tiered);
                    report.relocations += 1;
                    *budget -= 1;
                }
                Err(e) => warn!("Relocating blob {} out of swap failed: {}", summary.id, e),
            }
        }
    }

    fn demote(
        &self,
        target: TargetId,
        max: f64,
        slower: &[TargetInfo],
        scores: &HashMap<TargetId, f64>,
        report: &mut OrganizeReport,
        budget: &mut usize,
    ) -> Result<()> {
        let target_score = scores.get(&target).copied().unwrap_or(1.0);
        let mut candidates: Vec<Candidate> = self
            .mdm
            .local_blobs()
            .into_iter()
            .filter_map(|summary| {
                let score = self.score(&summary);
                let on_target: Vec<BufferInfo> = summary
                    .buffers
                    .iter()
                    .filter(|b| b.target_id == target)
                    .copied()
                    .collect();
                (!on_target.is_empty() && target_score - score >= MOVE_THRESHOLD).then(|| Candidate {
                    blob: summary.id,
                    score,
                    runs: contiguous_runs(on_target),
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.score.total_cmp(&b.score));

        'blobs: for candidate in candidates {
            let mut blob = candidate.blob;
            for run in candidate.runs {
                if *budget == 0 || self.utilization(target)? <= max {
                    break 'blobs;
                }
                let moved = slower.iter().find_map(|dest| {
                    self.move_run(blob, &run, dest.id)
                        .map_err(|e| debug!("Demoting blob {} to {} failed: {}", blob, dest.id, e))
                        .ok()
                });
                let Some(id) = moved else {
                    continue 'blobs;
                };
                blob = id;
                report.demotions += 1;
                *budget -= 1;
            }
        }
        Ok(())
    }

    fn promote(
        &self,
        target: TargetId,
        min: f64,
        slower: &[TargetInfo],
        scores: &HashMap<TargetId, f64>,
        report: &mut OrganizeReport,
        budget: &mut usize,
    ) -> Result<()> {
        let mut candidates: Vec<Candidate> = self
            .mdm
            .local_blobs()
            .into_iter()
            .filter_map(|summary| {
                let score = self.score(&summary);
                let below: Vec<BufferInfo> = summary
                    .buffers
                    .iter()
                    .filter(|b| {
                        slower.iter().any(|t| t.id == b.target_id)
                            && score - scores.get(&b.target_id).copied().unwrap_or(0.0) >= MOVE_THRESHOLD
                    })
                    .copied()
                    .collect();
                (!below.is_empty()).then(|| Candidate {
                    blob: summary.id,
                    score,
                    runs: contiguous_runs(below),
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        for candidate in candidates {
            let mut blob = candidate.blob;
            for run in candidate.runs {
                if *budget == 0 || self.utilization(target)? >= min {
                    return Ok(());
                }
                match self.move_run(blob, &run, target) {
                    Ok(id) => {
                        blob = id;
                        report.promotions += 1;
                        *budget -= 1;
                    }
                    Err(e) => {
                        // the target is out of room
                        debug!("Promoting blob {} to {} stopped: {}", blob, target, e);
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}
