//! Data placement engine
//!
//! Dispatches a batch of blob sizes to one of the placement policies and,
//! through [`DataPlacementEngine::calculate_placement`], widens the set of
//! candidate nodes until some scope can hold the whole batch.

use crate::minimize_io_time::minimize_io_time_placement;
use crate::random::random_placement;
use crate::round_robin::round_robin_placement;
use crate::topology::{TargetSource, Topology, TopologyScope};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tierio_common::config::DpeConfig;
use tierio_common::{Error, PlacementContext, PlacementPolicy, PlacementSchema, Result, TargetInfo};
use tracing::debug;

/// Policy-driven placement of blob bytes onto targets
pub struct DataPlacementEngine {
    rng: Mutex<StdRng>,
    rr_cursor: Mutex<usize>,
    default_ctx: PlacementContext,
}

impl DataPlacementEngine {
    /// Create an engine with the configured defaults
    #[must_use]
    pub fn new(config: &DpeConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
            rr_cursor: Mutex::new(0),
            default_ctx: config.context(),
        }
    }

    /// Context used when a caller does not supply one
    #[must_use]
    pub const fn default_context(&self) -> &PlacementContext {
        &self.default_ctx
    }

    /// One schema per blob over a fixed target set
    ///
    /// Empty blobs get empty schemas. Entries naming the same target are
    /// merged before returning.
    pub fn placement(
        &self,
        blob_sizes: &[u64],
        targets: &[TargetInfo],
        ctx: &PlacementContext,
    ) -> Result<Vec<PlacementSchema>> {
        let sized: Vec<u64> = blob_sizes.iter().copied().filter(|&s| s > 0).collect();

        let placed = if sized.is_empty() {
            Vec::new()
        } else {
            match ctx.policy {
                PlacementPolicy::Random => {
                    let mut rng = self.rng.lock();
                    random_placement(&sized, targets, &mut *rng)?
                }
                PlacementPolicy::RoundRobin => {
                    let mut cursor = self.rr_cursor.lock();
                    round_robin_placement(&sized, targets, ctx.rr_split, &mut cursor)?
                }
                PlacementPolicy::MinimizeIoTime => {
                    minimize_io_time_placement(&sized, targets, &ctx.minimize_io_time)?
                }
            }
        };

        let mut placed = placed.into_iter();
        let mut schemas = Vec::with_capacity(blob_sizes.len());
        for &size in blob_sizes {
            let mut schema = if size > 0 {
                placed
                    .next()
                    .ok_or_else(|| Error::internal("policy returned too few schemas"))?
            } else {
                PlacementSchema::new()
            };
            schema.aggregate();
            schemas.push(schema);
        }
        Ok(schemas)
    }

    /// Place a batch, widening from this node to its neighbours to all nodes
    ///
    /// A placement failure in one scope moves on to the next; any other error
    /// (such as an unreachable node) is returned as is.
    pub fn calculate_placement(
        &self,
        blob_sizes: &[u64],
        ctx: &PlacementContext,
        topology: &Topology,
        source: &dyn TargetSource,
    ) -> Result<Vec<PlacementSchema>> {
        for scope in topology.escalation() {
            let targets = Self::gather(scope, topology, source)?;
            match self.placement(blob_sizes, &targets, ctx) {
                Ok(schemas) => {
                    debug!(
                        "Placed {} blobs with {} over {} targets ({:?})",
                        blob_sizes.len(),
                        ctx.policy,
                        targets.len(),
                        scope
                    );
                    return Ok(schemas);
                }
                Err(e) if e.is_placement_failure() => {
                    debug!("Placement failed in scope {:?}: {}", scope, e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::PlacementSchemaEmpty {
            blob_size: blob_sizes.iter().sum(),
        })
    }

    fn gather(
        scope: TopologyScope,
        topology: &Topology,
        source: &dyn TargetSource,
    ) -> Result<Vec<TargetInfo>> {
        let mut targets = Vec::new();
        for node in topology.nodes(scope) {
            targets.extend(source.target_infos(node)?);
        }
        Ok(targets)
    }
}
