//! tierio placement - data placement engine
//!
//! Turns a batch of blob sizes and a snapshot of target capacities into one
//! [`PlacementSchema`](tierio_common::PlacementSchema) per blob.
//!
//! # Policies
//!
//! - **Random**: uniform choice among targets with room, with random splits
//!   of larger blobs
//! - **RoundRobin**: a shared cursor over the target list, optionally
//!   splitting each blob across successive targets
//! - **MinimizeIoTime**: a linear program over the whole batch, solved by the
//!   in-crate simplex
//!
//! [`DataPlacementEngine::calculate_placement`] retries a failed batch over
//! a wider [`TopologyScope`] before giving up.

pub mod minimize_io_time;
pub mod policy;
pub mod random;
pub mod round_robin;
pub mod simplex;
pub mod topology;

pub use minimize_io_time::minimize_io_time_placement;
pub use policy::DataPlacementEngine;
pub use random::random_placement;
pub use round_robin::round_robin_placement;
pub use simplex::{LinearProgram, LpError, Relation};
pub use topology::{TargetSource, Topology, TopologyScope};
