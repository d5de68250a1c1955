//! tierio Core - one buffering node and its client API
//!
//! [`TierNode`] owns the buffer pool, metadata manager, placement engine and
//! buffer organizer of a node. Applications open [`Bucket`]s and
//! [`VBucket`]s on it and put and get named blobs; nodes reach each other
//! through a [`tierio_common::Transport`].

pub mod bucket;
pub mod node;
pub mod transport;

pub use bucket::{Bucket, PutOptions, PutStatus, VBucket};
pub use node::TierNode;
pub use transport::LoopbackTransport;

#[cfg(test)]
pub(crate) mod fixtures {
    use tierio_common::config::{BorgConfig, DeviceConfig, DeviceKind, DpeConfig, NodeConfig, SwapConfig};
    use tierio_common::{Config, MIB};

    /// A node config with RAM swap and the organizer in the foreground
    pub fn config(node_id: u32, num_nodes: u32, devices: Vec<DeviceConfig>) -> Config {
        Config {
            node: NodeConfig {
                node_id,
                num_nodes,
                neighborhood_radius: 1,
            },
            devices,
            dpe: DpeConfig {
                seed: Some(7),
                ..DpeConfig::default()
            },
            borg: BorgConfig {
                background: false,
                ..BorgConfig::default()
            },
            swap: SwapConfig {
                kind: DeviceKind::Ram,
                mount_point: None,
                capacity: 4 * MIB,
            },
            ..Config::default()
        }
    }

    pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }
}
