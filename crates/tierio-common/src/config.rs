//! Configuration types for tierio
//!
//! The configuration surface is produced externally (file format and loader
//! are not part of the core); these structures are what the components
//! consume. Every section has defaults so partial configs deserialize.

use crate::error::{Error, Result};
use crate::types::{KIB, MIB, MinimizeIoTimeOptions, PlacementContext, PlacementPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum number of buffering devices per node (one id is reserved for swap)
pub const MAX_DEVICES: usize = 254;

/// Root configuration of one node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity and topology
    pub node: NodeConfig,
    /// Buffering devices, fastest first by convention
    pub devices: Vec<DeviceConfig>,
    /// Data placement engine defaults
    pub dpe: DpeConfig,
    /// Buffer organizer thresholds and scoring
    pub borg: BorgConfig,
    /// Swap space
    pub swap: SwapConfig,
    /// Metadata manager sizing
    pub metadata: MetadataConfig,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        if self.devices.is_empty() {
            return Err(Error::configuration("at least one device is required"));
        }
        if self.devices.len() > MAX_DEVICES {
            return Err(Error::configuration(format!(
                "{} devices configured, at most {MAX_DEVICES} supported",
                self.devices.len()
            )));
        }
        for device in &self.devices {
            device.validate()?;
        }
        self.dpe.validate()?;
        self.borg.validate()?;
        self.swap.validate()?;
        self.metadata.validate()
    }
}

/// Node identity within the deployment
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id (1-based)
    pub node_id: u32,
    /// Number of nodes in the deployment
    pub num_nodes: u32,
    /// Number of ring-adjacent nodes on each side forming the neighborhood
    pub neighborhood_radius: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            num_nodes: 1,
            neighborhood_radius: 1,
        }
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(Error::configuration("num_nodes must be at least 1"));
        }
        if self.node_id == 0 || self.node_id > self.num_nodes {
            return Err(Error::configuration(format!(
                "node_id {} outside 1..={}",
                self.node_id, self.num_nodes
            )));
        }
        Ok(())
    }
}

/// Kind of storage behind a device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Byte-addressable memory
    #[default]
    Ram,
    /// File on a mounted file system (NVMe, burst buffer, PFS)
    File,
}

/// One slab class of a device
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlabConfig {
    /// Buffer size of this class, in device blocks
    pub unit_size: u32,
    /// Desired share of the device capacity
    pub share: f64,
}

impl SlabConfig {
    #[must_use]
    pub const fn new(unit_size: u32, share: f64) -> Self {
        Self { unit_size, share }
    }
}

fn default_slabs() -> Vec<SlabConfig> {
    vec![
        SlabConfig::new(1, 0.25),
        SlabConfig::new(4, 0.25),
        SlabConfig::new(16, 0.25),
        SlabConfig::new(32, 0.25),
    ]
}

/// Configuration of one buffering device
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Human-readable name
    pub name: String,
    /// Storage kind
    pub kind: DeviceKind,
    /// Directory holding the backing file (file devices only)
    pub mount_point: Option<PathBuf>,
    /// Buffering capacity in bytes
    pub capacity: u64,
    /// Block size in bytes
    pub block_size: u64,
    /// Slab classes, ascending by unit size
    pub slabs: Vec<SlabConfig>,
    /// Bandwidth in MiB/s
    pub bandwidth_mbps: f64,
    /// Latency in microseconds
    pub latency_us: f64,
    /// Per-device BORG `[min, max]` utilization thresholds
    pub borg_capacity_thresh: Option<[f64; 2]>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "ram".to_string(),
            kind: DeviceKind::Ram,
            mount_point: None,
            capacity: 64 * MIB,
            block_size: 4 * KIB,
            slabs: default_slabs(),
            bandwidth_mbps: 6000.0,
            latency_us: 15.0,
            borg_capacity_thresh: None,
        }
    }
}

impl DeviceConfig {
    /// A RAM device with default slab classes
    #[must_use]
    pub fn ram(name: impl Into<String>, capacity: u64, block_size: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            block_size,
            ..Self::default()
        }
    }

    /// A file-backed device with default slab classes
    #[must_use]
    pub fn file(name: impl Into<String>, mount_point: impl Into<PathBuf>, capacity: u64, block_size: u64) -> Self {
        Self {
            name: name.into(),
            kind: DeviceKind::File,
            mount_point: Some(mount_point.into()),
            capacity,
            block_size,
            bandwidth_mbps: 1000.0,
            latency_us: 100.0,
            ..Self::default()
        }
    }

    /// Set bandwidth and latency
    #[must_use]
    pub fn with_performance(mut self, bandwidth_mbps: f64, latency_us: f64) -> Self {
        self.bandwidth_mbps = bandwidth_mbps;
        self.latency_us = latency_us;
        self
    }

    /// Replace the slab classes
    #[must_use]
    pub fn with_slabs(mut self, slabs: Vec<SlabConfig>) -> Self {
        self.slabs = slabs;
        self
    }

    fn validate(&self) -> Result<()> {
        let name = &self.name;
        if self.block_size == 0 {
            return Err(Error::configuration(format!("device {name}: block_size must be non-zero")));
        }
        if self.capacity < self.block_size {
            return Err(Error::configuration(format!(
                "device {name}: capacity {} smaller than one block",
                self.capacity
            )));
        }
        if self.bandwidth_mbps <= 0.0 {
            return Err(Error::configuration(format!("device {name}: bandwidth must be positive")));
        }
        if self.kind == DeviceKind::File && self.mount_point.is_none() {
            return Err(Error::configuration(format!("device {name}: file devices need a mount_point")));
        }
        if self.slabs.is_empty() {
            return Err(Error::configuration(format!("device {name}: at least one slab class is required")));
        }

        let mut total_share = 0.0;
        for (i, slab) in self.slabs.iter().enumerate() {
            if slab.unit_size == 0 {
                return Err(Error::configuration(format!("device {name}: slab {i} has zero unit size")));
            }
            if !(0.0..=1.0).contains(&slab.share) {
                return Err(Error::configuration(format!(
                    "device {name}: slab {i} share {} outside [0, 1]",
                    slab.share
                )));
            }
            if let Some(next) = self.slabs.get(i + 1)
                && (next.unit_size <= slab.unit_size || next.unit_size % slab.unit_size != 0)
            {
                return Err(Error::configuration(format!(
                    "device {name}: slab unit sizes must ascend and divide each other ({} -> {})",
                    slab.unit_size, next.unit_size
                )));
            }
            total_share += slab.share;
        }
        if total_share > 1.0 + 1e-9 {
            return Err(Error::configuration(format!(
                "device {name}: slab shares sum to {total_share}, more than 1"
            )));
        }

        if let Some([min, max]) = self.borg_capacity_thresh {
            validate_thresholds(min, max)?;
        }
        Ok(())
    }
}

fn validate_thresholds(min: f64, max: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max {
        return Err(Error::configuration(format!(
            "capacity thresholds [{min}, {max}] must satisfy 0 <= min <= max <= 1"
        )));
    }
    Ok(())
}

/// Data placement engine defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DpeConfig {
    /// Policy used when a call does not override it
    pub default_policy: PlacementPolicy,
    /// Split blobs across targets under RoundRobin
    pub rr_split: bool,
    /// MinimizeIoTime tunables
    pub minimize_io_time: MinimizeIoTimeOptions,
    /// Seed for the Random policy (entropy when unset)
    pub seed: Option<u64>,
}

impl Default for DpeConfig {
    fn default() -> Self {
        Self {
            default_policy: PlacementPolicy::MinimizeIoTime,
            rr_split: false,
            minimize_io_time: MinimizeIoTimeOptions::default(),
            seed: None,
        }
    }
}

impl DpeConfig {
    /// Placement context built from the defaults
    #[must_use]
    pub fn context(&self) -> PlacementContext {
        PlacementContext {
            policy: self.default_policy,
            rr_split: self.rr_split,
            minimize_io_time: self.minimize_io_time,
        }
    }

    fn validate(&self) -> Result<()> {
        let opts = &self.minimize_io_time;
        if !(0.0..=1.0).contains(&opts.minimum_remaining_capacity) {
            return Err(Error::configuration("minimum_remaining_capacity must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&opts.capacity_change_threshold) {
            return Err(Error::configuration("capacity_change_threshold must be in [0, 1]"));
        }
        if opts.placement_ratio <= 0.0 {
            return Err(Error::configuration("placement_ratio must be positive"));
        }
        Ok(())
    }
}

/// Buffer organizer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BorgConfig {
    /// Utilization under which a target pulls hot blobs up
    pub min_capacity_threshold: f64,
    /// Utilization over which a target pushes cold blobs down
    pub max_capacity_threshold: f64,
    /// Access count mapped to a frequency score of 0
    pub freq_min: f64,
    /// Access count mapped to a frequency score of 1
    pub freq_max: f64,
    /// Idle seconds still mapped to a recency score of 1
    pub recency_min_secs: f64,
    /// Idle seconds mapped to a recency score of 0
    pub recency_max_secs: f64,
    /// Run the organizer on a background thread
    pub background: bool,
    /// Upper bound on buffer moves per organize pass
    pub max_moves_per_pass: usize,
}

impl Default for BorgConfig {
    fn default() -> Self {
        Self {
            min_capacity_threshold: 0.0,
            max_capacity_threshold: 1.0,
            freq_min: 0.0,
            freq_max: 16.0,
            recency_min_secs: 0.0,
            recency_max_secs: 60.0,
            background: true,
            max_moves_per_pass: 256,
        }
    }
}

impl BorgConfig {
    /// Thresholds for a device, honoring its override
    #[must_use]
    pub fn thresholds_for(&self, device: &DeviceConfig) -> (f64, f64) {
        match device.borg_capacity_thresh {
            Some([min, max]) => (min, max),
            None => (self.min_capacity_threshold, self.max_capacity_threshold),
        }
    }

    fn validate(&self) -> Result<()> {
        validate_thresholds(self.min_capacity_threshold, self.max_capacity_threshold)?;
        if self.freq_max <= self.freq_min {
            return Err(Error::configuration("freq_max must exceed freq_min"));
        }
        if self.recency_max_secs <= self.recency_min_secs {
            return Err(Error::configuration("recency_max_secs must exceed recency_min_secs"));
        }
        Ok(())
    }
}

/// Swap space configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapConfig {
    /// Storage kind of the swap device
    pub kind: DeviceKind,
    /// Directory holding the swap file
    pub mount_point: Option<PathBuf>,
    /// Swap capacity in bytes
    pub capacity: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::File,
            mount_point: Some(PathBuf::from("./tierio-swap")),
            capacity: 1024 * MIB,
        }
    }
}

impl SwapConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::configuration("swap capacity must be non-zero"));
        }
        if self.kind == DeviceKind::File && self.mount_point.is_none() {
            return Err(Error::configuration("file-backed swap needs a mount_point"));
        }
        Ok(())
    }
}

/// Metadata manager sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Bytes reserved for the buffer-list heap
    pub heap_size: u64,
    /// Seed of the name hash used for owner routing
    pub hash_seed: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            heap_size: 16 * MIB,
            hash_seed: 0,
        }
    }
}

impl MetadataConfig {
    fn validate(&self) -> Result<()> {
        if self.heap_size < 4 * KIB {
            return Err(Error::configuration("metadata heap_size must be at least 4 KiB"));
        }
        if self.heap_size > u64::from(u32::MAX) {
            return Err(Error::configuration("metadata heap_size must fit in 32-bit offsets"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            devices: vec![DeviceConfig::ram("ram", 64 * KIB, 4 * KIB)],
            swap: SwapConfig {
                kind: DeviceKind::Ram,
                mount_point: None,
                capacity: MIB,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_default_is_valid() {
        let mut config = Config::default();
        config.devices.push(DeviceConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_node_id() {
        let mut config = valid_config();
        config.node.node_id = 3;
        config.node.num_nodes = 2;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_rejects_non_dividing_slabs() {
        let mut config = valid_config();
        config.devices[0].slabs = vec![SlabConfig::new(2, 0.5), SlabConfig::new(3, 0.5)];
        assert!(config.validate().is_err());

        config.devices[0].slabs = vec![SlabConfig::new(4, 0.5), SlabConfig::new(2, 0.5)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversubscribed_shares() {
        let mut config = valid_config();
        config.devices[0].slabs = vec![SlabConfig::new(1, 0.7), SlabConfig::new(2, 0.7)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_device_needs_mount_point() {
        let mut config = valid_config();
        config.devices[0].kind = DeviceKind::File;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_override() {
        let borg = BorgConfig::default();
        let mut device = DeviceConfig::default();
        assert_eq!(borg.thresholds_for(&device), (0.0, 1.0));

        device.borg_capacity_thresh = Some([0.2, 0.8]);
        assert_eq!(borg.thresholds_for(&device), (0.2, 0.8));

        device.borg_capacity_thresh = Some([0.9, 0.1]);
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_partial_config_deserializes() {
        let json = r#"{ "node": { "node_id": 2, "num_nodes": 4 }, "dpe": { "default_policy": "Random" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.node.node_id, 2);
        assert_eq!(config.node.neighborhood_radius, 1);
        assert_eq!(config.dpe.default_policy, PlacementPolicy::Random);
        assert_eq!(config.dpe.context().policy, PlacementPolicy::Random);
    }
}
