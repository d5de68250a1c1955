//! Node topology and placement scopes

use serde::{Deserialize, Serialize};
use tierio_common::config::NodeConfig;
use tierio_common::{NodeId, Result, TargetInfo};

/// How far placement may reach for targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopologyScope {
    /// This node only
    Local,
    /// This node and its ring neighbours
    Neighborhood,
    /// Every node
    Global,
}

/// Source of target snapshots, local or remote
pub trait TargetSource {
    /// Targets currently registered on `node`
    fn target_infos(&self, node: NodeId) -> Result<Vec<TargetInfo>>;
}

/// Ring of nodes `1..=num_nodes` seen from one node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    node_id: NodeId,
    num_nodes: u32,
    radius: u32,
}

impl Topology {
    #[must_use]
    pub fn new(node_id: NodeId, num_nodes: u32, radius: u32) -> Self {
        Self {
            node_id,
            num_nodes: num_nodes.max(1),
            radius,
        }
    }

    #[must_use]
    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(NodeId::new(config.node_id), config.num_nodes, config.neighborhood_radius)
    }

    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    #[must_use]
    pub const fn num_nodes(&self) -> u32 {
        self.num_nodes
    }

    /// Node `distance` steps around the ring (negative goes backwards)
    fn ring(&self, distance: i64) -> NodeId {
        let n = i64::from(self.num_nodes);
        let zero_based = i64::from(self.node_id.get()) - 1;
        NodeId::new((zero_based + distance).rem_euclid(n) as u32 + 1)
    }

    /// Nodes in `scope`, nearest first
    #[must_use]
    pub fn nodes(&self, scope: TopologyScope) -> Vec<NodeId> {
        let mut nodes = vec![self.node_id];
        let mut add = |node: NodeId| {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        };
        match scope {
            TopologyScope::Local => {}
            TopologyScope::Neighborhood => {
                for d in 1..=i64::from(self.radius) {
                    add(self.ring(d));
                    add(self.ring(-d));
                }
            }
            TopologyScope::Global => {
                for d in 1..i64::from(self.num_nodes) {
                    add(self.ring(d));
                }
            }
        }
        nodes
    }

    /// Scopes to try in order, skipping any that adds no node
    #[must_use]
    pub fn escalation(&self) -> Vec<TopologyScope> {
        let mut scopes = vec![TopologyScope::Local];
        let mut reach = 1;
        for scope in [TopologyScope::Neighborhood, TopologyScope::Global] {
            let count = self.nodes(scope).len();
            if count > reach {
                scopes.push(scope);
                reach = count;
            }
        }
        scopes
    }
}
