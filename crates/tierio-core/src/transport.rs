//! In-process transport
//!
//! Delivers each request to a [`TierNode`] living in the same process after
//! a bincode round-trip of request and response, so every message that
//! crosses it is one a real transport could carry. Errors raised by the
//! serving node come back unchanged.

use crate::node::TierNode;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tierio_common::{Config, Error, NodeId, Request, Response, Result, Transport};
use tracing::trace;

#[derive(Default)]
pub struct LoopbackTransport {
    nodes: RwLock<HashMap<NodeId, Weak<TierNode>>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `node` reachable
    pub fn register(&self, node: &Arc<TierNode>) {
        self.nodes.write().insert(node.node_id(), Arc::downgrade(node));
    }

    /// Build one node per config, all connected through a shared transport
    pub fn cluster(configs: Vec<Config>) -> Result<(Arc<Self>, Vec<Arc<TierNode>>)> {
        let transport = Arc::new(Self::new());
        let mut nodes = Vec::with_capacity(configs.len());
        for config in configs {
            let shared: Arc<dyn Transport> = transport.clone();
            let node = Arc::new(TierNode::new(config, shared)?);
            transport.register(&node);
            nodes.push(node);
        }
        Ok((transport, nodes))
    }
}

impl Transport for LoopbackTransport {
    fn call(&self, node: NodeId, request: Request) -> Result<Response> {
        let proc_name = request.proc_name();
        let target = self
            .nodes
            .read()
            .get(&node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::rpc(node, proc_name, "node not reachable"))?;

        trace!("{} -> node {}", proc_name, node);
        let request = Request::decode(&request.encode()?)?;
        let response = target.handle(request)?;
        Response::decode(&response.encode()?)
    }
}
