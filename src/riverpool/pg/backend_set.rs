use std::sync::Arc;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::riverpool::pg::node_set::{NodeSet, MAX_BACKENDS};
use crate::riverpool::pg::node_status::NodeStatusTable;
use crate::riverpool::pg::stream::PoolStream;

/// Routing says whether a statement goes to every node or to the one node chosen for load balancing.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Routing {
    Replicate,
    LoadBalance(usize),
}

impl Default for Routing {
    fn default() -> Self {
        Routing::Replicate
    }
}

/// BackendSet holds one optional connection per configured backend node.
pub struct BackendSet {
    slots: Vec<Option<PoolStream>>,
    weights: Vec<f64>,
    status: Arc<NodeStatusTable>,
}

impl BackendSet {
    pub fn new(status: Arc<NodeStatusTable>, weights: Vec<f64>) -> Self {
        let n = weights.len().min(MAX_BACKENDS);
        Self {
            slots: (0..n).map(|_| None).collect(),
            weights,
            status,
        }
    }

    /// num_backends is the number of configured backends, connected or not
    pub fn num_backends(&self) -> usize {
        self.slots.len()
    }

    pub fn status(&self) -> &Arc<NodeStatusTable> {
        &self.status
    }

    pub fn set_backend(&mut self, node: usize, stream: PoolStream) {
        if let Some(slot) = self.slots.get_mut(node) {
            *slot = Some(stream);
        }
    }

    pub fn get(&self, node: usize) -> Option<&PoolStream> {
        self.slots.get(node).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, node: usize) -> Option<&mut PoolStream> {
        self.slots.get_mut(node).and_then(Option::as_mut)
    }

    /// is_valid returns true if node can receive statements under the given routing:
    /// it has a connection, it is up, and it is the load balance target if there is one.
    pub fn is_valid(&self, node: usize, routing: Routing) -> bool {
        let connected = matches!(self.slots.get(node), Some(Some(_)));
        connected && self.status.is_up(node) && match routing {
            Routing::Replicate => true,
            Routing::LoadBalance(selected) => node == selected,
        }
    }

    /// valid_nodes returns every node for which is_valid is true
    pub fn valid_nodes(&self, routing: Routing) -> NodeSet {
        (0..self.num_backends()).filter(|&i| self.is_valid(i, routing)).collect()
    }

    /// connected_nodes returns the nodes that still have a connection, regardless of status
    pub fn connected_nodes(&self) -> NodeSet {
        (0..self.num_backends()).filter(|&i| self.get(i).is_some()).collect()
    }

    /// reference_node_id returns the node whose answers are authoritative. It is recomputed on
    /// every call, so it moves on as soon as the previous reference node becomes invalid.
    pub fn reference_node_id(&self, routing: Routing) -> Option<usize> {
        if let Routing::LoadBalance(selected) = routing {
            if self.is_valid(selected, routing) {
                return Some(selected);
            }
        }
        self.valid_nodes(Routing::Replicate).first()
    }

    /// select_target_for_load_balance picks a node at random, weighted by the configured
    /// weights, among the nodes that are up and connected. The same seed gives the same choices.
    pub fn select_target_for_load_balance(&self, rng: &mut StdRng) -> Option<usize> {
        let candidates: Vec<(usize, f64)> = self.valid_nodes(Routing::Replicate).iter()
            .map(|i| (i, self.weights.get(i).copied().unwrap_or(0.0)))
            .filter(|(_, w)| *w > 0.0)
            .collect();
        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        if candidates.is_empty() || total <= 0.0 {
            return self.reference_node_id(Routing::Replicate);
        }
        let r = rng.gen_range(0.0..total);
        let mut acc = 0.0;
        let mut selected = candidates[candidates.len() - 1].0;
        for (node, weight) in &candidates {
            acc += weight;
            if r < acc {
                selected = *node;
                break;
            }
        }
        debug!(node = selected, "selected load balance node");
        Some(selected)
    }

    /// iter_mut yields every connected node with its stream
    pub fn iter_mut(&mut self) -> impl Iterator<Item=(usize, &mut PoolStream)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
    }
}
