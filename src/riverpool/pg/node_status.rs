use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use strum::Display;
use tracing::{info, warn};

use crate::riverpool::pg::node_set::NodeSet;

/// The liveness of one configured backend, as seen by every session.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[repr(u8)]
pub enum NodeStatus {
    Unused = 0,
    ConnectWait = 1,
    Up = 2,
    Down = 3,
}

impl NodeStatus {
    fn from_u8(b: u8) -> Self {
        match b {
            1 => NodeStatus::ConnectWait,
            2 => NodeStatus::Up,
            3 => NodeStatus::Down,
            _ => NodeStatus::Unused,
        }
    }
}

/// NodeStatusTable is shared by all sessions. Sessions poll it for liveness and report
/// degenerated nodes to it; nothing else crosses session boundaries.
pub struct NodeStatusTable {
    status: Vec<AtomicU8>,
    in_recovery: AtomicBool,
    close_idle_requests: AtomicU64,
}

impl NodeStatusTable {
    /// new creates a table with num_nodes nodes, all waiting for their first connection
    pub fn new(num_nodes: usize) -> Self {
        Self {
            status: (0..num_nodes).map(|_| AtomicU8::new(NodeStatus::ConnectWait as u8)).collect(),
            in_recovery: AtomicBool::new(false),
            close_idle_requests: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.status.len()
    }

    pub fn get(&self, node: usize) -> NodeStatus {
        self.status.get(node).map(|s| NodeStatus::from_u8(s.load(Acquire))).unwrap_or(NodeStatus::Unused)
    }

    pub fn set(&self, node: usize, status: NodeStatus) {
        if let Some(s) = self.status.get(node) {
            s.store(status as u8, Release);
        }
    }

    /// is_up returns true for nodes that are up or have not been tried yet
    pub fn is_up(&self, node: usize) -> bool {
        matches!(self.get(node), NodeStatus::Up | NodeStatus::ConnectWait)
    }

    pub fn up_nodes(&self) -> NodeSet {
        (0..self.len()).filter(|&i| self.is_up(i)).collect()
    }

    /// degenerate fences the given nodes: they are marked down for every session
    pub fn degenerate(&self, nodes: &[usize]) {
        for &node in nodes {
            let prev = self.get(node);
            self.set(node, NodeStatus::Down);
            warn!(node, %prev, "degenerating backend node");
        }
    }

    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Relaxed)
    }

    pub fn set_in_recovery(&self, value: bool) {
        self.in_recovery.store(value, Relaxed);
    }

    /// request_close_idle asks the service to close idle pooled connections, e.g. before DROP DATABASE
    pub fn request_close_idle(&self) {
        let n = self.close_idle_requests.fetch_add(1, Relaxed) + 1;
        info!(requests = n, "close idle connections requested");
    }

    pub fn close_idle_requests(&self) -> u64 {
        self.close_idle_requests.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degenerate() {
        let table = NodeStatusTable::new(3);
        table.set(0, NodeStatus::Up);
        assert!(table.is_up(1));
        table.degenerate(&[1]);
        assert_eq!(table.get(1), NodeStatus::Down);
        assert_eq!(table.up_nodes().iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(table.get(9), NodeStatus::Unused);
    }
}
