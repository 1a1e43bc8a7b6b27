use std::fmt;
use std::fmt::{Debug, Formatter};

/// The maximum number of configured backends
pub const MAX_BACKENDS: usize = 128;

/// NodeSet is a set of backend node ids, stored as a bitset.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct NodeSet(u128);

impl NodeSet {
    pub const fn empty() -> Self {
        NodeSet(0)
    }

    /// all returns the set {0, 1, ..., n-1}
    pub fn all(n: usize) -> Self {
        if n >= MAX_BACKENDS {
            NodeSet(u128::MAX)
        } else {
            NodeSet((1u128 << n) - 1)
        }
    }

    pub fn single(node: usize) -> Self {
        let mut set = Self::empty();
        set.insert(node);
        set
    }

    pub fn insert(&mut self, node: usize) {
        debug_assert!(node < MAX_BACKENDS);
        self.0 |= 1u128 << node;
    }

    pub fn remove(&mut self, node: usize) {
        self.0 &= !(1u128 << node);
    }

    pub fn contains(&self, node: usize) -> bool {
        node < MAX_BACKENDS && self.0 & (1u128 << node) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// first returns the lowest node id in the set
    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn intersection(&self, other: NodeSet) -> NodeSet {
        NodeSet(self.0 & other.0)
    }

    pub fn iter(&self) -> NodeSetIter {
        NodeSetIter(self.0)
    }
}

pub struct NodeSetIter(u128);

impl Iterator for NodeSetIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let node = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(node)
    }
}

impl FromIterator<usize> for NodeSet {
    fn from_iter<I: IntoIterator<Item=usize>>(iter: I) -> Self {
        let mut set = NodeSet::empty();
        for node in iter {
            set.insert(node);
        }
        set
    }
}

impl Debug for NodeSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
