use std::collections::BTreeMap;
use std::iter::Chain;
use std::net::SocketAddr;
use std::slice::Iter;

use rustc_hash::FxHashSet;

use crate::node::{RingNode, ServerId};

/// Size of the hash space, `2^32`.
pub(crate) const HASH_SPACE: u64 = 1 << 32;

/// A [hash ring] for consistent hashing.
///
/// The ring is a sorted sequence of [`RingNode`]s. It is only ever mutated by the reconciliation
/// functions while it sits in the background copy of the balancer, so every instance a reader
/// sees is complete and sorted.
///
/// [hash ring]: https://en.wikipedia.org/wiki/Consistent_hashing
#[derive(Debug, Default)]
pub struct HashRing {
    nodes: Vec<RingNode>,
    servers: usize,
}

impl Clone for HashRing {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            servers: self.servers,
        }
    }

    // Reuses the allocation of the copy being overwritten.
    fn clone_from(&mut self, source: &Self) {
        self.nodes.clone_from(&source.nodes);
        self.servers = source.servers;
    }
}

/// Rings are equal when they hold the same nodes owned by the same servers.
impl PartialEq for HashRing {
    fn eq(&self, other: &Self) -> bool {
        self.same_layout(other)
    }
}

impl Eq for HashRing {}

impl HashRing {
    /// Creates an empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a ring from nodes that are already sorted and free of duplicates.
    #[cfg(test)]
    pub(crate) fn from_sorted(nodes: Vec<RingNode>) -> Self {
        debug_assert!(nodes.windows(2).all(|w| w[0] < w[1]));
        let servers = nodes
            .iter()
            .map(RingNode::server)
            .collect::<FxHashSet<_>>()
            .len();
        Self { nodes, servers }
    }

    /// Number of virtual nodes on the ring.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the ring has no nodes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct servers represented on the ring.
    #[inline]
    pub fn server_count(&self) -> usize {
        self.servers
    }

    /// The nodes in ring order.
    #[inline]
    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    /// The distinct servers on the ring.
    pub fn servers(&self) -> FxHashSet<&ServerId> {
        self.nodes.iter().map(RingNode::server).collect()
    }

    /// Returns `true` if `server` has at least one node on the ring.
    pub fn contains_server(&self, server: &ServerId) -> bool {
        self.nodes.iter().any(|node| node.server() == server)
    }

    /// Index of the first node with `hash >= code`, wrapping around to `0`.
    #[inline]
    pub fn lower_bound(&self, code: u32) -> usize {
        let index = self
            .nodes
            .partition_point(|node| node.cmp_code(code).is_lt());
        if index == self.nodes.len() {
            // Nothing at or after the code, loop around to the start of the ring.
            0
        } else {
            index
        }
    }

    /// Returns the node owning `code`.
    ///
    /// # Examples
    ///
    /// ```
    /// use chash_lb::HashRing;
    /// let ring = HashRing::new();
    /// assert!(ring.get(12345).is_none());
    /// ```
    #[inline]
    pub fn get(&self, code: u32) -> Option<&RingNode> {
        self.nodes.get(self.lower_bound(code))
    }

    /// Walks the whole ring once, starting at the node owning `code`.
    pub fn walk_from(&self, code: u32) -> Chain<Iter<'_, RingNode>, Iter<'_, RingNode>> {
        let (before, after) = self.nodes.split_at(self.lower_bound(code));
        after.iter().chain(before.iter())
    }

    /// Share of the hash space owned by each address.
    ///
    /// A node owns the arc from its predecessor (exclusive) up to its own hash. The first node's
    /// predecessor is the last node, so a ring with a single node owns everything.
    pub fn loads(&self) -> BTreeMap<SocketAddr, f64> {
        let mut arcs: BTreeMap<SocketAddr, u64> = BTreeMap::new();
        let Some(last) = self.nodes.last() else {
            return BTreeMap::new();
        };
        let mut previous = u64::from(last.hash());
        for (index, node) in self.nodes.iter().enumerate() {
            let hash = u64::from(node.hash());
            let arc = if index == 0 {
                hash + HASH_SPACE - previous
            } else {
                hash - previous
            };
            *arcs.entry(node.addr()).or_default() += arc;
            previous = hash;
        }
        arcs.into_iter()
            .map(|(addr, arc)| (addr, arc as f64 / HASH_SPACE as f64))
            .collect()
    }

    /// Clears the ring, lets `fill` push the new nodes in sorted order and recounts servers.
    ///
    /// The node buffer is reused, so refilling the background copy does not allocate once it has
    /// grown to the ring's size.
    pub(crate) fn refill<F>(&mut self, fill: F)
    where
        F: FnOnce(&mut Vec<RingNode>),
    {
        self.nodes.clear();
        fill(&mut self.nodes);
        debug_assert!(self.nodes.windows(2).all(|w| w[0] < w[1]));
        let servers = self.servers().len();
        self.servers = servers;
    }

    /// Returns `true` if both rings hold the same nodes for the same servers.
    pub(crate) fn same_layout(&self, other: &HashRing) -> bool {
        self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| a == b && a.server() == b.server())
    }
}
