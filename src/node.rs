use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Identity of a backend server.
///
/// `id` names the endpoint (typically a socket id). The optional `tag` lets the same endpoint
/// appear several times as distinct logical servers, each with its own ring positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId {
    /// Endpoint identifier.
    pub id: u64,
    /// Optional tag distinguishing logical servers sharing one endpoint.
    pub tag: Option<Arc<str>>,
}

impl ServerId {
    /// Creates an untagged server id.
    ///
    /// # Examples
    ///
    /// ```
    /// use chash_lb::ServerId;
    /// let server = ServerId::new(7);
    /// assert_eq!(server.to_string(), "7");
    /// ```
    pub fn new(id: u64) -> Self {
        Self { id, tag: None }
    }

    /// Creates a tagged server id.
    ///
    /// # Examples
    ///
    /// ```
    /// use chash_lb::ServerId;
    /// let server = ServerId::with_tag(7, "canary");
    /// assert_eq!(server.to_string(), "7(canary)");
    /// ```
    pub fn with_tag(id: u64, tag: &str) -> Self {
        Self {
            id,
            tag: Some(Arc::from(tag)),
        }
    }
}

impl From<u64> for ServerId {
    fn from(id: u64) -> Self {
        ServerId::new(id)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}({})", self.id, tag),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A virtual node on the ring.
///
/// Nodes are ordered by `hash` and then by `addr`, so independent clients that see the same
/// servers lay out identical rings. Equality follows the same key: two nodes are equal when they
/// sit at the same position for the same address, whichever server they belong to.
///
/// Servers sharing an address can therefore claim the same position. Within one batch the
/// smallest [`ServerId`] gets it. A position already on the ring stays with its owner, so after
/// adds and removes in different orders two clients may disagree on who owns such a position.
#[derive(Debug, Clone)]
pub struct RingNode {
    hash: u32,
    server: ServerId,
    addr: SocketAddr,
}

impl RingNode {
    /// Creates a node for `server`, reachable at `addr`, placed at `hash`.
    pub fn new(hash: u32, server: ServerId, addr: SocketAddr) -> Self {
        Self { hash, server, addr }
    }

    /// Position on the ring.
    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// The server this node represents.
    #[inline]
    pub fn server(&self) -> &ServerId {
        &self.server
    }

    /// Network address of the server, used to break ties.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Orders this node against a bare hash code.
    ///
    /// Only `hash` takes part and a node is never considered equal to a code it matches, so a
    /// partition on `Ordering::Less` finds the first node with `hash >= code`.
    #[inline]
    pub fn cmp_code(&self, code: u32) -> Ordering {
        if self.hash < code {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }
}

/// Sorts `nodes` into ring order and drops repeated positions, keeping the node of the smallest
/// server at each one.
pub(crate) fn sort_positions(nodes: &mut Vec<RingNode>) {
    nodes.sort_unstable_by(|a, b| a.cmp(b).then_with(|| a.server.cmp(&b.server)));
    nodes.dedup();
}

impl PartialEq for RingNode {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.addr == other.addr
    }
}

impl Eq for RingNode {}

impl PartialOrd for RingNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RingNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.addr.cmp(&other.addr))
    }
}
