use std::collections::HashMap;
use std::hash::BuildHasher;
use std::net::SocketAddr;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::node::ServerId;

/// Resolves a server to the address it is reachable at.
///
/// Closures `Fn(&ServerId) -> Option<SocketAddr>` implement the trait.
pub trait AddressResolver: Send + Sync {
    /// Returns the address of `server`, or `None` if it is unknown.
    fn resolve(&self, server: &ServerId) -> Option<SocketAddr>;
}

impl<F> AddressResolver for F
where
    F: Fn(&ServerId) -> Option<SocketAddr> + Send + Sync,
{
    fn resolve(&self, server: &ServerId) -> Option<SocketAddr> {
        self(server)
    }
}

impl<S> AddressResolver for HashMap<ServerId, SocketAddr, S>
where
    S: BuildHasher + Send + Sync,
{
    fn resolve(&self, server: &ServerId) -> Option<SocketAddr> {
        self.get(server).copied()
    }
}

/// An in-memory table of endpoint addresses, keyed by endpoint id.
///
/// Tagged servers sharing an endpoint id resolve to the same address.
///
/// # Examples
///
/// ```
/// use chash_lb::{AddressResolver, ServerDirectory, ServerId};
/// let directory = ServerDirectory::new();
/// directory.insert(1, "10.0.0.1:8000".parse().unwrap());
/// assert!(directory.resolve(&ServerId::with_tag(1, "blue")).is_some());
/// assert!(directory.resolve(&ServerId::new(2)).is_none());
/// ```
#[derive(Debug, Default)]
pub struct ServerDirectory {
    addrs: RwLock<FxHashMap<u64, SocketAddr>>,
}

impl ServerDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the address of endpoint `id`, returning the previous one.
    pub fn insert(&self, id: u64, addr: SocketAddr) -> Option<SocketAddr> {
        self.addrs.write().insert(id, addr)
    }

    /// Forgets endpoint `id`.
    pub fn remove(&self, id: u64) -> Option<SocketAddr> {
        self.addrs.write().remove(&id)
    }

    /// Number of known endpoints.
    pub fn len(&self) -> usize {
        self.addrs.read().len()
    }

    /// Returns `true` if no endpoint is known.
    pub fn is_empty(&self) -> bool {
        self.addrs.read().is_empty()
    }
}

impl FromIterator<(u64, SocketAddr)> for ServerDirectory {
    fn from_iter<I: IntoIterator<Item = (u64, SocketAddr)>>(iter: I) -> Self {
        Self {
            addrs: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl AddressResolver for ServerDirectory {
    fn resolve(&self, server: &ServerId) -> Option<SocketAddr> {
        self.addrs.read().get(&server.id).copied()
    }
}
