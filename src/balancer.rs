use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::hash::BuildHasher;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::config::{BalancerConfig, Parameters};
use crate::doubly_buffered::{DoublyBuffered, ReadGuard};
use crate::error::{BalancerError, Result};
use crate::hashring::HashRing;
use crate::node::{sort_positions, RingNode, ServerId};
use crate::reconcile::{self, Replicas};
use crate::replicas::ReplicaBuilder;
use crate::resolver::AddressResolver;

/// The surface an RPC channel drives a load balancer through.
pub trait LoadBalancer: Send + Sync {
    /// Adds a server. Returns `false` if it was already present or could not be placed.
    fn add_server(&self, server: &ServerId) -> bool;

    /// Removes a server. Returns `false` if it was not present.
    fn remove_server(&self, server: &ServerId) -> bool;

    /// Adds every server not yet present.
    fn add_servers_in_batch(&self, servers: &[ServerId]) -> BatchOutcome;

    /// Removes every listed server that is present.
    fn remove_servers_in_batch(&self, servers: &[ServerId]) -> BatchOutcome;

    /// Picks a server for one request.
    fn select_server(&self, input: &SelectIn<'_>) -> Result<ServerId>;

    /// Writes a human readable summary.
    fn describe(&self, out: &mut dyn fmt::Write, options: DescribeOptions) -> fmt::Result;
}

/// Result of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Servers actually added or removed.
    pub changed: usize,
    /// Servers that could not be processed, with the reason.
    pub failures: Vec<(ServerId, BalancerError)>,
}

/// A set of servers a selection must not pick.
///
/// Implemented for `HashSet<ServerId, S>` with any hasher, including `FxHashSet`, and for
/// `BTreeSet<ServerId>`.
pub trait ExcludedServers: Sync {
    /// Returns `true` if `server` must be skipped.
    fn contains(&self, server: &ServerId) -> bool;
}

impl<S> ExcludedServers for HashSet<ServerId, S>
where
    S: BuildHasher + Sync,
{
    fn contains(&self, server: &ServerId) -> bool {
        HashSet::contains(self, server)
    }
}

impl ExcludedServers for BTreeSet<ServerId> {
    fn contains(&self, server: &ServerId) -> bool {
        BTreeSet::contains(self, server)
    }
}

/// Inputs of one server selection.
///
/// # Examples
///
/// ```
/// use std::collections::HashSet;
/// use chash_lb::{SelectIn, ServerId};
/// let excluded: HashSet<ServerId> = [ServerId::new(1)].into_iter().collect();
/// let input = SelectIn::with_code(42).excluding(&excluded);
/// assert_eq!(input.request_code, Some(42));
/// ```
#[derive(Default, Clone, Copy)]
pub struct SelectIn<'a> {
    /// Routing code of the request. A random code is drawn when absent.
    pub request_code: Option<u32>,
    /// Servers that must not be picked, e.g. the ones already tried by this request.
    pub excluded: Option<&'a dyn ExcludedServers>,
    /// Availability check for candidate servers.
    pub is_available: Option<&'a (dyn Fn(&ServerId) -> bool + Sync)>,
}

impl<'a> SelectIn<'a> {
    /// Selects by the given routing code.
    pub fn with_code(code: u32) -> Self {
        Self {
            request_code: Some(code),
            ..Self::default()
        }
    }

    /// Never picks a server in `excluded`.
    pub fn excluding(mut self, excluded: &'a dyn ExcludedServers) -> Self {
        self.excluded = Some(excluded);
        self
    }

    /// Only picks servers for which `is_available` returns `true`.
    pub fn available_if(mut self, is_available: &'a (dyn Fn(&ServerId) -> bool + Sync)) -> Self {
        self.is_available = Some(is_available);
        self
    }

    fn rejects(&self, server: &ServerId) -> bool {
        self.excluded.map_or(false, |excluded| excluded.contains(server))
            || self.is_available.map_or(false, |is_available| !is_available(server))
    }
}

impl fmt::Debug for SelectIn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectIn")
            .field("request_code", &self.request_code)
            .field("excluded", &self.excluded.map(|_| "ExcludedServers"))
            .field("is_available", &self.is_available.map(|_| "Fn"))
            .finish()
    }
}

/// What [`LoadBalancer::describe`] prints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescribeOptions {
    /// Print settings and per-address load instead of the bare policy name.
    pub verbose: bool,
}

#[derive(Clone)]
struct Settings {
    config: BalancerConfig,
    builder: Arc<dyn ReplicaBuilder>,
    custom_builder: bool,
}

impl Settings {
    fn from_config(config: BalancerConfig) -> Self {
        Self {
            config,
            builder: Arc::new(config.hash_algorithm),
            custom_builder: false,
        }
    }

    /// Settings after `parameters`. A given hash algorithm replaces any custom builder.
    fn apply(&self, parameters: &Parameters) -> Settings {
        let config = self.config.apply(parameters);
        match parameters.hash_algorithm {
            Some(algorithm) if self.custom_builder || algorithm != self.config.hash_algorithm => {
                Settings::from_config(config)
            }
            _ => Settings {
                config,
                ..self.clone()
            },
        }
    }

    fn differs_from(&self, other: &Settings) -> bool {
        self.config != other.config || !Arc::ptr_eq(&self.builder, &other.builder)
    }
}

/// A load balancer placing servers on a consistent hash ring.
///
/// Selection reads the ring without taking locks. Adds and removes rebuild the background copy of
/// the ring and publish it atomically, so a selection sees either the whole of a batch or none of
/// it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use chash_lb::{ConsistentHashingLoadBalancer, SelectIn, ServerDirectory, ServerId};
///
/// let directory = Arc::new(ServerDirectory::new());
/// directory.insert(1, "10.0.0.1:8000".parse().unwrap());
/// directory.insert(2, "10.0.0.2:8000".parse().unwrap());
///
/// let balancer = ConsistentHashingLoadBalancer::new(directory);
/// assert!(balancer.add_server(&ServerId::new(1)));
/// assert!(balancer.add_server(&ServerId::new(2)));
///
/// let picked = balancer.select_server(&SelectIn::with_code(12345)).unwrap();
/// assert_eq!(balancer.select_server(&SelectIn::with_code(12345)).unwrap(), picked);
/// ```
pub struct ConsistentHashingLoadBalancer {
    settings: RwLock<Settings>,
    resolver: Arc<dyn AddressResolver>,
    ring: DoublyBuffered<HashRing>,
}

impl fmt::Debug for ConsistentHashingLoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settings = self.settings.read();
        let ring = self.ring.read();
        f.debug_struct("ConsistentHashingLoadBalancer")
            .field("replicas", &settings.config.replicas)
            .field("hash", &settings.builder.name())
            .field("servers", &ring.server_count())
            .field("nodes", &ring.len())
            .finish()
    }
}

impl ConsistentHashingLoadBalancer {
    /// Creates an empty balancer with the default configuration.
    pub fn new(resolver: Arc<dyn AddressResolver>) -> Self {
        Self::from_settings(resolver, Settings::from_config(BalancerConfig::default()))
    }

    /// Creates an empty balancer with `config`.
    pub fn with_config(resolver: Arc<dyn AddressResolver>, config: BalancerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_settings(resolver, Settings::from_config(config)))
    }

    /// Creates an empty balancer placing `replicas` virtual nodes per server with `builder`.
    pub fn with_replica_builder(
        resolver: Arc<dyn AddressResolver>,
        builder: Arc<dyn ReplicaBuilder>,
        replicas: usize,
    ) -> Result<Self> {
        let config = BalancerConfig {
            replicas,
            ..BalancerConfig::default()
        };
        config.validate()?;
        Ok(Self::from_settings(
            resolver,
            Settings {
                config,
                builder,
                custom_builder: true,
            },
        ))
    }

    fn from_settings(resolver: Arc<dyn AddressResolver>, settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            resolver,
            ring: DoublyBuffered::default(),
        }
    }

    /// Creates an empty balancer sharing this one's settings and resolver.
    pub fn new_instance(&self) -> Self {
        Self::from_settings(Arc::clone(&self.resolver), self.settings.read().clone())
    }

    /// The current configuration.
    pub fn config(&self) -> BalancerConfig {
        self.settings.read().config
    }

    /// Borrows the current ring. Keep the guard short lived: writers wait for it.
    pub fn snapshot(&self) -> ReadGuard<HashRing> {
        self.ring.read()
    }

    /// Number of servers on the ring.
    pub fn server_count(&self) -> usize {
        self.ring.read().server_count()
    }

    /// Number of virtual nodes on the ring.
    pub fn node_count(&self) -> usize {
        self.ring.read().len()
    }

    /// Share of the hash space owned by each server address. Fractions sum to one.
    pub fn loads(&self) -> BTreeMap<SocketAddr, f64> {
        self.ring.read().loads()
    }

    fn build_replicas(&self, settings: &Settings, server: &ServerId) -> Result<Replicas> {
        let addr = self
            .resolver
            .resolve(server)
            .ok_or_else(|| BalancerError::replica_build_failed(server, "address not found"))?;
        let mut nodes = settings
            .builder
            .build(server, addr, settings.config.replicas)?;
        sort_positions(&mut nodes);
        Ok(Replicas {
            server: server.clone(),
            nodes,
        })
    }

    /// Adds `server` to the ring.
    ///
    /// Returns `false` if the server is already present, its replicas could not be built or every
    /// one of its positions is held by another server at the same address.
    pub fn add_server(&self, server: &ServerId) -> bool {
        let settings = self.settings.read();
        let replicas = match self.build_replicas(&settings, server) {
            Ok(replicas) => replicas,
            Err(err) => {
                warn!(%server, error = %err, "not adding server");
                return false;
            }
        };
        let mut replay = None;
        let mut unplaced = Vec::new();
        let added = self.ring.modify(|bg, fg| {
            reconcile::add_batch(
                bg,
                fg,
                std::slice::from_ref(&replicas),
                &mut replay,
                &mut unplaced,
            )
        });
        if !unplaced.is_empty() {
            warn!(%server, "not adding server: all positions collide");
        }
        if added > 0 {
            debug!(%server, nodes = replicas.nodes.len(), "added server to ring");
        }
        added > 0
    }

    /// Removes `server` from the ring. Returns `false` if it was not present.
    pub fn remove_server(&self, server: &ServerId) -> bool {
        let _settings = self.settings.read();
        let mut replay = None;
        let removed = self
            .ring
            .modify(|bg, fg| reconcile::remove(bg, fg, server, &mut replay));
        if removed > 0 {
            debug!(%server, "removed server from ring");
        }
        removed > 0
    }

    /// Adds every listed server not yet on the ring, publishing them together.
    ///
    /// Servers whose replicas cannot be built, or whose positions are all taken by servers at the
    /// same address, are skipped and listed in the outcome. Servers already present are skipped
    /// silently.
    pub fn add_servers_in_batch(&self, servers: &[ServerId]) -> BatchOutcome {
        let settings = self.settings.read();
        let mut failures = Vec::new();
        let mut batch = Vec::with_capacity(servers.len());
        for server in servers {
            match self.build_replicas(&settings, server) {
                Ok(replicas) => batch.push(replicas),
                Err(err) => {
                    warn!(%server, error = %err, "not adding server");
                    failures.push((server.clone(), err));
                }
            }
        }
        let mut replay = None;
        let mut unplaced = Vec::new();
        let changed = self.ring.modify(|bg, fg| {
            reconcile::add_batch(bg, fg, &batch, &mut replay, &mut unplaced)
        });
        for server in unplaced {
            warn!(%server, "not adding server: all positions collide");
            let err = BalancerError::replica_build_failed(&server, "all positions collide");
            failures.push((server, err));
        }
        debug!(
            requested = servers.len(),
            added = changed,
            failed = failures.len(),
            "added servers in batch"
        );
        BatchOutcome { changed, failures }
    }

    /// Removes every listed server from the ring, publishing the removals together.
    ///
    /// Servers that are not on the ring are listed as [`BalancerError::ServerNotFound`].
    pub fn remove_servers_in_batch(&self, servers: &[ServerId]) -> BatchOutcome {
        let _settings = self.settings.read();
        let targets: FxHashSet<&ServerId> = servers.iter().collect();
        let mut missing: Vec<ServerId> = Vec::new();
        let mut replay = None;
        let changed = self.ring.modify(|bg, fg| {
            if replay.is_none() {
                let present = fg.servers();
                missing = targets
                    .iter()
                    .filter(|server| !present.contains(**server))
                    .map(|server| (*server).clone())
                    .collect();
            }
            reconcile::remove_batch(bg, fg, &targets, &mut replay)
        });
        debug!(
            requested = servers.len(),
            removed = changed,
            "removed servers in batch"
        );
        let failures = missing
            .into_iter()
            .map(|server| {
                let err = BalancerError::ServerNotFound(server.clone());
                (server, err)
            })
            .collect();
        BatchOutcome { changed, failures }
    }

    /// Picks a server for a request.
    ///
    /// Starts at the first virtual node at or after the request code, wrapping around, and walks
    /// the ring until a server that is neither excluded nor unavailable turns up. Each distinct
    /// server is judged once; the walk gives up with [`BalancerError::NoServerAvailable`] once
    /// every server on the ring has been rejected.
    pub fn select_server(&self, input: &SelectIn<'_>) -> Result<ServerId> {
        let code = input.request_code.unwrap_or_else(rand::random);
        let ring = self.ring.read();
        if ring.is_empty() {
            return Err(BalancerError::NoServerAvailable);
        }
        let mut rejected: FxHashSet<&ServerId> = FxHashSet::default();
        for node in ring.walk_from(code) {
            let server = node.server();
            if rejected.contains(server) {
                continue;
            }
            if !input.rejects(server) {
                return Ok(server.clone());
            }
            rejected.insert(server);
            if rejected.len() == ring.server_count() {
                break;
            }
        }
        Err(BalancerError::NoServerAvailable)
    }

    /// Applies a parameter string such as `"replicas=200 hash_algorithm=md5"`.
    ///
    /// When the settings change, every server on the ring is placed again under the new settings
    /// and the rebuilt ring is published at once. On any error the previous settings and ring stay
    /// in effect.
    pub fn set_parameters(&self, params: &str) -> Result<()> {
        let parameters = params.parse::<Parameters>().map_err(|err| {
            warn!(params, error = %err, "rejected parameters");
            err
        })?;
        let mut settings = self.settings.write();
        let next = settings.apply(&parameters);
        if !next.differs_from(&settings) {
            return Ok(());
        }

        let servers: Vec<ServerId> = self.ring.read().servers().into_iter().cloned().collect();
        let mut nodes = Vec::with_capacity(servers.len() * next.config.replicas);
        for server in &servers {
            let replicas = self.build_replicas(&next, server).map_err(|err| {
                warn!(params, %server, error = %err, "rejected parameters");
                BalancerError::InvalidConfiguration(format!(
                    "cannot place server {server}: {err}"
                ))
            })?;
            nodes.extend(replicas.nodes);
        }
        sort_positions(&mut nodes);
        let placed: FxHashSet<&ServerId> = nodes.iter().map(RingNode::server).collect();
        if let Some(server) = servers.iter().find(|server| !placed.contains(server)) {
            warn!(params, %server, "rejected parameters");
            return Err(BalancerError::InvalidConfiguration(format!(
                "cannot place server {server}: all positions collide"
            )));
        }

        let mut replay = None;
        self.ring
            .modify(|bg, fg| reconcile::replace(bg, fg, &nodes, &mut replay));
        info!(
            replicas = next.config.replicas,
            hash = next.builder.name(),
            servers = servers.len(),
            "applied parameters"
        );
        *settings = next;
        Ok(())
    }

    /// Writes a summary of the balancer.
    ///
    /// The terse form is the policy name. The verbose form adds the settings, the ring size and
    /// the share of the hash space owned by each address.
    pub fn describe(&self, out: &mut dyn fmt::Write, options: DescribeOptions) -> fmt::Result {
        if !options.verbose {
            return out.write_str("c_hash");
        }
        let (replicas, hash) = {
            let settings = self.settings.read();
            (settings.config.replicas, settings.builder.name().to_owned())
        };
        let ring = self.ring.read();
        write!(
            out,
            "ConsistentHashingLoadBalancer {{ hash: {hash}, replicas: {replicas}, servers: {}, nodes: {}",
            ring.server_count(),
            ring.len()
        )?;
        for (addr, load) in ring.loads() {
            write!(out, "\n  {addr}: {:.3}%", load * 100.0)?;
        }
        out.write_str("\n}")
    }
}

impl fmt::Display for ConsistentHashingLoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.describe(f, DescribeOptions { verbose: true })
    }
}

impl LoadBalancer for ConsistentHashingLoadBalancer {
    fn add_server(&self, server: &ServerId) -> bool {
        ConsistentHashingLoadBalancer::add_server(self, server)
    }

    fn remove_server(&self, server: &ServerId) -> bool {
        ConsistentHashingLoadBalancer::remove_server(self, server)
    }

    fn add_servers_in_batch(&self, servers: &[ServerId]) -> BatchOutcome {
        ConsistentHashingLoadBalancer::add_servers_in_batch(self, servers)
    }

    fn remove_servers_in_batch(&self, servers: &[ServerId]) -> BatchOutcome {
        ConsistentHashingLoadBalancer::remove_servers_in_batch(self, servers)
    }

    fn select_server(&self, input: &SelectIn<'_>) -> Result<ServerId> {
        ConsistentHashingLoadBalancer::select_server(self, input)
    }

    fn describe(&self, out: &mut dyn fmt::Write, options: DescribeOptions) -> fmt::Result {
        ConsistentHashingLoadBalancer::describe(self, out, options)
    }
}
