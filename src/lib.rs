//! # chash-lb
//!
//! `chash-lb` picks a backend server per request with consistent hashing, so that servers joining
//! or leaving only remap the keys adjacent to their virtual nodes.
//!
//! The ring lives in a [`DoublyBuffered`] container: selections read the current copy without
//! locking while membership changes rebuild the other copy and publish it atomically.
//!
//! ```
//! use std::collections::HashSet;
//! use std::sync::Arc;
//! use chash_lb::{ConsistentHashingLoadBalancer, HashAlgorithm, SelectIn, ServerDirectory, ServerId};
//!
//! let directory: ServerDirectory = (1..=3)
//!     .map(|id| (id, format!("10.0.0.{id}:8000").parse().unwrap()))
//!     .collect();
//! let balancer = ConsistentHashingLoadBalancer::new(Arc::new(directory));
//! balancer.set_parameters("replicas=160 hash_algorithm=ketama").unwrap();
//!
//! let servers: Vec<ServerId> = (1..=3).map(ServerId::new).collect();
//! assert_eq!(balancer.add_servers_in_batch(&servers).changed, 3);
//!
//! // Route by key, falling over to another server when the owner is excluded.
//! let code = HashAlgorithm::Ketama.hash_key(b"user-42").unwrap();
//! let owner = balancer.select_server(&SelectIn::with_code(code)).unwrap();
//! let tried: HashSet<ServerId> = [owner.clone()].into_iter().collect();
//! let fallback = balancer
//!     .select_server(&SelectIn::with_code(code).excluding(&tried))
//!     .unwrap();
//! assert_ne!(owner, fallback);
//! ```

#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod balancer;
mod config;
mod doubly_buffered;
mod error;
mod hashring;
mod node;
mod reconcile;
mod replicas;
mod resolver;

pub use balancer::{
    BatchOutcome, ConsistentHashingLoadBalancer, DescribeOptions, ExcludedServers, LoadBalancer,
    SelectIn,
};
pub use config::{BalancerConfig, Parameters, DEFAULT_REPLICAS, MAX_REPLICAS};
pub use doubly_buffered::{DoublyBuffered, ReadGuard};
pub use error::{BalancerError, Result};
pub use hashring::HashRing;
pub use node::{RingNode, ServerId};
pub use replicas::{HashAlgorithm, ReplicaBuilder};
pub use resolver::{AddressResolver, ServerDirectory};
