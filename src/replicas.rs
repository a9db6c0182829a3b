//! Placement of a server's virtual nodes.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{BalancerError, Result};
use crate::node::{RingNode, ServerId};

/// Computes the virtual nodes of a server.
///
/// Implementations must be deterministic: every client has to place a given server at the same
/// positions for consistent hashing to route consistently across a fleet. Failures are returned to
/// the balancer, which leaves the server off the ring and reports it.
///
/// Closures with the same signature as [`ReplicaBuilder::build`] implement the trait.
pub trait ReplicaBuilder: Send + Sync {
    /// Builds `num_replicas` nodes for `server`, reachable at `addr`. The order is irrelevant.
    fn build(&self, server: &ServerId, addr: SocketAddr, num_replicas: usize)
        -> Result<Vec<RingNode>>;

    /// Name shown when describing the balancer.
    fn name(&self) -> &str {
        "custom"
    }
}

impl<F> ReplicaBuilder for F
where
    F: Fn(&ServerId, SocketAddr, usize) -> Result<Vec<RingNode>> + Send + Sync,
{
    fn build(
        &self,
        server: &ServerId,
        addr: SocketAddr,
        num_replicas: usize,
    ) -> Result<Vec<RingNode>> {
        self(server, addr, num_replicas)
    }
}

/// Built-in hash functions for placing replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum HashAlgorithm {
    /// MurmurHash3 (x86, 32 bit) of `"{addr}-{i}"` for replica `i`.
    #[default]
    Murmur3,
    /// First four bytes of the MD5 digest of `"{addr}-{i}"` for replica `i`.
    Md5,
    /// Ketama placement: every MD5 digest of `"{addr}-{k}"` yields four positions.
    Ketama,
}

impl HashAlgorithm {
    /// Every built-in algorithm.
    pub const ALL: [HashAlgorithm; 3] = [
        HashAlgorithm::Murmur3,
        HashAlgorithm::Md5,
        HashAlgorithm::Ketama,
    ];

    /// Configuration name of the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Murmur3 => "murmur3",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Ketama => "ketama",
        }
    }

    /// Hashes a request key with the function used to place replicas, so that request codes and
    /// ring positions live in the same space.
    ///
    /// # Examples
    ///
    /// ```
    /// use chash_lb::HashAlgorithm;
    /// let code = HashAlgorithm::Md5.hash_key(b"user-42").unwrap();
    /// assert_eq!(code, HashAlgorithm::Ketama.hash_key(b"user-42").unwrap());
    /// ```
    pub fn hash_key(&self, key: &[u8]) -> io::Result<u32> {
        match self {
            HashAlgorithm::Murmur3 => murmur3::murmur3_32(&mut &key[..], 0),
            HashAlgorithm::Md5 | HashAlgorithm::Ketama => Ok(md5_point(&md5::compute(key), 0)),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self> {
        HashAlgorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                BalancerError::InvalidConfiguration(format!("unknown hash algorithm `{s}`"))
            })
    }
}

impl ReplicaBuilder for HashAlgorithm {
    fn build(
        &self,
        server: &ServerId,
        addr: SocketAddr,
        num_replicas: usize,
    ) -> Result<Vec<RingNode>> {
        if num_replicas == 0 {
            return Err(BalancerError::replica_build_failed(
                server,
                "replica count must be positive",
            ));
        }
        let node = |hash| RingNode::new(hash, server.clone(), addr);
        match self {
            HashAlgorithm::Murmur3 => (0..num_replicas)
                .map(|i| {
                    let key = replica_key(server, addr, i);
                    murmur3::murmur3_32(&mut key.as_bytes(), 0)
                        .map(node)
                        .map_err(|err| BalancerError::replica_build_failed(server, err.to_string()))
                })
                .collect(),
            HashAlgorithm::Md5 => Ok((0..num_replicas)
                .map(|i| node(md5_point(&md5::compute(replica_key(server, addr, i)), 0)))
                .collect()),
            HashAlgorithm::Ketama => {
                let digests = (num_replicas + 3) / 4;
                Ok((0..digests)
                    .flat_map(|k| {
                        let digest = md5::compute(replica_key(server, addr, k));
                        (0..4).map(move |j| md5_point(&digest, j))
                    })
                    .take(num_replicas)
                    .map(node)
                    .collect())
            }
        }
    }

    fn name(&self) -> &str {
        self.as_str()
    }
}

fn replica_key(server: &ServerId, addr: SocketAddr, index: usize) -> String {
    match &server.tag {
        Some(tag) => format!("{addr}({tag})-{index}"),
        None => format!("{addr}-{index}"),
    }
}

/// The `point`-th little-endian `u32` of a digest.
fn md5_point(digest: &md5::Digest, point: usize) -> u32 {
    let offset = point * 4;
    u32::from_le_bytes([
        digest[offset],
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn addr() -> SocketAddr {
        "10.0.0.1:8000".parse().unwrap()
    }

    #[test]
    fn every_algorithm_builds_the_requested_replicas() {
        let server = ServerId::new(1);
        for algorithm in HashAlgorithm::ALL {
            for replicas in [1, 3, 4, 5, 100] {
                let nodes = algorithm.build(&server, addr(), replicas).unwrap();
                assert_eq!(nodes.len(), replicas, "{algorithm} with {replicas}");
                assert!(nodes.iter().all(|n| n.server() == &server && n.addr() == addr()));
            }
        }
    }

    #[test]
    fn building_is_deterministic() {
        let server = ServerId::new(1);
        for algorithm in HashAlgorithm::ALL {
            let a: Vec<u32> = algorithm
                .build(&server, addr(), 50)
                .unwrap()
                .iter()
                .map(RingNode::hash)
                .collect();
            let b: Vec<u32> = algorithm
                .build(&server, addr(), 50)
                .unwrap()
                .iter()
                .map(RingNode::hash)
                .collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn placement_depends_on_address_not_id() {
        let a = HashAlgorithm::Murmur3
            .build(&ServerId::new(1), addr(), 10)
            .unwrap();
        let b = HashAlgorithm::Murmur3
            .build(&ServerId::new(2), addr(), 10)
            .unwrap();
        assert!(a.iter().zip(&b).all(|(x, y)| x.hash() == y.hash()));
    }

    #[test]
    fn tags_move_replicas() {
        let plain: HashSet<u32> = HashAlgorithm::Murmur3
            .build(&ServerId::new(1), addr(), 10)
            .unwrap()
            .iter()
            .map(RingNode::hash)
            .collect();
        let tagged: HashSet<u32> = HashAlgorithm::Murmur3
            .build(&ServerId::with_tag(1, "blue"), addr(), 10)
            .unwrap()
            .iter()
            .map(RingNode::hash)
            .collect();
        assert!(plain.is_disjoint(&tagged));
    }

    #[test]
    fn ketama_prefix_is_stable() {
        // Growing the replica count only appends points.
        let four = HashAlgorithm::Ketama
            .build(&ServerId::new(1), addr(), 4)
            .unwrap();
        let eight = HashAlgorithm::Ketama
            .build(&ServerId::new(1), addr(), 8)
            .unwrap();
        assert!(four.iter().zip(&eight).all(|(x, y)| x.hash() == y.hash()));
    }

    #[test]
    fn zero_replicas_is_an_error() {
        let err = HashAlgorithm::Md5
            .build(&ServerId::new(1), addr(), 0)
            .unwrap_err();
        assert!(matches!(err, BalancerError::ReplicaBuildFailed { .. }));
    }

    #[test]
    fn parsing_names_works() {
        assert_eq!("murmur3".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Murmur3));
        assert_eq!("MD5".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Md5));
        assert_eq!("ketama".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Ketama));
        assert!("crc32".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn closures_are_replica_builders() {
        let builder = |server: &ServerId, addr: SocketAddr, n: usize| -> Result<Vec<RingNode>> {
            Ok((0..n as u32)
                .map(|i| RingNode::new(i * 10, server.clone(), addr))
                .collect())
        };
        let nodes = builder.build(&ServerId::new(1), addr(), 3).unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(ReplicaBuilder::name(&builder), "custom");
    }
}
