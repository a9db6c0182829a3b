use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{BalancerError, Result};
use crate::replicas::HashAlgorithm;

/// Virtual nodes per server unless configured otherwise.
pub const DEFAULT_REPLICAS: usize = 100;

/// Upper bound accepted for `replicas`.
pub const MAX_REPLICAS: usize = 1 << 16;

/// Settings of a consistent hashing balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BalancerConfig {
    /// Virtual nodes per server, `1..=MAX_REPLICAS`.
    pub replicas: usize,
    /// Hash function placing the virtual nodes.
    pub hash_algorithm: HashAlgorithm,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            replicas: DEFAULT_REPLICAS,
            hash_algorithm: HashAlgorithm::default(),
        }
    }
}

impl BalancerConfig {
    /// Checks that every value is in range.
    pub fn validate(&self) -> Result<()> {
        check_replicas(self.replicas)
    }

    /// Returns this configuration with `parameters` applied on top.
    pub fn apply(&self, parameters: &Parameters) -> BalancerConfig {
        BalancerConfig {
            replicas: parameters.replicas.unwrap_or(self.replicas),
            hash_algorithm: parameters.hash_algorithm.unwrap_or(self.hash_algorithm),
        }
    }
}

fn check_replicas(replicas: usize) -> Result<()> {
    if (1..=MAX_REPLICAS).contains(&replicas) {
        Ok(())
    } else {
        Err(BalancerError::InvalidConfiguration(format!(
            "replicas must be within 1..={MAX_REPLICAS}, got {replicas}"
        )))
    }
}

/// Options parsed from a parameter string such as `"replicas=200 hash_algorithm=md5"`.
///
/// Pairs are separated by whitespace. Keys not given leave the current setting untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Parameters {
    /// Value of `replicas`, if given.
    pub replicas: Option<usize>,
    /// Value of `hash_algorithm` (or its alias `hash`), if given.
    pub hash_algorithm: Option<HashAlgorithm>,
}

impl FromStr for Parameters {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parameters = Parameters::default();
        for pair in s.split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                BalancerError::InvalidConfiguration(format!("expected key=value, got `{pair}`"))
            })?;
            match key {
                "replicas" => {
                    let replicas = value.parse::<usize>().map_err(|err| {
                        BalancerError::InvalidConfiguration(format!(
                            "invalid replicas `{value}`: {err}"
                        ))
                    })?;
                    check_replicas(replicas)?;
                    parameters.replicas = Some(replicas);
                }
                "hash_algorithm" | "hash" => {
                    parameters.hash_algorithm = Some(value.parse()?);
                }
                _ => {
                    return Err(BalancerError::InvalidConfiguration(format!(
                        "unknown parameter `{key}`"
                    )))
                }
            }
        }
        Ok(parameters)
    }
}
