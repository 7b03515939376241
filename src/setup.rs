//! # Session Inputs
//!
//! Plain data handed to a backend at start or benchmark time: which devices run
//! which algorithm, where the pool lives, and whose account the work is
//! credited to. These values are supplied by external collaborators (device
//! manager, profit switcher) and are held read-only for the duration of a
//! session.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single device with the algorithm it has been assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningPair {
    pub device_id: u32,
    pub algorithm: String,
}

/// Ordered set of device/algorithm pairs for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningSetup {
    pairs: Vec<MiningPair>,
}

impl MiningSetup {
    /// Build a setup from pairs, keeping their order and dropping repeated devices
    pub fn new(pairs: Vec<MiningPair>) -> Self {
        let mut seen = Vec::with_capacity(pairs.len());
        let pairs = pairs
            .into_iter()
            .filter(|p| {
                if seen.contains(&p.device_id) {
                    false
                } else {
                    seen.push(p.device_id);
                    true
                }
            })
            .collect();
        Self { pairs }
    }

    /// Convenience constructor assigning one algorithm to every device
    pub fn uniform(device_ids: &[u32], algorithm: &str) -> Self {
        Self::new(
            device_ids
                .iter()
                .map(|&device_id| MiningPair {
                    device_id,
                    algorithm: algorithm.to_string(),
                })
                .collect(),
        )
    }

    pub fn pairs(&self) -> &[MiningPair] {
        &self.pairs
    }

    pub fn device_ids(&self) -> Vec<u32> {
        self.pairs.iter().map(|p| p.device_id).collect()
    }

    /// Algorithm of the first pair; a session runs a single algorithm
    pub fn algorithm(&self) -> Option<&str> {
        self.pairs.first().map(|p| p.algorithm.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Pool endpoint parsed from a `host:port` string
///
/// Parsing never fails. Missing parts come back as empty strings so that a
/// malformed endpoint degrades into empty command-line fields instead of an
/// error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: String,
}

impl Endpoint {
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split(':');
        let host = parts.next().unwrap_or_default().to_string();
        let port = parts.next().unwrap_or_default().to_string();
        Self { host, port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Account address and worker name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub address: String,
    pub worker: String,
}

impl Credentials {
    pub fn new(address: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            worker: worker.into(),
        }
    }

    /// `address.worker` as passed to `--user`; the worker name is trimmed
    pub fn user(&self) -> String {
        format!("{}.{}", self.address, self.worker.trim())
    }
}

/// Everything a backend needs to build its command line
///
/// Replaces ambient global configuration: each start or benchmark call
/// receives its inputs explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendContext {
    /// Path of the backend executable
    pub executable: PathBuf,
    /// Pool endpoint as `host:port`
    pub url: String,
    pub credentials: Credentials,
    pub setup: MiningSetup,
    /// Opaque extra launch parameters, appended verbatim
    pub extra_params: String,
    /// Loopback port the backend exposes telemetry on
    pub api_port: u16,
    /// Directory benchmark log artifacts are written to
    pub log_dir: PathBuf,
}

impl BackendContext {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::parse(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("equihash.eu.nicehash.com:3357");
        assert_eq!(ep.host, "equihash.eu.nicehash.com");
        assert_eq!(ep.port, "3357");

        let ep = Endpoint::parse("localhost");
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, "");

        let ep = Endpoint::parse("");
        assert_eq!(ep, Endpoint::default());

        let ep = Endpoint::parse(":");
        assert_eq!(ep.host, "");
        assert_eq!(ep.port, "");

        // Extra segments are ignored rather than rejected
        let ep = Endpoint::parse("stratum+tcp://host:1234");
        assert_eq!(ep.host, "stratum+tcp");
        assert_eq!(ep.port, "//host");
    }

    #[test]
    fn test_credentials_user() {
        let creds = Credentials::new("3Abc", " rig01 ");
        assert_eq!(creds.user(), "3Abc.rig01");
    }

    #[test]
    fn test_mining_setup_order_and_dedup() {
        let setup = MiningSetup::new(vec![
            MiningPair {
                device_id: 2,
                algorithm: "equihash".into(),
            },
            MiningPair {
                device_id: 0,
                algorithm: "equihash".into(),
            },
            MiningPair {
                device_id: 2,
                algorithm: "equihash".into(),
            },
        ]);
        assert_eq!(setup.device_ids(), vec![2, 0]);
        assert_eq!(setup.algorithm(), Some("equihash"));
        assert!(MiningSetup::default().algorithm().is_none());
    }
}
