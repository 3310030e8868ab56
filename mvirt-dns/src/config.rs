//! Runtime configuration snapshots and startup capability flags.
//!
//! A [`Configuration`] is a plain value: the control thread compares the old
//! and new snapshot to decide what has to be rebuilt. Parsing happens here only
//! for the JSON file format read by the daemon.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default DNS port for raw interface bindings.
pub const DNS_PORT: u16 = 53;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid MAC address for {ifname}: {value}")]
    InvalidMac { ifname: String, value: String },
}

/// Mode switches fixed at startup.
///
/// Read by the adapter layer and the zonefile loader; the core only hands them
/// on to newly opened adapters and newly spawned workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    pub pfring: bool,
    pub sendq: bool,
    pub offline: bool,
    pub packet_trace: bool,
    pub zonefile_check: bool,
}

/// One raw-capture binding as written in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub ifname: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Addr>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overrides the MAC address reported by the adapter.
    #[serde(default)]
    pub mac: Option<String>,
    /// Next-hop MAC used when a query arrives without a usable source MAC.
    #[serde(default)]
    pub router_mac: Option<String>,
}

impl InterfaceConfig {
    pub fn new(ifname: impl Into<String>) -> Self {
        Self {
            ifname: ifname.into(),
            ipv4: None,
            ipv6: None,
            port: DNS_PORT,
            mac: None,
            router_mac: None,
        }
    }

    /// Reject MAC strings that do not parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for value in [&self.mac, &self.router_mac].into_iter().flatten() {
            if parse_mac(value).is_none() {
                return Err(ConfigError::InvalidMac {
                    ifname: self.ifname.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    DNS_PORT
}

/// Bounds for waiting on worker echoes before reclaiming a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuiescenceConfig {
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub warn_after_ms: u64,
    pub give_up_after_ms: u64,
}

impl Default for QuiescenceConfig {
    fn default() -> Self {
        Self {
            poll_initial_ms: 1,
            poll_max_ms: 50,
            warn_after_ms: 1_000,
            give_up_after_ms: 10_000,
        }
    }
}

impl QuiescenceConfig {
    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms.max(1))
    }

    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms.max(self.poll_initial_ms).max(1))
    }

    pub fn warn_after(&self) -> Duration {
        Duration::from_millis(self.warn_after_ms)
    }

    pub fn give_up_after(&self) -> Duration {
        Duration::from_millis(self.give_up_after_ms)
    }
}

/// A complete configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub worker_threads: usize,
    pub cpu_pinning: bool,
    pub listen: Vec<SocketAddr>,
    pub interfaces: Vec<InterfaceConfig>,
    pub zonefiles: Vec<PathBuf>,
    pub quiescence: QuiescenceConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            cpu_pinning: false,
            listen: Vec::new(),
            interfaces: Vec::new(),
            zonefiles: Vec::new(),
            quiescence: QuiescenceConfig::default(),
        }
    }
}

impl Configuration {
    /// The state before anything was applied: no workers, no sockets.
    pub fn empty() -> Self {
        Self {
            worker_threads: 0,
            ..Self::default()
        }
    }

    /// Read a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.interfaces.iter().try_for_each(InterfaceConfig::validate)
    }
}

/// Parse a MAC address in `aa:bb:cc:dd:ee:ff` form.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}
