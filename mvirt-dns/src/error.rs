//! Error types for control-plane operations.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::generation::ResourceKind;
use crate::zonefile::ZonefileError;

/// Errors returned by reconfiguration entry points on [`crate::core::Core`].
///
/// A failed reconfiguration never leaves a half-applied change behind: the
/// generation that was serving before the call keeps serving.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to bind socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to open adapter {ifname}: {source}")]
    AdapterOpen {
        ifname: String,
        #[source]
        source: io::Error,
    },

    #[error("adapter {0} has no usable MAC address")]
    MissingMac(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("zonefile load failed: {0}")]
    Zonefile(#[from] ZonefileError),

    #[error("{kind} generation {generation} still held by workers {workers:?} after {waited:?}")]
    QuiescenceStalled {
        kind: ResourceKind,
        generation: u64,
        workers: Vec<usize>,
        waited: Duration,
    },

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

pub type Result<T> = std::result::Result<T, CoreError>;
