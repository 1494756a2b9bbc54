//! Transport tunables.
//!
//! Defaults match the chaosd daemon's well-known rendezvous layout under
//! /var/tmp. Embedding gateways point `daemon_path` somewhere else for
//! testing or containerized deployments.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default chaosd rendezvous socket.
pub const DEFAULT_DAEMON_PATH: &str = "/var/tmp/chaosd_server";

/// Configuration for the daemon transport and handshake timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Well-known endpoint of the chaosd daemon.
    pub daemon_path: PathBuf,

    /// Directory in which this process binds its own (short-lived)
    /// rendezvous name before connecting.
    pub rendezvous_dir: PathBuf,

    /// Receive deadline for one poll of the daemon channel during the
    /// handshake. Data transfer uses plain blocking reads.
    pub recv_timeout: Duration,

    /// Number of receive timeouts without a response before the RFC packet
    /// is resent.
    pub resend_after: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            daemon_path: PathBuf::from(DEFAULT_DAEMON_PATH),
            rendezvous_dir: PathBuf::from("/var/tmp"),
            recv_timeout: Duration::from_millis(100),
            resend_after: 3,
        }
    }
}
