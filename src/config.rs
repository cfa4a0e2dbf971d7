//! Runtime configuration for every role.
//!
//! Defaults reproduce the classic single-host layout: index on 5000/5001,
//! monitor on 6000 (UDP) / 6001 (TCP), first content node on 7001/7002.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CdnError, Result};
use crate::membership::types::NodeId;

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CATALOG_FILES: usize = 100_000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// UDP endpoint receiving heartbeats.
    pub heartbeat_bind: SocketAddr,
    /// TCP endpoint serving `LIST_SERVERS` / `REGISTER_INDEX` / `PING`.
    pub control_bind: SocketAddr,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub io_timeout: Duration,
    pub max_connections: usize,
    /// Index notification endpoints pushed `SERVER_DOWN` from startup.
    pub notify: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_bind: SocketAddr::from(([0, 0, 0, 0], 6000)),
            control_bind: SocketAddr::from(([0, 0, 0, 0], 6001)),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            notify: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Loopback ports chosen by the OS, for tests and embedding.
    pub fn ephemeral() -> Self {
        Self {
            heartbeat_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            control_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout.is_zero() {
            return Err(CdnError::Config("heartbeat timeout must be positive".into()));
        }
        if self.sweep_interval.is_zero() || self.sweep_interval >= self.heartbeat_timeout {
            return Err(CdnError::Config(format!(
                "sweep interval {:?} must be positive and shorter than the timeout {:?}",
                self.sweep_interval, self.heartbeat_timeout
            )));
        }
        validate_common(self.io_timeout, self.max_connections)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    /// TCP endpoint for clients and content-node registration.
    pub client_bind: SocketAddr,
    /// TCP endpoint receiving `SERVER_DOWN` pushes.
    pub notify_bind: SocketAddr,
    /// Optional HTTP status surface.
    pub http_bind: Option<SocketAddr>,
    /// Monitor control endpoint; unused when the index shares memory with
    /// the monitor.
    pub monitor_addr: String,
    /// Host the monitor should use to reach `notify_bind`.
    pub advertise_host: String,
    /// How often the cached membership snapshot is refreshed.
    pub refresh_interval: Duration,
    pub io_timeout: Duration,
    pub max_connections: usize,
    /// Drop catalogs of nodes that stayed DEAD this long. `None` keeps them
    /// until the node deregisters.
    pub purge_after: Option<Duration>,
    /// Longest a registration may take from `REGISTER` to `DONE_FILES`.
    pub handshake_timeout: Duration,
    /// Most `ADD_FILE` rows buffered by a single registration.
    pub max_catalog_files: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            client_bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            notify_bind: SocketAddr::from(([0, 0, 0, 0], 5001)),
            http_bind: None,
            monitor_addr: "127.0.0.1:6001".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            refresh_interval: DEFAULT_SWEEP_INTERVAL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            purge_after: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_catalog_files: DEFAULT_MAX_CATALOG_FILES,
        }
    }
}

impl IndexConfig {
    pub fn ephemeral() -> Self {
        Self {
            client_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            notify_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(CdnError::Config("refresh interval must be positive".into()));
        }
        if let Some(purge_after) = self.purge_after
            && purge_after.is_zero()
        {
            return Err(CdnError::Config("purge age must be positive".into()));
        }
        if self.handshake_timeout.is_zero() || self.max_catalog_files == 0 {
            return Err(CdnError::Config(
                "handshake timeout and catalog size limit must be positive".into(),
            ));
        }
        validate_common(self.io_timeout, self.max_connections)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub files_dir: PathBuf,
    /// TCP endpoint serving file bytes.
    pub transfer_bind: SocketAddr,
    /// Port announced in `REGISTER`; informational.
    pub udp_port: u16,
    /// Host announced in heartbeats.
    pub advertise_host: String,
    pub index_addr: String,
    /// Monitor UDP heartbeat endpoint.
    pub monitor_addr: String,
    pub heartbeat_interval: Duration,
    pub io_timeout: Duration,
    pub max_connections: usize,
    /// Seed a few sample files when the directory is empty.
    pub create_samples: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: NodeId::from("CS1"),
            files_dir: PathBuf::from("files_CS1"),
            transfer_bind: SocketAddr::from(([0, 0, 0, 0], 7001)),
            udp_port: 7002,
            advertise_host: "localhost".to_string(),
            index_addr: "127.0.0.1:5000".to_string(),
            monitor_addr: "127.0.0.1:6000".to_string(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            create_samples: true,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() || self.id.as_str().contains(char::is_whitespace) {
            return Err(CdnError::Config(format!("invalid node id {:?}", self.id.0)));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(CdnError::Config("heartbeat interval must be positive".into()));
        }
        validate_common(self.io_timeout, self.max_connections)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    pub index_addr: String,
    pub output_dir: PathBuf,
    /// Bound on each control-plane exchange with the index.
    pub io_timeout: Duration,
    /// Bound on each read while receiving file bytes.
    pub transfer_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            index_addr: "127.0.0.1:5000".to_string(),
            output_dir: PathBuf::from("downloads"),
            io_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

fn validate_common(io_timeout: Duration, max_connections: usize) -> Result<()> {
    if io_timeout.is_zero() {
        return Err(CdnError::Config("I/O timeout must be positive".into()));
    }
    if max_connections == 0 {
        return Err(CdnError::Config("max connections must be positive".into()));
    }
    Ok(())
}
