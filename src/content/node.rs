use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::info;

use super::files::LocalFiles;
use super::protocol::{format_transfer_header, parse_transfer_request};
use crate::config::NodeConfig;
use crate::directory::protocol::{
    DEREGISTER, DONE_FILES, OK_DEREGISTERED, OK_FILES_ADDED, OK_REGISTERED, format_add_file,
    format_register,
};
use crate::error::CdnError;
use crate::membership::protocol::format_heartbeat;
use crate::membership::types::{Heartbeat, NodeAddress, now_ms};
use crate::runtime::ServiceHandle;
use crate::transport::{LineConn, accept_loop};

const INITIAL_RETRY_DELAY_MS: u64 = 150;
const MAX_RETRY_DELAY_MS: u64 = 5_000;

/// A content node: serves file bytes, registers its catalog with the index
/// and heartbeats to the monitor.
pub struct ContentNode {
    config: NodeConfig,
    files: Arc<LocalFiles>,
    active_transfers: AtomicU64,
}

/// A running content node.
pub struct NodeHandle {
    pub node: Arc<ContentNode>,
    pub transfer_addr: SocketAddr,
    handle: ServiceHandle,
}

impl NodeHandle {
    /// Deregisters from the index (best effort) and stops every task.
    pub async fn shutdown(self) {
        if let Err(e) = self.node.deregister().await {
            tracing::warn!("Could not deregister {}: {}", self.node.config.id, e);
        }
        self.handle.shutdown().await;
    }
}

/// Decrements the load counter when a transfer ends, however it ends.
struct TransferGuard<'a>(&'a AtomicU64);

impl<'a> TransferGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ContentNode {
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let files = LocalFiles::scan(&config.files_dir, &config.id, config.create_samples)
            .await
            .with_context(|| format!("scanning {}", config.files_dir.display()))?;

        Ok(Arc::new(Self {
            config,
            files: Arc::new(files),
            active_transfers: AtomicU64::new(0),
        }))
    }

    pub fn files(&self) -> &LocalFiles {
        &self.files
    }

    /// Transfers in flight; reported as load.
    pub fn load(&self) -> u64 {
        self.active_transfers.load(Ordering::SeqCst)
    }

    pub async fn start(self: Arc<Self>) -> Result<NodeHandle> {
        info!(
            "Starting content node {} with {} files from {}",
            self.config.id,
            self.files.len(),
            self.files.dir().display()
        );

        let listener = TcpListener::bind(self.config.transfer_bind)
            .await
            .with_context(|| format!("binding transfer endpoint {}", self.config.transfer_bind))?;
        let transfer_addr = listener.local_addr()?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("binding heartbeat socket")?;

        let mut handle = ServiceHandle::new("content node");

        {
            let node = self.clone();
            handle.spawn(accept_loop(
                "transfer",
                listener,
                self.config.max_connections,
                handle.signal(),
                move |stream, peer| node.clone().serve_transfer(stream, peer),
            ));
        }

        {
            let node = self.clone();
            let shutdown = handle.signal();
            let port = transfer_addr.port();
            handle.spawn(async move {
                node.register_with_retry(port, shutdown).await;
            });
        }

        {
            let node = self.clone();
            let shutdown = handle.signal();
            let port = transfer_addr.port();
            handle.spawn(async move {
                node.heartbeat_loop(socket, port, shutdown).await;
            });
        }

        info!(
            "Content node {} serving on tcp/{}, heartbeating to {}",
            self.config.id, transfer_addr, self.config.monitor_addr
        );

        Ok(NodeHandle {
            node: self,
            transfer_addr,
            handle,
        })
    }

    /// Runs the registration handshake once.
    pub async fn register(&self, tcp_port: u16) -> crate::error::Result<()> {
        let mut conn = LineConn::connect(&self.config.index_addr, self.config.io_timeout).await?;

        conn.write_line(&format_register(
            &self.config.id,
            tcp_port,
            self.config.udp_port,
        ))
        .await?;
        expect_reply(&mut conn, OK_REGISTERED).await?;

        let mut batch = String::new();
        for (name, size) in self.files.entries() {
            batch.push_str(&format_add_file(&self.config.id, name, size));
            batch.push('\n');
        }
        batch.push_str(DONE_FILES);
        batch.push('\n');
        conn.write_raw(batch.as_bytes()).await?;
        expect_reply(&mut conn, OK_FILES_ADDED).await?;

        conn.shutdown().await;
        Ok(())
    }

    /// Retries registration with exponential backoff and jitter until the
    /// index accepts it or the node shuts down.
    async fn register_with_retry(&self, tcp_port: u16, mut shutdown: watch::Receiver<bool>) {
        let mut delay_ms = INITIAL_RETRY_DELAY_MS;
        let mut attempt = 1u32;

        loop {
            match self.register(tcp_port).await {
                Ok(()) => {
                    info!(
                        "Registered {} files with index at {}",
                        self.files.len(),
                        self.config.index_addr
                    );
                    return;
                }
                Err(e) => tracing::warn!(
                    "Registration attempt {} with {} failed: {}",
                    attempt,
                    self.config.index_addr,
                    e
                ),
            }

            let jitter = rand::random::<u64>() % 50;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms + jitter)) => {},
                _ = shutdown.changed() => return,
            }
            delay_ms = (delay_ms * 2).min(MAX_RETRY_DELAY_MS);
            attempt += 1;
        }
    }

    pub async fn deregister(&self) -> crate::error::Result<()> {
        let mut conn = LineConn::connect(&self.config.index_addr, self.config.io_timeout).await?;
        conn.write_line(&format!("{} {}", DEREGISTER, self.config.id))
            .await?;
        expect_reply(&mut conn, OK_DEREGISTERED).await?;
        conn.shutdown().await;
        info!("Deregistered {} from index", self.config.id);
        Ok(())
    }

    pub fn heartbeat(&self, tcp_port: u16) -> Heartbeat {
        Heartbeat {
            id: self.config.id.clone(),
            address: NodeAddress::new(self.config.advertise_host.clone(), tcp_port),
            load: self.load(),
            file_count: self.files.len() as u64,
            sent_at: Some(now_ms()),
        }
    }

    async fn heartbeat_loop(
        &self,
        socket: UdpSocket,
        tcp_port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let interval = self.config.heartbeat_interval;
        // Early, never late: jitter only shortens the period.
        let max_jitter_ms = (interval.as_millis() as u64 / 10).max(1);

        loop {
            let heartbeat = self.heartbeat(tcp_port);
            let line = format_heartbeat(&heartbeat);
            match socket
                .send_to(line.as_bytes(), self.config.monitor_addr.as_str())
                .await
            {
                Ok(_) => tracing::debug!(
                    "Sent heartbeat: load={}, files={}",
                    heartbeat.load,
                    heartbeat.file_count
                ),
                Err(e) => tracing::warn!("Failed to send heartbeat: {}", e),
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % max_jitter_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval.saturating_sub(jitter)) => {},
                _ = shutdown.changed() => break,
            }
        }

        info!("Heartbeats stopped");
    }

    async fn serve_transfer(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _guard = TransferGuard::enter(&self.active_transfers);
        let mut conn = LineConn::new(stream, self.config.io_timeout);

        let line = match conn.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("Transfer request from {} failed: {}", peer, e);
                if e.is_recoverable() {
                    let _ = conn.write_line(&e.to_wire()).await;
                }
                conn.shutdown().await;
                return;
            }
        };

        match self.send_file(&mut conn, &line).await {
            Ok((name, size)) => info!("Sent {} ({} bytes) to {}", name, size, peer),
            Err(e) => {
                tracing::info!("Transfer to {} refused: {}", peer, e);
                if e.is_recoverable() {
                    let _ = conn.write_line(&e.to_wire()).await;
                }
            }
        }

        conn.shutdown().await;
    }

    async fn send_file(
        &self,
        conn: &mut LineConn,
        line: &str,
    ) -> crate::error::Result<(String, u64)> {
        let name = parse_transfer_request(line)?;
        let path = self
            .files
            .path_of(&name)
            .ok_or_else(|| CdnError::NotFound(name.clone()))?;

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CdnError::NotFound(name));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        conn.write_line(&format_transfer_header(size)).await?;
        let mut body = file.take(size);
        let copied = tokio::io::copy(&mut body, conn.writer_mut()).await?;
        if copied != size {
            return Err(CdnError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{} shrank during transfer ({} of {} bytes)", name, copied, size),
            )));
        }

        Ok((name, size))
    }
}

async fn expect_reply(conn: &mut LineConn, expected: &str) -> crate::error::Result<()> {
    match conn.read_line().await? {
        Some(reply) if reply == expected => Ok(()),
        Some(reply) => Err(CdnError::InvalidFormat(format!(
            "expected {:?}, index answered {:?}",
            expected, reply
        ))),
        None => Err(CdnError::InvalidFormat(format!(
            "index closed the connection before {:?}",
            expected
        ))),
    }
}
