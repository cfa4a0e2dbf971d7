use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::info;

use super::detector::FailureDetector;
use super::notifier::DownNotifier;
use super::protocol::{
    ControlRequest, OK_INDEX_REGISTERED, PONG, ServerRow, parse_heartbeat,
};
use super::store::MembershipStore;
use crate::config::MonitorConfig;
use crate::error::CdnError;
use crate::runtime::ServiceHandle;
use crate::transport::{LineConn, accept_loop};

const MAX_DATAGRAM: usize = 1024;
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// The monitor: heartbeat ingestion, failure detection and the control
/// endpoint that exposes membership to index servers.
pub struct MembershipService {
    pub store: Arc<MembershipStore>,
    pub detector: Arc<FailureDetector>,
    pub notifier: Arc<DownNotifier>,
    config: MonitorConfig,
}

/// A running monitor and the addresses it actually bound.
pub struct MonitorHandle {
    pub service: Arc<MembershipService>,
    pub heartbeat_addr: SocketAddr,
    pub control_addr: SocketAddr,
    handle: ServiceHandle,
}

impl MonitorHandle {
    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}

impl MembershipService {
    pub fn new(config: MonitorConfig) -> Arc<Self> {
        let store = Arc::new(MembershipStore::new(config.heartbeat_timeout));
        let detector = FailureDetector::new(store.clone(), config.sweep_interval);
        let notifier = DownNotifier::new(config.notify.clone(), config.io_timeout);

        Arc::new(Self {
            store,
            detector,
            notifier,
            config,
        })
    }

    pub async fn start(self: Arc<Self>) -> Result<MonitorHandle> {
        self.config.validate()?;
        info!("Starting membership service...");

        let socket = UdpSocket::bind(self.config.heartbeat_bind)
            .await
            .with_context(|| format!("binding heartbeat socket {}", self.config.heartbeat_bind))?;
        let heartbeat_addr = socket.local_addr()?;

        let listener = TcpListener::bind(self.config.control_bind)
            .await
            .with_context(|| format!("binding control endpoint {}", self.config.control_bind))?;
        let control_addr = listener.local_addr()?;

        let mut handle = ServiceHandle::new("monitor");

        {
            let service = self.clone();
            let shutdown = handle.signal();
            handle.spawn(async move {
                service.receive_loop(socket, shutdown).await;
            });
        }

        {
            let service = self.clone();
            let shutdown = handle.signal();
            handle.spawn(accept_loop(
                "monitor control",
                listener,
                self.config.max_connections,
                shutdown,
                move |stream, peer| {
                    let service = service.clone();
                    async move { service.handle_control(stream, peer).await }
                },
            ));
        }

        handle.spawn(self.detector.clone().run(handle.signal()));
        handle.spawn(
            self.notifier
                .clone()
                .run(self.detector.subscribe(), handle.signal()),
        );

        {
            let service = self.clone();
            let shutdown = handle.signal();
            handle.spawn(async move {
                service.stats_loop(shutdown).await;
            });
        }

        info!(
            "Monitor listening: heartbeats on udp/{}, control on tcp/{}",
            heartbeat_addr, control_addr
        );

        Ok(MonitorHandle {
            service: self,
            heartbeat_addr,
            control_addr,
            handle,
        })
    }

    async fn receive_loop(&self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buf) => received,
                _ = shutdown.changed() => break,
            };

            match received {
                Ok((len, src)) => self.handle_datagram(&buf[..len], src),
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Heartbeat listener stopped");
    }

    /// Applies one datagram. Malformed datagrams are logged and dropped.
    pub fn handle_datagram(&self, datagram: &[u8], src: SocketAddr) {
        let text = match std::str::from_utf8(datagram) {
            Ok(text) => text.trim(),
            Err(_) => {
                tracing::warn!("Dropping non-UTF-8 datagram from {}", src);
                return;
            }
        };

        match parse_heartbeat(text) {
            Ok(heartbeat) => {
                let id = heartbeat.id.clone();
                let load = heartbeat.load;
                let file_count = heartbeat.file_count;
                let outcome = self.store.ingest_heartbeat(heartbeat);
                tracing::debug!(
                    "Heartbeat from {}: load={}, files={} ({:?})",
                    id,
                    load,
                    file_count,
                    outcome
                );
                self.detector.observe_heartbeat(&id, outcome);
            }
            Err(e) => tracing::warn!("Rejected datagram from {}: {}", src, e),
        }
    }

    async fn handle_control(&self, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!("Control connection from {}", peer);
        let mut conn = LineConn::new(stream, self.config.io_timeout);

        loop {
            let line = match conn.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(CdnError::Timeout(_)) => {
                    tracing::debug!("Control connection from {} idle, closing", peer);
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    if conn.write_line(&e.to_wire()).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Control connection from {} failed: {}", peer, e);
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let written = match ControlRequest::parse(&line) {
                Ok(ControlRequest::ListServers) => {
                    let snapshot = self.store.snapshot();
                    let rows = snapshot
                        .records()
                        .into_iter()
                        .map(|record| ServerRow::from(record).to_string());
                    conn.write_rows(rows).await
                }
                Ok(ControlRequest::RegisterIndex { host, port }) => {
                    let addr = format!("{}:{}", host, port);
                    if self.notifier.register(addr.clone()) {
                        info!("Index server registered at {}", addr);
                    }
                    conn.write_line(OK_INDEX_REGISTERED).await
                }
                Ok(ControlRequest::Ping) => conn.write_line(PONG).await,
                Err(e) => {
                    tracing::debug!("Rejected control line from {}: {}", peer, e);
                    conn.write_line(&e.to_wire()).await
                }
            };

            if let Err(e) = written {
                tracing::debug!("Control connection from {} dropped: {}", peer, e);
                break;
            }
        }

        conn.shutdown().await;
    }

    async fn stats_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(STATS_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.changed() => break,
            }

            let snapshot = self.store.snapshot();
            info!(
                "Cluster stats: {} tracked, {} alive nodes",
                snapshot.len(),
                snapshot.alive_count()
            );
            for record in snapshot.records() {
                tracing::debug!(
                    "  - {} at {} load={} files={} state={}",
                    record.id,
                    record.address,
                    record.load,
                    record.file_count,
                    record.state.as_wire()
                );
            }
        }
    }
}
