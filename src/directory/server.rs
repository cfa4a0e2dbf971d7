//! Index TCP endpoints.
//!
//! One task per connection. Registration is a three-step handshake whose
//! `ADD_FILE` rows are buffered in the session and applied in a single
//! replace on `DONE_FILES`; a session that ends early applies nothing.
//! A handshake that outlives its deadline or its row budget is dropped
//! together with the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::catalog::Directory;
use super::protocol::{
    IndexRequest, OK, OK_DEREGISTERED, OK_FILES_ADDED, OK_REGISTERED, WELCOME, format_file_row,
    format_routing,
};
use super::source::MembershipSource;
use crate::config::{DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CATALOG_FILES};
use crate::error::CdnError;
use crate::membership::types::{NodeAddress, NodeId};
use crate::transport::LineConn;

/// Bounds on one registration handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeLimits {
    /// Longest span from `REGISTER` to `DONE_FILES`.
    pub timeout: Duration,
    /// Most distinct `ADD_FILE` rows buffered before `DONE_FILES`.
    pub max_files: usize,
}

impl Default for HandshakeLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_files: DEFAULT_MAX_CATALOG_FILES,
        }
    }
}

/// Shared state behind every index connection.
pub struct IndexState {
    pub directory: Arc<Directory>,
    pub membership: Arc<dyn MembershipSource>,
    pub io_timeout: Duration,
    pub handshake: HandshakeLimits,
}

/// A registration handshake in progress.
#[derive(Debug)]
struct PendingRegistration {
    id: NodeId,
    address: NodeAddress,
    files: HashMap<String, u64>,
    started: Instant,
}

/// Per-connection state.
#[derive(Debug)]
pub struct Session {
    peer_host: String,
    pending: Option<PendingRegistration>,
}

impl Session {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer_host: peer.ip().to_string(),
            pending: None,
        }
    }

    pub fn has_pending_registration(&self) -> bool {
        self.pending.is_some()
    }
}

/// What to write back for one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    None,
    Line(String),
    Rows(Vec<String>),
    /// Write the line, then end the connection.
    Close(String),
}

impl IndexState {
    pub fn new(
        directory: Arc<Directory>,
        membership: Arc<dyn MembershipSource>,
        io_timeout: Duration,
        handshake: HandshakeLimits,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory,
            membership,
            io_timeout,
            handshake,
        })
    }

    /// Applies one request line to the session and the directory.
    pub fn dispatch(&self, line: &str, session: &mut Session) -> Reply {
        self.dispatch_at(line, session, Instant::now())
    }

    pub fn dispatch_at(&self, line: &str, session: &mut Session, now: Instant) -> Reply {
        if let Some(reply) = self.expire_handshake(session, now) {
            return Reply::Close(reply);
        }

        let request = match IndexRequest::parse(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Rejected line from {}: {}", session.peer_host, e);
                return Reply::Line(e.to_wire());
            }
        };

        match request {
            IndexRequest::Register {
                id,
                tcp_port,
                udp_port,
            } => {
                if let Some(abandoned) = session.pending.take() {
                    tracing::warn!(
                        "Registration of {} restarted before DONE_FILES, dropping {} buffered files",
                        abandoned.id,
                        abandoned.files.len()
                    );
                }
                let address = NodeAddress::new(session.peer_host.clone(), tcp_port);
                tracing::info!(
                    "Registration opened for {} at {} (udp {})",
                    id,
                    address,
                    udp_port
                );
                session.pending = Some(PendingRegistration {
                    id,
                    address,
                    files: HashMap::new(),
                    started: now,
                });
                Reply::Line(OK_REGISTERED.to_string())
            }
            IndexRequest::AddFile { node, name, size } => {
                let Some(pending) = session.pending.as_mut() else {
                    return Reply::Line(CdnError::NotRegistered.to_wire());
                };
                if let Some(node) = node
                    && node != pending.id
                {
                    return Reply::Line(
                        CdnError::InvalidFormat(format!(
                            "ADD_FILE for {} inside registration of {}",
                            node, pending.id
                        ))
                        .to_wire(),
                    );
                }
                if pending.files.len() >= self.handshake.max_files
                    && !pending.files.contains_key(&name)
                {
                    tracing::warn!(
                        "Registration of {} from {} exceeds {} files, aborting",
                        pending.id,
                        session.peer_host,
                        self.handshake.max_files
                    );
                    session.pending = None;
                    return Reply::Close(
                        CdnError::InvalidFormat(format!(
                            "catalog larger than {} files",
                            self.handshake.max_files
                        ))
                        .to_wire(),
                    );
                }
                pending.files.insert(name, size);
                Reply::None
            }
            IndexRequest::DoneFiles => match session.pending.take() {
                Some(pending) => {
                    self.directory
                        .register_node(pending.id, pending.address, pending.files);
                    Reply::Line(OK_FILES_ADDED.to_string())
                }
                None => Reply::Line(CdnError::NotRegistered.to_wire()),
            },
            IndexRequest::UpdateLoad { id, load } => {
                if !self.membership.apply_load(&id, load) {
                    tracing::debug!("Load update for unknown node {}", id);
                }
                Reply::Line(OK.to_string())
            }
            IndexRequest::Deregister { id } => {
                if self.directory.deregister_node(&id).is_none() {
                    tracing::debug!("Deregister for unknown node {}", id);
                }
                if self.membership.forget(&id) {
                    tracing::debug!("Forgot membership record of {}", id);
                }
                Reply::Line(OK_DEREGISTERED.to_string())
            }
            IndexRequest::Hello => Reply::Line(WELCOME.to_string()),
            IndexRequest::Get { name } => {
                let snapshot = self.membership.snapshot();
                match self.directory.resolve(&name, &snapshot) {
                    Ok(decision) => {
                        tracing::info!(
                            "Routing {} to {} at {} (size {})",
                            name,
                            decision.node_id,
                            decision.address,
                            decision.size
                        );
                        Reply::Line(format_routing(&decision))
                    }
                    Err(e) => {
                        tracing::info!("Cannot route {}: {}", name, e);
                        Reply::Line(e.to_wire())
                    }
                }
            }
            IndexRequest::ListFiles => {
                let snapshot = self.membership.snapshot();
                Reply::Rows(
                    self.directory
                        .list_files(&snapshot)
                        .iter()
                        .map(format_file_row)
                        .collect(),
                )
            }
            IndexRequest::ListServers => {
                let snapshot = self.membership.snapshot();
                Reply::Rows(
                    self.directory
                        .list_servers(&snapshot)
                        .iter()
                        .map(|row| row.to_string())
                        .collect(),
                )
            }
            IndexRequest::ServerDown { id, timestamp } => {
                self.apply_server_down(&id, timestamp);
                Reply::None
            }
        }
    }

    /// Drops a registration that has run past its deadline and returns the
    /// error line owed to the peer.
    fn expire_handshake(&self, session: &mut Session, now: Instant) -> Option<String> {
        let started = session.pending.as_ref()?.started;
        if now.saturating_duration_since(started) < self.handshake.timeout {
            return None;
        }

        let pending = session.pending.take()?;
        tracing::warn!(
            "Registration of {} from {} not completed within {:?}, discarding {} files",
            pending.id,
            session.peer_host,
            self.handshake.timeout,
            pending.files.len()
        );
        Some(CdnError::Timeout(self.handshake.timeout).to_wire())
    }

    /// How long the next read may wait: the I/O timeout, cut short by the
    /// deadline of a handshake in progress.
    fn read_limit(&self, session: &Session, now: Instant) -> Duration {
        match &session.pending {
            Some(pending) => {
                let elapsed = now.saturating_duration_since(pending.started);
                self.io_timeout
                    .min(self.handshake.timeout.saturating_sub(elapsed))
            }
            None => self.io_timeout,
        }
    }

    fn apply_server_down(&self, id: &NodeId, timestamp: u64) {
        if self.membership.mark_down(id) {
            tracing::warn!("Monitor reports {} down (at {})", id, timestamp);
        } else {
            tracing::debug!("SERVER_DOWN for {} already reflected", id);
        }
    }

    /// Serves one client or content-node connection until it closes, stalls
    /// or fails.
    pub async fn handle_session(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        tracing::debug!("Index connection from {}", peer);
        let mut conn = LineConn::new(stream, self.io_timeout);
        let mut session = Session::new(peer);

        loop {
            let limit = self.read_limit(&session, Instant::now());
            let line = match conn.read_line_within(limit).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(CdnError::Timeout(after)) => {
                    match self.expire_handshake(&mut session, Instant::now()) {
                        Some(reply) => {
                            let _ = conn.write_line(&reply).await;
                        }
                        None => {
                            tracing::debug!("Connection from {} idle for {:?}, closing", peer, after)
                        }
                    }
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    if conn.write_line(&e.to_wire()).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Connection from {} failed: {}", peer, e);
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let written = match self.dispatch(&line, &mut session) {
                Reply::None => Ok(()),
                Reply::Line(reply) => conn.write_line(&reply).await,
                Reply::Rows(rows) => conn.write_rows(rows).await,
                Reply::Close(reply) => {
                    let _ = conn.write_line(&reply).await;
                    break;
                }
            };

            if let Err(e) = written {
                tracing::debug!("Connection from {} dropped: {}", peer, e);
                break;
            }
        }

        if let Some(pending) = session.pending.take() {
            tracing::warn!(
                "Registration of {} from {} ended before DONE_FILES, discarding {} files",
                pending.id,
                peer,
                pending.files.len()
            );
        }

        conn.shutdown().await;
    }

    /// Serves one monitor push connection: `SERVER_DOWN` lines, no replies.
    pub async fn handle_notification(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut conn = LineConn::new(stream, self.io_timeout);

        loop {
            match conn.read_line().await {
                Ok(Some(line)) => match IndexRequest::parse(&line) {
                    Ok(IndexRequest::ServerDown { id, timestamp }) => {
                        self.apply_server_down(&id, timestamp)
                    }
                    Ok(_) => tracing::warn!("Unexpected notification from {}: {}", peer, line),
                    Err(e) => tracing::warn!("Bad notification from {}: {}", peer, e),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Notification connection from {} ended: {}", peer, e);
                    break;
                }
            }
        }

        conn.shutdown().await;
    }
}
