//! Where the directory gets its membership view from.
//!
//! In-process the directory reads the store directly. Across processes it
//! keeps a cached snapshot of the monitor's `LIST_SERVERS`, refreshed on a
//! fixed period and patched immediately by `SERVER_DOWN` pushes. Lookups
//! only ever read the cached view; they never wait for a refresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::error::{CdnError, Result};
use crate::membership::protocol::{LIST_SERVERS, OK_INDEX_REGISTERED, REGISTER_INDEX, ServerRow};
use crate::membership::snapshot::MembershipSnapshot;
use crate::membership::store::MembershipStore;
use crate::membership::types::{NodeId, NodeRecord, NodeState};
use crate::transport::{LineConn, request_rows};

pub trait MembershipSource: Send + Sync {
    /// Latest available view; never blocks on the network.
    fn snapshot(&self) -> Arc<MembershipSnapshot>;

    /// Applies a pushed `SERVER_DOWN`. Returns whether the view changed.
    fn mark_down(&self, id: &NodeId) -> bool;

    /// Applies an `UPDATE_LOAD` hint. Returns whether the node is known.
    fn apply_load(&self, id: &NodeId, load: u64) -> bool;

    /// Drops a node that left gracefully. Only an authoritative source can
    /// forget; a mirrored view learns it from the next refresh.
    fn forget(&self, _id: &NodeId) -> bool {
        false
    }
}

impl MembershipSource for MembershipStore {
    fn snapshot(&self) -> Arc<MembershipSnapshot> {
        Arc::new(MembershipStore::snapshot(self))
    }

    // The local store is authoritative; the detector already recorded it.
    fn mark_down(&self, _id: &NodeId) -> bool {
        false
    }

    fn apply_load(&self, id: &NodeId, load: u64) -> bool {
        self.update_load(id, load)
    }

    fn forget(&self, id: &NodeId) -> bool {
        self.remove(id).is_some()
    }
}

/// Membership view mirrored from a monitor in another process.
pub struct RemoteMembership {
    monitor_addr: String,
    timeout: Duration,
    current: RwLock<Arc<MembershipSnapshot>>,
    registered: AtomicBool,
}

impl RemoteMembership {
    pub fn new(monitor_addr: impl Into<String>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            monitor_addr: monitor_addr.into(),
            timeout,
            current: RwLock::new(Arc::new(MembershipSnapshot::empty())),
            registered: AtomicBool::new(false),
        })
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// Pulls `LIST_SERVERS` from the monitor and swaps in the new view.
    /// Returns the number of nodes received.
    pub async fn refresh(&self) -> Result<usize> {
        let rows = request_rows(&self.monitor_addr, LIST_SERVERS, self.timeout).await?;
        let now = Instant::now();
        let previous = self.snapshot();

        let records: Vec<NodeRecord> = rows
            .iter()
            .filter_map(|line| match ServerRow::parse(line) {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!("Ignoring monitor row {:?}: {}", line, e);
                    None
                }
            })
            .map(|row| {
                // Keep the first time we saw the node dead so purge ages correctly.
                let dead_since = match row.state {
                    NodeState::Dead => previous
                        .get(&row.id)
                        .and_then(|old| old.dead_since)
                        .or(Some(now)),
                    NodeState::Alive => None,
                };
                NodeRecord {
                    id: row.id,
                    address: row.address,
                    load: row.load,
                    file_count: 0,
                    state: row.state,
                    last_heartbeat: now,
                    last_sent_at: None,
                    dead_since,
                }
            })
            .collect();

        let count = records.len();
        self.replace(MembershipSnapshot::new(now, records));
        Ok(count)
    }

    /// Asks the monitor to push `SERVER_DOWN` to `host:port`.
    pub async fn register_for_notifications(&self, host: &str, port: u16) -> Result<()> {
        let mut conn = LineConn::connect(&self.monitor_addr, self.timeout).await?;
        conn.write_line(&format!("{} {} {}", REGISTER_INDEX, host, port))
            .await?;
        let reply = conn.read_line().await?;
        conn.shutdown().await;

        match reply.as_deref() {
            Some(OK_INDEX_REGISTERED) => {
                self.registered.store(true, Ordering::Relaxed);
                Ok(())
            }
            Some(other) => Err(CdnError::InvalidFormat(format!(
                "monitor refused registration: {}",
                other
            ))),
            None => Err(CdnError::Unreachable(self.monitor_addr.clone())),
        }
    }

    /// Refreshes every `interval` until shutdown. Registration for pushes is
    /// retried on each tick until the monitor accepts it.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        notify_target: Option<(String, u16)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = shutdown.changed() => break,
            }

            match self.refresh().await {
                Ok(count) => tracing::debug!("Membership refreshed: {} nodes", count),
                Err(e) => tracing::warn!(
                    "Could not reach monitor at {}: {} (keeping last view)",
                    self.monitor_addr,
                    e
                ),
            }

            if let Some((host, port)) = &notify_target
                && !self.is_registered()
            {
                match self.register_for_notifications(host, *port).await {
                    Ok(()) => tracing::info!(
                        "Registered {}:{} for failure notifications",
                        host,
                        port
                    ),
                    Err(e) => tracing::debug!("Notification registration failed: {}", e),
                }
            }
        }

        tracing::info!("Membership refresher stopped");
    }

    fn replace(&self, next: MembershipSnapshot) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Arc::new(next);
    }
}

impl MembershipSource for RemoteMembership {
    fn snapshot(&self) -> Arc<MembershipSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn mark_down(&self, id: &NodeId) -> bool {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if !current.is_alive(id) {
            return false;
        }
        *current = Arc::new(current.with_dead(id, Instant::now()));
        true
    }

    fn apply_load(&self, id: &NodeId, load: u64) -> bool {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if current.get(id).is_none() {
            return false;
        }
        *current = Arc::new(current.with_load(id, load));
        true
    }
}
