use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Opaque identifier of a content node, ordered lexicographically so that
/// routing tie-breaks are deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Alive,
    Dead,
}

impl NodeState {
    pub fn as_wire(&self) -> &'static str {
        match self {
            NodeState::Alive => "alive",
            NodeState::Dead => "dead",
        }
    }

    pub fn from_wire(token: &str) -> Option<Self> {
        match token {
            "alive" => Some(NodeState::Alive),
            "dead" => Some(NodeState::Dead),
            _ => None,
        }
    }
}

/// Host plus transfer port. The host is kept as text so that names such as
/// `localhost` are forwarded to clients unresolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Membership entry for one content node.
///
/// `state` reflects the last evaluation against the heartbeat timeout; the
/// sweep persists ALIVE→DEAD transitions and a fresh heartbeat flips the
/// record back to ALIVE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub address: NodeAddress,
    pub load: u64,
    pub file_count: u64,
    pub state: NodeState,

    #[serde(skip, default = "Instant::now")]
    pub last_heartbeat: Instant,

    /// Sender-side timestamp (unix ms) of the last applied heartbeat.
    #[serde(skip)]
    pub last_sent_at: Option<u64>,

    /// When the record last went DEAD, for purging long-dead nodes.
    #[serde(skip)]
    pub dead_since: Option<Instant>,
}

/// One liveness+load sample pushed by a content node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub id: NodeId,
    pub address: NodeAddress,
    pub load: u64,
    pub file_count: u64,
    pub sent_at: Option<u64>,
}

/// Result of applying a heartbeat to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// First heartbeat ever seen from this node.
    Joined,
    Refreshed,
    /// The node was DEAD and is ALIVE again.
    Resurrected,
    /// Older than the last applied heartbeat; ignored.
    Stale,
}

/// Liveness transitions published by the failure detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    ServerDown { id: NodeId, timestamp: u64 },
    ServerUp { id: NodeId, timestamp: u64 },
}

impl MembershipEvent {
    pub fn node_id(&self) -> &NodeId {
        match self {
            MembershipEvent::ServerDown { id, .. } | MembershipEvent::ServerUp { id, .. } => id,
        }
    }
}

/// Wall-clock seconds since the unix epoch, as carried by `SERVER_DOWN`.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Wall-clock milliseconds, stamped on outgoing heartbeats.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
