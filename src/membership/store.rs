//! In-memory registry of content nodes.
//!
//! Records live in a sharded `DashMap`; every mutation locks exactly one
//! entry, so heartbeats from distinct nodes never serialize on each other.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

use super::snapshot::MembershipSnapshot;
use super::types::{Heartbeat, HeartbeatOutcome, NodeId, NodeRecord, NodeState};

pub struct MembershipStore {
    records: DashMap<NodeId, NodeRecord>,
    heartbeat_timeout: Duration,
}

impl MembershipStore {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            records: DashMap::new(),
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn ingest_heartbeat(&self, heartbeat: Heartbeat) -> HeartbeatOutcome {
        self.ingest_heartbeat_at(heartbeat, Instant::now())
    }

    /// Creates or refreshes the node's record as of `now`.
    ///
    /// A heartbeat whose sender timestamp is older than the last applied one
    /// is dropped without touching the record. `last_heartbeat` never moves
    /// backwards.
    pub fn ingest_heartbeat_at(&self, heartbeat: Heartbeat, now: Instant) -> HeartbeatOutcome {
        match self.records.entry(heartbeat.id.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();

                if let (Some(sent_at), Some(last_sent_at)) =
                    (heartbeat.sent_at, record.last_sent_at)
                    && sent_at < last_sent_at
                {
                    tracing::debug!(
                        "Ignoring reordered heartbeat from {} ({} < {})",
                        record.id,
                        sent_at,
                        last_sent_at
                    );
                    return HeartbeatOutcome::Stale;
                }

                let was_dead = record.state == NodeState::Dead;

                record.address = heartbeat.address;
                record.load = heartbeat.load;
                record.file_count = heartbeat.file_count;
                record.last_heartbeat = record.last_heartbeat.max(now);
                record.last_sent_at = record.last_sent_at.max(heartbeat.sent_at);
                record.state = NodeState::Alive;
                record.dead_since = None;

                if was_dead {
                    HeartbeatOutcome::Resurrected
                } else {
                    HeartbeatOutcome::Refreshed
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(NodeRecord {
                    id: heartbeat.id,
                    address: heartbeat.address,
                    load: heartbeat.load,
                    file_count: heartbeat.file_count,
                    state: NodeState::Alive,
                    last_heartbeat: now,
                    last_sent_at: heartbeat.sent_at,
                    dead_since: None,
                });
                HeartbeatOutcome::Joined
            }
        }
    }

    /// Overrides a known node's load without refreshing its liveness.
    pub fn update_load(&self, id: &NodeId, load: u64) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.load = load;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeRecord> {
        self.records.get(id).map(|record| record.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn snapshot(&self) -> MembershipSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Copies every record and re-derives its liveness against the timeout,
    /// so readers never depend on the sweep having run.
    pub fn snapshot_at(&self, now: Instant) -> MembershipSnapshot {
        let records = self.records.iter().map(|entry| {
            let mut record = entry.value().clone();
            record.state = self.evaluate(&record, now);
            if record.state == NodeState::Dead && record.dead_since.is_none() {
                record.dead_since = Some(record.last_heartbeat + self.heartbeat_timeout);
            }
            record
        });

        MembershipSnapshot::new(now, records)
    }

    /// Demotes every expired ALIVE record to DEAD and returns the nodes that
    /// transitioned, with how long each had been silent. Records already
    /// DEAD are never reported again.
    pub fn sweep_at(&self, now: Instant) -> Vec<(NodeId, Duration)> {
        let candidates: Vec<NodeId> = self
            .records
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.key().clone())
            .collect();

        let mut transitioned = Vec::new();

        for id in candidates {
            if let Some(mut record) = self.records.get_mut(&id) {
                let silent_for = now.saturating_duration_since(record.last_heartbeat);
                if record.state == NodeState::Alive && silent_for > self.heartbeat_timeout {
                    record.state = NodeState::Dead;
                    record.dead_since = Some(now);
                    transitioned.push((id, silent_for));
                }
            }
        }

        transitioned
    }

    fn evaluate(&self, record: &NodeRecord, now: Instant) -> NodeState {
        if record.state == NodeState::Dead
            || now.saturating_duration_since(record.last_heartbeat) > self.heartbeat_timeout
        {
            NodeState::Dead
        } else {
            NodeState::Alive
        }
    }
}
