use std::collections::HashMap;
use std::time::Instant;

use super::types::{NodeId, NodeRecord, NodeState};

/// Immutable point-in-time view of membership.
#[derive(Debug, Clone)]
pub struct MembershipSnapshot {
    taken_at: Instant,
    records: HashMap<NodeId, NodeRecord>,
}

impl MembershipSnapshot {
    pub fn new(taken_at: Instant, records: impl IntoIterator<Item = NodeRecord>) -> Self {
        Self {
            taken_at,
            records: records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Instant::now(), Vec::new())
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.get(id)
    }

    pub fn state_of(&self, id: &NodeId) -> Option<NodeState> {
        self.records.get(id).map(|record| record.state)
    }

    /// Unknown nodes are never alive.
    pub fn is_alive(&self, id: &NodeId) -> bool {
        self.state_of(id) == Some(NodeState::Alive)
    }

    /// Records ordered by node id.
    pub fn records(&self) -> Vec<&NodeRecord> {
        let mut records: Vec<&NodeRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| record.state == NodeState::Alive)
            .count()
    }

    /// Copy of this snapshot with one node forced to DEAD.
    pub fn with_dead(&self, id: &NodeId, at: Instant) -> Self {
        let mut next = self.clone();
        if let Some(record) = next.records.get_mut(id)
            && record.state == NodeState::Alive
        {
            record.state = NodeState::Dead;
            record.dead_since = Some(at);
        }
        next
    }

    /// Copy of this snapshot with one node's load replaced.
    pub fn with_load(&self, id: &NodeId, load: u64) -> Self {
        let mut next = self.clone();
        if let Some(record) = next.records.get_mut(id) {
            record.load = load;
        }
        next
    }
}
