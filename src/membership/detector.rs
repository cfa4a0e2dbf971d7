//! Failure detector.
//!
//! Sweeps the store on a fixed period and publishes exactly one
//! `ServerDown` per ALIVE→DEAD transition. Routing does not depend on these
//! events: the directory re-derives liveness from a snapshot on every lookup.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};

use super::store::MembershipStore;
use super::types::{HeartbeatOutcome, MembershipEvent, NodeId, now_secs};

const EVENT_CAPACITY: usize = 256;

pub struct FailureDetector {
    store: Arc<MembershipStore>,
    sweep_interval: Duration,
    events: broadcast::Sender<MembershipEvent>,
}

impl FailureDetector {
    pub fn new(store: Arc<MembershipStore>, sweep_interval: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            store,
            sweep_interval,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn sweep(&self) -> Vec<MembershipEvent> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> Vec<MembershipEvent> {
        let timestamp = now_secs();
        let mut events = Vec::new();

        for (id, silent_for) in self.store.sweep_at(now) {
            tracing::warn!(
                "Node {} declared DEAD (no heartbeat for {:.1?})",
                id,
                silent_for
            );
            let event = MembershipEvent::ServerDown { id, timestamp };
            self.publish(event.clone());
            events.push(event);
        }

        events
    }

    /// Publishes `ServerUp` when a heartbeat brought a DEAD node back.
    pub fn observe_heartbeat(&self, id: &NodeId, outcome: HeartbeatOutcome) {
        if outcome == HeartbeatOutcome::Resurrected {
            tracing::info!("Node {} came back online", id);
            self.publish(MembershipEvent::ServerUp {
                id: id.clone(),
                timestamp: now_secs(),
            });
        }
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscribers is fine: pushes are observability only.
        let _ = self.events.send(event);
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.sweep_interval);
        tracing::info!(
            "Failure detector sweeping every {:?} (timeout {:?})",
            self.sweep_interval,
            self.store.heartbeat_timeout()
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.changed() => break,
            }

            let transitions = self.sweep();
            if !transitions.is_empty() {
                tracing::info!(
                    "Cluster size now: {} alive nodes",
                    self.store.snapshot().alive_count()
                );
            }
        }

        tracing::info!("Failure detector stopped");
    }
}
