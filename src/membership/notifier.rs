//! Cross-process push of `SERVER_DOWN` to registered index servers.

use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use super::types::MembershipEvent;
use crate::directory::protocol::format_server_down;
use crate::transport::send_line;

pub struct DownNotifier {
    subscribers: DashSet<String>,
    timeout: Duration,
}

impl DownNotifier {
    pub fn new(initial: impl IntoIterator<Item = String>, timeout: Duration) -> Arc<Self> {
        let subscribers = DashSet::new();
        for addr in initial {
            subscribers.insert(addr);
        }
        Arc::new(Self {
            subscribers,
            timeout,
        })
    }

    /// Returns `false` when the address was already registered.
    pub fn register(&self, addr: String) -> bool {
        self.subscribers.insert(addr)
    }

    pub fn subscribers(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.subscribers.iter().map(|a| a.key().clone()).collect();
        addrs.sort();
        addrs
    }

    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<MembershipEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => break,
            };

            match event {
                Ok(MembershipEvent::ServerDown { id, timestamp }) => {
                    let line = format_server_down(&id, timestamp);
                    for addr in self.subscribers() {
                        let line = line.clone();
                        let timeout = self.timeout;
                        tokio::spawn(async move {
                            match send_line(&addr, &line, timeout).await {
                                Ok(()) => tracing::info!("Notified index at {} ({})", addr, line),
                                Err(e) => {
                                    tracing::warn!("Failed to notify index at {}: {}", addr, e)
                                }
                            }
                        });
                    }
                }
                Ok(MembershipEvent::ServerUp { id, .. }) => {
                    tracing::debug!("Node {} is back; indexes will see it on next refresh", id);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Notifier lagged, {} membership events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        tracing::info!("Down notifier stopped");
    }
}
