//! File directory and load-aware routing.
//!
//! Catalogs are stored per node and swapped in one step, so a reader sees
//! either the whole previous catalog of a node or the whole new one. The
//! name index only narrows the search; every hit is re-checked against the
//! node's current catalog and against the membership snapshot.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::types::{FileEntry, FileListing, NodeCatalog, RoutingDecision};
use crate::error::{CdnError, Result};
use crate::membership::protocol::ServerRow;
use crate::membership::snapshot::MembershipSnapshot;
use crate::membership::types::{NodeAddress, NodeId, NodeState};

#[derive(Default)]
pub struct Directory {
    catalogs: DashMap<NodeId, Arc<NodeCatalog>>,
    by_name: DashMap<String, BTreeSet<NodeId>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every row previously attributed to `id` with `files`.
    /// Returns the number of distinct files now registered for the node.
    pub fn register_node(
        &self,
        id: NodeId,
        address: NodeAddress,
        files: impl IntoIterator<Item = (String, u64)>,
    ) -> usize {
        let catalog = Arc::new(NodeCatalog {
            id: id.clone(),
            address,
            files: files.into_iter().collect::<HashMap<_, _>>(),
            registered_at: Instant::now(),
        });
        let file_count = catalog.files.len();

        match self.catalogs.entry(id.clone()) {
            Entry::Occupied(mut slot) => {
                let previous = slot.insert(catalog.clone());
                for name in previous.files.keys() {
                    if !catalog.files.contains_key(name) {
                        self.unlink(name, &id);
                    }
                }
                self.link_all(&catalog);
                tracing::info!(
                    "Node {} re-registered: {} files (was {})",
                    id,
                    file_count,
                    previous.files.len()
                );
            }
            Entry::Vacant(slot) => {
                // Hold the entry guard until every name is linked.
                let _slot = slot.insert(catalog.clone());
                self.link_all(&catalog);
                tracing::info!("Node {} registered with {} files", id, file_count);
            }
        }

        file_count
    }

    /// Drops every row for `id`.
    pub fn deregister_node(&self, id: &NodeId) -> Option<Arc<NodeCatalog>> {
        match self.catalogs.entry(id.clone()) {
            Entry::Occupied(slot) => {
                let catalog = slot.get().clone();
                for name in catalog.files.keys() {
                    self.unlink(name, id);
                }
                slot.remove();
                tracing::info!("Node {} deregistered ({} files)", id, catalog.files.len());
                Some(catalog)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Picks the least-loaded ALIVE host of `file_name`, lowest id on ties.
    pub fn resolve(&self, file_name: &str, snapshot: &MembershipSnapshot) -> Result<RoutingDecision> {
        let mut hosted = false;
        let mut best: Option<(u64, NodeId, Arc<NodeCatalog>, u64)> = None;

        for id in self.hosts_of(file_name) {
            let Some(catalog) = self.catalog(&id) else {
                continue;
            };
            let Some(&size) = catalog.files.get(file_name) else {
                continue;
            };
            hosted = true;

            let Some(record) = snapshot.get(&id) else {
                continue;
            };
            if record.state != NodeState::Alive {
                continue;
            }

            let better = match &best {
                Some((load, best_id, _, _)) => (record.load, &id) < (*load, best_id),
                None => true,
            };
            if better {
                best = Some((record.load, id, catalog, size));
            }
        }

        match best {
            Some((_, node_id, catalog, size)) => Ok(RoutingDecision {
                file_name: file_name.to_string(),
                node_id,
                address: catalog.address.clone(),
                size,
            }),
            None if hosted => Err(CdnError::Unavailable(file_name.to_string())),
            None => Err(CdnError::NotFound(file_name.to_string())),
        }
    }

    /// Raw rows for a file name, regardless of liveness.
    pub fn file_entries(&self, file_name: &str) -> Vec<FileEntry> {
        self.hosts_of(file_name)
            .into_iter()
            .filter_map(|id| {
                let catalog = self.catalog(&id)?;
                let size = *catalog.files.get(file_name)?;
                Some(FileEntry {
                    name: file_name.to_string(),
                    size,
                    node_id: id,
                })
            })
            .collect()
    }

    /// Every file with at least one ALIVE host, sorted by name. The size is
    /// the one reported by the lowest-id alive host.
    pub fn list_files(&self, snapshot: &MembershipSnapshot) -> Vec<FileListing> {
        let mut listing: BTreeMap<String, (NodeId, u64)> = BTreeMap::new();

        for catalog in self.catalogs_snapshot() {
            if !snapshot.is_alive(&catalog.id) {
                continue;
            }
            for (name, size) in &catalog.files {
                match listing.get(name) {
                    Some((holder, _)) if holder <= &catalog.id => {}
                    _ => {
                        listing.insert(name.clone(), (catalog.id.clone(), *size));
                    }
                }
            }
        }

        listing
            .into_iter()
            .map(|(name, (_, size))| FileListing { name, size })
            .collect()
    }

    /// Every registered node with its current state and load. Nodes the
    /// membership view has never heard from are reported dead.
    pub fn list_servers(&self, snapshot: &MembershipSnapshot) -> Vec<ServerRow> {
        let mut catalogs = self.catalogs_snapshot();
        catalogs.sort_by(|a, b| a.id.cmp(&b.id));

        catalogs
            .into_iter()
            .map(|catalog| {
                let record = snapshot.get(&catalog.id);
                ServerRow {
                    id: catalog.id.clone(),
                    address: catalog.address.clone(),
                    load: record.map(|r| r.load).unwrap_or(0),
                    state: record.map(|r| r.state).unwrap_or(NodeState::Dead),
                }
            })
            .collect()
    }

    /// Deregisters nodes that have been DEAD (or never heard from) for
    /// longer than `older_than` as of the snapshot.
    pub fn purge_dead(&self, snapshot: &MembershipSnapshot, older_than: Duration) -> Vec<NodeId> {
        let now = snapshot.taken_at();
        let mut purged = Vec::new();

        for catalog in self.catalogs_snapshot() {
            let expired_since = match snapshot.get(&catalog.id) {
                Some(record) if record.state == NodeState::Dead => record.dead_since,
                Some(_) => None,
                None => Some(catalog.registered_at),
            };

            if let Some(since) = expired_since
                && now.saturating_duration_since(since) > older_than
                && self.deregister_node(&catalog.id).is_some()
            {
                tracing::info!("Purged catalog of long-dead node {}", catalog.id);
                purged.push(catalog.id.clone());
            }
        }

        purged
    }

    pub fn catalog(&self, id: &NodeId) -> Option<Arc<NodeCatalog>> {
        self.catalogs.get(id).map(|catalog| catalog.clone())
    }

    pub fn node_count(&self) -> usize {
        self.catalogs.len()
    }

    /// Distinct file names currently indexed.
    pub fn file_name_count(&self) -> usize {
        self.by_name.len()
    }

    fn hosts_of(&self, file_name: &str) -> Vec<NodeId> {
        self.by_name
            .get(file_name)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn catalogs_snapshot(&self) -> Vec<Arc<NodeCatalog>> {
        self.catalogs.iter().map(|entry| entry.value().clone()).collect()
    }

    fn link_all(&self, catalog: &NodeCatalog) {
        for name in catalog.files.keys() {
            self.by_name
                .entry(name.clone())
                .or_default()
                .insert(catalog.id.clone());
        }
    }

    fn unlink(&self, name: &str, id: &NodeId) {
        let now_empty = match self.by_name.get_mut(name) {
            Some(mut hosts) => {
                hosts.remove(id);
                hosts.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.by_name.remove_if(name, |_, hosts| hosts.is_empty());
        }
    }
}
