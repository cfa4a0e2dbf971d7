use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::membership::types::{NodeAddress, NodeId};

/// One (file name, hosting node) row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Lookup key into membership; not an ownership link.
    pub node_id: NodeId,
}

/// Complete catalog announced by one node. Replaced wholesale on every
/// registration, never edited in place.
#[derive(Debug, Clone)]
pub struct NodeCatalog {
    pub id: NodeId,
    pub address: NodeAddress,
    pub files: HashMap<String, u64>,
    pub registered_at: Instant,
}

/// Where a client should fetch a file from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub file_name: String,
    pub node_id: NodeId,
    pub address: NodeAddress,
    pub size: u64,
}

/// A resolvable file as shown by `LIST_FILES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListing {
    pub name: String,
    pub size: u64,
}
