//! Static neighbor table and node identity.
//!
//! Both are write-once: the harness assigns the identity with `init` and the
//! neighbor table with `topology`, and neither changes for the lifetime of the
//! process.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use once_cell::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{MeshError, MeshResult};

/// Immutable node id → neighbor ids mapping.
#[derive(Debug, Default)]
pub struct TopologyTable {
    table: OnceCell<BTreeMap<String, BTreeSet<String>>>,
}

impl TopologyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the externally supplied mapping exactly as given, minus self-loops.
    pub fn install(&self, topology: HashMap<String, Vec<String>>) -> MeshResult<()> {
        let table: BTreeMap<String, BTreeSet<String>> = topology
            .into_iter()
            .map(|(node, neighbors)| {
                let set = neighbors
                    .into_iter()
                    .filter(|neighbor| neighbor != &node)
                    .collect();
                (node, set)
            })
            .collect();
        let nodes = table.len();

        self.table
            .set(table)
            .map_err(|_| MeshError::TopologyAlreadyInstalled)?;
        info!(nodes, "Installed topology");
        Ok(())
    }

    pub fn is_installed(&self) -> bool {
        self.table.get().is_some()
    }

    /// Neighbors of `node`; empty when no table is installed or the node is absent.
    pub fn neighbors(&self, node: &str) -> BTreeSet<String> {
        match self.table.get().and_then(|table| table.get(node)) {
            Some(neighbors) => neighbors.clone(),
            None => {
                debug!(node, "No topology entry, treating as isolated");
                BTreeSet::new()
            }
        }
    }
}

/// This node's id and the cluster roster, assigned by the `init` handshake.
#[derive(Debug, Default)]
pub struct NodeIdentity {
    inner: OnceCell<(String, Vec<String>)>,
}

impl NodeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity fixed up front, used when the harness handshake is skipped.
    pub fn with_id(node_id: impl Into<String>, node_ids: Vec<String>) -> Self {
        Self {
            inner: OnceCell::with_value((node_id.into(), node_ids)),
        }
    }

    pub fn assign(&self, node_id: String, node_ids: Vec<String>) -> MeshResult<()> {
        if let Some((existing, _)) = self.inner.get() {
            return Err(MeshError::AlreadyInitialized(existing.clone()));
        }
        self.inner
            .set((node_id, node_ids))
            .map_err(|(node_id, _)| MeshError::AlreadyInitialized(node_id))
    }

    pub fn id(&self) -> Option<&str> {
        self.inner.get().map(|(id, _)| id.as_str())
    }

    pub fn cluster(&self) -> &[String] {
        self.inner
            .get()
            .map(|(_, ids)| ids.as_slice())
            .unwrap_or_default()
    }
}
