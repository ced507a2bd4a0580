//! In-memory server directory: the table of current cluster members.

use std::collections::{BTreeMap, HashMap};

use crate::server::{ServerId, ServerStatus, ServiceMask};
use crate::utils::CohortError;

use serde::{Deserialize, Serialize};

/// Replication group ID type. 0 means "not in any group".
pub type ReplicationId = u64;

/// Information about a cluster member.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Generation-qualified ID assigned at enlistment.
    pub server_id: ServerId,

    /// Services the server advertised when enlisting.
    pub services: ServiceMask,

    /// Network address string of the server.
    pub service_locator: String,

    /// Benchmarked disk read throughput in MB/s (informational).
    pub read_speed: u32,

    /// Benchmarked disk write throughput in MB/s (informational).
    pub write_speed: u32,

    /// Replication group this backup belongs to, or 0.
    pub replication_id: ReplicationId,

    /// Segments below this ID are closed on the server.
    pub min_open_segment_id: u64,

    /// Liveness status.
    pub status: ServerStatus,
}

/// Point-in-time snapshot of (part of) the directory.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerList {
    /// Directory version the snapshot was taken at.
    pub version: u64,

    /// Member entries in ascending index order.
    pub servers: Vec<ServerEntry>,
}

impl ServerList {
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, server_id: ServerId) -> Option<&ServerEntry> {
        self.servers.iter().find(|e| e.server_id == server_id)
    }
}

/// Table of cluster members keyed by slot index. At most one incarnation
/// of each index lives in the table at any time.
#[derive(Debug, Default)]
pub(crate) struct ServerDirectory {
    /// Live entries keyed by slot index.
    entries: BTreeMap<u32, ServerEntry>,

    /// Highest generation ever seen at each index, live or not.
    generations: HashMap<u32, u32>,

    /// Bumped on every membership change; drives update propagation.
    version: u64,
}

impl ServerDirectory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently in the table.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub(crate) fn get(&self, server_id: ServerId) -> Option<&ServerEntry> {
        self.entries
            .get(&server_id.index)
            .filter(|e| e.server_id == server_id)
    }

    pub(crate) fn get_mut(
        &mut self,
        server_id: ServerId,
    ) -> Option<&mut ServerEntry> {
        self.entries
            .get_mut(&server_id.index)
            .filter(|e| e.server_id == server_id)
    }

    #[inline]
    pub(crate) fn contains(&self, server_id: ServerId) -> bool {
        self.get(server_id).is_some()
    }

    /// Entry currently occupying given slot index, of any generation.
    pub(crate) fn occupant(&self, index: u32) -> Option<ServerId> {
        self.entries.get(&index).map(|e| e.server_id)
    }

    /// Inserts an entry. Replaces an existing entry of the same ID; fails if
    /// the slot is held by a different incarnation.
    pub(crate) fn insert(
        &mut self,
        entry: ServerEntry,
    ) -> Result<(), CohortError> {
        let id = entry.server_id;
        if !id.is_valid() {
            return Err(CohortError::msg(format!(
                "cannot insert invalid server ID {}",
                id
            )));
        }
        if let Some(other) = self.occupant(id.index) {
            if other != id {
                return Err(CohortError::msg(format!(
                    "slot {} already held by {}",
                    id.index, other
                )));
            }
        }
        self.note_generation(id);
        self.entries.insert(id.index, entry);
        Ok(())
    }

    pub(crate) fn remove(&mut self, server_id: ServerId) -> Option<ServerEntry> {
        if self.contains(server_id) {
            self.entries.remove(&server_id.index)
        } else {
            None
        }
    }

    /// Applies `mutator` to the entry if present. Returns whether it was.
    pub(crate) fn update<F>(&mut self, server_id: ServerId, mutator: F) -> bool
    where
        F: FnOnce(&mut ServerEntry),
    {
        match self.get_mut(server_id) {
            Some(entry) => {
                mutator(entry);
                true
            }
            None => false,
        }
    }

    /// Iterates over all entries in ascending index order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &ServerEntry> {
        self.entries.values()
    }

    /// Member (non-Down) entries whose services intersect `mask`.
    pub(crate) fn snapshot(&self, mask: &ServiceMask) -> ServerList {
        ServerList {
            version: self.version,
            servers: self
                .iter()
                .filter(|e| e.status.is_member() && e.services.intersects(mask))
                .cloned()
                .collect(),
        }
    }

    /// Returns true if a member other than `except` uses the locator.
    pub(crate) fn locator_in_use(&self, locator: &str, except: ServerId) -> bool {
        self.iter().any(|e| {
            e.status.is_member()
                && e.server_id != except
                && e.service_locator == locator
        })
    }

    /// Records that `server_id` has existed, so its generation is never
    /// handed out again.
    pub(crate) fn note_generation(&mut self, server_id: ServerId) {
        let gen = self.generations.entry(server_id.index).or_insert(0);
        if server_id.generation > *gen {
            *gen = server_id.generation;
        }
    }

    fn next_generation(&self, index: u32) -> Option<u32> {
        self.generations.get(&index).copied().unwrap_or(0).checked_add(1)
    }

    /// Allocates an ID at the lowest unoccupied index that still has a
    /// generation left.
    pub(crate) fn fresh_id(&self) -> ServerId {
        let mut index = 1;
        loop {
            if !self.entries.contains_key(&index) {
                if let Some(gen) = self.next_generation(index) {
                    return ServerId::new(index, gen);
                }
            }
            index += 1;
        }
    }

    /// Allocates an ID reusing the index of a replaced server. Returns
    /// `None` if the index has run out of generations.
    pub(crate) fn replacement_id(&self, replaces: ServerId) -> Option<ServerId> {
        let gen = self
            .next_generation(replaces.index)?
            .max(replaces.generation.checked_add(1)?);
        Some(ServerId::new(replaces.index, gen))
    }
}
