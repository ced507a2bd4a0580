//! Cohort's membership manager: the single authority that admits servers,
//! confirms failures, pairs backups into replication groups, and tracks
//! segment watermarks.
//!
//! Every mutation is a small protocol object with two phases: `execute()`
//! validates and appends a self-contained intent record to the replicated
//! log, then `complete()` applies it to the in-memory state and marks the
//! record applied. A restarted coordinator replays records still live in
//! the log through the same `complete()` paths.

mod enlist;
mod failure;
mod groups;
mod hooks;
mod query;
mod recovery;
mod watermark;

#[cfg(test)]
mod testkit;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::intentlog::{EntryId, LogRecord, ReplicatedLog, ServerDescriptor};
use crate::server::{
    ReplicationId, ServerDirectory, ServerEntry, ServerId, ServerStatus,
};
use crate::utils::CohortError;

use serde::Deserialize;

use tokio::sync::Mutex;
use tokio::time::Duration;

pub use hooks::{
    ChannelRecovery, LivenessProbe, LoggingSender, ManagerHooks,
    ProbeOutcome, RecoveryTrigger, ServerListSender, TcpProbe,
};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Number of backups in every replication group.
    pub replication_group_size: usize,

    /// Liveness probe timeout in millisecs.
    pub probe_timeout_ms: u64,

    /// If true, failure hints are taken as confirmed without probing.
    pub force_server_down_for_testing: bool,

    /// Maximum accepted service locator length in bytes.
    pub max_locator_len: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            replication_group_size: 3,
            probe_timeout_ms: 250,
            force_server_down_for_testing: false,
            max_locator_len: 256,
        }
    }
}

/// Live log entries that durably describe one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogRefs {
    /// The server's `EnlistedConfirm` record.
    info: EntryId,

    /// The server's latest applied `WatermarkIntent` record, if any.
    watermark: Option<EntryId>,
}

/// Everything guarded by the manager lock.
struct ManagerState {
    /// Current cluster members.
    directory: ServerDirectory,

    /// Replication group ID -> member servers.
    groups: BTreeMap<ReplicationId, Vec<ServerId>>,

    /// ID to give the next replication group created.
    next_replication_id: ReplicationId,

    /// Per-server live log entries, superseded or invalidated as the
    /// server's description changes.
    log_refs: HashMap<ServerId, LogRefs>,

    /// Slot index -> `ServerRemoved` entry of its latest departed
    /// incarnation.
    tombstones: HashMap<u32, EntryId>,

    /// Live `ReplicationIdMark` entry and the value it holds.
    id_mark: Option<(EntryId, ReplicationId)>,

    /// Set once startup replay finished.
    replayed: bool,

    /// Set when the log failed after an append was acknowledged; the
    /// in-memory state may then be ahead of the log.
    poisoned: bool,
}

impl ManagerState {
    fn new() -> Self {
        ManagerState {
            directory: ServerDirectory::new(),
            groups: BTreeMap::new(),
            next_replication_id: 1,
            log_refs: HashMap::new(),
            tombstones: HashMap::new(),
            id_mark: None,
            replayed: false,
            poisoned: false,
        }
    }

    /// Fails if state must not be touched right now.
    fn check_healthy(&self) -> Result<(), CohortError> {
        if self.poisoned {
            return logged_err!("manager poisoned by log failure, refusing");
        }
        Ok(())
    }

    /// Fails unless new mutating requests may be served.
    fn check_mutable(&self) -> Result<(), CohortError> {
        self.check_healthy()?;
        if !self.replayed {
            return logged_err!("request arrived before log replay");
        }
        Ok(())
    }

    /// Adds a server to a group's member list.
    fn link_group(&mut self, server_id: ServerId, replication_id: ReplicationId) {
        if replication_id == 0 {
            return;
        }
        let members = self.groups.entry(replication_id).or_default();
        if !members.contains(&server_id) {
            members.push(server_id);
        }
        self.next_replication_id = self
            .next_replication_id
            .max(replication_id.saturating_add(1));
    }

    /// Removes a server from a group's member list.
    fn unlink_group(
        &mut self,
        server_id: ServerId,
        replication_id: ReplicationId,
    ) {
        if let Some(members) = self.groups.get_mut(&replication_id) {
            members.retain(|&m| m != server_id);
            if members.is_empty() {
                self.groups.remove(&replication_id);
            }
        }
    }

    /// Inserts or refreshes an Up entry from its persisted description,
    /// remembering `info_entry` as the record describing it. A watermark
    /// already applied to the same incarnation is kept.
    fn install_server(
        &mut self,
        server: &ServerDescriptor,
        info_entry: EntryId,
    ) -> Result<(), CohortError> {
        let id = server.server_id;
        let (min_open_segment_id, old_group) = match self.directory.get(id) {
            Some(e) => (e.min_open_segment_id, e.replication_id),
            None => (0, 0),
        };
        self.directory.insert(ServerEntry {
            server_id: id,
            services: server.services.clone(),
            service_locator: server.service_locator.clone(),
            read_speed: server.read_speed,
            write_speed: server.write_speed,
            replication_id: server.replication_id,
            min_open_segment_id,
            status: ServerStatus::Up,
        })?;

        if old_group != server.replication_id {
            self.unlink_group(id, old_group);
        }
        self.link_group(id, server.replication_id);

        let watermark = self.log_refs.get(&id).and_then(|r| r.watermark);
        self.log_refs.insert(
            id,
            LogRefs {
                info: info_entry,
                watermark,
            },
        );
        self.directory.bump_version();
        Ok(())
    }
}

/// The membership-and-recovery manager. All operations serialize on one
/// lock; share it across request handlers with an `Arc`.
pub struct MembershipManager {
    /// Configuration parameters struct.
    config: ManagerConfig,

    /// The replicated log all intents go through.
    log: Arc<dyn ReplicatedLog>,

    /// Recovery, probing, and list-pushing collaborators.
    hooks: ManagerHooks,

    /// The manager lock.
    state: Mutex<ManagerState>,
}

impl MembershipManager {
    /// Creates a manager over the given log. `replay()` must run before it
    /// serves any request.
    pub fn new(
        log: Arc<dyn ReplicatedLog>,
        hooks: ManagerHooks,
        config_str: Option<&str>,
    ) -> Result<Self, CohortError> {
        let config = parsed_config!(config_str => ManagerConfig;
                                    replication_group_size, probe_timeout_ms,
                                    force_server_down_for_testing,
                                    max_locator_len)?;
        if config.replication_group_size == 0 {
            return logged_err!(
                "invalid config.replication_group_size '{}'",
                config.replication_group_size
            );
        }
        if config.probe_timeout_ms == 0 {
            return logged_err!(
                "invalid config.probe_timeout_ms '{}'",
                config.probe_timeout_ms
            );
        }

        Ok(MembershipManager {
            config,
            log,
            hooks,
            state: Mutex::new(ManagerState::new()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[inline]
    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.probe_timeout_ms)
    }

    /// Returns true if a post-append log failure made the manager refuse
    /// further mutations.
    pub async fn is_poisoned(&self) -> bool {
        self.state.lock().await.poisoned
    }

    /// Durably appends an intent record. A failure here leaves no trace and
    /// the request may be retried.
    async fn append_intent(
        &self,
        record: LogRecord,
    ) -> Result<EntryId, CohortError> {
        let desc = record.to_string();
        match self.log.append(record).await {
            Ok(entry_id) => {
                pf_trace!("appended {} as entry {}", desc, entry_id);
                Ok(entry_id)
            }
            Err(e) => logged_err!("failed to append {}: {}", desc, e),
        }
    }

    /// Marks a log entry applied, rewriting it to `replacement` if given.
    /// The in-memory change has already happened by now, so a failure
    /// poisons the manager.
    async fn commit(
        &self,
        state: &mut ManagerState,
        entry_id: EntryId,
        replacement: Option<LogRecord>,
    ) -> Result<(), CohortError> {
        if let Err(e) = self.log.update_or_invalidate(entry_id, replacement).await
        {
            state.poisoned = true;
            pf_warn!("manager poisoned, refusing further mutations");
            return logged_err!("failed to update log entry {}: {}", entry_id, e);
        }
        Ok(())
    }

    /// Rewrites a server's durable description to match its entry.
    async fn persist_server(
        &self,
        state: &mut ManagerState,
        server_id: ServerId,
    ) -> Result<(), CohortError> {
        let server = match state.directory.get(server_id) {
            Some(entry) => ServerDescriptor::from(entry),
            None => return Ok(()),
        };
        match state.log_refs.get(&server_id) {
            Some(refs) => {
                let info = refs.info;
                self.commit(state, info, Some(LogRecord::EnlistedConfirm { server }))
                    .await
            }
            None => logged_err!("no log record describes server {}", server_id),
        }
    }
}
