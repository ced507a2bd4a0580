//! Cohort's replicated intent log interface. Every membership change is
//! first appended here as a self-contained record; records still live at
//! startup are replayed to rebuild the in-memory directory.

mod file;
mod memory;

use std::fmt;

use crate::server::{ReplicationId, ServerEntry, ServerId, ServiceMask};
use crate::utils::CohortError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

pub use file::FileLog;
pub use memory::MemLog;

/// Log entry ID type. IDs start at 1 and are totally ordered; 0 is never
/// assigned.
pub type EntryId = u64;

/// Self-contained description of an enlisted server, as persisted.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub server_id: ServerId,
    pub services: ServiceMask,
    pub service_locator: String,
    pub read_speed: u32,
    pub write_speed: u32,
    pub replication_id: ReplicationId,
}

impl From<&ServerEntry> for ServerDescriptor {
    fn from(entry: &ServerEntry) -> Self {
        ServerDescriptor {
            server_id: entry.server_id,
            services: entry.services.clone(),
            service_locator: entry.service_locator.clone(),
            read_speed: entry.read_speed,
            write_speed: entry.write_speed,
            replication_id: entry.replication_id,
        }
    }
}

/// Typed record stored in the replicated log.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum LogRecord {
    /// A server is being enlisted; not yet visible in the directory.
    EnlistIntent { server: ServerDescriptor },

    /// Durable description of an enlisted server. Replaces its
    /// `EnlistIntent` in place and stays live until the server goes down.
    EnlistedConfirm { server: ServerDescriptor },

    /// A server's failure is confirmed and it is being removed.
    ServerDownIntent {
        server_id: ServerId,
        replication_id: ReplicationId,
    },

    /// Terminal form of a completed `ServerDownIntent`; remembers that the
    /// incarnation existed so its ID is never handed out again.
    ServerRemoved { server_id: ServerId },

    /// A server's minimum open segment ID is being raised. Stays live as
    /// the server's durable watermark once applied.
    WatermarkIntent { server_id: ServerId, segment_id: u64 },

    /// Lowest replication group ID never handed out. Written before a group
    /// with a higher ID forms; a single live instance is rewritten in place.
    ReplicationIdMark { next_replication_id: ReplicationId },
}

impl LogRecord {
    /// The server this record is about, if any.
    pub fn server_id(&self) -> Option<ServerId> {
        match self {
            Self::EnlistIntent { server } | Self::EnlistedConfirm { server } => {
                Some(server.server_id)
            }
            Self::ServerDownIntent { server_id, .. }
            | Self::ServerRemoved { server_id }
            | Self::WatermarkIntent { server_id, .. } => Some(*server_id),
            Self::ReplicationIdMark { .. } => None,
        }
    }

    /// Short record kind name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EnlistIntent { .. } => "EnlistIntent",
            Self::EnlistedConfirm { .. } => "EnlistedConfirm",
            Self::ServerDownIntent { .. } => "ServerDownIntent",
            Self::ServerRemoved { .. } => "ServerRemoved",
            Self::WatermarkIntent { .. } => "WatermarkIntent",
            Self::ReplicationIdMark { .. } => "ReplicationIdMark",
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ReplicationIdMark {
                next_replication_id,
            } => write!(f, "{}({})", self.kind(), next_replication_id),
            _ => match self.server_id() {
                Some(server_id) => write!(f, "{}({})", self.kind(), server_id),
                None => write!(f, "{}", self.kind()),
            },
        }
    }
}

/// Append-only, globally ordered log of typed records. Implementations must
/// make an appended record durable before returning its ID.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Durably appends a record, returning its newly assigned ID.
    async fn append(&self, record: LogRecord) -> Result<EntryId, CohortError>;

    /// Marks an entry applied: rewrites it in place to `replacement` (same
    /// ID, same position) or, if `None`, invalidates it so it is skipped by
    /// future reads. Touching an already invalidated entry is a no-op;
    /// an ID that was never assigned is an error.
    async fn update_or_invalidate(
        &self,
        entry_id: EntryId,
        replacement: Option<LogRecord>,
    ) -> Result<(), CohortError>;

    /// Reads all live entries with ID >= `start`, in ID order.
    async fn read_all_since(
        &self,
        start: EntryId,
    ) -> Result<Vec<(EntryId, LogRecord)>, CohortError>;

    /// Shorthand for `update_or_invalidate(entry_id, None)`.
    async fn invalidate(&self, entry_id: EntryId) -> Result<(), CohortError> {
        self.update_or_invalidate(entry_id, None).await
    }
}
