//! Cohort coordinator core: the cluster membership and recovery manager of
//! a replicated storage system, and the replicated log it keeps its intents
//! in.

#[macro_use]
mod utils;

mod intentlog;
mod manager;
mod server;

pub use intentlog::{
    EntryId, FileLog, LogRecord, MemLog, ReplicatedLog, ServerDescriptor,
};
pub use manager::{
    ChannelRecovery, LivenessProbe, LoggingSender, ManagerConfig, ManagerHooks,
    MembershipManager, ProbeOutcome, RecoveryTrigger, ServerListSender,
    TcpProbe,
};
pub use server::{
    ReplicationId, ServerEntry, ServerId, ServerList, ServerStatus,
    ServiceLocator, ServiceMask, ServiceType,
};
pub use utils::{logger_init, CohortError, ME};
