//! Cohort's server directory data model: identities, advertised services,
//! network locators, and the versioned in-memory directory table.

mod directory;
mod id;
mod locator;
mod service;

pub use directory::{ReplicationId, ServerEntry, ServerList};
pub use id::{ServerId, ServerStatus};
pub use locator::ServiceLocator;
pub use service::{ServiceMask, ServiceType};

pub(crate) use directory::ServerDirectory;
