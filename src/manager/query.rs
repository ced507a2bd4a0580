//! Read-only queries and server list propagation.

use super::*;
use crate::server::{ServerList, ServiceMask, ServiceType};

impl MembershipManager {
    /// Snapshot of the members running any of the given services.
    pub async fn get_server_list(&self, services: &ServiceMask) -> ServerList {
        let state = self.state.lock().await;
        state.directory.snapshot(services)
    }

    /// Pushes the full server list to a member running the membership
    /// service. The snapshot is taken under the lock; the push is not.
    pub async fn send_server_list(
        &self,
        server_id: ServerId,
    ) -> Result<(), CohortError> {
        let (locator, list) = {
            let state = self.state.lock().await;
            let entry = match state.directory.get(server_id) {
                Some(entry) => entry,
                None => {
                    return logged_err!(
                        "cannot send server list to unknown {}",
                        server_id
                    )
                }
            };
            if !entry.services.has(ServiceType::Membership) {
                return logged_err!(
                    "cannot send server list to {}: no membership service",
                    server_id
                );
            }
            (
                entry.service_locator.clone(),
                state.directory.snapshot(&ServiceMask::all()),
            )
        };
        self.hooks
            .sender
            .send_server_list(server_id, &locator, list)
            .await
    }

    pub async fn get_server(&self, server_id: ServerId) -> Option<ServerEntry> {
        self.state.lock().await.directory.get(server_id).cloned()
    }

    pub async fn directory_version(&self) -> u64 {
        self.state.lock().await.directory.version()
    }

    /// Members of a replication group, in the order they were assigned.
    pub async fn replication_group(
        &self,
        replication_id: ReplicationId,
    ) -> Option<Vec<ServerId>> {
        self.state.lock().await.groups.get(&replication_id).cloned()
    }

    pub async fn replication_groups(
        &self,
    ) -> BTreeMap<ReplicationId, Vec<ServerId>> {
        self.state.lock().await.groups.clone()
    }
}
