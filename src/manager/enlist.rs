//! Admitting servers into the cluster.

use super::failure::ServerDown;
use super::*;
use crate::server::{ServiceLocator, ServiceMask};

/// Enlistment protocol object.
pub(super) struct EnlistServer {
    server: ServerDescriptor,
}

impl EnlistServer {
    pub(super) fn new(server: ServerDescriptor) -> Self {
        EnlistServer { server }
    }

    /// Persists the enlistment intent, then completes it.
    pub(super) async fn execute(
        self,
        mgr: &MembershipManager,
        state: &mut ManagerState,
    ) -> Result<ServerId, CohortError> {
        let entry_id = mgr
            .append_intent(LogRecord::EnlistIntent {
                server: self.server.clone(),
            })
            .await?;
        self.complete(mgr, state, entry_id).await
    }

    /// Installs the server and turns its intent into the durable record
    /// describing it.
    pub(super) async fn complete(
        self,
        mgr: &MembershipManager,
        state: &mut ManagerState,
        entry_id: EntryId,
    ) -> Result<ServerId, CohortError> {
        let server_id = self.server.server_id;
        state.install_server(&self.server, entry_id)?;
        mgr.commit(
            state,
            entry_id,
            Some(LogRecord::EnlistedConfirm {
                server: self.server,
            }),
        )
        .await?;
        Ok(server_id)
    }
}

impl MembershipManager {
    /// Admits a server into the cluster and returns its new ID. If
    /// `replaces_id` is valid the new ID reuses its slot index with a
    /// higher generation, and the replaced incarnation is taken down first
    /// if still listed.
    pub async fn enlist(
        &self,
        replaces_id: ServerId,
        services: ServiceMask,
        read_speed: u32,
        write_speed: u32,
        service_locator: &str,
    ) -> Result<ServerId, CohortError> {
        let mut state = self.state.lock().await;
        state.check_mutable()?;

        if services.is_empty() {
            return logged_err!("enlist rejected: no services advertised");
        }
        let locator =
            ServiceLocator::parse(service_locator, self.config.max_locator_len)
                .or_else(|e| logged_err!("enlist rejected: {}", e))?;
        if state.directory.locator_in_use(locator.as_str(), replaces_id) {
            return logged_err!(
                "enlist rejected: locator '{}' already in use",
                locator
            );
        }

        let replaces_live = if replaces_id.is_valid() {
            match state.directory.occupant(replaces_id.index) {
                Some(other) if other != replaces_id => {
                    return logged_err!(
                        "enlist rejected: replaces {} but slot held by {}",
                        replaces_id,
                        other
                    );
                }
                occupant => occupant.is_some(),
            }
        } else {
            false
        };

        let server_id = if replaces_id.is_valid() {
            match state.directory.replacement_id(replaces_id) {
                Some(server_id) => server_id,
                None => {
                    return logged_err!(
                        "enlist rejected: slot of {} has no generation left",
                        replaces_id
                    );
                }
            }
        } else {
            state.directory.fresh_id()
        };

        if replaces_live {
            pf_info!(
                "enlisting replacement of live {}, taking it down",
                replaces_id
            );
            ServerDown::new(replaces_id).execute(self, &mut state).await?;
        }
        let server = ServerDescriptor {
            server_id,
            services,
            service_locator: locator.as_str().to_string(),
            read_speed,
            write_speed,
            replication_id: 0,
        };
        let desc = format!("{} at '{}'", server.services, locator);

        let server_id = EnlistServer::new(server).execute(self, &mut state).await?;
        pf_info!("enlisted server {} ({})", server_id, desc);
        Ok(server_id)
    }

    /// Finishes an enlistment whose intent survived a coordinator crash.
    pub async fn enlist_server_recover(
        &self,
        server: ServerDescriptor,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        self.recover_enlist(&mut state, server, entry_id).await
    }

    /// Reinstalls a server from its durable description.
    pub async fn enlisted_server_recover(
        &self,
        server: ServerDescriptor,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        state.install_server(&server, entry_id)
    }

    pub(super) async fn recover_enlist(
        &self,
        state: &mut ManagerState,
        server: ServerDescriptor,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        pf_debug!(
            "finishing enlistment of {} from entry {}",
            server.server_id,
            entry_id
        );
        EnlistServer::new(server)
            .complete(self, state, entry_id)
            .await
            .map(|_| ())
    }
}
