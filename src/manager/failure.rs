//! Confirming and handling server failures.

use super::*;

use tokio::time;

/// Failure-confirmation protocol object.
pub(super) struct ServerDown {
    server_id: ServerId,
}

impl ServerDown {
    pub(super) fn new(server_id: ServerId) -> Self {
        ServerDown { server_id }
    }

    /// Persists the failure intent, then completes it.
    pub(super) async fn execute(
        self,
        mgr: &MembershipManager,
        state: &mut ManagerState,
    ) -> Result<(), CohortError> {
        let replication_id = match state.directory.get(self.server_id) {
            Some(entry) => entry.replication_id,
            None => {
                return logged_err!("server down for unknown {}", self.server_id)
            }
        };
        let entry_id = mgr
            .append_intent(LogRecord::ServerDownIntent {
                server_id: self.server_id,
                replication_id,
            })
            .await?;
        self.complete(mgr, state, entry_id, replication_id).await
    }

    /// Removes the server, dissolves its group, hands it to recovery, and
    /// retires its log records. Removing an absent server only redoes the
    /// bookkeeping.
    pub(super) async fn complete(
        self,
        mgr: &MembershipManager,
        state: &mut ManagerState,
        entry_id: EntryId,
        replication_id: ReplicationId,
    ) -> Result<(), CohortError> {
        let id = self.server_id;
        state.directory.update(id, |e| e.status = ServerStatus::Down);
        let removed = state.directory.remove(id);
        state.directory.note_generation(id);

        let group = removed.as_ref().map_or(replication_id, |e| e.replication_id);
        if group != 0 {
            state.unlink_group(id, group);
            mgr.dissolve_group(state, group).await?;
        }
        mgr.hooks.recovery.on_server_failed(id);
        state.directory.bump_version();

        if let Some(refs) = state.log_refs.remove(&id) {
            mgr.commit(state, refs.info, None).await?;
            if let Some(watermark) = refs.watermark {
                mgr.commit(state, watermark, None).await?;
            }
        }
        if let Some(prev) = state.tombstones.insert(id.index, entry_id) {
            if prev != entry_id {
                mgr.commit(state, prev, None).await?;
            }
        }
        mgr.commit(
            state,
            entry_id,
            Some(LogRecord::ServerRemoved { server_id: id }),
        )
        .await?;

        if removed.is_some() {
            pf_info!("server {} is down, recovery triggered", id);
        } else {
            pf_debug!("server {} already gone, recovery re-triggered", id);
        }
        Ok(())
    }
}

impl MembershipManager {
    /// Handles a report that a server may have crashed. Returns true if the
    /// server is (now) out of the cluster, false if it proved alive.
    pub async fn hint_server_down(
        &self,
        server_id: ServerId,
    ) -> Result<bool, CohortError> {
        {
            let mut state = self.state.lock().await;
            state.check_mutable()?;
            if !state.directory.contains(server_id) {
                pf_debug!("failure hint for unknown {}, ignored", server_id);
                return Ok(true);
            }
            if self.config.force_server_down_for_testing {
                ServerDown::new(server_id).execute(self, &mut state).await?;
                return Ok(true);
            }
            state
                .directory
                .update(server_id, |e| e.status = ServerStatus::Suspect);
        }

        if !self.verify_server_failure(server_id).await? {
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        state.check_mutable()?;
        if state.directory.contains(server_id) {
            if let Err(e) = ServerDown::new(server_id).execute(self, &mut state).await
            {
                // failure never logged unless poisoned; back in service
                // until the next hint
                if !state.poisoned {
                    state.directory.update(server_id, |entry| {
                        if entry.status == ServerStatus::Suspect {
                            entry.status = ServerStatus::Up;
                        }
                    });
                }
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Probes a server with the manager lock released. Returns true if it
    /// is dead, did not answer in time, or left the cluster meanwhile.
    pub async fn verify_server_failure(
        &self,
        server_id: ServerId,
    ) -> Result<bool, CohortError> {
        let locator = {
            let state = self.state.lock().await;
            state.check_healthy()?;
            match state.directory.get(server_id) {
                Some(entry) => entry.service_locator.clone(),
                None => return Ok(true),
            }
        };

        let outcome = time::timeout(
            self.probe_timeout(),
            self.hooks.probe.probe(server_id, &locator),
        )
        .await
        .unwrap_or(ProbeOutcome::Timeout);
        pf_debug!("probe of {} at '{}': {}", server_id, locator, outcome);

        let mut state = self.state.lock().await;
        if !state.directory.contains(server_id) {
            return Ok(true);
        }
        match outcome {
            ProbeOutcome::Alive => {
                state.directory.update(server_id, |e| {
                    if e.status == ServerStatus::Suspect {
                        e.status = ServerStatus::Up;
                    }
                });
                pf_warn!("server {} falsely suspected, still alive", server_id);
                Ok(false)
            }
            ProbeOutcome::Dead | ProbeOutcome::Timeout => Ok(true),
        }
    }

    /// Takes a server out of the cluster unconditionally.
    pub async fn server_down(
        &self,
        server_id: ServerId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_mutable()?;
        ServerDown::new(server_id).execute(self, &mut state).await
    }

    /// Finishes a failure whose intent survived a coordinator crash.
    pub async fn server_down_recover(
        &self,
        server_id: ServerId,
        replication_id: ReplicationId,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        self.recover_server_down(&mut state, server_id, replication_id, entry_id)
            .await
    }

    /// Re-learns the generation of a departed server from its tombstone.
    pub async fn server_removed_recover(
        &self,
        server_id: ServerId,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        self.recover_removed(&mut state, server_id, entry_id).await
    }

    pub(super) async fn recover_server_down(
        &self,
        state: &mut ManagerState,
        server_id: ServerId,
        replication_id: ReplicationId,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        pf_debug!("finishing failure of {} from entry {}", server_id, entry_id);
        ServerDown::new(server_id)
            .complete(self, state, entry_id, replication_id)
            .await
    }

    pub(super) async fn recover_removed(
        &self,
        state: &mut ManagerState,
        server_id: ServerId,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        if state.directory.contains(server_id) {
            return logged_err!(
                "tombstone {} names listed server {}",
                entry_id,
                server_id
            );
        }
        state.directory.note_generation(server_id);
        if let Some(prev) = state.tombstones.insert(server_id.index, entry_id) {
            if prev != entry_id {
                self.commit(state, prev, None).await?;
            }
        }
        Ok(())
    }
}
