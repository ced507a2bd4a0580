//! Per-server segment watermarks: segments below a server's min open
//! segment ID are closed for good.

use super::*;

/// Watermark update protocol object.
pub(super) struct SetMinOpenSegmentId {
    server_id: ServerId,
    segment_id: u64,
}

impl SetMinOpenSegmentId {
    pub(super) fn new(server_id: ServerId, segment_id: u64) -> Self {
        SetMinOpenSegmentId {
            server_id,
            segment_id,
        }
    }

    /// Persists the watermark intent, then completes it.
    pub(super) async fn execute(
        self,
        mgr: &MembershipManager,
        state: &mut ManagerState,
    ) -> Result<(), CohortError> {
        let entry_id = mgr
            .append_intent(LogRecord::WatermarkIntent {
                server_id: self.server_id,
                segment_id: self.segment_id,
            })
            .await?;
        self.complete(mgr, state, entry_id).await
    }

    /// Raises the watermark and keeps the record as the server's durable
    /// watermark, retiring the one it supersedes. A record naming a
    /// departed server, or one behind the current value, is retired
    /// itself.
    pub(super) async fn complete(
        self,
        mgr: &MembershipManager,
        state: &mut ManagerState,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        let id = self.server_id;
        let current = match state.directory.get(id) {
            Some(entry) => entry.min_open_segment_id,
            None => {
                pf_debug!("watermark entry {} names departed {}", entry_id, id);
                return mgr.commit(state, entry_id, None).await;
            }
        };
        if self.segment_id < current {
            pf_debug!("watermark entry {} for {} is stale", entry_id, id);
            return mgr.commit(state, entry_id, None).await;
        }

        state
            .directory
            .update(id, |e| e.min_open_segment_id = self.segment_id);
        let prev = state
            .log_refs
            .get_mut(&id)
            .and_then(|refs| refs.watermark.replace(entry_id));
        if let Some(prev) = prev {
            if prev != entry_id {
                mgr.commit(state, prev, None).await?;
            }
        }
        pf_debug!("min open segment ID of {} -> {}", id, self.segment_id);
        Ok(())
    }
}

impl MembershipManager {
    /// Raises a server's min open segment ID. Values not above the current
    /// one are accepted and ignored.
    pub async fn set_min_open_segment_id(
        &self,
        server_id: ServerId,
        segment_id: u64,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_mutable()?;
        let current = match state.directory.get(server_id) {
            Some(entry) => entry.min_open_segment_id,
            None => {
                return logged_err!(
                    "set min open segment ID on unknown {}",
                    server_id
                )
            }
        };
        if segment_id <= current {
            pf_debug!(
                "ignoring min open segment ID {} <= {} of {}",
                segment_id,
                current,
                server_id
            );
            return Ok(());
        }
        SetMinOpenSegmentId::new(server_id, segment_id)
            .execute(self, &mut state)
            .await
    }

    /// Re-applies a watermark record found live in the log.
    pub async fn set_min_open_segment_id_recover(
        &self,
        server_id: ServerId,
        segment_id: u64,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        SetMinOpenSegmentId::new(server_id, segment_id)
            .complete(self, &mut state, entry_id)
            .await
    }
}
