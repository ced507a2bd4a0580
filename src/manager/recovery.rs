//! Rebuilding manager state from the replicated log at startup.

use super::watermark::SetMinOpenSegmentId;
use super::*;

impl MembershipManager {
    /// Replays every live log record, then dissolves groups left incomplete
    /// by a crash. Must run exactly once, before any request is served.
    /// Returns the number of records replayed.
    pub async fn replay(&self) -> Result<usize, CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        if state.replayed {
            return logged_err!("log replay already done");
        }

        let records = match self.log.read_all_since(0).await {
            Ok(records) => records,
            Err(e) => return logged_err!("failed to read log for replay: {}", e),
        };
        let num_records = records.len();
        for (entry_id, record) in records {
            self.replay_one(&mut state, entry_id, record).await?;
        }

        self.check_groups(&mut state).await?;
        state.replayed = true;

        pf_info!(
            "replayed {} log records: {} servers, {} groups",
            num_records,
            state.directory.len(),
            state.groups.len()
        );
        Ok(num_records)
    }

    /// Applies a single log record through its recovery handler.
    pub async fn replay_record(
        &self,
        entry_id: EntryId,
        record: LogRecord,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        self.replay_one(&mut state, entry_id, record).await
    }

    async fn replay_one(
        &self,
        state: &mut ManagerState,
        entry_id: EntryId,
        record: LogRecord,
    ) -> Result<(), CohortError> {
        pf_trace!("replaying entry {}: {}", entry_id, record);
        match record {
            LogRecord::EnlistIntent { server } => {
                self.recover_enlist(state, server, entry_id).await
            }
            LogRecord::EnlistedConfirm { server } => {
                state.install_server(&server, entry_id)
            }
            LogRecord::ServerDownIntent {
                server_id,
                replication_id,
            } => {
                self.recover_server_down(state, server_id, replication_id, entry_id)
                    .await
            }
            LogRecord::ServerRemoved { server_id } => {
                self.recover_removed(state, server_id, entry_id).await
            }
            LogRecord::WatermarkIntent {
                server_id,
                segment_id,
            } => {
                SetMinOpenSegmentId::new(server_id, segment_id)
                    .complete(self, state, entry_id)
                    .await
            }
            LogRecord::ReplicationIdMark {
                next_replication_id,
            } => {
                self.recover_id_mark(state, next_replication_id, entry_id)
                    .await
            }
        }
    }

    /// Dissolves every group whose member count is off target, i.e., whose
    /// formation or dissolution was cut short.
    async fn check_groups(
        &self,
        state: &mut ManagerState,
    ) -> Result<(), CohortError> {
        let group_size = self.config.replication_group_size;
        let broken: Vec<ReplicationId> = state
            .groups
            .iter()
            .filter(|(_, members)| members.len() != group_size)
            .map(|(&replication_id, _)| replication_id)
            .collect();
        for replication_id in broken {
            pf_warn!("replication group {} incomplete, dissolving", replication_id);
            self.dissolve_group(state, replication_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use crate::intentlog::MemLog;
    use crate::manager::testkit::*;
    use crate::server::{ServerList, ServiceMask, ServiceType};
    use rand::Rng;

    /// Comparable view of a manager's state; the directory version is left
    /// out since every applied record bumps it.
    async fn fingerprint(
        h: &Harness,
    ) -> (Vec<ServerEntry>, BTreeMap<ReplicationId, Vec<ServerId>>) {
        (h.servers().await, h.mgr.replication_groups().await)
    }

    /// Builds a log with a bit of everything in it.
    async fn busy_history() -> Result<Harness, CohortError> {
        let h = Harness::fresh().await?;
        let mut ids = vec![];
        for host in 1..=7 {
            ids.push(h.enlist_backup(host).await?);
        }
        h.enlist_as(&[ServiceType::Master, ServiceType::Membership], 8)
            .await?;
        h.mgr.create_replication_group().await?;
        h.mgr.set_min_open_segment_id(ids[0], 3).await?;
        h.mgr.set_min_open_segment_id(ids[6], 7).await?;
        h.mgr.set_min_open_segment_id(ids[6], 9).await?;
        h.mgr.server_down(ids[4]).await?;
        h.enlist_backup(10).await?;
        assert_eq!(h.mgr.create_replication_group().await?, vec![3]);
        Ok(h)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_reproduces_state() -> Result<(), CohortError> {
        let h = busy_history().await?;
        let before = fingerprint(&h).await;
        let h2 = h.restart().await?;
        assert_eq!(fingerprint(&h2).await, before);
        // replay wrote nothing new
        let live = h.log.live_entries()?;
        let h3 = h2.restart().await?;
        assert_eq!(h3.log.live_entries()?, live);
        assert_eq!(fingerprint(&h3).await, before);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_twice_is_idempotent() -> Result<(), CohortError> {
        let h = busy_history().await?;
        let records = h.log.live_entries()?;

        let once = Harness::unreplayed(h.log.fork()?, None)?;
        for (entry_id, rec) in records.iter().cloned() {
            once.mgr.replay_record(entry_id, rec).await?;
        }
        let twice = Harness::unreplayed(h.log.fork()?, None)?;
        for _ in 0..2 {
            for (entry_id, rec) in records.iter().cloned() {
                twice.mgr.replay_record(entry_id, rec).await?;
            }
        }
        assert_eq!(fingerprint(&once).await, fingerprint(&twice).await);
        assert_eq!(once.log.live_entries()?, twice.log.live_entries()?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_any_prefix() -> Result<(), CohortError> {
        // every operation is a crash point; replaying any prefix of the
        // full history must yield a consistent, usable manager
        let h = busy_history().await?;
        let full = h.log.live_entries()?;
        let cut = rand::thread_rng().gen_range(0..=full.len());
        let log = MemLog::new();
        for (_, rec) in &full[..cut] {
            log.append(rec.clone()).await?;
        }
        let h2 = Harness::start(log, None).await?;
        assert!(h2.servers().await.len() <= cut);
        for (replication_id, members) in h2.mgr.replication_groups().await {
            assert_eq!(members.len(), 3);
            for member in members {
                let entry = h2.mgr.get_server(member).await.unwrap();
                assert_eq!(entry.replication_id, replication_id);
            }
        }
        h2.enlist_backup(20).await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_forms_no_groups() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        for host in 1..=3 {
            h.enlist_backup(host).await?;
        }
        let live = h.log.live_entries()?;

        let h2 = h.restart().await?;
        assert!(h2.mgr.replication_groups().await.is_empty());
        assert!(h2.servers().await.iter().all(|e| e.replication_id == 0));
        assert_eq!(h2.log.live_entries()?, live);

        assert_eq!(h2.mgr.create_replication_group().await?, vec![1]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_only_once() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        assert!(h.mgr.replay().await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replay_resumes_after_crash() -> Result<(), CohortError> {
        // enlisted, grouped, watermarked; then crash after an enlist intent
        let h = Harness::fresh().await?;
        for host in 1..=3 {
            h.enlist_backup(host).await?;
        }
        h.mgr.create_replication_group().await?;
        let pending = ServerDescriptor {
            server_id: ServerId::new(4, 1),
            services: ServiceMask::from_services(&[ServiceType::Backup]),
            service_locator: locator(4),
            read_speed: 1,
            write_speed: 1,
            replication_id: 0,
        };
        h.log
            .append(LogRecord::EnlistIntent { server: pending })
            .await?;

        let h2 = h.restart().await?;
        let list: ServerList = h2.mgr.get_server_list(&ServiceMask::all()).await;
        assert_eq!(list.len(), 4);
        assert_eq!(list.get(ServerId::new(4, 1)).unwrap().replication_id, 0);
        assert_eq!(h2.mgr.replication_group(1).await.map(|m| m.len()), Some(3));
        Ok(())
    }
}
