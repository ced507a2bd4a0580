//! Replication groups: sets of backups that hold replicas of the same
//! segments. A group's membership lives in its members' durable records.

use super::*;
use crate::server::ServiceType;

impl ManagerState {
    /// Checks a proposed group, returning why it is unacceptable if so.
    fn check_group(
        &self,
        replication_id: ReplicationId,
        members: &[ServerId],
        group_size: usize,
    ) -> Result<(), String> {
        if replication_id == 0 || replication_id == ReplicationId::MAX {
            return Err("group ID reserved".into());
        }
        if self.groups.contains_key(&replication_id) {
            return Err("group ID already in use".into());
        }
        if members.len() != group_size {
            return Err(format!(
                "{} members given, groups have {}",
                members.len(),
                group_size
            ));
        }
        for (i, &member) in members.iter().enumerate() {
            if members[..i].contains(&member) {
                return Err(format!("{} listed twice", member));
            }
            let entry = match self.directory.get(member) {
                Some(entry) => entry,
                None => return Err(format!("{} is not a member", member)),
            };
            if entry.status != ServerStatus::Up {
                return Err(format!("{} is {:?}", member, entry.status));
            }
            if !entry.services.has(ServiceType::Backup) {
                return Err(format!("{} runs no backup service", member));
            }
            if entry.replication_id != 0 {
                return Err(format!(
                    "{} already in group {}",
                    member, entry.replication_id
                ));
            }
        }
        Ok(())
    }

    /// Up backups not in any group, in ascending index order.
    fn ungrouped_backups(&self) -> Vec<ServerId> {
        self.directory
            .iter()
            .filter(|e| {
                e.status == ServerStatus::Up
                    && e.services.has(ServiceType::Backup)
                    && e.replication_id == 0
            })
            .map(|e| e.server_id)
            .collect()
    }
}

impl MembershipManager {
    /// Groups as many ungrouped backups as possible. Returns the IDs of the
    /// groups formed.
    pub async fn create_replication_group(
        &self,
    ) -> Result<Vec<ReplicationId>, CohortError> {
        let mut state = self.state.lock().await;
        state.check_mutable()?;
        self.create_groups(&mut state).await
    }

    /// Forms a group with the given ID and members if every member
    /// qualifies; otherwise changes nothing and returns false.
    pub async fn assign_replication_group(
        &self,
        replication_id: ReplicationId,
        members: &[ServerId],
    ) -> Result<bool, CohortError> {
        let mut state = self.state.lock().await;
        state.check_mutable()?;
        self.assign_group(&mut state, replication_id, members).await
    }

    /// Dissolves a group, leaving its members ungrouped. Unknown IDs are
    /// ignored.
    pub async fn remove_replication_group(
        &self,
        replication_id: ReplicationId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_mutable()?;
        self.dissolve_group(&mut state, replication_id).await?;
        Ok(())
    }

    async fn create_groups(
        &self,
        state: &mut ManagerState,
    ) -> Result<Vec<ReplicationId>, CohortError> {
        let group_size = self.config.replication_group_size;
        let free = state.ungrouped_backups();

        let mut created = vec![];
        for members in free.chunks_exact(group_size) {
            let replication_id = state.next_replication_id;
            if self.assign_group(state, replication_id, members).await? {
                created.push(replication_id);
            }
        }
        if free.len() % group_size != 0 {
            pf_debug!(
                "{} backups left ungrouped",
                free.len() % group_size
            );
        }
        Ok(created)
    }

    pub(super) async fn assign_group(
        &self,
        state: &mut ManagerState,
        replication_id: ReplicationId,
        members: &[ServerId],
    ) -> Result<bool, CohortError> {
        if let Err(reason) = state.check_group(
            replication_id,
            members,
            self.config.replication_group_size,
        ) {
            pf_warn!("rejected replication group {}: {}", replication_id, reason);
            return Ok(false);
        }
        self.reserve_replication_id(state, replication_id).await?;

        for &member in members {
            state
                .directory
                .update(member, |e| e.replication_id = replication_id);
            state.link_group(member, replication_id);
        }
        state.directory.bump_version();
        for &member in members {
            self.persist_server(state, member).await?;
        }

        pf_info!("formed replication group {}: {:?}", replication_id, members);
        Ok(true)
    }

    /// Durably raises the group ID mark past `replication_id`. Runs before
    /// any in-memory change, so a failure here may be retried.
    async fn reserve_replication_id(
        &self,
        state: &mut ManagerState,
        replication_id: ReplicationId,
    ) -> Result<(), CohortError> {
        let next_replication_id = replication_id + 1;
        let record = LogRecord::ReplicationIdMark {
            next_replication_id,
        };
        let entry_id = match state.id_mark {
            Some((_, mark)) if mark >= next_replication_id => return Ok(()),
            Some((entry_id, _)) => {
                if let Err(e) =
                    self.log.update_or_invalidate(entry_id, Some(record)).await
                {
                    return logged_err!("failed to raise group ID mark: {}", e);
                }
                entry_id
            }
            None => self.append_intent(record).await?,
        };
        state.id_mark = Some((entry_id, next_replication_id));
        Ok(())
    }

    /// Re-learns the group ID mark. Of two live marks the higher one is
    /// kept.
    pub async fn replication_id_mark_recover(
        &self,
        next_replication_id: ReplicationId,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        let mut state = self.state.lock().await;
        state.check_healthy()?;
        self.recover_id_mark(&mut state, next_replication_id, entry_id)
            .await
    }

    pub(super) async fn recover_id_mark(
        &self,
        state: &mut ManagerState,
        next_replication_id: ReplicationId,
        entry_id: EntryId,
    ) -> Result<(), CohortError> {
        state.next_replication_id =
            state.next_replication_id.max(next_replication_id);
        match state.id_mark {
            Some((prev, mark)) if prev != entry_id => {
                let stale = if mark >= next_replication_id {
                    entry_id
                } else {
                    state.id_mark = Some((entry_id, next_replication_id));
                    prev
                };
                pf_debug!("retiring superseded group ID mark {}", stale);
                self.commit(state, stale, None).await
            }
            Some((_, mark)) => {
                state.id_mark = Some((entry_id, mark.max(next_replication_id)));
                Ok(())
            }
            None => {
                state.id_mark = Some((entry_id, next_replication_id));
                Ok(())
            }
        }
    }

    /// Resets the members of a group and forgets it. Returns false if no
    /// such group existed.
    pub(super) async fn dissolve_group(
        &self,
        state: &mut ManagerState,
        replication_id: ReplicationId,
    ) -> Result<bool, CohortError> {
        let members = match state.groups.remove(&replication_id) {
            Some(members) => members,
            None => return Ok(false),
        };

        let mut reset = vec![];
        for member in members {
            let found = state.directory.update(member, |e| {
                if e.replication_id == replication_id {
                    e.replication_id = 0;
                }
            });
            if found {
                reset.push(member);
            }
        }
        state.directory.bump_version();
        for &member in &reset {
            self.persist_server(state, member).await?;
        }

        pf_info!(
            "dissolved replication group {}, {} members ungrouped",
            replication_id,
            reset.len()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod groups_tests {
    use super::*;
    use crate::intentlog::MemLog;
    use crate::manager::testkit::*;

    /// Checks the group invariant: every grouped member is listed under its
    /// group, every group lists only members pointing back to it.
    async fn check_invariant(h: &Harness) {
        let list = h.servers().await;
        for entry in &list {
            if entry.replication_id != 0 {
                let members = h.mgr.replication_group(entry.replication_id).await;
                assert!(members.unwrap().contains(&entry.server_id));
            }
        }
        for (replication_id, members) in h.mgr.replication_groups().await {
            for member in members {
                let entry = list.iter().find(|e| e.server_id == member).unwrap();
                assert_eq!(entry.replication_id, replication_id);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_groups_in_order() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        let mut backups = vec![];
        for host in 1..=7 {
            if host == 4 {
                h.enlist_as(&[ServiceType::Master], host).await?;
            } else {
                backups.push(h.enlist_backup(host).await?);
            }
        }

        // six backups, two full groups
        assert_eq!(h.mgr.create_replication_group().await?, vec![1, 2]);
        assert_eq!(h.mgr.replication_group(1).await, Some(backups[..3].to_vec()));
        assert_eq!(h.mgr.replication_group(2).await, Some(backups[3..].to_vec()));
        check_invariant(&h).await;

        // nothing left to group
        assert!(h.mgr.create_replication_group().await?.is_empty());

        // one more backup is not enough for a third
        h.enlist_backup(8).await?;
        assert!(h.mgr.create_replication_group().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assign_all_or_nothing() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        let a = h.enlist_backup(1).await?;
        let b = h.enlist_backup(2).await?;
        let c = h.enlist_backup(3).await?;
        let m = h.enlist_as(&[ServiceType::Master], 4).await?;
        let d = h.enlist_backup(5).await?;
        let live_before = h.log.live_entries()?;

        let bad_proposals: Vec<(ReplicationId, Vec<ServerId>)> = vec![
            (0, vec![a, b, c]),
            (5, vec![]),
            (5, vec![a, b]),
            (5, vec![a, a, b]),
            (5, vec![a, b, m]),
            (5, vec![a, b, ServerId::new(9, 1)]),
        ];
        for (replication_id, members) in bad_proposals {
            assert!(!h.mgr.assign_replication_group(replication_id, &members).await?);
        }
        assert_eq!(h.log.live_entries()?, live_before);
        assert!(h.servers().await.iter().all(|e| e.replication_id == 0));

        assert!(h.mgr.assign_replication_group(5, &[a, b, c]).await?);
        // in use, and members already grouped
        assert!(!h.mgr.assign_replication_group(5, &[d, d, d]).await?);
        assert!(!h.mgr.assign_replication_group(6, &[a, d, b]).await?);
        check_invariant(&h).await;

        // explicit IDs push the counter past them
        h.enlist_backup(6).await?;
        h.enlist_backup(7).await?;
        assert_eq!(h.mgr.create_replication_group().await?, vec![6]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_group() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        for host in 1..=3 {
            h.enlist_backup(host).await?;
        }
        h.mgr.create_replication_group().await?;
        let version = h.mgr.directory_version().await;

        h.mgr.remove_replication_group(1).await?;
        assert!(h.mgr.replication_group(1).await.is_none());
        assert!(h.servers().await.iter().all(|e| e.replication_id == 0));
        assert!(h.mgr.directory_version().await > version);

        // unknown group is a no-op
        h.mgr.remove_replication_group(42).await?;

        // IDs are not reused within a run
        assert_eq!(h.mgr.create_replication_group().await?, vec![2]);
        check_invariant(&h).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn groups_survive_restart() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        for host in 1..=4 {
            h.enlist_backup(host).await?;
        }
        assert_eq!(h.mgr.create_replication_group().await?, vec![1]);

        let h = h.restart().await?;
        assert_eq!(h.mgr.replication_groups().await.len(), 1);
        check_invariant(&h).await;
        assert_eq!(
            h.servers().await.iter().filter(|e| e.replication_id == 1).count(),
            3
        );

        // counter resumes past the highest group seen
        for host in 5..=6 {
            h.enlist_backup(host).await?;
        }
        assert_eq!(h.mgr.create_replication_group().await?, vec![2]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn incomplete_group_dissolved_on_replay() -> Result<(), CohortError> {
        let h = Harness::start(MemLog::new(), Some("replication_group_size = 2"))
            .await?;
        let a = h.enlist_backup(1).await?;
        let b = h.enlist_backup(2).await?;
        let c = h.enlist_backup(3).await?;
        assert!(h.mgr.assign_replication_group(3, &[a, b]).await?);

        // simulate a crash midway through rewriting the members' records:
        // only one of them ever learned about the group
        let log = h.log.fork()?;
        for (entry_id, rec) in log.live_entries()? {
            if let LogRecord::EnlistedConfirm { mut server } = rec {
                if server.server_id == b {
                    server.replication_id = 0;
                    log.update_or_invalidate(
                        entry_id,
                        Some(LogRecord::EnlistedConfirm { server }),
                    )
                    .await?;
                }
            }
        }

        let h2 = Harness::start(log, Some("replication_group_size = 2")).await?;
        check_invariant(&h2).await;
        // the half group was dissolved and nothing regrouped on its own
        assert!(h2.mgr.replication_groups().await.is_empty());
        assert!(h2.servers().await.iter().all(|e| e.replication_id == 0));

        // regrouping is explicit, and group 3 stays retired
        assert_eq!(h2.mgr.create_replication_group().await?, vec![4]);
        assert_eq!(h2.mgr.replication_group(4).await, Some(vec![a, b]));
        assert!(h2.mgr.get_server(c).await.unwrap().replication_id == 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assign_highest_id_rejected() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        let mut ids = vec![];
        for host in 1..=3 {
            ids.push(h.enlist_backup(host).await?);
        }
        let live_before = h.log.live_entries()?;

        assert!(!h.mgr.assign_replication_group(ReplicationId::MAX, &ids).await?);
        assert!(h.servers().await.iter().all(|e| e.replication_id == 0));
        assert!(h.mgr.replication_groups().await.is_empty());
        assert_eq!(h.log.live_entries()?, live_before);

        // the largest usable ID still works, after which the counter is
        // exhausted
        let top = ReplicationId::MAX - 1;
        assert!(h.mgr.assign_replication_group(top, &ids).await?);
        check_invariant(&h).await;
        for host in 4..=6 {
            h.enlist_backup(host).await?;
        }
        assert!(h.mgr.create_replication_group().await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn group_append_failure_changes_nothing() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        for host in 1..=3 {
            h.enlist_backup(host).await?;
        }
        let version = h.mgr.directory_version().await;

        h.log.set_fail_appends(true)?;
        assert!(h.mgr.create_replication_group().await.is_err());
        assert!(!h.mgr.is_poisoned().await);
        assert!(h.servers().await.iter().all(|e| e.replication_id == 0));
        assert!(h.mgr.replication_groups().await.is_empty());
        assert_eq!(h.mgr.directory_version().await, version);

        h.log.set_fail_appends(false)?;
        assert_eq!(h.mgr.create_replication_group().await?, vec![1]);
        check_invariant(&h).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dissolved_ids_not_reused_after_restart() -> Result<(), CohortError> {
        // group lost to a member failure
        let h = Harness::fresh().await?;
        let mut ids = vec![];
        for host in 1..=3 {
            ids.push(h.enlist_backup(host).await?);
        }
        assert_eq!(h.mgr.create_replication_group().await?, vec![1]);
        h.mgr.server_down(ids[0]).await?;
        let h = h.restart().await?;
        h.enlist_backup(4).await?;
        assert_eq!(h.mgr.create_replication_group().await?, vec![2]);

        // group removed explicitly, every member still up
        h.mgr.remove_replication_group(2).await?;
        let h = h.restart().await?;
        assert!(h.mgr.replication_groups().await.is_empty());
        assert_eq!(h.mgr.create_replication_group().await?, vec![3]);

        // one mark record, rewritten in place
        let marks: Vec<LogRecord> = h
            .log
            .live_entries()?
            .into_iter()
            .map(|(_, rec)| rec)
            .filter(|rec| matches!(rec, LogRecord::ReplicationIdMark { .. }))
            .collect();
        assert_eq!(
            marks,
            vec![LogRecord::ReplicationIdMark {
                next_replication_id: 4
            }]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn id_mark_recover_keeps_highest() -> Result<(), CohortError> {
        let h = Harness::fresh().await?;
        for host in 1..=3 {
            h.enlist_backup(host).await?;
        }
        assert_eq!(h.mgr.create_replication_group().await?, vec![1]);

        // a lower mark is retired, a higher one takes over
        let low = h
            .log
            .append(LogRecord::ReplicationIdMark {
                next_replication_id: 1,
            })
            .await?;
        h.mgr.replication_id_mark_recover(1, low).await?;
        assert!(h.log.live_entries()?.iter().all(|(e, _)| *e != low));

        let high = h
            .log
            .append(LogRecord::ReplicationIdMark {
                next_replication_id: 9,
            })
            .await?;
        h.mgr.replication_id_mark_recover(9, high).await?;
        h.mgr.replication_id_mark_recover(9, high).await?;
        let marks = h
            .log
            .live_entries()?
            .into_iter()
            .filter(|(_, rec)| matches!(rec, LogRecord::ReplicationIdMark { .. }))
            .count();
        assert_eq!(marks, 1);

        for host in 4..=6 {
            h.enlist_backup(host).await?;
        }
        assert_eq!(h.mgr.create_replication_group().await?, vec![9]);
        Ok(())
    }
}
