//! Volatile in-memory replicated log, shared by clones. Handing a clone to
//! a fresh manager models a coordinator restart over the same log.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::intentlog::{EntryId, LogRecord, ReplicatedLog};
use crate::utils::CohortError;

use async_trait::async_trait;

#[derive(Debug, Clone)]
struct MemLogInner {
    /// Live entries.
    entries: BTreeMap<EntryId, LogRecord>,

    /// ID to assign to the next append.
    next_id: EntryId,

    /// Failure injection: appends fail while set.
    fail_appends: bool,

    /// Failure injection: updates and invalidations fail while set.
    fail_updates: bool,
}

/// In-memory log. Clones share the same underlying log.
#[derive(Debug, Clone)]
pub struct MemLog {
    inner: Arc<Mutex<MemLogInner>>,
}

impl MemLog {
    pub fn new() -> Self {
        MemLog {
            inner: Arc::new(Mutex::new(MemLogInner {
                entries: BTreeMap::new(),
                next_id: 1,
                fail_appends: false,
                fail_updates: false,
            })),
        }
    }

    /// Deep-copies the log into an independent instance, e.g., to replay
    /// the same history more than once.
    pub fn fork(&self) -> Result<Self, CohortError> {
        let inner = self.inner.lock()?.clone();
        Ok(MemLog {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Makes subsequent appends fail (or succeed again).
    pub fn set_fail_appends(&self, fail: bool) -> Result<(), CohortError> {
        self.inner.lock()?.fail_appends = fail;
        Ok(())
    }

    /// Makes subsequent updates and invalidations fail (or succeed again).
    pub fn set_fail_updates(&self, fail: bool) -> Result<(), CohortError> {
        self.inner.lock()?.fail_updates = fail;
        Ok(())
    }

    /// Number of live entries.
    pub fn num_live(&self) -> Result<usize, CohortError> {
        Ok(self.inner.lock()?.entries.len())
    }

    /// Snapshot of all live entries.
    pub fn live_entries(
        &self,
    ) -> Result<Vec<(EntryId, LogRecord)>, CohortError> {
        let inner = self.inner.lock()?;
        Ok(inner
            .entries
            .iter()
            .map(|(&id, rec)| (id, rec.clone()))
            .collect())
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicatedLog for MemLog {
    async fn append(&self, record: LogRecord) -> Result<EntryId, CohortError> {
        let mut inner = self.inner.lock()?;
        if inner.fail_appends {
            return Err(CohortError::msg("injected append failure"));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.insert(id, record);
        Ok(id)
    }

    async fn update_or_invalidate(
        &self,
        entry_id: EntryId,
        replacement: Option<LogRecord>,
    ) -> Result<(), CohortError> {
        let mut inner = self.inner.lock()?;
        if inner.fail_updates {
            return Err(CohortError::msg("injected update failure"));
        }
        if entry_id == 0 || entry_id >= inner.next_id {
            return Err(CohortError::msg(format!(
                "log entry {} was never appended",
                entry_id
            )));
        }
        if !inner.entries.contains_key(&entry_id) {
            return Ok(()); // already invalidated
        }
        match replacement {
            Some(record) => {
                inner.entries.insert(entry_id, record);
            }
            None => {
                inner.entries.remove(&entry_id);
            }
        }
        Ok(())
    }

    async fn read_all_since(
        &self,
        start: EntryId,
    ) -> Result<Vec<(EntryId, LogRecord)>, CohortError> {
        let inner = self.inner.lock()?;
        Ok(inner
            .entries
            .range(start..)
            .map(|(&id, rec)| (id, rec.clone()))
            .collect())
    }
}
