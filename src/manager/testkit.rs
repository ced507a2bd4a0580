//! Fixtures shared by the manager's test modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use super::*;
use crate::intentlog::MemLog;
use crate::server::{ServerList, ServiceMask, ServiceType};

use async_trait::async_trait;

use tokio::sync::mpsc;
use tokio::time::{self, Duration};

/// Probe answering a preset outcome after an optional delay.
pub(crate) struct ScriptedProbe {
    outcome: StdMutex<ProbeOutcome>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub(crate) fn new(outcome: ProbeOutcome, delay: Duration) -> Self {
        ScriptedProbe {
            outcome: StdMutex::new(outcome),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_outcome(&self, outcome: ProbeOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessProbe for ScriptedProbe {
    async fn probe(&self, _server_id: ServerId, _locator: &str) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            time::sleep(self.delay).await;
        }
        let outcome = *self.outcome.lock().unwrap();
        outcome
    }
}

/// Sender recording every pushed list.
#[derive(Default)]
pub(crate) struct RecordingSender {
    pushes: StdMutex<Vec<(ServerId, String, ServerList)>>,
}

impl RecordingSender {
    pub(crate) fn pushes(&self) -> Vec<(ServerId, String, ServerList)> {
        self.pushes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServerListSender for RecordingSender {
    async fn send_server_list(
        &self,
        target: ServerId,
        locator: &str,
        list: ServerList,
    ) -> Result<(), CohortError> {
        self.pushes
            .lock()
            .unwrap()
            .push((target, locator.to_string(), list));
        Ok(())
    }
}

/// A replayed manager over a shared in-memory log, with handles to its
/// test collaborators.
pub(crate) struct Harness {
    pub(crate) mgr: Arc<MembershipManager>,
    pub(crate) log: MemLog,
    pub(crate) probe: Arc<ScriptedProbe>,
    pub(crate) sender: Arc<RecordingSender>,
    rx_recover: mpsc::UnboundedReceiver<ServerId>,
    config_str: Option<String>,
}

impl Harness {
    /// Builds a manager over `log` without replaying it.
    pub(crate) fn unreplayed(
        log: MemLog,
        config_str: Option<&str>,
    ) -> Result<Self, CohortError> {
        let (recovery, rx_recover) = ChannelRecovery::new();
        let probe =
            Arc::new(ScriptedProbe::new(ProbeOutcome::Alive, Duration::ZERO));
        let sender = Arc::new(RecordingSender::default());
        let hooks = ManagerHooks {
            recovery: Arc::new(recovery),
            probe: probe.clone(),
            sender: sender.clone(),
        };
        let mgr = MembershipManager::new(Arc::new(log.clone()), hooks, config_str)?;
        Ok(Harness {
            mgr: Arc::new(mgr),
            log,
            probe,
            sender,
            rx_recover,
            config_str: config_str.map(String::from),
        })
    }

    /// Builds a manager over `log` and replays it.
    pub(crate) async fn start(
        log: MemLog,
        config_str: Option<&str>,
    ) -> Result<Self, CohortError> {
        let harness = Self::unreplayed(log, config_str)?;
        harness.mgr.replay().await?;
        Ok(harness)
    }

    /// Fresh manager over an empty log.
    pub(crate) async fn fresh() -> Result<Self, CohortError> {
        Self::start(MemLog::new(), None).await
    }

    /// Simulates a coordinator restart: a new manager over the same log.
    pub(crate) async fn restart(&self) -> Result<Self, CohortError> {
        Self::start(self.log.clone(), self.config_str.as_deref()).await
    }

    /// Drains failed server IDs reported to recovery so far.
    pub(crate) fn recovered(&mut self) -> Vec<ServerId> {
        let mut ids = vec![];
        while let Ok(id) = self.rx_recover.try_recv() {
            ids.push(id);
        }
        ids
    }

    pub(crate) async fn enlist_as(
        &self,
        services: &[ServiceType],
        host: u32,
    ) -> Result<ServerId, CohortError> {
        self.mgr
            .enlist(
                ServerId::INVALID,
                ServiceMask::from_services(services),
                100,
                100,
                &locator(host),
            )
            .await
    }

    pub(crate) async fn enlist_backup(
        &self,
        host: u32,
    ) -> Result<ServerId, CohortError> {
        self.enlist_as(&[ServiceType::Backup], host).await
    }

    /// All member entries.
    pub(crate) async fn servers(&self) -> Vec<ServerEntry> {
        self.mgr.get_server_list(&ServiceMask::all()).await.servers
    }
}

/// Distinct locator per host number.
pub(crate) fn locator(host: u32) -> String {
    format!("basic+udp:host=10.0.0.{},port=12242", host)
}
