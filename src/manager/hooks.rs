//! Collaborators the manager calls out to: the recovery subsystem, the
//! liveness prober, and the server-list pusher.

use std::fmt;
use std::sync::Arc;

use crate::server::{ServerId, ServerList, ServiceLocator};
use crate::utils::CohortError;

use async_trait::async_trait;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Receives notice that a server was confirmed failed and its data must be
/// re-replicated. Called under the manager lock, so it must not block;
/// queue the work instead. After a coordinator restart a server may be
/// reported again.
pub trait RecoveryTrigger: Send + Sync {
    fn on_server_failed(&self, server_id: ServerId);
}

/// Recovery trigger that forwards failed server IDs into a channel.
pub struct ChannelRecovery {
    tx_recover: mpsc::UnboundedSender<ServerId>,
}

impl ChannelRecovery {
    /// Creates the trigger along with the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerId>) {
        let (tx_recover, rx_recover) = mpsc::unbounded_channel();
        (ChannelRecovery { tx_recover }, rx_recover)
    }
}

impl RecoveryTrigger for ChannelRecovery {
    fn on_server_failed(&self, server_id: ServerId) {
        if let Err(e) = self.tx_recover.send(server_id) {
            pf_error!("error queueing recovery of {}: {}", server_id, e);
        }
    }
}

/// Result of probing a suspected server.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProbeOutcome {
    Alive,
    Dead,
    Timeout,
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Dead => write!(f, "dead"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Checks whether a server still responds. The manager bounds every probe
/// with its own timeout, so implementations may simply wait.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, server_id: ServerId, locator: &str) -> ProbeOutcome;
}

/// Probe that tries a TCP connection to the locator's `host` and `port`
/// options.
#[derive(Debug, Default)]
pub struct TcpProbe;

#[async_trait]
impl LivenessProbe for TcpProbe {
    async fn probe(&self, server_id: ServerId, locator: &str) -> ProbeOutcome {
        let locator = match ServiceLocator::parse(locator, usize::MAX) {
            Ok(locator) => locator,
            Err(e) => {
                pf_warn!("cannot probe {}: {}", server_id, e);
                return ProbeOutcome::Dead;
            }
        };
        let (host, port) = match (locator.host(), locator.port()) {
            (Some(host), Some(port)) => (host.to_string(), port),
            _ => {
                pf_warn!(
                    "cannot probe {}: locator '{}' lacks host or port",
                    server_id,
                    locator
                );
                return ProbeOutcome::Dead;
            }
        };

        match TcpStream::connect((host.as_str(), port)).await {
            Ok(_) => ProbeOutcome::Alive,
            Err(e) => {
                pf_debug!("probe of {} at {}:{} failed: {}", server_id, host, port, e);
                ProbeOutcome::Dead
            }
        }
    }
}

/// Delivers a server list to a member running the membership service.
#[async_trait]
pub trait ServerListSender: Send + Sync {
    async fn send_server_list(
        &self,
        target: ServerId,
        locator: &str,
        list: ServerList,
    ) -> Result<(), CohortError>;
}

/// Sender that only logs what it would have pushed.
#[derive(Debug, Default)]
pub struct LoggingSender;

#[async_trait]
impl ServerListSender for LoggingSender {
    async fn send_server_list(
        &self,
        target: ServerId,
        locator: &str,
        list: ServerList,
    ) -> Result<(), CohortError> {
        pf_info!(
            "server list v{} ({} servers) -> {} at '{}'",
            list.version,
            list.len(),
            target,
            locator
        );
        Ok(())
    }
}

/// Bundle of collaborators handed to the manager at construction.
#[derive(Clone)]
pub struct ManagerHooks {
    pub recovery: Arc<dyn RecoveryTrigger>,
    pub probe: Arc<dyn LivenessProbe>,
    pub sender: Arc<dyn ServerListSender>,
}

impl ManagerHooks {
    /// Hooks with a channel recovery trigger, TCP probing, and a logging
    /// sender. Returns the recovery channel's receiving end as well.
    pub fn with_defaults() -> (Self, mpsc::UnboundedReceiver<ServerId>) {
        let (recovery, rx_recover) = ChannelRecovery::new();
        (
            ManagerHooks {
                recovery: Arc::new(recovery),
                probe: Arc::new(TcpProbe),
                sender: Arc::new(LoggingSender),
            },
            rx_recover,
        )
    }
}
