//! Per-peer liveness probing.
//!
//! A probe pings a trusted peer on a fixed cadence and reports only
//! transitions. During startup it is patient (several quick retries) so a
//! peer that is still coming up is not flagged; once settled it tolerates a
//! couple of misses and re-checks once more before calling a peer offline.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::channel::{LookupName, RemoteMachineInfo};
use crate::config::ProbeTiming;
use crate::error::PairingError;
use crate::events::{self, EventSender, PeerEvent, PeerStatus};

/// Something that can be pinged. Implemented by the peer channel.
#[async_trait]
pub trait LivenessTarget: Send + Sync {
    async fn ping(&self, me: &LookupName) -> Result<(), PairingError>;
    async fn machine_info(&self, me: &LookupName) -> Result<RemoteMachineInfo, PairingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Below the threshold; try again next interval.
    Wait,
    /// Startup gave up on the peer.
    Unreachable,
    /// An online peer hit the threshold; re-check before flipping.
    Confirm,
}

/// Pure state of one probe.
#[derive(Debug)]
pub struct LivenessSession {
    online: bool,
    consecutive_failures: u32,
    is_initial_phase: bool,
    timing: ProbeTiming,
}

impl LivenessSession {
    pub fn new(timing: ProbeTiming) -> Self {
        Self {
            online: false,
            consecutive_failures: 0,
            is_initial_phase: true,
            timing,
        }
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_initial_phase(&self) -> bool {
        self.is_initial_phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns true when the peer just came online.
    pub fn on_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        self.is_initial_phase = false;
        let came_online = !self.online;
        self.online = true;
        came_online
    }

    pub fn on_failure(&mut self) -> FailureAction {
        self.consecutive_failures += 1;

        if self.is_initial_phase {
            if self.consecutive_failures >= self.timing.startup_failure_limit {
                self.is_initial_phase = false;
                self.online = false;
                return FailureAction::Unreachable;
            }
            return FailureAction::Wait;
        }

        if self.online && self.consecutive_failures >= self.timing.steady_failure_limit {
            FailureAction::Confirm
        } else {
            FailureAction::Wait
        }
    }

    pub fn mark_offline(&mut self) {
        self.online = false;
    }

    pub fn next_delay(&self) -> Duration {
        if self.is_initial_phase {
            self.timing.startup_interval
        } else if self.online {
            self.timing.online_interval
        } else {
            self.timing.offline_interval
        }
    }
}

/// Handle to a running probe task.
pub struct LivenessProbe {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LivenessProbe {
    pub fn spawn(
        peer_id: String,
        target: Arc<dyn LivenessTarget>,
        me: LookupName,
        timing: ProbeTiming,
        events: EventSender,
    ) -> Self {
        let stop = CancellationToken::new();
        let worker = ProbeWorker {
            peer_id,
            target,
            me,
            events,
            stop: stop.clone(),
        };
        let task = tokio::spawn(worker.run(timing));
        Self { stop, task }
    }

    /// Stop probing; any pending wait or ping is abandoned.
    pub fn destroy(&self) {
        self.stop.cancel();
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!("Liveness probe ended abnormally: {}", e);
        }
    }
}

struct ProbeWorker {
    peer_id: String,
    target: Arc<dyn LivenessTarget>,
    me: LookupName,
    events: EventSender,
    stop: CancellationToken,
}

impl ProbeWorker {
    async fn run(self, timing: ProbeTiming) {
        let probe_timeout = timing.probe_timeout;
        let confirm_delay = timing.confirm_delay;
        let mut session = LivenessSession::new(timing);

        loop {
            let Some(ok) = self.probe(probe_timeout).await else {
                break;
            };

            if ok {
                if session.is_initial_phase() {
                    self.fetch_machine_info(probe_timeout).await;
                }
                if session.on_success() {
                    tracing::info!("Peer {} is online", self.peer_id);
                    self.emit(PeerStatus::Online, None);
                }
            } else {
                match session.on_failure() {
                    FailureAction::Wait => tracing::debug!(
                        "Peer {} missed a ping ({} in a row)",
                        self.peer_id,
                        session.consecutive_failures()
                    ),
                    FailureAction::Unreachable => {
                        tracing::info!("Peer {} did not answer during startup", self.peer_id);
                        self.emit(PeerStatus::Unreachable, Some("no response during startup".into()));
                    }
                    FailureAction::Confirm => {
                        if !self.sleep(confirm_delay).await {
                            break;
                        }
                        match self.probe(probe_timeout).await {
                            None => break,
                            Some(true) => {
                                session.on_success();
                            }
                            Some(false) => {
                                session.mark_offline();
                                tracing::info!("Peer {} went offline", self.peer_id);
                                self.emit(PeerStatus::Offline, Some("stopped responding".into()));
                            }
                        }
                    }
                }
            }

            if !self.sleep(session.next_delay()).await {
                break;
            }
        }
        tracing::debug!("Liveness probe for {} stopped", self.peer_id);
    }

    /// `None` once destroyed.
    async fn probe(&self, limit: Duration) -> Option<bool> {
        tokio::select! {
            _ = self.stop.cancelled() => None,
            r = timeout(limit, self.target.ping(&self.me)) => Some(match r {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::trace!("Ping to {} failed: {}", self.peer_id, e);
                    false
                }
                Err(_) => false,
            }),
        }
    }

    async fn fetch_machine_info(&self, limit: Duration) {
        let info = tokio::select! {
            _ = self.stop.cancelled() => return,
            r = timeout(limit, self.target.machine_info(&self.me)) => r,
        };
        match info {
            Ok(Ok(info)) => {
                let _ = self.events.send(PeerEvent::MachineInfo {
                    peer_id: self.peer_id.clone(),
                    info,
                });
            }
            Ok(Err(e)) => tracing::debug!("Could not get machine info from {}: {}", self.peer_id, e),
            Err(_) => tracing::debug!("Machine info request to {} timed out", self.peer_id),
        }
    }

    /// False when interrupted by `destroy`.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn emit(&self, status: PeerStatus, reason: Option<String>) {
        let _ = self.events.send(events::status(&self.peer_id, status, reason));
    }
}
