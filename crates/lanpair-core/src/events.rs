use serde::Serialize;
use tokio::sync::mpsc;

use crate::channel::RemoteMachineInfo;
use crate::registration::ServiceRegistration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerStatus {
    Connecting,
    Online,
    Offline,
    Unreachable,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PeerStatus::Connecting => "connecting",
            PeerStatus::Online => "online",
            PeerStatus::Offline => "offline",
            PeerStatus::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Everything workers report back to the owner of peer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    StatusChanged {
        peer_id: String,
        status: PeerStatus,
        reason: Option<String>,
    },
    MachineInfo {
        peer_id: String,
        info: RemoteMachineInfo,
    },
    /// A peer announced itself through the registration server.
    ManualRegistration(ServiceRegistration),
}

pub type EventSender = mpsc::UnboundedSender<PeerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PeerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) fn status(peer_id: &str, status: PeerStatus, reason: Option<String>) -> PeerEvent {
    PeerEvent::StatusChanged {
        peer_id: peer_id.to_string(),
        status,
        reason,
    }
}
