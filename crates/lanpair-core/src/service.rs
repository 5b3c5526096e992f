//! The pairing service: one owned instance tying identity, vault, the
//! certificate exchange, the peer channel and liveness probes together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use storage::CertificateVault;
use tokio::sync::Mutex;

use crate::channel::{ChannelServer, LookupName, PeerChannel, RemoteMachineInfo};
use crate::cipher::GroupSecret;
use crate::config::PairingConfig;
use crate::coordinator::Registrar;
use crate::error::PairingError;
use crate::events::{self, event_channel, EventReceiver, EventSender, PeerStatus};
use crate::identity::Identity;
use crate::liveness::LivenessProbe;
use crate::peer::PeerAdvert;
use crate::registration::{self, ServiceRegistration};

pub const API_VERSION: &str = "2";

struct ConnectedPeer {
    channel: Arc<PeerChannel>,
    probe: LivenessProbe,
}

pub struct PairingService<V: CertificateVault + 'static> {
    config: PairingConfig,
    identity: Arc<Identity>,
    secret: GroupSecret,
    vault: Arc<V>,
    registrar: Arc<Registrar<V>>,
    local_name: LookupName,
    events: EventSender,
    channel_server: Mutex<Option<ChannelServer>>,
    peers: Mutex<HashMap<String, ConnectedPeer>>,
    /// Set by `shutdown`; read under the `peers` lock before a probe is kept.
    closing: AtomicBool,
    /// Bumped under the `peers` lock whenever the group code changes.
    code_epoch: AtomicU64,
}

impl<V: CertificateVault + 'static> PairingService<V> {
    /// Build the service. Peer state changes arrive on the returned receiver.
    pub fn new(
        config: PairingConfig,
        identity: Identity,
        secret: GroupSecret,
        vault: Arc<V>,
    ) -> (Self, EventReceiver) {
        let (events, rx) = event_channel();
        let own = own_registration(&config, &identity);
        let registrar = Arc::new(Registrar::new(
            &config,
            vault.clone(),
            secret.clone(),
            own,
            events.clone(),
        ));
        let local_name = LookupName {
            id: identity.local_id.to_string(),
            readable_name: config.display_name.clone(),
        };

        let service = Self {
            config,
            identity: Arc::new(identity),
            secret,
            vault,
            registrar,
            local_name,
            events,
            channel_server: Mutex::new(None),
            peers: Mutex::new(HashMap::new()),
            closing: AtomicBool::new(false),
            code_epoch: AtomicU64::new(0),
        };
        (service, rx)
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    pub fn registrar(&self) -> &Arc<Registrar<V>> {
        &self.registrar
    }

    pub fn own_registration(&self) -> ServiceRegistration {
        own_registration(&self.config, &self.identity)
    }

    /// Forget stale peer certificates, publish ours and start all servers.
    pub async fn start(&self) -> Result<(), PairingError> {
        self.closing.store(false, Ordering::SeqCst);
        self.vault.clear_all();
        self.vault.save_own(self.identity.cert_pem.as_bytes());

        self.registrar.start().await?;

        let info = RemoteMachineInfo {
            display_name: self.config.display_name.clone(),
            user_name: self.config.user_name.clone(),
        };
        let addr = SocketAddr::new(self.config.ip, self.config.port);
        let server = match ChannelServer::bind(addr, &self.identity, info, self.config.server_workers).await {
            Ok(server) => server,
            Err(e) => {
                self.registrar.shutdown().await;
                return Err(e);
            }
        };
        *self.channel_server.lock().await = Some(server);

        tracing::info!(
            "Pairing service up as {} ({}) on {}, fingerprint {}",
            self.config.hostname,
            self.identity.local_id,
            self.config.ip,
            self.identity.fingerprint()
        );
        Ok(())
    }

    /// Bound address of the peer channel while running.
    pub async fn channel_addr(&self) -> Option<SocketAddr> {
        self.channel_server.lock().await.as_ref().map(|s| s.local_addr())
    }

    /// Pair with a peer and start watching it. Returns false if pairing failed;
    /// the reason is reported as an `Unreachable` event.
    pub async fn connect_peer(&self, advert: &PeerAdvert) -> bool {
        if self.closing.load(Ordering::SeqCst) {
            tracing::debug!("Not pairing with {}, service is stopping", advert.hostname);
            return false;
        }
        let epoch = self.code_epoch.load(Ordering::SeqCst);
        self.emit(&advert.peer_id, PeerStatus::Connecting, None);

        if !self.registrar.register(advert).await {
            self.emit(
                &advert.peer_id,
                PeerStatus::Unreachable,
                Some("could not obtain a trusted certificate".into()),
            );
            return false;
        }

        let Some(cert) = self.vault.load(&advert.hostname, advert.ip) else {
            self.emit(
                &advert.peer_id,
                PeerStatus::Unreachable,
                Some("certificate missing after registration".into()),
            );
            return false;
        };

        let channel = match PeerChannel::new(advert.main_addr(), &cert, self.config.probe.probe_timeout) {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                tracing::warn!("Unusable certificate from {}: {}", advert.hostname, e);
                self.emit(&advert.peer_id, PeerStatus::Unreachable, Some(e.to_string()));
                return false;
            }
        };

        let probe = LivenessProbe::spawn(
            advert.peer_id.clone(),
            channel.clone(),
            self.local_name.clone(),
            self.config.probe.clone(),
            self.events.clone(),
        );

        let mut peers = self.peers.lock().await;
        let abandoned = if self.closing.load(Ordering::SeqCst) {
            Some("service stopped")
        } else if self.code_epoch.load(Ordering::SeqCst) != epoch {
            Some("group code changed")
        } else {
            None
        };
        if let Some(reason) = abandoned {
            drop(peers);
            probe.destroy();
            probe.join().await;
            self.emit(&advert.peer_id, PeerStatus::Unreachable, Some(reason.into()));
            return false;
        }

        let previous = peers.insert(advert.peer_id.clone(), ConnectedPeer { channel, probe });
        drop(peers);
        if let Some(previous) = previous {
            previous.probe.destroy();
            previous.probe.join().await;
        }
        true
    }

    /// Stop pairing with or watching a peer.
    pub async fn disconnect_peer(&self, peer_id: &str) {
        self.registrar.cancel(peer_id);
        let removed = self.peers.lock().await.remove(peer_id);
        if let Some(peer) = removed {
            peer.probe.destroy();
            peer.probe.join().await;
            tracing::info!("Disconnected from {}", peer_id);
        }
    }

    pub async fn channel(&self, peer_id: &str) -> Option<Arc<PeerChannel>> {
        self.peers.lock().await.get(peer_id).map(|p| p.channel.clone())
    }

    pub async fn connected_peers(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    /// Switch to a new group code. Trust built under the old code is dropped:
    /// running exchanges are cancelled, every watched peer is let go and its
    /// certificate forgotten, so peers have to pair again.
    pub async fn set_group_code(&self, code: &str) -> bool {
        if !self.secret.set_code(code) {
            return false;
        }

        let dropped: Vec<(String, ConnectedPeer)> = {
            let mut peers = self.peers.lock().await;
            self.code_epoch.fetch_add(1, Ordering::SeqCst);
            peers.drain().collect()
        };
        self.registrar.cancel_all();

        for (_, peer) in &dropped {
            peer.probe.destroy();
        }
        for (peer_id, peer) in dropped {
            peer.probe.join().await;
            self.emit(&peer_id, PeerStatus::Unreachable, Some("group code changed".into()));
        }

        let vault = self.vault.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || vault.clear_peers()).await {
            tracing::error!("Forgetting peer certificates failed: {}", e);
        }
        tracing::info!("Group code updated, peers must pair again");
        true
    }

    /// Announce ourselves to a peer's registration server and return its
    /// advert, ready for `connect_peer`.
    pub async fn register_with(&self, auth_addr: SocketAddr) -> Result<PeerAdvert, PairingError> {
        let reply =
            registration::register_service(auth_addr, &self.own_registration(), &self.config.rpc).await?;
        PeerAdvert::try_from(reply)
    }

    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        // Exchanges first, so no pairing finishes after the peers are gone.
        self.registrar.shutdown().await;

        let peers: Vec<ConnectedPeer> = self.peers.lock().await.drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.probe.destroy();
        }
        for peer in peers {
            peer.probe.join().await;
        }

        if let Some(server) = self.channel_server.lock().await.take() {
            server.stop().await;
        }
        tracing::info!("Pairing service stopped");
    }

    fn emit(&self, peer_id: &str, status: PeerStatus, reason: Option<String>) {
        let _ = self.events.send(events::status(peer_id, status, reason));
    }
}

fn own_registration(config: &PairingConfig, identity: &Identity) -> ServiceRegistration {
    ServiceRegistration {
        service_id: identity.local_id.to_string(),
        ip: config.ip.to_string(),
        port: config.port,
        hostname: config.hostname.clone(),
        api_version: API_VERSION.to_string(),
        auth_port: config.auth_port,
    }
}
