//! Per-peer certificate exchange bookkeeping.
//!
//! `Registrar::register` runs one exchange for a peer and reports whether its
//! certificate ended up trusted. At most one exchange per peer id is in flight
//! at any time.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use storage::CertificateVault;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::cipher::GroupSecret;
use crate::config::{LegacyTiming, PairingConfig, RpcTiming};
use crate::error::PairingError;
use crate::events::EventSender;
use crate::legacy::{LegacyServer, RequestLoop};
use crate::offer::CertificateOffer;
use crate::peer::PeerAdvert;
use crate::registration::{self, RegRequest, RegistrationServer, ServiceRegistration};

/// Upper bound on how long shutdown waits for exchanges to notice cancellation.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How a peer hands over its certificate, picked from its advertised api version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeProtocol {
    /// UDP `REQUEST`, api version 1
    Legacy,
    /// Registration RPC, api version 2
    Registration,
}

impl ExchangeProtocol {
    pub fn from_api_version(version: &str) -> Option<Self> {
        match version.trim() {
            "1" => Some(ExchangeProtocol::Legacy),
            "2" => Some(ExchangeProtocol::Registration),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Trusted,
    Failed,
    Cancelled,
}

struct ActiveExchange {
    ticket: u64,
    advert: PeerAdvert,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<ExchangeOutcome>>,
}

enum Pending {
    Join(watch::Receiver<Option<ExchangeOutcome>>),
    Supersede(watch::Receiver<Option<ExchangeOutcome>>),
}

struct Servers {
    legacy: LegacyServer,
    registration: RegistrationServer,
}

/// What we tell peers about ourselves when asking for their certificate.
#[derive(Debug, Clone)]
struct LocalEndpoint {
    hostname: String,
    ip: IpAddr,
    port: u16,
    auth_port: u16,
    workers: usize,
}

pub struct Registrar<V: CertificateVault + 'static> {
    vault: Arc<V>,
    secret: GroupSecret,
    local: LocalEndpoint,
    own: ServiceRegistration,
    legacy_timing: LegacyTiming,
    rpc_timing: RpcTiming,
    events: EventSender,
    active: Mutex<HashMap<String, ActiveExchange>>,
    drained: Notify,
    next_ticket: AtomicU64,
    accepting: AtomicBool,
    servers: tokio::sync::Mutex<Option<Servers>>,
}

impl<V: CertificateVault + 'static> Registrar<V> {
    pub fn new(
        config: &PairingConfig,
        vault: Arc<V>,
        secret: GroupSecret,
        own: ServiceRegistration,
        events: EventSender,
    ) -> Self {
        Self {
            vault,
            secret,
            local: LocalEndpoint {
                hostname: config.hostname.clone(),
                ip: config.ip,
                port: config.port,
                auth_port: config.auth_port,
                workers: config.server_workers,
            },
            own,
            legacy_timing: config.legacy.clone(),
            rpc_timing: config.rpc.clone(),
            events,
            active: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            next_ticket: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            servers: tokio::sync::Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveExchange>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the v1 and v2 certificate servers, replacing running ones.
    pub async fn start(&self) -> Result<(), PairingError> {
        let mut servers = self.servers.lock().await;
        if let Some(old) = servers.take() {
            old.legacy.stop().await;
            old.registration.stop().await;
        }

        let offer = CertificateOffer::new(self.vault.clone(), self.secret.clone());
        let legacy =
            LegacyServer::bind(SocketAddr::new(self.local.ip, self.local.port), offer.clone())
                .await?;
        let registration = match RegistrationServer::bind(
            SocketAddr::new(self.local.ip, self.local.auth_port),
            offer,
            self.own.clone(),
            self.events.clone(),
            self.local.workers,
        )
        .await
        {
            Ok(server) => server,
            Err(e) => {
                legacy.stop().await;
                return Err(e);
            }
        };

        *servers = Some(Servers {
            legacy,
            registration,
        });
        self.accepting.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Bound addresses of the (v1 udp, v2 tcp) servers while running.
    pub async fn server_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        let servers = self.servers.lock().await;
        servers
            .as_ref()
            .map(|s| (s.legacy.local_addr(), s.registration.local_addr()))
    }

    pub fn is_registering(&self, peer_id: &str) -> bool {
        self.active().contains_key(peer_id)
    }

    /// Obtain and trust the peer's certificate. Returns true once it is in the
    /// vault; every failure, cancellation included, is `false`.
    pub async fn register(&self, advert: &PeerAdvert) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            tracing::debug!("Not registering {} during shutdown", advert.hostname);
            return false;
        }
        let Some(protocol) = ExchangeProtocol::from_api_version(&advert.api_version) else {
            tracing::warn!(
                "Unsupported api version {:?} from {}",
                advert.api_version,
                advert.hostname
            );
            return false;
        };

        let (ticket, cancel, done) = loop {
            let pending = {
                let mut active = self.active();
                match active.get(&advert.peer_id) {
                    Some(running) if running.advert.same_endpoint(advert) => {
                        Pending::Join(running.outcome.clone())
                    }
                    Some(running) => {
                        running.cancel.cancel();
                        Pending::Supersede(running.outcome.clone())
                    }
                    None => {
                        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                        let cancel = CancellationToken::new();
                        let (done, outcome) = watch::channel(None);
                        active.insert(
                            advert.peer_id.clone(),
                            ActiveExchange {
                                ticket,
                                advert: advert.clone(),
                                cancel: cancel.clone(),
                                outcome,
                            },
                        );
                        break (ticket, cancel, done);
                    }
                }
            };

            match pending {
                Pending::Join(outcome) => {
                    tracing::debug!("Joining exchange already running for {}", advert.hostname);
                    return wait_outcome(outcome).await == ExchangeOutcome::Trusted;
                }
                Pending::Supersede(outcome) => {
                    tracing::debug!("Peer {} moved, restarting exchange", advert.hostname);
                    wait_outcome(outcome).await;
                }
            }
        };

        // Removes our entry even if this future is dropped mid-exchange.
        let release = Release {
            registrar: self,
            peer_id: &advert.peer_id,
            ticket,
        };
        let outcome = self.exchange(protocol, advert, &cancel).await;
        drop(release);
        let _ = done.send(Some(outcome));

        outcome == ExchangeOutcome::Trusted
    }

    async fn exchange(
        &self,
        protocol: ExchangeProtocol,
        advert: &PeerAdvert,
        cancel: &CancellationToken,
    ) -> ExchangeOutcome {
        tracing::info!(
            "Authenticating with {} ({}:{}) - api version {}",
            advert.hostname,
            advert.ip,
            advert.port,
            advert.api_version
        );

        let fetched = tokio::select! {
            _ = cancel.cancelled() => Err(PairingError::Cancelled),
            fetched = self.fetch_locked_cert(protocol, advert, cancel) => fetched,
        };
        let locked = match fetched {
            _ if cancel.is_cancelled() => {
                tracing::debug!("Exchange with {} cancelled", advert.hostname);
                return ExchangeOutcome::Cancelled;
            }
            Ok(locked) => locked,
            Err(e) if e.is_timeout() => {
                tracing::warn!("{} ({}) did not answer in time: {}", advert.hostname, advert.ip, e);
                return ExchangeOutcome::Failed;
            }
            Err(e) => {
                tracing::error!(
                    "Unable to obtain a certificate from {} ({}): {}",
                    advert.hostname,
                    advert.ip,
                    e
                );
                return ExchangeOutcome::Failed;
            }
        };

        let cert = match self.secret.unlock(&locked) {
            Ok(cert) => cert,
            Err(e) => {
                tracing::warn!(
                    "Could not open certificate from {} ({}), check the group code: {}",
                    advert.hostname,
                    advert.ip,
                    e
                );
                return ExchangeOutcome::Failed;
            }
        };

        // The vault mirrors to disk, keep that off the runtime threads.
        let vault = self.vault.clone();
        let (hostname, ip) = (advert.hostname.clone(), advert.ip);
        if let Err(e) = tokio::task::spawn_blocking(move || vault.save(&hostname, ip, &cert)).await {
            tracing::error!("Storing certificate from {} failed: {}", advert.hostname, e);
            return ExchangeOutcome::Failed;
        }
        tracing::info!("Trusting certificate from {} ({})", advert.hostname, advert.ip);
        ExchangeOutcome::Trusted
    }

    async fn fetch_locked_cert(
        &self,
        protocol: ExchangeProtocol,
        advert: &PeerAdvert,
        cancel: &CancellationToken,
    ) -> Result<String, PairingError> {
        match protocol {
            ExchangeProtocol::Legacy => {
                RequestLoop::new(advert.main_addr(), self.legacy_timing.clone(), cancel.clone())
                    .run()
                    .await
                    .ok_or(PairingError::Cancelled)
            }
            ExchangeProtocol::Registration => {
                let request = RegRequest {
                    ip: self.local.ip.to_string(),
                    hostname: self.local.hostname.clone(),
                };
                registration::request_certificate(advert.auth_addr(), &request, &self.rpc_timing).await
            }
        }
    }

    /// Abandon the running exchange for a peer, if any.
    pub fn cancel(&self, peer_id: &str) {
        if let Some(running) = self.active().get(peer_id) {
            tracing::debug!("Cancelling exchange with {}", running.advert.hostname);
            running.cancel.cancel();
        }
    }

    /// Abandon every running exchange without waiting for them.
    pub fn cancel_all(&self) {
        for running in self.active().values() {
            running.cancel.cancel();
        }
    }

    /// Cancel every exchange, wait for them to wind down, stop both servers
    /// and forget all trusted certificates.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.cancel_all();

        if tokio::time::timeout(DRAIN_TIMEOUT, self.wait_drained()).await.is_err() {
            tracing::warn!("Some certificate exchanges did not finish before shutdown");
        }

        if let Some(servers) = self.servers.lock().await.take() {
            servers.legacy.stop().await;
            servers.registration.stop().await;
        }
        self.vault.clear_all();
        tracing::debug!("Registrar shut down");
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

struct Release<'a, V: CertificateVault + 'static> {
    registrar: &'a Registrar<V>,
    peer_id: &'a str,
    ticket: u64,
}

impl<V: CertificateVault + 'static> Drop for Release<'_, V> {
    fn drop(&mut self) {
        let mut active = self.registrar.active();
        if active.get(self.peer_id).map(|a| a.ticket) == Some(self.ticket) {
            active.remove(self.peer_id);
        }
        if active.is_empty() {
            self.registrar.drained.notify_waiters();
        }
    }
}

async fn wait_outcome(mut outcome: watch::Receiver<Option<ExchangeOutcome>>) -> ExchangeOutcome {
    let result = match outcome.wait_for(|o| o.is_some()).await {
        Ok(o) => (*o).unwrap_or(ExchangeOutcome::Failed),
        // Sender dropped without reporting: the owning call was abandoned.
        Err(_) => ExchangeOutcome::Cancelled,
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::lock;
    use crate::events::event_channel;
    use std::time::Duration;
    use storage::ScratchVault;
    use tempfile::TempDir;
    use tokio::net::UdpSocket;

    const CERT: &[u8] = b"-----BEGIN CERTIFICATE-----\npeer\n-----END CERTIFICATE-----\n";

    fn registrar(temp: &TempDir, code: &str) -> Arc<Registrar<ScratchVault>> {
        let mut config = PairingConfig::default();
        config.data_dir = temp.path().to_path_buf();
        config.hostname = "local".into();
        config.port = 0;
        config.auth_port = 0;
        config.legacy = LegacyTiming {
            attempt_timeout: Duration::from_millis(200),
            attempts_per_round: 3,
            retry_wait: Duration::from_secs(30),
        };
        config.rpc = RpcTiming {
            ready_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(1),
        };
        let vault = Arc::new(ScratchVault::new(temp.path().join("peer-certs")).unwrap());
        let own = ServiceRegistration {
            service_id: "local-id".into(),
            ip: "127.0.0.1".into(),
            port: 0,
            hostname: "local".into(),
            api_version: "2".into(),
            auth_port: 0,
        };
        let (tx, _rx) = event_channel();
        Arc::new(Registrar::new(&config, vault, GroupSecret::new(code), own, tx))
    }

    fn advert(addr: SocketAddr, api_version: &str) -> PeerAdvert {
        PeerAdvert {
            peer_id: "peer-1".into(),
            hostname: "Peer".into(),
            ip: addr.ip(),
            port: addr.port(),
            auth_port: addr.port(),
            api_version: api_version.into(),
        }
    }

    /// A v1 peer that answers every request with `reply` and counts requests.
    async fn fake_legacy_peer(reply: String) -> (SocketAddr, Arc<AtomicU64>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2000];
            while let Ok((_, from)) = socket.recv_from(&mut buf).await {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = socket.send_to(reply.as_bytes(), from).await;
            }
        });
        (addr, count)
    }

    #[test]
    fn test_protocol_from_api_version() {
        assert_eq!(ExchangeProtocol::from_api_version("1"), Some(ExchangeProtocol::Legacy));
        assert_eq!(ExchangeProtocol::from_api_version(" 2 "), Some(ExchangeProtocol::Registration));
        assert_eq!(ExchangeProtocol::from_api_version("3"), None);
        assert_eq!(ExchangeProtocol::from_api_version(""), None);
    }

    #[tokio::test]
    async fn test_legacy_exchange_trusts_certificate() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "Warpinator");
        let (addr, _) = fake_legacy_peer(lock("Warpinator", CERT).unwrap()).await;

        assert!(registrar.register(&advert(addr, "1")).await);
        assert_eq!(registrar.vault.load("peer", addr.ip()), Some(CERT.to_vec()));
        assert!(!registrar.is_registering("peer-1"));
    }

    #[tokio::test]
    async fn test_wrong_group_code_stores_nothing() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "our group code");
        let (addr, _) = fake_legacy_peer(lock("their group code", CERT).unwrap()).await;

        assert!(!registrar.register(&advert(addr, "1")).await);
        assert_eq!(registrar.vault.load("peer", addr.ip()), None);
    }

    #[tokio::test]
    async fn test_unknown_version_fails_without_traffic() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "Warpinator");
        let (addr, count) = fake_legacy_peer("unused".into()).await;

        assert!(!registrar.register(&advert(addr, "7")).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_v2_refusing_port_stores_nothing() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "Warpinator");
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        assert!(!registrar.register(&advert(addr, "2")).await);
        assert_eq!(registrar.vault.load("peer", addr.ip()), None);
    }

    #[tokio::test]
    async fn test_v2_silent_peer_times_out() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "Warpinator");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and then say nothing.
        let silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let started = tokio::time::Instant::now();
        let outcome = registrar
            .exchange(ExchangeProtocol::Registration, &advert(addr, "2"), &CancellationToken::new())
            .await;
        assert_eq!(outcome, ExchangeOutcome::Failed);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(registrar.vault.load("peer", addr.ip()), None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = registrar
            .exchange(ExchangeProtocol::Registration, &advert(addr, "2"), &cancel)
            .await;
        assert_eq!(outcome, ExchangeOutcome::Cancelled);

        silent.abort();
    }

    #[tokio::test]
    async fn test_cancel_and_duplicate_registration() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "Warpinator");
        // Silent peer: the v1 loop keeps waiting until cancelled.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = advert(silent.local_addr().unwrap(), "1");

        let first = {
            let registrar = registrar.clone();
            let target = target.clone();
            tokio::spawn(async move { registrar.register(&target).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registrar.is_registering("peer-1"));

        // Same endpoint joins rather than starting a second exchange.
        let second = {
            let registrar = registrar.clone();
            let target = target.clone();
            tokio::spawn(async move { registrar.register(&target).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registrar.active().len(), 1);

        registrar.cancel("peer-1");
        let first = tokio::time::timeout(Duration::from_secs(1), first).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), second).await.unwrap().unwrap();
        assert!(!first);
        assert!(!second);
        assert!(!registrar.is_registering("peer-1"));
    }

    #[tokio::test]
    async fn test_moved_peer_supersedes_running_exchange() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "Warpinator");
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (answering, _) = fake_legacy_peer(lock("Warpinator", CERT).unwrap()).await;

        let stale = {
            let registrar = registrar.clone();
            let target = advert(silent.local_addr().unwrap(), "1");
            tokio::spawn(async move { registrar.register(&target).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(registrar.register(&advert(answering, "1")).await);
        assert!(!stale.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_clears() {
        let temp = TempDir::new().unwrap();
        let registrar = registrar(&temp, "Warpinator");
        registrar.start().await.unwrap();
        assert!(registrar.server_addrs().await.is_some());

        registrar.vault.save("other", "10.0.0.2".parse().unwrap(), CERT);
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pending = {
            let registrar = registrar.clone();
            let target = advert(silent.local_addr().unwrap(), "1");
            tokio::spawn(async move { registrar.register(&target).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), registrar.shutdown())
            .await
            .unwrap();
        assert!(!pending.await.unwrap());
        assert!(registrar.server_addrs().await.is_none());
        assert_eq!(registrar.vault.load("other", "10.0.0.2".parse().unwrap()), None);
    }
}
