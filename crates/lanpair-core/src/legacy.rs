//! v1 certificate exchange over UDP.
//!
//! The client sends the bare `REQUEST` token to the peer's main port and the
//! peer answers with its locked certificate as base64 text.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::LegacyTiming;
use crate::error::PairingError;
use crate::offer::CertificateOffer;

pub const REQUEST: &[u8] = b"REQUEST";
pub const MAX_DATAGRAM: usize = 2000;

/// Client side: keeps asking until a reply arrives or it is cancelled.
pub struct RequestLoop {
    target: SocketAddr,
    timing: LegacyTiming,
    cancel: CancellationToken,
}

enum Attempt {
    Reply(String),
    Failed,
    SocketError(std::io::Error),
    Cancelled,
}

impl RequestLoop {
    pub fn new(target: SocketAddr, timing: LegacyTiming, cancel: CancellationToken) -> Self {
        Self {
            target,
            timing,
            cancel,
        }
    }

    /// The peer's locked certificate text, or `None` once cancelled.
    pub async fn run(&self) -> Option<String> {
        loop {
            match self.round().await {
                Ok(Some(_)) if self.cancel.is_cancelled() => return None,
                Ok(Some(text)) => return Some(text),
                Ok(None) => {}
                Err(e) => tracing::debug!("Certificate request to {} failed: {}", self.target, e),
            }
            if self.cancel.is_cancelled() {
                return None;
            }

            tracing::debug!(
                "No certificate from {} yet, retrying in {:?}",
                self.target,
                self.timing.retry_wait
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.timing.retry_wait) => {}
            }
        }
    }

    /// One round of up to `attempts_per_round` requests on a fresh socket.
    async fn round(&self) -> Result<Option<String>, PairingError> {
        let socket = UdpSocket::bind(unspecified_for(self.target.ip())).await?;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        for attempt in 1..=self.timing.attempts_per_round {
            match self.attempt(&socket, &mut buf).await {
                Attempt::Reply(text) => return Ok(Some(text)),
                Attempt::Cancelled => return Ok(None),
                Attempt::SocketError(e) => return Err(e.into()),
                Attempt::Failed => tracing::trace!(
                    "Attempt {}/{} to {} got no answer",
                    attempt,
                    self.timing.attempts_per_round,
                    self.target
                ),
            }
        }
        Ok(None)
    }

    async fn attempt(&self, socket: &UdpSocket, buf: &mut [u8]) -> Attempt {
        if let Err(e) = socket.send_to(REQUEST, self.target).await {
            return Attempt::SocketError(e);
        }

        let received = tokio::select! {
            _ = self.cancel.cancelled() => return Attempt::Cancelled,
            r = timeout(self.timing.attempt_timeout, socket.recv_from(buf)) => r,
        };

        match received {
            Err(_) => Attempt::Failed,
            Ok(Err(e)) => Attempt::SocketError(e),
            Ok(Ok((len, from))) if from == self.target => {
                Attempt::Reply(String::from_utf8_lossy(&buf[..len]).into_owned())
            }
            Ok(Ok((_, from))) => {
                tracing::debug!("Ignoring certificate reply from {}, expected {}", from, self.target);
                Attempt::Failed
            }
        }
    }
}

fn unspecified_for(ip: IpAddr) -> SocketAddr {
    match ip {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Server side: one socket, answers every exact `REQUEST` with our locked cert.
pub struct LegacyServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LegacyServer {
    pub async fn bind(addr: SocketAddr, offer: CertificateOffer) -> Result<Self, PairingError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let stop = CancellationToken::new();

        tracing::info!("Certificate server (v1) listening on udp {}", local_addr);
        let task = tokio::spawn(serve(socket, offer, stop.clone()));

        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Certificate server task ended abnormally: {}", e);
        }
        tracing::debug!("Certificate server (v1) on {} stopped", self.local_addr);
    }
}

async fn serve(socket: UdpSocket, offer: CertificateOffer, stop: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = stop.cancelled() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors from earlier replies surface here on some platforms.
                    tracing::debug!("Certificate server receive error: {}", e);
                    continue;
                }
            },
        };

        if &buf[..len] != REQUEST {
            tracing::trace!("Ignoring {} byte datagram from {}", len, from);
            continue;
        }

        let Some(locked) = offer.locked_cert() else {
            tracing::warn!("Certificate requested by {} before one was published", from);
            continue;
        };
        if let Err(e) = socket.send_to(locked.as_bytes(), from).await {
            tracing::debug!("Could not answer certificate request from {}: {}", from, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::GroupSecret;
    use std::sync::Arc;
    use std::time::Duration;
    use storage::{CertificateVault, ScratchVault};
    use tempfile::TempDir;

    const CERT: &[u8] = b"-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n";

    fn fast_timing() -> LegacyTiming {
        LegacyTiming {
            attempt_timeout: Duration::from_millis(200),
            attempts_per_round: 3,
            retry_wait: Duration::from_secs(30),
        }
    }

    fn offer(temp: &TempDir, code: &str) -> CertificateOffer {
        let vault = Arc::new(ScratchVault::new(temp.path().to_path_buf()).unwrap());
        vault.save_own(CERT);
        CertificateOffer::new(vault, GroupSecret::new(code))
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let temp = TempDir::new().unwrap();
        let server = LegacyServer::bind(loopback(), offer(&temp, "Warpinator")).await.unwrap();

        let client = RequestLoop::new(server.local_addr(), fast_timing(), CancellationToken::new());
        let text = client.run().await.expect("reply");
        assert_eq!(crate::cipher::unlock("Warpinator", &text).unwrap(), CERT);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_server_ignores_other_datagrams() {
        let temp = TempDir::new().unwrap();
        let server = LegacyServer::bind(loopback(), offer(&temp, "Warpinator")).await.unwrap();

        let socket = UdpSocket::bind(loopback()).await.unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        for junk in [&b"REQUESTX"[..], &b"request"[..], &b"REQ"[..], &b""[..]] {
            socket.send_to(junk, server.local_addr()).await.unwrap();
            let r = timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
            assert!(r.is_err(), "unexpected reply to {:?}", junk);
        }

        // Still answers the real token afterwards.
        socket.send_to(REQUEST, server.local_addr()).await.unwrap();
        let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(len > 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_unblocks_backoff() {
        // Nobody listens here, so the loop falls into its 30s wait.
        let silent = UdpSocket::bind(loopback()).await.unwrap();
        let target = silent.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let client = RequestLoop::new(target, fast_timing(), cancel.clone());
        let handle = tokio::spawn(async move { client.run().await });

        // Three attempts at 200ms, then well into the wait.
        tokio::time::sleep(Duration::from_millis(900)).await;
        cancel.cancel();

        let result = timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop within a second")
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_reply_from_other_source_is_ignored() {
        // A "peer" that never answers, and an impostor that answers for it.
        let silent = UdpSocket::bind(loopback()).await.unwrap();
        let target = silent.local_addr().unwrap();
        let impostor = UdpSocket::bind(loopback()).await.unwrap();

        let cancel = CancellationToken::new();
        let client = RequestLoop::new(target, fast_timing(), cancel.clone());
        let handle = tokio::spawn(async move { client.run().await });

        let mut buf = [0u8; MAX_DATAGRAM];
        let (_, client_addr) = silent.recv_from(&mut buf).await.unwrap();
        impostor.send_to(b"bogus", client_addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), None);
    }
}
