//! TLS control channel between trusted peers.
//!
//! The server presents our identity certificate; clients trust nothing but
//! the certificate obtained during registration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use transport_tls::{recv_msg, send_msg, serve_connections, tls};

use crate::error::PairingError;
use crate::identity::Identity;
use crate::liveness::LivenessTarget;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Who is calling, sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupName {
    pub id: String,
    pub readable_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMachineInfo {
    pub display_name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelCall {
    Ping(LookupName),
    GetRemoteMachineInfo(LookupName),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChannelReply {
    Pong,
    MachineInfo(RemoteMachineInfo),
    Error(String),
}

pub struct ChannelServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelServer {
    pub async fn bind(
        addr: SocketAddr,
        identity: &Identity,
        info: RemoteMachineInfo,
        workers: usize,
    ) -> Result<Self, PairingError> {
        let acceptor = tls::acceptor(identity.cert_pem.as_bytes(), identity.key_pem.as_bytes())
            .map_err(|e| PairingError::Certificate(format!("{:#}", e)))?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let info = Arc::new(info);

        tracing::info!("Peer channel listening on tcp {}", local_addr);
        let task = tokio::spawn(serve_connections(
            listener,
            stop.clone(),
            workers,
            move |stream, peer_addr, stop| {
                handle_connection(stream, peer_addr, stop, acceptor.clone(), info.clone())
            },
        ));

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
            tracing::warn!("Peer channel task ended abnormally: {}", e);
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    stop: CancellationToken,
    acceptor: TlsAcceptor,
    info: Arc<RemoteMachineInfo>,
) {
    let mut tls = tokio::select! {
        _ = stop.cancelled() => return,
        r = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)) => match r {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                tracing::debug!("TLS handshake with {} failed: {}", peer_addr, e);
                return;
            }
            Err(_) => {
                tracing::debug!("TLS handshake with {} timed out", peer_addr);
                return;
            }
        },
    };

    loop {
        let call: ChannelCall = tokio::select! {
            _ = stop.cancelled() => return,
            r = timeout(IDLE_TIMEOUT, recv_msg(&mut tls)) => match r {
                Ok(Ok(call)) => call,
                Ok(Err(_)) | Err(_) => return,
            },
        };

        let reply = match call {
            ChannelCall::Ping(from) => {
                tracing::trace!("Ping from {} ({})", from.readable_name, peer_addr);
                ChannelReply::Pong
            }
            ChannelCall::GetRemoteMachineInfo(from) => {
                tracing::debug!("Machine info requested by {}", from.readable_name);
                ChannelReply::MachineInfo((*info).clone())
            }
        };

        if let Err(e) = send_msg(&mut tls, &reply).await {
            tracing::debug!("Could not reply on peer channel to {}: {}", peer_addr, e);
            return;
        }
    }
}

/// Client end of the channel to one trusted peer.
///
/// Calls are serialized over a single connection, opened on first use and
/// reopened after any failure.
pub struct PeerChannel {
    addr: SocketAddr,
    connector: TlsConnector,
    call_timeout: Duration,
    conn: Mutex<Option<TlsStream<TcpStream>>>,
}

impl PeerChannel {
    pub fn new(addr: SocketAddr, peer_cert_pem: &[u8], call_timeout: Duration) -> Result<Self, PairingError> {
        let connector = tls::pinned_connector(peer_cert_pem)
            .map_err(|e| PairingError::Certificate(format!("{:#}", e)))?;
        Ok(Self {
            addr,
            connector,
            call_timeout,
            conn: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn call(&self, call: &ChannelCall) -> Result<ChannelReply, PairingError> {
        let mut conn = self.conn.lock().await;
        match timeout(self.call_timeout, self.exchange(&mut conn, call)).await {
            Ok(result) => result,
            Err(_) => Err(PairingError::NetworkTimeout("peer channel call")),
        }
    }

    /// The stream is only put back after a complete reply, so a call that
    /// fails or is dropped midway leaves no half-read reply behind.
    async fn exchange(
        &self,
        conn: &mut Option<TlsStream<TcpStream>>,
        call: &ChannelCall,
    ) -> Result<ChannelReply, PairingError> {
        let mut stream = match conn.take() {
            Some(stream) => stream,
            None => {
                let tcp = TcpStream::connect(self.addr).await?;
                let stream = self
                    .connector
                    .connect(tls::server_name(self.addr.ip()), tcp)
                    .await?;
                tracing::debug!("Peer channel to {} established", self.addr);
                stream
            }
        };

        send_msg(&mut stream, call).await?;
        let reply = recv_msg(&mut stream).await?;
        *conn = Some(stream);
        Ok(reply)
    }

    pub async fn ping(&self, me: &LookupName) -> Result<(), PairingError> {
        match self.call(&ChannelCall::Ping(me.clone())).await? {
            ChannelReply::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn machine_info(&self, me: &LookupName) -> Result<RemoteMachineInfo, PairingError> {
        match self.call(&ChannelCall::GetRemoteMachineInfo(me.clone())).await? {
            ChannelReply::MachineInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: ChannelReply) -> PairingError {
    match reply {
        ChannelReply::Error(msg) => PairingError::Protocol(msg),
        other => PairingError::Protocol(format!("unexpected reply: {:?}", other)),
    }
}

#[async_trait]
impl LivenessTarget for PeerChannel {
    async fn ping(&self, me: &LookupName) -> Result<(), PairingError> {
        PeerChannel::ping(self, me).await
    }

    async fn machine_info(&self, me: &LookupName) -> Result<RemoteMachineInfo, PairingError> {
        PeerChannel::machine_info(self, me).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use uuid::Uuid;

    fn me() -> LookupName {
        LookupName {
            id: "client-id".into(),
            readable_name: "client".into(),
        }
    }

    fn info() -> RemoteMachineInfo {
        RemoteMachineInfo {
            display_name: "Server Box".into(),
            user_name: "sam".into(),
        }
    }

    #[tokio::test]
    async fn test_ping_and_machine_info_over_tls() {
        let ip = "127.0.0.1".parse().unwrap();
        let server_id = identity::generate(Uuid::new_v4(), "server", ip).unwrap();
        let server = ChannelServer::bind("127.0.0.1:0".parse().unwrap(), &server_id, info(), 2)
            .await
            .unwrap();

        let channel = PeerChannel::new(
            server.local_addr(),
            server_id.cert_pem.as_bytes(),
            Duration::from_secs(5),
        )
        .unwrap();
        channel.ping(&me()).await.unwrap();
        assert_eq!(channel.machine_info(&me()).await.unwrap(), info());
        // Reuses the connection.
        channel.ping(&me()).await.unwrap();

        server.stop().await;
    }

    #[tokio::test]
    async fn test_untrusted_certificate_is_rejected() {
        let ip = "127.0.0.1".parse().unwrap();
        let server_id = identity::generate(Uuid::new_v4(), "server", ip).unwrap();
        let impostor = identity::generate(Uuid::new_v4(), "server", ip).unwrap();
        let server = ChannelServer::bind("127.0.0.1:0".parse().unwrap(), &server_id, info(), 2)
            .await
            .unwrap();

        let channel = PeerChannel::new(
            server.local_addr(),
            impostor.cert_pem.as_bytes(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(channel.ping(&me()).await.is_err());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_server_restart() {
        let ip = "127.0.0.1".parse().unwrap();
        let server_id = identity::generate(Uuid::new_v4(), "server", ip).unwrap();
        let server = ChannelServer::bind("127.0.0.1:0".parse().unwrap(), &server_id, info(), 2)
            .await
            .unwrap();
        let addr = server.local_addr();

        let channel =
            PeerChannel::new(addr, server_id.cert_pem.as_bytes(), Duration::from_secs(2)).unwrap();
        channel.ping(&me()).await.unwrap();

        server.stop().await;
        assert!(channel.ping(&me()).await.is_err());

        let server = ChannelServer::bind(addr, &server_id, info(), 2).await.unwrap();
        channel.ping(&me()).await.unwrap();
        server.stop().await;
    }

    /// Serves one connection at a time; the very first call is answered late.
    async fn slow_first_reply_server(
        identity: &Identity,
        delay: Duration,
    ) -> (SocketAddr, JoinHandle<()>) {
        let acceptor =
            tls::acceptor(identity.cert_pem.as_bytes(), identity.key_pem.as_bytes()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut first = true;
            while let Ok((tcp, _)) = listener.accept().await {
                let Ok(mut tls) = acceptor.accept(tcp).await else {
                    continue;
                };
                while let Ok(call) = recv_msg::<_, ChannelCall>(&mut tls).await {
                    if std::mem::take(&mut first) {
                        tokio::time::sleep(delay).await;
                    }
                    let reply = match call {
                        ChannelCall::Ping(_) => ChannelReply::Pong,
                        ChannelCall::GetRemoteMachineInfo(_) => ChannelReply::MachineInfo(info()),
                    };
                    if send_msg(&mut tls, &reply).await.is_err() {
                        break;
                    }
                }
            }
        });
        (addr, task)
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_leak_its_reply() {
        let ip = "127.0.0.1".parse().unwrap();
        let server_id = identity::generate(Uuid::new_v4(), "server", ip).unwrap();
        let (addr, server) = slow_first_reply_server(&server_id, Duration::from_millis(500)).await;

        let channel =
            PeerChannel::new(addr, server_id.cert_pem.as_bytes(), Duration::from_secs(5)).unwrap();

        // Give up on the ping after the request is on the wire.
        let abandoned = timeout(Duration::from_millis(100), channel.ping(&me())).await;
        assert!(abandoned.is_err());

        // Let the late Pong arrive on the old connection.
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(channel.machine_info(&me()).await.unwrap(), info());
        channel.ping(&me()).await.unwrap();

        server.abort();
    }
}
