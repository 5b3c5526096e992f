//! v2 certificate exchange: a small request/response RPC on the auth port.
//!
//! Calls and replies are bincode enums in length-prefixed frames. A
//! connection may carry several calls; the client here opens one per call.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use transport_tls::{recv_msg, send_msg, serve_connections};

use crate::config::RpcTiming;
use crate::error::PairingError;
use crate::events::{EventSender, PeerEvent};
use crate::offer::CertificateOffer;

/// Idle connections are dropped after this long without a call.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegRequest {
    pub ip: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegResponse {
    pub locked_cert: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub service_id: String,
    pub ip: String,
    pub port: u16,
    pub hostname: String,
    pub api_version: String,
    pub auth_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationCall {
    RequestCertificate(RegRequest),
    RegisterService(ServiceRegistration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationReply {
    Certificate(RegResponse),
    Service(ServiceRegistration),
    Unavailable(String),
}

struct ServerContext {
    offer: CertificateOffer,
    own: ServiceRegistration,
    events: EventSender,
}

pub struct RegistrationServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl RegistrationServer {
    pub async fn bind(
        addr: SocketAddr,
        offer: CertificateOffer,
        own: ServiceRegistration,
        events: EventSender,
        workers: usize,
    ) -> Result<Self, PairingError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let ctx = Arc::new(ServerContext { offer, own, events });

        tracing::info!("Registration server (v2) listening on tcp {}", local_addr);
        let task = tokio::spawn(serve_connections(
            listener,
            stop.clone(),
            workers,
            move |stream, peer_addr, stop| handle_connection(stream, peer_addr, stop, ctx.clone()),
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
            tracing::warn!("Registration server task ended abnormally: {}", e);
        }
        tracing::debug!("Registration server (v2) on {} stopped", self.local_addr);
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stop: CancellationToken,
    ctx: Arc<ServerContext>,
) {
    loop {
        let call: RegistrationCall = tokio::select! {
            _ = stop.cancelled() => return,
            r = timeout(IDLE_TIMEOUT, recv_msg(&mut stream)) => match r {
                Ok(Ok(call)) => call,
                Ok(Err(e)) => {
                    tracing::trace!("Registration connection from {} closed: {}", peer_addr, e);
                    return;
                }
                Err(_) => return,
            },
        };

        let reply = match call {
            RegistrationCall::RequestCertificate(req) => {
                tracing::debug!(
                    "Certificate requested by {} ({}) from {}",
                    req.hostname,
                    req.ip,
                    peer_addr
                );
                match ctx.offer.locked_cert() {
                    Some(locked_cert) => RegistrationReply::Certificate(RegResponse { locked_cert }),
                    None => RegistrationReply::Unavailable("no certificate published".into()),
                }
            }
            RegistrationCall::RegisterService(reg) => {
                tracing::info!(
                    "Manual registration from {} ({}:{}) api v{}",
                    reg.hostname,
                    reg.ip,
                    reg.port,
                    reg.api_version
                );
                let _ = ctx.events.send(PeerEvent::ManualRegistration(reg));
                RegistrationReply::Service(ctx.own.clone())
            }
        };

        if let Err(e) = send_msg(&mut stream, &reply).await {
            tracing::debug!("Could not reply to {}: {}", peer_addr, e);
            return;
        }
    }
}

/// Ask a peer for its locked certificate. Single attempt.
pub async fn request_certificate(
    addr: SocketAddr,
    request: &RegRequest,
    timing: &RpcTiming,
) -> Result<String, PairingError> {
    match call(addr, &RegistrationCall::RequestCertificate(request.clone()), timing).await? {
        RegistrationReply::Certificate(resp) => Ok(resp.locked_cert),
        RegistrationReply::Unavailable(reason) => Err(PairingError::Protocol(reason)),
        other => Err(unexpected(&other)),
    }
}

/// Announce ourselves to a peer; returns the peer's own registration.
pub async fn register_service(
    addr: SocketAddr,
    own: &ServiceRegistration,
    timing: &RpcTiming,
) -> Result<ServiceRegistration, PairingError> {
    match call(addr, &RegistrationCall::RegisterService(own.clone()), timing).await? {
        RegistrationReply::Service(reg) => Ok(reg),
        RegistrationReply::Unavailable(reason) => Err(PairingError::Protocol(reason)),
        other => Err(unexpected(&other)),
    }
}

async fn call(
    addr: SocketAddr,
    call: &RegistrationCall,
    timing: &RpcTiming,
) -> Result<RegistrationReply, PairingError> {
    let mut stream = timeout(timing.ready_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PairingError::NetworkTimeout("connect"))??;

    timeout(timing.call_timeout, async {
        send_msg(&mut stream, call).await?;
        let reply: RegistrationReply = recv_msg(&mut stream).await?;
        Ok::<_, PairingError>(reply)
    })
    .await
    .map_err(|_| PairingError::NetworkTimeout("registration call"))?
}

fn unexpected(reply: &RegistrationReply) -> PairingError {
    PairingError::Protocol(format!("unexpected reply: {:?}", reply))
}
