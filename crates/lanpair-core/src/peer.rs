use std::net::{IpAddr, SocketAddr};

use crate::error::PairingError;
use crate::registration::ServiceRegistration;

/// A peer as announced by discovery or a manual registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAdvert {
    pub peer_id: String,
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
    pub auth_port: u16,
    pub api_version: String,
}

impl PeerAdvert {
    /// UDP certificate endpoint (v1) and TLS channel endpoint.
    pub fn main_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Registration RPC endpoint (v2).
    pub fn auth_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.auth_port)
    }

    /// Same peer reachable at the same place.
    pub fn same_endpoint(&self, other: &PeerAdvert) -> bool {
        self.hostname == other.hostname
            && self.ip == other.ip
            && self.port == other.port
            && self.auth_port == other.auth_port
            && self.api_version == other.api_version
    }
}

impl TryFrom<ServiceRegistration> for PeerAdvert {
    type Error = PairingError;

    fn try_from(reg: ServiceRegistration) -> Result<Self, Self::Error> {
        let ip = reg
            .ip
            .trim()
            .parse()
            .map_err(|_| PairingError::Protocol(format!("bad address in registration: {:?}", reg.ip)))?;
        Ok(Self {
            peer_id: reg.service_id,
            hostname: reg.hostname,
            ip,
            port: reg.port,
            auth_port: reg.auth_port,
            api_version: reg.api_version,
        })
    }
}
