//! lanpair core - certificate exchange and liveness for LAN peers.
//!
//! Peers that share a group code hand each other their TLS certificates
//! sealed under that code, then keep a pinned TLS channel open to check that
//! the other side is still there.

pub mod channel;
pub mod cipher;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod identity;
pub mod legacy;
pub mod liveness;
pub mod offer;
pub mod peer;
pub mod registration;
pub mod service;

// Re-export commonly used types
pub use channel::{LookupName, PeerChannel, RemoteMachineInfo};
pub use cipher::{CipherError, GroupSecret};
pub use config::PairingConfig;
pub use coordinator::{ExchangeProtocol, Registrar};
pub use error::PairingError;
pub use events::{PeerEvent, PeerStatus};
pub use identity::{Identity, IdentityStore};
pub use peer::PeerAdvert;
pub use registration::ServiceRegistration;
pub use service::PairingService;
