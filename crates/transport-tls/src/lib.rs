//! Stream plumbing shared by the registration RPC and the secure peer channel.
//!
//! Framing is transport-agnostic; TLS helpers build rustls configs where the
//! only trusted root is a single pinned peer certificate.

pub mod frame;
pub mod server;
pub mod tls;

use tokio::io::{AsyncRead, AsyncWrite};

/// A trait object combining AsyncRead + AsyncWrite + Unpin + Send
pub trait StreamTrait: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for any type that satisfies the constraints
impl<T> StreamTrait for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub use frame::{read_frame, recv_msg, send_msg, write_frame, FrameError, MAX_FRAME_LEN};
pub use server::serve_connections;
