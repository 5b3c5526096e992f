use thiserror::Error;
use transport_tls::FrameError;

use crate::cipher::CipherError;

/// Failures inside the pairing layer.
///
/// None of these escape the coordinator or the probe as errors; they are
/// logged and folded into a boolean outcome or a status transition.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("timed out during {0}")]
    NetworkTimeout(&'static str),
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("authentication failed: {0}")]
    AuthenticationFailure(#[from] CipherError),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("cancelled")]
    Cancelled,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl PairingError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PairingError::NetworkTimeout(_))
    }
}

impl From<FrameError> for PairingError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => PairingError::Network(e),
            FrameError::Codec(e) => PairingError::Protocol(e.to_string()),
        }
    }
}

impl From<rcgen::Error> for PairingError {
    fn from(e: rcgen::Error) -> Self {
        PairingError::Certificate(e.to_string())
    }
}
