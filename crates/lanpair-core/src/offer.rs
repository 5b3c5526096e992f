use std::sync::Arc;

use storage::CertificateVault;

use crate::cipher::GroupSecret;

/// Our own certificate, sealed on demand under the current group code.
///
/// Both certificate servers answer from this, so a re-key or a fresh
/// certificate in the vault takes effect on the next request.
#[derive(Clone)]
pub struct CertificateOffer {
    vault: Arc<dyn CertificateVault>,
    secret: GroupSecret,
}

impl CertificateOffer {
    pub fn new(vault: Arc<dyn CertificateVault>, secret: GroupSecret) -> Self {
        Self { vault, secret }
    }

    /// `None` when no certificate has been published yet.
    pub fn locked_cert(&self) -> Option<String> {
        let cert = self.vault.load_own()?;
        match self.secret.lock(&cert) {
            Ok(locked) => Some(locked),
            Err(e) => {
                tracing::error!("Could not seal own certificate: {}", e);
                None
            }
        }
    }
}
