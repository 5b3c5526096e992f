//! rustls configuration for pinned, self-signed peer certificates.

use anyhow::{Context, Result};
use rustls::pki_types::ServerName;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Acceptor presenting our own certificate. Clients are not asked for one.
pub fn acceptor(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor> {
    ensure_crypto_provider();
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse server certs")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("parse server key")?
        .context("no private key found")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector whose only trust anchor is the peer's own certificate.
pub fn pinned_connector(peer_cert_pem: &[u8]) -> Result<TlsConnector> {
    ensure_crypto_provider();
    let mut root_store = rustls::RootCertStore::empty();
    let peer_certs = rustls_pemfile::certs(&mut &peer_cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parse peer cert")?;
    if peer_certs.is_empty() {
        anyhow::bail!("no certificate found in peer PEM");
    }
    for cert in peer_certs {
        root_store.add(cert).context("add peer cert to root store")?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Peers are addressed by IP, which is what their certificate's SAN carries.
pub fn server_name(ip: IpAddr) -> ServerName<'static> {
    ServerName::from(ip)
}
