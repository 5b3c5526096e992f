//! Local TLS identity: an RSA key and a self-signed certificate naming our
//! hostname and LAN address.

use rand_core::{OsRng, RngCore};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, KeyPair, RsaKeySize, SanType, SerialNumber,
    PKCS_RSA_SHA256,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::PairingError;

const KEY_FILE: &str = "identity.key";
const CERT_FILE: &str = "identity.crt";
const META_FILE: &str = "identity.json";

const VALID_BEFORE_NOW: Duration = Duration::days(1);
const VALID_AFTER_NOW: Duration = Duration::days(30);

#[derive(Clone)]
pub struct Identity {
    pub local_id: Uuid,
    pub hostname: String,
    pub ip: IpAddr,
    pub key_pem: String,
    pub cert_pem: String,
    /// Unix seconds
    pub not_after: i64,
}

impl Identity {
    /// Short fingerprint for display (first 8 hex chars of the certificate hash).
    pub fn fingerprint(&self) -> String {
        self.full_fingerprint()[..8].to_string()
    }

    pub fn full_fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.cert_pem.as_bytes()))
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.not_after).ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("local_id", &self.local_id)
            .field("hostname", &self.hostname)
            .field("ip", &self.ip)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// What a certificate on disk was issued for.
#[derive(Debug, Serialize, Deserialize)]
struct IdentityMeta {
    hostname: String,
    ip: IpAddr,
    not_after: i64,
}

pub struct IdentityStore {
    dir: PathBuf,
    local_id: Uuid,
    hostname: String,
    ip: IpAddr,
    cached: Mutex<Option<Identity>>,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>, local_id: Uuid, hostname: &str, ip: IpAddr) -> Self {
        Self {
            dir: dir.into(),
            local_id,
            hostname: hostname.to_string(),
            ip,
            cached: Mutex::new(None),
        }
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    /// Read a persisted identity.
    ///
    /// Missing files are `Ok(None)`. So is an identity issued for another
    /// hostname or address, or one that has expired: the caller regenerates.
    pub fn load(&self) -> Result<Option<Identity>, PairingError> {
        let key_path = self.key_path();
        let cert_path = self.cert_path();
        if !key_path.exists() || !cert_path.exists() {
            return Ok(None);
        }

        let meta = match read_meta(&self.dir.join(META_FILE)) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::debug!("Identity metadata unreadable ({}), regenerating", e);
                return Ok(None);
            }
        };
        if meta.ip != self.ip || meta.hostname != self.hostname {
            tracing::info!(
                "Certificate was issued for {} ({}), now {} ({}); regenerating",
                meta.hostname,
                meta.ip,
                self.hostname,
                self.ip
            );
            return Ok(None);
        }
        if meta.not_after <= OffsetDateTime::now_utc().unix_timestamp() {
            tracing::info!("Certificate has expired, regenerating");
            return Ok(None);
        }

        let key_pem = fs::read_to_string(&key_path)
            .map_err(|e| PairingError::Persistence(format!("reading {:?}: {}", key_path, e)))?;
        let cert_pem = fs::read_to_string(&cert_path)
            .map_err(|e| PairingError::Persistence(format!("reading {:?}: {}", cert_path, e)))?;

        Ok(Some(Identity {
            local_id: self.local_id,
            hostname: self.hostname.clone(),
            ip: self.ip,
            key_pem,
            cert_pem,
            not_after: meta.not_after,
        }))
    }

    /// Return the identity, generating and persisting one on first use.
    pub fn get_identity(&self) -> Result<Identity, PairingError> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.load() {
            Ok(Some(identity)) => {
                tracing::info!("Loaded identity from {:?}", self.dir);
                identity
            }
            Ok(None) => self.generate_and_store()?,
            Err(e) => {
                tracing::warn!("Could not load identity: {}", e);
                self.generate_and_store()?
            }
        };

        *cached = Some(identity.clone());
        Ok(identity)
    }

    fn generate_and_store(&self) -> Result<Identity, PairingError> {
        let identity = generate(self.local_id, &self.hostname, self.ip)?;
        match self.persist(&identity) {
            Ok(()) => tracing::info!("Generated new identity at {:?}", self.dir),
            // Still usable for this session; peers only need it while we run.
            Err(e) => tracing::error!("Failed to persist identity: {}", e),
        }
        Ok(identity)
    }

    fn persist(&self, identity: &Identity) -> Result<(), PairingError> {
        let persist_err = |e: std::io::Error| PairingError::Persistence(e.to_string());

        fs::create_dir_all(&self.dir).map_err(persist_err)?;
        storage::write_owner_only(&self.key_path(), identity.key_pem.as_bytes())
            .map_err(persist_err)?;
        storage::write_owner_only(&self.cert_path(), identity.cert_pem.as_bytes())
            .map_err(persist_err)?;

        let meta = IdentityMeta {
            hostname: identity.hostname.clone(),
            ip: identity.ip,
            not_after: identity.not_after,
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| PairingError::Persistence(e.to_string()))?;
        fs::write(self.dir.join(META_FILE), json).map_err(persist_err)?;
        Ok(())
    }
}

fn read_meta(path: &Path) -> anyhow::Result<IdentityMeta> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// 2048-bit RSA, SHA-256 signature, CN = hostname, IP subjectAltName.
pub fn generate(local_id: Uuid, hostname: &str, ip: IpAddr) -> Result<Identity, PairingError> {
    let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::IpAddress(ip)];
    params.serial_number = Some(random_serial());

    let now = OffsetDateTime::now_utc();
    params.not_before = now - VALID_BEFORE_NOW;
    params.not_after = now + VALID_AFTER_NOW;
    let not_after = params.not_after.unix_timestamp();

    let cert = params.self_signed(&key_pair)?;

    Ok(Identity {
        local_id,
        hostname: hostname.to_string(),
        ip,
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
        not_after,
    })
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    // Keep it positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lan_ip() -> IpAddr {
        "192.168.1.40".parse().unwrap()
    }

    #[test]
    fn test_load_is_absent_without_files() {
        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path(), Uuid::new_v4(), "alpha", lan_ip());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_generate_persist_and_reload() {
        let temp = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let store = IdentityStore::new(temp.path(), id, "alpha", lan_ip());

        let identity = store.get_identity().unwrap();
        assert!(identity.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(identity.key_pem.contains("PRIVATE KEY"));
        assert_eq!(identity.full_fingerprint().len(), 64);

        let lifetime = identity.not_after - OffsetDateTime::now_utc().unix_timestamp();
        assert!(lifetime > Duration::days(29).whole_seconds());
        assert!(lifetime <= Duration::days(30).whole_seconds());

        // A second store over the same directory reads the same certificate.
        let again = IdentityStore::new(temp.path(), id, "alpha", lan_ip());
        let loaded = again.load().unwrap().expect("identity on disk");
        assert_eq!(loaded.cert_pem, identity.cert_pem);
        assert_eq!(loaded.key_pem, identity.key_pem);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = IdentityStore::new(temp.path(), Uuid::new_v4(), "alpha", lan_ip());
        store.get_identity().unwrap();

        for path in [store.key_path(), store.cert_path()] {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{:?}", path);
        }
    }

    #[test]
    fn test_address_change_regenerates() {
        let temp = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let first = IdentityStore::new(temp.path(), id, "alpha", lan_ip())
            .get_identity()
            .unwrap();

        let moved = IdentityStore::new(temp.path(), id, "alpha", "10.0.0.9".parse().unwrap());
        assert!(moved.load().unwrap().is_none());
        let second = moved.get_identity().unwrap();
        assert_ne!(first.cert_pem, second.cert_pem);
        assert_eq!(second.ip, "10.0.0.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_persist_failure_still_returns_identity() {
        let temp = TempDir::new().unwrap();
        // A regular file where the directory should be.
        let blocker = temp.path().join("identity");
        fs::write(&blocker, b"in the way").unwrap();

        let store = IdentityStore::new(&blocker, Uuid::new_v4(), "alpha", lan_ip());
        let identity = store.get_identity().unwrap();
        assert!(!identity.cert_pem.is_empty());
        assert!(store.load().unwrap().is_none());
    }
}
