use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Certificates trusted for the current session, keyed by (hostname, ip).
pub trait CertificateVault: Send + Sync {
    fn save(&self, hostname: &str, ip: IpAddr, cert: &[u8]);
    fn load(&self, hostname: &str, ip: IpAddr) -> Option<Vec<u8>>;
    fn save_own(&self, cert: &[u8]);
    fn load_own(&self) -> Option<Vec<u8>>;
    /// Forget every peer certificate, keeping our own.
    fn clear_peers(&self);
    fn clear_all(&self);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct VaultKey {
    hostname: String,
    ip: IpAddr,
}

impl VaultKey {
    fn new(hostname: &str, ip: IpAddr) -> Self {
        Self {
            hostname: hostname.trim().to_lowercase(),
            ip,
        }
    }

    fn file_name(&self) -> String {
        format!("{}.{}.pem", sanitize(&self.hostname), sanitize(&self.ip.to_string()))
    }
}

#[derive(Default)]
struct Entries {
    peers: HashMap<VaultKey, Vec<u8>>,
    own: Option<Vec<u8>>,
}

/// In-memory vault mirrored into a scratch directory.
///
/// Memory is authoritative. The directory only exists so other components can
/// point at a certificate on disk; a failed mirror write leaves the memory
/// entry in place.
pub struct ScratchVault {
    dir: PathBuf,
    entries: Mutex<Entries>,
}

const OWN_CERT_FILE: &str = "self.pem";

impl ScratchVault {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).context("Failed to create peer certificate directory")?;
        Ok(Self {
            dir,
            entries: Mutex::new(Entries::default()),
        })
    }

    /// Path of the mirrored file for a peer, if one is stored.
    pub fn cert_path(&self, hostname: &str, ip: IpAddr) -> Option<PathBuf> {
        let key = VaultKey::new(hostname, ip);
        let entries = self.entries();
        entries
            .peers
            .contains_key(&key)
            .then(|| self.dir.join(key.file_name()))
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called without the entries lock held. Each write gets its own temp
    /// file so concurrent mirrors of one entry cannot clobber each other.
    fn mirror(&self, name: &str, data: &[u8]) {
        let tmp = self.dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        let target = self.dir.join(name);
        let result = fs::write(&tmp, data).and_then(|_| fs::rename(&tmp, &target));
        if let Err(e) = result {
            tracing::error!("Failed to mirror certificate to {:?}: {}", target, e);
            let _ = fs::remove_file(&tmp);
        }
    }
}

impl CertificateVault for ScratchVault {
    fn save(&self, hostname: &str, ip: IpAddr, cert: &[u8]) {
        let key = VaultKey::new(hostname, ip);
        let name = key.file_name();

        self.entries().peers.insert(key, cert.to_vec());
        self.mirror(&name, cert);
        tracing::debug!("Stored certificate for {} ({} bytes)", name, cert.len());
    }

    fn load(&self, hostname: &str, ip: IpAddr) -> Option<Vec<u8>> {
        self.entries().peers.get(&VaultKey::new(hostname, ip)).cloned()
    }

    fn save_own(&self, cert: &[u8]) {
        self.entries().own = Some(cert.to_vec());
        self.mirror(OWN_CERT_FILE, cert);
    }

    fn load_own(&self) -> Option<Vec<u8>> {
        self.entries().own.clone()
    }

    fn clear_peers(&self) {
        self.entries().peers.clear();
        self.remove_files(|name| name != OWN_CERT_FILE);
        tracing::debug!("Forgot all peer certificates in {:?}", self.dir);
    }

    fn clear_all(&self) {
        {
            let mut entries = self.entries();
            entries.peers.clear();
            entries.own = None;
        }
        self.remove_files(|_| true);
        tracing::debug!("Cleared certificate vault at {:?}", self.dir);
    }
}

impl ScratchVault {
    fn remove_files(&self, mut wanted: impl FnMut(&str) -> bool) {
        let listing = match fs::read_dir(&self.dir) {
            Ok(listing) => listing,
            Err(e) => {
                tracing::warn!("Could not list {:?} for cleanup: {}", self.dir, e);
                return;
            }
        };

        for entry in listing.flatten() {
            let path = entry.path();
            if !path.is_file() || !wanted(&entry.file_name().to_string_lossy()) {
                continue;
            }
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("Could not remove stale certificate {:?}: {}", path, e);
            }
        }
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_vault_roundtrip_and_overwrite() -> Result<()> {
        let temp = TempDir::new()?;
        let vault = ScratchVault::new(temp.path().join("certs"))?;

        vault.save("alpha", ip("192.168.1.20"), b"first cert");
        assert_eq!(vault.load("alpha", ip("192.168.1.20")), Some(b"first cert".to_vec()));

        vault.save("alpha", ip("192.168.1.20"), b"second");
        assert_eq!(vault.load("alpha", ip("192.168.1.20")), Some(b"second".to_vec()));

        let path = vault.cert_path("alpha", ip("192.168.1.20")).unwrap();
        assert_eq!(fs::read(path)?, b"second");

        Ok(())
    }

    #[test]
    fn test_vault_keys_are_normalized() -> Result<()> {
        let temp = TempDir::new()?;
        let vault = ScratchVault::new(temp.path().to_path_buf())?;

        vault.save("  Alpha-Box ", ip("10.0.0.5"), b"cert");
        assert_eq!(vault.load("alpha-box", ip("10.0.0.5")), Some(b"cert".to_vec()));

        // Same host on another address is a different peer.
        assert_eq!(vault.load("alpha-box", ip("10.0.0.6")), None);
        assert_eq!(vault.load("beta", ip("10.0.0.5")), None);

        Ok(())
    }

    #[test]
    fn test_vault_clear_all() -> Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("certs");
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("leftover.pem"), b"from last run")?;

        let vault = ScratchVault::new(dir.clone())?;
        vault.save("host", ip("fe80::1"), b"cert");
        vault.save_own(b"mine");
        assert_eq!(vault.load_own(), Some(b"mine".to_vec()));

        vault.clear_all();
        assert_eq!(vault.load("host", ip("fe80::1")), None);
        assert_eq!(vault.load_own(), None);
        assert_eq!(fs::read_dir(&dir)?.count(), 0);

        Ok(())
    }

    #[test]
    fn test_vault_clear_peers_keeps_own() -> Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("certs");
        let vault = ScratchVault::new(dir.clone())?;

        vault.save_own(b"mine");
        vault.save("alpha", ip("192.168.1.20"), b"theirs");
        vault.clear_peers();

        assert_eq!(vault.load("alpha", ip("192.168.1.20")), None);
        assert_eq!(vault.load_own(), Some(b"mine".to_vec()));
        let names: Vec<_> = fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![OWN_CERT_FILE.to_string()]);

        Ok(())
    }

    #[test]
    fn test_concurrent_saves_leave_no_temp_files() -> Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("certs");
        let vault = std::sync::Arc::new(ScratchVault::new(dir.clone())?);

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let vault = vault.clone();
                std::thread::spawn(move || vault.save("alpha", ip("10.0.0.5"), &[i; 64]))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = vault.load("alpha", ip("10.0.0.5")).unwrap();
        assert_eq!(stored.len(), 64);
        let names: Vec<_> = fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["alpha.10.0.0.5.pem".to_string()]);

        Ok(())
    }
}
