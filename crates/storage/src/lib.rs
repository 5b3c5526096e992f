//! On-disk state for a pairing node: the trusted peer certificate vault and
//! the small owner-only settings file.

mod settings;
mod vault;

pub use settings::{Settings, SettingsStore, DEFAULT_GROUP_CODE};
pub use vault::{CertificateVault, ScratchVault};

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Replace `path` with `data`, readable and writable by the owner only.
///
/// The old file is removed first and the new one is created exclusively, so a
/// pre-existing file with looser permissions is never reused.
pub fn write_owner_only(path: &Path, data: &[u8]) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_owner_only_replaces_content() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("secret");

        write_owner_only(&path, b"first")?;
        write_owner_only(&path, b"second")?;
        assert_eq!(fs::read(&path)?, b"second");

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_write_owner_only_mode() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new()?;
        let path = temp.path().join("secret");
        fs::write(&path, b"loose")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;

        write_owner_only(&path, b"tight")?;
        let mode = fs::metadata(&path)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        Ok(())
    }
}
