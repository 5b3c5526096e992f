use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::write_owner_only;

pub const DEFAULT_GROUP_CODE: &str = "Warpinator";

/// Codes shorter than this are accepted but easy to guess.
const RECOMMENDED_CODE_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Stable identifier for this node, advertised to peers.
    pub connect_id: Uuid,
    /// Shared secret that authorizes pairing.
    #[serde(default)]
    pub group_code: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connect_id: Uuid::new_v4(),
            group_code: DEFAULT_GROUP_CODE.to_string(),
        }
    }
}

/// Owner-only JSON file holding the local id and group code.
pub struct SettingsStore {
    path: PathBuf,
    settings: Settings,
}

impl SettingsStore {
    /// Load settings from `path`, creating defaults if the file is missing or
    /// unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }

        let (mut settings, dirty) = match read_settings(&path) {
            Ok(Some(settings)) => (settings, false),
            Ok(None) => {
                tracing::debug!("No settings file at {:?}, making one", path);
                (Settings::default(), true)
            }
            Err(e) => {
                tracing::warn!("Could not load settings file {:?}: {:#}", path, e);
                (Settings::default(), true)
            }
        };

        let dirty = if settings.group_code.is_empty() {
            settings.group_code = DEFAULT_GROUP_CODE.to_string();
            true
        } else {
            dirty
        };
        warn_if_short(&settings.group_code);

        let store = Self { path, settings };
        if dirty {
            store.save()?;
        }
        Ok(store)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn connect_id(&self) -> Uuid {
        self.settings.connect_id
    }

    pub fn group_code(&self) -> &str {
        &self.settings.group_code
    }

    /// Persist a new group code. Returns false when the code was unchanged.
    pub fn set_group_code(&mut self, code: &str) -> Result<bool> {
        if code == self.settings.group_code {
            return Ok(false);
        }
        if code.is_empty() {
            anyhow::bail!("Group code must not be empty");
        }
        warn_if_short(code);

        self.settings.group_code = code.to_string();
        self.save()?;
        tracing::info!("Group code changed");
        Ok(true)
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.settings)?;
        write_owner_only(&self.path, &json)
            .with_context(|| format!("Failed to write settings to {:?}", self.path))
    }
}

fn read_settings(path: &Path) -> Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read(path).context("reading settings file")?;
    let settings = serde_json::from_slice(&data).context("parsing settings file")?;
    Ok(Some(settings))
}

fn warn_if_short(code: &str) {
    if code.chars().count() < RECOMMENDED_CODE_LEN {
        tracing::warn!(
            "Group code is short, consider something longer than {} characters",
            RECOMMENDED_CODE_LEN
        );
    }
}
