//! Persistent settings
//!
//! Stored as a small versioned JSON document. A missing file is created
//! with defaults; an unreadable one is reported and defaults are used.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed settings: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings version {found} not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    /// Apply cached patches to started processes
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Reported patch point; the entry address when unset
    #[serde(default)]
    pub primary_patch_address: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            enabled: true,
            primary_patch_address: None,
        }
    }
}

impl Settings {
    /// `$AUTOPATCH_CONFIG`, else `$XDG_CONFIG_HOME/autopatch`, else `~/.config/autopatch`
    pub fn default_path() -> PathBuf {
        if let Some(path) = std::env::var_os("AUTOPATCH_CONFIG") {
            return PathBuf::from(path);
        }
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("autopatch").join(SETTINGS_FILE)
    }

    pub fn read_from(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        if settings.version != SETTINGS_VERSION {
            return Err(SettingsError::Version {
                found: settings.version,
                expected: SETTINGS_VERSION,
            });
        }
        Ok(settings)
    }

    /// Load settings, creating the file with defaults if it does not exist
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            let settings = Self::default();
            match settings.save(path) {
                Ok(()) => log::info!("Created default settings at {}", path.display()),
                Err(e) => log::warn!("Could not write default settings: {}", e),
            }
            return settings;
        }

        match Self::read_from(path) {
            Ok(settings) => {
                log::debug!("Loaded settings from {}: {:?}", path.display(), settings);
                settings
            }
            Err(e) => {
                log::error!("Failed to load settings from {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
