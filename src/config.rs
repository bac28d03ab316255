//! Client settings
//!
//! Backend URL, credentials and the preview cache lifetime, persisted as
//! JSON in the platform config directory. Environment variables override
//! the stored connection settings.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default backend URL
pub const DEFAULT_URL: &str = "http://127.0.0.1:20772";

/// Default preview cache lifetime: 7 days
pub const DEFAULT_PREVIEW_CACHE_LIFETIME_MS: u64 = 604_800_000;

/// Application directory name under the platform config/cache dirs
const APP_DIR: &str = "chinachu-preview";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid preview cache lifetime {0:?}: expected milliseconds")]
    InvalidLifetime(String),

    #[error("Unknown setting: {0}")]
    UnknownKey(String),
}

/// Persisted client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Backend base URL
    pub url: String,
    /// Basic auth user (empty for none)
    pub user: String,
    /// Basic auth password (only used with a user)
    pub password: String,
    /// Preview cache lifetime in milliseconds
    pub preview_cache_lifetime: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            user: String::new(),
            password: String::new(),
            preview_cache_lifetime: DEFAULT_PREVIEW_CACHE_LIFETIME_MS,
        }
    }
}

impl Settings {
    /// Path of the settings file in the platform config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_DIR)
            .join("settings.json")
    }

    /// Directory for the persistent preview cache
    pub fn cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(APP_DIR)
    }

    /// Load settings from disk, falling back to defaults.
    ///
    /// Missing fields take their default values; an unreadable or corrupt
    /// file is logged and ignored.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No settings file, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable settings file");
                Self::default()
            }
        }
    }

    /// Apply `CHINACHU_URL`, `CHINACHU_USER` and `CHINACHU_PASSWORD`
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("CHINACHU_URL") {
            self.url = url;
        }
        if let Ok(user) = std::env::var("CHINACHU_USER") {
            self.user = user;
        }
        if let Ok(password) = std::env::var("CHINACHU_PASSWORD") {
            self.password = password;
        }
        self
    }

    /// Write settings to disk atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or(Path::new("/tmp"));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;

        let json = serde_json::to_vec_pretty(self).context("Failed to serialize settings")?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .context("Failed to create temp file for settings")?;
        tmp.write_all(&json).context("Failed to write settings")?;
        tmp.persist(path)
            .with_context(|| format!("Failed to persist settings: {:?}", path))?;

        debug!(path = %path.display(), "Saved settings");
        Ok(())
    }

    /// Preview cache lifetime as a Duration
    pub fn preview_cache_lifetime(&self) -> Duration {
        Duration::from_millis(self.preview_cache_lifetime)
    }

    /// Update the preview cache lifetime from user input.
    ///
    /// Input must be a non-negative integer number of milliseconds.
    /// Anything else is rejected and the previous lifetime kept.
    pub fn set_preview_cache_lifetime(&mut self, value: &str) -> Result<(), ConfigError> {
        let lifetime = value
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidLifetime(value.to_string()))?;
        self.preview_cache_lifetime = lifetime;
        Ok(())
    }

    /// Update a setting by name
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "url" => self.url = value.to_string(),
            "user" => self.user = value.to_string(),
            "password" => self.password = value.to_string(),
            "lifetime" | "previewCacheLifetime" => self.set_preview_cache_lifetime(value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}
