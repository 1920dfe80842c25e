//! Session configuration.
//!
//! Priority: environment variables > settings file > defaults. The settings
//! file lives at `<config dir>/remotecam/settings.json` and accepts both
//! camelCase and snake_case keys.

use log::{debug, warn};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ptp::ProbeHint;

const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EVENT_POLL_INTERVAL_MS: u64 = 100;
/// First SD card slot on EOS bodies.
const DEFAULT_BROWSE_STORAGE_ID: u32 = 0x0002_0001;
/// Picture folder handle EOS bodies report on the SD card.
const DEFAULT_BROWSE_PARENT_HANDLE: u32 = 0x9000_0000;

/// User settings as stored in settings.json. Missing keys fall back to defaults.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(alias = "openTimeoutSecs", default)]
    pub open_timeout_secs: Option<u64>,
    #[serde(alias = "eventPollIntervalMs", default)]
    pub event_poll_interval_ms: Option<u64>,
    #[serde(alias = "preferredLocationId", default)]
    pub preferred_location_id: Option<u64>,
    #[serde(alias = "browseStorageId", default)]
    pub browse_storage_id: Option<u32>,
    #[serde(alias = "browseParentHandle", default)]
    pub browse_parent_handle: Option<u32>,
}

/// Path of the settings file, if the platform has a config directory.
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("remotecam").join("settings.json"))
}

/// Loads settings from `path`. Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_settings(path: &Path) -> Settings {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            debug!("No settings at {}: {}", path.display(), e);
            return Settings::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Ignoring unreadable settings file {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

/// Configuration for the camera session and its USB transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub open_timeout_secs: u64,
    pub event_poll_interval_ms: u64,
    /// USB location to probe first.
    pub preferred_location_id: Option<u64>,
    /// Storage listed by `list_remote_filenames`.
    pub browse_storage_id: u32,
    /// Folder listed by `list_remote_filenames`.
    pub browse_parent_handle: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
            event_poll_interval_ms: DEFAULT_EVENT_POLL_INTERVAL_MS,
            preferred_location_id: None,
            browse_storage_id: DEFAULT_BROWSE_STORAGE_ID,
            browse_parent_handle: DEFAULT_BROWSE_PARENT_HANDLE,
        }
    }
}

impl SessionConfig {
    /// Loads the settings file and applies env var overrides.
    pub fn load() -> Self {
        let settings = settings_path().map(|p| load_settings(&p)).unwrap_or_default();
        Self::from_settings_and_env(&settings)
    }

    /// Builds the configuration with priority: env vars > user settings > defaults.
    pub fn from_settings_and_env(settings: &Settings) -> Self {
        Self::from_sources(settings, |key| env::var(key).ok())
    }

    /// Like `from_settings_and_env`, reading env vars through `env_var`.
    pub fn from_sources(settings: &Settings, env_var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        // 1. REMOTECAM_OPEN_TIMEOUT_SECS, 2. openTimeoutSecs, 3. 30s
        let open_timeout_secs = env_var("REMOTECAM_OPEN_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .or(settings.open_timeout_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(defaults.open_timeout_secs);

        // 1. REMOTECAM_LOCATION_ID, 2. preferredLocationId, 3. first camera found
        let preferred_location_id = env_var("REMOTECAM_LOCATION_ID")
            .and_then(|v| v.parse().ok())
            .or(settings.preferred_location_id);

        Self {
            open_timeout_secs,
            event_poll_interval_ms: settings
                .event_poll_interval_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(defaults.event_poll_interval_ms),
            preferred_location_id,
            browse_storage_id: settings.browse_storage_id.unwrap_or(defaults.browse_storage_id),
            browse_parent_handle: settings.browse_parent_handle.unwrap_or(defaults.browse_parent_handle),
        }
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_millis(self.event_poll_interval_ms)
    }

    /// Probe hint used when the host starts without a specific device.
    pub fn initial_hint(&self) -> ProbeHint {
        ProbeHint {
            location_id: self.preferred_location_id,
        }
    }
}
