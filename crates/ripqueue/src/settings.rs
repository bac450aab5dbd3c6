//! Global tunables and their on-disk persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Notification toggles consulted before generic callbacks fire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationSettings {
    #[serde(default = "default_true")]
    pub on_completion: bool,
    #[serde(default = "default_true")]
    pub on_failure: bool,
    #[serde(default = "default_true")]
    pub on_queue_empty: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            on_completion: true,
            on_failure: true,
            on_queue_empty: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    2
}

fn default_test_duration() -> u64 {
    60
}

fn default_preset() -> String {
    "Fast 1080p30".to_string()
}

fn default_poll_interval() -> u64 {
    3
}

/// Process-wide encoding settings. Replace-on-write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub testing_mode: bool,
    #[serde(default = "default_test_duration")]
    pub test_duration_seconds: u64,
    #[serde(default)]
    pub output_directory: PathBuf,
    #[serde(default = "default_preset")]
    pub default_preset: String,
    #[serde(default)]
    pub auto_submit: bool,
    #[serde(default = "default_poll_interval")]
    pub progress_poll_interval_secs: u64,
    #[serde(default)]
    pub notifications: NotificationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            testing_mode: false,
            test_duration_seconds: default_test_duration(),
            output_directory: PathBuf::new(),
            default_preset: default_preset(),
            auto_submit: false,
            progress_poll_interval_secs: default_poll_interval(),
            notifications: NotificationSettings::default(),
        }
    }
}

impl Settings {
    /// The concurrency limit is never allowed below one worker.
    pub fn clamp(mut self) -> Self {
        if self.max_concurrent == 0 {
            log::warn!("max_concurrent of 0 clamped to 1");
            self.max_concurrent = 1;
        }
        self
    }
}

/// Loads settings from `path`, writing defaults out on first run.
///
/// An unreadable or malformed file logs an error and falls back to
/// defaults rather than failing startup.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Settings {
    let path = path.as_ref();

    if !path.exists() {
        let settings = Settings::default();
        if let Err(e) = save_settings(path, &settings) {
            log::error!("Could not write default settings to {}: {}", path.display(), e);
        }
        return settings;
    }

    match try_load_settings(path) {
        Ok(settings) => settings.clamp(),
        Err(e) => {
            log::error!("Could not load settings from {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

fn try_load_settings(path: &Path) -> Result<Settings, SettingsError> {
    let content = std::fs::read_to_string(path).map_err(|e| SettingsError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let settings: Settings = serde_json::from_str(&content)?;
    Ok(settings)
}

/// Persists settings as pretty JSON at `path`.
pub fn save_settings<P: AsRef<Path>>(path: P, settings: &Settings) -> Result<(), SettingsError> {
    let path = path.as_ref();
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json).map_err(|e| SettingsError::WriteFile {
        path: path.to_path_buf(),
        source: e,
    })
}
