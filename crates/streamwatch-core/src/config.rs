//! Persistent monitoring configuration
//!
//! The configuration document holds the configured sources, the grid shape,
//! notification settings, and monitor tuning. [`JsonFileStore`] keeps it in
//! `<data_dir>/streamwatch/config.json` (`%APPDATA%` on Windows).

use crate::alerts::log::DEFAULT_MAX_ENTRIES;
use crate::alerts::router::AlertSettings;
use crate::meter::{MeterSettings, OutputKind};
use crate::monitor::backoff::RetryPolicy;
use crate::monitor::controller::ControllerConfig;
use crate::monitor::state::Source;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

fn default_grid_layout() -> String {
    "2x2".to_string()
}

fn default_stall_grace_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_max_alerts() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_snapshot_interval_ms() -> u64 {
    50
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid grid layout: {0}")]
    InvalidGridLayout(String),
}

/// Monitor tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Buffering stall tolerated before a forced re-attach; 0 disables
    #[serde(default = "default_stall_grace_ms")]
    pub stall_grace_ms: u64,
    /// New sources start with local mute on
    #[serde(default = "default_true")]
    pub sources_start_muted: bool,
    #[serde(default)]
    pub meter_output: OutputKind,
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
    /// Endpoint receiving email notification requests
    #[serde(default)]
    pub email_endpoint: Option<String>,
    /// Keep the alert tone suspended until an operator gesture resumes it
    #[serde(default = "default_true")]
    pub require_audio_gesture: bool,
    /// Cadence of live snapshots pushed to UI clients
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stall_grace_ms: default_stall_grace_ms(),
            sources_start_muted: true,
            meter_output: OutputKind::default(),
            max_alerts: default_max_alerts(),
            email_endpoint: None,
            require_audio_gesture: true,
            snapshot_interval_ms: default_snapshot_interval_ms(),
        }
    }
}

impl MonitorSettings {
    /// Replace a retry policy that fails validation with the default one
    pub fn validated(mut self) -> Self {
        if let Err(reason) = self.retry.validate() {
            tracing::warn!(policy = ?self.retry, "Invalid retry policy, using defaults: {}", reason);
            self.retry = RetryPolicy::default();
        }
        self
    }

    /// Controller configuration for a source with the given local mute
    pub fn controller_config(&self, muted: bool, volume: f32) -> ControllerConfig {
        ControllerConfig {
            retry: self.retry,
            stall_grace: (self.stall_grace_ms > 0)
                .then(|| Duration::from_millis(self.stall_grace_ms)),
            meter: MeterSettings {
                output: self.meter_output,
                ..MeterSettings::default()
            },
            muted,
            volume,
        }
    }
}

/// The persisted configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Grid shape as `<columns>x<rows>`, e.g. "2x2" or "4x3"
    #[serde(default = "default_grid_layout")]
    pub grid_layout: String,
    #[serde(default)]
    pub notifications: AlertSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            grid_layout: default_grid_layout(),
            notifications: AlertSettings::default(),
            monitor: MonitorSettings::default(),
        }
    }
}

/// Parse a `<columns>x<rows>` grid layout
pub fn parse_grid_layout(layout: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidGridLayout(layout.to_string());
    let (cols, rows) = layout
        .trim()
        .split_once(|c: char| c == 'x' || c == 'X')
        .ok_or_else(invalid)?;
    let cols: u32 = cols.trim().parse().map_err(|_| invalid())?;
    let rows: u32 = rows.trim().parse().map_err(|_| invalid())?;
    if cols == 0 || rows == 0 {
        return Err(invalid());
    }
    Ok((cols, rows))
}

/// Load/save boundary for the configuration
pub trait ConfigStore: Send + Sync {
    /// The saved configuration, or `None` when nothing usable is stored
    fn load(&self) -> Option<Configuration>;

    fn save(&self, config: &Configuration) -> Result<(), ConfigError>;
}

/// JSON file configuration store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl Default for JsonFileStore {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/streamwatch/config.json`
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("streamwatch")
            .join("config.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Option<Configuration> {
        let path = &self.path;
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "Loaded config from disk");
                    Some(config)
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to parse config, ignoring it");
                    None
                }
            },
            Err(_) => {
                tracing::info!(path = %path.display(), "No config file found");
                None
            }
        }
    }

    fn save(&self, config: &Configuration) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, json)?;
        tracing::info!(path = %self.path.display(), "Config saved to disk");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Configuration::default();
        assert!(config.sources.is_empty());
        assert_eq!(config.grid_layout, "2x2");
        assert!(config.notifications.audible_enabled);
        assert!(!config.notifications.email_enabled);
        assert!(config.monitor.sources_start_muted);
        assert_eq!(config.monitor.max_alerts, 10_000);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: Configuration = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let json = r#"{
            "sources": [{"id": "a", "name": "Studio", "url": "http://x/a.m3u8"}],
            "notifications": {"email_enabled": true, "email_address": "ops@example.com"},
            "monitor": {"retry": {"max_delay_ms": 5000.0}}
        }"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.grid_layout, "2x2");
        assert!(config.notifications.audible_enabled);
        assert_eq!(config.monitor.retry.max_delay_ms, 5000.0);
        assert_eq!(config.monitor.retry.initial_delay_ms, 1000.0);
        assert_eq!(config.monitor.stall_grace_ms, 10_000);
    }

    #[test]
    fn test_bad_retry_policy_falls_back_to_defaults() {
        let json = r#"{"monitor": {"retry": {"initial_delay_ms": 0.0, "backoff_factor": 0.5}}}"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        let monitor = config.monitor.validated();
        assert_eq!(monitor.retry, RetryPolicy::default());

        let json = r#"{"monitor": {"retry": {"initial_delay_ms": 200.0, "max_delay_ms": 800.0}}}"#;
        let config: Configuration = serde_json::from_str(json).unwrap();
        let monitor = config.monitor.validated();
        assert_eq!(monitor.retry.initial_delay_ms, 200.0);
        assert_eq!(monitor.retry.max_delay_ms, 800.0);
    }

    #[test]
    fn test_grid_layout_parsing() {
        assert_eq!(parse_grid_layout("2x2").unwrap(), (2, 2));
        assert_eq!(parse_grid_layout("4X3").unwrap(), (4, 3));
        assert!(parse_grid_layout("0x3").is_err());
        assert!(parse_grid_layout("wide").is_err());
        assert!(parse_grid_layout("3x").is_err());
    }

    #[test]
    fn test_controller_config_mapping() {
        let mut settings = MonitorSettings::default();
        let config = settings.controller_config(true, 0.8);
        assert_eq!(config.stall_grace, Some(Duration::from_secs(10)));
        assert!(config.muted);
        assert_eq!(config.volume, 0.8);

        settings.stall_grace_ms = 0;
        assert_eq!(settings.controller_config(false, 1.0).stall_grace, None);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("config.json"));
        assert!(store.load().is_none());

        let mut config = Configuration::default();
        config.sources.push(Source::new("a", "Studio", "http://x/a.m3u8"));
        config.grid_layout = "3x3".into();
        store.save(&config).unwrap();

        assert_eq!(store.load(), Some(config));
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(JsonFileStore::new(&path).load().is_none());
    }
}
