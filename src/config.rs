//! Configuration management for HAT Core.
//!
//! This module handles loading and saving application configuration to/from
//! a JSON file. The config directory is supplied by the host application.
//!
//! Includes:
//! - install_id: UUID7 identifying this installation (generated on first run)
//! - hat_domain: The user's HAT address (e.g. "alice.hubofallthings.net")
//! - location: Sample filter preferences and the tracking switch
//! - sync: Batch size, retention window, execution window and remote tables

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HatError, HatResult};
use crate::models::LocationPreferences;
use crate::store::DEFAULT_RETENTION_DAYS;

/// Location capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Whether fixes from the sensor are recorded at all
    #[serde(default = "default_true")]
    pub track_device: bool,
    #[serde(default)]
    pub preferences: LocationPreferences,
}

fn default_true() -> bool {
    true
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            track_device: true,
            preferences: LocationPreferences::default(),
        }
    }
}

/// A remote table identified by name and source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub source: String,
}

fn default_notes_table() -> TableConfig {
    TableConfig {
        name: "notablesv1".to_string(),
        source: "rumpel".to_string(),
    }
}

fn default_locations_table() -> TableConfig {
    TableConfig {
        name: "locations".to_string(),
        source: "iphone".to_string(),
    }
}

/// Sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum samples uploaded per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Samples older than this are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Default execution window for a cycle when the host gives none
    #[serde(default = "default_cycle_window_secs")]
    pub cycle_window_secs: u64,
    /// Per-request timeout of the HTTP transport
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_notes_table")]
    pub notes_table: TableConfig,
    #[serde(default = "default_locations_table")]
    pub locations_table: TableConfig,
    /// Endpoint notified after a note is posted (None disables it)
    #[serde(default = "default_bulletin_url")]
    pub bulletin_url: Option<String>,
}

/// Upper bound for `retention_days` (ten years)
pub const MAX_RETENTION_DAYS: i64 = 3650;

fn default_batch_size() -> usize {
    100
}

fn default_retention_days() -> i64 {
    DEFAULT_RETENTION_DAYS
}

fn default_cycle_window_secs() -> u64 {
    25
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_bulletin_url() -> Option<String> {
    Some("https://notables.hubofallthings.com/api/bulletin/tickle".to_string())
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
            cycle_window_secs: default_cycle_window_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            notes_table: default_notes_table(),
            locations_table: default_locations_table(),
            bulletin_url: default_bulletin_url(),
        }
    }
}

fn validate_retention_days(days: i64) -> HatResult<()> {
    if !(1..=MAX_RETENTION_DAYS).contains(&days) {
        return Err(HatError::validation(
            "sync.retention_days",
            format!("must be between 1 and {}", MAX_RETENTION_DAYS),
        ));
    }
    Ok(())
}

impl SyncConfig {
    /// The retention window, clamped to `1..=MAX_RETENTION_DAYS` days.
    pub fn retention_window(&self) -> chrono::Duration {
        let days = self.retention_days.clamp(1, MAX_RETENTION_DAYS);
        chrono::Duration::try_days(days).unwrap_or(chrono::Duration::days(DEFAULT_RETENTION_DAYS))
    }

    pub fn cycle_window(&self) -> Duration {
        Duration::from_secs(self.cycle_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigData {
    /// Path to the local store file
    #[serde(default)]
    pub database_file: String,
    /// Installation ID (UUID7 hex)
    #[serde(default = "generate_install_id")]
    pub install_id: String,
    /// The user's HAT domain (None until logged in)
    pub hat_domain: Option<String>,
    #[serde(default)]
    pub location: LocationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn generate_install_id() -> String {
    Uuid::now_v7().simple().to_string()
}

impl ConfigData {
    /// Reset out-of-range values read from disk to their defaults.
    fn sanitize(&mut self) {
        if let Err(e) = self.location.preferences.validate() {
            tracing::warn!(error = %e, "Invalid location preferences in config, using defaults");
            self.location.preferences = LocationPreferences::default();
        }
        if self.sync.batch_size == 0 {
            tracing::warn!("Invalid sync.batch_size 0 in config, using default");
            self.sync.batch_size = default_batch_size();
        }
        if let Err(e) = validate_retention_days(self.sync.retention_days) {
            tracing::warn!(error = %e, "Invalid retention in config, using default");
            self.sync.retention_days = default_retention_days();
        }
    }
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            database_file: String::new(),
            install_id: generate_install_id(),
            hat_domain: None,
            location: LocationConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Configuration manager
pub struct Config {
    config_dir: PathBuf,
    config_file: PathBuf,
    data: ConfigData,
}

impl Config {
    /// Load the configuration from `config_dir`, creating defaults on first run.
    pub fn new(config_dir: PathBuf) -> HatResult<Self> {
        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let default_data = || {
            let mut default = ConfigData::default();
            default.database_file = config_dir.join("hat.db").to_string_lossy().to_string();
            default
        };

        let mut data = if config_file.exists() {
            match fs::read_to_string(&config_file) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Config file unreadable, using defaults");
                    default_data()
                }),
                Err(e) => {
                    tracing::warn!(error = %e, "Config file unreadable, using defaults");
                    default_data()
                }
            }
        } else {
            default_data()
        };
        data.sanitize();

        let config = Self {
            config_dir,
            config_file,
            data,
        };

        // Save default config if it doesn't exist
        if !config.config_file.exists() {
            config.save()?;
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> HatResult<()> {
        let content = serde_json::to_string_pretty(&self.data)?;
        fs::write(&self.config_file, content)?;
        Ok(())
    }

    /// Get the configuration directory path
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Get the local store file path
    pub fn database_file(&self) -> &str {
        &self.data.database_file
    }

    pub fn install_id(&self) -> &str {
        &self.data.install_id
    }

    pub fn hat_domain(&self) -> Option<&str> {
        self.data.hat_domain.as_deref()
    }

    pub fn set_hat_domain(&mut self, domain: Option<&str>) -> HatResult<()> {
        self.data.hat_domain = domain.map(String::from);
        self.save()
    }

    pub fn location_preferences(&self) -> LocationPreferences {
        self.data.location.preferences
    }

    /// Replace location preferences
    pub fn set_location_preferences(&mut self, prefs: LocationPreferences) -> HatResult<()> {
        prefs.validate()?;
        self.data.location.preferences = prefs;
        self.save()
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.data.location.track_device
    }

    pub fn set_tracking_enabled(&mut self, enabled: bool) -> HatResult<()> {
        self.data.location.track_device = enabled;
        self.save()
    }

    /// Get sync configuration
    pub fn sync_config(&self) -> &SyncConfig {
        &self.data.sync
    }

    pub fn set_batch_size(&mut self, batch_size: usize) -> HatResult<()> {
        if batch_size == 0 {
            return Err(HatError::validation("sync.batch_size", "must be at least 1"));
        }
        self.data.sync.batch_size = batch_size;
        self.save()
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "database_file" => Some(self.data.database_file.clone()),
            "install_id" => Some(self.data.install_id.clone()),
            "hat_domain" => self.data.hat_domain.clone(),
            "track_device" => Some(self.data.location.track_device.to_string()),
            "batch_size" => Some(self.data.sync.batch_size.to_string()),
            "retention_days" => Some(self.data.sync.retention_days.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value
    pub fn set(&mut self, key: &str, value: &str) -> HatResult<()> {
        match key {
            "database_file" => self.data.database_file = value.to_string(),
            "hat_domain" => self.data.hat_domain = Some(value.to_string()),
            "track_device" => {
                self.data.location.track_device = value
                    .parse()
                    .map_err(|_| HatError::validation(key, "expected true or false"))?
            }
            "batch_size" => {
                let size: usize = value
                    .parse()
                    .map_err(|_| HatError::validation(key, "expected a positive integer"))?;
                if size == 0 {
                    return Err(HatError::validation(key, "must be at least 1"));
                }
                self.data.sync.batch_size = size;
            }
            "retention_days" => {
                let days: i64 = value
                    .parse()
                    .map_err(|_| HatError::validation(key, "expected an integer"))?;
                validate_retention_days(days)?;
                self.data.sync.retention_days = days;
            }
            _ => return Err(HatError::Config(format!("Unknown config key: {}", key))),
        }
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::new(temp_dir.path().to_path_buf()).unwrap();

        assert_eq!(config.install_id().len(), 32);
        assert!(config.hat_domain().is_none());
        assert!(config.is_tracking_enabled());
        assert_eq!(config.sync_config().batch_size, 100);
        assert_eq!(config.sync_config().retention_days, 7);
        assert_eq!(config.sync_config().notes_table.name, "notablesv1");
        assert_eq!(config.sync_config().notes_table.source, "rumpel");
        assert!(config.database_file().ends_with("hat.db"));
        assert!(temp_dir.path().join("config.json").exists());
    }

    #[test]
    fn test_config_persistence() {
        let temp_dir = TempDir::new().unwrap();

        let install_id = {
            let mut config = Config::new(temp_dir.path().to_path_buf()).unwrap();
            config.set_hat_domain(Some("alice.hubofallthings.net")).unwrap();
            config.set_tracking_enabled(false).unwrap();
            config
                .set_location_preferences(LocationPreferences {
                    desired_accuracy: 10.0,
                    distance_filter: 25.0,
                    max_stale_secs: 600,
                })
                .unwrap();
            config.install_id().to_string()
        };

        let config = Config::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(config.install_id(), install_id);
        assert_eq!(config.hat_domain(), Some("alice.hubofallthings.net"));
        assert!(!config.is_tracking_enabled());
        assert_eq!(config.location_preferences().distance_filter, 25.0);
        assert_eq!(config.location_preferences().max_stale_secs, 600);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{"hat_domain": "bob.hubat.net", "sync": {"batch_size": 5}}"#,
        )
        .unwrap();

        let config = Config::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(config.hat_domain(), Some("bob.hubat.net"));
        assert_eq!(config.sync_config().batch_size, 5);
        assert_eq!(config.sync_config().retention_days, 7);
        assert_eq!(config.location_preferences(), LocationPreferences::default());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("config.json"), "not json").unwrap();

        let config = Config::new(temp_dir.path().to_path_buf()).unwrap();
        assert!(config.hat_domain().is_none());
        assert!(config.database_file().ends_with("hat.db"));
    }

    #[test]
    fn test_negative_preferences_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(temp_dir.path().to_path_buf()).unwrap();
        let result = config.set_location_preferences(LocationPreferences {
            desired_accuracy: -1.0,
            ..LocationPreferences::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_get_set() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(temp_dir.path().to_path_buf()).unwrap();

        config.set("batch_size", "25").unwrap();
        assert_eq!(config.get("batch_size"), Some("25".to_string()));
        assert!(config.set("batch_size", "0").is_err());
        assert!(config.set("track_device", "maybe").is_err());
        assert!(matches!(
            config.set("colour", "blue"),
            Err(HatError::Config(_))
        ));
        assert!(config.get("colour").is_none());
    }

    #[test]
    fn test_retention_range() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(config.set("retention_days", "1000000000").is_err());
        assert!(config.set("retention_days", "-1").is_err());
        assert!(config.set("retention_days", "0").is_err());
        assert_eq!(config.sync_config().retention_days, 7);

        config.set("retention_days", "30").unwrap();
        assert_eq!(config.sync_config().retention_window(), chrono::Duration::days(30));
    }

    #[test]
    fn test_huge_stale_interval_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::new(temp_dir.path().to_path_buf()).unwrap();
        let result = config.set_location_preferences(LocationPreferences {
            max_stale_secs: u64::MAX,
            ..LocationPreferences::default()
        });
        assert!(matches!(result, Err(HatError::Validation { .. })));
        assert_eq!(config.location_preferences(), LocationPreferences::default());
    }

    #[test]
    fn test_out_of_range_file_values_reset() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("config.json"),
            r#"{
                "hat_domain": "bob.hubat.net",
                "location": {"preferences": {"max_stale_secs": 18446744073709551615}},
                "sync": {"batch_size": 0, "retention_days": 1000000000}
            }"#,
        )
        .unwrap();

        let config = Config::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(config.hat_domain(), Some("bob.hubat.net"));
        assert_eq!(config.sync_config().batch_size, 100);
        assert_eq!(config.sync_config().retention_days, 7);
        assert_eq!(config.location_preferences(), LocationPreferences::default());
    }

    #[test]
    fn test_retention_window_clamped() {
        let sync = SyncConfig {
            retention_days: i64::MAX,
            ..SyncConfig::default()
        };
        assert_eq!(
            sync.retention_window(),
            chrono::Duration::days(MAX_RETENTION_DAYS)
        );
    }

    #[test]
    fn test_windows() {
        let sync = SyncConfig::default();
        assert_eq!(sync.retention_window(), chrono::Duration::days(7));
        assert_eq!(sync.cycle_window(), Duration::from_secs(25));
    }
}
