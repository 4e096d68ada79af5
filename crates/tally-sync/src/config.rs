//! # Sync Configuration
//!
//! Configuration management for the sync engine.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DEVICE_ID=abc-123                                            │
//! │     TALLY_DEBOUNCE_MS=250                                              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/tally/sync.toml (Linux)                                  │
//! │     ~/Library/Application Support/com.tally.tally/sync.toml (macOS)    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     auto-generated device_id, 300ms debounce                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # sync.toml
//! [device]
//! id = "550e8400-e29b-41d4-a716-446655440000"
//! name = "Register 1"
//!
//! [store]
//! branch_id = "downtown"
//! pos_id = "reg-1"
//!
//! [sync]
//! debounce_ms = 300
//! broadcast_capacity = 256
//! push_capacity = 256
//! database_path = "/var/lib/tally/sync.db"
//! db_max_connections = 4
//! db_busy_timeout_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::validation::{validate_channel, validate_entity_id};
use tally_db::DbConfig;
use tally_core::ScopeTags;

use crate::error::{SyncError, SyncResult};
use crate::store::StoreConfig;

// =============================================================================
// Device Configuration
// =============================================================================

/// Configuration for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Durable device identifier (UUID v4).
    /// Auto-generated on first run if not provided.
    pub id: String,

    /// Human-readable device name (e.g., "Register 1", "Back Office").
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "Back Office".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

// =============================================================================
// Store Location
// =============================================================================

/// Location tags stamped onto every outbound event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Branch (store location) id.
    #[serde(default)]
    pub branch_id: Option<String>,

    /// Register id.
    #[serde(default)]
    pub pos_id: Option<String>,
}

impl LocationConfig {
    /// Converts into advisory scope tags.
    pub fn scope(&self) -> ScopeTags {
        ScopeTags {
            branch_id: self.branch_id.clone(),
            pos_id: self.pos_id.clone(),
        }
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Sync behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Coalescing window for outbound writes (milliseconds).
    /// 0 disables debouncing: every write goes out immediately.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Buffer size of the process-wide broadcast bus.
    #[serde(default = "default_capacity")]
    pub broadcast_capacity: usize,

    /// Buffer size of each per-channel push feed.
    #[serde(default = "default_capacity")]
    pub push_capacity: usize,

    /// Directory for persisted slots. Defaults to the platform data dir.
    #[serde(default)]
    pub slot_dir: Option<PathBuf>,

    /// SQLite event log path. Defaults to the platform data dir.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Event log pool size.
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// How long an append waits for a competing writer (milliseconds).
    #[serde(default = "default_db_busy_timeout_ms")]
    pub db_busy_timeout_ms: u64,
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_capacity() -> usize {
    256
}

fn default_db_max_connections() -> u32 {
    4
}

fn default_db_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            debounce_ms: default_debounce_ms(),
            broadcast_capacity: default_capacity(),
            push_capacity: default_capacity(),
            slot_dir: None,
            database_path: None,
            db_max_connections: default_db_max_connections(),
            db_busy_timeout_ms: default_db_busy_timeout_ms(),
        }
    }
}

// =============================================================================
// Main Sync Configuration
// =============================================================================

/// Complete sync configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Device-specific configuration.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Location tags.
    #[serde(default)]
    pub store: LocationConfig,

    /// Sync behavior settings.
    #[serde(default)]
    pub sync: SyncSettings,
}

impl SyncConfig {
    /// Creates a new config with defaults and a generated device ID.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (sync.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.device.id.trim().is_empty() {
            return Err(SyncError::MissingDeviceId);
        }

        // The device id is the first half of every origin token
        if self.device.id.contains(':') {
            return Err(SyncError::InvalidConfig(
                "device id must not contain ':'".into(),
            ));
        }

        if self.sync.broadcast_capacity == 0 || self.sync.push_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "broadcast_capacity and push_capacity must be greater than 0".into(),
            ));
        }

        if self.sync.db_max_connections == 0 {
            return Err(SyncError::InvalidConfig(
                "db_max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("TALLY_DEVICE_ID") {
            debug!(device_id = %id, "Overriding device ID from environment");
            self.device.id = id;
        }

        if let Ok(name) = std::env::var("TALLY_DEVICE_NAME") {
            self.device.name = name;
        }

        if let Ok(branch) = std::env::var("TALLY_BRANCH_ID") {
            self.store.branch_id = Some(branch);
        }

        if let Ok(pos) = std::env::var("TALLY_POS_ID") {
            self.store.pos_id = Some(pos);
        }

        if let Ok(ms) = std::env::var("TALLY_DEBOUNCE_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => {
                    debug!(debounce_ms = ms, "Overriding debounce from environment");
                    self.sync.debounce_ms = ms;
                }
                Err(_) => warn!(value = %ms, "Ignoring invalid TALLY_DEBOUNCE_MS"),
            }
        }

        if let Ok(path) = std::env::var("TALLY_SLOT_DIR") {
            self.sync.slot_dir = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("TALLY_DATABASE_PATH") {
            self.sync.database_path = Some(PathBuf::from(path));
        }

        if let Ok(max) = std::env::var("TALLY_DB_MAX_CONNECTIONS") {
            match max.parse::<u32>() {
                Ok(max) => self.sync.db_max_connections = max,
                Err(_) => warn!(value = %max, "Ignoring invalid TALLY_DB_MAX_CONNECTIONS"),
            }
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "tally", "tally")
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("sync.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Returns the device ID.
    pub fn device_id(&self) -> &str {
        &self.device.id
    }

    /// Returns the outbound debounce window, if any.
    pub fn debounce(&self) -> Option<Duration> {
        match self.sync.debounce_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Returns the slot directory (configured or platform default).
    pub fn slot_dir(&self) -> Option<PathBuf> {
        self.sync
            .slot_dir
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("slots")))
    }

    /// Returns the event log path (configured or platform default).
    pub fn database_path(&self) -> Option<PathBuf> {
        self.sync
            .database_path
            .clone()
            .or_else(|| Self::project_dirs().map(|dirs| dirs.data_dir().join("sync.db")))
    }

    /// Event log database settings at the configured path.
    pub fn db_config(&self) -> Option<DbConfig> {
        self.database_path().map(|path| {
            DbConfig::new(path)
                .max_connections(self.sync.db_max_connections)
                .busy_timeout(Duration::from_millis(self.sync.db_busy_timeout_ms))
        })
    }

    /// Builds the store configuration for one entity.
    pub fn store_config(&self, channel: &str, entity_id: &str) -> SyncResult<StoreConfig> {
        validate_channel(channel)?;
        validate_entity_id(entity_id)?;

        let mut config = StoreConfig::new(channel, entity_id).with_scope(self.store.scope());
        if let Some(window) = self.debounce() {
            config = config.with_debounce(window);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert!(!config.device.id.is_empty()); // Auto-generated
        assert_eq!(config.sync.debounce_ms, 300);
        assert_eq!(config.debounce(), Some(Duration::from_millis(300)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.device.id = String::new();
        assert!(matches!(config.validate(), Err(SyncError::MissingDeviceId)));

        config.device.id = "dev:1".to_string();
        assert!(config.validate().unwrap_err().is_config_error());

        config.device.id = "dev-1".to_string();
        config.sync.push_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_debounce_disables_window() {
        let mut config = SyncConfig::default();
        config.sync.debounce_ms = 0;
        assert_eq!(config.debounce(), None);

        let store = config.store_config("inventory", "store-001").unwrap();
        assert_eq!(store.debounce, None);
    }

    #[test]
    fn test_store_config_carries_scope() {
        let mut config = SyncConfig::default();
        config.store.branch_id = Some("downtown".into());

        let store = config.store_config("cash_session", "reg-1").unwrap();
        assert_eq!(store.scope.branch_id.as_deref(), Some("downtown"));
        assert_eq!(store.channel, "cash_session");

        assert!(config.store_config("Bad Channel", "reg-1").is_err());
        assert!(config.store_config("inventory", "a:b").is_err());
    }

    #[test]
    fn test_db_config_follows_sync_settings() {
        let mut config = SyncConfig::default();
        config.sync.database_path = Some(PathBuf::from("/tmp/tally/sync.db"));
        config.sync.db_max_connections = 2;
        config.sync.db_busy_timeout_ms = 750;

        let db = config.db_config().unwrap();
        assert_eq!(db.location, tally_db::DbLocation::File(PathBuf::from("/tmp/tally/sync.db")));
        assert_eq!(db.max_connections, 2);
        assert_eq!(db.busy_timeout, Duration::from_millis(750));

        config.sync.db_max_connections = 0;
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_toml_round_trip() {
        let toml_str = r#"
            [device]
            id = "dev-42"

            [store]
            branch_id = "north"

            [sync]
            debounce_ms = 50
        "#;
        let config: SyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.id, "dev-42");
        assert_eq!(config.device.name, "Back Office");
        assert_eq!(config.sync.debounce_ms, 50);
        assert_eq!(config.sync.broadcast_capacity, 256);

        let out = toml::to_string_pretty(&config).unwrap();
        assert!(out.contains("[device]"));
        assert!(out.contains("[sync]"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("tally-config-{}", Uuid::new_v4()));
        let path = dir.join("sync.toml");

        let mut config = SyncConfig::default();
        config.device.id = "dev-saved".into();
        config.sync.debounce_ms = 10;
        config.save(Some(path.clone())).unwrap();

        let loaded = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.sync.debounce_ms, 10);

        let _ = std::fs::remove_dir_all(dir);
    }
}
