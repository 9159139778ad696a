//! # Inventory Configuration
//!
//! TOML file in the platform config directory, overridable by environment.
//!
//! ## Example `inventory.toml`
//! ```toml
//! [database]
//! path = "/var/lib/tillkeeper/tillkeeper.db"
//! max_connections = 5
//! lock_timeout_ms = 3000
//!
//! [inventory]
//! default_location = "main"
//! max_claim_attempts = 3
//! notify_cache = true
//! label_queue_capacity = 256
//!
//! [audit]
//! actor = "till-01"
//! ```
//!
//! ## Precedence
//! ```text
//! defaults  <  inventory.toml  <  TILLKEEPER_* environment variables
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use tillkeeper_core::{DEFAULT_LOCATION_ID, SYSTEM_ACTOR};

use crate::error::{DbError, DbResult};
use crate::pool::DbConfig;

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSection {
    /// SQLite file. `None` means the platform data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Longest a caller waits for a row lock or a pooled connection.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_lock_timeout_ms() -> u64 {
    3000
}

impl Default for DatabaseSection {
    fn default() -> Self {
        DatabaseSection {
            path: None,
            max_connections: default_max_connections(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// Runtime knobs read by the coordinators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySettings {
    /// Stock ledger location for carts that do not name one.
    #[serde(default = "default_location")]
    pub default_location: String,

    /// How many candidate units an unscanned add may try per requested unit.
    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: u32,

    /// Flush cache invalidations after commit.
    #[serde(default = "default_true")]
    pub notify_cache: bool,

    /// Pending label requests before new ones are dropped.
    #[serde(default = "default_label_queue_capacity")]
    pub label_queue_capacity: usize,
}

fn default_location() -> String {
    DEFAULT_LOCATION_ID.to_string()
}

fn default_max_claim_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_label_queue_capacity() -> usize {
    256
}

impl Default for InventorySettings {
    fn default() -> Self {
        InventorySettings {
            default_location: default_location(),
            max_claim_attempts: default_max_claim_attempts(),
            notify_cache: true,
            label_queue_capacity: default_label_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSection {
    /// Name written to `audit_log.actor`.
    #[serde(default = "default_actor")]
    pub actor: String,
}

fn default_actor() -> String {
    SYSTEM_ACTOR.to_string()
}

impl Default for AuditSection {
    fn default() -> Self {
        AuditSection {
            actor: default_actor(),
        }
    }
}

// =============================================================================
// Inventory Config
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InventoryConfig {
    #[serde(default)]
    pub database: DatabaseSection,

    #[serde(default)]
    pub inventory: InventorySettings,

    #[serde(default)]
    pub audit: AuditSection,
}

impl InventoryConfig {
    /// Loads configuration from file and environment.
    pub fn load(config_path: Option<PathBuf>) -> DbResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading inventory config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| DbError::Config(format!("{}: {}", path.display(), e)))?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration, falling back to defaults on any error.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load inventory config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn from_toml(contents: &str) -> DbResult<Self> {
        toml::from_str(contents).map_err(|e| DbError::Config(e.to_string()))
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> DbResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| DbError::Config("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DbError::Config(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self).map_err(|e| DbError::Config(e.to_string()))?;
        std::fs::write(&path, contents).map_err(|e| DbError::Config(e.to_string()))?;

        info!(?path, "Saved inventory config");
        Ok(())
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.database.max_connections == 0 {
            return Err(DbError::Config("database.max_connections must be at least 1".into()));
        }
        if self.database.lock_timeout_ms == 0 {
            return Err(DbError::Config("database.lock_timeout_ms must be positive".into()));
        }
        if self.inventory.default_location.trim().is_empty() {
            return Err(DbError::Config("inventory.default_location is required".into()));
        }
        if self.inventory.max_claim_attempts == 0 {
            return Err(DbError::Config("inventory.max_claim_attempts must be at least 1".into()));
        }
        if self.inventory.label_queue_capacity == 0 {
            return Err(DbError::Config("inventory.label_queue_capacity must be at least 1".into()));
        }
        if self.audit.actor.trim().is_empty() {
            return Err(DbError::Config("audit.actor is required".into()));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TILLKEEPER_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = Some(PathBuf::from(path));
        }

        if let Ok(ms) = std::env::var("TILLKEEPER_LOCK_TIMEOUT_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => self.database.lock_timeout_ms = ms,
                Err(_) => warn!(value = %ms, "Ignoring invalid TILLKEEPER_LOCK_TIMEOUT_MS"),
            }
        }

        if let Ok(location) = std::env::var("TILLKEEPER_DEFAULT_LOCATION") {
            self.inventory.default_location = location;
        }

        if let Ok(actor) = std::env::var("TILLKEEPER_ACTOR") {
            self.audit.actor = actor;
        }

        if let Ok(flag) = std::env::var("TILLKEEPER_NOTIFY_CACHE") {
            match flag.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.inventory.notify_cache = true,
                "0" | "false" | "no" | "off" => self.inventory.notify_cache = false,
                _ => warn!(value = %flag, "Ignoring invalid TILLKEEPER_NOTIFY_CACHE"),
            }
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "tillkeeper", "tillkeeper")
    }

    fn default_config_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("inventory.toml"))
    }

    /// Database file: configured path or `<data dir>/tillkeeper.db`.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .or_else(|| Self::project_dirs().map(|d| d.data_dir().join("tillkeeper.db")))
            .unwrap_or_else(|| PathBuf::from("tillkeeper.db"))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.database.lock_timeout_ms)
    }

    /// Pool configuration derived from this file.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(self.database_path())
            .max_connections(self.database.max_connections)
            .lock_timeout(self.lock_timeout())
            .inventory(self.inventory.clone())
            .actor(self.audit.actor.clone())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = InventoryConfig::from_toml(
            r#"
            [inventory]
            default_location = "backroom"

            [audit]
            actor = "till-02"
            "#,
        )
        .unwrap();

        assert_eq!(config.inventory.default_location, "backroom");
        assert_eq!(config.inventory.max_claim_attempts, 3);
        assert!(config.inventory.notify_cache);
        assert_eq!(config.database.lock_timeout_ms, 3000);
        assert_eq!(config.audit.actor, "till-02");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = InventoryConfig::default();
        config.database.lock_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(DbError::Config(_))));
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("inventory.toml");
        let mut config = InventoryConfig::default();
        config.database.path = Some(PathBuf::from("/tmp/tk.db"));
        config.inventory.notify_cache = false;

        config.save(Some(path.clone())).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let loaded = InventoryConfig::from_toml(&contents).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_db_config_carries_lock_timeout() {
        let mut config = InventoryConfig::default();
        config.database.lock_timeout_ms = 750;
        config.database.path = Some(PathBuf::from("/tmp/tk.db"));
        let db = config.db_config();
        assert_eq!(db.lock_timeout, Duration::from_millis(750));
        assert_eq!(db.database_path, PathBuf::from("/tmp/tk.db"));
    }
}
