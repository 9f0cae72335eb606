//! Tool configuration, loaded from `ixdb.yml`

use ixdb_index::IndexConfig;
use ixdb_storage::{IndexTableConfig, WalDurability};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Level;

/// Complete tool configuration - can be loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Index directory settings
    pub table: TableSettings,
    /// Registration and search settings
    pub index: IndexConfig,
    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Index table settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    /// Data directory
    pub data_dir: PathBuf,
    /// WAL durability mode: "every_write", "periodic", "os_default", "none"
    pub wal_durability: String,
    /// WAL periodic sync interval in milliseconds (only for "periodic" mode)
    pub wal_sync_interval_ms: u64,
    /// Maximum WAL file size in MB before rotation
    pub max_wal_file_size_mb: u64,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./ixdb-data"),
            wal_durability: "periodic".to_string(),
            wal_sync_interval_ms: 100,
            max_wal_file_size_mb: 64,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Include target in logs
    pub show_target: bool,
    /// Include thread IDs in logs
    pub show_thread_ids: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_target: false,
            show_thread_ids: false,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            table: TableSettings::default(),
            index: IndexConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ToolConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ToolConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the default config to a file
    pub fn write_default(path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(&Self::default())?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Convert to IndexTableConfig
    pub fn to_table_config(&self) -> IndexTableConfig {
        let wal_durability = match self.table.wal_durability.to_lowercase().as_str() {
            "every_write" | "every-write" | "every" => WalDurability::EveryWrite,
            "periodic" => WalDurability::Periodic {
                interval_ms: self.table.wal_sync_interval_ms,
            },
            "os_default" | "os-default" | "os" => WalDurability::OsDefault,
            "none" => WalDurability::None,
            _ => WalDurability::default(),
        };

        IndexTableConfig {
            data_dir: Some(self.table.data_dir.clone()),
            wal_durability,
            max_wal_file_size: self.table.max_wal_file_size_mb * 1024 * 1024,
        }
    }

    /// Get log level
    pub fn log_level(&self) -> Level {
        match self.logging.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}
