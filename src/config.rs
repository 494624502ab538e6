//! Configuration for custody-lineage

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::LineageError;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("custody-lineage")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Database file name inside `storage_dir`
    #[serde(default = "default_database_file")]
    pub database_file: String,

    /// Base URL used to derive lineage report export links
    #[serde(default = "default_export_base_url")]
    pub export_base_url: String,

    #[serde(default)]
    pub mass_balance: MassBalanceConfig,

    #[serde(default)]
    pub lineage: LineageConfig,
}

/// Thresholds for mass-balance validation and anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassBalanceConfig {
    /// Allowed relative deviation, as a fraction (0.01 = 1%)
    #[serde(default = "default_tolerance")]
    pub tolerance: Decimal,

    /// Standard deviations from the group mean that make a rate suspicious
    #[serde(default = "default_medium_sigma")]
    pub medium_sigma: Decimal,

    /// Standard deviations from the group mean that make a rate a high-severity anomaly
    #[serde(default = "default_high_sigma")]
    pub high_sigma: Decimal,

    /// Multiple of the average input above which a single input is flagged
    #[serde(default = "default_quantity_factor")]
    pub quantity_factor: Decimal,
}

/// Bounds for lineage traversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,

    /// Wall-clock budget per traversal in milliseconds (0 = unbounded)
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_database_file() -> String {
    "custody.db".to_string()
}

fn default_export_base_url() -> String {
    "/api/lineage/reports".to_string()
}

fn default_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

fn default_medium_sigma() -> Decimal {
    Decimal::from(2)
}

fn default_high_sigma() -> Decimal {
    Decimal::from(3)
}

fn default_quantity_factor() -> Decimal {
    Decimal::from(10)
}

fn default_max_depth() -> u32 {
    32
}

fn default_max_nodes() -> usize {
    10_000
}

fn default_deadline_ms() -> u64 {
    5_000
}

impl Default for MassBalanceConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            medium_sigma: default_medium_sigma(),
            high_sigma: default_high_sigma(),
            quantity_factor: default_quantity_factor(),
        }
    }
}

impl Default for LineageConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_nodes: default_max_nodes(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

impl LineageConfig {
    pub fn deadline(&self) -> Option<Duration> {
        (self.deadline_ms > 0).then(|| Duration::from_millis(self.deadline_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            database_file: default_database_file(),
            export_base_url: default_export_base_url(),
            mass_balance: MassBalanceConfig::default(),
            lineage: LineageConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LineageError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| LineageError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LineageError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LineageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get database path
    pub fn database_path(&self) -> PathBuf {
        self.storage_dir.join(&self.database_file)
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            storage_dir = "/tmp/custody"

            [lineage]
            max_depth = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.storage_dir, PathBuf::from("/tmp/custody"));
        assert_eq!(config.database_file, "custody.db");
        assert_eq!(config.lineage.max_depth, 4);
        assert_eq!(config.lineage.max_nodes, 10_000);
        assert_eq!(config.mass_balance.tolerance, Decimal::new(1, 2));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.lineage.deadline_ms = 0;

        let path = config.config_path();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded.storage_dir, config.storage_dir);
        assert_eq!(loaded.lineage.deadline(), None);
        assert_eq!(loaded.mass_balance.high_sigma, Decimal::from(3));
    }
}
