//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: Where the API listens and how large a body may be.
//!     - StorageConfig: Which backend holds the singleton reading, and its key.
//!     - LoggingConfig: Log level and whether received payloads are echoed.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV_VAR: &str = "SMARTBIN_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// request body cap in MiB
    pub body_limit_mb: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_path: PathBuf,
    /// fixed key of the singleton reading
    pub record_id: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3001,
            body_limit_mb: 50,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: PathBuf::from("data").join("smartbin.db"),
            record_id: "basura_principal".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb.saturating_mul(1024 * 1024)
    }
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: HubConfig = toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        if config.storage.record_id.trim().is_empty() {
            anyhow::bail!("storage.record_id must not be empty");
        }

        Ok(config)
    }

    /// Load with default fallback.
    ///
    /// `SMARTBIN_CONFIG` wins when set; otherwise `config/hub.toml` and
    /// `../config/hub.toml` are tried in order. Runs before the tracing
    /// subscriber exists, so it reports on stdout.
    pub fn load_or_default() -> Self {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("hub.toml"));
        paths.push(PathBuf::from("..").join("config").join("hub.toml"));

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!(
            listen = %self.server.socket_addr(),
            body_limit_mb = self.server.body_limit_mb,
            backend = ?self.storage.backend,
            database = %self.storage.database_path.display(),
            record_id = %self.storage.record_id,
            log_level = %self.logging.level,
            "hub configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = HubConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, 3001);
        assert_eq!(config.server.body_limit_bytes(), 50 * 1024 * 1024);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.record_id, "basura_principal");
        assert!(config.logging.show_sensor_data);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = HubConfig::from_toml(
            r#"
            [server]
            port = 8080

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.socket_addr(), "0.0.0.0:8080");
        assert_eq!(config.server.body_limit_mb, 50);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.database_path, PathBuf::from("data").join("smartbin.db"));
    }

    #[test]
    fn blank_record_id_is_rejected() {
        let err = HubConfig::from_toml("[storage]\nrecord_id = \"  \"\n").unwrap_err();
        assert!(err.to_string().contains("record_id"));
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        let err = HubConfig::from_toml("[storage]\nbackend = \"mongo\"\n").unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse config"));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\nshow_sensor_data = false\n").unwrap();

        let config = HubConfig::load(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.show_sensor_data);
    }
}
