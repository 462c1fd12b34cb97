//! Operator configuration.
//!
//! TOML file with one section per concern. Everything except the master
//! secret has a sensible default, so a minimal config is:
//!
//! ```toml
//! [security]
//! master_secret = "64 hex chars from `ballotbox gen-secret`"
//! ```
//!
//! Poll behaviour (flags, capacities, reminders) is per-poll data and lives
//! in the database, not here.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    pub security: SecurityConfig,

    #[serde(default)]
    pub email: EmailConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Public base URL, used in emailed links and to decide the Secure
    /// cookie attribute.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Allowed CORS origin; unset allows any.
    pub cors_allow_origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Master secret (hex) from which device-token keys are derived.
    /// Generate with `ballotbox gen-secret`.
    pub master_secret: String,

    /// When set, requests may mark their writes as test data via the
    /// `X-Test-Data` header. Never enable in production.
    #[serde(default)]
    pub test_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Minimum spacing of voter-confirmation mail per (poll, email).
    #[serde(default = "default_confirmation_cooldown")]
    pub confirmation_cooldown: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sweep period for reminders and map cleanup.
    #[serde(default = "default_tick")]
    pub tick: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("ballotbox.db")
}

fn default_confirmation_cooldown() -> String {
    "30s".to_string()
}

fn default_tick() -> String {
    "60s".to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            base_url: default_base_url(),
            cors_allow_origin: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            confirmation_cooldown: default_confirmation_cooldown(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.master_secret_bytes().len() < 32 {
            return Err(ConfigError::Invalid(
                "security.master_secret must be at least 32 bytes (64 hex chars)".into(),
            ));
        }
        self.confirmation_cooldown()
            .map_err(|e| ConfigError::Invalid(format!("email.confirmation_cooldown: {}", e)))?;
        self.tick()
            .map_err(|e| ConfigError::Invalid(format!("scheduler.tick: {}", e)))?;
        Ok(())
    }

    /// Secret bytes: hex-decoded when possible, raw bytes otherwise.
    pub fn master_secret_bytes(&self) -> Vec<u8> {
        hex::decode(self.security.master_secret.trim())
            .unwrap_or_else(|_| self.security.master_secret.as_bytes().to_vec())
    }

    pub fn confirmation_cooldown(&self) -> Result<chrono::Duration, humantime::DurationError> {
        let parsed = humantime::parse_duration(&self.email.confirmation_cooldown)?;
        Ok(chrono::Duration::from_std(parsed).unwrap_or_else(|_| chrono::Duration::seconds(30)))
    }

    pub fn tick(&self) -> Result<std::time::Duration, humantime::DurationError> {
        humantime::parse_duration(&self.scheduler.tick)
    }

    /// Secure cookie attribute follows the base URL scheme.
    pub fn https_base_url(&self) -> bool {
        self.server.base_url.starts_with("https://")
    }
}

/// Write a starter config with a freshly minted secret.
pub fn write_default(path: &Path) -> Result<(), ConfigError> {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);

    let config = AppConfig {
        server: ServerConfig::default(),
        database: DatabaseConfig::default(),
        security: SecurityConfig {
            master_secret: hex::encode(secret),
            test_mode: false,
        },
        email: EmailConfig::default(),
        scheduler: SchedulerConfig::default(),
        logging: LoggingConfig::default(),
    };
    let rendered =
        toml::to_string_pretty(&config).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    fs::write(path, rendered).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn minimal_config_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[security]").unwrap();
        writeln!(file, "master_secret = \"{}\"", "ab".repeat(32)).unwrap();

        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.master_secret_bytes().len(), 32);
        assert_eq!(config.tick().unwrap(), std::time::Duration::from_secs(60));
        assert!(!config.https_base_url());
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[security]").unwrap();
        writeln!(file, "master_secret = \"deadbeef\"").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[security]").unwrap();
        writeln!(file, "master_secret = \"{}\"", "ab".repeat(32)).unwrap();
        writeln!(file, "[email]").unwrap();
        writeln!(file, "confirmation_cooldown = \"not-a-duration\"").unwrap();
        assert!(AppConfig::load(file.path()).is_err());
    }

    #[test]
    fn write_default_round_trips() {
        let file = NamedTempFile::new().unwrap();
        write_default(file.path()).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.master_secret_bytes().len(), 32);
    }

    #[test]
    fn https_detection() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]").unwrap();
        writeln!(file, "base_url = \"https://polls.example.org\"").unwrap();
        writeln!(file, "[security]").unwrap();
        writeln!(file, "master_secret = \"{}\"", "ab".repeat(32)).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert!(config.https_base_url());
    }
}
