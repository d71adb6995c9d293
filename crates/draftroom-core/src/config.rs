// Configuration loading and validation (config/draftroom.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::connection::ConnectionSettings;

const CONFIG_FILE: &str = "draftroom.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("cannot determine working directory: {0}")]
    WorkingDir(#[source] std::io::Error),
}

// ---------------------------------------------------------------------------
// Config sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub hub: HubConfig,
    pub connection: ConnectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of each hub event channel.
    pub event_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { event_capacity: 64 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub outbound_capacity: usize,
    pub pong_wait_secs: u64,
    pub write_wait_secs: u64,
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let settings = ConnectionSettings::default();
        Self {
            outbound_capacity: settings.outbound_capacity,
            pong_wait_secs: settings.pong_wait.as_secs(),
            write_wait_secs: settings.write_wait.as_secs(),
            max_message_size: settings.max_message_size,
        }
    }
}

impl Config {
    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Runtime limits for client connections. Pings go out at nine tenths
    /// of the pong wait.
    pub fn connection_settings(&self) -> ConnectionSettings {
        let pong_wait = Duration::from_secs(self.connection.pong_wait_secs);
        ConnectionSettings {
            outbound_capacity: self.connection.outbound_capacity,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(self.connection.write_wait_secs),
            max_message_size: self.connection.max_message_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/draftroom.toml` relative to `base_dir`.
///
/// The file is optional; without it every setting takes its default.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);

    let config = if path.exists() {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadError {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::ParseError {
            path: path.clone(),
            source,
        })?
    } else {
        Config::default()
    };

    validate(&config)?;

    Ok(config)
}

/// Convenience wrapper: loads config relative to the current working directory.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
    load_config_from(&cwd)
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "draftroom")
        .map(|dirs| dirs.data_dir().join("draftroom.db"))
        .unwrap_or_else(|| PathBuf::from("draftroom.db"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.server.host.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "server.host".into(),
            message: "must not be empty".into(),
        });
    }

    if config.database.path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "database.path".into(),
            message: "must not be empty".into(),
        });
    }

    let conn = &config.connection;
    let positive_fields: &[(&str, u64)] = &[
        ("hub.event_capacity", config.hub.event_capacity as u64),
        ("connection.outbound_capacity", conn.outbound_capacity as u64),
        ("connection.pong_wait_secs", conn.pong_wait_secs),
        ("connection.write_wait_secs", conn.write_wait_secs),
        ("connection.max_message_size", conn.max_message_size as u64),
    ];
    for (name, val) in positive_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Write `contents` as the config file under a fresh temp dir.
    fn config_dir_with(name: &str, contents: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), contents).unwrap();
        tmp
    }

    /// Locate the repository's shipped config, whether tests run from the
    /// crate directory or the workspace root.
    fn shipped_config_root() -> PathBuf {
        let manifest = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest
            .ancestors()
            .find(|dir| dir.join("config").join(CONFIG_FILE).exists())
            .map(Path::to_path_buf)
            .expect("config/draftroom.toml not found above crate dir")
    }

    #[test]
    fn missing_file_uses_defaults() {
        let tmp = std::env::temp_dir().join("draftroom_config_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.hub.event_capacity, 64);
        assert_eq!(config.connection_settings(), ConnectionSettings::default());
        assert!(config.database.path.ends_with("draftroom.db"));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn shipped_config_is_valid() {
        let config = load_config_from(&shipped_config_root()).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.connection.max_message_size, 512);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = config_dir_with(
            "draftroom_config_partial",
            "[server]\nport = 9001\n\n[connection]\npong_wait_secs = 30\n",
        );

        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:9001");

        let settings = config.connection_settings();
        assert_eq!(settings.pong_wait, Duration::from_secs(30));
        assert_eq!(settings.ping_period, Duration::from_secs(27));
        assert_eq!(settings.outbound_capacity, 256);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_outbound_capacity() {
        let tmp = config_dir_with(
            "draftroom_config_zero_capacity",
            "[connection]\noutbound_capacity = 0\n",
        );

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "connection.outbound_capacity");
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_pong_wait() {
        let tmp = config_dir_with(
            "draftroom_config_zero_pong",
            "[connection]\npong_wait_secs = 0\n",
        );

        let err = load_config_from(&tmp).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ValidationError { ref field, .. } if field == "connection.pong_wait_secs"
        ));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_event_capacity() {
        let tmp = config_dir_with("draftroom_config_zero_events", "[hub]\nevent_capacity = 0\n");

        let err = load_config_from(&tmp).unwrap_err();
        assert!(err.to_string().contains("hub.event_capacity"));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn parse_error_names_the_file() {
        let tmp = config_dir_with("draftroom_config_invalid_toml", "this is not valid [[[ toml");

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ParseError { path, .. } => {
                assert!(path.ends_with("draftroom.toml"));
            }
            other => panic!("expected ParseError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }
}
