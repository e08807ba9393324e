#![deny(unsafe_code)]

//! Configuration loading and validation for Stowage.
//!
//! Loads TOML configuration files and validates them. [`AppConfig`] is the
//! central configuration structure; every section falls back to defaults so
//! an empty file (or no file at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage mode selection and local storage layout.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Location of the backend's Unix socket.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Connection retry policy.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Per-request behaviour of the correlator and reader.
    #[serde(default)]
    pub request: RequestConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which backend the persistence session talks to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Remote when the deployment marker exists, local otherwise.
    #[default]
    Auto,
    /// Always use the local filesystem.
    Local,
    /// Always use the remote backend, even off-target.
    Remote,
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Local => "local",
            Self::Remote => "remote",
        };
        f.write_str(s)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection: "auto", "local", or "remote".
    #[serde(default)]
    pub mode: StorageMode,

    /// Root directory for local `<group>.save` files.
    #[serde(default = "default_local_path")]
    pub local_path: String,

    /// Directory whose existence marks the target deployment environment.
    #[serde(default = "default_deployment_marker")]
    pub deployment_marker: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            local_path: default_local_path(),
            deployment_marker: default_deployment_marker(),
        }
    }
}

fn default_local_path() -> String {
    ".".to_string()
}

fn default_deployment_marker() -> String {
    "/home/stowage".to_string()
}

/// IPC socket location.
///
/// The socket lives at `<base>/<socket_name>`, where `<base>` is read from
/// the environment variable named by `dir_env` and falls back to
/// `default_dir`. An explicit `socket_path` wins over both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Environment variable holding the base IPC directory.
    #[serde(default = "default_dir_env")]
    pub dir_env: String,

    /// Base directory used when the environment variable is unset.
    #[serde(default = "default_ipc_dir")]
    pub default_dir: String,

    /// Socket file name inside the base directory.
    #[serde(default = "default_socket_name")]
    pub socket_name: String,

    /// Explicit socket path, bypassing the environment lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            dir_env: default_dir_env(),
            default_dir: default_ipc_dir(),
            socket_name: default_socket_name(),
            socket_path: None,
        }
    }
}

fn default_dir_env() -> String {
    "STOWAGE_IPC_DIR".to_string()
}

fn default_ipc_dir() -> String {
    "/tmp/stowage".to_string()
}

fn default_socket_name() -> String {
    "game.sock".to_string()
}

impl IpcConfig {
    /// Resolve the socket path against the process environment.
    pub fn resolve_socket_path(&self) -> PathBuf {
        self.resolve_socket_path_with(|name| std::env::var(name).ok())
    }

    /// Resolve the socket path using `lookup` in place of the environment.
    ///
    /// An empty variable counts as unset.
    pub fn resolve_socket_path_with(&self, lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(path) = &self.socket_path {
            return PathBuf::from(path);
        }
        let base = lookup(&self.dir_env)
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| self.default_dir.clone());
        let path = Path::new(&base).join(&self.socket_name);
        debug!(path = %path.display(), env = %self.dir_env, "Resolved IPC socket path");
        path
    }
}

/// Connection retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Multiplier applied to the delay after each failed attempt (1.0 = fixed).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound on the retry delay, in milliseconds.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Maximum connection attempts (0 = retry forever).
    #[serde(default)]
    pub max_attempts: u32,

    /// How long an operation waits for the first connection before failing
    /// with `NotInitialized`, in milliseconds.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            backoff_factor: default_backoff_factor(),
            max_interval_ms: default_max_interval_ms(),
            max_attempts: 0,
            ready_timeout_ms: default_ready_timeout_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_ready_timeout_ms() -> u64 {
    5000
}

impl ReconnectConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Request timeouts and reader pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// How long a request may stay pending before failing with `TimedOut`.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause after the reader sees a blank line, in milliseconds.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_idle_backoff_ms() -> u64 {
    100
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.local_path.is_empty() {
            return Err(ConfigError::Validation(
                "storage.local_path must not be empty".to_string(),
            ));
        }
        if self.ipc.socket_path.is_none() {
            if self.ipc.dir_env.is_empty() {
                return Err(ConfigError::Validation(
                    "ipc.dir_env must not be empty".to_string(),
                ));
            }
            if self.ipc.socket_name.is_empty() || self.ipc.socket_name.contains('/') {
                return Err(ConfigError::Validation(format!(
                    "ipc.socket_name must be a plain file name, got {:?}",
                    self.ipc.socket_name
                )));
            }
        }

        let reconnect = &self.reconnect;
        if reconnect.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "reconnect.interval_ms must be non-zero".to_string(),
            ));
        }
        if !reconnect.backoff_factor.is_finite() || reconnect.backoff_factor < 1.0 {
            return Err(ConfigError::Validation(format!(
                "reconnect.backoff_factor must be >= 1.0, got {}",
                reconnect.backoff_factor
            )));
        }
        if reconnect.max_interval_ms < reconnect.interval_ms {
            return Err(ConfigError::Validation(format!(
                "reconnect.max_interval_ms ({}) must be >= reconnect.interval_ms ({})",
                reconnect.max_interval_ms, reconnect.interval_ms
            )));
        }

        if self.request.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "request.timeout_ms must be non-zero".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.storage.mode, StorageMode::Auto);
        assert_eq!(config.storage.local_path, ".");
        assert_eq!(config.ipc.socket_name, "game.sock");
        assert_eq!(config.reconnect.interval(), Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.request.idle_backoff(), Duration::from_millis(100));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.storage.mode, StorageMode::Auto);
        assert_eq!(config.request.timeout_ms, 30_000);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [storage]
            mode = "remote"
            local_path = "/var/lib/game"

            [ipc]
            dir_env = "GAME_IPC"
            socket_name = "backend.sock"

            [reconnect]
            interval_ms = 250
            backoff_factor = 2.0
            max_interval_ms = 4000
            max_attempts = 5

            [request]
            timeout_ms = 1500

            [logging]
            level = "debug"
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(config.storage.mode, StorageMode::Remote);
        assert_eq!(config.storage.local_path, "/var/lib/game");
        assert_eq!(config.ipc.dir_env, "GAME_IPC");
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.backoff_factor, 2.0);
        assert_eq!(config.request.timeout(), Duration::from_millis(1500));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        let toml = r#"
            [storage]
            mode = "cloud"
        "#;
        assert!(matches!(AppConfig::parse(toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let toml = r#"
            [reconnect]
            interval_ms = 0
        "#;
        assert!(matches!(
            AppConfig::parse(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_validation_rejects_shrinking_backoff() {
        let toml = r#"
            [reconnect]
            backoff_factor = 0.5
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_cap_below_interval() {
        let toml = r#"
            [reconnect]
            interval_ms = 5000
            max_interval_ms = 1000
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let toml = r#"
            [request]
            timeout_ms = 0
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_socket_name_with_slash() {
        let toml = r#"
            [ipc]
            socket_name = "nested/game.sock"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        let toml = r#"
            [logging]
            level = "loud"
        "#;
        assert!(AppConfig::parse(toml).is_err());
    }

    #[test]
    fn test_socket_path_from_env() {
        let ipc = IpcConfig::default();
        let path = ipc.resolve_socket_path_with(|name| {
            assert_eq!(name, "STOWAGE_IPC_DIR");
            Some("/run/arcade".to_string())
        });
        assert_eq!(path, PathBuf::from("/run/arcade/game.sock"));
    }

    #[test]
    fn test_socket_path_falls_back_to_default_dir() {
        let ipc = IpcConfig::default();
        assert_eq!(
            ipc.resolve_socket_path_with(|_| None),
            PathBuf::from("/tmp/stowage/game.sock")
        );
        assert_eq!(
            ipc.resolve_socket_path_with(|_| Some(String::new())),
            PathBuf::from("/tmp/stowage/game.sock")
        );
    }

    #[test]
    fn test_explicit_socket_path_wins() {
        let ipc = IpcConfig {
            socket_path: Some("/srv/backend.sock".to_string()),
            ..IpcConfig::default()
        };
        assert_eq!(
            ipc.resolve_socket_path_with(|_| Some("/ignored".to_string())),
            PathBuf::from("/srv/backend.sock")
        );
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = AppConfig::parse(&toml_str).unwrap();
        assert_eq!(parsed.storage.mode, config.storage.mode);
        assert_eq!(parsed.ipc.socket_name, config.ipc.socket_name);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stowage.toml");
        tokio::fs::write(
            &path,
            r#"
                [storage]
                mode = "local"
                local_path = "saves"
            "#,
        )
        .await
        .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.storage.mode, StorageMode::Local);
        assert_eq!(config.storage.local_path, "saves");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let result = AppConfig::load(Path::new("/nonexistent/stowage.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
