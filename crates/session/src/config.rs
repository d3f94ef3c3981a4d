//! Configuration for wsm shell sessions.
//!
//! Two kinds of configuration live here:
//!
//! - [`SessionConfig`]: the caller-supplied connection parameters for one
//!   session (target, credentials, initial terminal size).
//! - [`Config`]: TOML-backed tunables shared by every session. The default
//!   path is `~/.config/wsm/config.toml`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use transport::{Credential, DialParams, WindowSize};

/// Terminal type requested when neither the config nor `$TERM` names one.
pub const DEFAULT_TERM_TYPE: &str = "xterm-256color";

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("terminal size must be positive, got {cols}x{rows}")]
    InvalidWindowSize { cols: u16, rows: u16 },

    #[error("host must not be empty")]
    EmptyHost,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("term_type must not be empty")]
    EmptyTermType,

    #[error("buffer_size must be between 1 and 1048576 bytes, got {0}")]
    InvalidBufferSize(usize),

    #[error("drain_timeout_ms must be at most 10000, got {0}")]
    InvalidDrainTimeout(u64),

    #[error("connect_timeout_secs must be between 1 and 600, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Connection parameters for one interactive session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub username: String,
    pub host: String,
    pub port: u16,
    pub credential: Credential,
    /// Initial pty width in columns.
    pub width: u16,
    /// Initial pty height in rows.
    pub height: u16,
}

impl SessionConfig {
    /// Checks the invariants the session relies on. Reachability of the
    /// endpoint is left to the transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidWindowSize {
                cols: self.width,
                rows: self.height,
            });
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        Ok(())
    }

    pub fn window_size(&self) -> WindowSize {
        WindowSize::new(self.width, self.height)
    }

    pub fn dial_params(&self) -> DialParams {
        DialParams {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credential: self.credential.clone(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Remote terminal settings.
    pub terminal: TerminalConfig,

    /// Byte pump settings.
    pub io: IoConfig,

    /// SSH transport settings.
    pub ssh: SshConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Remote terminal settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TerminalConfig {
    /// Terminal type sent with the pty request. Falls back to `$TERM`,
    /// then [`DEFAULT_TERM_TYPE`].
    pub term_type: Option<String>,
}

/// Byte pump settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct IoConfig {
    /// Read buffer size for each pump, in bytes.
    pub buffer_size: usize,

    /// How long output pumps may drain after the remote process exits.
    pub drain_timeout_ms: u64,
}

/// SSH transport settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// Seconds allowed for TCP connect, handshake and authentication.
    pub connect_timeout_secs: u64,

    /// Seconds between keepalive requests; 0 disables them.
    pub keepalive_secs: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            drain_timeout_ms: 250,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            keepalive_secs: 30,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Keepalive interval, if enabled.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            // Logs share the terminal with the remote shell.
            level: "warn".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wsm")
        .join("config.toml")
}

impl TerminalConfig {
    /// Resolves the terminal type for the pty request.
    pub fn resolve_term_type(&self) -> String {
        if let Some(term) = self.term_type.as_ref().filter(|t| !t.is_empty()) {
            return term.clone();
        }

        match std::env::var("TERM") {
            Ok(term) if !term.is_empty() => term,
            _ => DEFAULT_TERM_TYPE.to_string(),
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - WSM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - WSM_TERM: Override the terminal type sent with the pty request
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("WSM_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(term) = std::env::var("WSM_TERM") {
            if !term.is_empty() {
                tracing::info!("Overriding term_type from environment: {}", term);
                self.terminal.term_type = Some(term);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.terminal.term_type.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(ConfigError::EmptyTermType);
        }

        if self.io.buffer_size == 0 || self.io.buffer_size > 1024 * 1024 {
            return Err(ConfigError::InvalidBufferSize(self.io.buffer_size));
        }

        if self.io.drain_timeout_ms > 10_000 {
            return Err(ConfigError::InvalidDrainTimeout(self.io.drain_timeout_ms));
        }

        if self.ssh.connect_timeout_secs == 0 || self.ssh.connect_timeout_secs > 600 {
            return Err(ConfigError::InvalidConnectTimeout(
                self.ssh.connect_timeout_secs,
            ));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// A missing file yields the defaults; any other read failure is an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        Self::from_toml(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| {
            anyhow::anyhow!(
                "Invalid TOML configuration: {}",
                describe_toml_error(toml_str, &e)
            )
        })
    }
}

/// Renders a parse error with the 1-based line and column it points at.
fn describe_toml_error(source: &str, error: &toml::de::Error) -> String {
    let message = error.message().trim_end();
    let Some(span) = error.span() else {
        return message.to_string();
    };

    let before = source.get(..span.start).unwrap_or(source);
    let line = before.matches('\n').count() + 1;
    let column = before.rsplit('\n').next().map_or(0, |tail| tail.chars().count()) + 1;
    format!("line {}, column {}: {}", line, column, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn session_config() -> SessionConfig {
        SessionConfig {
            username: "ops".to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            credential: Credential::password("x"),
            width: 80,
            height: 24,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.terminal.term_type, None);
        assert_eq!(config.io.buffer_size, 4096);
        assert_eq!(config.io.drain_timeout_ms, 250);
        assert_eq!(config.logging.level, "warn");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_session_config_valid() {
        let config = session_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_size(), WindowSize::new(80, 24));

        let params = config.dial_params();
        assert_eq!(params.address(), "10.0.0.5:22");
        assert_eq!(params.username, "ops");
    }

    #[test]
    fn test_session_config_rejects_zero_size() {
        let mut config = session_config();
        config.height = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWindowSize { cols: 80, rows: 0 })
        );
    }

    #[test]
    fn test_session_config_rejects_bad_endpoint() {
        let mut config = session_config();
        config.host = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));

        let mut config = session_config();
        config.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort(0)));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[terminal]
term_type = "vt100"

[io]
buffer_size = 8192
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.terminal.term_type.as_deref(), Some("vt100"));
        assert_eq!(config.io.buffer_size, 8192);
        assert_eq!(config.io.drain_timeout_ms, 250);
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.ssh, SshConfig::default());
    }

    #[test]
    fn test_from_toml_invalid() {
        let result = Config::from_toml("[io]\nbuffer_size = \"big\"");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML configuration"));
        assert!(err.contains("line 2, column "), "unexpected error: {err}");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.io.buffer_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBufferSize(0)));

        let mut config = Config::default();
        config.io.drain_timeout_ms = 60_000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidDrainTimeout(60_000))
        );

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        let mut config = Config::default();
        config.terminal.term_type = Some(String::new());
        assert_eq!(config.validate(), Err(ConfigError::EmptyTermType));

        let mut config = Config::default();
        config.ssh.connect_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(0)));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            "[terminal]\nterm_type = \"screen-256color\"\n\n[ssh]\nconnect_timeout_secs = 5\n",
        )
        .unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.terminal.term_type.as_deref(), Some("screen-256color"));
        assert_eq!(loaded.ssh.connect_timeout_secs, 5);
        assert_eq!(loaded.io, IoConfig::default());
    }

    #[test]
    fn test_load_reports_unreadable_path() {
        let temp_dir = TempDir::new().unwrap();
        // A directory exists but cannot be read as a file.
        let err = Config::load(temp_dir.path()).unwrap_err().to_string();
        assert!(err.contains("Failed to read"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    #[serial]
    fn test_resolve_term_type() {
        let configured = TerminalConfig {
            term_type: Some("vt220".to_string()),
        };
        assert_eq!(configured.resolve_term_type(), "vt220");

        let original = std::env::var("TERM").ok();

        std::env::set_var("TERM", "screen");
        assert_eq!(TerminalConfig::default().resolve_term_type(), "screen");

        std::env::remove_var("TERM");
        assert_eq!(
            TerminalConfig::default().resolve_term_type(),
            DEFAULT_TERM_TYPE
        );

        if let Some(term) = original {
            std::env::set_var("TERM", term);
        }
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("WSM_LOG_LEVEL", "debug");
        std::env::set_var("WSM_TERM", "linux");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("WSM_LOG_LEVEL");
        std::env::remove_var("WSM_TERM");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.terminal.term_type.as_deref(), Some("linux"));
    }
}
