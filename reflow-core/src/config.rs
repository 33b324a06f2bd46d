//! Configuration management for Reflow.
//!
//! Provides configuration loading from TOML files with support for
//! multiple file locations, environment variable overrides, and sensible
//! defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as TOML.
    #[error("failed to parse config file '{path}': {source}")]
    ParseError {
        /// Path to the configuration file that could not be parsed.
        path: PathBuf,
        /// The underlying TOML parse error.
        source: toml::de::Error,
    },
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Base URL of the agent-run API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key sent as a bearer token. Optional.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Stream consumption tunables.
    #[serde(default)]
    pub stream: StreamConfig,
}

fn default_base_url() -> String {
    "http://localhost:8000/api".to_string()
}

/// Tunables for stream consumption and render pacing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    /// How long to wait for a first message before re-verifying liveness,
    /// in milliseconds. Single-shot, not a retry loop.
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,

    /// Minimum interval between non-structural reconstruction
    /// notifications, in milliseconds.
    #[serde(default = "default_notify_interval_ms")]
    pub notify_interval_ms: u64,

    /// Pending text fragments beyond which a flush happens immediately.
    #[serde(default = "default_flush_max_pending")]
    pub flush_max_pending: usize,

    /// Age of the last text flush beyond which a flush happens
    /// immediately, in milliseconds.
    #[serde(default = "default_flush_max_latency_ms")]
    pub flush_max_latency_ms: u64,

    /// Cadence of the driver's frame tick (the render-frame scheduler),
    /// in milliseconds.
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

fn default_liveness_window_ms() -> u64 {
    1500
}

fn default_notify_interval_ms() -> u64 {
    50
}

fn default_flush_max_pending() -> usize {
    10
}

fn default_flush_max_latency_ms() -> u64 {
    50
}

fn default_frame_interval_ms() -> u64 {
    16
}

impl StreamConfig {
    /// The liveness window as a [`Duration`].
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    /// The notification interval as a [`Duration`].
    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }

    /// The flush latency bound as a [`Duration`].
    pub fn flush_max_latency(&self) -> Duration {
        Duration::from_millis(self.flush_max_latency_ms)
    }

    /// The frame tick cadence as a [`Duration`].
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            liveness_window_ms: default_liveness_window_ms(),
            notify_interval_ms: default_notify_interval_ms(),
            flush_max_pending: default_flush_max_pending(),
            flush_max_latency_ms: default_flush_max_latency_ms(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl Config {
    /// Load configuration from the file system.
    ///
    /// Priority order:
    /// 1. `REFLOW_CONFIG` environment variable
    /// 2. `./reflow.toml` (local directory)
    /// 3. `~/.config/reflow/config.toml` (user config)
    ///
    /// Returns default config if no config file is found.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if a found file cannot be read.
    /// Returns [`ConfigError::ParseError`] if a found file is not valid TOML.
    pub fn load() -> Result<Self, ConfigError> {
        // 1. Environment variable (highest priority)
        if let Ok(path) = std::env::var("REFLOW_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                return Self::load_from(p);
            }
        }

        // 2. Local directory
        let local = PathBuf::from("reflow.toml");
        if local.exists() {
            return Self::load_from(local);
        }

        // 3. User config directory (~/.config/reflow/)
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/reflow/config.toml");
            if user_config.exists() {
                return Self::load_from(user_config);
            }
        }

        // No config file found, return defaults
        Ok(Self::default())
    }

    /// Load configuration from a specific path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::IoError`] if the file cannot be read.
    /// Returns [`ConfigError::ParseError`] if the file is not valid TOML.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            stream: StreamConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.base_url, "http://localhost:8000/api");
        assert_eq!(config.api_key, None);
        assert_eq!(config.stream.liveness_window_ms, 1500);
        assert_eq!(config.stream.notify_interval_ms, 50);
        assert_eq!(config.stream.flush_max_pending, 10);
        assert_eq!(config.stream.flush_max_latency_ms, 50);
        assert_eq!(config.stream.frame_interval_ms, 16);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"base_url = "https://api.example.com""#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.stream, StreamConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
base_url = "https://api.example.com"
api_key = "rk-test-key"

[stream]
liveness_window_ms = 3000
notify_interval_ms = 100
flush_max_pending = 5
flush_max_latency_ms = 25
frame_interval_ms = 33
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.api_key, Some("rk-test-key".to_string()));
        assert_eq!(config.stream.liveness_window_ms, 3000);
        assert_eq!(config.stream.notify_interval_ms, 100);
        assert_eq!(config.stream.flush_max_pending, 5);
        assert_eq!(config.stream.flush_max_latency_ms, 25);
        assert_eq!(config.stream.frame_interval_ms, 33);
    }

    #[test]
    fn test_parse_partial_stream_section() {
        let toml = r#"
[stream]
liveness_window_ms = 500
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.stream.liveness_window_ms, 500);
        assert_eq!(config.stream.notify_interval_ms, 50); // default
    }

    #[test]
    fn test_parse_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_duration_helpers() {
        let stream = StreamConfig::default();
        assert_eq!(stream.liveness_window(), Duration::from_millis(1500));
        assert_eq!(stream.notify_interval(), Duration::from_millis(50));
        assert_eq!(stream.flush_max_latency(), Duration::from_millis(50));
        assert_eq!(stream.frame_interval(), Duration::from_millis(16));
    }

    #[test]
    fn test_load_from_path() {
        use std::io::Write;
        let dir = std::env::temp_dir();
        let path = dir.join("reflow_test_config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"base_url = "http://test.local""#).unwrap();
        drop(file);

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.base_url, "http://test.local");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_parse_invalid_toml() {
        use std::io::Write;
        let dir = std::env::temp_dir();
        let path = dir.join("reflow_invalid_config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, r#"invalid = ["#).unwrap();
        drop(file);

        let result = Config::load_from(&path);
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_from_nonexistent_file() {
        let result = Config::load_from("/nonexistent/path/reflow.toml");
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }
}
