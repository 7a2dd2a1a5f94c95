//! Engine configuration.
//!
//! Configuration is loaded from a TOML file. Every field has a default, so
//! an empty file (or [`EngineConfig::default`]) is a valid configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use threadsync_core::LinkPolicy;

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Snapshot and paging configuration.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Replay configuration.
    #[serde(default)]
    pub playback: PlaybackConfig,
    /// Realtime channel configuration.
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Snapshot and paging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Messages per REST page (default: 50).
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// How long a released lease keeps swallowing echoes, in ms (default: 750).
    #[serde(default = "default_settle_window_ms")]
    pub settle_window_ms: u64,
}

/// Replay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    /// Delay before retrying to center a row that was not rendered yet,
    /// in ms (default: 120). Also the back-off while another page is in flight.
    #[serde(default = "default_center_retry_delay_ms")]
    pub center_retry_delay_ms: u64,
}

/// Realtime channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Fixed delay between reconnect attempts in seconds (default: 3).
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Heartbeat period in seconds (default: 25).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Time to wait for a heartbeat reply in seconds (default: 10).
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Unanswered heartbeats before the link counts as lost (default: 2).
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
}

// Default value functions
fn default_page_size() -> u32 {
    50
}

fn default_settle_window_ms() -> u64 {
    750
}

fn default_center_retry_delay_ms() -> u64 {
    120
}

fn default_reconnect_interval_secs() -> u64 {
    3
}

fn default_heartbeat_interval_secs() -> u64 {
    25
}

fn default_heartbeat_timeout_secs() -> u64 {
    10
}

fn default_max_missed_heartbeats() -> u32 {
    2
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            settle_window_ms: default_settle_window_ms(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            center_retry_delay_ms: default_center_retry_delay_ms(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: default_reconnect_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Settle window as a duration.
    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.sync.settle_window_ms)
    }

    /// Centering retry delay as a duration.
    pub fn center_retry_delay(&self) -> Duration {
        Duration::from_millis(self.playback.center_retry_delay_ms)
    }
}

impl ChannelConfig {
    /// Reconnect and heartbeat policy for the link state machine.
    pub fn link_policy(&self) -> LinkPolicy {
        LinkPolicy {
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs),
            max_missed_heartbeats: self.max_missed_heartbeats.max(1),
        }
    }

    /// Heartbeat period as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Heartbeat timeout as a duration.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.settle_window(), Duration::from_millis(750));
        assert_eq!(config.channel.link_policy(), LinkPolicy::default());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[sync]
page_size = 20

[channel]
reconnect_interval_secs = 5
max_missed_heartbeats = 4
"#;

        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.sync.settle_window_ms, 750);
        assert_eq!(config.playback.center_retry_delay_ms, 120);
        assert_eq!(
            config.channel.link_policy().reconnect_interval,
            Duration::from_secs(5)
        );
        assert_eq!(config.channel.link_policy().max_missed_heartbeats, 4);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.channel.heartbeat_interval(), Duration::from_secs(25));
        assert_eq!(config.channel.heartbeat_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[playback]\ncenter_retry_delay_ms = 40").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.center_retry_delay(), Duration::from_millis(40));
    }

    #[test]
    fn from_file_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\npage_size = \"many\"").unwrap();

        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = EngineConfig::from_file(std::path::Path::new("/nonexistent/engine.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }
}
