//! Path helpers and the TOML configuration file.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV: &str = "TABLEBRIDGE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("cannot determine config path")]
    NoPath,
}

/// Base data directory: `~/.local/share/tablebridge/`
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("tablebridge"))
}

/// Config file: `$TABLEBRIDGE_CONFIG`, else `~/.config/tablebridge/config.toml`
pub fn config_path() -> Option<PathBuf> {
    if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(explicit));
    }
    let config_dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        })?;
    Some(config_dir.join("tablebridge").join("config.toml"))
}

/// How to launch a worker. The request and response paths are appended as
/// the last two positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "tablebridge".to_string(),
            args: vec!["worker".to_string()],
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Directory holding `input_<id>.txt` / `output_<id>.txt`. Defaults to
    /// `$TMPDIR/tablebridge`.
    pub dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub connectivity_timeout_secs: u64,
    pub liveness_window_secs: u64,
    pub startup_timeout_secs: u64,
    pub terminate_grace_ms: u64,
    pub max_restarts: u32,
    pub compact_threshold_bytes: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_ms: 250,
            heartbeat_interval_secs: 30,
            command_timeout_secs: 45,
            connectivity_timeout_secs: 90,
            liveness_window_secs: 120,
            startup_timeout_secs: 90,
            terminate_grace_ms: 2000,
            max_restarts: 3,
            compact_threshold_bytes: 1024 * 1024,
        }
    }
}

impl ChannelConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tablebridge"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity_timeout_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub flush_bytes: usize,
    pub flush_interval_ms: u64,
    pub prompt_markers: Vec<String>,
    /// Lines the worker prints when it blocks on a tool result.
    pub tool_markers: Vec<String>,
    /// Lines after which a silent-but-talkative worker counts as ready.
    pub ready_line_threshold: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            flush_bytes: 100,
            flush_interval_ms: 500,
            prompt_markers: default_prompt_markers(),
            tool_markers: default_tool_markers(),
            ready_line_threshold: 20,
        }
    }
}

impl AggregatorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

pub fn default_prompt_markers() -> Vec<String> {
    [
        "Enter your Query",
        "Do you want to",
        "Enter your feedback",
        "ready for queries",
        "Table Assistant is ready",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn default_tool_markers() -> Vec<String> {
    vec![
        "WAITING_FOR_TOOL_RESULT".to_string(),
        "WAITING_FOR_RESULT".to_string(),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub worker: WorkerConfig,
    pub channel: ChannelConfig,
    pub aggregator: AggregatorConfig,
}

impl BridgeConfig {
    /// Load from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.channel.command_timeout(), Duration::from_secs(45));
        assert_eq!(config.channel.connectivity_timeout(), Duration::from_secs(90));
        assert_eq!(config.channel.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.channel.max_restarts, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [worker]
            program = "python"
            args = ["mcp-ssms-client-file.py"]

            [aggregator]
            flush_bytes = 30
            flush_interval_ms = 300
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.program, "python");
        assert_eq!(config.aggregator.flush_bytes, 30);
        assert_eq!(config.aggregator.flush_interval(), Duration::from_millis(300));
        assert_eq!(config.aggregator.prompt_markers, default_prompt_markers());
        assert_eq!(config.channel.poll_interval_ms, 250);
    }

    #[test]
    fn save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = BridgeConfig::default();
        config.channel.dir = Some(dir.path().join("chan"));
        config.channel.max_restarts = 5;
        config.save_to(&path).unwrap();

        let loaded = BridgeConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.channel.dir(), dir.path().join("chan"));
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[channel]\npoll_interval_ms = \"fast\"\n").unwrap();
        assert!(matches!(
            BridgeConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn poll_interval_never_zero() {
        let channel = ChannelConfig {
            poll_interval_ms: 0,
            ..ChannelConfig::default()
        };
        assert_eq!(channel.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn heartbeat_interval_never_zero() {
        let config: BridgeConfig =
            toml::from_str("[channel]\nheartbeat_interval_secs = 0\n").unwrap();
        assert_eq!(config.channel.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.aggregator.tool_markers, default_tool_markers());
    }
}
