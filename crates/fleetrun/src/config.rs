//! Runner configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default connect timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle window a multiplexed control master stays up, in seconds
pub const DEFAULT_CONTROL_PERSIST_SECS: u64 = 300;

/// Policy shared by every runner built from it.
///
/// All fields are optional when deserialized; missing ones take the
/// defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// ssh client binary
    pub ssh_binary: PathBuf,
    /// rsync binary
    pub rsync_binary: PathBuf,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// ControlPersist window in seconds
    pub control_persist: u64,
    /// Parent directory for control sockets (system temp dir when unset)
    pub control_dir: Option<PathBuf>,
    /// ServerAliveInterval in seconds
    pub server_alive_interval: u64,
    /// ServerAliveCountMax
    pub server_alive_count_max: u32,
    /// Shell used to interpret the remote command line
    pub remote_shell: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            rsync_binary: PathBuf::from("rsync"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            control_persist: DEFAULT_CONTROL_PERSIST_SECS,
            control_dir: None,
            server_alive_interval: 5,
            server_alive_count_max: 3,
            remote_shell: "bash".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse a configuration from JSON text
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Directory that holds per-identifier control socket directories
    pub fn control_root(&self) -> PathBuf {
        self.control_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read config {path:?}: {source}")]
    Read {
        /// Config file path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_runner_config_default() {
        let config = RunnerConfig::default();
        assert_eq!(config.ssh_binary, PathBuf::from("ssh"));
        assert_eq!(config.rsync_binary, PathBuf::from("rsync"));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.control_persist, 300);
        assert_eq!(config.remote_shell, "bash");
        assert_eq!(config.control_root(), std::env::temp_dir());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            RunnerConfig::from_json_str(r#"{"connect_timeout": 10, "ssh_binary": "/usr/bin/ssh"}"#)
                .unwrap();
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.ssh_binary, PathBuf::from("/usr/bin/ssh"));
        assert_eq!(config.control_persist, DEFAULT_CONTROL_PERSIST_SECS);
        assert_eq!(config.server_alive_count_max, 3);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"control_dir": "/run/fleetrun", "remote_shell": "sh"}}"#).unwrap();

        let config = RunnerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.control_root(), PathBuf::from("/run/fleetrun"));
        assert_eq!(config.remote_shell, "sh");
    }

    #[test]
    fn test_from_json_file_errors() {
        let missing = RunnerConfig::from_json_file(Path::new("/nonexistent/fleetrun.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let bad = RunnerConfig::from_json_file(file.path());
        assert!(matches!(bad, Err(ConfigError::Parse { .. })));
    }
}
