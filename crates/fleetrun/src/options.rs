//! ssh option construction
//!
//! Everything here is a pure mapping from inputs to flags; no process is
//! spawned and no network I/O happens.

use crate::config::{RunnerConfig, DEFAULT_CONNECT_TIMEOUT_SECS};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Inputs to the ssh option list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Private key passed with `-i`
    pub key_path: PathBuf,
    /// Multiplexing identifier; enables ControlMaster when set
    pub control_name: Option<String>,
    /// ConnectTimeout
    pub connect_timeout: Duration,
    /// ControlPersist idle window
    pub control_persist: Duration,
    /// Parent of the derived control socket directory
    pub control_root: PathBuf,
    /// ServerAliveInterval in seconds
    pub server_alive_interval: u64,
    /// ServerAliveCountMax
    pub server_alive_count_max: u32,
    /// Remote port
    pub port: u16,
}

impl SshOptions {
    /// Options with default policy for the given key
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self::from_config(key_path, None, 22, &RunnerConfig::default())
    }

    /// Options derived from a runner configuration
    pub fn from_config(
        key_path: impl Into<PathBuf>,
        control_name: Option<String>,
        port: u16,
        config: &RunnerConfig,
    ) -> Self {
        Self {
            key_path: key_path.into(),
            control_name,
            connect_timeout: config.connect_timeout(),
            control_persist: Duration::from_secs(config.control_persist),
            control_root: config.control_root(),
            server_alive_interval: config.server_alive_interval,
            server_alive_count_max: config.server_alive_count_max,
            port,
        }
    }

    /// Set the multiplexing identifier
    pub fn with_control_name(mut self, name: impl Into<String>) -> Self {
        self.control_name = Some(name.into());
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Directory holding the control socket for this identifier, if any
    pub fn control_dir(&self) -> Option<PathBuf> {
        self.control_name
            .as_deref()
            .map(|name| control_dir_for(&self.control_root, name))
    }

    /// Build the ordered flag list
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.to_string_lossy().to_string(),
        ];

        let mut push_opt = |key: &str, value: String| {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        };

        push_opt("StrictHostKeyChecking", "no".to_string());
        push_opt("UserKnownHostsFile", "/dev/null".to_string());
        push_opt("IdentitiesOnly", "yes".to_string());
        push_opt("ExitOnForwardFailure", "yes".to_string());
        push_opt("ServerAliveInterval", self.server_alive_interval.to_string());
        push_opt("ServerAliveCountMax", self.server_alive_count_max.to_string());
        push_opt("ConnectTimeout", self.connect_timeout.as_secs().to_string());
        push_opt("LogLevel", "ERROR".to_string());
        push_opt("BatchMode", "yes".to_string());

        if let Some(dir) = self.control_dir() {
            push_opt("ControlMaster", "auto".to_string());
            push_opt("ControlPath", dir.join("%C").to_string_lossy().to_string());
            push_opt("ControlPersist", format!("{}s", self.control_persist.as_secs()));
        }

        args.push("-p".to_string());
        args.push(self.port.to_string());

        args
    }
}

/// Option list for `private_key` with default policy.
///
/// `timeout` of `None` uses the default connect timeout.
pub fn ssh_options_list(
    private_key: &Path,
    control_name: Option<&str>,
    timeout: Option<Duration>,
) -> Vec<String> {
    let mut options = SshOptions::new(private_key);
    options.control_name = control_name.map(str::to_string);
    options.connect_timeout =
        timeout.unwrap_or(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
    options.to_args()
}

/// Local forward flags, binding each port to the same number on the remote side
pub fn port_forward_args(ports: &[u16]) -> Vec<String> {
    ports
        .iter()
        .flat_map(|port| ["-L".to_string(), format!("{}:localhost:{}", port, port)])
        .collect()
}

/// Control socket directory for an identifier.
///
/// The name is hashed so arbitrary identifiers stay within the unix socket
/// path limit once ssh appends the `%C` digest.
pub fn control_dir_for(root: &Path, control_name: &str) -> PathBuf {
    let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, control_name.as_bytes())
        .simple()
        .to_string();
    root.join(format!("fleetrun_ssh_{}", &digest[..10]))
}
