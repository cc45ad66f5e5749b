//! Per-node command runner

use crate::command::RemoteCommand;
use crate::config::RunnerConfig;
use crate::error::{transport_failure, RunnerError};
use crate::mode::ExecMode;
use crate::options::{port_forward_args, SshOptions};
use crate::registry::{ChannelKey, ChannelSpec, ControlLease, ControlRegistry};
use crate::stream::{self, Cancellation, DrainConfig, DrainError, OutputLine, ProcessOutcome};
use crate::sync::{rsh_command, rsync_args, SyncDirection, SyncRequest};
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// rsync exit code for protocol stream errors, which include a dead transport
const RSYNC_STREAM_ERROR: i32 = 12;

/// Who and how to reach one node; fixed at runner creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    /// Address used both to dial and to identify the node
    pub address: String,
    /// Remote user
    pub user: String,
    /// Private key
    pub key_path: PathBuf,
    /// Multiplexing identifier
    pub control_name: Option<String>,
    /// Remote port
    pub port: u16,
}

impl ConnectionIdentity {
    /// `user@address`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Per-call options for [`CommandRunner::run`] and [`CommandRunner::run_captured`]
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Terminal and shell policy
    pub mode: ExecMode,
    /// Local ports forwarded to the same port on the node
    pub port_forwards: Vec<u16>,
    /// Append output to this file
    pub log_path: Option<PathBuf>,
    /// Emit output lines as tracing events
    pub stream_logs: bool,
    /// Copy output to this process's stdout/stderr
    pub echo_to_stdio: bool,
    /// Keep stderr apart from stdout when capturing
    pub separate_stderr: bool,
    /// Programmatic line receiver
    pub sink: Option<mpsc::UnboundedSender<OutputLine>>,
    /// Caller cancellation
    pub cancel: Option<CancellationToken>,
    /// Kill the command if it runs longer than this
    pub deadline: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: ExecMode::Silent,
            port_forwards: Vec::new(),
            log_path: None,
            stream_logs: false,
            echo_to_stdio: false,
            separate_stderr: true,
            sink: None,
            cancel: None,
            deadline: None,
        }
    }
}

impl RunOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution mode
    pub fn mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Forward `port` for the duration of the command
    pub fn forward_port(mut self, port: u16) -> Self {
        self.port_forwards.push(port);
        self
    }

    /// Append output to `path`
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Emit output lines as tracing events
    pub fn stream_logs(mut self, enabled: bool) -> Self {
        self.stream_logs = enabled;
        self
    }

    /// Copy output to local stdio
    pub fn echo_to_stdio(mut self, enabled: bool) -> Self {
        self.echo_to_stdio = enabled;
        self
    }

    /// Keep stderr separate (default) or merge it into stdout
    pub fn separate_stderr(mut self, enabled: bool) -> Self {
        self.separate_stderr = enabled;
        self
    }

    /// Deliver output lines to `sink`
    pub fn sink(mut self, sink: mpsc::UnboundedSender<OutputLine>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Abort when `token` is cancelled
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Abort after `deadline`
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn cancellation(&self) -> Cancellation {
        Cancellation {
            token: self.cancel.clone(),
            deadline: self.deadline,
        }
    }
}

/// Result of a captured run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// Node address
    pub target: String,
    /// Command line as sent
    pub command: String,
    /// Exit status (0 for success)
    pub status: i32,
    /// stdout output (merged output when stderr was not kept separate)
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandOutput {
    /// Check if command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Combine stdout and stderr
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Treat a non-zero exit as [`RunnerError::RemoteCommand`]
    pub fn into_result(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(RunnerError::RemoteCommand {
                target: self.target,
                command: self.command,
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// Operations every node runner offers
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Node address
    fn address(&self) -> &str;

    /// Run a command and return its exit status
    async fn run(&self, command: RemoteCommand, options: &RunOptions) -> Result<i32>;

    /// Run a command and return its status with captured output
    async fn run_captured(&self, command: RemoteCommand, options: &RunOptions) -> Result<CommandOutput>;

    /// Synchronize a directory tree with the node
    async fn sync(&self, request: &SyncRequest) -> Result<()>;
}

/// Runs commands and syncs files on one node through the ssh and rsync binaries.
///
/// Construction does no I/O; the first `run` or `sync` dials the node.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    identity: ConnectionIdentity,
    config: Arc<RunnerConfig>,
    registry: ControlRegistry,
}

impl CommandRunner {
    /// Runner with default configuration and the global control registry
    pub fn new(
        address: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identity: ConnectionIdentity {
                address: address.into(),
                user: user.into(),
                key_path: key_path.into(),
                control_name: None,
                port: 22,
            },
            config: Arc::new(RunnerConfig::default()),
            registry: ControlRegistry::global(),
        }
    }

    /// Runner for a fully specified identity
    pub fn from_identity(
        identity: ConnectionIdentity,
        config: Arc<RunnerConfig>,
        registry: ControlRegistry,
    ) -> Self {
        Self {
            identity,
            config,
            registry,
        }
    }

    /// Set the multiplexing identifier
    pub fn with_control_name(mut self, name: impl Into<String>) -> Self {
        self.identity.control_name = Some(name.into());
        self
    }

    /// Set the remote port
    pub fn with_port(mut self, port: u16) -> Self {
        self.identity.port = port;
        self
    }

    /// Use `config` instead of the defaults
    pub fn with_config(mut self, config: Arc<RunnerConfig>) -> Self {
        self.config = config;
        self
    }

    /// Use `registry` instead of the global one
    pub fn with_registry(mut self, registry: ControlRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Connection identity
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// Node address
    pub fn address(&self) -> &str {
        &self.identity.address
    }

    /// Configuration in use
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// ssh options for this node
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions::from_config(
            self.identity.key_path.clone(),
            self.identity.control_name.clone(),
            self.identity.port,
            &self.config,
        )
    }

    /// Arguments passed to the ssh binary for `command` (the binary itself excluded)
    pub fn ssh_argv(&self, command: &RemoteCommand, mode: ExecMode, port_forwards: &[u16]) -> Vec<String> {
        let mut args = self.ssh_options().to_args();
        args.extend(mode.tty_flags().iter().map(|flag| flag.to_string()));
        args.extend(port_forward_args(port_forwards));
        args.push(self.identity.destination());
        args.push(command.remote_line(mode, &self.config.remote_shell));
        args
    }

    /// Run `command` and return its exit status.
    ///
    /// Output is drained to the log, tracing and sinks but not kept.
    pub async fn run(&self, command: impl Into<RemoteCommand>, options: &RunOptions) -> Result<i32> {
        let command = command.into();
        let outcome = self.execute(&command, options, false).await?;
        Ok(outcome.status)
    }

    /// Run `command` and return its status with captured stdout and stderr
    pub async fn run_captured(
        &self,
        command: impl Into<RemoteCommand>,
        options: &RunOptions,
    ) -> Result<CommandOutput> {
        let command = command.into();
        let outcome = self.execute(&command, options, true).await?;
        Ok(CommandOutput {
            target: self.identity.address.clone(),
            command: command.to_shell_line(),
            status: outcome.status,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration: outcome.duration,
        })
    }

    /// Check the node with a no-op command
    pub async fn check_connection(&self) -> Result<()> {
        let command = RemoteCommand::from("true");
        let status = self.run(command.clone(), &RunOptions::default()).await?;
        if status == 0 {
            Ok(())
        } else {
            Err(RunnerError::Connection {
                target: self.identity.address.clone(),
                command: command.to_shell_line(),
                status,
                message: "connection check did not exit cleanly".to_string(),
            })
        }
    }

    #[instrument(skip(self, command, options), fields(node = %self.identity.address, mode = %options.mode))]
    async fn execute(
        &self,
        command: &RemoteCommand,
        options: &RunOptions,
        capture: bool,
    ) -> Result<ProcessOutcome> {
        let line = command.to_shell_line();
        let setup_error = |message: String| RunnerError::Setup {
            target: self.identity.address.clone(),
            command: line.clone(),
            message,
        };

        self.check_key().await.map_err(&setup_error)?;
        let _lease = self.lease().await.map_err(&setup_error)?;
        let log = match &options.log_path {
            Some(path) => Some(
                stream::open_log(path)
                    .await
                    .map_err(|e| setup_error(format!("cannot open log {}: {}", path.display(), e)))?,
            ),
            None => None,
        };

        let args = self.ssh_argv(command, options.mode, &options.port_forwards);
        debug!("Executing on {}: {}", self.identity.address, line);

        let stdin = if options.mode.inherits_stdin() {
            Stdio::inherit()
        } else {
            Stdio::null()
        };
        let child = Command::new(&self.config.ssh_binary)
            .args(&args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                setup_error(format!(
                    "failed to spawn {}: {}",
                    self.config.ssh_binary.display(),
                    e
                ))
            })?;

        let drain = DrainConfig {
            label: self.identity.address.clone(),
            stream_logs: options.stream_logs,
            echo_to_stdio: options.echo_to_stdio,
            capture,
            separate_stderr: options.separate_stderr,
            sink: options.sink.clone(),
        };

        let outcome = stream::drain_process(child, log, &drain, &options.cancellation())
            .await
            .map_err(|e| match e {
                DrainError::Cancelled(reason) => RunnerError::Cancelled {
                    target: self.identity.address.clone(),
                    command: line.clone(),
                    reason,
                },
                DrainError::Io(e) => setup_error(format!("I/O error while streaming output: {}", e)),
            })?;

        if outcome.status == 255 {
            if let Some(message) = transport_failure(&outcome.stderr_tail) {
                warn!("Connection to {} failed: {}", self.identity.address, message);
                return Err(RunnerError::Connection {
                    target: self.identity.address.clone(),
                    command: line,
                    status: outcome.status,
                    message,
                });
            }
        }

        debug!(
            "Command on {} finished with status {} in {:?}",
            self.identity.address, outcome.status, outcome.duration
        );
        Ok(outcome)
    }

    /// Synchronize a tree with this node via rsync over the same ssh transport
    #[instrument(skip(self, request), fields(node = %self.identity.address, direction = %request.direction))]
    pub async fn sync(&self, request: &SyncRequest) -> Result<()> {
        let description = request.describe();
        let setup_error = |message: String| RunnerError::Setup {
            target: self.identity.address.clone(),
            command: description.clone(),
            message,
        };
        let sync_error = |status: Option<i32>, output: String| RunnerError::Sync {
            target: self.identity.address.clone(),
            src: request.source.clone(),
            dst: request.destination.clone(),
            status,
            output,
        };

        self.check_key().await.map_err(&setup_error)?;

        match request.direction {
            SyncDirection::Upload => {
                if tokio::fs::metadata(&request.source).await.is_err() {
                    return Err(sync_error(
                        None,
                        format!("source path {} not found", request.source),
                    ));
                }
            }
            SyncDirection::Download => {
                let target_dir = if request.destination.ends_with('/') {
                    Some(Path::new(&request.destination))
                } else {
                    Path::new(&request.destination).parent()
                };
                if let Some(dir) = target_dir.filter(|d| !d.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(dir).await.map_err(|e| {
                        sync_error(None, format!("cannot create {}: {}", dir.display(), e))
                    })?;
                }
            }
        }

        let _lease = self.lease().await.map_err(&setup_error)?;
        let log = match &request.log_path {
            Some(path) => Some(
                stream::open_log(path)
                    .await
                    .map_err(|e| setup_error(format!("cannot open log {}: {}", path.display(), e)))?,
            ),
            None => None,
        };

        let rsh = rsh_command(&self.config.ssh_binary, &self.ssh_options().to_args())
            .map_err(&setup_error)?;
        let args = rsync_args(request, &rsh, &self.identity.destination());
        info!("Starting {} on {}", description, self.identity.address);

        let child = Command::new(&self.config.rsync_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                setup_error(format!(
                    "failed to spawn {}: {}",
                    self.config.rsync_binary.display(),
                    e
                ))
            })?;

        let drain = DrainConfig {
            label: self.identity.address.clone(),
            stream_logs: request.stream_logs,
            echo_to_stdio: request.echo_to_stdio,
            capture: false,
            separate_stderr: true,
            sink: request.sink.clone(),
        };
        let cancel = Cancellation {
            token: request.cancel.clone(),
            deadline: None,
        };

        let outcome = stream::drain_process(child, log, &drain, &cancel)
            .await
            .map_err(|e| match e {
                DrainError::Cancelled(reason) => RunnerError::Cancelled {
                    target: self.identity.address.clone(),
                    command: description.clone(),
                    reason,
                },
                DrainError::Io(e) => setup_error(format!("I/O error while streaming output: {}", e)),
            })?;

        match outcome.status {
            0 => {
                debug!("{} finished in {:?}", description, outcome.duration);
                Ok(())
            }
            status => {
                if status == 255 || status == RSYNC_STREAM_ERROR {
                    if let Some(message) = transport_failure(&outcome.stderr_tail) {
                        return Err(RunnerError::Connection {
                            target: self.identity.address.clone(),
                            command: description,
                            status,
                            message,
                        });
                    }
                }
                Err(sync_error(Some(status), outcome.stderr_tail.trim_end().to_string()))
            }
        }
    }

    async fn check_key(&self) -> std::result::Result<(), String> {
        let key = &self.identity.key_path;
        match tokio::fs::metadata(key).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(format!("private key {} is not a file", key.display())),
            Err(e) => Err(format!("cannot read private key {}: {}", key.display(), e)),
        }
    }

    async fn lease(&self) -> std::result::Result<Option<ControlLease>, String> {
        let Some(control_name) = &self.identity.control_name else {
            return Ok(None);
        };
        let Some(control_dir) = self.ssh_options().control_dir() else {
            return Ok(None);
        };
        let key = ChannelKey {
            target: self.identity.address.clone(),
            control_name: control_name.clone(),
        };
        let spec = ChannelSpec {
            control_dir,
            destination: self.identity.destination(),
            port: self.identity.port,
        };
        self.registry
            .acquire(key, spec)
            .await
            .map(Some)
            .map_err(|e| format!("cannot prepare control socket directory: {}", e))
    }
}

#[async_trait]
impl RemoteRunner for CommandRunner {
    fn address(&self) -> &str {
        CommandRunner::address(self)
    }

    async fn run(&self, command: RemoteCommand, options: &RunOptions) -> Result<i32> {
        CommandRunner::run(self, command, options).await
    }

    async fn run_captured(&self, command: RemoteCommand, options: &RunOptions) -> Result<CommandOutput> {
        CommandRunner::run_captured(self, command, options).await
    }

    async fn sync(&self, request: &SyncRequest) -> Result<()> {
        CommandRunner::sync(self, request).await
    }
}
