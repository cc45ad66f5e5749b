//! fleetrun CLI
//!
//! Runs one command, or one sync, across a set of nodes in parallel.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fleetrun::{
    CommandRunner, ExecMode, NodeCredentials, RetryPolicy, RunOptions, RunnerConfig,
    RunnerFactory, SyncRequest,
};
use futures::stream::{self, StreamExt};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetrun")]
#[command(about = "Run commands and sync files across cluster nodes over ssh", long_about = None)]
struct Cli {
    /// Comma-separated node addresses
    #[arg(long, value_delimiter = ',', required = true)]
    nodes: Vec<String>,

    /// Remote user
    #[arg(long)]
    user: String,

    /// Private key file
    #[arg(long)]
    key: PathBuf,

    /// Multiplexing identifier shared by all connections to a node
    #[arg(long)]
    control: Option<String>,

    /// Remote ssh port
    #[arg(long, default_value_t = 22)]
    port: u16,

    /// Maximum nodes handled at once
    #[arg(long, default_value_t = 16)]
    parallel: usize,

    /// JSON runner configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Attempts per node for connection failures
    #[arg(long, default_value_t = 1)]
    retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on every node
    Exec {
        /// silent, interactive or login
        #[arg(long, default_value = "silent")]
        mode: ExecMode,

        /// Write each node's output to <dir>/<node>.log
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Kill the command after this many seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Copy a local tree to every node
    Up {
        /// Local source
        src: String,
        /// Remote destination
        dst: String,
        /// Extra exclude patterns
        #[arg(long)]
        exclude: Vec<String>,
        /// Remove remote files missing locally
        #[arg(long)]
        delete: bool,
    },
    /// Copy a remote tree from every node into <dst>/<node>
    Down {
        /// Remote source
        src: String,
        /// Local destination root
        dst: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every node succeeded
async fn run(cli: Cli) -> Result<bool> {
    let config = match &cli.config {
        Some(path) => RunnerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    let ssh_binary = config.ssh_binary.clone();

    let mut credentials = NodeCredentials::new(&cli.user, &cli.key).with_port(cli.port);
    if let Some(name) = &cli.control {
        credentials = credentials.with_control_name(name);
    }
    let factory = RunnerFactory::new(config);
    let runners = factory.make_runners(&cli.nodes, &credentials);
    let policy = RetryPolicy::with_attempts(cli.retries);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling remote work");
            on_interrupt.cancel();
        }
    });

    let task = Task::from_command(cli.command, cancel);
    let results: Vec<(String, std::result::Result<i32, fleetrun::RunnerError>)> =
        stream::iter(runners)
            .map(|runner| {
                let task = &task;
                let policy = &policy;
                async move {
                    let result = policy.run(|_| task.run_on(&runner)).await;
                    (runner.address().to_string(), result)
                }
            })
            .buffer_unordered(cli.parallel.max(1))
            .collect()
            .await;

    let mut all_ok = true;
    for (node, result) in &results {
        match result {
            Ok(0) => info!("{}: ok", node),
            Ok(status) => {
                all_ok = false;
                error!("{}: exited with status {}", node, status);
            }
            Err(e) => {
                all_ok = false;
                error!("{}: {}", node, e);
            }
        }
    }

    if cli.control.is_some() {
        factory.registry().shutdown(&ssh_binary, None).await;
    }

    Ok(all_ok)
}

enum Task {
    Exec {
        command: Vec<String>,
        options: RunOptions,
        log_dir: Option<PathBuf>,
    },
    Sync {
        request: SyncRequest,
        per_node_dst: bool,
    },
}

impl Task {
    fn from_command(command: Commands, cancel: CancellationToken) -> Self {
        match command {
            Commands::Exec {
                mode,
                log_dir,
                timeout,
                command,
            } => {
                let mut options = RunOptions::new()
                    .mode(mode)
                    .stream_logs(true)
                    .cancel(cancel);
                if let Some(secs) = timeout {
                    options = options.deadline(std::time::Duration::from_secs(secs));
                }
                Task::Exec {
                    command,
                    options,
                    log_dir,
                }
            }
            Commands::Up {
                src,
                dst,
                exclude,
                delete,
            } => {
                let request = exclude
                    .into_iter()
                    .fold(SyncRequest::upload(src, dst), |req, pattern| req.exclude(pattern))
                    .with_delete(delete)
                    .with_stream_logs(true)
                    .with_cancel(cancel);
                Task::Sync {
                    request,
                    per_node_dst: false,
                }
            }
            Commands::Down { src, dst } => Task::Sync {
                request: SyncRequest::download(src, dst)
                    .with_stream_logs(true)
                    .with_cancel(cancel),
                per_node_dst: true,
            },
        }
    }

    async fn run_on(&self, runner: &CommandRunner) -> fleetrun::Result<i32> {
        match self {
            Task::Exec {
                command,
                options,
                log_dir,
            } => {
                let mut options = options.clone();
                if let Some(dir) = log_dir {
                    options = options.log_path(dir.join(format!("{}.log", runner.address())));
                }
                // One argument is a shell line, several are an argument vector.
                let command = match command.as_slice() {
                    [line] => fleetrun::RemoteCommand::from(line.as_str()),
                    argv => fleetrun::RemoteCommand::from(argv.to_vec()),
                };
                runner.run(command, &options).await
            }
            Task::Sync {
                request,
                per_node_dst,
            } => {
                let mut request = request.clone();
                if *per_node_dst {
                    let dst = PathBuf::from(&request.destination).join(runner.address());
                    request.destination = format!("{}/", dst.display());
                }
                runner.sync(&request).await.map(|()| 0)
            }
        }
    }
}
