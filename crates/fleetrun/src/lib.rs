//! # fleetrun
//!
//! Remote command execution and file synchronization for cluster nodes.
//!
//! Each node gets a [`CommandRunner`] that drives the system `ssh` and
//! `rsync` binaries. Connections to the same node can share one
//! multiplexed control channel, tracked in a [`ControlRegistry`].
//!
//! ```no_run
//! use fleetrun::{make_runners, NodeCredentials, RunOptions, SyncRequest};
//!
//! # async fn demo() -> fleetrun::Result<()> {
//! let creds = NodeCredentials::new("ubuntu", "~/.ssh/cluster.pem").with_control_name("train-1");
//! for runner in make_runners(&["10.0.0.1", "10.0.0.2"], &creds) {
//!     runner.sync(&SyncRequest::upload("./workdir/", "~/workdir")).await?;
//!     let status = runner.run("python train.py", &RunOptions::new().stream_logs(true)).await?;
//!     println!("{}: {}", runner.address(), status);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Error types
pub mod error;

/// Runner configuration
pub mod config;

/// ssh option list
pub mod options;

/// Execution modes
pub mod mode;

/// Remote command lines
pub mod command;

/// Child process output streaming
pub mod stream;

/// Control channel registry
pub mod registry;

/// rsync argument assembly
pub mod sync;

/// Per-node runner
pub mod runner;

/// Retry policy
pub mod retry;

/// Runner factory
pub mod factory;

pub use command::{shell_quote, RemoteCommand};
pub use config::{ConfigError, RunnerConfig};
pub use error::{CancelReason, RunnerError};
pub use factory::{make_runners, NodeCredentials, RunnerFactory};
pub use mode::ExecMode;
pub use options::{ssh_options_list, SshOptions};
pub use registry::{ChannelKey, ControlLease, ControlRegistry, RegistryStats};
pub use retry::RetryPolicy;
pub use runner::{CommandOutput, CommandRunner, ConnectionIdentity, RemoteRunner, RunOptions};
pub use stream::{OutputLine, StreamKind};
pub use sync::{SyncDirection, SyncRequest};

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;
