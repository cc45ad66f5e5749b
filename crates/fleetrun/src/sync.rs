//! rsync invocation assembly for directory synchronization

use crate::stream::OutputLine;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Version-control metadata, never transferred in either direction
pub const VCS_EXCLUDE: &str = ".git";

/// Per-directory filter file merged into the rule set
pub const FILTER_FILE: &str = ".gitignore";

/// Repository-local exclude list, relative to the source root
pub const GIT_INFO_EXCLUDE: &str = ".git/info/exclude";

/// Transfer direction relative to the local machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Local source, remote destination
    Upload,
    /// Remote source, local destination
    Download,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncDirection::Upload => f.write_str("upload"),
            SyncDirection::Download => f.write_str("download"),
        }
    }
}

/// One synchronization call.
///
/// Paths are handed to rsync verbatim, so a trailing `/` on the source
/// means "the contents of this directory".
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// Transfer direction
    pub direction: SyncDirection,
    /// Source path (local for uploads, remote for downloads)
    pub source: String,
    /// Destination path (remote for uploads, local for downloads)
    pub destination: String,
    /// Extra exclude patterns, applied after the fixed rules
    pub excludes: Vec<String>,
    /// Merge `.gitignore` files found in the source tree
    pub use_filter_file: bool,
    /// Ask rsync for per-file progress
    pub show_progress: bool,
    /// Delete destination files that are absent from the source
    pub delete: bool,
    /// Append transfer output to this file
    pub log_path: Option<PathBuf>,
    /// Emit transfer output as tracing events
    pub stream_logs: bool,
    /// Copy transfer output to this process's stdout/stderr
    pub echo_to_stdio: bool,
    /// Programmatic line receiver
    pub sink: Option<mpsc::UnboundedSender<OutputLine>>,
    /// Caller cancellation
    pub cancel: Option<CancellationToken>,
}

impl SyncRequest {
    fn new(direction: SyncDirection, source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            direction,
            source: source.into(),
            destination: destination.into(),
            excludes: Vec::new(),
            use_filter_file: true,
            show_progress: false,
            delete: false,
            log_path: None,
            stream_logs: false,
            echo_to_stdio: false,
            sink: None,
            cancel: None,
        }
    }

    /// Local `source` to remote `destination`
    pub fn upload(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(SyncDirection::Upload, source, destination)
    }

    /// Remote `source` to local `destination`
    pub fn download(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self::new(SyncDirection::Download, source, destination)
    }

    /// Add an exclude pattern
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Enable or disable `.gitignore` merging
    pub fn with_filter_file(mut self, enabled: bool) -> Self {
        self.use_filter_file = enabled;
        self
    }

    /// Enable per-file progress output
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    /// Mirror mode: remove destination-only files
    pub fn with_delete(mut self, enabled: bool) -> Self {
        self.delete = enabled;
        self
    }

    /// Append output to `path`
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Stream output to tracing
    pub fn with_stream_logs(mut self, enabled: bool) -> Self {
        self.stream_logs = enabled;
        self
    }

    /// Stream output to this process's stdio
    pub fn with_echo(mut self, enabled: bool) -> Self {
        self.echo_to_stdio = enabled;
        self
    }

    /// Deliver output lines to `sink`
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<OutputLine>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Abort the transfer when `token` is cancelled
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Short description used in logs and errors
    pub fn describe(&self) -> String {
        format!("rsync {} {} -> {}", self.direction, self.source, self.destination)
    }
}

/// Exclusion rules in the order rsync must see them.
///
/// The fixed VCS exclusion comes first, then the filter file rules, then
/// caller patterns. Local files are only inspected for uploads; for downloads
/// the dir-merge rule is always passed since rsync ignores it when the
/// remote tree has no `.gitignore`.
pub fn exclusion_args(request: &SyncRequest) -> Vec<String> {
    let mut args = vec![format!("--exclude={}", VCS_EXCLUDE)];

    if request.use_filter_file {
        match request.direction {
            SyncDirection::Upload => {
                let root = Path::new(&request.source);
                if root.join(FILTER_FILE).is_file() {
                    args.push(format!("--filter=dir-merge,- {}", FILTER_FILE));
                }
                let info_exclude = root.join(GIT_INFO_EXCLUDE);
                if info_exclude.is_file() {
                    args.push(format!("--exclude-from={}", info_exclude.display()));
                }
            }
            SyncDirection::Download => {
                args.push(format!("--filter=dir-merge,- {}", FILTER_FILE));
            }
        }
    }

    for pattern in &request.excludes {
        args.push(format!("--exclude={}", pattern));
    }

    args
}

/// Full rsync argument vector.
///
/// `rsh` is the remote-shell command line passed with `-e` and
/// `destination` the `user@host` prefix for the remote side.
pub fn rsync_args(request: &SyncRequest, rsh: &str, destination: &str) -> Vec<String> {
    let mut args = vec!["-a".to_string(), "-z".to_string()];
    if request.show_progress {
        args.push("-P".to_string());
    }
    if request.delete {
        args.push("--delete".to_string());
    }
    args.extend(exclusion_args(request));
    args.push("-e".to_string());
    args.push(rsh.to_string());

    match request.direction {
        SyncDirection::Upload => {
            args.push(request.source.clone());
            args.push(format!("{}:{}", destination, request.destination));
        }
        SyncDirection::Download => {
            args.push(format!("{}:{}", destination, request.source));
            args.push(request.destination.clone());
        }
    }

    args
}

/// Quote one word for rsync's `-e` parser.
///
/// rsync splits on spaces and honours single and double quotes but not
/// backslashes, so shell-style `'\''` splicing cannot be used here. A word
/// holding both quote characters has no representation and yields `None`.
pub fn rsh_quote(word: &str) -> Option<String> {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| !c.is_whitespace() && c != '\'' && c != '"');
    if safe {
        Some(word.to_string())
    } else if !word.contains('\'') {
        Some(format!("'{}'", word))
    } else if !word.contains('"') {
        Some(format!("\"{}\"", word))
    } else {
        None
    }
}

/// Build the `-e` command line from an ssh binary and its options.
///
/// Fails on a word containing both `'` and `"`, which rsync cannot split back.
pub fn rsh_command(ssh_binary: &Path, options: &[String]) -> std::result::Result<String, String> {
    std::iter::once(ssh_binary.to_string_lossy().to_string())
        .chain(options.iter().cloned())
        .map(|word| {
            rsh_quote(&word).ok_or_else(|| {
                format!("cannot pass {} to rsync: it contains both quote characters", word)
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(|words| words.join(" "))
}
