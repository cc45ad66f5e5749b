//! Remote command resolution and shell quoting

use crate::mode::ExecMode;
use std::fmt;

/// A command as given by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// A shell string, interpreted by the remote shell as-is
    Shell(String),
    /// An argument vector, each element quoted before joining
    Argv(Vec<String>),
}

impl RemoteCommand {
    /// Single shell line for this command
    pub fn to_shell_line(&self) -> String {
        match self {
            RemoteCommand::Shell(line) => line.clone(),
            RemoteCommand::Argv(argv) => argv
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Whether there is nothing to execute
    pub fn is_empty(&self) -> bool {
        match self {
            RemoteCommand::Shell(line) => line.trim().is_empty(),
            RemoteCommand::Argv(argv) => argv.is_empty(),
        }
    }

    /// The line ssh sends to the remote side for `mode`.
    ///
    /// The command is always handed to `shell -c` as one quoted word so
    /// the remote login shell does not re-split it. An empty command in
    /// login mode starts a bare login shell.
    pub fn remote_line(&self, mode: ExecMode, shell: &str) -> String {
        let shell = shell_quote(shell);
        if mode.login_shell() {
            if self.is_empty() {
                format!("{} --login", shell)
            } else {
                format!("{} --login -c {}", shell, shell_quote(&self.to_shell_line()))
            }
        } else {
            format!("{} -c {}", shell, shell_quote(&self.to_shell_line()))
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_line())
    }
}

impl From<&str> for RemoteCommand {
    fn from(line: &str) -> Self {
        RemoteCommand::Shell(line.to_string())
    }
}

impl From<String> for RemoteCommand {
    fn from(line: String) -> Self {
        RemoteCommand::Shell(line)
    }
}

impl From<Vec<String>> for RemoteCommand {
    fn from(argv: Vec<String>) -> Self {
        RemoteCommand::Argv(argv)
    }
}

impl From<&[&str]> for RemoteCommand {
    fn from(argv: &[&str]) -> Self {
        RemoteCommand::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for RemoteCommand {
    fn from(argv: [&str; N]) -> Self {
        RemoteCommand::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// Quote `s` for a POSIX shell.
///
/// Strings made only of safe characters are returned bare; anything else
/// is wrapped in single quotes with embedded quotes spliced as `'\''`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | '@' | ',' | '+')
    }) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
