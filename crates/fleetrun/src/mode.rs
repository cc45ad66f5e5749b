//! Execution modes for a single remote command

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Terminal and shell policy for one `run` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// No pseudo-terminal; output is captured or streamed
    #[default]
    Silent,
    /// Pseudo-terminal for the duration of the command
    Interactive,
    /// Full login shell, used for session-like attach
    Login,
}

impl ExecMode {
    /// Terminal allocation flags passed to ssh
    pub fn tty_flags(self) -> &'static [&'static str] {
        match self {
            ExecMode::Silent => &["-T"],
            ExecMode::Interactive | ExecMode::Login => &["-tt"],
        }
    }

    /// Whether the remote shell is started as a login shell
    pub fn login_shell(self) -> bool {
        matches!(self, ExecMode::Login)
    }

    /// Whether the local terminal's stdin is handed to ssh
    pub fn inherits_stdin(self) -> bool {
        !matches!(self, ExecMode::Silent)
    }

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ExecMode::Silent => "silent",
            ExecMode::Interactive => "interactive",
            ExecMode::Login => "login",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(ExecMode::Silent),
            "interactive" => Ok(ExecMode::Interactive),
            "login" => Ok(ExecMode::Login),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tty_flags_are_exclusive() {
        assert_eq!(ExecMode::Silent.tty_flags(), &["-T"]);
        for mode in [ExecMode::Interactive, ExecMode::Login] {
            assert!(!mode.tty_flags().contains(&"-T"));
            assert_eq!(mode.tty_flags(), &["-tt"]);
        }
    }

    #[test]
    fn test_mode_policies() {
        assert_eq!(ExecMode::default(), ExecMode::Silent);
        assert!(ExecMode::Login.login_shell());
        assert!(!ExecMode::Interactive.login_shell());
        assert!(!ExecMode::Silent.inherits_stdin());
        assert!(ExecMode::Interactive.inherits_stdin());
    }

    #[test]
    fn test_mode_parse_and_display() {
        for mode in [ExecMode::Silent, ExecMode::Interactive, ExecMode::Login] {
            assert_eq!(mode.to_string().parse::<ExecMode>().unwrap(), mode);
        }
        assert_eq!("LOGIN".parse::<ExecMode>().unwrap(), ExecMode::Login);
        assert!("tty".parse::<ExecMode>().is_err());

        let json = serde_json::to_string(&ExecMode::Interactive).unwrap();
        assert_eq!(json, "\"interactive\"");
    }
}
