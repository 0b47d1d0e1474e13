//! Decoded process termination status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a child process ended.
///
/// Stopped/continued states are never recorded; a status only exists once the
/// process has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal number.
    Signaled(i32),
}

impl ExitStatus {
    /// Exit code in the negative-signal convention: the exit code for a normal
    /// exit, or the negated signal number when killed by a signal.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signo) => -signo,
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            ExitStatus::Signaled(signo) => Some(signo),
            ExitStatus::Exited(_) => None,
        }
    }

    /// Exit code a shell would report: `128 + signo` for signals.
    pub fn shell_code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signo) => 128 + signo,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit {code}"),
            ExitStatus::Signaled(signo) => write!(f, "signal {signo}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_decodes_negative() {
        let status = ExitStatus::Signaled(15);
        assert_eq!(status.code(), -15);
        assert_eq!(status.shell_code(), 143);
        assert!(!status.success());
    }

    #[test]
    fn exit_zero_is_success() {
        assert!(ExitStatus::Exited(0).success());
        assert_eq!(ExitStatus::Exited(3).code(), 3);
        assert_eq!(ExitStatus::Exited(3).signal(), None);
    }
}
