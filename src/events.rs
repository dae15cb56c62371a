//! Event definitions for the process event pump.
//!
//! Launched processes report back to the `ProcessManager` exclusively through
//! `LaunchEvent` messages; signals requested by callers are described by
//! `ProcessSignal`.

use std::str::FromStr;

use crate::output::OutputChunk;

/// Signals a caller can ask the terminator to deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    #[default]
    SigTerm,
    SigHup,
    SigKill,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigInt => "SIGINT",
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigHup => "SIGHUP",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }
}

impl FromStr for ProcessSignal {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "INT" | "2" => Ok(ProcessSignal::SigInt),
            "TERM" | "15" => Ok(ProcessSignal::SigTerm),
            "HUP" | "1" => Ok(ProcessSignal::SigHup),
            "KILL" | "9" => Ok(ProcessSignal::SigKill),
            _ => Err(format!("unsupported signal: {}", value)),
        }
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number (unix only).
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable reason for a non-successful exit.
    pub fn describe(&self) -> Option<String> {
        match (self.code, self.signal) {
            (Some(0), _) => None,
            (Some(code), _) => Some(format!("exited with code {}", code)),
            (None, Some(signal)) => Some(format!("terminated by signal {}", signal)),
            (None, None) => Some("exited without a status code".to_string()),
        }
    }
}

/// Messages sent from launched processes to the manager's event pump.
///
/// Every message carries the PID of the run it belongs to so events from a
/// previous run of the same id can be told apart after a restart.
#[derive(Debug, Clone)]
pub enum LaunchEvent {
    /// A chunk of output was read from one of the child's pipes.
    Output { pid: u32, chunk: OutputChunk },
    /// The child exited (or waiting on it failed).
    Exited {
        id: String,
        pid: u32,
        outcome: Option<ExitOutcome>,
        error: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signal_names() {
        assert_eq!("SIGTERM".parse::<ProcessSignal>(), Ok(ProcessSignal::SigTerm));
        assert_eq!("int".parse::<ProcessSignal>(), Ok(ProcessSignal::SigInt));
        assert_eq!("9".parse::<ProcessSignal>(), Ok(ProcessSignal::SigKill));
        assert!("SIGUSR1".parse::<ProcessSignal>().is_err());
    }

    #[test]
    fn describes_exit_outcomes() {
        let clean = ExitOutcome { code: Some(0), signal: None };
        assert!(clean.success());
        assert_eq!(clean.describe(), None);
        let failed = ExitOutcome { code: Some(3), signal: None };
        assert_eq!(failed.describe().as_deref(), Some("exited with code 3"));
        let killed = ExitOutcome { code: None, signal: Some(9) };
        assert_eq!(killed.describe().as_deref(), Some("terminated by signal 9"));
    }
}
