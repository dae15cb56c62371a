//! Data structures for tracking process state.
//!
//! This module defines the options used to spawn a process (`SpawnOptions`),
//! its lifecycle status (`ProcessStatus`), and the record persisted for every
//! managed id (`ProcessRecord`).

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Options for a single spawn request.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Stable identifier, usually the module name.
    pub id: String,
    /// The command executable, or the full command line when `shell` is set.
    pub command: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// Append output to this file.
    pub log_file: Option<PathBuf>,
    /// Run through the platform shell (`sh -c` / `cmd /C`).
    pub shell: bool,
    /// Fire-and-forget: no pipes, new session, survives the supervisor.
    pub detached: bool,
}

impl SpawnOptions {
    /// Shell-backed options for a command line.
    pub fn shell(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            shell: true,
            ..Self::default()
        }
    }

    /// The full invocation as a single string.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, shell_words::join(&self.args))
        }
    }

    /// Rebuilds spawn options from a record, e.g. one loaded from disk.
    pub fn from_record(record: &ProcessRecord) -> Self {
        Self {
            id: record.id.clone(),
            command: record.command.clone(),
            args: Vec::new(),
            cwd: record.cwd.clone(),
            env: record.env.clone(),
            log_file: record.log_file.clone(),
            shell: true,
            detached: false,
        }
    }
}

/// The current lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Known but never started.
    Idle,
    /// Spawn requested, no PID yet.
    Starting,
    /// Process is actively running.
    Running,
    /// Termination in progress.
    Stopping,
    /// Exited cleanly or was stopped on request.
    Stopped,
    /// Failed to start or exited with an error.
    Failed,
}

impl ProcessStatus {
    /// Statuses for which a PID must be present.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

/// Metadata for one managed process id. Mirrored to the state file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    /// Full invocation string.
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Reconstructed from persisted state, or spawned without pipes; no live
    /// handle is held for it.
    #[serde(default)]
    pub detached: bool,
}

impl ProcessRecord {
    /// A fresh `Starting` record for the given options.
    pub fn starting(options: &SpawnOptions) -> Self {
        Self {
            id: options.id.clone(),
            pid: None,
            status: ProcessStatus::Starting,
            command: options.command_line(),
            cwd: options.cwd.clone(),
            env: options.env.clone(),
            log_file: options.log_file.clone(),
            started_at: Some(Utc::now()),
            stopped_at: None,
            exit_code: None,
            last_error: None,
            detached: options.detached,
        }
    }

    /// Moves the record into a terminal status, dropping the PID.
    pub fn finish(&mut self, status: ProcessStatus, exit_code: Option<i32>, error: Option<String>) {
        self.status = status;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        if exit_code.is_some() {
            self.exit_code = exit_code;
        }
        if error.is_some() {
            self.last_error = error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_quotes_args() {
        let options = SpawnOptions {
            id: "api".into(),
            command: "node".into(),
            args: vec!["server.js".into(), "--name".into(), "my app".into()],
            ..SpawnOptions::default()
        };
        assert_eq!(options.command_line(), "node server.js --name 'my app'");
    }

    #[test]
    fn finish_clears_pid_and_keeps_previous_error() {
        let mut record = ProcessRecord::starting(&SpawnOptions::shell("api", "sleep 1"));
        record.pid = Some(42);
        record.status = ProcessStatus::Running;
        record.last_error = Some("earlier".into());
        record.finish(ProcessStatus::Stopped, Some(0), None);
        assert_eq!(record.pid, None);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.last_error.as_deref(), Some("earlier"));
        assert!(record.stopped_at.is_some());
    }

    #[test]
    fn record_serializes_camel_case() {
        let mut record = ProcessRecord::starting(&SpawnOptions::shell("web", "pnpm dev"));
        record.status = ProcessStatus::Running;
        record.pid = Some(7);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["pid"], 7);
        assert!(json.get("startedAt").is_some());
        assert!(json.get("lastError").is_some());
    }
}
