//! Domain error types. Usage errors (unknown ids, conflicts) are kept
//! distinct from runtime failures so callers can tell them apart.

use thiserror::Error;

/// Errors returned by `ProcessManager` operations.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("process '{0}' not found")]
    NotFound(String),

    #[error("process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("process '{0}' is not running")]
    NotRunning(String),

    #[error("failed to stop '{id}': {source}")]
    Terminate {
        id: String,
        #[source]
        source: TerminateError,
    },
}

impl ManagerError {
    /// True for errors caused by how the API was called rather than by the
    /// process itself.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::AlreadyRunning(_) | Self::NotRunning(_)
        )
    }
}

/// Errors from the process terminator.
#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("pid {0} did not exit after a forced kill")]
    NoExit(u32),
}

/// Errors returned by the module orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("docker compose {action} failed for '{module}': {message}")]
    Compose {
        module: String,
        action: &'static str,
        message: String,
    },

    #[error(transparent)]
    Manager(#[from] ManagerError),
}
