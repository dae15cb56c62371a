//! Ties the pieces together: status changes from the process manager feed
//! the auto-restart manager, whose restart action goes back through the
//! orchestrator so a recovering module's dependencies are checked too.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auto_restart::{AutoRestartManager, FailureDecision, RetryNotice};
use crate::error::OrchestratorError;
use crate::orchestrator::{ModuleStartResult, Orchestrator};
use crate::process::{ProcessRecord, ProcessStatus};

pub struct Supervisor {
    orchestrator: Orchestrator,
    auto_restart: Option<AutoRestartManager>,
    watcher: JoinHandle<()>,
}

impl Supervisor {
    /// Starts watching module status. Retry notices arrive on the returned
    /// channel; with `auto_restart` unset failures are only logged.
    pub fn new(
        orchestrator: Orchestrator,
        auto_restart: Option<AutoRestartManager>,
    ) -> (Self, mpsc::UnboundedReceiver<RetryNotice>) {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let feed = orchestrator.manager().watch_status();
        let watcher = tokio::spawn(watch_loop(
            orchestrator.clone(),
            auto_restart.clone(),
            feed,
            notices_tx,
        ));
        (
            Self {
                orchestrator,
                auto_restart,
                watcher,
            },
            notices_rx,
        )
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn auto_restart(&self) -> Option<&AutoRestartManager> {
        self.auto_restart.as_ref()
    }

    fn forget(&self, name: &str) {
        if let Some(auto_restart) = &self.auto_restart {
            auto_restart.forget(name);
        }
    }

    pub async fn start_module(&self, name: &str) -> Result<Vec<ModuleStartResult>, OrchestratorError> {
        self.forget(name);
        self.orchestrator.start(name).await
    }

    pub async fn start_all(&self) -> Result<Vec<ModuleStartResult>, OrchestratorError> {
        if let Some(auto_restart) = &self.auto_restart {
            auto_restart.cleanup();
        }
        self.orchestrator.start_all().await
    }

    pub async fn stop_module(&self, name: &str) -> Result<(), OrchestratorError> {
        self.forget(name);
        self.orchestrator.stop(name).await
    }

    pub async fn restart_module(&self, name: &str) -> Result<ProcessRecord, OrchestratorError> {
        self.forget(name);
        self.orchestrator.restart(name).await
    }

    /// Stops watching, cancels pending restarts, stops every module, and
    /// clears the process state.
    pub async fn shutdown(self) {
        self.watcher.abort();
        if let Some(auto_restart) = &self.auto_restart {
            auto_restart.cleanup();
        }
        self.orchestrator.stop_all().await;
        self.orchestrator.manager().cleanup().await;
        info!("supervisor shut down");
    }
}

async fn watch_loop(
    orchestrator: Orchestrator,
    auto_restart: Option<AutoRestartManager>,
    mut feed: mpsc::UnboundedReceiver<ProcessRecord>,
    notices: mpsc::UnboundedSender<RetryNotice>,
) {
    while let Some(record) = feed.recv().await {
        if orchestrator.get(&record.id).is_none() {
            continue;
        }
        let Some(auto_restart) = &auto_restart else {
            if record.status == ProcessStatus::Failed {
                warn!(module = %record.id, "module failed, automatic restart disabled");
            }
            continue;
        };
        match record.status {
            ProcessStatus::Failed => {
                let orchestrator = orchestrator.clone();
                let name = record.id.clone();
                let decision = auto_restart.register_failure(
                    &record.id,
                    move || async move {
                        if let Err(err) = orchestrator.start(&name).await {
                            warn!(module = %name, "automatic restart failed: {}", err);
                        }
                    },
                    |notice| {
                        let _ = notices.send(notice);
                    },
                );
                if let FailureDecision::Exhausted { attempts } = decision {
                    warn!(
                        module = %record.id,
                        attempts,
                        "module keeps failing: {}",
                        record.last_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            ProcessStatus::Running => auto_restart.observe_running(&record.id),
            ProcessStatus::Stopped => auto_restart.observe_stopped(&record.id),
            ProcessStatus::Idle | ProcessStatus::Starting | ProcessStatus::Stopping => {}
        }
    }
}
