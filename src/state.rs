//! On-disk mirror of the process registry.
//!
//! The state file is a JSON array of `ProcessRecord`s. Writes go through a
//! single writer task so rapid spawn/stop churn never interleaves partial
//! writes; queued snapshots coalesce to the latest one and land atomically
//! via a temp file and rename.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::process::ProcessRecord;

/// File name used inside the state directory.
pub const STATE_FILE_NAME: &str = "processes.json";

enum WriteRequest {
    Snapshot(Vec<ProcessRecord>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the persisted process state.
pub struct StateStore {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl StateStore {
    /// Opens a store at `path` and starts its writer task.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.clone(), rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted records. A missing or unreadable file yields an
    /// empty list.
    pub async fn load(&self) -> Vec<ProcessRecord> {
        match read_records(&self.path).await {
            Ok(records) => records,
            Err(err) => {
                warn!(path = %self.path.display(), "ignoring process state: {:#}", err);
                Vec::new()
            }
        }
    }

    /// Queues a snapshot for writing. Never blocks and never fails the caller.
    pub fn persist(&self, records: Vec<ProcessRecord>) {
        if self.tx.send(WriteRequest::Snapshot(records)).is_err() {
            warn!(path = %self.path.display(), "state writer is gone, snapshot dropped");
        }
    }

    /// Resolves once every snapshot queued before this call has been written.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriteRequest::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn read_records(path: &Path) -> Result<Vec<ProcessRecord>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
    while let Some(request) = rx.recv().await {
        let mut latest = match request {
            WriteRequest::Snapshot(records) => records,
            WriteRequest::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };
        // Coalesce whatever queued up behind this snapshot, stopping at a flush.
        let mut acks = Vec::new();
        while let Ok(next) = rx.try_recv() {
            match next {
                WriteRequest::Snapshot(records) => latest = records,
                WriteRequest::Flush(ack) => {
                    acks.push(ack);
                    break;
                }
            }
        }
        match write_atomic(&path, &latest).await {
            Ok(()) => debug!(path = %path.display(), records = latest.len(), "process state written"),
            Err(err) => warn!(path = %path.display(), "failed to persist process state: {:#}", err),
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }
}

async fn write_atomic(path: &Path, records: &[ProcessRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(records).context("failed to encode process state")?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
