//! Per-module append-only log files.
//!
//! Each line is prefixed with an ISO-8601 timestamp and the module tag;
//! stderr lines are additionally tagged `[ERROR]`. File I/O happens on a
//! dedicated task so the event pump never blocks on disk.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::output::{OutputChunk, StreamKind};

enum LogMessage {
    Chunk(OutputChunk),
    Close(oneshot::Sender<()>),
}

/// Handle to an open log file.
pub struct LogWriter {
    path: PathBuf,
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl LogWriter {
    /// Opens (or creates) `path` in append mode. Failures are logged and the
    /// writer silently discards output.
    pub fn open(path: impl Into<PathBuf>, tag: Option<String>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path.clone(), tag, rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, chunk: &OutputChunk) {
        let _ = self.tx.send(LogMessage::Chunk(chunk.clone()));
    }

    /// Flushes pending lines and closes the file.
    pub async fn close(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(LogMessage::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Formats one chunk as log-file lines.
pub fn format_entry(timestamp: &str, tag: Option<&str>, chunk: &OutputChunk) -> String {
    let mut out = String::new();
    for line in chunk.text.lines() {
        out.push_str(timestamp);
        if let Some(tag) = tag {
            out.push_str(" [");
            out.push_str(tag);
            out.push(']');
        }
        if chunk.stream == StreamKind::Stderr {
            out.push_str(" [ERROR]");
        }
        out.push(' ');
        out.push_str(line);
        out.push('\n');
    }
    out
}

async fn run_writer(
    path: PathBuf,
    tag: Option<String>,
    mut rx: mpsc::UnboundedReceiver<LogMessage>,
) {
    let file = match open_append(&path).await {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(path = %path.display(), "failed to open log file: {}", err);
            None
        }
    };
    let mut writer = file.map(BufWriter::new);

    while let Some(message) = rx.recv().await {
        let mut pending = vec![message];
        while let Ok(next) = rx.try_recv() {
            pending.push(next);
        }
        let mut close = None;
        for message in pending {
            match message {
                LogMessage::Chunk(chunk) => {
                    let Some(out) = writer.as_mut() else { continue };
                    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                    let entry = format_entry(&timestamp, tag.as_deref(), &chunk);
                    if let Err(err) = out.write_all(entry.as_bytes()).await {
                        warn!(path = %path.display(), "failed to write log file: {}", err);
                    }
                }
                LogMessage::Close(ack) => {
                    close = Some(ack);
                    break;
                }
            }
        }
        if let Some(out) = writer.as_mut() {
            let _ = out.flush().await;
        }
        if let Some(ack) = close {
            let _ = ack.send(());
            return;
        }
    }
    if let Some(out) = writer.as_mut() {
        let _ = out.flush().await;
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
