//! Process launching.
//!
//! `launch` spawns one child, wires its stdout/stderr readers, and hands back
//! the resulting record together with a `ChildHandle`. The child itself is
//! owned by a supervision task that reaps it, honours force-kill requests,
//! and reports the exit through the event channel and the handle's exit watch.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{ExitOutcome, LaunchEvent};
use crate::output::{OutputChunk, StreamKind};
use crate::process::{ProcessRecord, ProcessStatus, SpawnOptions};

/// How long the supervision task waits for pipe readers after the child exits.
const READER_DRAIN: Duration = Duration::from_millis(250);

/// A live handle to a launched child. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct ChildHandle {
    pid: u32,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Asks the supervision task to force-kill the child.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(());
    }

    /// The exit outcome, once the child has been reaped.
    pub fn exited(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }
}

/// Result of a launch attempt.
#[derive(Debug)]
pub struct Launched {
    /// `Running` on success, `Failed` when the OS refused the spawn.
    pub record: ProcessRecord,
    pub handle: Option<ChildHandle>,
}

/// Spawns the process described by `options`.
///
/// `on_update` observes every status transition in order (Starting, then
/// Running or Failed). Spawn errors never escape: they come back as a
/// `Failed` record with `last_error` set.
pub fn launch(
    options: &SpawnOptions,
    events: &mpsc::UnboundedSender<LaunchEvent>,
    mut on_update: impl FnMut(&ProcessRecord),
) -> Launched {
    let mut record = ProcessRecord::starting(options);
    on_update(&record);

    let mut command = build_command(options);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let message = format!("failed to spawn `{}`: {}", record.command, err);
            warn!(id = %options.id, "{}", message);
            record.finish(ProcessStatus::Failed, None, Some(message));
            on_update(&record);
            return Launched {
                record,
                handle: None,
            };
        }
    };

    let Some(pid) = child.id() else {
        let message = format!("`{}` exited before a pid was assigned", record.command);
        record.finish(ProcessStatus::Failed, None, Some(message));
        on_update(&record);
        return Launched {
            record,
            handle: None,
        };
    };

    record.pid = Some(pid);
    record.status = ProcessStatus::Running;
    on_update(&record);
    info!(id = %options.id, pid, command = %record.command, "process started");

    let mut readers = Vec::new();
    if !options.detached {
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                options.id.clone(),
                pid,
                StreamKind::Stdout,
                stdout,
                events.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                options.id.clone(),
                pid,
                StreamKind::Stderr,
                stderr,
                events.clone(),
            )));
        }
    }

    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(supervise(
        options.id.clone(),
        pid,
        child,
        readers,
        kill_rx,
        exit_tx,
        events.clone(),
    ));

    Launched {
        record,
        handle: Some(ChildHandle {
            pid,
            kill_tx,
            exit_rx,
        }),
    }
}

fn build_command(options: &SpawnOptions) -> Command {
    let mut command = if options.shell {
        shell_command(&options.command_line())
    } else {
        let mut command = Command::new(&options.command);
        command.args(&options.args);
        command
    };
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    if !options.env.is_empty() {
        command.envs(&options.env);
    }
    command.stdin(Stdio::null());
    if options.detached {
        command.stdout(Stdio::null()).stderr(Stdio::null());
        command.kill_on_drop(false);
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.kill_on_drop(true);
    }

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
        const DETACHED_PROCESS: u32 = 0x00000008;
        let mut flags = CREATE_NEW_PROCESS_GROUP;
        if options.detached {
            flags |= DETACHED_PROCESS;
        }
        command.creation_flags(flags);
    }

    // Own process group (or session, when detached) so signals reach the
    // whole tree behind a shell wrapper.
    #[cfg(unix)]
    {
        let detached = options.detached;
        unsafe {
            command.pre_exec(move || {
                if detached {
                    let _ = libc::setsid();
                } else {
                    let _ = libc::setpgid(0, 0);
                }
                Ok(())
            });
        }
    }

    command
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

async fn supervise(
    id: String,
    pid: u32,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    events: mpsc::UnboundedSender<LaunchEvent>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                debug!(id = %id, pid, "force killing process");
                let _ = child.start_kill();
            }
        }
    };

    let (outcome, error) = match status {
        Ok(status) => {
            let outcome = ExitOutcome::from_status(&status);
            (Some(outcome), outcome.describe())
        }
        Err(err) => (None, Some(format!("failed to wait on process: {}", err))),
    };
    let _ = exit_tx.send(Some(outcome.unwrap_or(ExitOutcome {
        code: None,
        signal: None,
    })));

    for reader in readers {
        let _ = tokio::time::timeout(READER_DRAIN, reader).await;
    }

    match &error {
        Some(reason) => info!(id = %id, pid, "process ended: {}", reason),
        None => info!(id = %id, pid, "process ended successfully"),
    }
    let _ = events.send(LaunchEvent::Exited {
        id,
        pid,
        outcome,
        error,
    });
}

async fn read_stream<R>(
    id: String,
    pid: u32,
    stream: StreamKind,
    reader: R,
    tx: mpsc::UnboundedSender<LaunchEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = OutputChunk {
                    id: id.clone(),
                    text: String::from_utf8_lossy(&buf).into_owned(),
                    stream,
                };
                if tx.send(LaunchEvent::Output { pid, chunk }).is_err() {
                    break;
                }
            }
            Err(err) => {
                debug!(id = %id, pid, "stopped reading {:?}: {}", stream, err);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn collect_until_exit(
        rx: &mut mpsc::UnboundedReceiver<LaunchEvent>,
    ) -> (Vec<OutputChunk>, Option<ExitOutcome>) {
        let mut chunks = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for events")
                .expect("event channel closed");
            match event {
                LaunchEvent::Output { chunk, .. } => chunks.push(chunk),
                LaunchEvent::Exited { outcome, .. } => return (chunks, outcome),
            }
        }
    }

    #[tokio::test]
    async fn reports_output_and_exit_code() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut statuses = Vec::new();
        let launched = launch(
            &SpawnOptions::shell("echo", "printf 'line1\\n'; printf 'line2\\n'; exit 3"),
            &tx,
            |record| statuses.push(record.status),
        );
        assert_eq!(statuses, vec![ProcessStatus::Starting, ProcessStatus::Running]);
        assert!(launched.record.pid.is_some());

        let (chunks, outcome) = collect_until_exit(&mut rx).await;
        let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, "line1\nline2\n");
        assert_eq!(outcome.and_then(|o| o.code), Some(3));
        assert!(launched.handle.unwrap().exited().is_some());
    }

    #[tokio::test]
    async fn spawn_failure_becomes_failed_record() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = SpawnOptions {
            id: "missing".into(),
            command: "devdeck-definitely-not-a-command".into(),
            ..SpawnOptions::default()
        };
        let mut statuses = Vec::new();
        let launched = launch(&options, &tx, |record| statuses.push(record.status));
        assert_eq!(statuses, vec![ProcessStatus::Starting, ProcessStatus::Failed]);
        assert_eq!(launched.record.status, ProcessStatus::Failed);
        assert!(launched.record.pid.is_none());
        assert!(launched.handle.is_none());
        assert!(launched
            .record
            .last_error
            .as_deref()
            .unwrap()
            .contains("failed to spawn"));
    }

    #[tokio::test]
    async fn kill_request_ends_child() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let launched = launch(&SpawnOptions::shell("sleeper", "sleep 30"), &tx, |_| {});
        let handle = launched.handle.unwrap();
        handle.kill();
        let (_, outcome) = collect_until_exit(&mut rx).await;
        assert_eq!(outcome.and_then(|o| o.signal), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn stderr_is_tagged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        launch(&SpawnOptions::shell("err", "echo oops >&2"), &tx, |_| {});
        let (chunks, _) = collect_until_exit(&mut rx).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].stream, StreamKind::Stderr);
        assert_eq!(chunks[0].text, "oops\n");
    }
}
