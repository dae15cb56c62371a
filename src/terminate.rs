//! Process termination.
//!
//! Graceful first, forceful after the escalation timeout. On unix the
//! requested signal goes to the child's process group and the child itself;
//! on Windows the tree is taken down with `taskkill /T /F`. Records without a
//! live handle (detached) are terminated by PID alone.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::TerminateError;
use crate::events::{ExitOutcome, ProcessSignal};
use crate::launcher::ChildHandle;

/// Default grace period before a force kill.
pub const DEFAULT_ESCALATION: Duration = Duration::from_secs(5);

/// Interval used when polling a PID we hold no handle for.
const PID_POLL: Duration = Duration::from_millis(100);

/// Cleanup run once the process is confirmed gone. Errors are logged only.
pub type StopHook<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// What to terminate.
#[derive(Debug, Clone, Copy)]
pub struct TerminateTarget<'a> {
    pub pid: u32,
    pub handle: Option<&'a ChildHandle>,
}

/// How termination concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited after the requested signal.
    Exited(ExitOutcome),
    /// Needed a force kill after the escalation timeout.
    ForceKilled(ExitOutcome),
    /// Was already gone before anything was sent.
    AlreadyExited,
    /// PID-only target: the signal was delivered and the PID is gone or was
    /// force killed.
    Signalled,
}

impl Termination {
    pub fn outcome(&self) -> Option<ExitOutcome> {
        match self {
            Termination::Exited(outcome) | Termination::ForceKilled(outcome) => Some(*outcome),
            Termination::AlreadyExited | Termination::Signalled => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Terminator {
    escalate_after: Duration,
}

impl Default for Terminator {
    fn default() -> Self {
        Self::new(DEFAULT_ESCALATION)
    }
}

impl Terminator {
    pub fn new(escalate_after: Duration) -> Self {
        Self { escalate_after }
    }

    /// Terminates `target`, then runs `on_stop` if the process is confirmed gone.
    pub async fn terminate(
        &self,
        target: TerminateTarget<'_>,
        signal: ProcessSignal,
        on_stop: Option<StopHook<'_>>,
    ) -> Result<Termination, TerminateError> {
        let result = match target.handle {
            Some(handle) => self.terminate_child(target.pid, handle, signal).await,
            None => self.terminate_pid(target.pid, signal).await,
        };
        if result.is_ok() {
            if let Some(hook) = on_stop {
                if let Err(err) = hook.await {
                    warn!(pid = target.pid, "stop hook failed: {:#}", err);
                }
            }
        }
        result
    }

    async fn terminate_child(
        &self,
        pid: u32,
        handle: &ChildHandle,
        signal: ProcessSignal,
    ) -> Result<Termination, TerminateError> {
        let mut exit_rx = handle.exit_watch();
        if handle.exited().is_some() {
            return Ok(Termination::AlreadyExited);
        }

        match deliver(pid, signal).await {
            Ok(()) => debug!(pid, signal = signal.label(), "signal sent"),
            Err(err) => {
                warn!(pid, "{}, falling back to a forced kill", err);
                handle.kill();
            }
        }

        if let Some(outcome) = wait_exit(&mut exit_rx, self.escalate_after).await {
            return Ok(Termination::Exited(outcome));
        }

        warn!(
            pid,
            "process ignored {} for {:?}, force killing",
            signal.label(),
            self.escalate_after
        );
        force_kill(pid).await;
        handle.kill();
        match wait_exit(&mut exit_rx, self.escalate_after).await {
            Some(outcome) => Ok(Termination::ForceKilled(outcome)),
            None => Err(TerminateError::NoExit(pid)),
        }
    }

    async fn terminate_pid(
        &self,
        pid: u32,
        signal: ProcessSignal,
    ) -> Result<Termination, TerminateError> {
        if !is_alive(pid) {
            return Ok(Termination::AlreadyExited);
        }
        deliver(pid, signal).await?;

        let deadline = tokio::time::Instant::now() + self.escalate_after;
        while tokio::time::Instant::now() < deadline {
            if !is_alive(pid) {
                return Ok(Termination::Signalled);
            }
            tokio::time::sleep(PID_POLL).await;
        }
        if is_alive(pid) {
            warn!(pid, "detached process still alive, force killing");
            force_kill(pid).await;
        }
        Ok(Termination::Signalled)
    }
}

async fn wait_exit(
    rx: &mut watch::Receiver<Option<ExitOutcome>>,
    timeout: Duration,
) -> Option<ExitOutcome> {
    let closed = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
        Ok(Ok(outcome)) => return *outcome,
        Ok(Err(_)) => true,
        Err(_) => false,
    };
    // A closed watch means the supervision task is gone and the child dropped.
    if closed {
        Some(rx.borrow().unwrap_or(ExitOutcome {
            code: None,
            signal: None,
        }))
    } else {
        None
    }
}

/// Whether `pid` refers to a live process.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code = 0u32;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

#[cfg(not(any(unix, windows)))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
async fn deliver(pid: u32, signal: ProcessSignal) -> Result<(), TerminateError> {
    send_signal(pid, signal).map_err(|source| TerminateError::Signal { pid, source })
}

#[cfg(not(unix))]
async fn deliver(pid: u32, _signal: ProcessSignal) -> Result<(), TerminateError> {
    // Windows has no signals that propagate to a tree; take it down instead.
    tree_kill(pid)
        .await
        .map_err(|source| TerminateError::Signal { pid, source })
}

#[cfg(unix)]
async fn force_kill(pid: u32) {
    let _ = send_signal(pid, ProcessSignal::SigKill);
}

#[cfg(not(unix))]
async fn force_kill(pid: u32) {
    let _ = tree_kill(pid).await;
}

/// Sends `signal` to the process group led by `pid` and to `pid` itself.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: ProcessSignal) -> std::io::Result<()> {
    if pid <= 1 || pid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }
    let sig = match signal {
        ProcessSignal::SigInt => libc::SIGINT,
        ProcessSignal::SigTerm => libc::SIGTERM,
        ProcessSignal::SigHup => libc::SIGHUP,
        ProcessSignal::SigKill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;
    let group = unsafe { libc::kill(-pid, sig) };
    let direct = unsafe { libc::kill(pid, sig) };
    if group == 0 || direct == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
async fn tree_kill(pid: u32) -> std::io::Result<()> {
    let status = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::launcher::launch;
    use crate::process::SpawnOptions;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn graceful_signal_stops_child() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let launched = launch(&SpawnOptions::shell("sleeper", "sleep 30"), &tx, |_| {});
        let handle = launched.handle.unwrap();
        let terminator = Terminator::new(Duration::from_secs(5));
        let result = terminator
            .terminate(
                TerminateTarget {
                    pid: handle.pid(),
                    handle: Some(&handle),
                },
                ProcessSignal::SigTerm,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(result, Termination::Exited(_)));
    }

    #[tokio::test]
    async fn escalates_when_signal_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let launched = launch(
            &SpawnOptions::shell("stubborn", "trap '' TERM; sleep 30"),
            &tx,
            |_| {},
        );
        let handle = launched.handle.unwrap();
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let hook_ran = Arc::new(AtomicBool::new(false));
        let flag = hook_ran.clone();
        let terminator = Terminator::new(Duration::from_millis(300));
        let result = terminator
            .terminate(
                TerminateTarget {
                    pid: handle.pid(),
                    handle: Some(&handle),
                },
                ProcessSignal::SigTerm,
                Some(Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("cleanup failed"))
                })),
            )
            .await
            .unwrap();
        match result {
            Termination::ForceKilled(outcome) => assert_eq!(outcome.signal, Some(libc::SIGKILL)),
            other => panic!("expected force kill, got {:?}", other),
        }
        assert!(hook_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dead_pid_counts_as_terminated() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let result = Terminator::default()
            .terminate(TerminateTarget { pid, handle: None }, ProcessSignal::SigTerm, None)
            .await
            .unwrap();
        assert_eq!(result, Termination::AlreadyExited);
    }

    #[tokio::test]
    async fn pid_only_target_is_signalled() {
        let mut child = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        assert!(is_alive(pid));
        let result = Terminator::new(Duration::from_secs(2))
            .terminate(TerminateTarget { pid, handle: None }, ProcessSignal::SigTerm, None)
            .await
            .unwrap();
        assert_eq!(result, Termination::Signalled);
        reaper.await.unwrap().unwrap();
        assert!(!is_alive(pid));
    }

    #[test]
    fn refuses_to_signal_init() {
        assert!(send_signal(1, ProcessSignal::SigTerm).is_err());
        assert!(send_signal(0, ProcessSignal::SigTerm).is_err());
    }
}
