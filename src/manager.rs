//! The process manager.
//!
//! `ProcessManager` is the single authority over process records, live child
//! handles, output buffers, and subscribers. Clones share the same state.
//! Launched children report back through one event channel drained by a
//! background pump; operations on the same id are serialized by a per-id
//! lock while different ids proceed in parallel.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::error::ManagerError;
use crate::events::{ExitOutcome, LaunchEvent, ProcessSignal};
use crate::launcher::{launch, ChildHandle};
use crate::logger::LogWriter;
use crate::output::{ChunkBuffer, OutputChunk, DEFAULT_CHUNK_CAPACITY};
use crate::process::{ProcessRecord, ProcessStatus, SpawnOptions};
use crate::state::StateStore;
use crate::terminate::{is_alive, StopHook, TerminateTarget, Terminator, DEFAULT_ESCALATION};

/// Tunables for a `ProcessManager`.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Location of the persisted state file.
    pub state_file: PathBuf,
    /// Output chunks retained per id.
    pub buffer_capacity: usize,
    /// Grace period before a stop escalates to a force kill.
    pub kill_timeout: Duration,
    /// Pause between the stop and the spawn of a restart.
    pub restart_settle: Duration,
}

impl ManagerSettings {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            buffer_capacity: DEFAULT_CHUNK_CAPACITY,
            kill_timeout: DEFAULT_ESCALATION,
            restart_settle: Duration::from_secs(1),
        }
    }
}

/// Shared handle to the process registry.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: ManagerSettings,
    terminator: Terminator,
    registry: Mutex<Registry>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events_tx: mpsc::UnboundedSender<LaunchEvent>,
    store: StateStore,
    next_subscriber: AtomicU64,
}

#[derive(Default)]
struct Registry {
    records: BTreeMap<String, ProcessRecord>,
    options: HashMap<String, SpawnOptions>,
    handles: HashMap<String, ChildHandle>,
    buffers: HashMap<String, ChunkBuffer>,
    loggers: HashMap<String, LogWriter>,
    output_subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<OutputChunk>)>>,
    status_subscribers: Vec<mpsc::UnboundedSender<ProcessRecord>>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `record`, notifies status watchers on a transition, and queues
    /// a state snapshot.
    fn commit(&self, reg: &mut Registry, record: ProcessRecord) {
        let transition = reg
            .records
            .get(&record.id)
            .map_or(true, |previous| previous.status != record.status);
        if transition {
            reg.status_subscribers
                .retain(|tx| tx.send(record.clone()).is_ok());
        }
        reg.records.insert(record.id.clone(), record);
        self.store.persist(reg.records.values().cloned().collect());
    }
}

impl ProcessManager {
    /// Opens the manager, reconciling persisted records with the OS.
    ///
    /// A record persisted as live whose PID still exists is adopted as a
    /// detached `Running` record; a dead one is corrected to `Stopped` with an
    /// explanatory error. Must be called inside a tokio runtime.
    pub async fn open(settings: ManagerSettings) -> Self {
        let store = StateStore::open(&settings.state_file);
        let mut registry = Registry::default();
        for mut record in store.load().await {
            reconcile_loaded(&mut record);
            registry.records.insert(record.id.clone(), record);
        }
        store.persist(registry.records.values().cloned().collect());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            terminator: Terminator::new(settings.kill_timeout),
            settings,
            registry: Mutex::new(registry),
            op_locks: Mutex::new(HashMap::new()),
            events_tx,
            store,
            next_subscriber: AtomicU64::new(0),
        });
        tokio::spawn(run_pump(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    pub fn state_file(&self) -> &Path {
        self.inner.store.path()
    }

    /// Pause inserted between the stop and spawn halves of a restart.
    pub fn restart_settle(&self) -> Duration {
        self.inner.settings.restart_settle
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .op_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Spawns a process for `options.id`.
    ///
    /// Fails with `AlreadyRunning` if a live process already exists for the
    /// id. Spawn-time OS errors are not errors here: they come back as a
    /// `Failed` record with `last_error` set.
    pub async fn spawn(&self, options: SpawnOptions) -> Result<ProcessRecord, ManagerError> {
        let lock = self.op_lock(&options.id);
        let _guard = lock.lock().await;

        let previous_logger = {
            let mut reg = self.inner.registry();
            if let Some(existing) = reg.records.get(&options.id) {
                if existing.status.is_live() {
                    return Err(ManagerError::AlreadyRunning(options.id.clone()));
                }
            }
            reg.loggers.remove(&options.id)
        };
        if let Some(logger) = previous_logger {
            logger.close().await;
        }

        let logger = options
            .log_file
            .as_ref()
            .map(|path| LogWriter::open(path, Some(options.id.clone())));

        let inner = &*self.inner;
        let mut reg = inner.registry();
        reg.buffers
            .entry(options.id.clone())
            .or_insert_with(|| ChunkBuffer::new(inner.settings.buffer_capacity));
        if let Some(logger) = logger {
            debug!(id = %options.id, path = %logger.path().display(), "logging to file");
            reg.loggers.insert(options.id.clone(), logger);
        }
        // Launch under the registry lock so the pump never sees an event for
        // a run whose record has not been stored yet.
        let launched = launch(&options, &inner.events_tx, |record| {
            inner.commit(&mut reg, record.clone())
        });
        if let Some(handle) = launched.handle {
            reg.handles.insert(options.id.clone(), handle);
        }
        reg.options.insert(options.id.clone(), options);
        Ok(launched.record)
    }

    /// Stops the process for `id`, escalating to a force kill if it ignores
    /// `signal`. The record always ends `Stopped` on success.
    pub async fn stop(
        &self,
        id: &str,
        signal: ProcessSignal,
    ) -> Result<ProcessRecord, ManagerError> {
        let lock = self.op_lock(id);
        let _guard = lock.lock().await;

        let (pid, handle) = {
            let mut reg = self.inner.registry();
            let record = reg
                .records
                .get(id)
                .cloned()
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            let (ProcessStatus::Running, Some(pid)) = (record.status, record.pid) else {
                return Err(ManagerError::NotRunning(id.to_string()));
            };
            let mut stopping = record;
            stopping.status = ProcessStatus::Stopping;
            self.inner.commit(&mut reg, stopping);
            (pid, reg.handles.get(id).cloned())
        };

        info!(id, pid, signal = signal.label(), "stopping process");
        // The logger is released only once the process is confirmed gone.
        let inner = self.inner.clone();
        let log_id = id.to_string();
        let hook: StopHook<'static> = Box::pin(async move {
            let logger = inner.registry().loggers.remove(&log_id);
            if let Some(logger) = logger {
                logger.close().await;
            }
            Ok(())
        });
        let result = self
            .inner
            .terminator
            .terminate(
                TerminateTarget {
                    pid,
                    handle: handle.as_ref(),
                },
                signal,
                Some(hook),
            )
            .await;

        let mut reg = self.inner.registry();
        let Some(mut record) = reg.records.get(id).cloned() else {
            return Err(ManagerError::NotFound(id.to_string()));
        };
        match result {
            Ok(termination) => {
                reg.handles.remove(id);
                // The pump may already have recorded the exit.
                if record.status == ProcessStatus::Stopping {
                    let code = termination.outcome().and_then(|outcome| outcome.code);
                    record.finish(ProcessStatus::Stopped, code, None);
                    self.inner.commit(&mut reg, record.clone());
                }
                Ok(record)
            }
            Err(source) => {
                warn!(id, pid, "stop failed: {}", source);
                if record.status == ProcessStatus::Stopping {
                    record.status = ProcessStatus::Running;
                    record.last_error = Some(source.to_string());
                    self.inner.commit(&mut reg, record);
                }
                Err(ManagerError::Terminate {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Stops `id` if running, waits the settle delay, and spawns it again
    /// with the options it last ran with.
    pub async fn restart(&self, id: &str) -> Result<ProcessRecord, ManagerError> {
        let (status, options) = {
            let reg = self.inner.registry();
            let record = reg
                .records
                .get(id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            let options = reg
                .options
                .get(id)
                .cloned()
                .unwrap_or_else(|| SpawnOptions::from_record(record));
            (record.status, options)
        };
        if status == ProcessStatus::Running {
            self.stop(id, ProcessSignal::SigTerm).await?;
        }
        tokio::time::sleep(self.inner.settings.restart_settle).await;
        self.spawn(options).await
    }

    /// Current buffered output for `id`, oldest first.
    pub fn get_logs(&self, id: &str) -> Vec<OutputChunk> {
        self.inner
            .registry()
            .buffers
            .get(id)
            .map(ChunkBuffer::snapshot)
            .unwrap_or_default()
    }

    /// Receives every chunk `id` produces from now on.
    pub fn subscribe(&self, id: &str) -> Subscription {
        let key = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .registry()
            .output_subscribers
            .entry(id.to_string())
            .or_default()
            .push((key, tx));
        Subscription {
            id: id.to_string(),
            key,
            rx,
            manager: Arc::downgrade(&self.inner),
        }
    }

    /// Receives a record snapshot for every status transition of any id.
    pub fn watch_status(&self) -> mpsc::UnboundedReceiver<ProcessRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.registry().status_subscribers.push(tx);
        rx
    }

    pub fn get_record(&self, id: &str) -> Option<ProcessRecord> {
        self.inner.registry().records.get(id).cloned()
    }

    pub fn get_status(&self, id: &str) -> Option<ProcessStatus> {
        self.inner.registry().records.get(id).map(|r| r.status)
    }

    pub fn get_pid(&self, id: &str) -> Option<u32> {
        self.inner.registry().records.get(id).and_then(|r| r.pid)
    }

    pub fn get_all_processes(&self) -> Vec<ProcessRecord> {
        self.inner.registry().records.values().cloned().collect()
    }

    /// PIDs of every record currently `Running`.
    pub fn running_pids(&self) -> Vec<(String, u32)> {
        self.inner
            .registry()
            .records
            .values()
            .filter(|r| r.status == ProcessStatus::Running)
            .filter_map(|r| r.pid.map(|pid| (r.id.clone(), pid)))
            .collect()
    }

    /// Checks `id` against the OS. A `Running` record without a live handle
    /// whose PID has vanished is corrected to `Stopped`.
    pub fn is_running(&self, id: &str) -> bool {
        let mut reg = self.inner.registry();
        let Some(record) = reg.records.get(id) else {
            return false;
        };
        let (ProcessStatus::Running, Some(pid)) = (record.status, record.pid) else {
            return false;
        };
        if let Some(handle) = reg.handles.get(id) {
            // Owned children are finalized by the pump once reaped.
            return handle.exited().is_none();
        }
        if is_alive(pid) {
            return true;
        }
        let mut record = record.clone();
        warn!(id, pid, "process vanished, marking stopped");
        record.finish(
            ProcessStatus::Stopped,
            None,
            Some(format!("process {} is no longer running", pid)),
        );
        self.inner.commit(&mut reg, record);
        false
    }

    /// Stops every running process in parallel and waits for all of them.
    pub async fn stop_all(
        &self,
        signal: ProcessSignal,
    ) -> Vec<(String, Result<ProcessRecord, ManagerError>)> {
        let ids: Vec<String> = self
            .running_pids()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let mut tasks = JoinSet::new();
        for id in ids {
            let manager = self.clone();
            tasks.spawn(async move {
                let result = manager.stop(&id, signal).await;
                (id, result)
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    if let Err(err) = &result {
                        warn!(id = %id, "stop failed during stop_all: {}", err);
                    }
                    results.push((id, result));
                }
                Err(err) => warn!("stop task panicked: {}", err),
            }
        }
        results
    }

    /// Stops everything, closes log files, forgets all records, and waits for
    /// the emptied state to reach disk.
    pub async fn cleanup(&self) {
        self.stop_all(ProcessSignal::SigTerm).await;
        let loggers: Vec<LogWriter> = {
            let mut reg = self.inner.registry();
            let loggers = reg.loggers.drain().map(|(_, logger)| logger).collect();
            reg.records.clear();
            reg.options.clear();
            reg.handles.clear();
            reg.buffers.clear();
            reg.output_subscribers.clear();
            self.inner.store.persist(Vec::new());
            loggers
        };
        for logger in loggers {
            logger.close().await;
        }
        self.flush_state().await;
        info!("process manager cleaned up");
    }

    /// Resolves once every state change so far has been written.
    pub async fn flush_state(&self) {
        self.inner.store.flush().await;
    }
}

fn reconcile_loaded(record: &mut ProcessRecord) {
    if !record.status.is_live() {
        record.pid = None;
        return;
    }
    match record.pid {
        Some(pid) if is_alive(pid) => {
            info!(id = %record.id, pid, "adopting process from a previous run");
            record.status = ProcessStatus::Running;
            record.detached = true;
        }
        Some(pid) => record.finish(
            ProcessStatus::Stopped,
            None,
            Some(format!(
                "process {} was not running when state was loaded",
                pid
            )),
        ),
        None => record.finish(
            ProcessStatus::Stopped,
            None,
            Some("no pid was recorded for a live process".to_string()),
        ),
    }
}

async fn run_pump(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<LaunchEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            LaunchEvent::Output { pid, chunk } => {
                trace!(id = %chunk.id, pid, bytes = chunk.text.len(), "output");
                on_output(&inner, pid, chunk);
            }
            LaunchEvent::Exited {
                id,
                pid,
                outcome,
                error,
            } => on_exit(&inner, id, pid, outcome, error),
        }
    }
    debug!("process event pump stopped");
}

fn on_output(inner: &Inner, pid: u32, chunk: OutputChunk) {
    let mut reg = inner.registry();
    // Late output of an earlier run must not mix into the current one.
    let current = reg.records.get(&chunk.id).and_then(|record| record.pid);
    if current.is_some_and(|current| current != pid) {
        debug!(id = %chunk.id, pid, "dropping output of a previous run");
        return;
    }
    if let Some(logger) = reg.loggers.get(&chunk.id) {
        logger.write(&chunk);
    }
    if let Some(subscribers) = reg.output_subscribers.get_mut(&chunk.id) {
        subscribers.retain(|(_, tx)| tx.send(chunk.clone()).is_ok());
    }
    let capacity = inner.settings.buffer_capacity;
    reg.buffers
        .entry(chunk.id.clone())
        .or_insert_with(|| ChunkBuffer::new(capacity))
        .push(chunk);
}

fn on_exit(
    inner: &Inner,
    id: String,
    pid: u32,
    outcome: Option<ExitOutcome>,
    error: Option<String>,
) {
    let mut reg = inner.registry();
    let Some(mut record) = reg.records.get(&id).cloned() else {
        return;
    };
    if record.pid != Some(pid) || !record.status.is_live() {
        debug!(id = %id, pid, "ignoring exit of a finished run");
        return;
    }
    reg.handles.remove(&id);

    let code = outcome.and_then(|outcome| outcome.code);
    let clean = outcome.map_or(false, |outcome| outcome.success());
    if record.status == ProcessStatus::Stopping || clean {
        record.finish(ProcessStatus::Stopped, code, None);
    } else {
        let reason = error.unwrap_or_else(|| "process exited unexpectedly".to_string());
        warn!(id = %id, pid, "process failed: {}", reason);
        record.finish(ProcessStatus::Failed, code, Some(reason));
    }
    if let Some(logger) = reg.loggers.remove(&id) {
        tokio::spawn(logger.close());
    }
    inner.commit(&mut reg, record);
}

/// A live feed of one id's output. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    key: u64,
    rx: mpsc::UnboundedReceiver<OutputChunk>,
    manager: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let mut reg = inner.registry();
        if let Some(subscribers) = reg.output_subscribers.get_mut(&self.id) {
            subscribers.retain(|(key, _)| *key != self.key);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::output::StreamKind;
    use crate::state::STATE_FILE_NAME;

    async fn manager(dir: &Path) -> ProcessManager {
        ProcessManager::open(ManagerSettings {
            kill_timeout: Duration::from_secs(2),
            restart_settle: Duration::from_millis(20),
            ..ManagerSettings::new(dir.join(STATE_FILE_NAME))
        })
        .await
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<ProcessRecord>) -> ProcessRecord {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for a status change")
            .expect("status feed closed")
    }

    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<ProcessRecord>,
        id: &str,
        status: ProcessStatus,
    ) -> ProcessRecord {
        loop {
            let record = next_status(rx).await;
            if record.id == id && record.status == status {
                return record;
            }
        }
    }

    #[tokio::test]
    async fn second_spawn_of_a_live_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let first = manager
            .spawn(SpawnOptions::shell("api", "sleep 30"))
            .await
            .unwrap();
        assert_eq!(first.status, ProcessStatus::Running);

        let err = manager
            .spawn(SpawnOptions::shell("api", "sleep 30"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning(_)));
        assert_eq!(manager.running_pids(), vec![("api".to_string(), first.pid.unwrap())]);

        manager.stop("api", ProcessSignal::SigTerm).await.unwrap();
    }

    #[tokio::test]
    async fn restart_replaces_pid_with_one_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let mut feed = manager.watch_status();
        let before = manager
            .spawn(SpawnOptions::shell("web", "sleep 30"))
            .await
            .unwrap()
            .pid
            .unwrap();

        let after = manager.restart("web").await.unwrap();
        assert_eq!(after.status, ProcessStatus::Running);
        assert_ne!(after.pid, Some(before));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut statuses = Vec::new();
        while let Ok(record) = feed.try_recv() {
            statuses.push(record.status);
        }
        assert_eq!(
            statuses,
            vec![
                ProcessStatus::Starting,
                ProcessStatus::Running,
                ProcessStatus::Stopping,
                ProcessStatus::Stopped,
                ProcessStatus::Starting,
                ProcessStatus::Running,
            ]
        );
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn subscriber_sees_output_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let mut subscription = manager.subscribe("echo");
        manager
            .spawn(SpawnOptions::shell("echo", "printf 'line1\\n'; printf 'line2\\n'"))
            .await
            .unwrap();

        let mut text = String::new();
        while !text.contains("line2") {
            let chunk = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
                .await
                .unwrap()
                .unwrap();
            text.push_str(&chunk.text);
        }
        assert_eq!(text, "line1\nline2\n");
    }

    #[tokio::test]
    async fn log_buffer_keeps_most_recent_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        manager
            .spawn(SpawnOptions::shell(
                "flood",
                "i=0; while [ $i -lt 5000 ]; do echo $i; i=$((i+1)); done",
            ))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let logs = manager.get_logs("flood");
            if logs.last().map(|c| c.text.as_str()) == Some("4999\n") {
                assert_eq!(logs.len(), DEFAULT_CHUNK_CAPACITY);
                assert_eq!(logs[0].text, "3000\n");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "output never finished");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn failing_exit_is_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let mut feed = manager.watch_status();
        manager
            .spawn(SpawnOptions::shell("bad", "exit 2"))
            .await
            .unwrap();
        let record = wait_for(&mut feed, "bad", ProcessStatus::Failed).await;
        assert_eq!(record.exit_code, Some(2));
        assert_eq!(record.last_error.as_deref(), Some("exited with code 2"));
        assert_eq!(record.pid, None);
    }

    #[tokio::test]
    async fn dead_pid_is_corrected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let mut record = ProcessRecord::starting(&SpawnOptions::shell("ghost", "sleep 30"));
        record.status = ProcessStatus::Running;
        record.pid = Some(pid);
        std::fs::write(
            dir.path().join(STATE_FILE_NAME),
            serde_json::to_string(&vec![record]).unwrap(),
        )
        .unwrap();

        let manager = manager(dir.path()).await;
        let loaded = manager.get_record("ghost").unwrap();
        assert_eq!(loaded.status, ProcessStatus::Stopped);
        assert_eq!(loaded.pid, None);
        assert!(loaded.last_error.unwrap().contains("was not running"));
    }

    #[tokio::test]
    async fn adopted_process_is_lazily_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut record = ProcessRecord::starting(&SpawnOptions::shell("left", "sleep 30"));
        record.status = ProcessStatus::Running;
        record.pid = Some(child.id());
        std::fs::write(
            dir.path().join(STATE_FILE_NAME),
            serde_json::to_string(&vec![record]).unwrap(),
        )
        .unwrap();

        let manager = manager(dir.path()).await;
        let adopted = manager.get_record("left").unwrap();
        assert!(adopted.detached);
        assert!(manager.is_running("left"));

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!manager.is_running("left"));
        assert_eq!(manager.get_status("left"), Some(ProcessStatus::Stopped));
    }

    #[tokio::test]
    async fn stop_escalates_and_still_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProcessManager::open(ManagerSettings {
            kill_timeout: Duration::from_millis(300),
            ..ManagerSettings::new(dir.path().join(STATE_FILE_NAME))
        })
        .await;
        manager
            .spawn(SpawnOptions::shell("stubborn", "trap '' TERM; sleep 30"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let record = manager
            .stop("stubborn", ProcessSignal::SigTerm)
            .await
            .unwrap();
        assert_eq!(record.status, ProcessStatus::Stopped);
        assert_eq!(manager.get_pid("stubborn"), None);
    }

    #[tokio::test]
    async fn usage_errors_for_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        assert!(matches!(
            manager.stop("nope", ProcessSignal::SigTerm).await,
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(
            manager.restart("nope").await,
            Err(ManagerError::NotFound(_))
        ));

        let mut feed = manager.watch_status();
        manager
            .spawn(SpawnOptions::shell("quick", "true"))
            .await
            .unwrap();
        wait_for(&mut feed, "quick", ProcessStatus::Stopped).await;
        assert!(matches!(
            manager.stop("quick", ProcessSignal::SigTerm).await,
            Err(ManagerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn output_is_written_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let log_file = dir.path().join("logs").join("api.log");
        manager
            .spawn(SpawnOptions {
                log_file: Some(log_file.clone()),
                ..SpawnOptions::shell("api", "echo hello; echo oops >&2")
            })
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let contents = std::fs::read_to_string(&log_file).unwrap_or_default();
            if contents.lines().count() == 2 {
                assert!(contents.contains("[api] hello"));
                assert!(contents.contains("[api] [ERROR] oops"));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "log file incomplete");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn chunk(id: &str, text: &str) -> OutputChunk {
        OutputChunk {
            id: id.into(),
            text: text.into(),
            stream: StreamKind::Stdout,
        }
    }

    #[tokio::test]
    async fn detached_process_output_is_not_captured() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let mut subscription = manager.subscribe("bg");
        let record = manager
            .spawn(SpawnOptions {
                detached: true,
                ..SpawnOptions::shell("bg", "echo hi; echo oops >&2; sleep 30")
            })
            .await
            .unwrap();
        assert!(record.detached);
        assert_eq!(record.status, ProcessStatus::Running);
        let pid = record.pid.unwrap();
        // Leads its own session.
        assert_eq!(unsafe { libc::getsid(pid as libc::pid_t) }, pid as libc::pid_t);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.get_logs("bg").is_empty());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), subscription.recv())
                .await
                .is_err()
        );
        assert_eq!(manager.get_record("bg").map(|r| r.detached), Some(true));

        let stopped = manager.stop("bg", ProcessSignal::SigTerm).await.unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(manager.get_logs("bg").is_empty());
    }

    #[tokio::test]
    async fn output_from_a_previous_run_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        manager
            .spawn(SpawnOptions::shell("api", "sleep 30"))
            .await
            .unwrap();
        let pid = manager.get_pid("api").unwrap();
        let mut subscription = manager.subscribe("api");

        let events = &manager.inner.events_tx;
        events
            .send(LaunchEvent::Output {
                pid: pid + 1,
                chunk: chunk("api", "stale\n"),
            })
            .unwrap();
        events
            .send(LaunchEvent::Output {
                pid,
                chunk: chunk("api", "fresh\n"),
            })
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(10), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.text, "fresh\n");
        let logs: Vec<String> = manager.get_logs("api").into_iter().map(|c| c.text).collect();
        assert_eq!(logs, vec!["fresh\n"]);
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn failed_stop_keeps_writing_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        let log_file = dir.path().join("api.log");
        manager
            .spawn(SpawnOptions {
                log_file: Some(log_file.clone()),
                ..SpawnOptions::shell("api", "sleep 30")
            })
            .await
            .unwrap();
        let real_pid = manager.get_pid("api").unwrap();

        // Pid 1 is alive but never signalled, and without the handle the stop
        // has nothing to fall back on.
        let handle = {
            let mut reg = manager.inner.registry();
            let mut record = reg.records.get("api").cloned().unwrap();
            record.pid = Some(1);
            manager.inner.commit(&mut reg, record);
            reg.handles.remove("api")
        };
        assert!(matches!(
            manager.stop("api", ProcessSignal::SigTerm).await,
            Err(ManagerError::Terminate { .. })
        ));
        assert_eq!(manager.get_status("api"), Some(ProcessStatus::Running));
        assert!(manager.inner.registry().loggers.contains_key("api"));

        manager
            .inner
            .events_tx
            .send(LaunchEvent::Output {
                pid: 1,
                chunk: chunk("api", "still here\n"),
            })
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while manager.get_logs("api").is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "output never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        {
            let mut reg = manager.inner.registry();
            let mut record = reg.records.get("api").cloned().unwrap();
            record.pid = Some(real_pid);
            manager.inner.commit(&mut reg, record);
            if let Some(handle) = handle {
                reg.handles.insert("api".to_string(), handle);
            }
        }
        let stopped = manager.stop("api", ProcessSignal::SigTerm).await.unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(!manager.inner.registry().loggers.contains_key("api"));
        let contents = std::fs::read_to_string(&log_file).unwrap();
        assert!(contents.contains("[api] still here"));
    }

    #[tokio::test]
    async fn state_file_mirrors_records() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path()).await;
        manager
            .spawn(SpawnOptions::shell("api", "sleep 30"))
            .await
            .unwrap();
        manager.flush_state().await;

        let reopened = StateStore::open(manager.state_file());
        let records = reopened.load().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ProcessStatus::Running);

        manager.cleanup().await;
        assert!(reopened.load().await.is_empty());
        assert!(manager.get_all_processes().is_empty());
    }
}
