//! Resource monitoring.
//!
//! Polls CPU and memory for the PIDs a caller supplies on every tick (the set
//! changes as modules start and stop) and publishes snapshots on a watch
//! channel. Usage of a tracked PID includes its whole process tree. sysinfo
//! scans the OS process table synchronously, so every sample runs on the
//! blocking pool.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Polls without a change after which a snapshot is re-sent anyway.
pub const DEFAULT_HEARTBEAT_POLLS: u32 = 5;

/// Supplies the `(module, pid)` pairs to sample.
pub type PidSource = Arc<dyn Fn() -> Vec<(String, u32)> + Send + Sync>;

/// Usage of one tracked process tree.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessUsage {
    /// Percent of one core; may exceed 100 on multi-core machines.
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    /// Processes in the tree, root included. Zero if the PID is gone.
    pub processes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemUsage {
    pub cpu_percent: f32,
    pub memory_used: u64,
    pub memory_total: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub system: SystemUsage,
    pub modules: BTreeMap<String, ProcessUsage>,
}

/// Limits above which a module is flagged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_percent: Option<f32>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceAlert {
    Cpu {
        module: String,
        percent: f32,
        limit: f32,
    },
    Memory {
        module: String,
        bytes: u64,
        limit: u64,
    },
}

impl ResourceAlert {
    pub fn module(&self) -> &str {
        match self {
            ResourceAlert::Cpu { module, .. } | ResourceAlert::Memory { module, .. } => module,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ResourceAlert::Cpu { percent, limit, .. } => {
                format!("cpu {:.1}% above {:.1}%", percent, limit)
            }
            ResourceAlert::Memory { bytes, limit, .. } => format!(
                "memory {} MiB above {} MiB",
                bytes / (1024 * 1024),
                limit / (1024 * 1024)
            ),
        }
    }
}

impl ResourceThresholds {
    pub fn is_empty(&self) -> bool {
        self.cpu_percent.is_none() && self.memory_bytes.is_none()
    }

    pub fn check(&self, snapshot: &ResourceSnapshot) -> Vec<ResourceAlert> {
        let mut alerts = Vec::new();
        for (module, usage) in &snapshot.modules {
            if let Some(limit) = self.cpu_percent {
                if usage.cpu_percent > limit {
                    alerts.push(ResourceAlert::Cpu {
                        module: module.clone(),
                        percent: usage.cpu_percent,
                        limit,
                    });
                }
            }
            if let Some(limit) = self.memory_bytes {
                if usage.memory_bytes > limit {
                    alerts.push(ResourceAlert::Memory {
                        module: module.clone(),
                        bytes: usage.memory_bytes,
                        limit,
                    });
                }
            }
        }
        alerts
    }
}

/// Background poller. Dropping it stops polling.
pub struct ResourceMonitor {
    rx: watch::Receiver<ResourceSnapshot>,
    task: JoinHandle<()>,
}

impl ResourceMonitor {
    pub fn spawn(interval: Duration, heartbeat_polls: u32, pids: PidSource) -> Self {
        let (tx, rx) = watch::channel(ResourceSnapshot::default());
        let task = tokio::spawn(poll_loop(interval, heartbeat_polls, pids, tx));
        Self { rx, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.rx.clone()
    }

    pub fn latest(&self) -> ResourceSnapshot {
        self.rx.borrow().clone()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop(
    interval: Duration,
    heartbeat_polls: u32,
    pids: PidSource,
    tx: watch::Sender<ResourceSnapshot>,
) {
    let mut sampler = Sampler::new();
    let mut cadence = Cadence::new(heartbeat_polls);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let targets = pids();
        let snapshot = sampler.sample(targets).await;
        let changed = *tx.borrow() != snapshot;
        if cadence.should_emit(changed) {
            debug!(modules = snapshot.modules.len(), "resource snapshot");
            tx.send_replace(snapshot);
        }
    }
}

/// Emits on change, and at least every `heartbeat` polls.
#[derive(Debug)]
struct Cadence {
    heartbeat: u32,
    quiet_polls: u32,
}

impl Cadence {
    fn new(heartbeat: u32) -> Self {
        Self {
            heartbeat: heartbeat.max(1),
            quiet_polls: 0,
        }
    }

    fn should_emit(&mut self, changed: bool) -> bool {
        self.quiet_polls += 1;
        if changed || self.quiet_polls >= self.heartbeat {
            self.quiet_polls = 0;
            true
        } else {
            false
        }
    }
}

/// Owns the sysinfo state between polls; CPU usage is computed from the
/// difference between consecutive refreshes.
pub struct Sampler {
    system: Option<System>,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    pub fn new() -> Self {
        Self { system: None }
    }

    /// Samples `targets` on the blocking pool. Failures yield zeroed figures.
    pub async fn sample(&mut self, targets: Vec<(String, u32)>) -> ResourceSnapshot {
        let system = self.system.take().unwrap_or_else(System::new);
        let fallback = targets.clone();
        match tokio::task::spawn_blocking(move || {
            let mut system = system;
            let snapshot = sample_blocking(&mut system, &targets);
            (system, snapshot)
        })
        .await
        {
            Ok((system, snapshot)) => {
                self.system = Some(system);
                snapshot
            }
            Err(err) => {
                warn!("resource sampling failed: {}", err);
                ResourceSnapshot {
                    system: SystemUsage::default(),
                    modules: fallback
                        .into_iter()
                        .map(|(module, _)| (module, ProcessUsage::default()))
                        .collect(),
                }
            }
        }
    }
}

fn sample_blocking(system: &mut System, targets: &[(String, u32)]) -> ResourceSnapshot {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_processes();

    let rows: Vec<ProcessRow> = system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessRow {
            pid: pid.as_u32(),
            parent: process.parent().map(|parent| parent.as_u32()),
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
        .collect();
    let table = ProcessTable::new(&rows);

    ResourceSnapshot {
        system: SystemUsage {
            cpu_percent: round_cpu(system.global_cpu_info().cpu_usage()),
            memory_used: system.used_memory(),
            memory_total: system.total_memory(),
        },
        modules: targets
            .iter()
            .map(|(module, pid)| (module.clone(), table.tree_usage(*pid)))
            .collect(),
    }
}

fn round_cpu(value: f32) -> f32 {
    if value.is_finite() {
        (value * 10.0).round() / 10.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy)]
struct ProcessRow {
    pid: u32,
    parent: Option<u32>,
    cpu_percent: f32,
    memory_bytes: u64,
}

struct ProcessTable<'a> {
    by_pid: HashMap<u32, &'a ProcessRow>,
    children: HashMap<u32, Vec<u32>>,
}

impl<'a> ProcessTable<'a> {
    fn new(rows: &'a [ProcessRow]) -> Self {
        let mut by_pid = HashMap::with_capacity(rows.len());
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for row in rows {
            by_pid.insert(row.pid, row);
            if let Some(parent) = row.parent {
                if parent != row.pid {
                    children.entry(parent).or_default().push(row.pid);
                }
            }
        }
        Self { by_pid, children }
    }

    /// Sums usage over `root` and all its descendants.
    fn tree_usage(&self, root: u32) -> ProcessUsage {
        let mut usage = ProcessUsage::default();
        if !self.by_pid.contains_key(&root) {
            return usage;
        }
        let mut stack = vec![root];
        let mut seen = std::collections::HashSet::new();
        while let Some(pid) = stack.pop() {
            if !seen.insert(pid) {
                continue;
            }
            if let Some(row) = self.by_pid.get(&pid) {
                usage.cpu_percent += row.cpu_percent;
                usage.memory_bytes += row.memory_bytes;
                usage.processes += 1;
            }
            if let Some(children) = self.children.get(&pid) {
                stack.extend(children.iter().copied());
            }
        }
        usage.cpu_percent = round_cpu(usage.cpu_percent);
        usage
    }
}
