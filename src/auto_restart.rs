//! Automatic restart of failed modules.
//!
//! Each module that fails gets a small state machine: failures schedule a
//! restart after an exponentially growing delay until the retry cap is
//! reached, and a module that then stays up for the stability window is
//! forgiven and starts over from zero.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry limits and timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Automatic attempts before giving up.
    pub max_retries: u32,
    /// Delay before the first attempt; doubles for each further one.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Continuous uptime after which the failure count resets.
    pub stability_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            stability_window: Duration::from_secs(15),
        }
    }
}

impl RestartPolicy {
    /// Backoff before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }
}

/// Sent right before a restart is scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    pub module: String,
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
}

/// What `register_failure` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Scheduled { attempt: u32, delay: Duration },
    /// A restart is already pending; nothing new was scheduled.
    Pending,
    /// The retry cap was reached.
    Exhausted { attempts: u32 },
}

/// Observable per-module state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartState {
    pub retry_count: u32,
    pub is_restarting: bool,
    pub next_retry_at: Option<Instant>,
}

#[derive(Default)]
struct Entry {
    retry_count: u32,
    is_restarting: bool,
    next_retry_at: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    stability: Option<JoinHandle<()>>,
}

impl Entry {
    fn cancel_stability(&mut self) {
        if let Some(handle) = self.stability.take() {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel_stability();
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct AutoRestartManager {
    policy: RestartPolicy,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl AutoRestartManager {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a failure of `module`. If the cap allows, `restart` runs once
    /// the backoff delay elapses and `notify` is called immediately.
    pub fn register_failure<F, Fut>(
        &self,
        module: &str,
        restart: F,
        notify: impl FnOnce(RetryNotice),
    ) -> FailureDecision
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (attempt, delay) = {
            let mut entries = self.entries();
            let entry = entries.entry(module.to_string()).or_default();
            entry.cancel_stability();
            if entry.is_restarting {
                debug!(module, "restart already pending");
                return FailureDecision::Pending;
            }
            if entry.retry_count >= self.policy.max_retries {
                warn!(
                    module,
                    attempts = entry.retry_count,
                    "giving up on automatic restarts"
                );
                return FailureDecision::Exhausted {
                    attempts: entry.retry_count,
                };
            }

            entry.retry_count += 1;
            let attempt = entry.retry_count;
            let delay = self.policy.delay_for(attempt);
            entry.is_restarting = true;
            entry.next_retry_at = Some(Instant::now() + delay);

            let this = self.clone();
            let name = module.to_string();
            entry.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                this.begin_attempt(&name);
                info!(module = %name, attempt, "restarting module");
                restart().await;
                this.finish_attempt(&name, attempt);
            }));
            (attempt, delay)
        };

        info!(
            module,
            attempt,
            max = self.policy.max_retries,
            "restart scheduled in {:?}",
            delay
        );
        notify(RetryNotice {
            module: module.to_string(),
            attempt,
            max_retries: self.policy.max_retries,
            delay,
        });
        FailureDecision::Scheduled { attempt, delay }
    }

    /// Marks the pending restart as started so a new failure may schedule
    /// the next one. The timer handle is kept until the restart action
    /// returns, so `forget` and `cleanup` still cancel an attempt in flight.
    fn begin_attempt(&self, module: &str) {
        if let Some(entry) = self.entries().get_mut(module) {
            entry.is_restarting = false;
            entry.next_retry_at = None;
        }
    }

    /// Releases the handle of a finished attempt, unless a later failure has
    /// already scheduled the next one.
    fn finish_attempt(&self, module: &str, attempt: u32) {
        if let Some(entry) = self.entries().get_mut(module) {
            if entry.retry_count == attempt && !entry.is_restarting {
                entry.timer = None;
            }
        }
    }

    /// `module` is running; if it stays up for the stability window its
    /// failure history is dropped.
    pub fn observe_running(&self, module: &str) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(module) else {
            return;
        };
        entry.cancel_stability();
        let this = self.clone();
        let name = module.to_string();
        let window = self.policy.stability_window;
        entry.stability = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let mut entries = this.entries();
            if entries.get(&name).map_or(false, |entry| !entry.is_restarting) {
                entries.remove(&name);
                info!(module = %name, "module stable, retry count reset");
            }
        }));
    }

    /// `module` stopped without failing; its uptime no longer counts.
    pub fn observe_stopped(&self, module: &str) {
        if let Some(entry) = self.entries().get_mut(module) {
            entry.cancel_stability();
        }
    }

    /// Drops all state for `module`, cancelling anything pending. Used when
    /// the user starts or stops it by hand.
    pub fn forget(&self, module: &str) {
        if let Some(mut entry) = self.entries().remove(module) {
            entry.cancel_all();
        }
    }

    /// Time left until the pending restart of `module`.
    pub fn remaining(&self, module: &str) -> Option<Duration> {
        let entries = self.entries();
        let at = entries.get(module)?.next_retry_at?;
        Some(at.saturating_duration_since(Instant::now()))
    }

    pub fn state(&self, module: &str) -> Option<RestartState> {
        self.entries().get(module).map(|entry| RestartState {
            retry_count: entry.retry_count,
            is_restarting: entry.is_restarting,
            next_retry_at: entry.next_retry_at,
        })
    }

    /// Cancels every pending restart and stability timer.
    pub fn cleanup(&self) {
        let mut entries = self.entries();
        for entry in entries.values_mut() {
            entry.cancel_all();
        }
        entries.clear();
    }
}
