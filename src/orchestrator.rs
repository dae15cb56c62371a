//! Module orchestration.
//!
//! The orchestrator pairs each configured module with its executor and starts
//! modules in dependency order: dependencies first, each module at most once
//! per call, with cycles rejected before anything is spawned.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::config::ModuleConfig;
use crate::error::{ManagerError, OrchestratorError};
use crate::events::ProcessSignal;
use crate::executor::Executor;
use crate::manager::ProcessManager;
use crate::process::{ProcessRecord, ProcessStatus};

/// A module's configuration paired with the executor chosen for its type.
#[derive(Debug, Clone)]
pub struct ModuleInstance {
    pub config: ModuleConfig,
    pub executor: Executor,
}

/// What happened to one module during a start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStartResult {
    pub module: String,
    pub outcome: StartOutcome,
}

#[derive(Default)]
struct Modules {
    order: Vec<String>,
    by_name: HashMap<String, ModuleInstance>,
}

#[derive(Clone)]
pub struct Orchestrator {
    manager: ProcessManager,
    modules: Arc<RwLock<Modules>>,
    log_dir: Option<PathBuf>,
}

impl Orchestrator {
    /// Module output is appended to `<log_dir>/<name>.log` when a log
    /// directory is given.
    pub fn new(manager: ProcessManager, log_dir: Option<PathBuf>) -> Self {
        Self {
            manager,
            modules: Arc::new(RwLock::new(Modules::default())),
            log_dir,
        }
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    /// Replaces the module set. Running processes are left alone.
    pub fn load(&self, configs: Vec<ModuleConfig>) {
        let mut modules = Modules::default();
        for config in configs {
            if modules.by_name.contains_key(&config.name) {
                warn!(module = %config.name, "duplicate module, keeping the last definition");
            } else {
                modules.order.push(config.name.clone());
            }
            let executor = Executor::for_module(&config);
            modules
                .by_name
                .insert(config.name.clone(), ModuleInstance { config, executor });
        }
        info!(modules = modules.order.len(), "modules loaded");
        *self.modules.write().unwrap_or_else(PoisonError::into_inner) = modules;
    }

    pub fn module_names(&self) -> Vec<String> {
        self.read(|modules| modules.order.clone())
    }

    pub fn get(&self, name: &str) -> Option<ModuleInstance> {
        self.read(|modules| modules.by_name.get(name).cloned())
    }

    fn read<T>(&self, f: impl FnOnce(&Modules) -> T) -> T {
        f(&self.modules.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn instance(&self, name: &str) -> Result<ModuleInstance, OrchestratorError> {
        self.get(name)
            .ok_or_else(|| OrchestratorError::ModuleNotFound(name.to_string()))
    }

    fn log_file(&self, name: &str) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", name)))
    }

    /// Starts `name` and, before it, everything it depends on.
    pub async fn start(&self, name: &str) -> Result<Vec<ModuleStartResult>, OrchestratorError> {
        let plan = self.read(|modules| start_order(&modules.by_name, &[name.to_string()]))?;
        Ok(self.run_plan(plan).await)
    }

    /// Starts every enabled module in one dependency-ordered pass.
    pub async fn start_all(&self) -> Result<Vec<ModuleStartResult>, OrchestratorError> {
        let plan = self.read(|modules| {
            let roots: Vec<String> = modules
                .order
                .iter()
                .filter(|name| {
                    modules
                        .by_name
                        .get(*name)
                        .map_or(false, |instance| instance.config.is_enabled())
                })
                .cloned()
                .collect();
            start_order(&modules.by_name, &roots)
        })?;
        Ok(self.run_plan(plan).await)
    }

    async fn run_plan(&self, plan: Vec<ModuleInstance>) -> Vec<ModuleStartResult> {
        let mut results = Vec::with_capacity(plan.len());
        for instance in plan {
            let name = instance.config.name.clone();
            let outcome = if self.manager.is_running(&name) {
                StartOutcome::AlreadyRunning
            } else {
                let started = instance
                    .executor
                    .start(&self.manager, &instance.config, self.log_file(&name))
                    .await;
                outcome_of(started)
            };
            match &outcome {
                StartOutcome::Started { pid } => info!(module = %name, pid, "module started"),
                StartOutcome::AlreadyRunning => info!(module = %name, "module already running"),
                StartOutcome::Failed { error } => warn!(module = %name, "module failed to start: {}", error),
            }
            results.push(ModuleStartResult {
                module: name,
                outcome,
            });
        }
        results
    }

    /// Stops one module. Dependents are not stopped.
    pub async fn stop(&self, name: &str) -> Result<(), OrchestratorError> {
        let instance = self.instance(name)?;
        instance.executor.stop(&self.manager, name).await
    }

    /// Stops every running process, then takes compose stacks down.
    pub async fn stop_all(&self) -> Vec<(String, Result<ProcessRecord, ManagerError>)> {
        let results = self.manager.stop_all(ProcessSignal::SigTerm).await;
        let stacks: Vec<(String, Executor)> = self.read(|modules| {
            modules
                .by_name
                .values()
                .filter(|instance| matches!(instance.executor, Executor::Docker(_)))
                .map(|instance| (instance.config.name.clone(), instance.executor.clone()))
                .collect()
        });
        for (name, executor) in stacks {
            if let Executor::Docker(project) = executor {
                if let Err(err) = project.down(&name).await {
                    warn!(module = %name, "{}", err);
                }
            }
        }
        results
    }

    /// Restarts a configured module from its current config. A process the
    /// manager tracks outside the module set (adopted from an earlier
    /// session) is respawned with the options it last ran with.
    pub async fn restart(&self, name: &str) -> Result<ProcessRecord, OrchestratorError> {
        let Some(instance) = self.get(name) else {
            if self.manager.get_record(name).is_some() {
                return Ok(self.manager.restart(name).await?);
            }
            return Err(OrchestratorError::ModuleNotFound(name.to_string()));
        };
        instance
            .executor
            .restart(&self.manager, &instance.config, self.log_file(name))
            .await
    }
}

fn outcome_of(started: Result<ProcessRecord, ManagerError>) -> StartOutcome {
    match started {
        Ok(ProcessRecord {
            status: ProcessStatus::Running,
            pid: Some(pid),
            ..
        }) => StartOutcome::Started { pid },
        Ok(record) => StartOutcome::Failed {
            error: record
                .last_error
                .unwrap_or_else(|| format!("process ended as {}", record.status.label())),
        },
        Err(ManagerError::AlreadyRunning(_)) => StartOutcome::AlreadyRunning,
        Err(err) => StartOutcome::Failed {
            error: err.to_string(),
        },
    }
}

/// Modules reachable from `roots`, dependencies before dependents, each once.
pub fn start_order(
    modules: &HashMap<String, ModuleInstance>,
    roots: &[String],
) -> Result<Vec<ModuleInstance>, OrchestratorError> {
    let mut visit = Visit {
        modules,
        done: HashSet::new(),
        stack: Vec::new(),
        order: Vec::new(),
    };
    for root in roots {
        visit.module(root)?;
    }
    Ok(visit.order)
}

struct Visit<'a> {
    modules: &'a HashMap<String, ModuleInstance>,
    done: HashSet<String>,
    stack: Vec<String>,
    order: Vec<ModuleInstance>,
}

impl Visit<'_> {
    fn module(&mut self, name: &str) -> Result<(), OrchestratorError> {
        if self.done.contains(name) {
            return Ok(());
        }
        if let Some(pos) = self.stack.iter().position(|entry| entry == name) {
            let mut cycle = self.stack[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(OrchestratorError::DependencyCycle(cycle));
        }
        let instance = self
            .modules
            .get(name)
            .ok_or_else(|| OrchestratorError::ModuleNotFound(name.to_string()))?;

        self.stack.push(name.to_string());
        for dependency in &instance.config.depends_on {
            self.module(dependency)?;
        }
        self.stack.pop();

        self.done.insert(name.to_string());
        self.order.push(instance.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleKind;

    fn custom(name: &str, command: &str, deps: &[&str]) -> ModuleConfig {
        ModuleConfig {
            name: name.into(),
            kind: ModuleKind::Custom {
                command: command.into(),
                cwd: None,
            },
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            env: HashMap::new(),
            enabled: None,
            color: None,
        }
    }

    fn instances(configs: Vec<ModuleConfig>) -> HashMap<String, ModuleInstance> {
        configs
            .into_iter()
            .map(|config| {
                let executor = Executor::for_module(&config);
                (config.name.clone(), ModuleInstance { config, executor })
            })
            .collect()
    }

    fn names(order: &[ModuleInstance]) -> Vec<&str> {
        order.iter().map(|i| i.config.name.as_str()).collect()
    }

    #[test]
    fn shared_dependency_is_ordered_once() {
        let modules = instances(vec![
            custom("a", "true", &[]),
            custom("b", "true", &["a"]),
            custom("c", "true", &["a", "b"]),
        ]);
        let order = start_order(&modules, &["c".to_string()]).unwrap();
        assert_eq!(names(&order), vec!["a", "b", "c"]);

        let all = start_order(&modules, &["c".into(), "b".into(), "a".into()]).unwrap();
        assert_eq!(names(&all), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let modules = instances(vec![
            custom("a", "true", &["c"]),
            custom("b", "true", &["a"]),
            custom("c", "true", &["b"]),
        ]);
        match start_order(&modules, &["a".to_string()]) {
            Err(OrchestratorError::DependencyCycle(path)) => {
                assert_eq!(path, vec!["a", "c", "b", "a"])
            }
            other => panic!("expected a cycle, got {:?}", other.map(|o| o.len())),
        }
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let modules = instances(vec![custom("api", "true", &["db"])]);
        assert!(matches!(
            start_order(&modules, &["api".to_string()]),
            Err(OrchestratorError::ModuleNotFound(name)) if name == "db"
        ));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::manager::ManagerSettings;
        use crate::state::STATE_FILE_NAME;
        use std::time::Duration;

        async fn orchestrator(dir: &std::path::Path) -> Orchestrator {
            let manager = ProcessManager::open(ManagerSettings {
                restart_settle: Duration::from_millis(20),
                ..ManagerSettings::new(dir.join(STATE_FILE_NAME))
            })
            .await;
            Orchestrator::new(manager, None)
        }

        #[tokio::test]
        async fn start_launches_dependencies_first_and_once() {
            let dir = tempfile::tempdir().unwrap();
            let orchestrator = orchestrator(dir.path()).await;
            orchestrator.load(vec![
                custom("a", "sleep 30", &[]),
                custom("b", "sleep 30", &["a"]),
                custom("c", "sleep 30", &["a", "b"]),
            ]);

            let results = orchestrator.start("c").await.unwrap();
            let started: Vec<&str> = results.iter().map(|r| r.module.as_str()).collect();
            assert_eq!(started, vec!["a", "b", "c"]);
            assert!(results
                .iter()
                .all(|r| matches!(r.outcome, StartOutcome::Started { .. })));
            assert_eq!(orchestrator.manager().running_pids().len(), 3);

            let again = orchestrator.start("b").await.unwrap();
            assert!(again
                .iter()
                .all(|r| r.outcome == StartOutcome::AlreadyRunning));

            orchestrator.stop("b").await.unwrap();
            assert_eq!(
                orchestrator.manager().get_status("b"),
                Some(ProcessStatus::Stopped)
            );
            assert_eq!(
                orchestrator.manager().get_status("c"),
                Some(ProcessStatus::Running)
            );

            let stopped = orchestrator.stop_all().await;
            assert_eq!(stopped.len(), 2);
            assert!(orchestrator.manager().running_pids().is_empty());
        }

        #[tokio::test]
        async fn start_all_skips_disabled_roots() {
            let dir = tempfile::tempdir().unwrap();
            let orchestrator = orchestrator(dir.path()).await;
            let mut disabled = custom("off", "sleep 30", &[]);
            disabled.enabled = Some(false);
            let mut needed = custom("dep", "sleep 30", &[]);
            needed.enabled = Some(false);
            orchestrator.load(vec![
                disabled,
                needed,
                custom("on", "sleep 30", &["dep"]),
            ]);

            let results = orchestrator.start_all().await.unwrap();
            let started: Vec<&str> = results.iter().map(|r| r.module.as_str()).collect();
            assert_eq!(started, vec!["dep", "on"]);
            assert_eq!(orchestrator.manager().get_status("off"), None);
            orchestrator.stop_all().await;
        }

        #[tokio::test]
        async fn restart_replaces_the_process() {
            let dir = tempfile::tempdir().unwrap();
            let orchestrator = orchestrator(dir.path()).await;
            orchestrator.load(vec![custom("web", "sleep 30", &[])]);
            orchestrator.start("web").await.unwrap();
            let before = orchestrator.manager().get_pid("web");

            let record = orchestrator.restart("web").await.unwrap();
            assert_eq!(record.status, ProcessStatus::Running);
            assert_ne!(record.pid, before);
            orchestrator.stop_all().await;
        }

        #[tokio::test]
        async fn restart_after_reload_uses_the_new_command() {
            let dir = tempfile::tempdir().unwrap();
            let orchestrator = orchestrator(dir.path()).await;
            orchestrator.load(vec![custom("web", "sleep 30", &[])]);
            orchestrator.start("web").await.unwrap();
            let before = orchestrator.manager().get_pid("web");

            orchestrator.load(vec![custom("web", "sleep 31", &[])]);
            let record = orchestrator.restart("web").await.unwrap();
            assert_eq!(record.command, "sleep 31");
            assert_eq!(record.status, ProcessStatus::Running);
            assert_ne!(record.pid, before);
            orchestrator.stop_all().await;
        }

        #[tokio::test]
        async fn restart_of_untracked_name_is_not_found() {
            let dir = tempfile::tempdir().unwrap();
            let orchestrator = orchestrator(dir.path()).await;
            assert!(matches!(
                orchestrator.restart("ghost").await,
                Err(OrchestratorError::ModuleNotFound(_))
            ));
        }

        #[tokio::test]
        async fn spawn_failure_is_a_failed_outcome() {
            let dir = tempfile::tempdir().unwrap();
            let orchestrator = orchestrator(dir.path()).await;
            let mut broken = custom("broken", "true", &[]);
            broken.kind = ModuleKind::Custom {
                command: "true".into(),
                cwd: Some(dir.path().join("missing-dir")),
            };
            orchestrator.load(vec![broken]);
            let results = orchestrator.start("broken").await.unwrap();
            assert!(matches!(results[0].outcome, StartOutcome::Failed { .. }));
            assert!(matches!(
                orchestrator.start("nope").await,
                Err(OrchestratorError::ModuleNotFound(_))
            ));
        }
    }
}
