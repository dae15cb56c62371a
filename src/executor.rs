//! Module executors.
//!
//! An `Executor` turns one module's declaration into concrete spawn options
//! for the process manager and knows how that kind of module is stopped and
//! restarted. Docker Compose stacks run `compose up` in the foreground so
//! their output streams like any other module; stopping them also runs
//! `compose down`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{ModuleConfig, ModuleKind};
use crate::error::{ManagerError, OrchestratorError};
use crate::events::ProcessSignal;
use crate::manager::ProcessManager;
use crate::process::{ProcessRecord, ProcessStatus, SpawnOptions};

const DEFAULT_PACKAGE_MANAGER: &str = "npm";
const DEFAULT_SCRIPT: &str = "dev";
const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// Strategy for running one kind of module.
#[derive(Debug, Clone, PartialEq)]
pub enum Executor {
    Workspace {
        dir: PathBuf,
        script: String,
        package_manager: String,
    },
    Docker(ComposeProject),
    Custom {
        command: String,
        cwd: Option<PathBuf>,
    },
}

impl Executor {
    pub fn for_module(module: &ModuleConfig) -> Self {
        match &module.kind {
            ModuleKind::Workspace {
                path,
                script,
                package_manager,
            } => Executor::Workspace {
                dir: path.clone(),
                script: script.clone().unwrap_or_else(|| DEFAULT_SCRIPT.to_string()),
                package_manager: package_manager
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PACKAGE_MANAGER.to_string()),
            },
            ModuleKind::Docker {
                compose_file,
                services,
                profiles,
            } => Executor::Docker(ComposeProject {
                compose_file: compose_file.clone(),
                services: services.clone(),
                profiles: profiles.clone(),
            }),
            ModuleKind::Custom { command, cwd } => Executor::Custom {
                command: command.clone(),
                cwd: cwd.clone(),
            },
        }
    }

    /// Spawn options for `module`, writing output to `log_file` if given.
    pub async fn spawn_options(
        &self,
        module: &ModuleConfig,
        log_file: Option<PathBuf>,
    ) -> SpawnOptions {
        let base = SpawnOptions {
            id: module.name.clone(),
            env: module.env.clone(),
            log_file,
            ..SpawnOptions::default()
        };
        match self {
            Executor::Workspace {
                dir,
                script,
                package_manager,
            } => SpawnOptions {
                command: package_manager.clone(),
                args: vec!["run".to_string(), script.clone()],
                cwd: Some(dir.clone()),
                shell: true,
                ..base
            },
            Executor::Docker(project) => {
                let cli = ComposeCli::detect().await;
                let mut args = cli.prefix();
                args.extend(project.up_args());
                SpawnOptions {
                    command: cli.program().to_string(),
                    args,
                    cwd: Some(project.dir()),
                    ..base
                }
            }
            Executor::Custom { command, cwd } => SpawnOptions {
                command: command.clone(),
                cwd: cwd.clone(),
                shell: true,
                ..base
            },
        }
    }

    pub async fn start(
        &self,
        manager: &ProcessManager,
        module: &ModuleConfig,
        log_file: Option<PathBuf>,
    ) -> Result<ProcessRecord, ManagerError> {
        let options = self.spawn_options(module, log_file).await;
        debug!(module = %module.name, command = %options.command_line(), "starting module");
        manager.spawn(options).await
    }

    /// Stops the module's process. Compose stacks are also taken down.
    pub async fn stop(&self, manager: &ProcessManager, name: &str) -> Result<(), OrchestratorError> {
        let stopped = manager.stop(name, ProcessSignal::SigTerm).await;
        match self {
            Executor::Docker(project) => {
                project.down(name).await?;
                match stopped {
                    Err(err) if err.is_usage_error() => Ok(()),
                    other => other.map(|_| ()).map_err(OrchestratorError::from),
                }
            }
            Executor::Workspace { .. } | Executor::Custom { .. } => {
                stopped.map(|_| ()).map_err(OrchestratorError::from)
            }
        }
    }

    /// Stop-then-start. Spawn options are rebuilt from `module`, so a
    /// reloaded config takes effect; a compose stack is also taken down in
    /// between.
    pub async fn restart(
        &self,
        manager: &ProcessManager,
        module: &ModuleConfig,
        log_file: Option<PathBuf>,
    ) -> Result<ProcessRecord, OrchestratorError> {
        if manager.get_status(&module.name) == Some(ProcessStatus::Running) {
            manager.stop(&module.name, ProcessSignal::SigTerm).await?;
        }
        if let Executor::Docker(project) = self {
            project.down(&module.name).await?;
        }
        tokio::time::sleep(manager.restart_settle()).await;
        Ok(self.start(manager, module, log_file).await?)
    }
}

/// Which compose CLI is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeCli {
    /// `docker compose` (v2 plugin).
    Plugin,
    /// Standalone `docker-compose`.
    Standalone,
}

static COMPOSE_CLI: OnceLock<ComposeCli> = OnceLock::new();

impl ComposeCli {
    /// Detects the compose CLI once per process; v2 is preferred and assumed
    /// when neither answers.
    pub async fn detect() -> Self {
        if let Some(cli) = COMPOSE_CLI.get() {
            return *cli;
        }
        let cli = if probe("docker", &["compose", "version"]).await {
            ComposeCli::Plugin
        } else if probe("docker-compose", &["version"]).await {
            ComposeCli::Standalone
        } else {
            warn!("no docker compose CLI found, assuming `docker compose`");
            ComposeCli::Plugin
        };
        *COMPOSE_CLI.get_or_init(|| cli)
    }

    pub fn program(self) -> &'static str {
        match self {
            ComposeCli::Plugin => "docker",
            ComposeCli::Standalone => "docker-compose",
        }
    }

    /// Arguments preceding the compose subcommand.
    pub fn prefix(self) -> Vec<String> {
        match self {
            ComposeCli::Plugin => vec!["compose".to_string()],
            ComposeCli::Standalone => Vec::new(),
        }
    }
}

async fn probe(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// A compose file plus the services and profiles a module selects from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposeProject {
    pub compose_file: PathBuf,
    pub services: Vec<String>,
    pub profiles: Vec<String>,
}

/// One row of `docker ps` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub state: String,
    pub status: String,
    pub service: String,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

impl ComposeProject {
    /// Directory compose commands run from.
    pub fn dir(&self) -> PathBuf {
        match self.compose_file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            self.compose_file.to_string_lossy().into_owned(),
        ];
        for profile in &self.profiles {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args
    }

    /// Arguments for a foreground `up` of the selected services.
    pub fn up_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("up".to_string());
        args.extend(self.services.iter().cloned());
        args
    }

    pub fn down_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.push("down".to_string());
        args
    }

    /// Runs `compose down` for the project.
    pub async fn down(&self, module: &str) -> Result<(), OrchestratorError> {
        info!(module, file = %self.compose_file.display(), "docker compose down");
        self.compose(module, "down", self.down_args()).await.map(|_| ())
    }

    /// Service names declared by the compose file.
    pub async fn services(&self, module: &str) -> Result<Vec<String>, OrchestratorError> {
        let mut args = self.base_args();
        args.extend(["config".to_string(), "--services".to_string()]);
        let stdout = self.compose(module, "config", args).await?;
        Ok(parse_services(&stdout))
    }

    /// The project name compose labels this file's containers with:
    /// `COMPOSE_PROJECT_NAME` when set, otherwise derived from the directory.
    pub fn project_name(&self) -> Option<String> {
        if let Ok(name) = std::env::var("COMPOSE_PROJECT_NAME") {
            let name = normalize_project_name(&name);
            if !name.is_empty() {
                return Some(name);
            }
        }
        let dir = self.dir();
        let dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir().ok()?.join(dir)
        };
        default_project_name(&dir)
    }

    /// Containers (running or not) of this project belonging to the selected
    /// services, or to every service in the file when none are selected.
    pub async fn containers(&self, module: &str) -> Result<Vec<ContainerInfo>, OrchestratorError> {
        let services = if self.services.is_empty() {
            self.services(module).await?
        } else {
            self.services.clone()
        };
        if services.is_empty() {
            return Ok(Vec::new());
        }
        let Some(project) = self.project_name() else {
            return Err(compose_error(
                module,
                "ps",
                format!("no project name for {}", self.compose_file.display()),
            ));
        };
        let format = container_format();
        let mut command = Command::new("docker");
        command
            .args(["ps", "-a", "--format", format.as_str()])
            .arg("--filter")
            .arg(format!("label={}={}", COMPOSE_PROJECT_LABEL, project));
        let stdout = run(command, &self.dir())
            .await
            .map_err(|message| compose_error(module, "ps", message))?;
        Ok(select_services(parse_containers(&stdout), &services))
    }

    async fn compose(
        &self,
        module: &str,
        action: &'static str,
        args: Vec<String>,
    ) -> Result<String, OrchestratorError> {
        let cli = ComposeCli::detect().await;
        let mut command = Command::new(cli.program());
        command.args(cli.prefix()).args(args);
        run(command, &self.dir())
            .await
            .map_err(|message| compose_error(module, action, message))
    }
}

fn compose_error(module: &str, action: &'static str, message: String) -> OrchestratorError {
    OrchestratorError::Compose {
        module: module.to_string(),
        action,
        message,
    }
}

/// Runs `command` to completion, returning stdout or the most useful error text.
async fn run(mut command: Command, dir: &Path) -> Result<String, String> {
    command
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let output = command.output().await.map_err(|err| err.to_string())?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = if stderr.trim().is_empty() {
        stdout.trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    Err(format!("{} ({})", detail, output.status))
}

fn container_format() -> String {
    format!(
        "{{{{.ID}}}}\t{{{{.Names}}}}\t{{{{.State}}}}\t{{{{.Status}}}}\t{{{{.Label \"{}\"}}}}",
        COMPOSE_SERVICE_LABEL
    )
}

/// Lowercase, keeping only `[a-z0-9_-]`, with no leading `_` or `-`.
fn normalize_project_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect::<String>()
        .trim_start_matches(['_', '-'])
        .to_string()
}

fn default_project_name(dir: &Path) -> Option<String> {
    let name = normalize_project_name(&dir.file_name()?.to_string_lossy());
    (!name.is_empty()).then_some(name)
}

/// Keeps the containers whose service label is one of `services`.
fn select_services(mut containers: Vec<ContainerInfo>, services: &[String]) -> Vec<ContainerInfo> {
    containers.retain(|container| services.iter().any(|s| *s == container.service));
    containers
}

pub fn parse_services(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_containers(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let id = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            Some(ContainerInfo {
                id: id.to_string(),
                name: fields.next()?.trim().to_string(),
                state: fields.next()?.trim().to_string(),
                status: fields.next().unwrap_or_default().trim().to_string(),
                service: fields.next().unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}
