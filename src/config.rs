//! Configuration management for devdeck.
//!
//! This module defines the structure of the `devdeck.toml` configuration file,
//! loads it, and resolves it into the runtime `Settings` the rest of the
//! crate consumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::auto_restart::RestartPolicy;
use crate::manager::ManagerSettings;
use crate::monitor::ResourceThresholds;
use crate::output::DEFAULT_CHUNK_CAPACITY;
use crate::state::STATE_FILE_NAME;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "devdeck.toml";

/// Top-level configuration structure corresponding to `devdeck.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory holding the persisted process state.
    pub state_dir: Option<PathBuf>,
    /// Directory for per-module log files.
    pub log_dir: Option<PathBuf>,
    /// Output chunks kept in memory per module.
    pub max_log_chunks: Option<usize>,
    /// Grace period before a stop escalates to a force kill.
    pub kill_timeout_ms: Option<u64>,
    /// Pause between stop and spawn when restarting.
    pub restart_settle_ms: Option<u64>,
    /// Resource monitor polling interval.
    pub resource_poll_ms: Option<u64>,
    /// Automatic restart of failed modules.
    pub auto_restart: Option<AutoRestartConfig>,
    /// Resource usage alert thresholds.
    pub alerts: Option<AlertConfig>,
    /// Modules to manage.
    #[serde(rename = "module", default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutoRestartConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub stability_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertConfig {
    /// CPU usage (percent of one core) above which a module is flagged.
    pub cpu_percent: Option<f32>,
    /// Resident memory in MiB above which a module is flagged.
    pub memory_mb: Option<u64>,
}

/// Configuration for a single module.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModuleConfig {
    /// Module name, also used as its process id.
    pub name: String,
    /// Type-specific settings, selected by the `type` key.
    #[serde(flatten)]
    pub kind: ModuleKind,
    /// Modules that must be started first.
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
    /// Environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Whether `up` starts this module without naming it (default: true).
    pub enabled: Option<bool>,
    /// Color for the module's output prefix.
    pub color: Option<String>,
}

/// The three kinds of module devdeck knows how to run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModuleKind {
    /// A package script run through the workspace's package manager.
    Workspace {
        path: PathBuf,
        #[serde(default)]
        script: Option<String>,
        #[serde(default, alias = "packageManager")]
        package_manager: Option<String>,
    },
    /// A Docker Compose stack.
    Docker {
        #[serde(alias = "composeFile")]
        compose_file: PathBuf,
        #[serde(default)]
        services: Vec<String>,
        #[serde(default)]
        profiles: Vec<String>,
    },
    /// An arbitrary shell command.
    Custom {
        command: String,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
}

impl ModuleKind {
    pub fn label(&self) -> &'static str {
        match self {
            ModuleKind::Workspace { .. } => "workspace",
            ModuleKind::Docker { .. } => "docker",
            ModuleKind::Custom { .. } => "custom",
        }
    }
}

impl ModuleConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Makes relative paths absolute against `base`.
    fn resolve_paths(&mut self, base: &Path) {
        match &mut self.kind {
            ModuleKind::Workspace { path, .. } => *path = resolve(base, path),
            ModuleKind::Docker { compose_file, .. } => *compose_file = resolve(base, compose_file),
            ModuleKind::Custom { cwd, .. } => {
                *cwd = Some(match cwd.as_deref() {
                    Some(dir) => resolve(base, dir),
                    None => base.to_path_buf(),
                });
            }
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Runtime settings resolved from a `Config`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub state_file: PathBuf,
    pub log_dir: PathBuf,
    pub max_log_chunks: usize,
    pub kill_timeout: Duration,
    pub restart_settle: Duration,
    pub resource_poll: Duration,
    pub auto_restart: bool,
    pub restart_policy: RestartPolicy,
    pub thresholds: ResourceThresholds,
}

impl Settings {
    /// Applies defaults and resolves directories against `base`.
    pub fn from_config(config: &Config, base: &Path) -> Self {
        let state_dir = resolve(
            base,
            config
                .state_dir
                .as_deref()
                .unwrap_or_else(|| Path::new(".devdeck")),
        );
        let log_dir = match config.log_dir.as_deref() {
            Some(dir) => resolve(base, dir),
            None => state_dir.join("logs"),
        };

        let restart = config.auto_restart.clone().unwrap_or_default();
        let defaults = RestartPolicy::default();
        let restart_policy = RestartPolicy {
            max_retries: restart.max_retries.unwrap_or(defaults.max_retries),
            base_delay: restart
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: restart
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
            stability_window: restart
                .stability_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stability_window),
        };

        let alerts = config.alerts.clone().unwrap_or_default();
        Self {
            state_file: state_dir.join(STATE_FILE_NAME),
            log_dir,
            max_log_chunks: config.max_log_chunks.unwrap_or(DEFAULT_CHUNK_CAPACITY).max(1),
            kill_timeout: Duration::from_millis(config.kill_timeout_ms.unwrap_or(5000)),
            restart_settle: Duration::from_millis(config.restart_settle_ms.unwrap_or(1000)),
            resource_poll: Duration::from_millis(config.resource_poll_ms.unwrap_or(2000).max(100)),
            auto_restart: restart.enabled.unwrap_or(true),
            restart_policy,
            thresholds: ResourceThresholds {
                cpu_percent: alerts.cpu_percent,
                memory_bytes: alerts.memory_mb.map(|mb| mb * 1024 * 1024),
            },
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            state_file: self.state_file.clone(),
            buffer_capacity: self.max_log_chunks,
            kill_timeout: self.kill_timeout,
            restart_settle: self.restart_settle,
        }
    }

    /// Log file for `module`.
    pub fn log_file(&self, module: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", module))
    }
}

/// Loads and parses the configuration from a file path. Relative module paths
/// are resolved against the file's directory.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    let base = config_dir(path);
    for module in &mut config.modules {
        module.resolve_paths(&base);
    }
    Ok(config)
}

/// Directory relative paths in the config file at `path` resolve against.
pub fn config_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
state_dir = ".state"
max_log_chunks = 500
kill_timeout_ms = 2500

[auto_restart]
max_retries = 5
base_delay_ms = 200

[alerts]
cpu_percent = 90.0
memory_mb = 512

[[module]]
name = "db"
type = "docker"
composeFile = "docker-compose.yml"
services = ["postgres"]

[[module]]
name = "api"
type = "workspace"
path = "apps/api"
script = "dev"
package_manager = "pnpm"
dependsOn = ["db"]
env = { PORT = "4000" }

[[module]]
name = "worker"
type = "custom"
command = "cargo run --bin worker"
depends_on = ["api"]
enabled = false
color = "cyan"
"#;

    #[test]
    fn parses_all_module_kinds() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.modules.len(), 3);

        let db = &config.modules[0];
        assert_eq!(
            db.kind,
            ModuleKind::Docker {
                compose_file: "docker-compose.yml".into(),
                services: vec!["postgres".into()],
                profiles: Vec::new(),
            }
        );

        let api = &config.modules[1];
        assert_eq!(api.kind.label(), "workspace");
        assert_eq!(api.depends_on, vec!["db"]);
        assert_eq!(api.env.get("PORT").map(String::as_str), Some("4000"));
        assert!(api.is_enabled());

        let worker = &config.modules[2];
        assert!(!worker.is_enabled());
        assert_eq!(worker.color.as_deref(), Some("cyan"));
    }

    #[test]
    fn rejects_unknown_module_type() {
        let raw = r#"
[[module]]
name = "x"
type = "kubernetes"
"#;
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn settings_apply_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let settings = Settings::from_config(&config, Path::new("/work"));
        assert_eq!(settings.state_file, Path::new("/work/.state/processes.json"));
        assert_eq!(settings.log_dir, Path::new("/work/.state/logs"));
        assert_eq!(settings.max_log_chunks, 500);
        assert_eq!(settings.kill_timeout, Duration::from_millis(2500));
        assert_eq!(settings.restart_settle, Duration::from_secs(1));
        assert!(settings.auto_restart);
        assert_eq!(settings.restart_policy.max_retries, 5);
        assert_eq!(settings.restart_policy.base_delay, Duration::from_millis(200));
        assert_eq!(settings.restart_policy.max_delay, Duration::from_secs(30));
        assert_eq!(settings.thresholds.memory_bytes, Some(512 * 1024 * 1024));
        assert_eq!(settings.log_file("api"), Path::new("/work/.state/logs/api.log"));
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();
        let config = load_config(&path).unwrap();
        match &config.modules[1].kind {
            ModuleKind::Workspace { path: module_path, .. } => {
                assert_eq!(module_path, &dir.path().join("apps/api"))
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &config.modules[2].kind {
            ModuleKind::Custom { cwd, .. } => assert_eq!(cwd.as_deref(), Some(dir.path())),
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
