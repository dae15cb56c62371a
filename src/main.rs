//! devdeck: a local development environment launcher.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads `devdeck.toml`, and runs the module supervisor for an `up` session or
//! inspects the state a previous session left behind.

mod auto_restart;
mod config;
mod error;
mod events;
mod executor;
mod launcher;
mod logger;
mod manager;
mod monitor;
mod orchestrator;
mod output;
mod process;
mod state;
mod supervisor;
mod terminate;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auto_restart::{AutoRestartManager, RetryNotice};
use crate::config::{Config, Settings, DEFAULT_CONFIG_FILE};
use crate::events::ProcessSignal;
use crate::executor::Executor;
use crate::manager::{ProcessManager, Subscription};
use crate::monitor::{ResourceAlert, ResourceMonitor, DEFAULT_HEARTBEAT_POLLS};
use crate::orchestrator::{ModuleStartResult, Orchestrator, StartOutcome};
use crate::output::{sanitize_text, OutputChunk};
use crate::process::ProcessRecord;
use crate::supervisor::Supervisor;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devdeck",
    version,
    about = "Launch and supervise a local development environment",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devdeck.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log debug output to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start modules and stream their output until interrupted.
    Up {
        /// Modules to start (default: every enabled module).
        modules: Vec<String>,
        /// Do not restart modules that fail.
        #[arg(long)]
        no_auto_restart: bool,
        /// Strip ANSI escapes from module output.
        #[arg(long)]
        no_color: bool,
    },
    /// Show the processes recorded in the state file.
    Status,
    /// Stop a process left running by a previous session.
    Stop {
        module: String,
        /// Signal sent before escalating to a force kill.
        #[arg(long, default_value = "SIGTERM")]
        signal: ProcessSignal,
    },
    /// Print the end of a module's log file.
    Logs {
        module: String,
        /// Number of lines to print.
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
    },
    /// Show version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Commands::Version = cli.command {
        println!("devdeck {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let (config, settings) = load_settings(cli.config.as_deref())?;
    match cli.command {
        Commands::Up {
            modules,
            no_auto_restart,
            no_color,
        } => run_up(config, settings, modules, !no_auto_restart, no_color).await,
        Commands::Status => run_status(&config, &settings).await,
        Commands::Stop { module, signal } => run_stop(&settings, &module, signal).await,
        Commands::Logs { module, lines } => run_logs(&settings, &module, lines).await,
        Commands::Version => Ok(()),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "devdeck=debug" } else { "devdeck=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Loads the config named on the command line, or `devdeck.toml` in the
/// working directory when present. Without either, defaults apply.
fn load_settings(path: Option<&Path>) -> Result<(Config, Settings)> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| default_config_path().filter(|path| path.exists()));
    match path {
        Some(path) => {
            let config = config::load_config(&path)?;
            let settings = Settings::from_config(&config, &config::config_dir(&path));
            debug!(config = %path.display(), state = %settings.state_file.display(), "config loaded");
            Ok((config, settings))
        }
        None => {
            let config = Config::default();
            let settings = Settings::from_config(&config, Path::new("."));
            Ok((config, settings))
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

async fn run_up(
    config: Config,
    settings: Settings,
    modules: Vec<String>,
    auto_restart: bool,
    no_color: bool,
) -> Result<()> {
    if config.modules.is_empty() {
        bail!(
            "no modules configured; create {} or pass --config",
            DEFAULT_CONFIG_FILE
        );
    }
    let prefixes = Prefixes::new(&config, no_color);

    let manager = ProcessManager::open(settings.manager_settings()).await;
    let orchestrator = Orchestrator::new(manager.clone(), Some(settings.log_dir.clone()));
    orchestrator.load(config.modules);
    for name in &modules {
        if orchestrator.get(name).is_none() {
            bail!("unknown module: {}", name);
        }
    }

    let auto_restart = (settings.auto_restart && auto_restart)
        .then(|| AutoRestartManager::new(settings.restart_policy));
    if let Some(auto_restart) = &auto_restart {
        let policy = auto_restart.policy();
        debug!(max_retries = policy.max_retries, "automatic restart enabled");
    }
    let (supervisor, mut notices) = Supervisor::new(orchestrator.clone(), auto_restart);

    // Subscribe before anything starts so no output is missed.
    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    for name in orchestrator.module_names() {
        spawn_output_forwarder(manager.subscribe(&name), output_tx.clone());
    }

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    spawn_signal_listener(shutdown_tx);
    let (input_tx, mut input_rx) = mpsc::channel(16);
    spawn_stdin_listener(input_tx);

    let started = if modules.is_empty() {
        supervisor.start_all().await
    } else {
        start_named(&supervisor, &modules).await
    };
    let results = match started {
        Ok(results) => results,
        Err(err) => {
            supervisor.shutdown().await;
            return Err(err).context("failed to start modules");
        }
    };
    report_started(&results);

    let pid_source = manager.clone();
    let monitor = ResourceMonitor::spawn(
        settings.resource_poll,
        DEFAULT_HEARTBEAT_POLLS,
        Arc::new(move || pid_source.running_pids()),
    );
    let mut snapshots = monitor.subscribe();
    let mut watching = true;
    let check_alerts = !settings.thresholds.is_empty();
    let mut alerts = AlertTracker::default();
    let mut lines = LineSplitter::default();

    loop {
        tokio::select! {
            Some(chunk) = output_rx.recv() => {
                for (module, line) in lines.push(&chunk) {
                    println!("{}", prefixes.format_line(&module, &line));
                }
            }
            Some(notice) = notices.recv() => {
                println!("{}", format_tool_message(&format!(
                    "{} failed, {}",
                    notice.module,
                    format_restart_message(&notice)
                )));
            }
            changed = snapshots.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                if !check_alerts {
                    continue;
                }
                for alert in alerts.update(settings.thresholds.check(&snapshot)) {
                    println!("{}", format_tool_message(&format!(
                        "{}: {}",
                        alert.module(),
                        alert.describe()
                    )));
                }
            }
            Some(line) = input_rx.recv() => {
                match ConsoleCommand::parse(&line) {
                    Ok(Some(command)) => run_console_command(command, &supervisor, &monitor).await,
                    Ok(None) => {}
                    Err(message) => println!("{}", format_tool_message(&message)),
                }
            }
            Some(signal) = shutdown_rx.recv() => {
                info!(signal = signal.label(), "shutting down");
                break;
            }
            else => break,
        }
    }

    drop(monitor);
    supervisor.shutdown().await;
    while let Ok(chunk) = output_rx.try_recv() {
        for (module, line) in lines.push(&chunk) {
            println!("{}", prefixes.format_line(&module, &line));
        }
    }
    for (module, line) in lines.flush() {
        println!("{}", prefixes.format_line(&module, &line));
    }
    Ok(())
}

async fn start_named(
    supervisor: &Supervisor,
    modules: &[String],
) -> Result<Vec<ModuleStartResult>, error::OrchestratorError> {
    let mut results = Vec::new();
    for name in modules {
        results.extend(supervisor.start_module(name).await?);
    }
    Ok(results)
}

fn report_started(results: &[ModuleStartResult]) {
    for result in results {
        let text = match &result.outcome {
            StartOutcome::Started { pid } => format!("started {} (pid {})", result.module, pid),
            StartOutcome::AlreadyRunning => format!("{} already running", result.module),
            StartOutcome::Failed { error } => {
                format!("{} failed to start: {}", result.module, error)
            }
        };
        println!("{}", format_tool_message(&text));
    }
}

fn spawn_output_forwarder(mut subscription: Subscription, tx: mpsc::UnboundedSender<OutputChunk>) {
    tokio::spawn(async move {
        while let Some(chunk) = subscription.recv().await {
            if tx.send(chunk).is_err() {
                subscription.unsubscribe();
                return;
            }
        }
        debug!(module = subscription.id(), "output stream closed");
    });
}

fn spawn_stdin_listener(tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<ProcessSignal>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!("failed to listen for SIGTERM: {}", err);
                    let _ = tokio::signal::ctrl_c().await;
                    let _ = tx.send(ProcessSignal::SigInt).await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(ProcessSignal::SigInt).await;
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(ProcessSignal::SigTerm).await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(ProcessSignal::SigInt).await;
        }
    });
}

async fn run_status(config: &Config, settings: &Settings) -> Result<()> {
    let manager = ProcessManager::open(settings.manager_settings()).await;
    let records = manager.get_all_processes();
    if records.is_empty() {
        println!("no processes recorded in {}", manager.state_file().display());
    } else {
        println!("{:<16} {:<9} {:>7}  {:<8}  DETAIL", "MODULE", "STATUS", "PID", "SINCE");
        for record in &records {
            println!("{}", format_status_row(record));
        }
    }
    manager.flush_state().await;

    for module in &config.modules {
        let Executor::Docker(project) = Executor::for_module(module) else {
            continue;
        };
        match project.containers(&module.name).await {
            Ok(containers) => {
                for container in containers {
                    let marker = if container.is_running() { "up" } else { "down" };
                    println!(
                        "  {} {:<4} {} ({}): {}",
                        module.name, marker, container.name, container.service, container.status
                    );
                }
            }
            Err(err) => warn!(module = %module.name, "{}", err),
        }
    }
    Ok(())
}

fn format_status_row(record: &ProcessRecord) -> String {
    let pid = record
        .pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "-".to_string());
    let since = record
        .stopped_at
        .filter(|_| !record.status.is_live())
        .or(record.started_at)
        .map(|at| at.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let detail = record.last_error.as_deref().unwrap_or(&record.command);
    format!(
        "{:<16} {:<9} {:>7}  {:<8}  {}",
        record.id,
        record.status.label(),
        pid,
        since,
        detail
    )
}

async fn run_stop(settings: &Settings, module: &str, signal: ProcessSignal) -> Result<()> {
    let manager = ProcessManager::open(settings.manager_settings()).await;
    let result = manager.stop(module, signal).await;
    manager.flush_state().await;
    let record = result.with_context(|| format!("failed to stop {}", module))?;
    println!(
        "{}",
        format_tool_message(&format!("{} {}", record.id, record.status.label()))
    );
    Ok(())
}

async fn run_logs(settings: &Settings, module: &str, lines: usize) -> Result<()> {
    let path = settings.log_file(module);
    let contents = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read log file {}", path.display()))?;
    for line in tail(&contents, lines) {
        println!("{}", line);
    }
    Ok(())
}

fn tail(contents: &str, count: usize) -> Vec<&str> {
    let lines: Vec<&str> = contents.lines().collect();
    lines[lines.len().saturating_sub(count)..].to_vec()
}

/// Commands typed on stdin during an `up` session.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConsoleCommand {
    Status,
    Logs(String),
    Start(String),
    Stop(String),
    Restart(String),
    Help,
}

const CONSOLE_HELP: &str = "commands: status | logs <module> | start <module> | stop <module> | restart <module>";

impl ConsoleCommand {
    /// `Ok(None)` for a blank line.
    fn parse(line: &str) -> Result<Option<Self>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let module = words.next().map(str::to_string);
        let needs_module = |build: fn(String) -> ConsoleCommand| {
            module
                .clone()
                .map(build)
                .ok_or_else(|| format!("{} needs a module name", verb))
        };
        let command = match verb {
            "status" | "ps" => ConsoleCommand::Status,
            "help" | "?" => ConsoleCommand::Help,
            "logs" => needs_module(ConsoleCommand::Logs)?,
            "start" => needs_module(ConsoleCommand::Start)?,
            "stop" => needs_module(ConsoleCommand::Stop)?,
            "restart" => needs_module(ConsoleCommand::Restart)?,
            other => return Err(format!("unknown command: {} ({})", other, CONSOLE_HELP)),
        };
        Ok(Some(command))
    }
}

async fn run_console_command(
    command: ConsoleCommand,
    supervisor: &Supervisor,
    monitor: &ResourceMonitor,
) {
    let manager = supervisor.orchestrator().manager();
    let message = match command {
        ConsoleCommand::Help => CONSOLE_HELP.to_string(),
        ConsoleCommand::Status => {
            print_session_status(supervisor, monitor);
            return;
        }
        ConsoleCommand::Logs(module) => {
            let text: String = manager
                .get_logs(&module)
                .into_iter()
                .map(|chunk| chunk.text)
                .collect();
            for line in tail(&text, 20) {
                println!("[{}] {}", module, line);
            }
            return;
        }
        ConsoleCommand::Start(module) => match supervisor.start_module(&module).await {
            Ok(results) => {
                report_started(&results);
                return;
            }
            Err(err) => err.to_string(),
        },
        ConsoleCommand::Stop(module) => {
            let pid = manager.get_pid(&module);
            match supervisor.stop_module(&module).await {
                Ok(()) => match pid {
                    Some(pid) => format!("stopped {} (pid {})", module, pid),
                    None => format!("stopped {}", module),
                },
                Err(err) => err.to_string(),
            }
        }
        ConsoleCommand::Restart(module) => match supervisor.restart_module(&module).await {
            Ok(record) => format!(
                "restarted {} (pid {})",
                module,
                record.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string())
            ),
            Err(err) => err.to_string(),
        },
    };
    println!("{}", format_tool_message(&message));
}

fn print_session_status(supervisor: &Supervisor, monitor: &ResourceMonitor) {
    let orchestrator = supervisor.orchestrator();
    let usage = monitor.latest();
    for name in orchestrator.module_names() {
        let kind = orchestrator
            .get(&name)
            .map_or("", |instance| instance.config.kind.label());
        let mut line = match orchestrator.manager().get_record(&name) {
            Some(record) => format_status_row(&record),
            None => format!("{:<16} {:<9}", name, "idle"),
        };
        line.push_str(&format!("  [{}]", kind));
        if let Some(usage) = usage.modules.get(&name) {
            line.push_str(&format!(
                "  cpu {:.1}% mem {} MiB",
                usage.cpu_percent,
                usage.memory_bytes / (1024 * 1024)
            ));
        }
        if let Some(auto_restart) = supervisor.auto_restart() {
            if let Some(state) = auto_restart.state(&name) {
                line.push_str(&format!(
                    "  retries {}/{}",
                    state.retry_count,
                    auto_restart.policy().max_retries
                ));
            }
            if let Some(remaining) = auto_restart.remaining(&name) {
                line.push_str(&format!("  restart in {:.1}s", remaining.as_secs_f32()));
            }
        }
        println!("{}", line);
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

const PALETTE: [&str; 6] = ["cyan", "green", "yellow", "magenta", "blue", "red"];

/// Per-module output prefixes.
struct Prefixes {
    colors: HashMap<String, String>,
    no_color: bool,
}

impl Prefixes {
    fn new(config: &Config, no_color: bool) -> Self {
        let colors = config
            .modules
            .iter()
            .enumerate()
            .map(|(index, module)| {
                let color = module
                    .color
                    .clone()
                    .unwrap_or_else(|| PALETTE[index % PALETTE.len()].to_string());
                (module.name.clone(), color)
            })
            .collect();
        Self { colors, no_color }
    }

    fn format_line(&self, module: &str, line: &str) -> String {
        let prefix = format!("[{}]", module);
        let prefix = if self.no_color {
            prefix
        } else {
            apply_color(&prefix, self.colors.get(module).map(String::as_str))
        };
        format!("{} {}", prefix, sanitize_text(line, self.no_color))
    }
}

fn apply_color(prefix: &str, color: Option<&str>) -> String {
    let code = match color.unwrap_or("").to_lowercase().as_str() {
        "black" => "30",
        "red" => "31",
        "green" => "32",
        "yellow" => "33",
        "blue" => "34",
        "magenta" => "35",
        "cyan" => "36",
        "gray" | "grey" => "90",
        _ => "0",
    };
    if code == "0" {
        prefix.to_string()
    } else {
        format!("\u{1b}[{}m{}\u{1b}[0m", code, prefix)
    }
}

/// Reassembles raw output chunks into whole lines per module.
#[derive(Default)]
struct LineSplitter {
    pending: HashMap<String, String>,
}

impl LineSplitter {
    fn push(&mut self, chunk: &OutputChunk) -> Vec<(String, String)> {
        let buffer = self.pending.entry(chunk.id.clone()).or_default();
        buffer.push_str(&chunk.text);
        let mut lines = Vec::new();
        while let Some(end) = buffer.find('\n') {
            let line: String = buffer.drain(..=end).collect();
            let line = line.trim_end_matches(['\n', '\r']).to_string();
            lines.push((chunk.id.clone(), line));
        }
        lines
    }

    /// Remaining partial lines.
    fn flush(&mut self) -> Vec<(String, String)> {
        let mut rest: Vec<(String, String)> = self
            .pending
            .drain()
            .filter(|(_, text)| !text.is_empty())
            .collect();
        rest.sort();
        rest
    }
}

/// Reports an alert when it first appears and again after it has cleared.
#[derive(Default)]
struct AlertTracker {
    active: HashSet<(String, &'static str)>,
}

impl AlertTracker {
    fn update(&mut self, alerts: Vec<ResourceAlert>) -> Vec<ResourceAlert> {
        let current: HashSet<(String, &'static str)> = alerts.iter().map(alert_key).collect();
        let fresh = alerts
            .into_iter()
            .filter(|alert| !self.active.contains(&alert_key(alert)))
            .collect();
        self.active = current;
        fresh
    }
}

fn alert_key(alert: &ResourceAlert) -> (String, &'static str) {
    let kind = match alert {
        ResourceAlert::Cpu { .. } => "cpu",
        ResourceAlert::Memory { .. } => "memory",
    };
    (alert.module().to_string(), kind)
}

fn format_restart_message(notice: &RetryNotice) -> String {
    format!(
        "retrying in {}ms (attempt {}/{})",
        notice.delay.as_millis(),
        notice.attempt,
        notice.max_retries
    )
}

fn format_tool_message(text: &str) -> String {
    format!("[devdeck] {}", text)
}
