//! Operator commands: the CLI subcommands and the console of `run`.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Command};
use crate::config::{load_config, LauncherConfig};
use crate::error::{AppError, Result};
use crate::hooks::{ConfiguredAnswers, FileCrashReporter};
use crate::instance::{
    DirtyFlag, InstanceController, InstanceDeps, InstanceEvent, InstanceEventKind,
    InstanceRegistry, StartOutcome,
};
use crate::paths::{default_data_dir, DataDir, InstanceLayout};
use crate::revision::HttpReleaseSource;
use crate::store::{ConfigStore, InstanceSettings};
use crate::validation::resolve_instance_id;

const EVENT_CAPACITY: usize = 1024;

pub const CONSOLE_HELP: &str = "\
commands:
  list
  start <id> | stop <id> | restart <id> | kill <id>
  send <id> <line>
  resource start|stop|reload <id> <name>
  help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOp {
    Start,
    Stop,
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    List,
    Help,
    Start(String),
    /// Deliberate stop; no automatic restart follows.
    Stop(String),
    Restart(String),
    /// Kill the process as if it had crashed; auto-restart applies.
    Kill(String),
    Send {
        id: String,
        line: String,
    },
    Resource {
        op: ResourceOp,
        id: String,
        name: String,
    },
}

fn usage(message: &str) -> AppError {
    AppError::other(format!("{} (type `help`)", message))
}

fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (input, ""),
    }
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_console_line(line: &str) -> Result<Option<ConsoleCommand>> {
    let (verb, rest) = next_word(line.trim());
    if verb.is_empty() {
        return Ok(None);
    }

    let single_id = |rest: &str| {
        let (id, extra) = next_word(rest);
        if id.is_empty() || !extra.is_empty() {
            Err(usage(&format!("`{}` takes exactly one instance id", verb)))
        } else {
            Ok(id.to_string())
        }
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "list" | "ls" => ConsoleCommand::List,
        "help" | "?" => ConsoleCommand::Help,
        "start" => ConsoleCommand::Start(single_id(rest)?),
        "stop" => ConsoleCommand::Stop(single_id(rest)?),
        "restart" => ConsoleCommand::Restart(single_id(rest)?),
        "kill" => ConsoleCommand::Kill(single_id(rest)?),
        "send" => {
            let (id, text) = next_word(rest);
            if id.is_empty() || text.is_empty() {
                return Err(usage("usage: send <id> <line>"));
            }
            ConsoleCommand::Send {
                id: id.to_string(),
                line: text.to_string(),
            }
        }
        "resource" | "res" => {
            let (op, rest) = next_word(rest);
            let op = match op {
                "start" => ResourceOp::Start,
                "stop" => ResourceOp::Stop,
                "reload" => ResourceOp::Reload,
                _ => return Err(usage("usage: resource start|stop|reload <id> <name>")),
            };
            let (id, name) = next_word(rest);
            if id.is_empty() || name.is_empty() {
                return Err(usage("usage: resource start|stop|reload <id> <name>"));
            }
            ConsoleCommand::Resource {
                op,
                id: id.to_string(),
                name: name.to_string(),
            }
        }
        other => return Err(usage(&format!("unknown command `{}`", other))),
    };
    Ok(Some(command))
}

fn lookup(registry: &InstanceRegistry, id: &str) -> Result<Arc<InstanceController>> {
    let ids = registry.ids();
    let id = resolve_instance_id(id, &ids)?;
    registry
        .get(id)
        .ok_or_else(|| AppError::instance_not_found(&id.to_string()))
}

fn describe_start(outcome: StartOutcome) -> &'static str {
    match outcome {
        StartOutcome::Started => "started",
        StartOutcome::AlreadyRunning => "already running",
        StartOutcome::Declined => "not started: another copy is running",
        StartOutcome::RestartPending => "a restart is already in progress",
        StartOutcome::Cancelled => "start cancelled",
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

fn sent(ok: bool) -> String {
    if ok {
        "sent".to_string()
    } else {
        "not sent: server is not running".to_string()
    }
}

/// Run a console command and describe the result.
pub async fn execute(registry: &InstanceRegistry, command: ConsoleCommand) -> Result<String> {
    match command {
        ConsoleCommand::Help => Ok(CONSOLE_HELP.to_string()),
        ConsoleCommand::List => {
            let statuses = registry.statuses();
            if statuses.is_empty() {
                return Ok("no instances".to_string());
            }
            let mut out = String::new();
            for status in statuses {
                let enabled = status.resources.iter().filter(|r| r.enabled).count();
                let _ = writeln!(
                    out,
                    "{}  {:<10}  pid {:<7}  resources {}/{}  {}{}",
                    short_id(&status.id),
                    format!("{:?}", status.state).to_lowercase(),
                    status.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    enabled,
                    status.resources.len(),
                    status.exe.display(),
                    if status.update_available { "  (update available)" } else { "" },
                );
            }
            Ok(out.trim_end().to_string())
        }
        ConsoleCommand::Start(id) => {
            let controller = lookup(registry, &id)?;
            Ok(describe_start(controller.start().await?).to_string())
        }
        ConsoleCommand::Restart(id) => {
            let controller = lookup(registry, &id)?;
            Ok(describe_start(controller.restart().await?).to_string())
        }
        ConsoleCommand::Stop(id) => {
            let controller = lookup(registry, &id)?;
            Ok(if controller.stop(true).await {
                "stopped".to_string()
            } else {
                "was not running".to_string()
            })
        }
        ConsoleCommand::Kill(id) => {
            let controller = lookup(registry, &id)?;
            Ok(if controller.stop(false).await {
                "killed".to_string()
            } else {
                "was not running".to_string()
            })
        }
        ConsoleCommand::Send { id, line } => {
            let controller = lookup(registry, &id)?;
            Ok(sent(controller.send_line(&line).await))
        }
        ConsoleCommand::Resource { op, id, name } => {
            let controller = lookup(registry, &id)?;
            let ok = match op {
                ResourceOp::Start => controller.start_resource(&name).await,
                ResourceOp::Stop => controller.stop_resource(&name).await,
                ResourceOp::Reload => controller.reload_resource(&name).await,
            };
            Ok(sent(ok))
        }
    }
}

/// Entry point for every subcommand.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let data = match cli.data_dir {
        Some(dir) => DataDir::new(dir),
        None => DataDir::new(default_data_dir()?),
    };
    data.ensure()?;
    let config = load_config(&data.config_path())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve(&data, &config).await,
        Command::Add {
            exe,
            auto_start,
            auto_restart,
        } => add_instance(&data, &config, &exe, auto_start, auto_restart),
        Command::Remove { id } => remove_instance(&data, &config, &id),
        Command::List => list_instances(&data, &config),
    }
}

fn open_store(data: &DataDir, config: &LauncherConfig) -> Result<ConfigStore> {
    ConfigStore::load(data.roster_path(&config.roster_file))
}

fn add_instance(
    data: &DataDir,
    config: &LauncherConfig,
    exe: &Path,
    auto_start: bool,
    auto_restart: bool,
) -> Result<()> {
    let exe = exe
        .canonicalize()
        .map_err(|_| AppError::invalid_installation(exe))?;
    let layout = InstanceLayout::from_exe(&exe)?;
    if !layout.is_valid_installation() {
        return Err(AppError::invalid_installation(&layout.root));
    }

    let store = open_store(data, config)?;
    if store.contains_exe(&exe) {
        return Err(AppError::duplicate_instance(&exe));
    }
    let mut settings = InstanceSettings::new(&exe);
    settings.auto_start = auto_start;
    settings.auto_restart = auto_restart;
    let id = settings.guid;
    store.upsert(settings);
    store.save()?;

    log::info!("Registered {} as {}", exe.display(), id);
    println!("{}", id);
    Ok(())
}

fn remove_instance(data: &DataDir, config: &LauncherConfig, id: &str) -> Result<()> {
    let store = open_store(data, config)?;
    let roster = store.snapshot();
    let id = resolve_instance_id(id, roster.servers.keys())?;
    let removed = store
        .remove(&id)
        .ok_or_else(|| AppError::instance_not_found(&id.to_string()))?;
    store.save()?;
    println!("removed {} ({})", id, removed.exe_file.display());
    Ok(())
}

fn list_instances(data: &DataDir, config: &LauncherConfig) -> Result<()> {
    let store = open_store(data, config)?;
    let roster = store.snapshot();
    if roster.servers.is_empty() {
        println!("no instances");
        return Ok(());
    }
    for settings in roster.servers.values() {
        println!(
            "{}  {}  auto-start={} auto-restart={} restart-timer={}s",
            settings.guid,
            settings.exe_file.display(),
            settings.auto_start,
            settings.auto_restart,
            settings.restart_timer.as_secs()
        );
    }
    Ok(())
}

fn log_event(event: &InstanceEvent) {
    let id = short_id(&event.instance_id);
    match &event.kind {
        InstanceEventKind::LogLine { line } => log::info!(target: "server", "[{}] {}", id, line),
        kind => match serde_json::to_string(kind) {
            Ok(json) => log::info!("[{}] {}", id, json),
            Err(_) => log::info!("[{}] {:?}", id, kind),
        },
    }
}

fn spawn_event_logger(
    mut events: broadcast::Receiver<InstanceEvent>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Instance event listener lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn handle_console_line(registry: &InstanceRegistry, line: &str) {
    let command = match parse_console_line(line) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(e) => {
            println!("{}", e.detail("detail").unwrap_or("invalid command"));
            return;
        }
    };
    match execute(registry, command).await {
        Ok(reply) => println!("{}", reply),
        Err(e) => println!("error: {}", e),
    }
}

/// Read console commands until Ctrl-C.
async fn run_console(registry: &InstanceRegistry) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    log::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_console_line(registry, &line).await,
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("Console input unavailable: {}", e);
                    stdin_open = false;
                }
            },
        }
    }
}

async fn serve(data: &DataDir, config: &LauncherConfig) -> Result<()> {
    let store = Arc::new(open_store(data, config)?);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let deps = InstanceDeps {
        events,
        dirty: Arc::new(DirtyFlag::default()),
        confirm: Arc::new(ConfiguredAnswers::from_config(config)),
        crash: Arc::new(FileCrashReporter::new(data.crash_report_path())),
        timings: config.timings,
    };
    let registry = Arc::new(InstanceRegistry::new(store, deps));

    let logger_token = CancellationToken::new();
    let logger = spawn_event_logger(registry.subscribe(), logger_token.clone());
    let loaded = registry.load_roster();
    log::info!("Supervising {} instance(s)", loaded);

    let timers = CancellationToken::new();
    let mut tasks = vec![registry.spawn_flush_loop(timers.clone())];
    if config.check_updates {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        tasks.push(registry.spawn_revision_check(
            HttpReleaseSource::new(client, config.release_index_url.as_str()),
            config.timings.revision_check_interval(),
            timers.clone(),
        ));
    }

    run_console(&registry).await;

    log::info!("Shutting down");
    timers.cancel();
    for task in tasks {
        let _ = task.await;
    }
    registry.stop_all().await;
    let flushed = registry.flush();
    logger_token.cancel();
    let _ = logger.await;
    flushed.map(|_| ())
}
