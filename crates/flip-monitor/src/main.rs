use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use flip_core::{EVENT_CONNECT, EVENT_DISCONNECT};
use flip_sync::{
    handler, ConnectionState, EventDispatcher, HttpTaskApi, LiveFeed, PendingOperation,
    SyncConfig, SyncService, TaskCoordinator,
};
use std::{
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    sync::Arc,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};
use url::Url;

const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/";
const DEFAULT_LOG_DIR: &str = ".flip/logs";

#[derive(Parser, Debug)]
#[command(name = "flip-monitor")]
struct Args {
    #[arg(long, default_value = "")]
    ws_url: String,
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    log_stdout: bool,
}

#[derive(Clone, Debug)]
struct Config {
    sync: SyncConfig,
    api_url: Url,
    log_dir: String,
    log_stdout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let log_path = init_logging(&config);

    let dispatcher = EventDispatcher::new();
    let api = HttpTaskApi::new(config.api_url.clone()).context("build task api client")?;
    let coordinator = TaskCoordinator::new(Default::default(), Arc::new(api));
    let feed = LiveFeed::from_config(&config.sync);

    let _task_bindings = coordinator.bind(&dispatcher);
    let _feed_binding = feed.bind(&dispatcher);
    let _connect_log = dispatcher.subscribe(
        EVENT_CONNECT,
        handler(|_| info!(event = "monitor_push_connected")),
    );
    let _disconnect_log = dispatcher.subscribe(
        EVENT_DISCONNECT,
        handler(|_| warn!(event = "monitor_push_disconnected")),
    );

    let service = SyncService::new(config.sync.clone(), dispatcher.clone());
    let state_logger = tokio::spawn(log_state_changes(service.state_changes()));
    service.start();
    info!(
        event = "monitor_start",
        ws_url = %config.sync.endpoint,
        api_url = %config.api_url,
        log_file = ?log_path
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line.context("read stdin")? {
                Some(line) => match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => run_command(command, &service, &coordinator, &feed),
                    Ok(None) => {}
                    Err(msg) => println!("{msg}"),
                },
                None => stdin_open = false,
            },
        }
    }

    service.stop();
    state_logger.abort();
    info!(event = "monitor_stop");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    List,
    Start(i64),
    Stop(i64),
    Refresh,
    Feed,
    Dismiss(String),
    State,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Ok(None);
        };
        let arg = parts.next();
        let command = match (verb, arg) {
            ("list" | "ls", None) => Command::List,
            ("start", Some(id)) => Command::Start(parse_task_id(id)?),
            ("stop", Some(id)) => Command::Stop(parse_task_id(id)?),
            ("refresh", None) => Command::Refresh,
            ("feed", None) => Command::Feed,
            ("dismiss", Some(id)) => Command::Dismiss(id.to_string()),
            ("state", None) => Command::State,
            ("help" | "?", None) => Command::Help,
            ("quit" | "exit", None) => Command::Quit,
            _ => return Err(format!("unknown command: {} (try `help`)", line.trim())),
        };
        Ok(Some(command))
    }
}

fn parse_task_id(raw: &str) -> Result<i64, String> {
    raw.parse::<i64>()
        .map_err(|_| format!("invalid task id: {raw}"))
}

fn run_command(
    command: Command,
    service: &SyncService,
    coordinator: &TaskCoordinator,
    feed: &LiveFeed,
) {
    match command {
        Command::List => {
            let tasks = coordinator.board().snapshot();
            if tasks.is_empty() {
                println!("no tasks");
            }
            for view in tasks {
                println!(
                    "{:>5}  {:<8}{}  {}",
                    view.id(),
                    if view.is_running() { "running" } else { "stopped" },
                    pending_label(view.pending),
                    view.task.task_name
                );
            }
        }
        Command::Start(id) => spawn_mutation(coordinator.clone(), id, true),
        Command::Stop(id) => spawn_mutation(coordinator.clone(), id, false),
        Command::Refresh => {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                match coordinator.refresh().await {
                    Ok(count) => println!("{count} tasks"),
                    Err(err) => println!("refresh failed: {err}"),
                }
            });
        }
        Command::Feed => {
            let entries = feed.entries();
            if entries.is_empty() {
                println!("feed empty");
            }
            for entry in entries {
                let price = entry
                    .item
                    .price
                    .map(|price| format!("{price:.2}"))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {}  {}  {}",
                    entry.id,
                    entry.received_at.format("%H:%M:%S"),
                    price,
                    entry.item.title
                );
            }
        }
        Command::Dismiss(id) => {
            if !feed.dismiss(&id) {
                println!("no feed entry {id}");
            }
        }
        Command::State => {
            println!(
                "{} (retries: {})",
                service.state().as_str(),
                service.retry_count()
            );
        }
        Command::Help => {
            println!("list | start <id> | stop <id> | refresh | feed | dismiss <entry> | state | quit");
        }
        Command::Quit => {}
    }
}

/// Run a start/stop in the background so the board shows the optimistic
/// value while the request is in flight.
fn spawn_mutation(coordinator: TaskCoordinator, id: i64, start: bool) {
    tokio::spawn(async move {
        let result = if start {
            coordinator.start_task(id).await
        } else {
            coordinator.stop_task(id).await
        };
        match result {
            Ok(()) => println!("task {id}: {}", if start { "started" } else { "stopped" }),
            Err(err) => println!("task {id}: {err}"),
        }
    });
}

fn pending_label(pending: PendingOperation) -> &'static str {
    match pending {
        PendingOperation::None => "",
        PendingOperation::Starting => " (starting)",
        PendingOperation::Stopping => " (stopping)",
    }
}

async fn log_state_changes(mut changes: watch::Receiver<ConnectionState>) {
    while changes.changed().await.is_ok() {
        let state = *changes.borrow_and_update();
        info!(event = "monitor_connection_state", state = state.as_str());
    }
}

fn load_config() -> Result<Config> {
    let args = Args::parse();
    let ws_url = resolve_url(&args.ws_url, "FLIP_WS_URL", DEFAULT_WS_URL)?;
    let api_url = resolve_url(&args.api_url, "FLIP_API_URL", DEFAULT_API_URL)?;
    Ok(Config {
        sync: SyncConfig::new(ws_url).with_env_overrides(),
        api_url,
        log_dir: flag_or_env(&args.log_dir, "FLIP_LOG_DIR")
            .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
        log_stdout: args.log_stdout || env_true("FLIP_LOG_STDOUT"),
    })
}

fn resolve_url(flag: &str, env_key: &str, default: &str) -> Result<Url> {
    let raw = flag_or_env(flag, env_key).unwrap_or_else(|| default.to_string());
    Url::parse(&raw).with_context(|| format!("invalid url {raw} ({env_key})"))
}

/// A non-blank flag wins, then a non-blank environment variable.
fn flag_or_env(flag: &str, env_key: &str) -> Option<String> {
    let flag = flag.trim();
    if !flag.is_empty() {
        return Some(flag.to_string());
    }
    std::env::var(env_key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) -> Option<PathBuf> {
    let level = std::env::var("FLIP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let log_file = open_log_file(&config.log_dir).unwrap_or_else(|err| {
        eprintln!("log_file_error: {err}");
        None
    });
    let path = log_file.as_ref().map(|(path, _)| path.clone());
    let has_file = log_file.is_some();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!has_file)
        .with_writer(log_writer(log_file.map(|(_, file)| file), config.log_stdout))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    path
}

/// Command output owns stdout, so console logs go to stderr unless stdout
/// logging was asked for. With a log file, the console only gets a copy on
/// request.
fn log_writer(file: Option<Arc<File>>, log_stdout: bool) -> BoxMakeWriter {
    match (file, log_stdout) {
        (Some(file), true) => BoxMakeWriter::new(file.and(io::stdout)),
        (Some(file), false) => BoxMakeWriter::new(file),
        (None, true) => BoxMakeWriter::new(io::stdout),
        (None, false) => BoxMakeWriter::new(io::stderr),
    }
}

/// Open today's log file under `log_dir`. An empty `log_dir` disables file
/// logging.
fn open_log_file(log_dir: &str) -> io::Result<Option<(PathBuf, Arc<File>)>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("flip-monitor-{}.log", Utc::now().format("%Y%m%d")));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(Some((path, Arc::new(file))))
}
