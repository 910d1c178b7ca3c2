//! testrack: watches project directories and runs their tests on change.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, and either serves a UI over stdin/stdout or
//! runs one of the one-shot commands.

mod app;
mod config;
mod events;
mod ipc;
mod project;
mod registry;
mod runner;
mod store;
mod watch;

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::{App, Flow};
use crate::config::Config;
use crate::events::Event;
use crate::ipc::{Outbox, Request};
use crate::project::{Project, RunStats, TestResults};
use crate::runner::{MochaRunner, TestRunner};
use crate::store::{JsonFileStore, ProjectStore};
use crate::watch::{NotifyWatcherFactory, WatchOptions};

const DEFAULT_DEBOUNCE_MS: u64 = 200;
const CHANNEL_CAPACITY: usize = 256;
/// How long pending UI messages may take to flush on exit.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "testrack",
    version,
    about = "Watches project directories and runs their Mocha tests on change",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to testrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any testrack.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Path of the project store file.
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    /// Test command (e.g. "npx mocha --reporter json").
    #[arg(long, global = true)]
    runner: Option<String>,
    /// Debounce window for file changes (ms).
    #[arg(long)]
    debounce_ms: Option<u64>,
    /// Extra glob patterns to ignore when watching.
    #[arg(long)]
    ignore: Vec<String>,
    /// Do not apply .gitignore rules when watching.
    #[arg(long)]
    no_gitignore: bool,
    /// Keep watching after the UI disconnects.
    #[arg(long)]
    keep_alive: bool,
    /// Project directory to watch at startup (repeatable).
    #[arg(long)]
    watch: Vec<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Serve a UI over stdin/stdout (default).
    Serve,
    /// List stored projects and their last run.
    Projects,
    /// Run the tests of one project once and store the result.
    Run {
        /// Project directory.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let settings = load_settings(&cli)?;
    match cli.command.clone().unwrap_or(Commands::Serve) {
        Commands::Serve => serve(settings).await,
        Commands::Projects => list_projects(settings).await,
        Commands::Run { path } => run_once(settings, &path).await,
    }
}

/// Initializes the logging subsystem. Stdout carries the UI channel, so logs go to stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();
}

async fn serve(settings: RunSettings) -> Result<()> {
    let store = Arc::new(JsonFileStore::new(&settings.store_path));
    let runner = Arc::new(settings.runner.clone());
    let factory = NotifyWatcherFactory::new(settings.watch_options.clone());

    let (event_tx, mut event_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (outbox, outbox_rx) = Outbox::channel(CHANNEL_CAPACITY);
    let writer = ipc::spawn_message_writer(tokio::io::stdout(), outbox_rx);
    ipc::spawn_request_reader(BufReader::new(std::io::stdin()), event_tx.clone());
    spawn_signal_listener(event_tx.clone());

    let mut app = App::new(
        store,
        runner,
        factory,
        outbox,
        event_tx,
        settings.quit_on_all_windows_closed,
    );
    for path in &settings.watch {
        app.handle_event(Event::Request(Request::WatchDirectory(path.clone())))
            .await;
    }
    info!(
        store = %settings.store_path.display(),
        runner = %settings.runner.command_line(),
        watching = app.registry().len(),
        "testrack ready"
    );

    while let Some(event) = event_rx.recv().await {
        if app.handle_event(event).await == Flow::Quit {
            break;
        }
    }

    // In-flight runs may still hold outbox clones, so only wait briefly.
    drop(app);
    let _ = tokio::time::timeout(FLUSH_TIMEOUT, writer).await;
    Ok(())
}

async fn list_projects(settings: RunSettings) -> Result<()> {
    let store = JsonFileStore::new(&settings.store_path);
    let projects = store
        .projects()
        .await
        .with_context(|| format!("failed to read {}", store.path().display()))?;
    if projects.is_empty() {
        println!("no projects in {}", store.path().display());
        return Ok(());
    }
    for project in &projects {
        println!("{}", format_project(project));
    }
    Ok(())
}

async fn run_once(settings: RunSettings, path: &Path) -> Result<()> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    let store = JsonFileStore::new(&settings.store_path);
    let report = settings
        .runner
        .run(&path)
        .await
        .with_context(|| format!("tests for {} did not run", path.display()))?;
    let results = TestResults::new(&path, report, Utc::now());
    store
        .update_project(&path, results.record())
        .await
        .with_context(|| format!("failed to update {}", store.path().display()))?;

    let stats = &results.report.stats;
    println!("{}  {}", path.display(), format_stats(stats));
    for failure in &results.report.failures {
        println!("  failed: {}", failure.full_title);
    }
    if !stats.is_green() {
        bail!("{} of {} tests failed", stats.failures, stats.tests);
    }
    Ok(())
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(Event::Shutdown).await;
    });
}

fn load_settings(cli: &Cli) -> Result<RunSettings> {
    let config = if cli.no_config {
        Config::default()
    } else {
        match cli.config.clone().or_else(config::default_config_path) {
            Some(path) => config::load_config(&path)?,
            None => Config::default(),
        }
    };
    RunSettings::from_cli(cli, config)
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    runner: MochaRunner,
    store_path: PathBuf,
    watch: Vec<PathBuf>,
    watch_options: WatchOptions,
    quit_on_all_windows_closed: bool,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: Config) -> Result<Self> {
        let command_line = cli
            .runner
            .clone()
            .or(config.runner)
            .unwrap_or_else(|| MochaRunner::DEFAULT_COMMAND.to_string());
        let runner =
            MochaRunner::from_command_line(&command_line, config.runner_env.unwrap_or_default())?;
        let store_path = cli
            .store
            .clone()
            .or(config.store)
            .or_else(store::default_store_path)
            .ok_or_else(|| anyhow!("cannot determine a data directory, pass --store"))?;

        let mut watch = config.watch.unwrap_or_default();
        watch.extend(cli.watch.iter().cloned());
        let mut ignore = config.watch_ignore.unwrap_or_default();
        ignore.extend(cli.ignore.iter().cloned());
        let skip_gitignore = cli.no_gitignore || config.watch_ignore_gitignore.unwrap_or(false);
        let debounce_ms = cli
            .debounce_ms
            .or(config.watch_debounce_ms)
            .unwrap_or(DEFAULT_DEBOUNCE_MS);
        let quit_on_all_windows_closed = if cli.keep_alive {
            false
        } else {
            config.quit_on_all_windows_closed.unwrap_or(true)
        };

        Ok(Self {
            runner,
            store_path,
            watch,
            watch_options: WatchOptions {
                ignore,
                use_gitignore: !skip_gitignore,
                debounce: Duration::from_millis(debounce_ms),
            },
            quit_on_all_windows_closed,
        })
    }
}

fn format_stats(stats: &RunStats) -> String {
    let mut text = format!(
        "{} passing, {} failing, {} pending",
        stats.passes, stats.failures, stats.pending
    );
    if let Some(duration) = stats.duration {
        text.push_str(&format!(" ({}ms)", duration));
    }
    text
}

fn format_project(project: &Project) -> String {
    match (&project.stats, project.updated_at) {
        (Some(stats), Some(at)) => format!(
            "{}  {}  [{}]",
            project.path.display(),
            format_stats(stats),
            at.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        (Some(stats), None) => format!("{}  {}", project.path.display(), format_stats(stats)),
        _ => format!("{}  never run", project.path.display()),
    }
}
