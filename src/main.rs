//! procrack: a process supervisor with a terminal dashboard.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, takes the single-instance lock and runs the main event
//! loop that connects the supervisor with the dashboard.

mod app;
mod channel;
mod config;
mod events;
mod focus;
mod keys;
mod lockfile;
mod mappings;
mod process;
mod pty;
mod render;
mod supervisor;
mod terminal;
mod tui;

use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;
use ratatui::layout::Rect;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::app::{App, AppAction};
use crate::channel::Subscription;
use crate::config::{apply_exclusions, find_default_config, load_config, Options};
use crate::events::{Event, ShutdownSignal};
use crate::lockfile::{Acquire, InstanceLock};
use crate::supervisor::{StartOptions, Supervisor, SupervisorOptions};
use crate::tui::TuiTerminal;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "procrack",
    version,
    about = "Process supervisor with a terminal dashboard",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    /// Config file (default: procrack.toml or .procrack.toml in the working directory)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Do not start autostart processes on launch
    #[arg(long)]
    no_auto: bool,

    /// Start processes without their dependencies
    #[arg(long)]
    no_deps: bool,

    /// Exclude process ids matching a wildcard pattern (`?`, `*`)
    #[arg(short, long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Extra parameter appended to every command
    #[arg(short, long = "param", value_name = "VALUE", allow_hyphen_values = true)]
    param: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref())?;
    init_tracing(&config_path)?;

    let config = load_config(&config_path)?;
    let definitions = apply_exclusions(config.definitions()?, &cli.exclude)?;
    if definitions.is_empty() {
        bail!("no processes defined in {}", config_path.display());
    }
    tracing::info!(config = %config_path.display(), processes = definitions.len(), "loaded config");

    let Some(lock) = acquire_lock(&config_path).await? else {
        std::process::exit(1);
    };

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let options = supervisor_options(&config.options, cli.param.clone());
    let supervisor = Supervisor::new(definitions, options, event_tx.clone());
    let app = App::new(supervisor.definitions());

    let mut terminal = tui::init_terminal().context("failed to set up terminal")?;
    spawn_stdin_listener(event_tx.clone());
    spawn_signal_listener(event_tx.clone());
    spawn_resize_listener(event_tx.clone());

    let result = run(&cli, &supervisor, app, &mut terminal, event_tx, event_rx).await;

    tui::restore_terminal(terminal)?;
    drop(lock);
    if let Err(err) = &result {
        tracing::error!(error = %err, "exiting after error");
    }
    result
}

async fn run(
    cli: &Cli,
    supervisor: &Supervisor,
    mut app: App,
    terminal: &mut TuiTerminal,
    event_tx: mpsc::UnboundedSender<Event>,
    mut event_rx: mpsc::UnboundedReceiver<Event>,
) -> Result<()> {
    let area = terminal.size()?;
    resize_processes(supervisor, area);

    let mut watched: Vec<Subscription> = Vec::new();
    if let Some(id) = app.selected_id().map(str::to_string) {
        watched = watch(supervisor, &mut app, &id, &event_tx);
    }

    if !cli.no_auto {
        let supervisor = supervisor.clone();
        let skip_dependencies = cli.no_deps;
        tokio::spawn(async move {
            supervisor.start_all_autostart(skip_dependencies).await;
        });
    }

    let tick_rate = Duration::from_millis(150);
    let mut ticker = tokio::time::interval(tick_rate);
    let mut dirty = true;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                dirty = true;
                match event {
                    Event::Status { id, update } => {
                        if let Some(action) = app.on_status(&id, &update) {
                            handle_app_action(action, cli, supervisor, &mut app, &mut watched, &event_tx);
                        }
                    }
                    Event::Buffer { id, change } => app.on_buffer(&id, &change),
                    Event::Title { id, title } => app.on_title(&id, &title),
                    Event::Scroll { id, change } => app.on_scroll(&id, &change),
                    Event::Input(bytes) => {
                        for action in app.handle_input(&bytes) {
                            if let AppAction::Quit = action {
                                shutdown(supervisor, &mut app, terminal).await?;
                                return Ok(());
                            }
                            handle_app_action(action, cli, supervisor, &mut app, &mut watched, &event_tx);
                        }
                    }
                    Event::Resize { width, height } => {
                        resize_processes(supervisor, Rect::new(0, 0, width, height));
                    }
                    Event::AllStopped => {
                        tracing::info!("all processes stopped, exiting");
                        return Ok(());
                    }
                    Event::Shutdown { signal } => {
                        tracing::info!(signal = signal.label(), "received shutdown signal");
                        shutdown(supervisor, &mut app, terminal).await?;
                        return Ok(());
                    }
                }
            }
            _ = ticker.tick() => {
                if app.tick(Instant::now()) {
                    dirty = true;
                }
            }
        }

        if dirty {
            tui::draw(&mut app, terminal)?;
            dirty = false;
        }
    }
}

/// Stops every process while the dashboard shows what is happening.
async fn shutdown(supervisor: &Supervisor, app: &mut App, terminal: &mut TuiTerminal) -> Result<()> {
    app.set_status_message("Stopping all processes");
    tui::draw(app, terminal)?;
    supervisor.stop_all().await;
    Ok(())
}

fn handle_app_action(
    action: AppAction,
    cli: &Cli,
    supervisor: &Supervisor,
    app: &mut App,
    watched: &mut Vec<Subscription>,
    event_tx: &mpsc::UnboundedSender<Event>,
) {
    match action {
        AppAction::Quit => {
            let _ = event_tx.send(Event::Shutdown {
                signal: ShutdownSignal::Interrupt,
            });
        }
        AppAction::Start(id) => {
            let opts = StartOptions {
                skip_dependencies: cli.no_deps,
                ..StartOptions::default()
            };
            tokio::spawn(supervisor.start_process(&id, opts));
        }
        AppAction::StartAll => {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start_all_stopped().await });
        }
        AppAction::Stop(id) => {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.stop_process(&id).await });
        }
        AppAction::StopAll => {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.stop_all().await });
        }
        AppAction::Write(id, bytes) => supervisor.write(&id, &bytes),
        AppAction::Scroll(id, request) => supervisor.scroll(&id, request),
        AppAction::Watch(id) => *watched = watch(supervisor, app, &id, event_tx),
    }
}

/// Subscribes to the terminal of `id` and loads its current state.
///
/// The returned subscriptions replace the previous ones; dropping those
/// disposes them.
fn watch(
    supervisor: &Supervisor,
    app: &mut App,
    id: &str,
    event_tx: &mpsc::UnboundedSender<Event>,
) -> Vec<Subscription> {
    let buffer = {
        let tx = event_tx.clone();
        let owner = id.to_string();
        supervisor.on_buffer_change(id, move |change| {
            let _ = tx.send(Event::Buffer {
                id: owner.clone(),
                change: change.clone(),
            });
        })
    };
    let title = {
        let tx = event_tx.clone();
        let owner = id.to_string();
        supervisor.on_title_change(id, move |change| {
            let _ = tx.send(Event::Title {
                id: owner.clone(),
                title: change.title.clone(),
            });
        })
    };
    let scroll = {
        let tx = event_tx.clone();
        let owner = id.to_string();
        supervisor.on_scroll(id, move |change| {
            let _ = tx.send(Event::Scroll {
                id: owner.clone(),
                change: *change,
            });
        })
    };
    app.load_snapshot(supervisor.snapshot(id));
    vec![buffer, title, scroll]
}

fn resize_processes(supervisor: &Supervisor, area: Rect) {
    let (cols, rows) = tui::log_size(area);
    supervisor.resize(cols, rows);
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            bail!("config file {} not found", path.display());
        }
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    match find_default_config(&cwd) {
        Some(path) => Ok(path),
        None => bail!(
            "no {} found in {}",
            config::DEFAULT_CONFIG_FILES.join(" or "),
            cwd.display()
        ),
    }
}

fn log_path(config: &Path) -> PathBuf {
    config
        .parent()
        .map(|dir| dir.join("procrack.log"))
        .unwrap_or_else(|| PathBuf::from("procrack.log"))
}

fn init_tracing(config: &Path) -> Result<()> {
    let path = log_path(config);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(log_file))
        .init();
    Ok(())
}

/// Takes the instance lock, asking before replacing a running instance.
///
/// Returns `None` when the operator declined.
async fn acquire_lock(config: &Path) -> Result<Option<InstanceLock>> {
    match lockfile::try_acquire(config)? {
        Acquire::Acquired(lock) => Ok(Some(lock)),
        Acquire::Held { pid } => {
            let question = format!(
                "procrack is already running for {} (pid {pid}). Terminate it? [y/N] ",
                config.display()
            );
            if !confirm(&question)? {
                tracing::info!(pid, "declined to replace running instance");
                return Ok(None);
            }
            lockfile::take_over(config, pid).await.map(Some)
        }
    }
}

fn confirm(question: &str) -> Result<bool> {
    let mut stdout = std::io::stdout();
    stdout.write_all(question.as_bytes())?;
    stdout.flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn supervisor_options(options: &Options, params: Vec<String>) -> SupervisorOptions {
    let defaults = SupervisorOptions::default();
    SupervisorOptions {
        params,
        exit_when_all_stopped: options.exit_when_all_stopped.unwrap_or_default(),
        kill_timeout: options
            .kill_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.kill_timeout),
        restart_delay: options
            .restart_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.restart_delay),
        scrollback: options.scrollback.unwrap_or(defaults.scrollback),
    }
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Event::Shutdown { signal: ShutdownSignal::Interrupt });
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Event::Shutdown { signal: ShutdownSignal::Terminate });
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Event::Shutdown {
                signal: ShutdownSignal::Interrupt,
            });
        }
    });
}

/// Forwards window size changes; without SIGWINCH the size is polled.
fn spawn_resize_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut winch) = signal(SignalKind::window_change()) else {
                return;
            };
            while winch.recv().await.is_some() {
                if let Ok((width, height)) = crossterm::terminal::size() {
                    if tx.send(Event::Resize { width, height }).is_err() {
                        break;
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let mut last = crossterm::terminal::size().ok();
            let mut interval = tokio::time::interval(Duration::from_millis(250));
            loop {
                interval.tick().await;
                let current = crossterm::terminal::size().ok();
                if current != last {
                    last = current;
                    if let Some((width, height)) = current {
                        if tx.send(Event::Resize { width, height }).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });
}

fn spawn_stdin_listener(tx: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Event::Input(buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
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
