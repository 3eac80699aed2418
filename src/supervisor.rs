//! Process supervision.
//!
//! The `Supervisor` owns every process definition and, once a process has
//! been spawned, its runtime record: the pty handle, the terminal emulator
//! fed by the pty output, and the last exit. It resolves dependencies,
//! applies restart policies, forwards input and publishes status updates to
//! the application event channel. Terminal changes are published per process
//! on `EventChannel`s.
//!
//! The handle is cheap to clone; all clones share one state behind a mutex
//! that is never held across an await point.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use portable_pty::{Child, ChildKiller, MasterPty};
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinSet};

use crate::channel::{EventChannel, Subscription};
use crate::config::ExitWhenAllStopped;
use crate::events::Event;
use crate::process::{ProcessDefinition, ProcessFailure, StatusUpdate};
use crate::pty::{self, ProcessSignal, TerminalSize};
use crate::render::RenderedBuffer;
use crate::terminal::{ScrollRequest, TerminalEmulator, Viewport};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Supervisor-wide settings.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Extra parameters appended to every command that accepts them.
    pub params: Vec<String>,
    pub exit_when_all_stopped: ExitWhenAllStopped,
    /// Grace period between SIGTERM and SIGKILL.
    pub kill_timeout: Duration,
    pub restart_delay: Duration,
    pub scrollback: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            exit_when_all_stopped: ExitWhenAllStopped::Never,
            kill_timeout: Duration::from_millis(800),
            restart_delay: Duration::ZERO,
            scrollback: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    pub is_restart: bool,
    pub is_dependency: bool,
    pub skip_dependencies: bool,
}

/// The rendered terminal of a process after new output.
#[derive(Debug, Clone)]
pub struct BufferChange {
    pub buffer: Arc<RenderedBuffer>,
    /// Lines held by the terminal, scrollback included.
    pub length: usize,
}

#[derive(Debug, Clone)]
pub struct TitleChange {
    pub title: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ScrollChange {
    pub viewport: Viewport,
    pub length: usize,
}

/// Terminal event channels of one process; they survive restarts.
#[derive(Default)]
pub struct ProcessEvents {
    pub buffer: EventChannel<BufferChange>,
    pub title: EventChannel<TitleChange>,
    pub scroll: EventChannel<ScrollChange>,
}

/// Current terminal contents of a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    pub buffer: Arc<RenderedBuffer>,
    pub title: String,
    pub length: usize,
    pub viewport: Viewport,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no process with id {0}")]
    UnknownProcess(String),
    #[error("{0} has an empty command")]
    EmptyCommand(String),
    #[error("failed to start {id}")]
    Spawn {
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("{id} exited with code {code}")]
    WaitFailed { id: String, code: i32 },
    #[error("{id} exited before reporting a status")]
    ExitLost { id: String },
    #[error("spawn task failed")]
    Task(#[from] task::JoinError),
}

impl SupervisorError {
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorError::UnknownProcess(_) => "UnknownProcessError",
            SupervisorError::EmptyCommand(_) => "CommandError",
            SupervisorError::Spawn { .. } => "SpawnError",
            SupervisorError::WaitFailed { .. } | SupervisorError::ExitLost { .. } => "WaitError",
            SupervisorError::Task(_) => "TaskError",
        }
    }

    pub fn to_failure(&self) -> ProcessFailure {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            causes.push(err.to_string());
            source = err.source();
        }
        ProcessFailure {
            name: self.name().to_string(),
            message: self.to_string(),
            detail: causes.join("\n"),
        }
    }
}

/// Supervises the configured processes.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

struct Shared {
    definitions: Vec<ProcessDefinition>,
    index: HashMap<String, usize>,
    events: HashMap<String, Arc<ProcessEvents>>,
    options: SupervisorOptions,
    event_tx: mpsc::UnboundedSender<Event>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    size: TerminalSize,
    runtimes: HashMap<String, ProcessRuntime>,
    /// Starts in flight, keyed by id; receivers flip to true once settled.
    starting: HashMap<String, (u64, watch::Receiver<bool>)>,
    next_token: u64,
    /// Running autostart or start-all passes.
    batches: usize,
}

struct ProcessRuntime {
    generation: u64,
    handle: Option<ProcessHandle>,
    screen: Arc<Mutex<Screen>>,
    exit_code: Option<i32>,
    signal: Option<String>,
    last_signal: Option<ProcessSignal>,
    stopped_by_user: bool,
    is_dependency: bool,
    exited: watch::Sender<Option<i32>>,
}

struct ProcessHandle {
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

/// Emulator plus the last rendering, shared with the pty reader thread.
struct Screen {
    emulator: TerminalEmulator,
    buffer: Arc<RenderedBuffer>,
    length: usize,
    viewport: Viewport,
}

impl Screen {
    fn new(emulator: TerminalEmulator) -> Self {
        let mut screen = Self {
            emulator,
            buffer: Arc::default(),
            length: 0,
            viewport: Viewport::default(),
        };
        screen.refresh();
        screen
    }

    fn refresh(&mut self) -> BufferChange {
        self.buffer = Arc::new(self.emulator.render());
        self.length = self.emulator.content_length();
        self.viewport = self.emulator.viewport();
        BufferChange {
            buffer: Arc::clone(&self.buffer),
            length: self.length,
        }
    }

    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            buffer: Arc::clone(&self.buffer),
            title: self.emulator.title().to_string(),
            length: self.length,
            viewport: self.viewport,
        }
    }
}

enum Claim {
    Start(StartGuard),
    Wait(watch::Receiver<bool>),
    Skip,
}

/// Marks a start as in flight until dropped.
struct StartGuard {
    shared: Arc<Shared>,
    id: String,
    token: u64,
    done: watch::Sender<bool>,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.shared.state);
        if matches!(state.starting.get(&self.id), Some((token, _)) if *token == self.token) {
            state.starting.remove(&self.id);
        }
        let settled = state.starting.is_empty() && state.batches == 0;
        drop(state);
        let _ = self.done.send(true);
        // The last exit may have been seen while this start was in flight.
        if settled {
            let supervisor = Supervisor {
                shared: Arc::clone(&self.shared),
            };
            supervisor.check_all_stopped();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    pub fn new(
        definitions: Vec<ProcessDefinition>,
        options: SupervisorOptions,
        event_tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let index = definitions
            .iter()
            .enumerate()
            .map(|(idx, definition)| (definition.id.clone(), idx))
            .collect();
        let events = definitions
            .iter()
            .map(|definition| (definition.id.clone(), Arc::new(ProcessEvents::default())))
            .collect();
        Self {
            shared: Arc::new(Shared {
                definitions,
                index,
                events,
                options,
                event_tx,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn definitions(&self) -> &[ProcessDefinition] {
        &self.shared.definitions
    }

    pub fn definition(&self, id: &str) -> Option<&ProcessDefinition> {
        self.shared
            .index
            .get(id)
            .and_then(|idx| self.shared.definitions.get(*idx))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.shared.state)
    }

    /// Starts one process, resolving its dependencies first.
    ///
    /// Failures never propagate: they are published as an error status.
    pub fn start_process(&self, id: &str, opts: StartOptions) -> BoxFuture {
        self.start_with_path(id.to_string(), opts, Arc::new(Vec::new()))
    }

    fn start_with_path(&self, id: String, opts: StartOptions, path: Arc<Vec<String>>) -> BoxFuture {
        let this = self.clone();
        Box::pin(async move {
            if let Err(err) = this.try_start(&id, opts, path).await {
                tracing::warn!(process = %id, error = %err, "start failed");
                this.publish(&id, StatusUpdate::Failed(err.to_failure()));
            }
        })
    }

    async fn try_start(
        &self,
        id: &str,
        opts: StartOptions,
        path: Arc<Vec<String>>,
    ) -> Result<(), SupervisorError> {
        let definition = self
            .definition(id)
            .cloned()
            .ok_or_else(|| SupervisorError::UnknownProcess(id.to_string()))?;

        let guard = loop {
            match self.claim_start(id, opts.is_dependency) {
                Claim::Start(guard) => break guard,
                Claim::Wait(mut settled) => {
                    tracing::debug!(process = %id, "waiting for start already in flight");
                    let _ = settled.wait_for(|done| *done).await;
                    // A restart still owes a spawn once the earlier start settled.
                    if !opts.is_restart {
                        return Ok(());
                    }
                }
                Claim::Skip => {
                    tracing::debug!(process = %id, "already started");
                    return Ok(());
                }
            }
        };

        if opts.is_restart {
            self.publish(id, starting(true, false, false));
        }
        if !definition.delay.is_zero() {
            self.publish(id, starting(false, true, false));
            tokio::time::sleep(definition.delay).await;
        }

        let deps = if opts.skip_dependencies {
            Vec::new()
        } else {
            self.resolve_dependencies(&definition, &path)
        };
        if !deps.is_empty() {
            self.publish(id, starting(false, false, true));
            let mut chain = path.as_ref().clone();
            chain.push(id.to_string());
            let chain = Arc::new(chain);
            let mut pending = JoinSet::new();
            for dep in deps {
                let dep_opts = StartOptions {
                    is_dependency: true,
                    ..StartOptions::default()
                };
                pending.spawn(self.start_with_path(dep, dep_opts, Arc::clone(&chain)));
            }
            while pending.join_next().await.is_some() {}
        }

        self.publish(id, starting(false, false, false));
        let mut exited = self.spawn(&definition, opts.is_dependency).await?;
        // Spawned: a restart of this id must be able to claim a new start.
        drop(guard);

        if definition.wait {
            let code = match exited.wait_for(Option::is_some).await {
                Ok(code) => *code,
                Err(_) => None,
            };
            match code {
                Some(0) => {}
                Some(code) if self.restart_scheduled(id, code) => {
                    tracing::debug!(process = %id, code, "wait failure superseded by restart");
                }
                Some(code) => {
                    return Err(SupervisorError::WaitFailed {
                        id: id.to_string(),
                        code,
                    })
                }
                None => return Err(SupervisorError::ExitLost { id: id.to_string() }),
            }
        }
        Ok(())
    }

    /// Whether the exit with `code` already queued a restart of `id`.
    fn restart_scheduled(&self, id: &str, code: i32) -> bool {
        let stopped_by_user = self
            .state()
            .runtimes
            .get(id)
            .is_some_and(|runtime| runtime.stopped_by_user);
        self.definition(id)
            .is_some_and(|definition| definition.restart.should_restart(stopped_by_user, code))
    }

    fn claim_start(&self, id: &str, is_dependency: bool) -> Claim {
        let mut state = self.state();
        if let Some((_, settled)) = state.starting.get(id) {
            return Claim::Wait(settled.clone());
        }
        if let Some(runtime) = state.runtimes.get(id) {
            if runtime.handle.is_some() || is_dependency {
                return Claim::Skip;
            }
        }
        let token = state.next_token;
        state.next_token += 1;
        let (done, settled) = watch::channel(false);
        state.starting.insert(id.to_string(), (token, settled));
        Claim::Start(StartGuard {
            shared: Arc::clone(&self.shared),
            id: id.to_string(),
            token,
            done,
        })
    }

    fn resolve_dependencies(&self, definition: &ProcessDefinition, path: &[String]) -> Vec<String> {
        definition
            .deps
            .iter()
            .filter(|dep| {
                if self.definition(dep).is_none() {
                    tracing::debug!(process = %definition.id, dependency = %dep, "unknown dependency skipped");
                    return false;
                }
                if *dep == &definition.id || path.contains(dep) {
                    tracing::warn!(process = %definition.id, dependency = %dep, "dependency cycle skipped");
                    return false;
                }
                true
            })
            .cloned()
            .collect()
    }

    async fn spawn(
        &self,
        definition: &ProcessDefinition,
        is_dependency: bool,
    ) -> Result<watch::Receiver<Option<i32>>, SupervisorError> {
        let id = definition.id.clone();
        let size = self.state().size;
        let spec = definition
            .spawn_spec(&self.shared.options.params, size)
            .ok_or_else(|| SupervisorError::EmptyCommand(id.clone()))?;
        let emulator = TerminalEmulator::new(size.cols, size.rows, self.shared.options.scrollback)
            .map_err(|err| SupervisorError::Spawn {
                id: id.clone(),
                source: err.into(),
            })?;

        tracing::info!(process = %id, command = %definition.command.display(), "spawning");
        let spawned = task::spawn_blocking(move || pty::spawn_pty(spec))
            .await?
            .map_err(|err| SupervisorError::Spawn {
                id: id.clone(),
                source: err.into(),
            })?;

        let screen = Arc::new(Mutex::new(Screen::new(emulator)));
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = watch::channel(None);
        let pid = spawned.pid;
        let generation = {
            let mut state = self.state();
            let generation = state
                .runtimes
                .get(&id)
                .map(|runtime| runtime.generation + 1)
                .unwrap_or(0);
            let runtime = ProcessRuntime {
                generation,
                handle: Some(ProcessHandle {
                    pid,
                    master: spawned.master,
                    stdin_tx,
                    killer: spawned.killer,
                }),
                screen: Arc::clone(&screen),
                exit_code: None,
                signal: None,
                last_signal: None,
                stopped_by_user: false,
                is_dependency,
                exited: exited_tx,
            };
            if let Some(previous) = state.runtimes.insert(id.clone(), runtime) {
                lock(&previous.screen).emulator.dispose();
            }
            generation
        };

        if let Some(events) = self.events(&id) {
            let reader_screen = Arc::clone(&screen);
            pty::spawn_read_loop(spawned.reader, move |chunk| {
                forward_output(&reader_screen, &events, chunk)
            });
        }
        pty::spawn_write_loop(spawned.writer, stdin_rx);
        self.watch_exit(id.clone(), generation, spawned.child);

        tracing::info!(process = %id, pid = ?pid, "running");
        self.publish(&id, StatusUpdate::Running { pid });
        if let Some(url) = &definition.url {
            open_url_later(url.clone(), definition.url_delay);
        }
        Ok(exited_rx)
    }

    fn watch_exit(&self, id: String, generation: u64, mut child: Box<dyn Child + Send + Sync>) {
        let this = self.clone();
        tokio::spawn(async move {
            let code = match task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(status)) => i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
                Ok(Err(err)) => {
                    tracing::warn!(process = %id, error = %err, "failed to wait for process");
                    -1
                }
                Err(err) => {
                    tracing::warn!(process = %id, error = %err, "exit watcher failed");
                    -1
                }
            };
            this.on_exit(&id, generation, code);
        });
    }

    fn on_exit(&self, id: &str, generation: u64, code: i32) {
        let (stopped_by_user, signal) = {
            let mut state = self.state();
            let Some(runtime) = state.runtimes.get_mut(id) else {
                return;
            };
            if runtime.generation != generation {
                tracing::debug!(process = %id, "exit of a replaced process ignored");
                return;
            }
            runtime.handle = None;
            runtime.exit_code = Some(code);
            runtime.signal = runtime.last_signal.map(|signal| signal.label().to_string());
            let _ = runtime.exited.send(Some(code));
            (runtime.stopped_by_user, runtime.signal.clone())
        };

        tracing::info!(process = %id, code, stopped_by_user, "exited");
        self.publish(
            id,
            StatusUpdate::Exited {
                code,
                signal,
                stopped_by_user,
            },
        );

        let restart = self
            .definition(id)
            .map(|definition| definition.restart.should_restart(stopped_by_user, code))
            .unwrap_or(false);
        if restart {
            self.schedule_restart(id.to_string());
        } else {
            self.check_all_stopped();
        }
    }

    fn schedule_restart(&self, id: String) {
        let this = self.clone();
        let delay = self.shared.options.restart_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let cancelled = this
                .state()
                .runtimes
                .get(&id)
                .map(|runtime| runtime.stopped_by_user)
                .unwrap_or(false);
            if cancelled {
                tracing::debug!(process = %id, "restart cancelled by stop");
                return;
            }
            tracing::info!(process = %id, "restarting");
            let opts = StartOptions {
                is_restart: true,
                ..StartOptions::default()
            };
            this.start_process(&id, opts).await;
        });
    }

    fn check_all_stopped(&self) {
        let mode = self.shared.options.exit_when_all_stopped;
        if mode == ExitWhenAllStopped::Never {
            return;
        }
        let state = self.state();
        if state.batches > 0 || !state.starting.is_empty() || state.runtimes.is_empty() {
            return;
        }
        if state.runtimes.values().any(|runtime| runtime.handle.is_some()) {
            return;
        }
        let has_errors = state.runtimes.values().any(|runtime| {
            !runtime.stopped_by_user && runtime.exit_code.is_some_and(|code| code != 0)
        });
        drop(state);
        if mode == ExitWhenAllStopped::Always || !has_errors {
            tracing::info!(has_errors, "all processes stopped");
            let _ = self.shared.event_tx.send(Event::AllStopped);
        }
    }

    /// Marks every autostart process waiting, then starts them one by one.
    pub async fn start_all_autostart(&self, skip_dependencies: bool) {
        let ids: Vec<String> = self
            .shared
            .definitions
            .iter()
            .filter(|definition| definition.autostart)
            .map(|definition| definition.id.clone())
            .collect();
        for id in &ids {
            self.publish(id, starting(false, false, true));
        }
        let opts = StartOptions {
            skip_dependencies,
            ..StartOptions::default()
        };
        self.run_batch(ids, opts, true).await;
    }

    /// Starts every process that is not running, one by one.
    pub async fn start_all_stopped(&self) {
        let ids: Vec<String> = {
            let state = self.state();
            self.shared
                .definitions
                .iter()
                .filter(|definition| {
                    !state.starting.contains_key(&definition.id)
                        && state
                            .runtimes
                            .get(&definition.id)
                            .map_or(true, |runtime| runtime.handle.is_none())
                })
                .map(|definition| definition.id.clone())
                .collect()
        };
        self.run_batch(ids, StartOptions::default(), false).await;
    }

    async fn run_batch(&self, ids: Vec<String>, opts: StartOptions, skip_started: bool) {
        self.state().batches += 1;
        for id in ids {
            // Already brought up as a dependency of an earlier entry.
            let started = skip_started
                && self
                    .state()
                    .runtimes
                    .get(&id)
                    .is_some_and(|runtime| runtime.is_dependency);
            if started {
                continue;
            }
            self.start_process(&id, opts).await;
        }
        self.state().batches -= 1;
        self.check_all_stopped();
    }

    /// Stops a process and its children, resolving once it has exited.
    pub async fn stop_process(&self, id: &str) {
        let exited = {
            let mut state = self.state();
            match state.runtimes.get_mut(id) {
                Some(runtime) if runtime.handle.is_some() => {
                    runtime.stopped_by_user = true;
                    Some(runtime.exited.subscribe())
                }
                other => {
                    if let Some(runtime) = other {
                        runtime.stopped_by_user = true;
                    }
                    None
                }
            }
        };
        let Some(mut exited) = exited else {
            self.publish(
                id,
                StatusUpdate::Exited {
                    code: -1,
                    signal: None,
                    stopped_by_user: false,
                },
            );
            return;
        };

        self.publish(id, StatusUpdate::Stopping);
        self.signal(id, ProcessSignal::Term);
        let timeout = self.shared.options.kill_timeout;
        if wait_exited(&mut exited, timeout).await {
            return;
        }
        tracing::warn!(process = %id, "did not exit after SIGTERM, killing");
        self.signal(id, ProcessSignal::Kill);
        if !wait_exited(&mut exited, timeout.max(Duration::from_secs(2))).await {
            tracing::warn!(process = %id, "still running after SIGKILL");
        }
    }

    fn signal(&self, id: &str, signal: ProcessSignal) {
        let mut state = self.state();
        let Some(runtime) = state.runtimes.get_mut(id) else {
            return;
        };
        let Some(handle) = runtime.handle.as_mut() else {
            return;
        };
        runtime.last_signal = Some(signal);
        tracing::info!(process = %id, signal = signal.label(), "signalling");
        pty::signal_tree(handle.pid, handle.killer.as_mut(), signal);
    }

    /// Stops every process that has not exited, in parallel.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .state()
            .runtimes
            .iter()
            .filter(|(_, runtime)| runtime.exit_code.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        let mut pending = JoinSet::new();
        for id in ids {
            let this = self.clone();
            pending.spawn(async move { this.stop_process(&id).await });
        }
        while pending.join_next().await.is_some() {}
    }

    /// Applies a new viewport size to every terminal and future spawns.
    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let size = TerminalSize { cols, rows };
        let mut changes = Vec::new();
        {
            let mut state = self.state();
            state.size = size;
            for (id, runtime) in state.runtimes.iter() {
                if let Some(handle) = &runtime.handle {
                    if let Err(err) = handle.master.resize(size.to_pty_size()) {
                        tracing::warn!(process = %id, error = %err, "pty resize failed");
                    }
                }
                let mut screen = lock(&runtime.screen);
                if screen.emulator.resize(cols, rows).is_ok() {
                    let change = screen.refresh();
                    let scroll = ScrollChange {
                        viewport: screen.viewport,
                        length: screen.length,
                    };
                    changes.push((id.clone(), change, scroll));
                }
            }
        }
        for (id, change, scroll) in changes {
            if let Some(events) = self.events(&id) {
                events.scroll.emit(&scroll);
                events.buffer.emit(&change);
            }
        }
    }

    /// Forwards input to a live process; dropped otherwise.
    pub fn write(&self, id: &str, bytes: &[u8]) {
        let state = self.state();
        if let Some(handle) = state.runtimes.get(id).and_then(|r| r.handle.as_ref()) {
            let _ = handle.stdin_tx.send(bytes.to_vec());
        }
    }

    /// Scrolls the terminal of `id` and publishes the new viewport.
    pub fn scroll(&self, id: &str, request: ScrollRequest) {
        let Some(screen) = self
            .state()
            .runtimes
            .get(id)
            .map(|runtime| Arc::clone(&runtime.screen))
        else {
            return;
        };
        let (scroll, change) = {
            let mut screen = lock(&screen);
            let viewport = screen.emulator.scroll(request);
            let change = screen.refresh();
            (
                ScrollChange {
                    viewport,
                    length: change.length,
                },
                change,
            )
        };
        if let Some(events) = self.events(id) {
            events.scroll.emit(&scroll);
            events.buffer.emit(&change);
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<ProcessSnapshot> {
        let screen = self
            .state()
            .runtimes
            .get(id)
            .map(|runtime| Arc::clone(&runtime.screen))?;
        let snapshot = lock(&screen).snapshot();
        Some(snapshot)
    }

    /// Whether `id` was last started only as a dependency of another process.
    #[cfg(test)]
    pub fn is_dependency(&self, id: &str) -> bool {
        self.state()
            .runtimes
            .get(id)
            .is_some_and(|runtime| runtime.is_dependency)
    }

    pub fn on_buffer_change<F>(&self, id: &str, listener: F) -> Subscription
    where
        F: Fn(&BufferChange) + Send + Sync + 'static,
    {
        match self.events_or_log(id) {
            Some(events) => events.buffer.subscribe(listener),
            None => Subscription::noop(),
        }
    }

    pub fn on_title_change<F>(&self, id: &str, listener: F) -> Subscription
    where
        F: Fn(&TitleChange) + Send + Sync + 'static,
    {
        match self.events_or_log(id) {
            Some(events) => events.title.subscribe(listener),
            None => Subscription::noop(),
        }
    }

    pub fn on_scroll<F>(&self, id: &str, listener: F) -> Subscription
    where
        F: Fn(&ScrollChange) + Send + Sync + 'static,
    {
        match self.events_or_log(id) {
            Some(events) => events.scroll.subscribe(listener),
            None => Subscription::noop(),
        }
    }

    fn events(&self, id: &str) -> Option<Arc<ProcessEvents>> {
        self.shared.events.get(id).cloned()
    }

    fn events_or_log(&self, id: &str) -> Option<Arc<ProcessEvents>> {
        let events = self.events(id);
        if events.is_none() {
            tracing::warn!(process = %id, "no process with id");
        }
        events
    }

    fn publish(&self, id: &str, update: StatusUpdate) {
        tracing::debug!(process = %id, ?update, "status");
        let _ = self.shared.event_tx.send(Event::Status {
            id: id.to_string(),
            update,
        });
    }
}

fn starting(restart: bool, delayed: bool, waiting: bool) -> StatusUpdate {
    StatusUpdate::Starting {
        restart,
        delayed,
        waiting,
    }
}

// Runs on the pty reader thread; returns false once the terminal was replaced.
fn forward_output(screen: &Mutex<Screen>, events: &ProcessEvents, chunk: &[u8]) -> bool {
    let (update, change) = {
        let mut screen = lock(screen);
        if screen.emulator.is_disposed() {
            return false;
        }
        let update = screen.emulator.process(chunk);
        let change = screen.refresh();
        (update, change)
    };
    if let Some(viewport) = update.viewport {
        events.scroll.emit(&ScrollChange {
            viewport,
            length: change.length,
        });
    }
    if let Some(title) = update.title {
        events.title.emit(&TitleChange { title });
    }
    events.buffer.emit(&change);
    true
}

async fn wait_exited(exited: &mut watch::Receiver<Option<i32>>, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, exited.wait_for(Option::is_some)).await,
        Ok(Ok(_))
    )
}

fn open_url_later(url: String, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let mut command = browser_command(&url);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Err(err) = command.status().await {
            tracing::warn!(url = %url, error = %err, "failed to open url");
        }
    });
}

#[cfg(target_os = "macos")]
fn browser_command(url: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("open");
    command.arg(url);
    command
}

#[cfg(windows)]
fn browser_command(url: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("cmd");
    command.args(["/C", "start", "", url]);
    command
}

#[cfg(all(unix, not(target_os = "macos")))]
fn browser_command(url: &str) -> tokio::process::Command {
    let mut command = tokio::process::Command::new("xdg-open");
    command.arg(url);
    command
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{Command, RestartPolicy};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::timeout;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

    fn shell(id: &str, script: &str) -> ProcessDefinition {
        ProcessDefinition::new(id, Command::Shell(script.to_string()))
    }

    fn supervisor(
        definitions: Vec<ProcessDefinition>,
        options: SupervisorOptions,
    ) -> (Supervisor, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Supervisor::new(definitions, options, tx), rx)
    }

    fn status<'a>(event: &'a Event) -> Option<(&'a str, &'a StatusUpdate)> {
        match event {
            Event::Status { id, update } => Some((id.as_str(), update)),
            _ => None,
        }
    }

    /// Collects events until `pred` matches one; panics on timeout.
    async fn collect_until(
        rx: &mut mpsc::UnboundedReceiver<Event>,
        mut pred: impl FnMut(&Event) -> bool,
    ) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = timeout(EVENT_TIMEOUT, rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            let done = pred(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    /// Drains whatever arrives within `window`.
    async fn drain(rx: &mut mpsc::UnboundedReceiver<Event>, window: Duration) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout(window, rx.recv()).await {
            seen.push(event);
        }
        seen
    }

    fn is_running(event: &Event, want: &str) -> bool {
        matches!(status(event), Some((id, StatusUpdate::Running { .. })) if id == want)
    }

    fn is_exit(event: &Event, want: &str) -> bool {
        matches!(status(event), Some((id, StatusUpdate::Exited { .. })) if id == want)
    }

    fn is_restart(event: &Event, want: &str) -> bool {
        matches!(
            status(event),
            Some((id, StatusUpdate::Starting { restart: true, .. })) if id == want
        )
    }

    #[tokio::test]
    async fn never_policy_does_not_restart() {
        let (sup, mut rx) = supervisor(vec![shell("a", "exit 3")], SupervisorOptions::default());
        sup.start_process("a", StartOptions::default()).await;
        let events = collect_until(&mut rx, |e| is_exit(e, "a")).await;
        let exited = events.iter().filter_map(status).last().map(|(_, u)| u.clone());
        assert!(matches!(
            exited,
            Some(StatusUpdate::Exited { code: 3, stopped_by_user: false, .. })
        ));
        let later = drain(&mut rx, Duration::from_millis(300)).await;
        assert!(!later.iter().any(|e| is_restart(e, "a")));
    }

    #[tokio::test]
    async fn on_error_policy_restarts_failed_process() {
        let mut definition = shell("a", "exit 1");
        definition.restart = RestartPolicy::OnError;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        sup.start_process("a", StartOptions::default()).await;
        let events = collect_until(&mut rx, |e| is_restart(e, "a")).await;
        assert!(events.iter().any(|e| is_exit(e, "a")));
    }

    #[tokio::test]
    async fn on_error_policy_leaves_clean_exit_alone() {
        let mut definition = shell("a", "exit 0");
        definition.restart = RestartPolicy::OnError;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        sup.start_process("a", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_exit(e, "a")).await;
        let later = drain(&mut rx, Duration::from_millis(300)).await;
        assert!(!later.iter().any(|e| is_restart(e, "a")));
    }

    #[tokio::test]
    async fn always_policy_restarts_clean_exit() {
        let mut definition = shell("a", "exit 0");
        definition.restart = RestartPolicy::Always;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        sup.start_process("a", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_restart(e, "a")).await;
    }

    /// Counts exits and restarts of `id` until `restarts` restarts were seen.
    async fn restart_cycles(
        rx: &mut mpsc::UnboundedReceiver<Event>,
        id: &str,
        restarts: usize,
    ) -> (usize, usize, Vec<Event>) {
        let mut seen_restarts = 0;
        let events = collect_until(rx, |e| {
            if is_restart(e, id) {
                seen_restarts += 1;
            }
            seen_restarts == restarts
        })
        .await;
        let exits = events.iter().filter(|e| is_exit(e, id)).count();
        let restarts = events.iter().filter(|e| is_restart(e, id)).count();
        (exits, restarts, events)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn always_policy_restarts_after_every_exit() {
        let mut definition = shell("a", "sleep 0.1");
        definition.restart = RestartPolicy::Always;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        sup.start_process("a", StartOptions::default()).await;
        let (exits, restarts, _) = restart_cycles(&mut rx, "a", 3).await;
        assert_eq!(exits, 3);
        assert_eq!(restarts, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn on_error_policy_restarts_after_every_failure() {
        let mut definition = shell("a", "sleep 0.1; exit 2");
        definition.restart = RestartPolicy::OnError;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        sup.start_process("a", StartOptions::default()).await;
        let (exits, restarts, _) = restart_cycles(&mut rx, "a", 3).await;
        assert_eq!(exits, 3);
        assert_eq!(restarts, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waited_process_keeps_restarting() {
        let mut definition = shell("w", "sleep 0.1");
        definition.restart = RestartPolicy::Always;
        definition.wait = true;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        tokio::spawn(sup.start_process("w", StartOptions::default()));
        let (exits, restarts, events) = restart_cycles(&mut rx, "w", 3).await;
        assert_eq!(exits, 3);
        assert_eq!(restarts, 3);
        assert!(events.iter().filter(|e| is_running(e, "w")).count() >= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waited_failure_with_restart_reports_no_error() {
        let mut definition = shell("w", "sleep 0.1; exit 1");
        definition.restart = RestartPolicy::OnError;
        definition.wait = true;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        tokio::spawn(sup.start_process("w", StartOptions::default()));
        let (exits, restarts, events) = restart_cycles(&mut rx, "w", 2).await;
        assert_eq!(exits, 2);
        assert_eq!(restarts, 2);
        assert!(!events
            .iter()
            .any(|e| matches!(status(e), Some((_, StatusUpdate::Failed(_))))));
    }

    #[tokio::test]
    async fn user_stop_is_never_restarted() {
        let mut definition = shell("a", "sleep 30");
        definition.restart = RestartPolicy::Always;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        sup.start_process("a", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_running(e, "a")).await;

        timeout(EVENT_TIMEOUT, sup.stop_process("a"))
            .await
            .expect("stop resolves");
        let events = collect_until(&mut rx, |e| is_exit(e, "a")).await;
        assert!(events
            .iter()
            .any(|e| matches!(status(e), Some((_, StatusUpdate::Stopping)))));
        let exited = events.iter().filter_map(status).last().map(|(_, u)| u.clone());
        assert!(matches!(
            exited,
            Some(StatusUpdate::Exited { stopped_by_user: true, .. })
        ));
        let later = drain(&mut rx, Duration::from_millis(300)).await;
        assert!(!later.iter().any(|e| is_restart(e, "a")));
    }

    #[tokio::test]
    async fn stopping_unstarted_process_reports_forced_exit() {
        let (sup, mut rx) = supervisor(vec![shell("a", "true")], SupervisorOptions::default());
        sup.stop_process("a").await;
        let events = collect_until(&mut rx, |e| is_exit(e, "a")).await;
        assert!(matches!(
            status(&events[0]),
            Some((_, StatusUpdate::Exited { code: -1, .. }))
        ));
    }

    #[tokio::test]
    async fn dependencies_start_first_and_only_once() {
        let mut a = shell("a", "sleep 5");
        a.deps = vec!["b".into()];
        let mut c = shell("c", "sleep 5");
        c.deps = vec!["b".into(), "missing".into()];
        let b = shell("b", "sleep 5");
        let (sup, mut rx) = supervisor(vec![a, b, c], SupervisorOptions::default());

        let first = sup.start_process("a", StartOptions::default());
        let second = sup.start_process("c", StartOptions::default());
        timeout(EVENT_TIMEOUT, async { tokio::join!(first, second) })
            .await
            .expect("starts settle");

        let events = drain(&mut rx, Duration::from_millis(300)).await;
        let running: Vec<&str> = events
            .iter()
            .filter_map(status)
            .filter(|(_, update)| matches!(update, StatusUpdate::Running { .. }))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(running.iter().filter(|id| **id == "b").count(), 1);
        let b_at = running.iter().position(|id| *id == "b").expect("b running");
        let a_at = running.iter().position(|id| *id == "a").expect("a running");
        let c_at = running.iter().position(|id| *id == "c").expect("c running");
        assert!(b_at < a_at && b_at < c_at);
        assert!(sup.is_dependency("b"));

        timeout(EVENT_TIMEOUT, sup.stop_all()).await.expect("stop all");
    }

    #[tokio::test]
    async fn dependency_cycles_do_not_deadlock() {
        let mut a = shell("a", "sleep 5");
        a.deps = vec!["b".into()];
        let mut b = shell("b", "sleep 5");
        b.deps = vec!["a".into()];
        let (sup, mut rx) = supervisor(vec![a, b], SupervisorOptions::default());
        timeout(EVENT_TIMEOUT, sup.start_process("a", StartOptions::default()))
            .await
            .expect("cycle settles");
        collect_until(&mut rx, |e| is_running(e, "a")).await;
        timeout(EVENT_TIMEOUT, sup.stop_all()).await.expect("stop all");
    }

    #[tokio::test]
    async fn stop_all_settles_with_mixed_processes() {
        let (sup, mut rx) = supervisor(
            vec![shell("long", "sleep 30"), shell("short", "true")],
            SupervisorOptions::default(),
        );
        sup.start_process("long", StartOptions::default()).await;
        sup.start_process("short", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_exit(e, "short")).await;

        timeout(EVENT_TIMEOUT, sup.stop_all())
            .await
            .expect("stop_all settles");
        let events = collect_until(&mut rx, |e| is_exit(e, "long")).await;
        assert!(events.iter().any(|e| is_exit(e, "long")));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_as_error() {
        let definition = ProcessDefinition::new(
            "bad",
            Command::Args(vec!["/definitely/not/a/program".into()]),
        );
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        sup.start_process("bad", StartOptions::default()).await;
        let events = collect_until(&mut rx, |e| {
            matches!(status(e), Some((_, StatusUpdate::Failed(_))))
        })
        .await;
        match status(events.last().expect("event")) {
            Some((_, StatusUpdate::Failed(failure))) => {
                assert_eq!(failure.name, "SpawnError");
                assert!(failure.message.contains("bad"));
                assert!(!failure.detail.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_flag_blocks_until_exit_and_fails_on_error() {
        let mut definition = shell("migrate", "sleep 0.2; exit 2");
        definition.wait = true;
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        timeout(EVENT_TIMEOUT, sup.start_process("migrate", StartOptions::default()))
            .await
            .expect("wait start settles");
        let events = drain(&mut rx, Duration::from_millis(200)).await;
        assert!(events.iter().any(|e| is_exit(e, "migrate")));
        let failure = events.iter().filter_map(status).find_map(|(_, update)| match update {
            StatusUpdate::Failed(failure) => Some(failure.clone()),
            _ => None,
        });
        assert_eq!(failure.map(|f| f.name), Some("WaitError".to_string()));
    }

    #[tokio::test]
    async fn autostart_marks_waiting_then_starts_dependencies_first() {
        let mut web = shell("web", "sleep 5");
        web.deps = vec!["db".into()];
        let mut db = shell("db", "sleep 0.3; exit 1");
        db.autostart = false;
        db.restart = RestartPolicy::OnError;
        let mut manual = shell("manual", "sleep 5");
        manual.autostart = false;
        let (sup, mut rx) = supervisor(vec![web, db, manual], SupervisorOptions::default());

        timeout(EVENT_TIMEOUT, sup.start_all_autostart(false))
            .await
            .expect("autostart settles");
        let events = collect_until(&mut rx, |e| is_restart(e, "db")).await;

        assert!(matches!(
            status(&events[0]),
            Some(("web", StatusUpdate::Starting { waiting: true, .. }))
        ));
        let db_running = events.iter().position(|e| is_running(e, "db")).expect("db running");
        let web_running = events.iter().position(|e| is_running(e, "web")).expect("web running");
        assert!(db_running < web_running);
        assert!(events.iter().any(|e| is_exit(e, "db")));
        assert!(!events.iter().any(|e| is_running(e, "manual")));

        timeout(EVENT_TIMEOUT, sup.stop_all()).await.expect("stop all");
    }

    #[tokio::test]
    async fn autostart_can_skip_dependencies() {
        let mut web = shell("web", "sleep 5");
        web.deps = vec!["db".into()];
        let mut db = shell("db", "sleep 5");
        db.autostart = false;
        let (sup, mut rx) = supervisor(vec![web, db], SupervisorOptions::default());
        timeout(EVENT_TIMEOUT, sup.start_all_autostart(true))
            .await
            .expect("autostart settles");
        let events = drain(&mut rx, Duration::from_millis(300)).await;
        assert!(events.iter().any(|e| is_running(e, "web")));
        assert!(!events.iter().any(|e| is_running(e, "db")));
        timeout(EVENT_TIMEOUT, sup.stop_all()).await.expect("stop all");
    }

    #[tokio::test]
    async fn input_reaches_the_process_and_output_is_published() {
        let definition = shell("echo", "read line; echo got:$line; sleep 1");
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let _sub = sup.on_buffer_change("echo", move |change| {
            let text: String = change
                .buffer
                .rows
                .iter()
                .map(|row| row.text())
                .collect::<Vec<_>>()
                .join("\n");
            let _ = seen_tx.send(text);
        });
        sup.start_process("echo", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_running(e, "echo")).await;
        sup.write("echo", b"hello\r");

        let found = timeout(EVENT_TIMEOUT, async {
            while let Some(text) = seen_rx.recv().await {
                if text.contains("got:hello") {
                    return true;
                }
            }
            false
        })
        .await
        .expect("output published");
        assert!(found);
        let snapshot = sup.snapshot("echo").expect("snapshot");
        assert!(snapshot.length >= snapshot.buffer.rows.len());
    }

    #[tokio::test]
    async fn title_changes_are_published() {
        let definition = shell("titled", "printf '\\033]2;building\\007'; sleep 1");
        let (sup, mut rx) = supervisor(vec![definition], SupervisorOptions::default());
        let (title_tx, mut title_rx) = mpsc::unbounded_channel();
        let _sub = sup.on_title_change("titled", move |change| {
            let _ = title_tx.send(change.title.clone());
        });
        sup.start_process("titled", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_running(e, "titled")).await;
        let title = timeout(EVENT_TIMEOUT, title_rx.recv())
            .await
            .expect("title published");
        assert_eq!(title.as_deref(), Some("building"));
    }

    #[tokio::test]
    async fn unknown_process_subscription_is_noop() {
        let (sup, _rx) = supervisor(vec![shell("a", "true")], SupervisorOptions::default());
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let sub = sup.on_scroll("ghost", move |_| flag.store(true, Ordering::SeqCst));
        assert!(!sub.is_active());
        assert!(!called.load(Ordering::SeqCst));
        assert!(sup.on_buffer_change("a", |_| {}).is_active());
    }

    #[tokio::test]
    async fn resize_applies_to_later_spawns() {
        let (sup, mut rx) = supervisor(vec![shell("a", "sleep 5")], SupervisorOptions::default());
        sup.resize(40, 12);
        sup.start_process("a", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_running(e, "a")).await;
        let snapshot = sup.snapshot("a").expect("snapshot");
        assert_eq!(snapshot.buffer.rows.len(), 12);
        sup.resize(50, 8);
        let snapshot = sup.snapshot("a").expect("snapshot");
        assert_eq!(snapshot.buffer.rows.len(), 8);
        timeout(EVENT_TIMEOUT, sup.stop_all()).await.expect("stop all");
    }

    #[tokio::test]
    async fn resize_publishes_new_viewport() {
        let (sup, mut rx) = supervisor(vec![shell("a", "sleep 5")], SupervisorOptions::default());
        sup.resize(40, 12);
        sup.start_process("a", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_running(e, "a")).await;

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let _sub = sup.on_scroll("a", move |change| *sink.lock().unwrap() = Some(*change));
        sup.resize(50, 8);
        let change = seen.lock().unwrap().expect("scroll change on resize");
        assert_eq!(change.viewport.bottom - change.viewport.top, 8);
        assert_eq!(change.length, sup.snapshot("a").expect("snapshot").length);
        timeout(EVENT_TIMEOUT, sup.stop_all()).await.expect("stop all");
    }

    #[tokio::test]
    async fn exits_when_all_stopped_with_always() {
        let options = SupervisorOptions {
            exit_when_all_stopped: ExitWhenAllStopped::Always,
            ..SupervisorOptions::default()
        };
        let (sup, mut rx) = supervisor(vec![shell("a", "exit 4")], options);
        sup.start_process("a", StartOptions::default()).await;
        collect_until(&mut rx, |e| matches!(e, Event::AllStopped)).await;
    }

    #[tokio::test]
    async fn on_success_does_not_exit_after_failure() {
        let options = SupervisorOptions {
            exit_when_all_stopped: ExitWhenAllStopped::OnSuccess,
            ..SupervisorOptions::default()
        };
        let (sup, mut rx) = supervisor(vec![shell("a", "exit 4")], options);
        sup.start_process("a", StartOptions::default()).await;
        collect_until(&mut rx, |e| is_exit(e, "a")).await;
        let later = drain(&mut rx, Duration::from_millis(300)).await;
        assert!(!later.iter().any(|e| matches!(e, Event::AllStopped)));
    }

    #[test]
    fn failure_carries_name_and_source_chain() {
        let err = SupervisorError::Spawn {
            id: "api".into(),
            source: Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file")),
        };
        let failure = err.to_failure();
        assert_eq!(failure.name, "SpawnError");
        assert_eq!(failure.message, "failed to start api");
        assert_eq!(failure.detail, "no such file");
    }
}
