//! Application state and UI logic.
//!
//! `App` keeps the last known state of every process, the selection, focus
//! between the process list and the log view, and the help overlay. Raw
//! input is decoded and dispatched through the mapping registry; whatever
//! the supervisor has to do is returned as `AppAction`s for the event loop
//! to execute.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::focus::FocusRegistry;
use crate::keys::{self, KeyEvent, MouseEvent};
use crate::mappings::{Action, BindingId, Mapping, MappingRegistry};
use crate::process::{
    is_startable, is_stoppable, ProcessDefinition, ProcessState, ProcessStatus, StatusUpdate,
};
use crate::render::{CursorBlink, RenderedBuffer};
use crate::supervisor::{BufferChange, ProcessSnapshot, ScrollChange};
use crate::terminal::{ScrollRequest, Viewport};

/// Focus region of the process list.
pub const PROC_REGION: &str = "proc";
/// Focus region of the log view.
pub const LOG_REGION: &str = "log";

/// Actions resulting from user interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    /// Stop everything and exit.
    Quit,
    Start(String),
    /// Start every process that is not running.
    StartAll,
    Stop(String),
    StopAll,
    /// Forward raw input to a process.
    Write(String, Vec<u8>),
    Scroll(String, ScrollRequest),
    /// Follow the terminal of another process in the log view.
    Watch(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone)]
struct StatusMessage {
    text: String,
    at: Instant,
    ttl: Option<Duration>,
    level: StatusLevel,
}

/// What the binding predicates look at.
#[derive(Debug, Clone, Default)]
pub struct ViewContext {
    pub focused: Option<String>,
    /// Status of the selected process.
    pub status: Option<ProcessStatus>,
}

impl ViewContext {
    fn proc_focused(&self) -> bool {
        self.focused.as_deref() == Some(PROC_REGION)
    }
}

/// Terminal contents of the selected process.
#[derive(Debug, Clone, Default)]
pub struct LogView {
    pub buffer: Arc<RenderedBuffer>,
    pub title: String,
    /// Lines held by the terminal, scrollback included.
    pub length: usize,
    pub viewport: Viewport,
}

/// The main application state container.
pub struct App {
    /// Every configured process in file order.
    pub processes: Vec<ProcessState>,
    /// Index of the currently selected process.
    pub selected: usize,
    /// Whether the help overlay is shown.
    pub show_help: bool,
    pub log: LogView,
    pub cursor: CursorBlink,
    focus: FocusRegistry,
    mappings: MappingRegistry<ViewContext>,
    help_binding: Option<BindingId>,
    status_message: Option<StatusMessage>,
}

impl App {
    pub fn new(definitions: &[ProcessDefinition]) -> Self {
        let mut focus = FocusRegistry::new();
        focus.register(PROC_REGION, true);
        focus.register(LOG_REGION, false);

        let mut mappings: MappingRegistry<ViewContext> = MappingRegistry::new();
        mappings.register(
            &[
                Action::FocusNext,
                Action::LogsPageUp,
                Action::LogsPageDown,
                Action::LogsScrollUp,
                Action::LogsScrollDown,
            ],
            false,
            |_| true,
        );
        mappings.register(&[Action::ProcsStartSelected], false, |ctx: &ViewContext| {
            ctx.proc_focused() && is_startable(ctx.status)
        });
        mappings.register(
            &[Action::ProcsExitSelected, Action::NavigationEnter],
            false,
            |ctx: &ViewContext| ctx.proc_focused() && is_stoppable(ctx.status),
        );
        mappings.register(
            &[
                Action::NavigationUp,
                Action::NavigationDown,
                Action::AppExit,
                Action::ProcsExitAll,
                Action::ProcsStartAll,
                Action::HelpToggle,
            ],
            false,
            ViewContext::proc_focused,
        );

        let now = Instant::now();
        Self {
            processes: definitions.iter().map(ProcessState::new).collect(),
            selected: 0,
            show_help: false,
            log: LogView::default(),
            cursor: CursorBlink::new(now),
            focus,
            mappings,
            help_binding: None,
            status_message: None,
        }
    }

    pub fn selected_process(&self) -> Option<&ProcessState> {
        self.processes.get(self.selected)
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected_process().map(|process| process.id.as_str())
    }

    fn selected_status(&self) -> Option<ProcessStatus> {
        self.selected_process().and_then(|process| process.status)
    }

    fn is_selected(&self, id: &str) -> bool {
        self.selected_id() == Some(id)
    }

    pub fn is_log_focused(&self) -> bool {
        self.focus.is_focused(LOG_REGION)
    }

    pub fn is_proc_focused(&self) -> bool {
        self.focus.is_focused(PROC_REGION)
    }

    pub fn context(&self) -> ViewContext {
        ViewContext {
            focused: self.focus.focused().map(str::to_string),
            status: self.selected_status(),
        }
    }

    /// Reduces a supervisor status update.
    ///
    /// Returns `Watch` when the selected process got a new terminal.
    pub fn on_status(&mut self, id: &str, update: &StatusUpdate) -> Option<AppAction> {
        let process = self.processes.iter_mut().find(|process| process.id == id)?;
        let was_running = process.status == Some(ProcessStatus::Running);
        process.apply(update);
        let is_running = process.status == Some(ProcessStatus::Running);

        if let StatusUpdate::Failed(failure) = update {
            let text = format!("{}: {}", process.name, failure.message);
            self.set_status_warning_for(text, Duration::from_secs(5));
        }
        if !self.is_selected(id) {
            return None;
        }
        if was_running && !is_running && self.is_log_focused() {
            self.focus.focus(PROC_REGION);
        }
        self.sync_cursor();
        matches!(update, StatusUpdate::Running { .. }).then(|| AppAction::Watch(id.to_string()))
    }

    pub fn on_buffer(&mut self, id: &str, change: &BufferChange) {
        if self.is_selected(id) {
            self.log.buffer = Arc::clone(&change.buffer);
            self.log.length = change.length;
        }
    }

    pub fn on_title(&mut self, id: &str, title: &str) {
        if self.is_selected(id) {
            self.log.title = title.to_string();
        }
    }

    pub fn on_scroll(&mut self, id: &str, change: &ScrollChange) {
        if self.is_selected(id) {
            self.log.viewport = change.viewport;
            self.log.length = change.length;
        }
    }

    /// Replaces the log view with the terminal of the selected process.
    pub fn load_snapshot(&mut self, snapshot: Option<ProcessSnapshot>) {
        self.log = match snapshot {
            Some(snapshot) => LogView {
                buffer: snapshot.buffer,
                title: snapshot.title,
                length: snapshot.length,
                viewport: snapshot.viewport,
            },
            None => LogView::default(),
        };
    }

    /// Handles one chunk of raw terminal input.
    pub fn handle_input(&mut self, bytes: &[u8]) -> Vec<AppAction> {
        if let Some(events) = keys::decode_mouse(bytes) {
            return self.handle_mouse(&events);
        }
        let key = keys::decode(bytes);
        let ctx = self.context();
        let fired = self.mappings.dispatch(&key, &ctx);
        if fired.is_empty() {
            return self.forward_input(&key, bytes).into_iter().collect();
        }
        tracing::debug!(key = %key.name, ?fired, "mapped input");
        let actions = fired
            .into_iter()
            .filter_map(|action| self.apply_action(action))
            .collect();
        self.sync_cursor();
        actions
    }

    /// Wheel events scroll the log of the selected process by one line.
    fn handle_mouse(&self, events: &[MouseEvent]) -> Vec<AppAction> {
        if self.mappings.is_captured() {
            return Vec::new();
        }
        let Some(id) = self.selected_id() else {
            return Vec::new();
        };
        events
            .iter()
            .filter_map(|event| match event {
                MouseEvent::WheelUp => Some(ScrollRequest::Lines(-1)),
                MouseEvent::WheelDown => Some(ScrollRequest::Lines(1)),
                MouseEvent::Other => None,
            })
            .map(|request| AppAction::Scroll(id.to_string(), request))
            .collect()
    }

    fn forward_input(&self, key: &KeyEvent, bytes: &[u8]) -> Option<AppAction> {
        if self.mappings.is_captured()
            || !self.is_log_focused()
            || self.selected_status() != Some(ProcessStatus::Running)
        {
            return None;
        }
        if key.ctrl && key.name == "a" {
            return None;
        }
        let id = self.selected_id()?;
        Some(AppAction::Write(id.to_string(), bytes.to_vec()))
    }

    fn apply_action(&mut self, action: Action) -> Option<AppAction> {
        let selected = self.selected_id().map(str::to_string);
        match action {
            Action::AppExit => Some(AppAction::Quit),
            Action::FocusNext => {
                self.focus.focus_next();
                None
            }
            Action::NavigationEnter => {
                self.focus.focus(LOG_REGION);
                None
            }
            Action::NavigationUp => self.select(if self.selected > 0 {
                self.selected - 1
            } else {
                self.processes.len().saturating_sub(1)
            }),
            Action::NavigationDown => self.select((self.selected + 1) % self.processes.len().max(1)),
            Action::LogsPageUp => selected.map(|id| AppAction::Scroll(id, ScrollRequest::Pages(-1))),
            Action::LogsPageDown => selected.map(|id| AppAction::Scroll(id, ScrollRequest::Pages(1))),
            Action::LogsScrollUp => selected.map(|id| AppAction::Scroll(id, ScrollRequest::Lines(-1))),
            Action::LogsScrollDown => selected.map(|id| AppAction::Scroll(id, ScrollRequest::Lines(1))),
            Action::ProcsExitAll => Some(AppAction::StopAll),
            Action::ProcsExitSelected => selected.map(AppAction::Stop),
            Action::ProcsStartAll => Some(AppAction::StartAll),
            Action::ProcsStartSelected => selected.map(AppAction::Start),
            Action::HelpToggle => {
                if self.show_help {
                    self.close_help();
                } else {
                    self.open_help();
                }
                None
            }
            Action::HelpClose => {
                self.close_help();
                None
            }
        }
    }

    fn select(&mut self, index: usize) -> Option<AppAction> {
        if index == self.selected || index >= self.processes.len() {
            return None;
        }
        self.selected = index;
        self.log = LogView::default();
        self.selected_id().map(|id| AppAction::Watch(id.to_string()))
    }

    fn open_help(&mut self) {
        self.show_help = true;
        if self.help_binding.is_none() {
            let id = self
                .mappings
                .register(&[Action::HelpClose, Action::HelpToggle], true, |_| true);
            self.help_binding = Some(id);
        }
    }

    fn close_help(&mut self) {
        self.show_help = false;
        if let Some(id) = self.help_binding.take() {
            self.mappings.unregister(id);
        }
    }

    /// Key legend for the current focus and selection.
    pub fn legend(&mut self) -> Vec<(Action, Mapping)> {
        let ctx = self.context();
        self.mappings.legend(&ctx)
    }

    fn sync_cursor(&mut self) {
        let focused = self.is_log_focused();
        let running = self.selected_status() == Some(ProcessStatus::Running);
        self.cursor.update(focused, running, Instant::now());
    }

    /// Advances the cursor blink; returns true when a redraw is needed.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.cursor.tick(now)
    }

    pub fn status_message(&self) -> Option<(&str, StatusLevel)> {
        let message = self.status_message.as_ref()?;
        let still_visible = match message.ttl {
            Some(ttl) => message.at.elapsed() < ttl,
            None => true,
        };
        still_visible.then_some((message.text.as_str(), message.level))
    }

    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.set_status_message_with_level(message, StatusLevel::Info, Some(Duration::from_secs(3)));
    }

    pub fn set_status_warning_for(&mut self, message: impl Into<String>, ttl: Duration) {
        self.set_status_message_with_level(message, StatusLevel::Warning, Some(ttl));
    }

    fn set_status_message_with_level(
        &mut self,
        message: impl Into<String>,
        level: StatusLevel,
        ttl: Option<Duration>,
    ) {
        self.status_message = Some(StatusMessage {
            text: message.into(),
            at: Instant::now(),
            ttl,
            level,
        });
    }
}
