//! Per-process virtual terminal.
//!
//! Wraps a `vt100::Parser` and reports what changed after each chunk of
//! output: the window title and the viewport position within the buffer.

use anyhow::{bail, Result};

use crate::render::{self, RenderedBuffer};

/// Visible line range of a terminal buffer, `top..bottom`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub top: usize,
    pub bottom: usize,
}

/// A viewport scroll request; negative amounts scroll towards older output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollRequest {
    Lines(i32),
    Pages(i32),
}

/// Changes produced by feeding output into the emulator.
#[derive(Debug, Default)]
pub struct TerminalUpdate {
    pub title: Option<String>,
    pub viewport: Option<Viewport>,
}

pub struct TerminalEmulator {
    parser: vt100::Parser,
    title: String,
    disposed: bool,
}

impl TerminalEmulator {
    pub fn new(cols: u16, rows: u16, scrollback_limit: usize) -> Result<Self> {
        if cols == 0 || rows == 0 {
            bail!("terminal emulator requires non-zero rows and columns");
        }
        Ok(Self {
            parser: vt100::Parser::new(rows, cols, scrollback_limit),
            title: String::new(),
            disposed: false,
        })
    }

    pub fn process(&mut self, bytes: &[u8]) -> TerminalUpdate {
        let mut update = TerminalUpdate::default();
        if bytes.is_empty() {
            return update;
        }
        let before = self.viewport();
        self.parser.process(bytes);
        let after = self.viewport();
        if after != before {
            update.viewport = Some(after);
        }
        let title = self.parser.screen().title();
        if title != self.title {
            self.title = title.to_string();
            update.title = Some(self.title.clone());
        }
        update
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            bail!("terminal emulator resize requires non-zero rows and columns");
        }
        self.parser.set_size(rows, cols);
        Ok(())
    }

    /// Moves the viewport and returns its new position.
    pub fn scroll(&mut self, request: ScrollRequest) -> Viewport {
        let (rows, _) = self.parser.screen().size();
        let lines = match request {
            ScrollRequest::Lines(lines) => i64::from(lines),
            ScrollRequest::Pages(pages) => i64::from(pages) * i64::from(rows),
        };
        let history = self.history_len() as i64;
        let offset = self.parser.screen().scrollback() as i64;
        let next = (offset - lines).clamp(0, history);
        self.parser.set_scrollback(next as usize);
        self.viewport()
    }

    pub fn viewport(&mut self) -> Viewport {
        let (rows, _) = self.parser.screen().size();
        let history = self.history_len();
        let offset = self.parser.screen().scrollback();
        let top = history.saturating_sub(offset);
        Viewport {
            top,
            bottom: top + usize::from(rows),
        }
    }

    /// Total lines held: scrollback plus the live screen.
    pub fn content_length(&mut self) -> usize {
        let (rows, _) = self.parser.screen().size();
        self.history_len() + usize::from(rows)
    }

    pub fn render(&self) -> RenderedBuffer {
        render::render(self.parser.screen())
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Marks the emulator as replaced; its reader stops publishing.
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // vt100 clamps the scrollback offset to the rows it holds, which gives
    // us the history length without tracking it ourselves.
    fn history_len(&mut self) -> usize {
        let previous = self.parser.screen().scrollback();
        self.parser.set_scrollback(usize::MAX);
        let len = self.parser.screen().scrollback();
        self.parser.set_scrollback(previous);
        len
    }
}
