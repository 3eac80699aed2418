//! Conversion of a terminal cell grid into style-homogeneous runs.
//!
//! The renderer walks the visible rows of a grid and merges neighbouring
//! cells that share a resolved style into one `Run`. A new run starts
//! whenever the style changes or the cursor enters or leaves a cell, so the
//! cursor always sits alone in its run and can be drawn inverted.

use std::time::{Duration, Instant};

/// How often the cursor toggles while blinking.
pub const CURSOR_BLINK_INTERVAL: Duration = Duration::from_millis(500);

/// A cell colour as the emulator reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellColor {
    #[default]
    Default,
    Palette(u8),
    Rgb(u8, u8, u8),
}

/// Attribute flags of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellFlags {
    pub inverse: bool,
    pub bold: bool,
    pub underline: bool,
    pub blink: bool,
    pub italic: bool,
    pub dim: bool,
    pub strikethrough: bool,
}

/// One cell of the grid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GridCell {
    pub contents: String,
    /// Display width: 0 for the trailing half of a wide character.
    pub width: u8,
    pub fg: CellColor,
    pub bg: CellColor,
    pub flags: CellFlags,
}

/// Anything that exposes the visible part of a terminal as cells.
pub trait CellGrid {
    /// `(rows, cols)` of the viewport.
    fn size(&self) -> (u16, u16);
    fn cell(&self, row: u16, col: u16) -> Option<GridCell>;
    /// Cursor position relative to the viewport, if it is on screen.
    fn cursor(&self) -> Option<(u16, u16)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedColor {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
}

/// A colour after resolution for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Named(NamedColor),
    Bright(NamedColor),
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Color {
    /// Resolves an emulator colour; the default colour resolves to `None`.
    pub fn resolve(color: CellColor) -> Option<Self> {
        match color {
            CellColor::Default => None,
            CellColor::Rgb(r, g, b) => Some(Color::Rgb(r, g, b)),
            CellColor::Palette(idx @ 0..=7) => Some(Color::Named(named(idx))),
            CellColor::Palette(idx @ 8..=15) => Some(Color::Bright(named(idx - 8))),
            CellColor::Palette(idx) => Some(Color::Indexed(idx)),
        }
    }
}

fn named(idx: u8) -> NamedColor {
    match idx {
        0 => NamedColor::Black,
        1 => NamedColor::Red,
        2 => NamedColor::Green,
        3 => NamedColor::Yellow,
        4 => NamedColor::Blue,
        5 => NamedColor::Magenta,
        6 => NamedColor::Cyan,
        _ => NamedColor::White,
    }
}

/// Resolved style of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStyle {
    pub fg: Option<Color>,
    pub bg: Option<Color>,
    pub flags: CellFlags,
}

impl RunStyle {
    fn of(cell: &GridCell) -> Self {
        Self {
            fg: Color::resolve(cell.fg),
            bg: Color::resolve(cell.bg),
            flags: cell.flags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    pub text: String,
    pub style: RunStyle,
    pub cursor: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedRow {
    pub runs: Vec<Run>,
}

impl RenderedRow {
    pub fn text(&self) -> String {
        self.runs.iter().map(|run| run.text.as_str()).collect()
    }
}

/// The rendered viewport of one terminal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderedBuffer {
    pub rows: Vec<RenderedRow>,
}

/// Renders the visible rows of `grid`.
pub fn render(grid: &impl CellGrid) -> RenderedBuffer {
    let (rows, cols) = grid.size();
    let cursor = grid.cursor();
    let rows = (0..rows)
        .map(|row| render_row(grid, row, cols, cursor))
        .collect();
    RenderedBuffer { rows }
}

fn render_row(grid: &impl CellGrid, row: u16, cols: u16, cursor: Option<(u16, u16)>) -> RenderedRow {
    let mut runs: Vec<Run> = Vec::new();
    for col in 0..cols {
        let cell = grid.cell(row, col).unwrap_or_else(|| GridCell {
            width: 1,
            ..GridCell::default()
        });
        if cell.width == 0 {
            continue;
        }
        let style = RunStyle::of(&cell);
        let is_cursor = cursor == Some((row, col));
        let text = if cell.contents.is_empty() {
            " "
        } else {
            cell.contents.as_str()
        };
        match runs.last_mut() {
            Some(last) if last.style == style && !last.cursor && !is_cursor => last.text.push_str(text),
            _ => runs.push(Run {
                text: text.to_string(),
                style,
                cursor: is_cursor,
            }),
        }
    }
    RenderedRow { runs }
}

/// Blink phase of the log view cursor.
///
/// The cursor only blinks while the view is focused and the process is
/// running; any change to either condition restarts the phase visible.
#[derive(Debug, Clone, Copy)]
pub struct CursorBlink {
    focused: bool,
    running: bool,
    visible: bool,
    last_toggle: Instant,
}

impl CursorBlink {
    pub fn new(now: Instant) -> Self {
        Self {
            focused: false,
            running: false,
            visible: true,
            last_toggle: now,
        }
    }

    /// Records the current focus and running state, resetting the phase on change.
    pub fn update(&mut self, focused: bool, running: bool, now: Instant) {
        if focused != self.focused || running != self.running {
            self.focused = focused;
            self.running = running;
            self.visible = true;
            self.last_toggle = now;
        }
    }

    /// Advances the blink phase; returns true when visibility flipped.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.is_blinking() {
            return false;
        }
        if now.duration_since(self.last_toggle) < CURSOR_BLINK_INTERVAL {
            return false;
        }
        self.visible = !self.visible;
        self.last_toggle = now;
        true
    }

    pub fn is_blinking(&self) -> bool {
        self.focused && self.running
    }

    /// Whether the cursor run should currently be drawn inverted.
    pub fn show_inverted(&self) -> bool {
        !self.is_blinking() || self.visible
    }
}

impl CellGrid for vt100::Screen {
    fn size(&self) -> (u16, u16) {
        vt100::Screen::size(self)
    }

    fn cell(&self, row: u16, col: u16) -> Option<GridCell> {
        let cell = vt100::Screen::cell(self, row, col)?;
        let width = if cell.is_wide_continuation() {
            0
        } else if cell.is_wide() {
            2
        } else {
            1
        };
        // vt100 tracks no blink, dim or strikethrough attributes.
        Some(GridCell {
            contents: cell.contents(),
            width,
            fg: cell_color(cell.fgcolor()),
            bg: cell_color(cell.bgcolor()),
            flags: CellFlags {
                inverse: cell.inverse(),
                bold: cell.bold(),
                underline: cell.underline(),
                italic: cell.italic(),
                ..CellFlags::default()
            },
        })
    }

    fn cursor(&self) -> Option<(u16, u16)> {
        if self.hide_cursor() {
            return None;
        }
        let (rows, _) = vt100::Screen::size(self);
        let (row, col) = self.cursor_position();
        // While scrolled back the live screen is pushed down by the offset.
        let row = usize::from(row) + self.scrollback();
        if row >= usize::from(rows) {
            return None;
        }
        Some((row as u16, col))
    }
}

fn cell_color(color: vt100::Color) -> CellColor {
    match color {
        vt100::Color::Default => CellColor::Default,
        vt100::Color::Idx(idx) => CellColor::Palette(idx),
        vt100::Color::Rgb(r, g, b) => CellColor::Rgb(r, g, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestGrid {
        rows: u16,
        cols: u16,
        cells: Vec<GridCell>,
        cursor: Option<(u16, u16)>,
    }

    impl TestGrid {
        fn from_lines(lines: &[&str]) -> Self {
            let rows = lines.len() as u16;
            let cols = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) as u16;
            let mut cells = Vec::new();
            for line in lines {
                let mut chars: Vec<char> = line.chars().collect();
                chars.resize(cols as usize, '\0');
                for c in chars {
                    cells.push(GridCell {
                        contents: if c == '\0' { String::new() } else { c.to_string() },
                        width: 1,
                        ..GridCell::default()
                    });
                }
            }
            Self {
                rows,
                cols,
                cells,
                cursor: None,
            }
        }

        fn cell_mut(&mut self, row: u16, col: u16) -> &mut GridCell {
            &mut self.cells[(row * self.cols + col) as usize]
        }
    }

    impl CellGrid for TestGrid {
        fn size(&self) -> (u16, u16) {
            (self.rows, self.cols)
        }

        fn cell(&self, row: u16, col: u16) -> Option<GridCell> {
            self.cells.get((row * self.cols + col) as usize).cloned()
        }

        fn cursor(&self) -> Option<(u16, u16)> {
            self.cursor
        }
    }

    #[test]
    fn uniform_row_is_one_run() {
        let grid = TestGrid::from_lines(&["hello"]);
        let buffer = render(&grid);
        assert_eq!(buffer.rows.len(), 1);
        assert_eq!(buffer.rows[0].runs.len(), 1);
        assert_eq!(buffer.rows[0].runs[0].text, "hello");
    }

    #[test]
    fn empty_cells_render_as_spaces() {
        let grid = TestGrid::from_lines(&["ab", ""]);
        let buffer = render(&grid);
        assert_eq!(buffer.rows[1].text(), "  ");
    }

    #[test]
    fn rendering_is_idempotent() {
        let mut grid = TestGrid::from_lines(&["abc", "def"]);
        grid.cell_mut(0, 1).fg = CellColor::Palette(1);
        grid.cursor = Some((1, 2));
        assert_eq!(render(&grid), render(&grid));
    }

    #[test]
    fn colour_change_adds_one_boundary() {
        let mut grid = TestGrid::from_lines(&["abcd"]);
        let before = render(&grid).rows[0].runs.len();
        grid.cell_mut(0, 3).fg = CellColor::Palette(2);
        let row = render(&grid).rows.remove(0);
        assert_eq!(row.runs.len(), before + 1);
        assert_eq!(row.runs[0].text, "abc");
        assert_eq!(row.runs[1].text, "d");
        assert_eq!(row.runs[1].style.fg, Some(Color::Named(NamedColor::Green)));
    }

    #[test]
    fn cursor_sits_alone_in_its_run() {
        let mut grid = TestGrid::from_lines(&["abc"]);
        grid.cursor = Some((0, 1));
        let row = render(&grid).rows.remove(0);
        let texts: Vec<&str> = row.runs.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert!(row.runs[1].cursor);
        assert!(!row.runs[0].cursor && !row.runs[2].cursor);
    }

    #[test]
    fn wide_continuation_cells_are_skipped() {
        let mut grid = TestGrid::from_lines(&["xy"]);
        *grid.cell_mut(0, 0) = GridCell {
            contents: "世".into(),
            width: 2,
            ..GridCell::default()
        };
        grid.cell_mut(0, 1).width = 0;
        assert_eq!(render(&grid).rows[0].text(), "世");
    }

    #[test]
    fn resolves_colours() {
        assert_eq!(Color::resolve(CellColor::Default), None);
        assert_eq!(
            Color::resolve(CellColor::Palette(1)),
            Some(Color::Named(NamedColor::Red))
        );
        assert_eq!(
            Color::resolve(CellColor::Palette(12)),
            Some(Color::Bright(NamedColor::Blue))
        );
        assert_eq!(Color::resolve(CellColor::Palette(200)), Some(Color::Indexed(200)));
        assert_eq!(
            Color::resolve(CellColor::Rgb(255, 16, 0)),
            Some(Color::Rgb(255, 16, 0))
        );
    }

    #[test]
    fn vt100_screen_renders_styles() {
        let mut parser = vt100::Parser::new(2, 10, 0);
        parser.process(b"ok \x1b[31mred\x1b[0m");
        let buffer = render(parser.screen());
        let row = &buffer.rows[0];
        assert!(row.text().starts_with("ok red"));
        let red = row.runs.iter().find(|r| r.text == "red").expect("red run");
        assert_eq!(red.style.fg, Some(Color::Named(NamedColor::Red)));
        assert!(buffer.rows.iter().flat_map(|r| &r.runs).any(|run| run.cursor));
    }

    #[test]
    fn blink_toggles_only_while_focused_and_running() {
        let start = Instant::now();
        let mut blink = CursorBlink::new(start);
        assert!(!blink.tick(start + CURSOR_BLINK_INTERVAL));
        assert!(blink.show_inverted());

        blink.update(true, true, start);
        assert!(blink.tick(start + CURSOR_BLINK_INTERVAL));
        assert!(!blink.show_inverted());
        assert!(!blink.tick(start + CURSOR_BLINK_INTERVAL + Duration::from_millis(100)));
    }

    #[test]
    fn blink_resets_when_state_changes() {
        let start = Instant::now();
        let mut blink = CursorBlink::new(start);
        blink.update(true, true, start);
        blink.tick(start + CURSOR_BLINK_INTERVAL);
        assert!(!blink.show_inverted());

        let later = start + CURSOR_BLINK_INTERVAL * 2;
        blink.update(false, true, later);
        assert!(blink.show_inverted());
        blink.update(true, true, later);
        assert!(blink.show_inverted());
        assert!(!blink.tick(later + Duration::from_millis(10)));
    }
}
