//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the dashboard with `ratatui`: the process list, the log view of the
//! selected process, the key legend and the help overlay.

use std::io::{self, Stdout};

use crossterm::event::{DisableMouseCapture, EnableMouseCapture};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::block::{Position, Title};
use ratatui::widgets::{
    Block, BorderType, Borders, Clear, List, ListItem, ListState, Paragraph, Scrollbar,
    ScrollbarOrientation, ScrollbarState, Wrap,
};
use ratatui::Terminal;

use crate::app::{App, LogView, StatusLevel};
use crate::mappings::{Action, Mapping};
use crate::process::{ProcessState, ProcessStatus};
use crate::render::{self, NamedColor, Run};

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const PROCESS_LIST_WIDTH: u16 = 50;

/// Screen regions of the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardLayout {
    pub processes: Rect,
    pub logs: Rect,
    pub status: Rect,
    pub legend: Rect,
}

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen with mouse reporting, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;
    Ok(terminal)
}

/// Restores the terminal to its original state.
///
/// Disables raw mode, leaves the alternate screen, and shows the cursor.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}

pub fn dashboard_layout(area: Rect) -> DashboardLayout {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(1),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(area);
    let list_width = PROCESS_LIST_WIDTH.min(area.width / 2);
    let main = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(list_width), Constraint::Min(1)])
        .split(vertical[0]);
    DashboardLayout {
        processes: main[0],
        logs: main[1],
        status: vertical[1],
        legend: vertical[2],
    }
}

/// Size `(cols, rows)` process terminals get for a screen of `area`.
pub fn log_size(area: Rect) -> (u16, u16) {
    let logs = dashboard_layout(area).logs;
    (logs.width.saturating_sub(2), logs.height.saturating_sub(2))
}

/// Draws the current application state to the terminal.
pub fn draw(app: &mut App, terminal: &mut TuiTerminal) -> io::Result<()> {
    execute!(terminal.backend_mut(), SetTitle(window_title(app)))?;
    let legend = app.legend();
    terminal.draw(|frame| {
        let area = frame.size();
        let layout = dashboard_layout(area);

        draw_process_list(frame, app, layout.processes);
        draw_logs(frame, app, layout.logs);

        let status = match app.status_message() {
            Some((text, level)) => Line::from(Span::styled(text.to_string(), message_style(level))),
            None => Line::from(Span::styled(status_line(app), Style::default().fg(Color::DarkGray))),
        };
        frame.render_widget(Paragraph::new(status), layout.status);
        frame.render_widget(
            Paragraph::new(legend_line(&legend)).style(Style::default().fg(Color::White)),
            layout.legend,
        );

        if app.show_help {
            draw_help(frame, app, area);
        }
    })?;
    Ok(())
}

fn draw_process_list(frame: &mut ratatui::Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .processes
        .iter()
        .enumerate()
        .map(|(idx, process)| {
            let selected = idx == app.selected;
            let mut style = status_style(process.status);
            if selected {
                style = style.add_modifier(Modifier::REVERSED);
            }
            ListItem::new(Line::from(Span::styled(
                format!("{} {}", status_icon(process.status), process.name),
                style,
            )))
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .title(Span::styled("Processes", Style::default().add_modifier(Modifier::BOLD)))
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded)
            .border_style(focus_style(app.is_proc_focused())),
    );
    let mut state = ListState::default();
    if !app.processes.is_empty() {
        state.select(Some(app.selected.min(app.processes.len() - 1)));
    }
    frame.render_stateful_widget(list, area, &mut state);
}

fn draw_logs(frame: &mut ratatui::Frame, app: &App, area: Rect) {
    let mut title = vec![Span::styled("Logs", Style::default().add_modifier(Modifier::BOLD))];
    if !app.log.title.is_empty() {
        title.push(Span::raw(": "));
        title.push(Span::styled(app.log.title.clone(), Style::default().fg(Color::Magenta)));
    }
    let block = Block::default()
        .title(Line::from(title))
        .title(
            Title::from(scroll_indicator(&app.log))
                .position(Position::Bottom)
                .alignment(Alignment::Right),
        )
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(focus_style(app.is_log_focused()));

    let error = app.selected_process().and_then(|process| process.error.clone());
    let body = match error {
        Some(error) => Paragraph::new(error)
            .style(Style::default().fg(Color::Red))
            .wrap(Wrap { trim: false }),
        None => Paragraph::new(log_text(&app.log, app.cursor.show_inverted()))
            .style(Style::default().fg(Color::White)),
    };
    frame.render_widget(body.block(block), area);

    if area.height > 2 && area.width > 0 {
        let track = Rect {
            x: area.x + area.width - 1,
            y: area.y + 1,
            width: 1,
            height: area.height - 2,
        };
        let mut state = ScrollbarState::new(app.log.length)
            .position(app.log.viewport.top)
            .viewport_content_length(app.log.viewport.bottom - app.log.viewport.top);
        frame.render_stateful_widget(
            Scrollbar::new(ScrollbarOrientation::VerticalRight),
            track,
            &mut state,
        );
    }
}

fn draw_help(frame: &mut ratatui::Frame, app: &App, area: Rect) {
    let popup_area = centered_rect(60, 60, area);
    let mut lines = vec![Line::from("Keys:")];
    for action in Action::ALL {
        let mapping = action.mapping();
        lines.push(Line::from(vec![
            Span::styled(
                format!("  {:<18}", mapping.key.format()),
                Style::default().fg(Color::Yellow),
            ),
            Span::raw(mapping.desc),
        ]));
    }
    if let Some(process) = app.selected_process() {
        lines.push(Line::from(""));
        lines.push(Line::from(process_summary(process)));
    }

    let help_block = Paragraph::new(Text::from(lines))
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        )
        .style(Style::default().bg(Color::DarkGray).fg(Color::White));
    frame.render_widget(Clear, popup_area);
    frame.render_widget(help_block, popup_area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn window_title(app: &App) -> String {
    match app.selected_process() {
        Some(process) => format!("procrack · {}", process.name),
        None => "procrack".to_string(),
    }
}

fn status_line(app: &App) -> String {
    let Some(process) = app.selected_process() else {
        return "No processes".to_string();
    };
    process_summary(process)
}

fn process_summary(process: &ProcessState) -> String {
    let status = process.status.map(ProcessStatus::label).unwrap_or("idle");
    let pid = process
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".into());
    let code = process
        .exit_code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "-".into());
    let uptime = process
        .uptime()
        .map(|d| format!("{:02}:{:02}", d.as_secs() / 60, d.as_secs() % 60))
        .unwrap_or_else(|| "-".into());
    format!(
        "{} | status: {} | pid: {} | exit: {} | restarts: {} | uptime: {}",
        process.name, status, pid, code, process.restarts, uptime
    )
}

/// `N% top-bottom/length`, where N is how far down the viewport ends.
fn scroll_indicator(log: &LogView) -> String {
    let percent = if log.length == 0 {
        0
    } else {
        ((log.viewport.bottom as f64 / log.length as f64) * 100.0).round() as usize
    };
    format!(
        "{}% {}-{}/{}",
        percent, log.viewport.top, log.viewport.bottom, log.length
    )
}

fn legend_line(legend: &[(Action, Mapping)]) -> Line<'static> {
    let mut spans = Vec::new();
    for (_, mapping) in legend {
        spans.push(Span::raw("<"));
        spans.push(Span::styled(mapping.key.format(), Style::default().fg(Color::Yellow)));
        spans.push(Span::raw(format!(": {}> ", mapping.desc)));
    }
    Line::from(spans)
}

fn log_text(log: &LogView, show_cursor: bool) -> Text<'static> {
    let lines: Vec<Line<'static>> = log
        .buffer
        .rows
        .iter()
        .map(|row| {
            Line::from(
                row.runs
                    .iter()
                    .map(|run| Span::styled(run.text.clone(), run_style(run, show_cursor)))
                    .collect::<Vec<_>>(),
            )
        })
        .collect();
    Text::from(lines)
}

fn run_style(run: &Run, show_cursor: bool) -> Style {
    let mut style = Style::default();
    if let Some(fg) = run.style.fg {
        style = style.fg(tui_color(fg));
    }
    if let Some(bg) = run.style.bg {
        style = style.bg(tui_color(bg));
    }
    let flags = run.style.flags;
    let mut modifier = Modifier::empty();
    if flags.bold {
        modifier |= Modifier::BOLD;
    }
    if flags.dim {
        modifier |= Modifier::DIM;
    }
    if flags.italic {
        modifier |= Modifier::ITALIC;
    }
    if flags.underline {
        modifier |= Modifier::UNDERLINED;
    }
    if flags.blink {
        modifier |= Modifier::SLOW_BLINK;
    }
    if flags.strikethrough {
        modifier |= Modifier::CROSSED_OUT;
    }
    // The cursor cell is drawn by flipping its inverse attribute.
    if flags.inverse != (run.cursor && show_cursor) {
        modifier |= Modifier::REVERSED;
    }
    style.add_modifier(modifier)
}

fn tui_color(color: render::Color) -> Color {
    match color {
        render::Color::Named(name) => match name {
            NamedColor::Black => Color::Black,
            NamedColor::Red => Color::Red,
            NamedColor::Green => Color::Green,
            NamedColor::Yellow => Color::Yellow,
            NamedColor::Blue => Color::Blue,
            NamedColor::Magenta => Color::Magenta,
            NamedColor::Cyan => Color::Cyan,
            NamedColor::White => Color::Gray,
        },
        render::Color::Bright(name) => match name {
            NamedColor::Black => Color::DarkGray,
            NamedColor::Red => Color::LightRed,
            NamedColor::Green => Color::LightGreen,
            NamedColor::Yellow => Color::LightYellow,
            NamedColor::Blue => Color::LightBlue,
            NamedColor::Magenta => Color::LightMagenta,
            NamedColor::Cyan => Color::LightCyan,
            NamedColor::White => Color::White,
        },
        render::Color::Indexed(idx) => Color::Indexed(idx),
        render::Color::Rgb(r, g, b) => Color::Rgb(r, g, b),
    }
}

fn focus_style(focused: bool) -> Style {
    Style::default().fg(if focused { Color::Green } else { Color::Blue })
}

fn message_style(level: StatusLevel) -> Style {
    match level {
        StatusLevel::Info => Style::default().fg(Color::Cyan),
        StatusLevel::Warning => Style::default().fg(Color::Yellow),
    }
}

fn status_icon(status: Option<ProcessStatus>) -> char {
    match status {
        None => '·',
        Some(ProcessStatus::Starting) | Some(ProcessStatus::Restarting) => '↻',
        Some(ProcessStatus::Waiting) => '…',
        Some(ProcessStatus::Delayed) => '◷',
        Some(ProcessStatus::Running) => '▲',
        Some(ProcessStatus::Stopping) => '▼',
        Some(ProcessStatus::Exit) => '■',
        Some(ProcessStatus::Error) => '✖',
    }
}

fn status_style(status: Option<ProcessStatus>) -> Style {
    match status {
        None => Style::default().fg(Color::White),
        Some(ProcessStatus::Running) => Style::default().fg(Color::Green),
        Some(ProcessStatus::Exit) => Style::default().fg(Color::Cyan),
        Some(ProcessStatus::Error) => Style::default().fg(Color::Red),
        Some(_) => Style::default().fg(Color::Yellow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{CellFlags, RunStyle};
    use crate::terminal::Viewport;

    #[test]
    fn layout_caps_process_list_width() {
        let layout = dashboard_layout(Rect::new(0, 0, 200, 50));
        assert_eq!(layout.processes.width, PROCESS_LIST_WIDTH);
        assert_eq!(layout.logs.width, 150);
        assert_eq!(layout.legend.y, 49);

        let narrow = dashboard_layout(Rect::new(0, 0, 60, 20));
        assert_eq!(narrow.processes.width, 30);
    }

    #[test]
    fn log_size_excludes_borders() {
        assert_eq!(log_size(Rect::new(0, 0, 200, 50)), (148, 46));
    }

    #[test]
    fn scroll_indicator_reports_position() {
        let mut log = LogView::default();
        assert_eq!(scroll_indicator(&log), "0% 0-0/0");
        log.length = 200;
        log.viewport = Viewport { top: 50, bottom: 100 };
        assert_eq!(scroll_indicator(&log), "50% 50-100/200");
    }

    #[test]
    fn cursor_run_is_inverted_only_when_shown() {
        let run = Run {
            text: "x".into(),
            style: RunStyle::default(),
            cursor: true,
        };
        assert!(run_style(&run, true).add_modifier.contains(Modifier::REVERSED));
        assert!(!run_style(&run, false).add_modifier.contains(Modifier::REVERSED));

        let inverse = Run {
            text: "x".into(),
            style: RunStyle {
                flags: CellFlags {
                    inverse: true,
                    ..CellFlags::default()
                },
                ..RunStyle::default()
            },
            cursor: true,
        };
        assert!(!run_style(&inverse, true).add_modifier.contains(Modifier::REVERSED));
    }

    #[test]
    fn bright_palette_maps_to_light_colors() {
        assert_eq!(tui_color(render::Color::Bright(NamedColor::Red)), Color::LightRed);
        assert_eq!(tui_color(render::Color::Indexed(42)), Color::Indexed(42));
    }

    #[test]
    fn legend_highlights_keys() {
        let entries: Vec<(Action, Mapping)> = [Action::AppExit, Action::FocusNext]
            .into_iter()
            .map(|action| (action, action.mapping()))
            .collect();
        let line = legend_line(&entries);
        let text: String = line.spans.iter().map(|span| span.content.as_ref()).collect();
        assert_eq!(text, format!("{} ", crate::mappings::format_legend(&entries)));
        assert_eq!(line.spans[1].style.fg, Some(Color::Yellow));
    }
}
