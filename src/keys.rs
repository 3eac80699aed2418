//! Decoding of raw terminal input into structured key events.
//!
//! In raw mode the terminal hands us byte chunks: printable characters,
//! control bytes and the escape sequences emitted by xterm, rxvt, putty and
//! the linux console. `decode` turns one chunk into a `KeyEvent` that the
//! mapping layer can match against.

use std::sync::OnceLock;

use regex::Regex;

/// A decoded key press.
///
/// An empty `name` means the chunk was not recognized; such events can still
/// be matched by their `raw` text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyEvent {
    /// Symbolic key name (`"return"`, `"up"`, `"a"`, `"f5"`, ...).
    pub name: String,
    /// The chunk as received, decoded as text.
    pub raw: String,
    /// Escape code of a function key without the leading escapes (`"[A"`).
    pub code: Option<String>,
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
    /// Set when a function key arrived with a doubled escape prefix.
    pub option: bool,
}

/// Decodes one chunk of terminal input.
pub fn decode(input: &[u8]) -> KeyEvent {
    let s = chunk_to_string(input);
    let mut key = KeyEvent {
        raw: s.clone(),
        ..KeyEvent::default()
    };
    let mut chars = s.chars();
    let single = match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    };

    match s.as_str() {
        "\r" => key.name = "return".into(),
        "\n" => key.name = "enter".into(),
        "\t" => key.name = "tab".into(),
        "\x08" | "\x7f" | "\x1b\x7f" | "\x1b\x08" => {
            key.name = "backspace".into();
            key.meta = s.starts_with('\x1b');
        }
        "\x1b" | "\x1b\x1b" => {
            key.name = "escape".into();
            key.meta = s.len() == 2;
        }
        " " | "\x1b " => {
            key.name = "space".into();
            key.meta = s.len() == 2;
        }
        _ => {
            if let Some(c) = single {
                decode_single(c, &mut key);
            } else if let Some(caps) = meta_key_re().captures(&s) {
                let c = caps[1].chars().next().unwrap_or_default();
                key.meta = true;
                key.shift = c.is_ascii_uppercase();
                key.name = c.to_ascii_lowercase().to_string();
            } else if let Some(caps) = function_key_re().captures(&s) {
                decode_function_key(&s, &caps, &mut key);
            }
        }
    }
    key
}

/// A mouse report, reduced to what the dashboard reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseEvent {
    WheelUp,
    WheelDown,
    Other,
}

/// Decodes a chunk made only of mouse reports, either SGR (`\x1b[<b;x;yM`)
/// or X10 (`\x1b[M` plus three bytes). Returns `None` for anything else.
pub fn decode_mouse(input: &[u8]) -> Option<Vec<MouseEvent>> {
    let mut events = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let button = if let Some(report) = rest.strip_prefix(b"\x1b[<") {
            let end = report.iter().position(|b| matches!(b, b'M' | b'm'))?;
            let params = std::str::from_utf8(&report[..end]).ok()?;
            let button = params.split(';').next()?.parse::<u32>().ok()?;
            rest = &report[end + 1..];
            button
        } else if let Some(report) = rest.strip_prefix(b"\x1b[M") {
            if report.len() < 3 {
                return None;
            }
            let button = u32::from(report[0].checked_sub(32)?);
            rest = &report[3..];
            button
        } else {
            return None;
        };
        events.push(mouse_event(button));
    }
    (!events.is_empty()).then_some(events)
}

fn mouse_event(button: u32) -> MouseEvent {
    if button & 64 == 0 {
        return MouseEvent::Other;
    }
    match button & 0b11 {
        0 => MouseEvent::WheelUp,
        1 => MouseEvent::WheelDown,
        _ => MouseEvent::Other,
    }
}

fn decode_single(c: char, key: &mut KeyEvent) {
    match c {
        '\x01'..='\x1a' => {
            key.name = char::from(c as u8 + b'a' - 1).to_string();
            key.ctrl = true;
        }
        '0'..='9' => key.name = "number".into(),
        'a'..='z' => key.name = c.to_string(),
        'A'..='Z' => {
            key.name = c.to_ascii_lowercase().to_string();
            key.shift = true;
        }
        _ => {}
    }
}

fn decode_function_key(s: &str, caps: &regex::Captures<'_>, key: &mut KeyEvent) {
    if s.starts_with("\x1b\x1b") {
        key.option = true;
    }
    let part = |idx: usize| caps.get(idx).map(|m| m.as_str()).unwrap_or("");
    let code = [part(1), part(2), part(4), part(6)].concat();
    let modifier = [part(3), part(5)]
        .iter()
        .find(|value| !value.is_empty())
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(1)
        .saturating_sub(1);

    key.ctrl = modifier & 4 != 0;
    key.meta = modifier & 10 != 0;
    key.shift = modifier & 1 != 0;
    key.name = function_key_name(&code).unwrap_or_default().to_string();
    key.shift |= is_shift_code(&code);
    key.ctrl |= is_ctrl_code(&code);
    key.code = Some(code);
}

// A lone byte above 0x7f is how some terminals send meta+key.
fn chunk_to_string(input: &[u8]) -> String {
    if let [byte] = input {
        if *byte > 127 {
            let mut out = String::from("\x1b");
            out.push(char::from(byte - 128));
            return out;
        }
    }
    String::from_utf8_lossy(input).into_owned()
}

fn meta_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\x1b([a-zA-Z0-9])$").expect("valid meta key regex"))
}

fn function_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\x1b+)(O|N|\[|\[\[)(?:(\d+)(?:;(\d+))?([~^$])|(?:1;)?(\d+)?([a-zA-Z]))")
            .expect("valid function key regex")
    })
}

fn function_key_name(code: &str) -> Option<&'static str> {
    let name = match code {
        // xterm/gnome ESC O letter, xterm/rxvt ESC [ number ~, linux console ESC [ [ letter
        "OP" | "[11~" | "[[A" => "f1",
        "OQ" | "[12~" | "[[B" => "f2",
        "OR" | "[13~" | "[[C" => "f3",
        "OS" | "[14~" | "[[D" => "f4",
        "[15~" | "[[E" => "f5",
        "[17~" => "f6",
        "[18~" => "f7",
        "[19~" => "f8",
        "[20~" => "f9",
        "[21~" => "f10",
        "[23~" => "f11",
        "[24~" => "f12",
        "[A" | "OA" | "[a" | "Oa" => "up",
        "[B" | "OB" | "[b" | "Ob" => "down",
        "[C" | "OC" | "[c" | "Oc" => "right",
        "[D" | "OD" | "[d" | "Od" => "left",
        "[E" | "OE" | "[e" | "Oe" => "clear",
        "[F" | "OF" | "[4~" | "[8~" | "[8$" | "[8^" => "end",
        "[H" | "OH" | "[1~" | "[7~" | "[7$" | "[7^" => "home",
        "[2~" | "[2$" | "[2^" => "insert",
        "[3~" | "[3$" | "[3^" => "delete",
        "[5~" | "[[5~" | "[5$" | "[5^" => "pageup",
        "[6~" | "[[6~" | "[6$" | "[6^" => "pagedown",
        "[Z" => "tab",
        _ => return None,
    };
    Some(name)
}

// rxvt reports shifted keys with lowercase letters or a trailing `$`.
fn is_shift_code(code: &str) -> bool {
    matches!(
        code,
        "[a" | "[b" | "[c" | "[d" | "[e" | "[2$" | "[3$" | "[5$" | "[6$" | "[7$" | "[8$" | "[Z"
    )
}

// rxvt reports ctrl keys with `O` plus lowercase letters or a trailing `^`.
fn is_ctrl_code(code: &str) -> bool {
    matches!(
        code,
        "Oa" | "Ob" | "Oc" | "Od" | "Oe" | "[2^" | "[3^" | "[5^" | "[6^" | "[7^" | "[8^"
    )
}
