//! Key bindings and their dispatch.
//!
//! Every command the dashboard understands is an `Action` with a fixed key
//! pattern. Views register the actions they currently offer as a binding set
//! guarded by an `is_active` predicate; `MappingRegistry::dispatch` matches a
//! decoded key against every eligible set and returns the actions that fired.

use std::collections::BTreeMap;

use crate::keys::KeyEvent;

/// Modifier-exact key description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeySpec {
    pub ctrl: bool,
    pub meta: bool,
    pub shift: bool,
    pub option: bool,
    pub name: Option<&'static str>,
    pub code: Option<&'static str>,
    pub raw: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPattern {
    /// Matches the key name or the raw input.
    Name(&'static str),
    Spec(KeySpec),
    /// Matches when any alternative does.
    AnyOf(&'static [KeyPattern]),
}

impl KeyPattern {
    pub fn matches(&self, key: &KeyEvent) -> bool {
        match self {
            KeyPattern::Name(name) => key.name == *name || key.raw == *name,
            KeyPattern::AnyOf(patterns) => patterns.iter().any(|p| p.matches(key)),
            KeyPattern::Spec(spec) => {
                spec.ctrl == key.ctrl
                    && spec.shift == key.shift
                    && spec.meta == key.meta
                    && spec.option == key.option
                    && spec.raw.map_or(true, |raw| key.raw == raw)
                    && spec.name.map_or(true, |name| key.name == name)
                    && spec.code.map_or(true, |code| key.code.as_deref() == Some(code))
            }
        }
    }

    /// Human readable form used in the legend (`C-a`, `k or up`).
    pub fn format(&self) -> String {
        match self {
            KeyPattern::Name(name) => (*name).to_string(),
            KeyPattern::AnyOf(patterns) => patterns
                .iter()
                .map(KeyPattern::format)
                .collect::<Vec<_>>()
                .join(" or "),
            KeyPattern::Spec(spec) => {
                let mut out = String::new();
                if spec.ctrl {
                    out.push_str("C-");
                }
                if spec.option {
                    out.push_str("O-");
                }
                if spec.meta {
                    out.push_str("M-");
                }
                if spec.shift {
                    out.push_str("S-");
                }
                out.push_str(spec.name.or(spec.code).or(spec.raw).unwrap_or_default());
                out
            }
        }
    }
}

const fn named(name: &'static str, ctrl: bool) -> KeyPattern {
    KeyPattern::Spec(KeySpec {
        ctrl,
        meta: false,
        shift: false,
        option: false,
        name: Some(name),
        code: None,
        raw: None,
    })
}

const fn ctrl(name: &'static str) -> KeyPattern {
    named(name, true)
}

// Lowercase letter without modifiers; a plain name would also match its
// shifted form.
const fn unshifted(name: &'static str) -> KeyPattern {
    named(name, false)
}

/// Everything a key can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    AppExit,
    FocusNext,
    NavigationEnter,
    NavigationUp,
    NavigationDown,
    LogsPageUp,
    LogsPageDown,
    LogsScrollUp,
    LogsScrollDown,
    ProcsExitAll,
    ProcsExitSelected,
    ProcsStartAll,
    ProcsStartSelected,
    HelpToggle,
    HelpClose,
}

/// Key, legend text and visibility of an action.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub key: KeyPattern,
    pub desc: &'static str,
    pub hide: bool,
}

impl Action {
    pub const ALL: [Action; 15] = [
        Action::AppExit,
        Action::FocusNext,
        Action::NavigationEnter,
        Action::NavigationUp,
        Action::NavigationDown,
        Action::LogsPageUp,
        Action::LogsPageDown,
        Action::LogsScrollUp,
        Action::LogsScrollDown,
        Action::ProcsExitAll,
        Action::ProcsExitSelected,
        Action::ProcsStartAll,
        Action::ProcsStartSelected,
        Action::HelpToggle,
        Action::HelpClose,
    ];

    pub fn mapping(self) -> Mapping {
        let (key, desc, hide) = match self {
            Action::AppExit => (KeyPattern::Name("q"), "Exit", false),
            Action::FocusNext => (ctrl("a"), "Toggle Focus", false),
            Action::NavigationEnter => (KeyPattern::Name("return"), "Logs", false),
            Action::NavigationUp => (
                KeyPattern::AnyOf(&[KeyPattern::Name("k"), KeyPattern::Name("up")]),
                "Up",
                true,
            ),
            Action::NavigationDown => (
                KeyPattern::AnyOf(&[KeyPattern::Name("j"), KeyPattern::Name("down")]),
                "Down",
                true,
            ),
            Action::LogsPageUp => (ctrl("pageup"), "Page Up", false),
            Action::LogsPageDown => (ctrl("pagedown"), "Page Down", false),
            Action::LogsScrollUp => (KeyPattern::Name("pageup"), "Scroll Up", false),
            Action::LogsScrollDown => (KeyPattern::Name("pagedown"), "Scroll Down", false),
            Action::ProcsExitAll => (KeyPattern::Name("X"), "Stop All", false),
            Action::ProcsExitSelected => (unshifted("x"), "Stop Selected", false),
            Action::ProcsStartAll => (KeyPattern::Name("S"), "Start All", false),
            Action::ProcsStartSelected => (unshifted("s"), "Start Selected", false),
            Action::HelpToggle => (KeyPattern::Name("?"), "Help", false),
            Action::HelpClose => (KeyPattern::Name("escape"), "Close Help", false),
        };
        Mapping { key, desc, hide }
    }

    /// Stable identifier; the legend is ordered by it.
    pub fn id(self) -> &'static str {
        match self {
            Action::AppExit => "appExit",
            Action::FocusNext => "focusNext",
            Action::NavigationEnter => "navigationEnter",
            Action::NavigationUp => "navigationUp",
            Action::NavigationDown => "navigationDown",
            Action::LogsPageUp => "logsPageUp",
            Action::LogsPageDown => "logsPageDown",
            Action::LogsScrollUp => "logsScrollUp",
            Action::LogsScrollDown => "logsScrollDown",
            Action::ProcsExitAll => "procsExitAll",
            Action::ProcsExitSelected => "procsExitSelected",
            Action::ProcsStartAll => "procsStartAll",
            Action::ProcsStartSelected => "procsStartSelected",
            Action::HelpToggle => "helpToggle",
            Action::HelpClose => "helpClose",
        }
    }
}

/// Handle of a registered binding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

type Predicate<Ctx> = Box<dyn Fn(&Ctx) -> bool + Send>;

struct BindingSet<Ctx> {
    id: BindingId,
    actions: Vec<Action>,
    is_active: Predicate<Ctx>,
    capture: bool,
}

/// Registered binding sets plus the global capture flag.
pub struct MappingRegistry<Ctx> {
    sets: Vec<BindingSet<Ctx>>,
    next_id: u64,
    captured_by: Option<BindingId>,
}

impl<Ctx> Default for MappingRegistry<Ctx> {
    fn default() -> Self {
        Self {
            sets: Vec::new(),
            next_id: 0,
            captured_by: None,
        }
    }
}

impl<Ctx> MappingRegistry<Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `actions` as one set, eligible while `is_active` holds.
    ///
    /// A capturing set takes the capture flag the first time it is active,
    /// silencing every non-capturing set until it is unregistered.
    pub fn register<F>(&mut self, actions: &[Action], capture: bool, is_active: F) -> BindingId
    where
        F: Fn(&Ctx) -> bool + Send + 'static,
    {
        let id = BindingId(self.next_id);
        self.next_id += 1;
        self.sets.push(BindingSet {
            id,
            actions: actions.to_vec(),
            is_active: Box::new(is_active),
            capture,
        });
        id
    }

    pub fn unregister(&mut self, id: BindingId) {
        self.sets.retain(|set| set.id != id);
        if self.captured_by == Some(id) {
            self.captured_by = None;
        }
    }

    pub fn is_captured(&self) -> bool {
        self.captured_by.is_some()
    }

    /// Returns every action of every eligible set that matches `key`.
    pub fn dispatch(&mut self, key: &KeyEvent, ctx: &Ctx) -> Vec<Action> {
        self.refresh_capture(ctx);
        self.eligible(ctx)
            .flat_map(|set| set.actions.iter().copied())
            .filter(|action| action.mapping().key.matches(key))
            .collect()
    }

    /// Visible actions of all eligible sets, deduplicated and ordered by id.
    pub fn legend(&mut self, ctx: &Ctx) -> Vec<(Action, Mapping)> {
        self.refresh_capture(ctx);
        let mut seen = BTreeMap::new();
        for action in self.eligible(ctx).flat_map(|set| set.actions.iter().copied()) {
            let mapping = action.mapping();
            if !mapping.hide {
                seen.entry(action.id()).or_insert((action, mapping));
            }
        }
        seen.into_values().collect()
    }

    fn refresh_capture(&mut self, ctx: &Ctx) {
        if self.captured_by.is_some() {
            return;
        }
        self.captured_by = self
            .sets
            .iter()
            .find(|set| set.capture && (set.is_active)(ctx))
            .map(|set| set.id);
    }

    fn eligible<'a>(&'a self, ctx: &'a Ctx) -> impl Iterator<Item = &'a BindingSet<Ctx>> + 'a {
        let captured = self.captured_by.is_some();
        self.sets
            .iter()
            .filter(move |set| (set.is_active)(ctx) && (set.capture || !captured))
    }
}

/// Renders a legend as `<key: desc>` entries.
#[cfg(test)]
pub fn format_legend(entries: &[(Action, Mapping)]) -> String {
    entries
        .iter()
        .map(|(_, mapping)| format!("<{}: {}>", mapping.key.format(), mapping.desc))
        .collect::<Vec<_>>()
        .join(" ")
}
