//! Focus tracking between dashboard regions.

/// Ordered focusable regions with at most one focused.
#[derive(Debug, Clone, Default)]
pub struct FocusRegistry {
    regions: Vec<String>,
    focused: Option<String>,
}

impl FocusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, autofocus: bool) {
        let id = id.into();
        if autofocus {
            self.focused = Some(id.clone());
        }
        if !self.regions.contains(&id) {
            self.regions.push(id);
        }
    }

    pub fn unregister(&mut self, id: &str) {
        self.regions.retain(|region| region != id);
        if self.focused.as_deref() == Some(id) {
            self.focused = None;
        }
    }

    pub fn focus(&mut self, id: &str) {
        self.focused = Some(id.to_string());
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn is_focused(&self, id: &str) -> bool {
        self.focused() == Some(id)
    }

    /// Moves focus to the next region, wrapping around.
    pub fn focus_next(&mut self) {
        if self.regions.is_empty() {
            return;
        }
        let next = match self.position() {
            Some(index) => (index + 1) % self.regions.len(),
            None => 0,
        };
        self.focused = Some(self.regions[next].clone());
    }

    /// Moves focus to the previous region; the first region wraps to the last.
    pub fn focus_previous(&mut self) {
        if self.regions.is_empty() {
            return;
        }
        let previous = match self.position() {
            Some(index) if index >= 1 => index - 1,
            _ => self.regions.len() - 1,
        };
        self.focused = Some(self.regions[previous].clone());
    }

    fn position(&self) -> Option<usize> {
        let focused = self.focused.as_deref()?;
        self.regions.iter().position(|region| region == focused)
    }
}
