//! Typed publish/subscribe channels with explicit disposal.
//!
//! Each managed process owns a few `EventChannel`s (buffer, title, scroll).
//! Subscribers get a `Subscription` back; disposing it removes exactly that
//! one listener, and disposing twice is harmless.

use std::sync::{Arc, Mutex, Weak};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listeners<E> {
    next_id: u64,
    entries: Vec<(u64, Listener<E>)>,
}

/// A multi-listener channel for events of type `E`.
pub struct EventChannel<E> {
    inner: Arc<Mutex<Listeners<E>>>,
}

impl<E: 'static> EventChannel<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers `listener` and returns the handle that removes it again.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let Ok(mut guard) = self.inner.lock() else {
                return Subscription::noop();
            };
            let id = guard.next_id;
            guard.next_id += 1;
            guard.entries.push((id, Arc::new(listener)));
            id
        };
        let weak: Weak<Mutex<Listeners<E>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                if let Ok(mut guard) = inner.lock() {
                    guard.entries.retain(|(entry_id, _)| *entry_id != id);
                }
            }
        })
    }

    /// Delivers `event` to every listener registered at the time of the call.
    ///
    /// Listeners run outside the channel lock, so they may subscribe or
    /// dispose while handling an event.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = match self.inner.lock() {
            Ok(guard) => guard.entries.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => return,
        };
        for listener in listeners {
            listener(event);
        }
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().map(|guard| guard.entries.len()).unwrap_or(0)
    }
}

impl<E: 'static> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposer for one channel registration.
///
/// Dropping the handle disposes it as well.
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A handle that removes nothing.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    pub fn is_active(&self) -> bool {
        self.dispose.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
