//! Event definitions for the application event loop.
//!
//! Everything that changes application state arrives on one channel as an
//! `Event`: supervisor status transitions, terminal updates of the selected
//! process, raw user input and system signals.

use crate::process::StatusUpdate;
use crate::supervisor::{BufferChange, ScrollChange};

/// Signals that ask the application to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn label(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A process moved through its lifecycle.
    Status { id: String, update: StatusUpdate },
    /// The rendered terminal of a process changed.
    Buffer { id: String, change: BufferChange },
    /// A process set its terminal title.
    Title { id: String, title: String },
    /// The viewport of a process terminal moved.
    Scroll { id: String, change: ScrollChange },
    /// Every process has stopped and the exit policy asks to quit.
    AllStopped,
    /// Raw bytes read from the controlling terminal.
    Input(Vec<u8>),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// The application received a termination signal.
    Shutdown { signal: ShutdownSignal },
}
