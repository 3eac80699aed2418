//! Pseudo-terminal spawning and process-tree signalling.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

const READ_CHUNK_SIZE: usize = 8192;

/// Viewport size handed to new pseudo-terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 100, rows: 100 }
    }
}

impl TerminalSize {
    pub fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows.max(1),
            cols: self.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Everything needed to launch one child.
#[derive(Debug, Clone)]
pub struct PtySpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub inherit_env: bool,
    pub size: TerminalSize,
}

pub struct SpawnedPty {
    pub master: Box<dyn MasterPty + Send>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub killer: Box<dyn ChildKiller + Send + Sync>,
    pub pid: Option<u32>,
}

/// Opens a pseudo-terminal and starts `spec.program` on it.
pub fn spawn_pty(spec: PtySpawnSpec) -> Result<SpawnedPty> {
    let pair = native_pty_system()
        .openpty(spec.size.to_pty_size())
        .context("failed to open pseudo-terminal")?;

    let mut command = CommandBuilder::new(&spec.program);
    command.args(&spec.args);
    if !spec.inherit_env {
        command.env_clear();
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    match &spec.cwd {
        Some(cwd) => command.cwd(cwd),
        None => {
            if let Ok(cwd) = std::env::current_dir() {
                command.cwd(cwd);
            }
        }
    }

    let mut child = pair
        .slave
        .spawn_command(command)
        .with_context(|| format!("failed to spawn {}", spec.program))?;
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();
    let reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(err) => {
            terminate_child(&mut child);
            return Err(err).context("failed to read from pseudo-terminal");
        }
    };
    let writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(err) => {
            terminate_child(&mut child);
            return Err(err).context("failed to write to pseudo-terminal");
        }
    };

    Ok(SpawnedPty {
        master: pair.master,
        reader,
        writer,
        child,
        killer,
        pid,
    })
}

fn terminate_child(child: &mut Box<dyn Child + Send + Sync>) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Reads output on a dedicated thread until the pty closes or `on_chunk`
/// asks to stop by returning false.
pub fn spawn_read_loop<F>(mut reader: Box<dyn Read + Send>, mut on_chunk: F)
where
    F: FnMut(&[u8]) -> bool + Send + 'static,
{
    std::thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    if !on_chunk(&buffer[..read]) {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

pub fn spawn_write_loop(
    mut writer: Box<dyn Write + Send>,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Some(input) = stdin_rx.blocking_recv() {
            if input.is_empty() {
                continue;
            }
            if writer.write_all(&input).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });
}

/// Signals sent while stopping a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Term,
    Kill,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::Term => "SIGTERM",
            ProcessSignal::Kill => "SIGKILL",
        }
    }
}

/// Signals the process group led by `pid` and the process itself.
///
/// Children spawned on a pty lead their own session, so the group covers
/// everything they started unless a descendant moved to another group.
/// Without a pid the child is killed through its killer handle.
#[cfg(unix)]
pub fn signal_tree(pid: Option<u32>, killer: &mut dyn ChildKiller, signal: ProcessSignal) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        let _ = killer.kill();
        return;
    };
    let sig = match signal {
        ProcessSignal::Term => libc::SIGTERM,
        ProcessSignal::Kill => libc::SIGKILL,
    };
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
pub fn signal_tree(_pid: Option<u32>, killer: &mut dyn ChildKiller, _signal: ProcessSignal) {
    let _ = killer.kill();
}

/// Shell used for string commands.
#[cfg(unix)]
pub fn shell_command(script: &str) -> (String, Vec<String>) {
    ("/bin/sh".to_string(), vec!["-c".to_string(), script.to_string()])
}

#[cfg(windows)]
pub fn shell_command(script: &str) -> (String, Vec<String>) {
    ("cmd.exe".to_string(), vec!["/C".to_string(), script.to_string()])
}
