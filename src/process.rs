//! Process definitions and the lifecycle state tracked for display.
//!
//! `ProcessDefinition` is the immutable description loaded from the config
//! file. `ProcessState` is the store record the UI renders, updated from the
//! supervisor's `StatusUpdate`s by `ProcessState::apply`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::pty::{self, PtySpawnSpec, TerminalSize};

/// When a process that exited on its own is started again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    #[serde(alias = "error")]
    OnError,
    Always,
}

impl RestartPolicy {
    /// User stops never restart; otherwise the policy decides on the exit code.
    pub fn should_restart(self, stopped_by_user: bool, exit_code: i32) -> bool {
        if stopped_by_user {
            return false;
        }
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::OnError => exit_code != 0,
            RestartPolicy::Always => true,
        }
    }
}

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Program followed by its arguments, executed directly.
    Args(Vec<String>),
    /// Script run through the platform shell.
    Shell(String),
}

impl Command {
    /// Appends extra parameters, quoting them for shell scripts.
    pub fn with_params(&self, params: &[String]) -> Command {
        match self {
            Command::Args(args) => Command::Args(args.iter().chain(params).cloned().collect()),
            Command::Shell(script) if params.is_empty() => Command::Shell(script.clone()),
            Command::Shell(script) => {
                Command::Shell(format!("{} {}", script, shell_words::join(params)))
            }
        }
    }

    /// Program and arguments to hand to the pty.
    pub fn program_and_args(&self) -> Option<(String, Vec<String>)> {
        match self {
            Command::Args(args) => {
                let (program, rest) = args.split_first()?;
                Some((program.clone(), rest.to_vec()))
            }
            Command::Shell(script) if script.trim().is_empty() => None,
            Command::Shell(script) => Some(pty::shell_command(script)),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Command::Args(args) => shell_words::join(args),
            Command::Shell(script) => script.clone(),
        }
    }
}

/// Specification of one managed process.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    /// Unique key from the config file.
    pub id: String,
    /// Friendly name shown in the process list.
    pub name: String,
    pub command: Command,
    pub cwd: Option<PathBuf>,
    /// Environment overrides.
    pub env: HashMap<String, String>,
    /// Whether the supervisor's own environment is passed through.
    pub inherit_env: bool,
    /// Ids that must be started before this process.
    pub deps: Vec<String>,
    /// Pause before spawning.
    pub delay: Duration,
    pub restart: RestartPolicy,
    /// Started by the initial autostart pass.
    pub autostart: bool,
    /// Startup is complete only once this process has exited successfully.
    pub wait: bool,
    /// Extra CLI parameters are not appended to this command.
    pub ignore_params: bool,
    /// Opened in the browser once the process is running.
    pub url: Option<String>,
    pub url_delay: Duration,
}

impl ProcessDefinition {
    pub fn new(id: impl Into<String>, command: Command) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            command,
            cwd: None,
            env: HashMap::new(),
            inherit_env: true,
            deps: Vec::new(),
            delay: Duration::ZERO,
            restart: RestartPolicy::Never,
            autostart: true,
            wait: false,
            ignore_params: false,
            url: None,
            url_delay: Duration::from_millis(1000),
        }
    }

    /// Builds the pty spawn request for this definition.
    pub fn spawn_spec(&self, params: &[String], size: TerminalSize) -> Option<PtySpawnSpec> {
        let command = if self.ignore_params {
            self.command.clone()
        } else {
            self.command.with_params(params)
        };
        let (program, args) = command.program_and_args()?;
        Some(PtySpawnSpec {
            program,
            args,
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            inherit_env: self.inherit_env,
            size,
        })
    }
}

/// The current lifecycle status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    /// Waiting for dependencies to start.
    Waiting,
    /// Sleeping through the configured delay.
    Delayed,
    Running,
    Stopping,
    /// Being started again after an exit.
    Restarting,
    /// Exited cleanly or was stopped.
    Exit,
    /// Failed to start or exited with a non-zero code.
    Error,
}

impl ProcessStatus {
    pub fn label(self) -> &'static str {
        match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Waiting => "waiting",
            ProcessStatus::Delayed => "delayed",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Restarting => "restarting",
            ProcessStatus::Exit => "exit",
            ProcessStatus::Error => "error",
        }
    }
}

/// Whether the operator may start a process in `status` (`None` = never started).
pub fn is_startable(status: Option<ProcessStatus>) -> bool {
    matches!(
        status,
        None | Some(ProcessStatus::Exit) | Some(ProcessStatus::Error)
    )
}

pub fn is_stoppable(status: Option<ProcessStatus>) -> bool {
    status == Some(ProcessStatus::Running)
}

/// A failure captured while starting a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    pub name: String,
    pub message: String,
    /// Source chain of the error, one cause per line.
    pub detail: String,
}

impl ProcessFailure {
    pub fn describe(&self) -> String {
        if self.detail.is_empty() {
            format!("{}: {}", self.name, self.message)
        } else {
            format!("{}: {}\n{}", self.name, self.message, self.detail)
        }
    }
}

/// Lifecycle transitions published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Starting {
        restart: bool,
        delayed: bool,
        waiting: bool,
    },
    Running {
        pid: Option<u32>,
    },
    Stopping,
    Exited {
        code: i32,
        signal: Option<String>,
        stopped_by_user: bool,
    },
    Failed(ProcessFailure),
}

/// Last known state of a process as shown in the UI.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub id: String,
    pub name: String,
    /// `None` until the first start attempt.
    pub status: Option<ProcessStatus>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub restarts: u32,
    pub started_at: Option<Instant>,
    pub stopped_at: Option<Instant>,
}

impl ProcessState {
    pub fn new(definition: &ProcessDefinition) -> Self {
        Self {
            id: definition.id.clone(),
            name: definition.name.clone(),
            status: None,
            pid: None,
            exit_code: None,
            error: None,
            restarts: 0,
            started_at: None,
            stopped_at: None,
        }
    }

    /// Reduces one supervisor update into this record.
    pub fn apply(&mut self, update: &StatusUpdate) {
        match update {
            StatusUpdate::Starting {
                restart,
                delayed,
                waiting,
            } => {
                self.status = Some(if *restart {
                    ProcessStatus::Restarting
                } else if *delayed {
                    ProcessStatus::Delayed
                } else if *waiting {
                    ProcessStatus::Waiting
                } else {
                    ProcessStatus::Starting
                });
                if *restart {
                    self.restarts += 1;
                }
                self.error = None;
                self.exit_code = None;
            }
            StatusUpdate::Running { pid } => {
                self.status = Some(ProcessStatus::Running);
                self.pid = *pid;
                self.error = None;
                self.started_at = Some(Instant::now());
            }
            StatusUpdate::Stopping => self.status = Some(ProcessStatus::Stopping),
            StatusUpdate::Exited {
                code,
                stopped_by_user,
                ..
            } => {
                self.status = Some(if *stopped_by_user || *code == 0 {
                    ProcessStatus::Exit
                } else {
                    ProcessStatus::Error
                });
                self.exit_code = Some(*code);
                self.pid = None;
                self.stopped_at = Some(Instant::now());
            }
            StatusUpdate::Failed(failure) => {
                self.status = Some(ProcessStatus::Error);
                self.error = Some(failure.describe());
                self.pid = None;
            }
        }
    }

    pub fn uptime(&self) -> Option<Duration> {
        match self.status {
            Some(ProcessStatus::Running) => self.started_at.map(|at| at.elapsed()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ProcessState {
        ProcessState::new(&ProcessDefinition::new("api", Command::Shell("true".into())))
    }

    #[test]
    fn restart_policy_table() {
        assert!(!RestartPolicy::Never.should_restart(false, 1));
        assert!(RestartPolicy::OnError.should_restart(false, 1));
        assert!(!RestartPolicy::OnError.should_restart(false, 0));
        assert!(RestartPolicy::Always.should_restart(false, 0));
        assert!(!RestartPolicy::Always.should_restart(true, 1));
        assert!(!RestartPolicy::OnError.should_restart(true, 1));
    }

    #[test]
    fn starting_status_priority() {
        let mut process = state();
        process.apply(&StatusUpdate::Starting {
            restart: true,
            delayed: true,
            waiting: true,
        });
        assert_eq!(process.status, Some(ProcessStatus::Restarting));
        assert_eq!(process.restarts, 1);
        process.apply(&StatusUpdate::Starting {
            restart: false,
            delayed: true,
            waiting: true,
        });
        assert_eq!(process.status, Some(ProcessStatus::Delayed));
        process.apply(&StatusUpdate::Starting {
            restart: false,
            delayed: false,
            waiting: true,
        });
        assert_eq!(process.status, Some(ProcessStatus::Waiting));
    }

    #[test]
    fn exit_status_depends_on_code_and_stop() {
        let mut process = state();
        process.apply(&StatusUpdate::Running { pid: Some(42) });
        assert_eq!(process.pid, Some(42));
        process.apply(&StatusUpdate::Exited {
            code: 3,
            signal: None,
            stopped_by_user: false,
        });
        assert_eq!(process.status, Some(ProcessStatus::Error));
        assert_eq!(process.pid, None);

        process.apply(&StatusUpdate::Exited {
            code: 143,
            signal: Some("SIGTERM".into()),
            stopped_by_user: true,
        });
        assert_eq!(process.status, Some(ProcessStatus::Exit));
    }

    #[test]
    fn running_clears_previous_error() {
        let mut process = state();
        process.apply(&StatusUpdate::Failed(ProcessFailure {
            name: "WaitError".into(),
            message: "api exited with code 1".into(),
            detail: String::new(),
        }));
        process.apply(&StatusUpdate::Running { pid: Some(7) });
        assert_eq!(process.status, Some(ProcessStatus::Running));
        assert_eq!(process.error, None);
    }

    #[test]
    fn failure_keeps_message_and_detail() {
        let mut process = state();
        process.apply(&StatusUpdate::Failed(ProcessFailure {
            name: "Spawn".into(),
            message: "failed to spawn api".into(),
            detail: "No such file or directory".into(),
        }));
        assert_eq!(process.status, Some(ProcessStatus::Error));
        let error = process.error.expect("error text");
        assert!(error.contains("failed to spawn api"));
        assert!(error.contains("No such file"));
    }

    #[test]
    fn startable_and_stoppable() {
        assert!(is_startable(None));
        assert!(is_startable(Some(ProcessStatus::Exit)));
        assert!(is_startable(Some(ProcessStatus::Error)));
        assert!(!is_startable(Some(ProcessStatus::Running)));
        assert!(!is_startable(Some(ProcessStatus::Waiting)));
        assert!(is_stoppable(Some(ProcessStatus::Running)));
        assert!(!is_stoppable(Some(ProcessStatus::Stopping)));
    }

    #[test]
    fn params_are_appended_and_quoted() {
        let shell = Command::Shell("npm run dev".into());
        assert_eq!(
            shell.with_params(&["--port".into(), "3000 x".into()]),
            Command::Shell("npm run dev --port '3000 x'".into())
        );
        let args = Command::Args(vec!["cargo".into(), "run".into()]);
        assert_eq!(
            args.with_params(&["--release".into()]),
            Command::Args(vec!["cargo".into(), "run".into(), "--release".into()])
        );
    }

    #[test]
    fn ignore_params_keeps_command() {
        let mut definition = ProcessDefinition::new("db", Command::Args(vec!["postgres".into()]));
        definition.ignore_params = true;
        let spec = definition
            .spawn_spec(&["--verbose".into()], TerminalSize::default())
            .expect("spawn spec");
        assert_eq!(spec.program, "postgres");
        assert!(spec.args.is_empty());
    }

    #[test]
    fn empty_command_has_no_spawn_spec() {
        let definition = ProcessDefinition::new("x", Command::Args(Vec::new()));
        assert!(definition.spawn_spec(&[], TerminalSize::default()).is_none());
    }
}
