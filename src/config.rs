//! Configuration management for procrack.
//!
//! This module defines the structure of the `procrack.toml` configuration file,
//! loads it, and turns its `[procs.*]` tables into `ProcessDefinition`s in file
//! order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::process::{Command, ProcessDefinition, RestartPolicy};

/// Config files looked up in the working directory, in order.
pub const DEFAULT_CONFIG_FILES: [&str; 2] = ["procrack.toml", ".procrack.toml"];

/// Top-level configuration structure corresponding to `procrack.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: Options,
    /// Process tables keyed by id; kept as raw values to preserve file order.
    #[serde(default)]
    pub procs: toml::Table,
}

/// Global options from the `[options]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Options {
    /// Exit once every process has stopped.
    pub exit_when_all_stopped: Option<ExitWhenAllStopped>,
    /// Grace period between SIGTERM and SIGKILL when stopping.
    pub kill_timeout_ms: Option<u64>,
    /// Pause before a process is restarted by its policy.
    pub restart_delay_ms: Option<u64>,
    /// Scrollback lines kept per process terminal.
    pub scrollback: Option<usize>,
}

/// When the supervisor exits after the last process stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "ExitWhenValue")]
pub enum ExitWhenAllStopped {
    #[default]
    Never,
    Always,
    /// Only when no process ended with a non-zero exit code.
    OnSuccess,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExitWhenValue {
    Flag(bool),
    Mode(String),
}

impl TryFrom<ExitWhenValue> for ExitWhenAllStopped {
    type Error = String;

    fn try_from(value: ExitWhenValue) -> Result<Self, Self::Error> {
        match value {
            ExitWhenValue::Flag(true) => Ok(Self::Always),
            ExitWhenValue::Flag(false) => Ok(Self::Never),
            ExitWhenValue::Mode(mode) => match mode.as_str() {
                "always" => Ok(Self::Always),
                "on-success" | "on_success" | "onSuccess" => Ok(Self::OnSuccess),
                "never" => Ok(Self::Never),
                other => Err(format!(
                    "invalid exit_when_all_stopped '{other}' (expected always, on-success or false)"
                )),
            },
        }
    }
}

/// Configuration for a single process.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Display name of the process (defaults to the id).
    pub name: Option<String>,
    /// Shell script or argument vector.
    pub cmd: CommandConfig,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    /// Pass the supervisor's environment through (default: true).
    pub inherit_env: Option<bool>,
    /// Ids started before this process.
    pub deps: Option<OneOrMany>,
    /// Delay in milliseconds before spawning.
    pub delay: Option<u64>,
    pub restart: Option<RestartPolicy>,
    /// Start with the initial autostart pass (default: true).
    pub autostart: Option<bool>,
    /// Block startup until this process exits.
    pub wait: Option<bool>,
    /// Do not append `--param` values to this command.
    pub ignore_params: Option<bool>,
    pub url: Option<String>,
    /// Delay in milliseconds before opening `url`.
    pub url_delay: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Shell(String),
    Args(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Finds the first default config file present in `dir`.
pub fn find_default_config(dir: &Path) -> Option<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

impl Config {
    /// Process definitions in file order.
    pub fn definitions(&self) -> Result<Vec<ProcessDefinition>> {
        let mut definitions = Vec::with_capacity(self.procs.len());
        for (id, value) in &self.procs {
            let process: ProcessConfig = value
                .clone()
                .try_into()
                .with_context(|| format!("invalid process '{id}'"))?;
            definitions.push(definition_from_config(id, process)?);
        }
        for definition in &definitions {
            for dep in &definition.deps {
                if !self.procs.contains_key(dep) {
                    tracing::warn!(process = %definition.id, dependency = %dep, "unknown dependency ignored");
                }
            }
        }
        Ok(definitions)
    }
}

fn definition_from_config(id: &str, config: ProcessConfig) -> Result<ProcessDefinition> {
    let command = match config.cmd {
        CommandConfig::Shell(script) => {
            if script.trim().is_empty() {
                bail!("empty cmd for {id}");
            }
            Command::Shell(script)
        }
        CommandConfig::Args(args) => {
            if args.is_empty() {
                bail!("empty cmd for {id}");
            }
            Command::Args(args)
        }
    };
    let mut definition = ProcessDefinition::new(id, command);
    if let Some(name) = config.name {
        definition.name = name;
    }
    definition.cwd = config.cwd;
    definition.env = config.env.unwrap_or_default();
    definition.inherit_env = config.inherit_env.unwrap_or(true);
    definition.deps = config.deps.map(OneOrMany::into_vec).unwrap_or_default();
    definition.delay = Duration::from_millis(config.delay.unwrap_or(0));
    definition.restart = config.restart.unwrap_or_default();
    definition.autostart = config.autostart.unwrap_or(true);
    definition.wait = config.wait.unwrap_or(false);
    definition.ignore_params = config.ignore_params.unwrap_or(false);
    definition.url = config.url;
    if let Some(ms) = config.url_delay {
        definition.url_delay = Duration::from_millis(ms);
    }
    Ok(definition)
}

/// Compiles a wildcard pattern (`?` one character, `*` any run) to an
/// anchored regex.
pub fn wildcard_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::from("^");
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                source.push_str(&regex::escape(&literal));
                literal.clear();
                source.push_str(if c == '*' { ".*" } else { "." });
            }
            _ => literal.push(c),
        }
    }
    source.push_str(&regex::escape(&literal));
    source.push('$');
    Regex::new(&source).with_context(|| format!("invalid exclude pattern {pattern}"))
}

/// Drops every definition whose id matches one of the wildcard patterns.
pub fn apply_exclusions(
    definitions: Vec<ProcessDefinition>,
    patterns: &[String],
) -> Result<Vec<ProcessDefinition>> {
    if patterns.is_empty() {
        return Ok(definitions);
    }
    let regexes = patterns
        .iter()
        .map(|pattern| wildcard_regex(pattern))
        .collect::<Result<Vec<_>>>()?;
    Ok(definitions
        .into_iter()
        .filter(|definition| !regexes.iter().any(|re| re.is_match(&definition.id)))
        .collect())
}
