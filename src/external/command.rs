//! Base command execution abstraction
//!
//! Runs an external program from a single command line in a given
//! directory, collecting its output streams and exit status. Callers that
//! are not async themselves go through [`run_blocking`], which drives the
//! future on a current-thread runtime.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Output of one finished child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or `-1` when the child was terminated by a signal.
    pub exit_code: i32,
    pub pid: u32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Empty command line")]
    EmptyCommand,
    #[error("Invalid command line (unbalanced quoting): {command}")]
    InvalidCommandLine { command: String },
    #[error("Command not found: {command}")]
    CommandNotFound { command: String },
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("IO error running {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Trait for running external command lines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` with `dir` as its working directory. The child inherits
    /// the environment and standard input of this process.
    async fn run(&self, command: &str, dir: &Path) -> Result<CommandResult, CommandError>;
}

/// Split a command line into program and arguments using POSIX shell-word
/// rules. Nothing is expanded.
pub fn split_command(command: &str) -> Result<(String, Vec<String>), CommandError> {
    let mut words = shlex::split(command)
        .ok_or_else(|| CommandError::InvalidCommandLine {
            command: command.to_string(),
        })?
        .into_iter();

    let program = words.next().ok_or(CommandError::EmptyCommand)?;
    Ok((program, words.collect()))
}

/// Real implementation spawning child processes with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct ProcessCommandRunner {
    timeout: Option<Duration>,
}

impl ProcessCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the child and fail with [`CommandError::Timeout`] once `timeout` elapses.
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, command: &str, dir: &Path) -> Result<CommandResult, CommandError> {
        let (program, args) = split_command(command)?;

        let child = tokio::process::Command::new(&program)
            .args(&args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                // A missing working directory also surfaces as NotFound
                if e.kind() == std::io::ErrorKind::NotFound && dir.is_dir() {
                    CommandError::CommandNotFound {
                        command: program.clone(),
                    }
                } else {
                    CommandError::Io {
                        command: program.clone(),
                        source: e,
                    }
                }
            })?;

        let pid = child.id().unwrap_or_default();
        debug!(program = %program, pid, dir = %dir.display(), "spawned child process");

        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                CommandError::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                }
            })?,
            None => wait.await,
        }
        .map_err(|e| CommandError::Io {
            command: program.clone(),
            source: e,
        })?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            pid,
        })
    }
}

/// Run `command` in `dir` to completion from synchronous code.
///
/// Must not be called from inside a tokio runtime.
pub fn run_blocking(
    runner: &dyn CommandRunner,
    command: &str,
    dir: &Path,
) -> Result<CommandResult, CommandError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CommandError::Io {
            command: command.to_string(),
            source: e,
        })?;

    runtime.block_on(runner.run(command, dir))
}
