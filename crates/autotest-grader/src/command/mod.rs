// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External command execution.
//!
//! Every docker, iptables, git and host-introspection call goes through a
//! [`CommandExecutor`]. Output is captured as a single combined stream
//! (stdout and stderr in arrival order), trimmed, and returned together with
//! the exit code. A non-zero exit is an error carrying the same pair.

pub mod mock;

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as ProcessCommand;
use tracing::{debug, warn};

pub use mock::RecordingExecutor;

/// Errors from command execution.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommandError {
    /// The process could not be spawned (binary missing, permissions, ...).
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to spawn.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The process ran but exited with a non-zero status.
    #[error("{program} exited with code {exit_code}: {output}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit code (-1 when killed by a signal).
        exit_code: i32,
        /// Combined stdout/stderr.
        output: String,
    },

    /// Reading the process output failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    /// Exit code of a failed command, if it ran at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Failed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Combined output of a failed command, if it ran at all.
    pub fn output(&self) -> Option<&str> {
        match self {
            CommandError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Result type for command execution.
pub type Result<T> = std::result::Result<T, CommandError>;

/// Exit code and combined output of a successful command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Process exit code (always 0 for a successful command).
    pub exit_code: i32,
    /// Combined stdout/stderr, trimmed.
    pub output: String,
}

impl CommandOutput {
    /// Successful output with the given text.
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            output: output.into(),
        }
    }
}

/// Runs external programs.
///
/// Implementations resolve with the exit code and output on success and
/// reject with [`CommandError::Failed`] carrying the same pair on a non-zero
/// exit. Nothing is retried at this layer.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args` and wait for it to exit.
    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Executor that spawns real processes via `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemExecutor;

impl SystemExecutor {
    /// Create a new system executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program = %program, args = ?args, "Executing command");

        let mut child = ProcessCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let combined = read_combined(stdout, stderr).await?;
        let status = child.wait().await?;

        let output = String::from_utf8_lossy(&combined).trim().to_string();
        let exit_code = status.code().unwrap_or(-1);

        if status.success() {
            Ok(CommandOutput { exit_code, output })
        } else {
            warn!(program = %program, exit_code, output = %output, "Command failed");
            Err(CommandError::Failed {
                program: program.to_string(),
                exit_code,
                output,
            })
        }
    }
}

/// Drain stdout and stderr concurrently into one buffer, in arrival order.
async fn read_combined<O, E>(stdout: Option<O>, stderr: Option<E>) -> std::io::Result<Vec<u8>>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut combined = Vec::new();
    let mut out_buf = [0u8; 4096];
    let mut err_buf = [0u8; 4096];
    let mut stdout = stdout;
    let mut stderr = stderr;

    loop {
        match (stdout.as_mut(), stderr.as_mut()) {
            (None, None) => break,
            (Some(out), None) => {
                let n = out.read(&mut out_buf).await?;
                if n == 0 {
                    stdout = None;
                } else {
                    combined.extend_from_slice(&out_buf[..n]);
                }
            }
            (None, Some(err)) => {
                let n = err.read(&mut err_buf).await?;
                if n == 0 {
                    stderr = None;
                } else {
                    combined.extend_from_slice(&err_buf[..n]);
                }
            }
            (Some(out), Some(err)) => {
                tokio::select! {
                    n = out.read(&mut out_buf) => {
                        let n = n?;
                        if n == 0 {
                            stdout = None;
                        } else {
                            combined.extend_from_slice(&out_buf[..n]);
                        }
                    }
                    n = err.read(&mut err_buf) => {
                        let n = n?;
                        if n == 0 {
                            stderr = None;
                        } else {
                            combined.extend_from_slice(&err_buf[..n]);
                        }
                    }
                }
            }
        }
    }

    Ok(combined)
}

/// A named program bound to an executor.
///
/// Thin convenience used by the docker, iptables and git wrappers so each
/// call site only supplies arguments.
#[derive(Clone)]
pub struct Command {
    program: String,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("program", &self.program)
            .finish()
    }
}

impl Command {
    /// Bind `program` to `executor`.
    pub fn new(program: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            program: program.into(),
            executor,
        }
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the program with the given arguments.
    pub async fn run<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.executor.execute(&self.program, &args).await
    }
}
