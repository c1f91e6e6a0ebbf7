// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recording executor for testing.
//!
//! Records every invocation and answers from a caller-supplied responder
//! instead of spawning processes.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use super::{CommandError, CommandExecutor, CommandOutput, Result};

/// A recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Program name.
    pub program: String,
    /// Arguments passed.
    pub args: Vec<String>,
}

impl RecordedCall {
    /// Arguments joined with spaces, handy for assertions.
    pub fn line(&self) -> String {
        self.args.join(" ")
    }
}

type Responder = Box<dyn Fn(&str, &[String]) -> Result<CommandOutput> + Send + Sync>;

/// Executor that records calls and replies via a responder closure.
pub struct RecordingExecutor {
    calls: Mutex<Vec<RecordedCall>>,
    responder: Responder,
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingExecutor {
    /// Executor that answers every call with exit code 0 and empty output.
    pub fn new() -> Self {
        Self::with_responder(|_, _| Ok(CommandOutput::default()))
    }

    /// Executor that answers with the given closure.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, &[String]) -> Result<CommandOutput> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        }
    }

    /// Executor where every call fails with the given exit code and output.
    pub fn failing(exit_code: i32, output: &str) -> Self {
        let output = output.to_string();
        Self::with_responder(move |program, _| {
            Err(CommandError::Failed {
                program: program.to_string(),
                exit_code,
                output: output.clone(),
            })
        })
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of calls made to `program`.
    pub fn count(&self, program: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.program == program)
            .count()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                program: program.to_string(),
                args: args.to_vec(),
            });
        (self.responder)(program, args)
    }
}
