// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `git` CLI backend.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{Repository, Result, redact};
use crate::command::{Command, CommandExecutor};

/// Fetches with `git clone` + `git checkout`.
///
/// Runs through `env GIT_TERMINAL_PROMPT=0` so a bad credential fails
/// instead of blocking on a prompt.
#[derive(Debug, Clone)]
pub struct GitRepository {
    env: Command,
}

impl GitRepository {
    /// Repository backend using `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            env: Command::new("env", executor),
        }
    }
}

#[async_trait]
impl Repository for GitRepository {
    async fn fetch(&self, url: &str, dir: &Path, reference: Option<&str>) -> Result<()> {
        let dir = dir.display().to_string();
        info!(url = %redact(url), dir = %dir, reference = ?reference, "Cloning repository");

        self.env
            .run(["GIT_TERMINAL_PROMPT=0", "git", "clone", url, dir.as_str()])
            .await?;

        if let Some(reference) = reference.filter(|r| !r.is_empty()) {
            self.env
                .run(["GIT_TERMINAL_PROMPT=0", "git", "-C", dir.as_str(), "checkout", reference])
                .await?;
        }
        Ok(())
    }
}
