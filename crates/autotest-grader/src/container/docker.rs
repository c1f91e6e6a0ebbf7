// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker CLI backend.
//!
//! Each [`ContainerControl`] method is one `docker` invocation through the
//! command runner. Errors carry the CLI's exit code and output.

use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use super::options::ContainerOptions;
use super::traits::{ContainerControl, ContainerEngine, ContainerError, Result};
use crate::command::{Command, CommandExecutor};

/// Default `docker stop --time` grace period.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// A container managed through the `docker` CLI.
#[derive(Debug)]
pub struct DockerContainer {
    image: String,
    id: OnceLock<String>,
    docker: Command,
    stop_grace_secs: u64,
}

impl DockerContainer {
    /// Handle for `image`, not yet created.
    pub fn new(image: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            image: image.into(),
            id: OnceLock::new(),
            docker: Command::new("docker", executor),
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
        }
    }

    /// Override the stop grace period.
    pub fn with_stop_grace(mut self, secs: u64) -> Self {
        self.stop_grace_secs = secs;
        self
    }

    fn require_id(&self) -> Result<&str> {
        self.id
            .get()
            .map(String::as_str)
            .ok_or_else(|| ContainerError::NotCreated(self.image.clone()))
    }
}

#[async_trait]
impl ContainerControl for DockerContainer {
    fn image(&self) -> &str {
        &self.image
    }

    fn id(&self) -> Option<String> {
        self.id.get().cloned()
    }

    async fn create(&self, options: &ContainerOptions) -> Result<String> {
        if let Some(id) = self.id.get() {
            return Err(ContainerError::AlreadyCreated(id.clone()));
        }

        let mut args = vec!["create".to_string()];
        args.extend(options.to_args());
        args.push(self.image.clone());

        let out = self.docker.run(args).await?;
        // Pull progress may precede the id; the id is always the last line.
        let id = out
            .output
            .lines()
            .last()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ContainerError::Other("docker create returned no id".to_string()))?
            .to_string();

        self.id
            .set(id.clone())
            .map_err(ContainerError::AlreadyCreated)?;
        info!(container_id = %id, image = %self.image, "Container created");
        Ok(id)
    }

    async fn start(&self) -> Result<()> {
        let id = self.require_id()?;
        self.docker.run(["start", id]).await?;
        debug!(container_id = %id, "Container started");
        Ok(())
    }

    async fn inspect(&self, format: &str) -> Result<String> {
        let id = self.require_id()?;
        let out = self.docker.run(["inspect", "--format", format, id]).await?;
        Ok(out.output)
    }

    async fn wait(&self) -> Result<i32> {
        let id = self.require_id()?;
        let out = self.docker.run(["wait", id]).await?;
        out.output
            .trim()
            .parse()
            .map_err(|_| ContainerError::ExitStatus(out.output.clone()))
    }

    async fn logs(&self) -> Result<String> {
        let id = self.require_id()?;
        let out = self.docker.run(["logs", id]).await?;
        Ok(out.output)
    }

    async fn stop(&self) -> Result<()> {
        let id = self.require_id()?;
        let grace = self.stop_grace_secs.to_string();
        self.docker.run(["stop", "--time", grace.as_str(), id]).await?;
        info!(container_id = %id, "Container stopped");
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        let id = self.require_id()?;
        self.docker.run(["rm", "--force", id]).await?;
        debug!(container_id = %id, "Container removed");
        Ok(())
    }
}

/// Engine producing [`DockerContainer`]s.
#[derive(Clone)]
pub struct DockerEngine {
    executor: Arc<dyn CommandExecutor>,
    stop_grace_secs: u64,
}

impl DockerEngine {
    /// Engine running `docker` through `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>, stop_grace_secs: u64) -> Self {
        Self {
            executor,
            stop_grace_secs,
        }
    }
}

impl ContainerEngine for DockerEngine {
    fn container(&self, image: &str) -> Arc<dyn ContainerControl> {
        Arc::new(
            DockerContainer::new(image, self.executor.clone()).with_stop_grace(self.stop_grace_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingExecutor};

    fn executor() -> Arc<RecordingExecutor> {
        Arc::new(RecordingExecutor::with_responder(|_, args| {
            match args.first().map(String::as_str) {
                Some("create") => Ok(CommandOutput::ok("Pulling...\nabc123")),
                Some("wait") => Ok(CommandOutput::ok("137\n")),
                Some("inspect") => Ok(CommandOutput::ok("172.17.0.5")),
                Some("logs") => Ok(CommandOutput::ok("test output")),
                _ => Ok(CommandOutput::default()),
            }
        }))
    }

    #[tokio::test]
    async fn test_lifecycle_invocations() {
        let exec = executor();
        let container = DockerContainer::new("grader:latest", exec.clone()).with_stop_grace(5);
        let options = ContainerOptions::new().env("A", "1");

        assert_eq!(container.create(&options).await.unwrap(), "abc123");
        container.start().await.unwrap();
        assert_eq!(
            container
                .inspect("{{.NetworkSettings.IPAddress}}")
                .await
                .unwrap(),
            "172.17.0.5"
        );
        assert_eq!(container.wait().await.unwrap(), 137);
        assert_eq!(container.logs().await.unwrap(), "test output");
        container.stop().await.unwrap();
        container.remove().await.unwrap();

        let lines: Vec<String> = exec.calls().iter().map(|c| c.line()).collect();
        assert_eq!(
            lines,
            vec![
                "create --env A=1 grader:latest",
                "start abc123",
                "inspect --format {{.NetworkSettings.IPAddress}} abc123",
                "wait abc123",
                "logs abc123",
                "stop --time 5 abc123",
                "rm --force abc123",
            ]
        );
        assert_eq!(exec.count("docker"), 7);
    }

    #[tokio::test]
    async fn test_operations_require_create() {
        let container = DockerContainer::new("img", executor());
        assert!(matches!(
            container.start().await.unwrap_err(),
            ContainerError::NotCreated(_)
        ));
        assert!(container.id().is_none());
    }

    #[tokio::test]
    async fn test_create_twice_rejected() {
        let container = DockerContainer::new("img", executor());
        let options = ContainerOptions::new();
        container.create(&options).await.unwrap();
        assert!(matches!(
            container.create(&options).await.unwrap_err(),
            ContainerError::AlreadyCreated(_)
        ));
    }

    #[tokio::test]
    async fn test_cli_failure_propagates() {
        let exec = Arc::new(RecordingExecutor::failing(125, "No such image"));
        let container = DockerContainer::new("missing", exec);
        let err = container.create(&ContainerOptions::new()).await.unwrap_err();
        assert!(err.to_string().contains("No such image"));
    }
}
