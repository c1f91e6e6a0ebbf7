// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container control trait definitions.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use super::options::ContainerOptions;
use crate::command::CommandError;

/// Errors from container operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ContainerError {
    /// The container CLI failed.
    #[error("Container command failed: {0}")]
    Command(#[from] CommandError),

    /// An operation needing a container id was called before `create`.
    #[error("Container for image {0} has not been created")]
    NotCreated(String),

    /// `create` was called twice on the same handle.
    #[error("Container {0} already created")]
    AlreadyCreated(String),

    /// The exit code reported by the engine could not be parsed.
    #[error("Unexpected exit status: {0}")]
    ExitStatus(String),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;

/// One container's lifecycle.
///
/// A handle is bound to an image when built and to a container id after
/// [`create`](ContainerControl::create). Each method maps to a single engine
/// invocation; nothing is retried. Handles are shared between the run body and
/// teardown, so every method takes `&self`.
#[async_trait]
pub trait ContainerControl: Send + Sync {
    /// Image the container is created from.
    fn image(&self) -> &str;

    /// Container id, once created.
    fn id(&self) -> Option<String>;

    /// Create the container. Returns the new id.
    async fn create(&self, options: &ContainerOptions) -> Result<String>;

    /// Start the created container.
    async fn start(&self) -> Result<()>;

    /// Query a container property using an engine format template,
    /// e.g. `{{.NetworkSettings.IPAddress}}`.
    async fn inspect(&self, format: &str) -> Result<String>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self) -> Result<i32>;

    /// Combined stdout/stderr transcript.
    async fn logs(&self) -> Result<String>;

    /// Stop the container, killing it after the engine's grace period.
    async fn stop(&self) -> Result<()>;

    /// Remove the container, stopping it first if needed.
    async fn remove(&self) -> Result<()>;
}

/// Factory for container handles.
pub trait ContainerEngine: Send + Sync {
    /// Fresh, not yet created handle for `image`.
    fn container(&self, image: &str) -> Arc<dyn ContainerControl>;
}
