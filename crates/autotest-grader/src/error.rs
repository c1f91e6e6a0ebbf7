// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for autotest-grader.

use thiserror::Error;

/// Grader errors.
///
/// Only [`WorkspaceInit`](Error::WorkspaceInit) and
/// [`ContainerRuntime`](Error::ContainerRuntime) decide a run's outcome;
/// the rest surface from bookkeeping and are logged.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Creating the run's directories failed.
    #[error("Workspace initialization failed: {0}")]
    WorkspaceInit(#[source] std::io::Error),

    /// Fetching the assignment or solution failed.
    #[error("Source fetch failed: {0}")]
    SourceFetch(#[from] crate::repository::RepositoryError),

    /// Creating, starting or waiting on the container failed.
    #[error("Container error: {0}")]
    ContainerRuntime(#[from] crate::container::ContainerError),

    /// Firewall administration failed.
    #[error("Firewall error: {0}")]
    Firewall(#[from] crate::network::FirewallError),

    /// Resolving host facts failed.
    #[error("Host error: {0}")]
    Host(#[from] crate::host::HostError),

    /// The grade report is missing or malformed.
    #[error("Report error: {0}")]
    Report(#[from] crate::report::ReportError),

    /// The control channel failed.
    #[error("Control channel error: {0}")]
    Control(#[from] crate::control::ControlError),

    /// Releasing a run resource failed.
    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    /// External command failed.
    #[error("Command error: {0}")]
    Command(#[from] crate::command::CommandError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using the grader Error.
pub type Result<T> = std::result::Result<T, Error>;
