// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Autotest Grader - Sandboxed Submission Grading
//!
//! Grades student commits by running an untrusted grading image against the
//! assignment and the submission, each run inside its own network-isolated
//! docker container.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         GradingTask (JSON)                           │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        autotest-grader                               │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌──────────────┐    │
//! │  │ Repository │  │   Grader   │  │  Control   │  │   Cleanup    │    │
//! │  │   (git)    │  │            │  │  Channel   │  │   Worker     │    │
//! │  └────────────┘  └─────┬──────┘  └─────┬──────┘  └──────────────┘    │
//! │                        │               │ NET ALLOW <url>             │
//! │               ┌────────┴───────┐       │                             │
//! │               ▼                ▼       ▼                             │
//! │        ┌────────────┐   ┌──────────────────┐                         │
//! │        │  MAC pool  │   │ iptables chain   │                         │
//! │        └────────────┘   │ grader-<mac>     │                         │
//! │                         └──────────────────┘                         │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ docker create / start / wait
//!                                   ▼
//!                     ┌───────────────────────────┐
//!                     │  Grading container        │
//!                     │  /input    (sources)      │
//!                     │  /archive  (report.json)  │
//!                     └───────────────────────────┘
//! ```
//!
//! # Run lifecycle
//!
//! Each run acquires a unique MAC address and a firewall chain keyed on it.
//! The chain starts with DNS only; everything else is dropped by the host
//! `FORWARD` policy until the container asks for it over the control channel.
//! When the time limit is hit the container is stopped. Container, chain and
//! address are released on every exit path.
//!
//! | State | Meaning |
//! |-------|---------|
//! | `SUCCESS` | A valid `report.json` was produced |
//! | `TIMEOUT` | The container was stopped at the time limit |
//! | `INVALID_REPORT` | The container exited without a valid report |
//! | `FAIL` | The run could not be carried out |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `AUTOTEST_DATA_DIR` | `.data` | Root for run workspaces |
//! | `AUTOTEST_CONTROL_ADDR` | `0.0.0.0:7070` | Control-channel bind address |
//! | `AUTOTEST_HOST_IP` | default route | Address containers dial back to |
//! | `AUTOTEST_DOCKER_NETWORK` | - | Docker network for grading containers |
//! | `AUTOTEST_STOP_GRACE_SECS` | `10` | `docker stop --time` |
//! | `AUTOTEST_MAX_CONCURRENT_RUNS` | `4` | Runs executing at once |
//! | `AUTOTEST_CLEANUP_POLL_SECS` | `3600` | Stale workspace sweep interval |
//! | `AUTOTEST_CLEANUP_MAX_AGE_SECS` | `86400` | Age of an abandoned workspace |

#![deny(missing_docs)]

/// External command execution.
pub mod command;

/// Configuration loaded from environment variables.
pub mod config;

/// Container lifecycle control (docker and in-memory).
pub mod container;

/// Control channel between containers and the host.
pub mod control;

/// Error types for grading operations.
pub mod error;

/// Grading orchestrator.
pub mod grader;

/// Process-wide host resources and per-run workspaces.
pub mod host;

/// Network identities and per-container firewall chains.
pub mod network;

/// Grade reports, container output and commit records.
pub mod report;

/// Fetching assignment and solution sources.
pub mod repository;

/// Grading task input.
pub mod task;

/// Background worker for cleaning up abandoned run directories.
pub mod cleanup_worker;

/// Embeddable runtime for autotest-grader.
pub mod runtime;

pub use config::Config;
pub use error::Error;
pub use grader::{Grader, RunResult};
pub use host::{HostContext, RunWorkspace};
pub use report::{CommitRecord, ContainerOutput, ContainerState, GradeReport};
pub use runtime::{GraderHandle, GraderRuntime};
pub use task::GradingTask;
