// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for autotest-grader.
//!
//! [`GraderRuntime`] wires the shared host resources (control channel, MAC
//! pool, firewall controller) to a [`Grader`] and keeps the stale-workspace
//! sweeper running next to it.
//!
//! ```rust,ignore
//! use autotest_grader::{Config, runtime::GraderRuntime};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = GraderRuntime::builder()
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let record = runtime.grade(&task).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! Every backend defaults to the real implementation (`docker`, `iptables`,
//! `git` through [`SystemExecutor`]) and can be swapped for a fake in tests.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::command::{CommandExecutor, SystemExecutor};
use crate::config::Config;
use crate::container::{ContainerEngine, DockerEngine};
use crate::control::ControlServer;
use crate::grader::Grader;
use crate::host::HostContext;
use crate::network::{FirewallController, IptablesController, MacAddressPool};
use crate::report::CommitRecord;
use crate::repository::{GitRepository, Repository};
use crate::task::GradingTask;

/// Builder for creating a [`GraderRuntime`].
#[derive(Default)]
pub struct GraderRuntimeBuilder {
    config: Config,
    executor: Option<Arc<dyn CommandExecutor>>,
    engine: Option<Arc<dyn ContainerEngine>>,
    firewall_controller: Option<Arc<dyn FirewallController>>,
    repository: Option<Arc<dyn Repository>>,
    mac_pool: Option<MacAddressPool>,
}

impl GraderRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default()`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Executor for host commands and for the default backends.
    ///
    /// Default: [`SystemExecutor`]
    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Container engine.
    ///
    /// Default: [`DockerEngine`] on the configured executor
    pub fn engine(mut self, engine: Arc<dyn ContainerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Firewall controller.
    ///
    /// Default: [`IptablesController`] on the configured executor
    pub fn firewall_controller(mut self, controller: Arc<dyn FirewallController>) -> Self {
        self.firewall_controller = Some(controller);
        self
    }

    /// Source repository backend.
    ///
    /// Default: [`GitRepository`] on the configured executor
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// MAC address pool.
    pub fn mac_pool(mut self, pool: MacAddressPool) -> Self {
        self.mac_pool = Some(pool);
        self
    }

    /// Resolve defaults and validate.
    pub fn build(self) -> Result<GraderRuntimeConfig> {
        if self.config.max_concurrent_runs == 0 {
            anyhow::bail!("max_concurrent_runs must be at least 1");
        }

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(SystemExecutor::new()));
        let engine = self.engine.unwrap_or_else(|| {
            Arc::new(DockerEngine::new(
                executor.clone(),
                self.config.stop_grace_secs,
            ))
        });
        let firewall_controller = self
            .firewall_controller
            .unwrap_or_else(|| Arc::new(IptablesController::new(executor.clone())));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(GitRepository::new(executor.clone())));

        Ok(GraderRuntimeConfig {
            config: self.config,
            executor,
            engine,
            firewall_controller,
            repository,
            mac_pool: self.mac_pool.unwrap_or_default(),
        })
    }
}

/// Configuration for a [`GraderRuntime`].
pub struct GraderRuntimeConfig {
    config: Config,
    executor: Arc<dyn CommandExecutor>,
    engine: Arc<dyn ContainerEngine>,
    firewall_controller: Arc<dyn FirewallController>,
    repository: Arc<dyn Repository>,
    mac_pool: MacAddressPool,
}

impl GraderRuntimeConfig {
    /// Bind the control channel and spawn the cleanup worker.
    pub async fn start(self) -> Result<GraderRuntime> {
        let config = self.config;
        let control = Arc::new(ControlServer::bind(config.control_addr).await?);

        let host = Arc::new(
            HostContext::new(
                control.clone(),
                self.executor,
                self.firewall_controller,
                config.temp_root(),
                config.persist_root(),
            )
            .with_host_ip(config.host_ip)
            .with_pool(self.mac_pool),
        );
        tokio::fs::create_dir_all(host.temp_root()).await?;
        tokio::fs::create_dir_all(host.persist_root()).await?;

        let grader = Grader::new(host, self.engine, self.repository)
            .with_network(config.docker_network.clone());

        let cleanup_worker = CleanupWorker::new(CleanupWorkerConfig {
            temp_root: config.temp_root(),
            poll_interval: config.cleanup_poll_interval,
            max_age: config.cleanup_max_age,
        });
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        info!(
            control_addr = %control.local_addr(),
            data_dir = %config.data_dir.display(),
            max_concurrent_runs = config.max_concurrent_runs,
            "GraderRuntime started"
        );

        Ok(GraderRuntime {
            handle: GraderHandle {
                grader,
                permits: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            },
            control,
            cleanup_handle,
            cleanup_shutdown,
        })
    }
}

/// Cloneable entry point for grading, bounded by the concurrency limit.
#[derive(Clone)]
pub struct GraderHandle {
    grader: Grader,
    permits: Arc<Semaphore>,
}

impl GraderHandle {
    /// Grade `task`, waiting for a free slot first.
    pub async fn grade(&self, task: &GradingTask) -> Result<CommitRecord> {
        self.grade_with_id(Uuid::new_v4(), task).await
    }

    /// Grade `task` under `run_id`, waiting for a free slot first.
    pub async fn grade_with_id(&self, run_id: Uuid, task: &GradingTask) -> Result<CommitRecord> {
        let _permit = self.permits.acquire().await?;
        Ok(self.grader.execute_with_id(run_id, task).await)
    }

    /// Slots not currently in use.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Underlying grader.
    pub fn grader(&self) -> &Grader {
        &self.grader
    }
}

/// A running grader that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GraderRuntime {
    handle: GraderHandle,
    control: Arc<ControlServer>,
    cleanup_handle: JoinHandle<()>,
    cleanup_shutdown: Arc<Notify>,
}

impl GraderRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GraderRuntimeBuilder {
        GraderRuntimeBuilder::new()
    }

    /// Handle for submitting runs from other tasks.
    pub fn handle(&self) -> GraderHandle {
        self.handle.clone()
    }

    /// Grade `task` under the concurrency limit.
    pub async fn grade(&self, task: &GradingTask) -> Result<CommitRecord> {
        self.handle.grade(task).await
    }

    /// Control-channel listener.
    pub fn control(&self) -> &Arc<ControlServer> {
        &self.control
    }

    /// Check if the background tasks are still running.
    pub fn is_running(&self) -> bool {
        !self.cleanup_handle.is_finished() && !self.handle.permits.is_closed()
    }

    /// Gracefully shut down the runtime.
    ///
    /// New runs are refused; runs already holding a slot finish normally.
    pub async fn shutdown(self) -> Result<()> {
        info!("GraderRuntime shutting down...");

        self.handle.permits.close();
        self.cleanup_shutdown.notify_one();

        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker task panicked: {}", e);
        }

        self.control.shutdown().await;

        info!("GraderRuntime shutdown complete");
        Ok(())
    }
}
