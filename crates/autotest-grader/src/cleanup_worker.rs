// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker for removing abandoned run scratch directories.
//!
//! Every run removes its own `{temp_root}/{run_id}/` when it finishes. A
//! directory is only left behind when the process died mid-run; this worker
//! periodically removes such leftovers once they are older than `max_age`.
//! Persisted run artifacts are never touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Directory holding per-run scratch directories.
    pub temp_root: PathBuf,
    /// How often to scan.
    pub poll_interval: Duration,
    /// Minimum age before a directory is considered abandoned.
    pub max_age: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            temp_root: PathBuf::from(".data/tmp"),
            poll_interval: Duration::from_secs(3600), // 1 hour
            max_age: Duration::from_secs(24 * 3600),  // 24 hours
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Directories removed.
    pub cleaned: u64,
    /// Entries that could not be inspected or removed.
    pub errors: u64,
}

/// Background worker that removes abandoned scratch directories.
pub struct CleanupWorker {
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(config: CleanupWorkerConfig) -> Self {
        Self {
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            temp_root = %self.config.temp_root.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            "Cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to sweep scratch directories");
                    }
                }
            }
        }

        info!("Cleanup worker stopped");
    }

    /// Remove scratch directories older than `max_age`.
    pub async fn sweep(&self) -> std::io::Result<SweepStats> {
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut stats = SweepStats::default();

        let mut entries = match tokio::fs::read_dir(&self.config.temp_root).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Temp root does not exist, nothing to clean");
                return Ok(stats);
            }
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match remove_if_stale(&path, cutoff).await {
                Ok(true) => stats.cleaned += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to clean scratch directory");
                    stats.errors += 1;
                }
            }
        }

        if stats.cleaned > 0 || stats.errors > 0 {
            info!(
                cleaned = stats.cleaned,
                errors = stats.errors,
                "Cleanup cycle completed"
            );
        } else {
            debug!("Cleanup cycle completed, no abandoned directories found");
        }

        Ok(stats)
    }
}

async fn remove_if_stale(path: &Path, cutoff: DateTime<Utc>) -> std::io::Result<bool> {
    let modified = DateTime::<Utc>::from(tokio::fs::metadata(path).await?.modified()?);
    if modified > cutoff {
        return Ok(false);
    }

    tokio::fs::remove_dir_all(path).await?;
    debug!(
        path = %path.display(),
        age_hours = (Utc::now() - modified).num_hours(),
        "Removed abandoned scratch directory"
    );
    Ok(true)
}
