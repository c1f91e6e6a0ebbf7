// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for autotest-grader.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::container::docker::DEFAULT_STOP_GRACE_SECS;

/// Grader configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for run workspaces; absolute so it can be bind-mounted.
    pub data_dir: PathBuf,
    /// Control-channel bind address
    pub control_addr: SocketAddr,
    /// Address containers use to reach the control channel. Resolved from
    /// the default route when unset.
    pub host_ip: Option<IpAddr>,
    /// Docker network grading containers join
    pub docker_network: Option<String>,
    /// Grace period for `docker stop`
    pub stop_grace_secs: u64,
    /// Upper bound on runs executing at once
    pub max_concurrent_runs: usize,
    /// Stale workspace sweep interval
    pub cleanup_poll_interval: Duration,
    /// Age after which an abandoned temp workspace is removed
    pub cleanup_max_age: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: absolute(PathBuf::from(".data")),
            control_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            host_ip: None,
            docker_network: None,
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            max_concurrent_runs: 4,
            cleanup_poll_interval: Duration::from_secs(3600),
            cleanup_max_age: Duration::from_secs(86400),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("AUTOTEST_DATA_DIR")
            .map(|d| absolute(PathBuf::from(d)))
            .unwrap_or(defaults.data_dir);

        let control_addr = match get("AUTOTEST_CONTROL_ADDR") {
            Some(v) => v
                .parse()
                .map_err(|_| ConfigError::InvalidValue("AUTOTEST_CONTROL_ADDR", v))?,
            None => defaults.control_addr,
        };

        let host_ip = get("AUTOTEST_HOST_IP")
            .map(|v| {
                v.parse()
                    .map_err(|_| ConfigError::InvalidValue("AUTOTEST_HOST_IP", v))
            })
            .transpose()?;

        let stop_grace_secs = parse_num(&get, "AUTOTEST_STOP_GRACE_SECS", defaults.stop_grace_secs)?;
        let max_concurrent_runs =
            parse_num(&get, "AUTOTEST_MAX_CONCURRENT_RUNS", defaults.max_concurrent_runs)?;
        if max_concurrent_runs == 0 {
            return Err(ConfigError::InvalidValue(
                "AUTOTEST_MAX_CONCURRENT_RUNS",
                "0".to_string(),
            ));
        }
        let cleanup_poll_secs = parse_num(&get, "AUTOTEST_CLEANUP_POLL_SECS", 3600u64)?;
        let cleanup_max_age_secs = parse_num(&get, "AUTOTEST_CLEANUP_MAX_AGE_SECS", 86400u64)?;

        Ok(Self {
            data_dir,
            control_addr,
            host_ip,
            docker_network: get("AUTOTEST_DOCKER_NETWORK"),
            stop_grace_secs,
            max_concurrent_runs,
            cleanup_poll_interval: Duration::from_secs(cleanup_poll_secs),
            cleanup_max_age: Duration::from_secs(cleanup_max_age_secs),
        })
    }

    /// Where per-run scratch directories live.
    pub fn temp_root(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    /// Where per-run artifacts are kept.
    pub fn persist_root(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}

fn parse_num<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key, v)),
        None => Ok(default),
    }
}

// Bind mounts need absolute host paths.
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {0}: {1:?}")]
    InvalidValue(&'static str, String),
}
