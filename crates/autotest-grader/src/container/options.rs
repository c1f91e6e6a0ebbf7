// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Options for creating a grading container.

use std::path::{Path, PathBuf};

use crate::network::MacAddress;

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Absolute host path.
    pub host: PathBuf,
    /// Mount point inside the container.
    pub container: String,
}

/// Environment, mounts and network identity of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Environment variables, in insertion order.
    pub env: Vec<(String, String)>,
    /// Bind mounts.
    pub volumes: Vec<Volume>,
    /// MAC address assigned to the container's interface.
    pub mac_address: Option<MacAddress>,
    /// Engine network to attach to.
    pub network: Option<String>,
}

impl ContainerOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.push((key.into(), value.to_string()));
        self
    }

    /// Mount `host` at `container`.
    pub fn volume(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.volumes.push(Volume {
            host: host.into(),
            container: container.into(),
        });
        self
    }

    /// Assign a MAC address.
    pub fn mac_address(mut self, mac: MacAddress) -> Self {
        self.mac_address = Some(mac);
        self
    }

    /// Attach to a network, if one is given.
    pub fn network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    /// Value of environment variable `key`.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Host path mounted at `container`.
    pub fn host_path(&self, container: &str) -> Option<&Path> {
        self.volumes
            .iter()
            .find(|v| v.container == container)
            .map(|v| v.host.as_path())
    }

    /// Render as `docker create` flags (image not included).
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for volume in &self.volumes {
            args.push("--volume".to_string());
            args.push(format!("{}:{}", volume.host.display(), volume.container));
        }
        if let Some(ref mac) = self.mac_address {
            args.push("--mac-address".to_string());
            args.push(mac.to_string());
        }
        if let Some(ref network) = self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        args
    }
}
