// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host resource context.
//!
//! Shared by every run: the control channel, the MAC address pool, the
//! firewall controller and lazily resolved host facts (IP and UID). Also hands
//! out per-run workspaces.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{Command, CommandError, CommandExecutor};
use crate::control::{ControlServer, PendingConnection};
use crate::network::{ContainerFirewall, FirewallController, MacAddress, MacAddressPool};

/// Errors resolving host facts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HostError {
    /// The lookup command failed.
    #[error("Host lookup failed: {0}")]
    Command(#[from] CommandError),

    /// The lookup output could not be understood.
    #[error("Unexpected output from {command}: {output:?}")]
    Unparseable {
        /// Command that was run.
        command: &'static str,
        /// What it printed.
        output: String,
    },
}

/// Result type for host lookups.
pub type Result<T> = std::result::Result<T, HostError>;

/// Process-wide resources shared by all runs.
pub struct HostContext {
    control: Arc<ControlServer>,
    executor: Arc<dyn CommandExecutor>,
    firewall_controller: Arc<dyn FirewallController>,
    pool: MacAddressPool,
    temp_root: PathBuf,
    persist_root: PathBuf,
    host_ip: OnceCell<IpAddr>,
    host_uid: OnceCell<u32>,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("control", &self.control)
            .field("temp_root", &self.temp_root)
            .field("persist_root", &self.persist_root)
            .field("host_ip", &self.host_ip.get())
            .finish()
    }
}

impl HostContext {
    /// Context rooted at `temp_root` (scratch) and `persist_root` (artifacts).
    pub fn new(
        control: Arc<ControlServer>,
        executor: Arc<dyn CommandExecutor>,
        firewall_controller: Arc<dyn FirewallController>,
        temp_root: impl Into<PathBuf>,
        persist_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            control,
            executor,
            firewall_controller,
            pool: MacAddressPool::new(),
            temp_root: temp_root.into(),
            persist_root: persist_root.into(),
            host_ip: OnceCell::new(),
            host_uid: OnceCell::new(),
        }
    }

    /// Use a fixed host IP instead of resolving it.
    pub fn with_host_ip(self, ip: Option<IpAddr>) -> Self {
        Self {
            host_ip: OnceCell::new_with(ip),
            ..self
        }
    }

    /// Use a custom address pool.
    pub fn with_pool(self, pool: MacAddressPool) -> Self {
        Self { pool, ..self }
    }

    /// Control-channel port advertised to containers.
    pub fn socket_port(&self) -> u16 {
        self.control.port()
    }

    /// Root of per-run scratch directories.
    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Root of per-run artifact directories.
    pub fn persist_root(&self) -> &Path {
        &self.persist_root
    }

    /// The shared address pool.
    pub fn pool(&self) -> &MacAddressPool {
        &self.pool
    }

    /// Address containers reach the host on.
    ///
    /// Taken from configuration, or else the `src` of the default route.
    pub async fn host_ip(&self) -> Result<IpAddr> {
        self.host_ip
            .get_or_try_init(|| async {
                let ip = Command::new("ip", self.executor.clone())
                    .run(["route", "show", "default"])
                    .await?;
                let resolved = parse_route_src(&ip.output).ok_or(HostError::Unparseable {
                    command: "ip route show default",
                    output: ip.output.clone(),
                })?;
                info!(host_ip = %resolved, "Resolved host IP from default route");
                Ok::<_, HostError>(resolved)
            })
            .await
            .copied()
    }

    /// UID of the grader process, passed to containers as `USER_UID`.
    pub async fn host_uid(&self) -> Result<u32> {
        self.host_uid
            .get_or_try_init(|| async {
                let out = Command::new("id", self.executor.clone()).run(["-u"]).await?;
                let uid = out.output.trim().parse().map_err(|_| HostError::Unparseable {
                    command: "id -u",
                    output: out.output.clone(),
                })?;
                debug!(uid, "Resolved host UID");
                Ok::<u32, HostError>(uid)
            })
            .await
            .copied()
    }

    /// Register interest in a control-channel connection from `addr`.
    pub fn client_socket(&self, addr: IpAddr) -> PendingConnection {
        self.control.expect_connection(addr)
    }

    /// Acquire a MAC address unique among in-flight runs.
    pub fn acquire_mac_address(&self) -> MacAddress {
        self.pool.acquire()
    }

    /// Return a MAC address to the pool.
    pub fn release_mac_address(&self, mac: &MacAddress) {
        self.pool.release(mac)
    }

    /// Firewall for the container using `mac`.
    pub fn firewall(&self, mac: MacAddress) -> ContainerFirewall {
        ContainerFirewall::new(mac, self.firewall_controller.clone())
    }

    /// Directories for run `run_id`.
    pub fn workspace(&self, run_id: Uuid) -> RunWorkspace {
        let name = run_id.to_string();
        RunWorkspace {
            run_id,
            temp_dir: self.temp_root.join(&name),
            persist_dir: self.persist_root.join(&name),
        }
    }
}

/// Directories owned by one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunWorkspace {
    /// Run identifier.
    pub run_id: Uuid,
    /// Scratch space, mounted at `/input`; removed after the run.
    pub temp_dir: PathBuf,
    /// Kept artifacts, mounted at `/archive`.
    pub persist_dir: PathBuf,
}

impl RunWorkspace {
    /// Where the assignment is checked out.
    pub fn assignment_dir(&self) -> PathBuf {
        self.temp_dir.join("assignment")
    }

    /// Where the solution is checked out.
    pub fn solution_dir(&self) -> PathBuf {
        self.temp_dir.join("solution")
    }

    /// Create all directories.
    pub async fn init(&self) -> std::io::Result<()> {
        tokio::try_join!(
            tokio::fs::create_dir_all(self.assignment_dir()),
            tokio::fs::create_dir_all(self.solution_dir()),
            tokio::fs::create_dir_all(&self.persist_dir),
        )?;
        Ok(())
    }

    /// Remove the scratch directory. A missing directory is not an error.
    pub async fn remove_temp_dir(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.temp_dir).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Extract the `src` address from `ip route` output.
fn parse_route_src(output: &str) -> Option<IpAddr> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        parts.find(|p| *p == "src")?;
        parts.next()?.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingExecutor};
    use crate::network::MockFirewallController;

    async fn context(exec: Arc<RecordingExecutor>, root: &Path) -> HostContext {
        let control = Arc::new(
            ControlServer::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        HostContext::new(
            control,
            exec,
            Arc::new(MockFirewallController::new()),
            root.join("tmp"),
            root.join("runs"),
        )
    }

    fn host_executor() -> Arc<RecordingExecutor> {
        Arc::new(RecordingExecutor::with_responder(|program, _| match program {
            "ip" => Ok(CommandOutput::ok(
                "default via 192.168.1.1 dev eth0 proto dhcp src 192.168.1.95 metric 100",
            )),
            "id" => Ok(CommandOutput::ok("1000\n")),
            _ => Ok(CommandOutput::default()),
        }))
    }

    #[test]
    fn test_parse_route_src() {
        assert_eq!(
            parse_route_src("default via 10.0.0.1 dev eth0 src 10.0.0.5"),
            Some("10.0.0.5".parse().unwrap())
        );
        assert_eq!(parse_route_src("default via 10.0.0.1 dev eth0"), None);
        assert_eq!(parse_route_src(""), None);
    }

    #[tokio::test]
    async fn test_host_facts_are_memoized() {
        let dir = tempfile::tempdir().unwrap();
        let exec = host_executor();
        let host = context(exec.clone(), dir.path()).await;

        for _ in 0..3 {
            assert_eq!(host.host_ip().await.unwrap(), "192.168.1.95".parse::<IpAddr>().unwrap());
            assert_eq!(host.host_uid().await.unwrap(), 1000);
        }
        assert_eq!(exec.count("ip"), 1);
        assert_eq!(exec.count("id"), 1);
    }

    #[tokio::test]
    async fn test_configured_ip_skips_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let exec = host_executor();
        let host = context(exec.clone(), dir.path())
            .await
            .with_host_ip(Some("172.17.0.1".parse().unwrap()));

        assert_eq!(host.host_ip().await.unwrap(), "172.17.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(exec.count("ip"), 0);
    }

    #[tokio::test]
    async fn test_workspace_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let host = context(host_executor(), dir.path()).await;
        let ws = host.workspace(Uuid::new_v4());

        assert!(ws.temp_dir.starts_with(host.temp_root()));
        assert!(ws.persist_dir.starts_with(host.persist_root()));

        ws.init().await.unwrap();
        assert!(ws.assignment_dir().is_dir());
        assert!(ws.solution_dir().is_dir());
        assert!(ws.persist_dir.is_dir());

        ws.remove_temp_dir().await.unwrap();
        assert!(!ws.temp_dir.exists());
        assert!(ws.persist_dir.exists());
        // Second removal finds nothing and still succeeds.
        ws.remove_temp_dir().await.unwrap();
    }

    #[tokio::test]
    async fn test_mac_addresses_round_trip_through_pool() {
        let dir = tempfile::tempdir().unwrap();
        let host = context(host_executor(), dir.path()).await;

        let mac = host.acquire_mac_address();
        assert!(host.pool().is_held(&mac));
        let firewall = host.firewall(mac.clone());
        assert_eq!(firewall.mac(), &mac);
        host.release_mac_address(&mac);
        assert!(!host.pool().is_held(&mac));
    }
}
