// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Grading orchestrator.
//!
//! Grades one commit end to end:
//!
//! 1. create the run's directories,
//! 2. fetch the assignment and solution concurrently,
//! 3. run the grading container behind its own firewall chain while serving
//!    the control channel, stopping it if it outlives the time limit,
//! 4. read the report the container left in `/archive`,
//! 5. persist the commit record.
//!
//! A run always yields a [`CommitRecord`]. Resources taken in step 3 are
//! released on every path, in order: control session, container, firewall
//! chain, MAC address.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::container::{ContainerControl, ContainerEngine, ContainerOptions};
use crate::control::{ControlSession, FirewallHandler};
use crate::error::{Error, Result};
use crate::host::{HostContext, RunWorkspace};
use crate::network::{ContainerFirewall, MacAddress};
use crate::report::{
    CommitRecord, ContainerOutput, ContainerState, GENERIC_FAILURE_FEEDBACK, GradeReport,
    INVALID_REPORT_FEEDBACK, TIMEOUT_FEEDBACK,
};
use crate::repository::Repository;
use crate::task::GradingTask;

/// Report written by the container into `/archive`.
pub const REPORT_FILE: &str = "report.json";
/// Container transcript.
pub const TRANSCRIPT_FILE: &str = "stdio.txt";
/// Persisted record of the run.
pub const COMMIT_RECORD_FILE: &str = "commit_record.json";

/// Template extracting the container's address on its networks.
const CONTAINER_IP_FORMAT: &str = "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}";

/// Outcome of the container phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// The time limit was hit and the container was stopped.
    pub did_timeout: bool,
    /// Transcript, truncated to the task's log size.
    pub log: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Fetching,
    Running,
    Collecting,
    Done,
}

impl Phase {
    fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Fetching => "fetching",
            Phase::Running => "running",
            Phase::Collecting => "collecting",
            Phase::Done => "done",
        }
    }
}

/// Grades commits using shared host resources.
#[derive(Clone)]
pub struct Grader {
    host: Arc<HostContext>,
    engine: Arc<dyn ContainerEngine>,
    repository: Arc<dyn Repository>,
    network: Option<String>,
}

impl Grader {
    /// Grader running containers from `engine` and fetching with `repository`.
    pub fn new(
        host: Arc<HostContext>,
        engine: Arc<dyn ContainerEngine>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            host,
            engine,
            repository,
            network: None,
        }
    }

    /// Attach grading containers to `network`.
    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.network = network;
        self
    }

    /// Host context in use.
    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    /// Grade `task` under a fresh run id.
    pub async fn execute(&self, task: &GradingTask) -> CommitRecord {
        self.execute_with_id(Uuid::new_v4(), task).await
    }

    /// Grade `task` under `run_id`. The run's artifacts end up in
    /// `host.workspace(run_id).persist_dir`.
    pub async fn execute_with_id(&self, run_id: Uuid, task: &GradingTask) -> CommitRecord {
        let span = info_span!(
            "grade",
            run_id = %run_id,
            commit = %task.push_info.commit_sha,
            deliv_id = %task.deliv_id,
        );
        self.grade(self.host.workspace(run_id), task)
            .instrument(span)
            .await
    }

    async fn grade(&self, ws: RunWorkspace, task: &GradingTask) -> CommitRecord {
        let mut out = ContainerOutput::new(&task.push_info.commit_url);

        info!(phase = Phase::Init.as_str(), "Grading started");
        if let Err(e) = ws.init().await.map_err(Error::WorkspaceInit) {
            error!(error = %e, "Could not prepare workspace, not starting container");
            out.feedback = Some(GENERIC_FAILURE_FEEDBACK.to_string());
            return self.finish(&ws, task, out).await;
        }

        info!(phase = Phase::Fetching.as_str(), "Fetching sources");
        if let Err(e) = self.fetch_sources(&ws, task).await {
            // Non-fatal: the image decides what a missing checkout means.
            warn!(error = %e, "Source fetch failed, running container anyway");
            out.feedback = Some(GENERIC_FAILURE_FEEDBACK.to_string());
        }

        info!(phase = Phase::Running.as_str(), image = %task.container.image, "Running container");
        match self.run_container(&ws, task).await {
            Ok(result) => {
                let transcript = ws.persist_dir.join(TRANSCRIPT_FILE);
                if let Err(e) = tokio::fs::write(&transcript, &result.log).await {
                    warn!(error = %e, path = %transcript.display(), "Failed to write transcript");
                }
                if result.did_timeout {
                    out.feedback = Some(TIMEOUT_FEEDBACK.to_string());
                    out.state = ContainerState::Timeout;
                }
            }
            Err(e) => {
                error!(error = %e, "Container run failed");
                out.state = ContainerState::Fail;
            }
        }

        info!(phase = Phase::Collecting.as_str(), "Reading grade report");
        match GradeReport::load(&ws.persist_dir.join(REPORT_FILE)).await {
            Ok(report) => {
                out.feedback = Some(report.feedback.clone());
                out.attachments = report.attachments.clone();
                out.report = Some(report);
                out.state = ContainerState::Success;
                out.postback_on_complete = false;
            }
            Err(e) => {
                warn!(error = %e, "No valid grade report");
                if out.state != ContainerState::Timeout {
                    out.state = ContainerState::InvalidReport;
                    out.feedback
                        .get_or_insert_with(|| INVALID_REPORT_FEEDBACK.to_string());
                }
            }
        }

        self.finish(&ws, task, out).await
    }

    /// Best-effort bookkeeping; failures are logged only.
    async fn finish(
        &self,
        ws: &RunWorkspace,
        task: &GradingTask,
        mut out: ContainerOutput,
    ) -> CommitRecord {
        out.timestamp = chrono::Utc::now().timestamp_millis();

        if let Err(e) = ws.remove_temp_dir().await {
            warn!(error = %e, path = %ws.temp_dir.display(), "Failed to remove temp dir");
        }

        let record = CommitRecord {
            commit_url: task.push_info.commit_url.clone(),
            commit_sha: task.push_info.commit_sha.clone(),
            input: task.clone(),
            output: out,
        };

        let path = ws.persist_dir.join(COMMIT_RECORD_FILE);
        match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    error!(error = %e, path = %path.display(), "Failed to write commit record");
                }
            }
            Err(e) => error!(error = %e, "Failed to serialize commit record"),
        }

        info!(
            phase = Phase::Done.as_str(),
            state = %record.output.state,
            "Grading finished"
        );
        record
    }

    async fn fetch_sources(&self, ws: &RunWorkspace, task: &GradingTask) -> Result<()> {
        let assignment_dir = ws.assignment_dir();
        let solution_dir = ws.solution_dir();
        let assignment_url = task.assignment.authenticated_url();
        let solution_url = task.solution.authenticated_url();

        let (assignment, solution) = tokio::join!(
            self.repository.fetch(
                &assignment_url,
                &assignment_dir,
                task.assignment.reference.as_deref()
            ),
            self.repository.fetch(
                &solution_url,
                &solution_dir,
                task.solution.reference.as_deref()
            ),
        );
        assignment?;
        solution?;
        Ok(())
    }

    /// Run the container with its network identity and firewall, then tear
    /// everything down whatever the outcome.
    #[instrument(skip_all, fields(image = %task.container.image, timeout_ms = task.container.timeout_ms))]
    pub async fn run_container(&self, ws: &RunWorkspace, task: &GradingTask) -> Result<RunResult> {
        let mac = self.host.acquire_mac_address();
        let firewall = Arc::new(self.host.firewall(mac.clone()));
        let container = self.engine.container(&task.container.image);
        let mut resources = RunResources::new(
            self.host.clone(),
            mac.clone(),
            firewall.clone(),
            container.clone(),
        );

        let result = self
            .run_body(ws, task, &mac, &firewall, container.as_ref(), &mut resources)
            .await;
        resources.release().await;
        result
    }

    async fn run_body(
        &self,
        ws: &RunWorkspace,
        task: &GradingTask,
        mac: &MacAddress,
        firewall: &Arc<ContainerFirewall>,
        container: &dyn ContainerControl,
        resources: &mut RunResources,
    ) -> Result<RunResult> {
        let uid = self.host.host_uid().await?;
        let host_ip = self.host.host_ip().await?;

        let options = ContainerOptions::new()
            .env("ASSIGNMENT", &task.deliv_id)
            .env("USER_UID", uid)
            .env("HOST_IP", host_ip)
            .env("HOST_PORT", self.host.socket_port())
            .volume(&ws.temp_dir, "/input")
            .volume(&ws.persist_dir, "/archive")
            .mac_address(mac.clone())
            .network(self.network.clone());

        // Empty chain: everything but DNS is dropped until the container asks.
        firewall.init().await?;

        let container_id = container.create(&options).await?;
        container.start().await?;
        info!(container_id = %container_id, mac = %mac, chain = %firewall.chain(), "Container started");

        let address = container.inspect(CONTAINER_IP_FORMAT).await?;
        match address.trim().parse::<IpAddr>() {
            Ok(ip) => {
                let pending = self.host.client_socket(ip);
                let handler = Arc::new(FirewallHandler::new(firewall.clone()));
                resources.session = Some(ControlSession::spawn(pending, handler));
            }
            Err(_) => {
                warn!(container_id = %container_id, address = %address, "Container has no usable address, control channel disabled");
            }
        }

        let did_timeout = wait_with_timeout(container, task.container.timeout_ms).await?;

        let log = container.logs().await?;
        Ok(RunResult {
            did_timeout,
            log: truncate_log(log, task.container.log_size),
        })
    }
}

/// Wait for the container, stopping it once `timeout_ms` elapses.
///
/// Returns whether the limit was hit. A zero timeout waits indefinitely.
async fn wait_with_timeout(container: &dyn ContainerControl, timeout_ms: u64) -> Result<bool> {
    if timeout_ms == 0 {
        let code = container.wait().await?;
        debug!(exit_code = code, "Container exited");
        return Ok(false);
    }

    tokio::select! {
        code = container.wait() => {
            let code = code?;
            debug!(exit_code = code, "Container exited");
            Ok(false)
        }
        _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
            warn!(timeout_ms, "Time limit exceeded, stopping container");
            container.stop().await?;
            let code = container.wait().await?;
            debug!(exit_code = code, "Container exited after stop");
            Ok(true)
        }
    }
}

/// Keep at most `max` bytes, cut on a character boundary.
pub fn truncate_log(mut log: String, max: Option<usize>) -> String {
    if let Some(max) = max
        && log.len() > max
    {
        let mut end = max;
        while !log.is_char_boundary(end) {
            end -= 1;
        }
        log.truncate(end);
    }
    log
}

/// Resources held by one container run.
struct Teardown {
    host: Arc<HostContext>,
    mac: MacAddress,
    firewall: Arc<ContainerFirewall>,
    container: Arc<dyn ContainerControl>,
    session: Option<ControlSession>,
}

impl Teardown {
    async fn run(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }

        if let Some(id) = self.container.id()
            && let Err(e) = self.container.remove().await
        {
            warn!(container_id = %id, error = %e, "Failed to remove container");
        }

        match self.firewall.delete().await {
            Ok(()) => self.host.release_mac_address(&self.mac),
            // Releasing the address would route a future run into the stale chain.
            Err(e) => error!(
                chain = %self.firewall.chain(),
                mac = %self.mac,
                error = %e,
                "Failed to delete firewall chain, MAC address retired"
            ),
        }
    }
}

/// Scoped owner of a run's resources.
///
/// [`release`](RunResources::release) tears down explicitly; dropping without
/// releasing (e.g. the run future was cancelled) spawns the same teardown.
struct RunResources {
    parts: Option<Teardown>,
    session: Option<ControlSession>,
}

impl RunResources {
    fn new(
        host: Arc<HostContext>,
        mac: MacAddress,
        firewall: Arc<ContainerFirewall>,
        container: Arc<dyn ContainerControl>,
    ) -> Self {
        Self {
            parts: Some(Teardown {
                host,
                mac,
                firewall,
                container,
                session: None,
            }),
            session: None,
        }
    }

    fn take_parts(&mut self) -> Option<Teardown> {
        let mut parts = self.parts.take()?;
        parts.session = self.session.take();
        Some(parts)
    }

    async fn release(&mut self) {
        if let Some(parts) = self.take_parts() {
            parts.run().await;
        }
    }
}

impl Drop for RunResources {
    fn drop(&mut self) {
        let Some(parts) = self.take_parts() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(mac = %parts.mac, "Run dropped before teardown, releasing in background");
                handle.spawn(parts.run());
            }
            Err(_) => error!(mac = %parts.mac, "Run dropped outside a runtime, resources leaked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_log_on_char_boundary() {
        assert_eq!(truncate_log("hello".to_string(), Some(10)), "hello");
        assert_eq!(truncate_log("hello".to_string(), Some(3)), "hel");
        assert_eq!(truncate_log("hello".to_string(), None), "hello");
        // 'é' is two bytes; cutting inside it backs off to the boundary.
        assert_eq!(truncate_log("aé".to_string(), Some(2)), "a");
        assert_eq!(truncate_log("abc".to_string(), Some(0)), "");
    }
}
