// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container engine for testing.
//!
//! Simulates a grading container without a container engine. On start the
//! container optionally dials the control channel advertised in its
//! environment, then exits after a delay, writing a report into its
//! `/archive` mount first.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::options::ContainerOptions;
use super::traits::{ContainerControl, ContainerEngine, ContainerError, Result};

/// Exit code reported for a stopped container.
pub const STOPPED_EXIT_CODE: i32 = 137;

/// Dial attempts before the container gives up on the control channel.
const CONNECT_ATTEMPTS: usize = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// What a mock container does once started.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Time until the container exits on its own; `None` runs until stopped.
    pub run_for: Option<Duration>,
    /// Exit code on natural exit.
    pub exit_code: i32,
    /// Written to `<archive>/report.json` on natural exit.
    pub report: Option<Value>,
    /// Lines sent over the control channel right after start.
    pub control_lines: Vec<String>,
    /// Transcript returned by `logs()`.
    pub logs: String,
    /// Address returned by `inspect()`.
    pub ip: String,
    /// Fail `create()`.
    pub fail_create: bool,
    /// Fail `start()`.
    pub fail_start: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            run_for: Some(Duration::from_millis(10)),
            exit_code: 0,
            report: None,
            control_lines: Vec::new(),
            logs: "mock container output".to_string(),
            ip: "127.0.0.1".to_string(),
            fail_create: false,
            fail_start: false,
        }
    }
}

impl MockBehavior {
    /// Exits after `run_for` having written `report`.
    pub fn reporting(report: Value) -> Self {
        Self {
            report: Some(report),
            ..Self::default()
        }
    }

    /// Never exits on its own.
    pub fn never_exiting() -> Self {
        Self {
            run_for: None,
            ..Self::default()
        }
    }

    /// Fails at `create()`.
    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Fails at `start()`.
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }
}

/// Simulated container.
pub struct MockContainer {
    image: String,
    behavior: MockBehavior,
    id: OnceLock<String>,
    options: Mutex<Option<ContainerOptions>>,
    exit: watch::Sender<Option<i32>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    replies: Arc<Mutex<Vec<String>>>,
    started_at: OnceLock<Instant>,
    stopped_at: OnceLock<Instant>,
}

impl MockContainer {
    /// Container for `image` with the given behavior.
    pub fn new(image: impl Into<String>, behavior: MockBehavior) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            image: image.into(),
            behavior,
            id: OnceLock::new(),
            options: Mutex::new(None),
            exit,
            calls: Mutex::new(HashMap::new()),
            replies: Arc::new(Mutex::new(Vec::new())),
            started_at: OnceLock::new(),
            stopped_at: OnceLock::new(),
        }
    }

    fn record(&self, op: &'static str) {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(op)
            .or_default() += 1;
    }

    /// Number of times `op` (`"create"`, `"stop"`, ...) was called.
    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(op)
            .copied()
            .unwrap_or(0)
    }

    /// Options passed to `create()`.
    pub fn options(&self) -> Option<ContainerOptions> {
        self.options
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replies received on the control channel.
    pub fn replies(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Time from `start()` to the first `stop()`.
    pub fn stopped_after(&self) -> Option<Duration> {
        let started = self.started_at.get()?;
        let stopped = self.stopped_at.get()?;
        Some(stopped.duration_since(*started))
    }

    /// Exit code, once exited.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    fn require_id(&self) -> Result<&str> {
        self.id
            .get()
            .map(String::as_str)
            .ok_or_else(|| ContainerError::NotCreated(self.image.clone()))
    }

    /// Record an exit unless one was already recorded.
    fn mark_exited(exit: &watch::Sender<Option<i32>>, code: i32) -> bool {
        exit.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(code);
                true
            } else {
                false
            }
        })
    }
}

/// Dial the control channel, send every line and collect the replies.
///
/// The server hangs up on a container whose run is not waiting yet, so a
/// connection closed before the first reply is retried.
async fn exchange(addr: String, lines: Vec<String>, replies: Arc<Mutex<Vec<String>>>) {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match converse(&addr, &lines, &replies).await {
            Ok(0) => {
                debug!(addr = %addr, attempt, "Control channel closed before replying, retrying");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Ok(_) => return,
            Err(e) => {
                debug!(addr = %addr, error = %e, "Mock container could not reach control channel");
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

/// One connection. Returns the number of replies received.
async fn converse(
    addr: &str,
    lines: &[String],
    replies: &Mutex<Vec<String>>,
) -> std::io::Result<usize> {
    let stream = TcpStream::connect(addr).await?;
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read).lines();
    let mut received = 0;

    for line in lines {
        if write.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
            break;
        }
        match reader.next_line().await {
            Ok(Some(reply)) => {
                replies
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(reply);
                received += 1;
            }
            _ => break,
        }
    }
    Ok(received)
}

#[async_trait]
impl ContainerControl for MockContainer {
    fn image(&self) -> &str {
        &self.image
    }

    fn id(&self) -> Option<String> {
        self.id.get().cloned()
    }

    async fn create(&self, options: &ContainerOptions) -> Result<String> {
        self.record("create");
        if self.behavior.fail_create {
            return Err(ContainerError::Other("Mock create failure".to_string()));
        }
        let id = format!("mock_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        self.id
            .set(id.clone())
            .map_err(ContainerError::AlreadyCreated)?;
        *self.options.lock().unwrap_or_else(PoisonError::into_inner) = Some(options.clone());
        Ok(id)
    }

    async fn start(&self) -> Result<()> {
        self.record("start");
        self.require_id()?;
        if self.behavior.fail_start {
            return Err(ContainerError::Other("Mock start failure".to_string()));
        }
        let _ = self.started_at.set(Instant::now());

        let options = self.options().unwrap_or_default();
        let control_addr = match (options.env_var("HOST_IP"), options.env_var("HOST_PORT")) {
            (Some(ip), Some(port)) => Some(format!("{}:{}", ip, port)),
            _ => None,
        };
        let archive = options.host_path("/archive").map(|p| p.join("report.json"));
        let lines = self.behavior.control_lines.clone();
        let replies = self.replies.clone();
        let run_for = self.behavior.run_for;
        let exit_code = self.behavior.exit_code;
        let report = self.behavior.report.clone();
        let exit = self.exit.clone();

        tokio::spawn(async move {
            if !lines.is_empty()
                && let Some(addr) = control_addr
            {
                exchange(addr, lines, replies).await;
            }

            let Some(run_for) = run_for else {
                return;
            };
            tokio::time::sleep(run_for).await;

            // A stop that raced the natural exit wins.
            if exit.borrow().is_some() {
                return;
            }
            if let (Some(report), Some(path)) = (report, archive)
                && let Ok(bytes) = serde_json::to_vec_pretty(&report)
            {
                let _ = tokio::fs::write(path, bytes).await;
            }
            MockContainer::mark_exited(&exit, exit_code);
        });
        Ok(())
    }

    async fn inspect(&self, _format: &str) -> Result<String> {
        self.record("inspect");
        self.require_id()?;
        Ok(self.behavior.ip.clone())
    }

    async fn wait(&self) -> Result<i32> {
        self.record("wait");
        self.require_id()?;
        let mut rx = self.exit.subscribe();
        let code = *rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ContainerError::Other("Mock container dropped".to_string()))?;
        Ok(code.unwrap_or(STOPPED_EXIT_CODE))
    }

    async fn logs(&self) -> Result<String> {
        self.record("logs");
        self.require_id()?;
        Ok(self.behavior.logs.clone())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop");
        self.require_id()?;
        let _ = self.stopped_at.set(Instant::now());
        Self::mark_exited(&self.exit, STOPPED_EXIT_CODE);
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.record("remove");
        self.require_id()?;
        Self::mark_exited(&self.exit, STOPPED_EXIT_CODE);
        Ok(())
    }
}

/// Engine producing [`MockContainer`]s that share one behavior.
pub struct MockEngine {
    behavior: MockBehavior,
    containers: Mutex<Vec<Arc<MockContainer>>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(MockBehavior::default())
    }
}

impl MockEngine {
    /// Engine whose containers behave as `behavior`.
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            containers: Mutex::new(Vec::new()),
        }
    }

    /// Every container handed out so far.
    pub fn containers(&self) -> Vec<Arc<MockContainer>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The most recent container.
    pub fn last(&self) -> Option<Arc<MockContainer>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl ContainerEngine for MockEngine {
    fn container(&self, image: &str) -> Arc<dyn ContainerControl> {
        let container = Arc::new(MockContainer::new(image, self.behavior.clone()));
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(container.clone());
        container
    }
}
