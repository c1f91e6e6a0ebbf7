// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for autotest-grader integration tests.
//!
//! Provides TestContext wiring a Grader to in-memory fakes and a real
//! loopback control channel.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};

use autotest_grader::command::{CommandOutput, RecordingExecutor};
use autotest_grader::container::{ContainerControl, MockBehavior, MockEngine};
use autotest_grader::control::ControlServer;
use autotest_grader::grader::Grader;
use autotest_grader::host::HostContext;
use autotest_grader::network::MockFirewallController;
use autotest_grader::repository::MockRepository;
use autotest_grader::task::GradingTask;

/// Grader plus every fake behind it.
pub struct TestContext {
    pub grader: Grader,
    pub host: Arc<HostContext>,
    pub engine: Arc<MockEngine>,
    pub firewall: Arc<MockFirewallController>,
    pub repository: Arc<MockRepository>,
    pub executor: Arc<RecordingExecutor>,
    pub control: Arc<ControlServer>,
    /// MACs still held by the pool at each chain removal.
    pub held_at_remove: Arc<Mutex<Vec<usize>>>,
    pub temp_dir: tempfile::TempDir,
}

/// Knobs for [`TestContext::build`].
pub struct Setup {
    pub behavior: MockBehavior,
    pub repository: MockRepository,
    pub firewall_failing: bool,
    /// Make the scratch root unusable so workspace init fails.
    pub break_temp_root: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            behavior: MockBehavior::default(),
            repository: MockRepository::new(),
            firewall_failing: false,
            break_temp_root: false,
        }
    }
}

impl TestContext {
    pub async fn new(behavior: MockBehavior) -> Self {
        Self::build(Setup {
            behavior,
            ..Setup::default()
        })
        .await
    }

    pub async fn build(setup: Setup) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let temp_root = temp_dir.path().join("tmp");
        let persist_root = temp_dir.path().join("runs");
        if setup.break_temp_root {
            std::fs::write(&temp_root, "not a directory").expect("write");
        }

        let executor = Arc::new(RecordingExecutor::with_responder(|program, _| {
            Ok(match program {
                "id" => CommandOutput::ok("1000"),
                _ => CommandOutput::default(),
            })
        }));

        let control = Arc::new(
            ControlServer::bind("127.0.0.1:0".parse().expect("addr"))
                .await
                .expect("bind control channel"),
        );

        let host_cell: Arc<OnceLock<Arc<HostContext>>> = Arc::new(OnceLock::new());
        let held_at_remove = Arc::new(Mutex::new(Vec::new()));
        let mut firewall = {
            let host_cell = host_cell.clone();
            let held_at_remove = held_at_remove.clone();
            MockFirewallController::new().with_remove_hook(move |_chain| {
                if let Some(host) = host_cell.get() {
                    held_at_remove
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(host.pool().held_count());
                }
            })
        };
        firewall.fail_all = setup.firewall_failing;
        let firewall = Arc::new(firewall);

        let host = Arc::new(
            HostContext::new(
                control.clone(),
                executor.clone(),
                firewall.clone(),
                temp_root,
                persist_root,
            )
            .with_host_ip(Some("127.0.0.1".parse().expect("ip"))),
        );
        let _ = host_cell.set(host.clone());

        let engine = Arc::new(MockEngine::new(setup.behavior));
        let repository = Arc::new(setup.repository);
        let grader = Grader::new(host.clone(), engine.clone(), repository.clone());

        Self {
            grader,
            host,
            engine,
            firewall,
            repository,
            executor,
            control,
            held_at_remove,
            temp_dir,
        }
    }

    pub fn held_at_remove(&self) -> Vec<usize> {
        self.held_at_remove
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every container, chain and address of finished runs is gone.
    pub fn assert_torn_down(&self) {
        assert!(
            self.firewall.user_chains().is_empty(),
            "chains left behind: {:?}",
            self.firewall.user_chains()
        );
        assert_eq!(self.host.pool().held_count(), 0, "MAC addresses still held");
        assert_eq!(self.control.pending_count(), 0, "control registrations left");
        for container in self.engine.containers() {
            if container.id().is_some() {
                assert_eq!(container.count("remove"), 1, "container not removed");
            }
        }
    }
}

/// Poll `cond` until it holds or `limit` elapses.
pub async fn eventually<F: Fn() -> bool>(limit: Duration, cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub fn report_json(score: f64) -> Value {
    json!({
        "scoreOverall": score,
        "scoreTest": score,
        "scoreCover": null,
        "passNames": ["a"],
        "failNames": ["b"],
        "errorNames": [],
        "skipNames": [],
        "custom": {},
        "feedback": "Tests: 50%"
    })
}

pub fn task(timeout_ms: u64) -> GradingTask {
    serde_json::from_value(json!({
        "delivId": "d1",
        "courseId": "cs310",
        "pushInfo": {
            "branch": "refs/heads/main",
            "repo": "team1",
            "commitSHA": "abc123",
            "commitURL": "https://github.com/org/team1/commit/abc123",
            "org": "org",
            "projectURL": "https://github.com/org/team1.git",
            "postbackURL": "https://api.github.com/repos/org/team1/commits/abc123/comments",
            "timestamp": 1700000000000i64
        },
        "assignment": {
            "url": "https://github.com/org/team1.git",
            "reference": "abc123"
        },
        "solution": {
            "url": "https://github.com/org/solutions.git",
            "reference": "d1"
        },
        "container": {
            "image": "autotest/cs310:latest",
            "timeoutMs": timeout_ms,
            "logSize": 1024
        },
        "custom": {}
    }))
    .expect("valid task")
}
