// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Autotest Grader
//!
//! Reads newline-delimited `GradingTask` JSON on stdin, grades each task in
//! a sandboxed container and prints one `CommitRecord` JSON line per finished
//! run on stdout. Logs go to stderr.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use autotest_grader::config::Config;
use autotest_grader::report::{
    CommitRecord, ContainerOutput, ContainerState, INTERNAL_ERROR_FEEDBACK,
};
use autotest_grader::runtime::GraderRuntime;
use autotest_grader::task::GradingTask;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "autotest_grader=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        control_addr = %config.control_addr,
        data_dir = %config.data_dir.display(),
        max_concurrent_runs = config.max_concurrent_runs,
        "Starting Autotest Grader"
    );

    let runtime = GraderRuntime::builder()
        .config(config)
        .build()?
        .start()
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut runs = JoinSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, finishing in-flight runs");
                break;
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed, finishing in-flight runs");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }

                let task = match serde_json::from_str::<GradingTask>(&line) {
                    Ok(task) => task,
                    Err(e) => {
                        error!(error = %e, "Rejected malformed grading task");
                        emit_rejection(&e);
                        continue;
                    }
                };

                let handle = runtime.handle();
                runs.spawn(async move {
                    let record = match handle.grade(&task).await {
                        Ok(record) => record,
                        Err(e) => {
                            error!(error = %e, commit = %task.push_info.commit_sha, "Run was not started");
                            internal_error_record(task)
                        }
                    };
                    emit(&record);
                });
            }
        }
    }

    while let Some(joined) = runs.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Grading task panicked");
        }
    }

    runtime.shutdown().await?;

    info!("Autotest Grader shut down");

    Ok(())
}

fn internal_error_record(task: GradingTask) -> CommitRecord {
    let mut output = ContainerOutput::new(&task.push_info.commit_url);
    output.state = ContainerState::Fail;
    output.feedback = Some(INTERNAL_ERROR_FEEDBACK.to_string());
    CommitRecord {
        commit_url: task.push_info.commit_url.clone(),
        commit_sha: task.push_info.commit_sha.clone(),
        input: task,
        output,
    }
}

fn emit(record: &CommitRecord) {
    match serde_json::to_string(record) {
        Ok(line) => println!("{line}"),
        Err(e) => error!(error = %e, "Failed to serialize commit record"),
    }
}

fn emit_rejection(err: &serde_json::Error) {
    let line = serde_json::json!({
        "state": ContainerState::Fail,
        "feedback": INTERNAL_ERROR_FEEDBACK,
        "error": err.to_string(),
    });
    println!("{line}");
}
