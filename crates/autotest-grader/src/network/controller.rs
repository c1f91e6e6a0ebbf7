// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Firewall-chain manager.
//!
//! Low-level primitives keyed by chain name. Each call is exactly one
//! `iptables` invocation; failures propagate to the caller unchanged.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::rule::{FirewallRule, RuleOp};
use crate::command::{Command, CommandError, CommandExecutor};

/// Errors from firewall administration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FirewallError {
    /// The firewall tool failed.
    #[error("Firewall command failed: {0}")]
    Command(#[from] CommandError),

    /// The chain does not exist.
    #[error("No such chain: {0}")]
    NoSuchChain(String),

    /// The chain already exists.
    #[error("Chain already exists: {0}")]
    ChainExists(String),

    /// The chain still holds rules or is still referenced.
    #[error("Chain busy: {0}")]
    ChainBusy(String),

    /// The rule to delete was not found.
    #[error("Rule not found in chain {0}")]
    RuleNotFound(String),
}

/// Result type for firewall operations.
pub type Result<T> = std::result::Result<T, FirewallError>;

/// Chain and rule administration.
#[async_trait]
pub trait FirewallController: Send + Sync {
    /// Create an empty chain.
    async fn create_chain(&self, name: &str) -> Result<()>;

    /// Add a rule at the head of its chain.
    async fn insert_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Add a rule at the tail of its chain.
    async fn append_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Delete the first rule matching `rule` from its chain.
    async fn delete_rule(&self, rule: &FirewallRule) -> Result<()>;

    /// Remove every rule from a chain.
    async fn flush_chain(&self, name: &str) -> Result<()>;

    /// Remove an empty, unreferenced chain.
    async fn remove_chain(&self, name: &str) -> Result<()>;
}

/// `iptables`-backed controller.
#[derive(Debug, Clone)]
pub struct IptablesController {
    command: Command,
}

impl IptablesController {
    /// Controller invoking `iptables` through `executor`.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            command: Command::new("iptables", executor),
        }
    }

    async fn manage_rule(&self, op: RuleOp, rule: &FirewallRule) -> Result<()> {
        let args = rule.to_args(op);
        debug!(chain = %rule.chain, args = ?args, "Applying firewall rule");
        self.command.run(args).await?;
        Ok(())
    }
}

#[async_trait]
impl FirewallController for IptablesController {
    async fn create_chain(&self, name: &str) -> Result<()> {
        self.command.run(["-N", name]).await?;
        Ok(())
    }

    async fn insert_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.manage_rule(RuleOp::Insert, rule).await
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.manage_rule(RuleOp::Append, rule).await
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.manage_rule(RuleOp::Delete, rule).await
    }

    async fn flush_chain(&self, name: &str) -> Result<()> {
        self.command.run(["-F", name]).await?;
        Ok(())
    }

    async fn remove_chain(&self, name: &str) -> Result<()> {
        self.command.run(["-X", name]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordingExecutor;
    use crate::network::rule::Protocol;

    #[tokio::test]
    async fn test_iptables_invocations() {
        let executor = Arc::new(RecordingExecutor::new());
        let ctrl = IptablesController::new(executor.clone());

        ctrl.create_chain("grader-x").await.unwrap();
        ctrl.append_rule(
            &FirewallRule::new("grader-x", "ACCEPT")
                .destination("10.0.0.1")
                .protocol(Protocol::Tcp)
                .dport(80),
        )
        .await
        .unwrap();
        ctrl.flush_chain("grader-x").await.unwrap();
        ctrl.remove_chain("grader-x").await.unwrap();

        let lines: Vec<String> = executor.calls().iter().map(|c| c.line()).collect();
        assert_eq!(
            lines,
            vec![
                "-N grader-x",
                "-A grader-x -p tcp --dport 80 -d 10.0.0.1 -j ACCEPT",
                "-F grader-x",
                "-X grader-x",
            ]
        );
        assert_eq!(executor.count("iptables"), 4);
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let executor = Arc::new(RecordingExecutor::failing(1, "iptables: Chain already exists."));
        let ctrl = IptablesController::new(executor);

        let err = ctrl.create_chain("grader-x").await.unwrap_err();
        assert!(matches!(err, FirewallError::Command(_)));
        assert!(err.to_string().contains("Chain already exists"));
    }
}
