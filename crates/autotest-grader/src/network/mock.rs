// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory firewall controller for testing.
//!
//! Keeps chains as rule lists, enforces the same preconditions iptables does
//! (unique chain names, empty and unreferenced chains on removal) and can
//! answer whether a new packet would be accepted.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::controller::{FirewallController, FirewallError, Result};
use super::identity::MacAddress;
use super::rule::{FirewallRule, Protocol};
use crate::command::CommandError;

/// A recorded controller call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCall {
    /// `create_chain`.
    CreateChain(String),
    /// `insert_rule`.
    Insert(FirewallRule),
    /// `append_rule`.
    Append(FirewallRule),
    /// `delete_rule`.
    Delete(FirewallRule),
    /// `flush_chain`.
    Flush(String),
    /// `remove_chain`.
    RemoveChain(String),
}

/// Outcome of [`MockFirewallController::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Packet accepted by some rule.
    Accept,
    /// Packet fell through to the default policy.
    Drop,
}

const BUILTIN_TARGETS: [&str; 3] = ["ACCEPT", "DROP", "RETURN"];

type RemoveHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct State {
    chains: HashMap<String, Vec<FirewallRule>>,
    calls: Vec<FirewallCall>,
}

/// Mock firewall controller for testing.
pub struct MockFirewallController {
    state: Mutex<State>,
    /// If true, every call fails as if iptables were unavailable.
    pub fail_all: bool,
    on_remove: Option<RemoveHook>,
}

impl Default for MockFirewallController {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFirewallController {
    /// Controller with only the built-in `FORWARD` chain.
    pub fn new() -> Self {
        let mut state = State::default();
        state.chains.insert("FORWARD".to_string(), Vec::new());
        Self {
            state: Mutex::new(state),
            fail_all: false,
            on_remove: None,
        }
    }

    /// Controller whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::new()
        }
    }

    /// Invoke `hook` with the chain name whenever a chain is removed.
    pub fn with_remove_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_remove = Some(Box::new(hook));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.fail_all {
            return Err(FirewallError::Command(CommandError::Failed {
                program: "iptables".to_string(),
                exit_code: 4,
                output: "mock firewall unavailable".to_string(),
            }));
        }
        Ok(())
    }

    /// Every call recorded so far.
    pub fn calls(&self) -> Vec<FirewallCall> {
        self.lock().calls.clone()
    }

    /// Whether `chain` exists.
    pub fn has_chain(&self, chain: &str) -> bool {
        self.lock().chains.contains_key(chain)
    }

    /// Rules currently in `chain` (empty if it does not exist).
    pub fn chain_rules(&self, chain: &str) -> Vec<FirewallRule> {
        self.lock().chains.get(chain).cloned().unwrap_or_default()
    }

    /// Names of all user-defined chains.
    pub fn user_chains(&self) -> Vec<String> {
        self.lock()
            .chains
            .keys()
            .filter(|name| name.as_str() != "FORWARD")
            .cloned()
            .collect()
    }

    /// Number of times `chain` was removed.
    pub fn remove_count(&self, chain: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, FirewallCall::RemoveChain(name) if name == chain))
            .count()
    }

    /// Decide whether a new outbound connection would be forwarded.
    ///
    /// Walks `FORWARD`, following jumps into user chains, and falls back to
    /// DROP. Rules that only match return traffic (source port or
    /// `ESTABLISHED`-only state) never match a new connection.
    pub fn evaluate(
        &self,
        mac: &MacAddress,
        destination: &str,
        protocol: Protocol,
        dport: u16,
    ) -> Verdict {
        let state = self.lock();
        let packet = Packet {
            mac: mac.as_str(),
            destination,
            protocol,
            dport,
        };
        walk(&state.chains, "FORWARD", &packet, 0).unwrap_or(Verdict::Drop)
    }
}

struct Packet<'a> {
    mac: &'a str,
    destination: &'a str,
    protocol: Protocol,
    dport: u16,
}

impl Packet<'_> {
    fn matches(&self, rule: &FirewallRule) -> bool {
        if rule.protocol.is_some_and(|p| p != self.protocol) {
            return false;
        }
        if rule.dport.is_some_and(|p| p != self.dport) || rule.sport.is_some() {
            return false;
        }
        if rule.mac_source.as_deref().is_some_and(|m| m != self.mac) {
            return false;
        }
        if rule.destination.as_deref().is_some_and(|d| d != self.destination) {
            return false;
        }
        if rule.source.is_some() {
            return false;
        }
        if let Some(ref state) = rule.state
            && !state.split(',').any(|s| s == "NEW")
        {
            return false;
        }
        true
    }
}

fn walk(
    chains: &HashMap<String, Vec<FirewallRule>>,
    chain: &str,
    packet: &Packet<'_>,
    depth: usize,
) -> Option<Verdict> {
    if depth > 8 {
        return None;
    }
    for rule in chains.get(chain)? {
        if !packet.matches(rule) {
            continue;
        }
        match rule.jump.as_str() {
            "ACCEPT" => return Some(Verdict::Accept),
            "DROP" => return Some(Verdict::Drop),
            "RETURN" => return None,
            target => {
                if let Some(verdict) = walk(chains, target, packet, depth + 1) {
                    return Some(verdict);
                }
            }
        }
    }
    None
}

impl MockFirewallController {
    fn add_rule(&self, rule: &FirewallRule, at_head: bool) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.push(if at_head {
            FirewallCall::Insert(rule.clone())
        } else {
            FirewallCall::Append(rule.clone())
        });

        if !BUILTIN_TARGETS.contains(&rule.jump.as_str())
            && !state.chains.contains_key(&rule.jump)
        {
            return Err(FirewallError::NoSuchChain(rule.jump.clone()));
        }
        let rules = state
            .chains
            .get_mut(&rule.chain)
            .ok_or_else(|| FirewallError::NoSuchChain(rule.chain.clone()))?;
        if at_head {
            rules.insert(0, rule.clone());
        } else {
            rules.push(rule.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl FirewallController for MockFirewallController {
    async fn create_chain(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.push(FirewallCall::CreateChain(name.to_string()));
        if state.chains.contains_key(name) {
            return Err(FirewallError::ChainExists(name.to_string()));
        }
        state.chains.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn insert_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.add_rule(rule, true)
    }

    async fn append_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.add_rule(rule, false)
    }

    async fn delete_rule(&self, rule: &FirewallRule) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.push(FirewallCall::Delete(rule.clone()));
        let rules = state
            .chains
            .get_mut(&rule.chain)
            .ok_or_else(|| FirewallError::NoSuchChain(rule.chain.clone()))?;
        let pos = rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| FirewallError::RuleNotFound(rule.chain.clone()))?;
        rules.remove(pos);
        Ok(())
    }

    async fn flush_chain(&self, name: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.calls.push(FirewallCall::Flush(name.to_string()));
        state
            .chains
            .get_mut(name)
            .ok_or_else(|| FirewallError::NoSuchChain(name.to_string()))?
            .clear();
        Ok(())
    }

    async fn remove_chain(&self, name: &str) -> Result<()> {
        self.check_available()?;
        {
            let mut state = self.lock();
            state.calls.push(FirewallCall::RemoveChain(name.to_string()));
            let rules = state
                .chains
                .get(name)
                .ok_or_else(|| FirewallError::NoSuchChain(name.to_string()))?;
            let referenced = state.chains.values().flatten().any(|r| r.jump == name);
            if !rules.is_empty() || referenced {
                return Err(FirewallError::ChainBusy(name.to_string()));
            }
            state.chains.remove(name);
        }
        if let Some(ref hook) = self.on_remove {
            hook(name);
        }
        Ok(())
    }
}
