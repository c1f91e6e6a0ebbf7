// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run firewall.
//!
//! Wraps a [`FirewallController`] with run-scoped semantics. The run's chain
//! is created on first use together with:
//!
//! - a `FORWARD` rule diverting traffic from the run's MAC into the chain,
//! - two DNS rules (udp/53 out NEW,ESTABLISHED and udp/53 back ESTABLISHED).
//!
//! Anything not accepted by the chain falls back to the host's `FORWARD`
//! policy, which is expected to be DROP. Allow rules only accumulate; they are
//! removed all at once by [`ContainerFirewall::delete`].

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::controller::{FirewallController, Result};
use super::identity::MacAddress;
use super::rule::{FirewallRule, Protocol};

/// Prefix of every per-run chain name.
pub const CHAIN_PREFIX: &str = "grader-";

/// Port used by DNS.
const DNS_PORT: u16 = 53;

#[derive(Debug, Default)]
struct ChainState {
    initialized: bool,
    applied: Vec<FirewallRule>,
}

/// Firewall chain owned by a single grading run.
pub struct ContainerFirewall {
    chain: String,
    mac: MacAddress,
    controller: Arc<dyn FirewallController>,
    state: Mutex<ChainState>,
}

impl std::fmt::Debug for ContainerFirewall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerFirewall")
            .field("chain", &self.chain)
            .field("mac", &self.mac)
            .finish()
    }
}

impl ContainerFirewall {
    /// Firewall for the container using `mac`. Nothing is applied yet.
    pub fn new(mac: MacAddress, controller: Arc<dyn FirewallController>) -> Self {
        Self {
            chain: Self::chain_name(&mac),
            mac,
            controller,
            state: Mutex::new(ChainState::default()),
        }
    }

    /// Chain name used for `mac`.
    pub fn chain_name(mac: &MacAddress) -> String {
        format!("{}{}", CHAIN_PREFIX, mac.compact())
    }

    /// This run's chain name.
    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// The MAC address traffic is matched on.
    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    /// Create the chain, the forwarding rule and the DNS rules.
    ///
    /// Runs at most once; later calls return immediately.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.init_locked(&mut state).await
    }

    async fn init_locked(&self, state: &mut ChainState) -> Result<()> {
        if state.initialized {
            return Ok(());
        }

        self.controller.create_chain(&self.chain).await?;
        // From here on delete() has something to remove, even if a later step fails.
        state.initialized = true;

        self.controller.insert_rule(&self.forward_rule()).await?;
        for rule in self.dns_rules() {
            self.controller.insert_rule(&rule).await?;
        }

        info!(chain = %self.chain, mac = %self.mac, "Firewall chain initialized");
        Ok(())
    }

    /// Allow traffic to `host`, optionally restricted to TCP `port`.
    ///
    /// A port of `None` or `0` allows every port on the host.
    pub async fn unblock(&self, host: &str, port: Option<u16>) -> Result<()> {
        let mut state = self.state.lock().await;
        self.init_locked(&mut state).await?;

        let mut rule = FirewallRule::new(&self.chain, "ACCEPT").destination(host);
        if let Some(port) = port.filter(|p| *p > 0) {
            rule = rule.protocol(Protocol::Tcp).dport(port);
        }

        self.controller.append_rule(&rule).await?;
        info!(chain = %self.chain, host = %host, port = ?port, "Unblocked destination");
        state.applied.push(rule);
        Ok(())
    }

    /// Remove the forwarding rule, flush the chain and remove it.
    ///
    /// No-op if the chain was never created or was already deleted.
    pub async fn delete(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            debug!(chain = %self.chain, "Firewall chain never created, nothing to delete");
            return Ok(());
        }

        // The chain cannot be removed while FORWARD still jumps to it.
        // A missing jump (init failed half-way) is not fatal here.
        if let Err(e) = self.controller.delete_rule(&self.forward_rule()).await {
            debug!(chain = %self.chain, error = %e, "Forwarding rule not removed");
        }
        self.controller.flush_chain(&self.chain).await?;
        self.controller.remove_chain(&self.chain).await?;

        state.initialized = false;
        state.applied.clear();
        info!(chain = %self.chain, "Firewall chain deleted");
        Ok(())
    }

    /// Allow rules added via [`unblock`](Self::unblock), in order.
    pub async fn rules(&self) -> Vec<FirewallRule> {
        self.state.lock().await.applied.clone()
    }

    /// Whether the chain currently exists.
    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    fn forward_rule(&self) -> FirewallRule {
        FirewallRule::new("FORWARD", &self.chain).mac_source(self.mac.as_str())
    }

    fn dns_rules(&self) -> [FirewallRule; 2] {
        [
            FirewallRule::new(&self.chain, "ACCEPT")
                .protocol(Protocol::Udp)
                .dport(DNS_PORT)
                .state("NEW,ESTABLISHED"),
            FirewallRule::new(&self.chain, "ACCEPT")
                .protocol(Protocol::Udp)
                .sport(DNS_PORT)
                .state("ESTABLISHED"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mock::{FirewallCall, MockFirewallController, Verdict};

    fn mac() -> MacAddress {
        MacAddress::from_octets([0xAA, 0xBB, 0xCC, 0xDD, 0xEE])
    }

    fn setup() -> (Arc<MockFirewallController>, ContainerFirewall) {
        let ctrl = Arc::new(MockFirewallController::new());
        let fw = ContainerFirewall::new(mac(), ctrl.clone());
        (ctrl, fw)
    }

    #[test]
    fn test_chain_name_fits_iptables_limit() {
        let name = ContainerFirewall::chain_name(&mac());
        assert_eq!(name, "grader-02AABBCCDDEE");
        assert!(name.len() <= 28);
    }

    #[tokio::test]
    async fn test_fresh_firewall_denies_everything_but_dns() {
        let (ctrl, fw) = setup();
        fw.init().await.unwrap();

        let m = mac();
        assert_eq!(
            ctrl.evaluate(&m, "8.8.8.8", Protocol::Udp, 53),
            Verdict::Accept
        );
        assert_eq!(
            ctrl.evaluate(&m, "example.com", Protocol::Tcp, 443),
            Verdict::Drop
        );
        assert_eq!(
            ctrl.evaluate(&m, "10.0.0.1", Protocol::Tcp, 53),
            Verdict::Drop
        );
        assert_eq!(ctrl.chain_rules(fw.chain()).len(), 2);
    }

    #[tokio::test]
    async fn test_unblock_initializes_once() {
        let (ctrl, fw) = setup();

        for port in [80u16, 443, 8080] {
            fw.unblock("example.com", Some(port)).await.unwrap();
        }

        let calls = ctrl.calls();
        let creates = calls
            .iter()
            .filter(|c| matches!(c, FirewallCall::CreateChain(_)))
            .count();
        let forwards = calls
            .iter()
            .filter(|c| matches!(c, FirewallCall::Insert(r) if r.chain == "FORWARD"))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(forwards, 1);
        assert_eq!(ctrl.chain_rules(fw.chain()).len(), 2 + 3);
        assert_eq!(fw.rules().await.len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_unblock_initializes_once() {
        let (ctrl, fw) = setup();
        let fw = Arc::new(fw);

        let tasks: Vec<_> = (0..10u16)
            .map(|i| {
                let fw = fw.clone();
                tokio::spawn(async move { fw.unblock("10.0.0.1", Some(1000 + i)).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let creates = ctrl
            .calls()
            .iter()
            .filter(|c| matches!(c, FirewallCall::CreateChain(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_unblock_port_scoping() {
        let (ctrl, fw) = setup();
        fw.unblock("example.com", Some(443)).await.unwrap();
        fw.unblock("10.1.1.1", None).await.unwrap();
        fw.unblock("10.2.2.2", Some(0)).await.unwrap();

        let m = mac();
        assert_eq!(ctrl.evaluate(&m, "example.com", Protocol::Tcp, 443), Verdict::Accept);
        assert_eq!(ctrl.evaluate(&m, "example.com", Protocol::Tcp, 80), Verdict::Drop);
        assert_eq!(ctrl.evaluate(&m, "10.1.1.1", Protocol::Tcp, 22), Verdict::Accept);
        assert_eq!(ctrl.evaluate(&m, "10.2.2.2", Protocol::Udp, 9999), Verdict::Accept);

        let rules = fw.rules().await;
        assert_eq!(rules[0].protocol, Some(Protocol::Tcp));
        assert_eq!(rules[0].dport, Some(443));
        assert_eq!(rules[1].protocol, None);
        assert_eq!(rules[2].dport, None);
    }

    #[tokio::test]
    async fn test_dns_rules_precede_allow_rules() {
        let (ctrl, fw) = setup();
        fw.unblock("example.com", Some(443)).await.unwrap();

        let rules = ctrl.chain_rules(fw.chain());
        assert_eq!(rules[0].protocol, Some(Protocol::Udp));
        assert_eq!(rules[1].protocol, Some(Protocol::Udp));
        assert_eq!(rules[2].destination.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_delete_without_init_is_noop() {
        let (ctrl, fw) = setup();
        fw.delete().await.unwrap();
        assert!(ctrl.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_chain_once() {
        let (ctrl, fw) = setup();
        fw.unblock("example.com", Some(443)).await.unwrap();

        fw.delete().await.unwrap();
        fw.delete().await.unwrap();

        assert!(!ctrl.has_chain(fw.chain()));
        assert_eq!(ctrl.remove_count(fw.chain()), 1);
        assert_eq!(ctrl.evaluate(&mac(), "example.com", Protocol::Tcp, 443), Verdict::Drop);
        assert!(!fw.is_initialized().await);
    }

    #[tokio::test]
    async fn test_init_failure_propagates() {
        let ctrl = Arc::new(MockFirewallController::failing());
        let fw = ContainerFirewall::new(mac(), ctrl);
        assert!(fw.unblock("example.com", None).await.is_err());
        assert!(fw.rules().await.is_empty());
    }
}
