// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Firewall rule model and its iptables rendering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

impl Protocol {
    /// Name as understood by iptables `-p`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule is placed in its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    /// `-A`: add at the tail.
    Append,
    /// `-I`: add at the head.
    Insert,
    /// `-D`: delete the matching rule.
    Delete,
}

impl RuleOp {
    fn flag(&self) -> &'static str {
        match self {
            RuleOp::Append => "-A",
            RuleOp::Insert => "-I",
            RuleOp::Delete => "-D",
        }
    }
}

/// A single packet-filter rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirewallRule {
    /// Chain the rule lives in.
    pub chain: String,
    /// Target: `ACCEPT`, `DROP`, or another chain.
    pub jump: String,
    /// Protocol match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    /// Source address match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Source MAC match (`-m mac --mac-source`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_source: Option<String>,
    /// Destination address or hostname match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Source port match. Requires a protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<u16>,
    /// Destination port match. Requires a protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    /// Connection-tracking states (`-m state --state`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl FirewallRule {
    /// Rule in `chain` jumping to `jump` with no matches.
    pub fn new(chain: impl Into<String>, jump: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            jump: jump.into(),
            ..Default::default()
        }
    }

    /// Match a protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Match a source MAC address.
    pub fn mac_source(mut self, mac: impl Into<String>) -> Self {
        self.mac_source = Some(mac.into());
        self
    }

    /// Match a destination.
    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Match a source port.
    pub fn sport(mut self, port: u16) -> Self {
        self.sport = Some(port);
        self
    }

    /// Match a destination port.
    pub fn dport(mut self, port: u16) -> Self {
        self.dport = Some(port);
        self
    }

    /// Match connection-tracking states, e.g. `NEW,ESTABLISHED`.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Render the iptables argument list for `op`.
    ///
    /// Port matches follow `-p` so the protocol match module is loaded first.
    pub fn to_args(&self, op: RuleOp) -> Vec<String> {
        let mut args = vec![op.flag().to_string(), self.chain.clone()];

        if let Some(protocol) = self.protocol {
            args.push("-p".into());
            args.push(protocol.as_str().into());
            if let Some(sport) = self.sport {
                args.push("--sport".into());
                args.push(sport.to_string());
            }
            if let Some(dport) = self.dport {
                args.push("--dport".into());
                args.push(dport.to_string());
            }
        }
        if let Some(ref source) = self.source {
            args.push("-s".into());
            args.push(source.clone());
        }
        if let Some(ref destination) = self.destination {
            args.push("-d".into());
            args.push(destination.clone());
        }
        if let Some(ref mac) = self.mac_source {
            args.extend(["-m".into(), "mac".into(), "--mac-source".into(), mac.clone()]);
        }
        if let Some(ref state) = self.state {
            args.extend(["-m".into(), "state".into(), "--state".into(), state.clone()]);
        }

        args.push("-j".into());
        args.push(self.jump.clone());
        args
    }
}
