// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-channel protocol.
//!
//! Line-oriented. The only request is `NET ALLOW <url>`; the prefix is
//! matched case-insensitively. A URL with an explicit port opens that TCP
//! port only; without one the whole host is opened. The firewall is IPv4
//! only, so IPv6 literal hosts are refused. Every request gets exactly one
//! reply line:
//!
//! | Reply         | Meaning                                                  |
//! |---------------|----------------------------------------------------------|
//! | `SUCCESS`     | destination opened                                       |
//! | `INVALID_MSG` | not a request, or the URL has no usable IPv4/named host |
//! | `FAILURE`     | the firewall refused the rule                            |

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use url::{Host, Url};

use crate::network::ContainerFirewall;

/// Request prefix.
pub const NET_ALLOW: &str = "NET ALLOW ";

/// Reply: the destination was opened.
pub const SUCCESS: &str = "SUCCESS";
/// Reply: the line was not understood.
pub const INVALID_MSG: &str = "INVALID_MSG";
/// Reply: the request was valid but applying it failed.
pub const FAILURE: &str = "FAILURE";

/// A parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Open egress to `host`, restricted to `port` when known.
    NetAllow {
        /// Hostname or IP address.
        host: String,
        /// Port written in the URL; `None` opens every port.
        port: Option<u16>,
    },
}

/// Parse one line. `None` for anything that is not a well-formed request.
pub fn parse_line(line: &str) -> Option<ControlRequest> {
    let line = line.trim();
    let prefix = line.get(..NET_ALLOW.len())?;
    if !prefix.eq_ignore_ascii_case(NET_ALLOW) {
        return None;
    }

    let url = Url::parse(line[NET_ALLOW.len()..].trim()).ok()?;
    let host = match url.host()? {
        Host::Ipv6(_) => return None,
        Host::Ipv4(addr) => addr.to_string(),
        Host::Domain(domain) if !domain.is_empty() => domain.to_string(),
        Host::Domain(_) => return None,
    };

    Some(ControlRequest::NetAllow {
        host,
        port: url.port(),
    })
}

/// Answers control-channel lines.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Reply (without line terminator) to one request line.
    async fn handle_line(&self, line: &str) -> String;
}

/// Handler that opens destinations on a run's firewall.
#[derive(Debug, Clone)]
pub struct FirewallHandler {
    firewall: Arc<ContainerFirewall>,
}

impl FirewallHandler {
    /// Handler bound to `firewall`.
    pub fn new(firewall: Arc<ContainerFirewall>) -> Self {
        Self { firewall }
    }
}

#[async_trait]
impl ControlHandler for FirewallHandler {
    async fn handle_line(&self, line: &str) -> String {
        let Some(ControlRequest::NetAllow { host, port }) = parse_line(line) else {
            warn!(chain = %self.firewall.chain(), line = %line.trim(), "Invalid control message");
            return INVALID_MSG.to_string();
        };

        match self.firewall.unblock(&host, port).await {
            Ok(()) => {
                info!(chain = %self.firewall.chain(), host = %host, port = ?port, "Container requested egress");
                SUCCESS.to_string()
            }
            Err(e) => {
                warn!(chain = %self.firewall.chain(), host = %host, error = %e, "Failed to unblock destination");
                FAILURE.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{MacAddress, MockFirewallController, Protocol, Verdict};

    #[test]
    fn test_parse_explicit_port() {
        assert_eq!(
            parse_line("NET ALLOW http://example.com:443"),
            Some(ControlRequest::NetAllow {
                host: "example.com".to_string(),
                port: Some(443),
            })
        );
    }

    #[test]
    fn test_parse_without_port_opens_host() {
        assert_eq!(
            parse_line("NET ALLOW https://registry.npmjs.org/some/path"),
            Some(ControlRequest::NetAllow {
                host: "registry.npmjs.org".to_string(),
                port: None,
            })
        );
        // The URL parser normalizes a written default port away.
        assert_eq!(
            parse_line("NET ALLOW http://example.com:80/"),
            Some(ControlRequest::NetAllow {
                host: "example.com".to_string(),
                port: None,
            })
        );
        assert_eq!(
            parse_line("NET ALLOW git://10.0.0.2/repo"),
            Some(ControlRequest::NetAllow {
                host: "10.0.0.2".to_string(),
                port: None,
            })
        );
    }

    #[test]
    fn test_prefix_is_case_insensitive() {
        assert!(parse_line("net allow http://a.example").is_some());
        assert!(parse_line("  Net Allow http://a.example\r\n").is_some());
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_line("HELLO"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("NET ALLOW"), None);
        assert_eq!(parse_line("NET ALLOW not a url"), None);
        assert_eq!(parse_line("NET ALLOW mailto:someone@example.com"), None);
        assert_eq!(parse_line("NET DENY http://example.com"), None);
    }

    #[test]
    fn test_rejects_ipv6_host() {
        assert_eq!(parse_line("NET ALLOW http://[2001:db8::1]:8080/"), None);
        assert_eq!(parse_line("NET ALLOW http://[::ffff:10.0.0.1]/"), None);
    }

    #[tokio::test]
    async fn test_handler_replies() {
        let ctrl = Arc::new(MockFirewallController::new());
        let mac = MacAddress::from_octets([9, 9, 9, 9, 9]);
        let firewall = Arc::new(ContainerFirewall::new(mac.clone(), ctrl.clone()));
        let handler = FirewallHandler::new(firewall.clone());

        assert_eq!(handler.handle_line("NET ALLOW http://example.com:443").await, SUCCESS);
        assert_eq!(handler.handle_line("bogus").await, INVALID_MSG);

        assert_eq!(
            ctrl.evaluate(&mac, "example.com", Protocol::Tcp, 443),
            Verdict::Accept
        );
        assert_eq!(firewall.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_opens_whole_host_without_port() {
        let ctrl = Arc::new(MockFirewallController::new());
        let mac = MacAddress::from_octets([7, 7, 7, 7, 7]);
        let firewall = Arc::new(ContainerFirewall::new(mac.clone(), ctrl.clone()));
        let handler = FirewallHandler::new(firewall.clone());

        assert_eq!(handler.handle_line("NET ALLOW http://example.com").await, SUCCESS);

        assert_eq!(
            ctrl.evaluate(&mac, "example.com", Protocol::Tcp, 80),
            Verdict::Accept
        );
        assert_eq!(
            ctrl.evaluate(&mac, "example.com", Protocol::Tcp, 8080),
            Verdict::Accept
        );
        let rules = firewall.rules().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].dport, None);
        assert_eq!(rules[0].protocol, None);
    }

    #[tokio::test]
    async fn test_handler_refuses_ipv6_host() {
        let ctrl = Arc::new(MockFirewallController::new());
        let firewall = Arc::new(ContainerFirewall::new(
            MacAddress::from_octets([6, 6, 6, 6, 6]),
            ctrl.clone(),
        ));
        let handler = FirewallHandler::new(firewall.clone());

        assert_eq!(
            handler.handle_line("NET ALLOW http://[2001:db8::1]:8080/").await,
            INVALID_MSG
        );
        assert!(firewall.rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_handler_reports_firewall_failure() {
        let ctrl = Arc::new(MockFirewallController::failing());
        let firewall = Arc::new(ContainerFirewall::new(
            MacAddress::from_octets([1, 1, 1, 1, 1]),
            ctrl,
        ));
        let handler = FirewallHandler::new(firewall);

        assert_eq!(handler.handle_line("NET ALLOW http://example.com").await, FAILURE);
    }
}
