// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network isolation for grading containers.
//!
//! Every run draws a MAC address from the [`MacAddressPool`] and gets its own
//! firewall chain ([`ContainerFirewall`]) keyed on that address. The chain
//! starts out allowing DNS only; destinations are opened at runtime through
//! the control channel.

pub mod controller;
pub mod firewall;
pub mod identity;
pub mod mock;
pub mod rule;

pub use controller::{FirewallController, FirewallError, IptablesController};
pub use firewall::ContainerFirewall;
pub use identity::{AddressSource, MacAddress, MacAddressPool, RandomSource};
pub use mock::{FirewallCall, MockFirewallController, Verdict};
pub use rule::{FirewallRule, Protocol, RuleOp};
