// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control channel between grading containers and the host.
//!
//! The in-container harness connects to `HOST_IP:HOST_PORT` and asks for
//! egress with `NET ALLOW <url>` lines.

pub mod protocol;
pub mod server;

pub use protocol::{ControlHandler, ControlRequest, FirewallHandler, parse_line};
pub use server::{ControlError, ControlServer, ControlSession, PendingConnection};
