// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container control - the grading container's lifecycle.

pub mod docker;
pub mod mock;
pub mod options;
mod traits;

pub use docker::{DockerContainer, DockerEngine};
pub use mock::{MockBehavior, MockContainer, MockEngine};
pub use options::{ContainerOptions, Volume};
pub use traits::*;
