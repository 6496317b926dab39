// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

//! Provisioning of ad-hoc test nodes for spread, with all-or-nothing
//! creation of node batches and cleanup on provider close.

pub mod batch;
pub mod config;
pub mod driver;
pub mod executor;
pub mod lxd;
pub mod node;
pub mod pipeline;
pub mod provider;
pub mod readiness;
pub mod registry;

#[cfg(test)]
mod testing;

pub use batch::BatchError;
pub use config::{ConfigFile, Overrides, Properties};
pub use driver::{DriverError, ResourceDriver};
pub use node::{Node, NodeStatus};
pub use pipeline::{CreateError, DestroyError, ProvisionError};
pub use provider::{Provider, ProviderError, ProviderState};
