// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::net;
use core::time;
use std::path::Path;
use std::sync::Arc;

use thiserror;

use crate::config::{ConfigFile, Properties};
use crate::lxd;
use crate::node::{CreatedResource, Node};
use crate::readiness;

/// Errors reported by backend drivers.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("{0}")]
    Backend(String),
    #[error("{op} is not supported by the {backend} backend")]
    Unsupported { op: &'static str, backend: String },
    #[error("ports {ports:?} on {addr} not reachable within {timeout:?}")]
    PortsTimeout {
        addr: net::IpAddr,
        ports: Vec<u16>,
        timeout: time::Duration,
    },
    #[error("node has no address")]
    NoAddress,
}

impl DriverError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, DriverError::Unsupported { .. })
    }
}

/// Result of executing a command on a node.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Backend specific part of node lifecycle. A provider owns exactly one
/// driver and shares it across all concurrently running pipelines.
pub trait ResourceDriver: Send + Sync {
    /// Short backend label, also used as prefix of backend specific
    /// properties.
    fn label(&self) -> &str;

    /// Allocate a resource for a node.
    fn create(&self, name: &str, props: &Properties) -> Result<CreatedResource, DriverError>;

    /// Destroy a resource with given ID.
    fn destroy(&self, id: &str) -> Result<(), DriverError>;

    /// Post-boot initialization of a freshly created resource.
    fn run_startup_hook(&self, _node: &Node, _props: &Properties) -> Result<(), DriverError> {
        Err(self.unsupported("startup hook"))
    }

    fn wait_for_ports(
        &self,
        node: &Node,
        ports: &[u16],
        timeout: time::Duration,
    ) -> Result<(), DriverError> {
        if ports.is_empty() {
            return Ok(());
        }
        let addr = node.addr().ok_or(DriverError::NoAddress)?;
        readiness::wait_for_ports(addr, ports, timeout)
    }

    /// Release the backend connection.
    fn close(&self) {}

    /// Whether exec is implemented.
    fn supports_exec(&self) -> bool {
        false
    }

    /// Whether files can be copied to and from nodes.
    fn supports_file_copy(&self) -> bool {
        false
    }

    /// Whether nodes can be started, stopped and killed.
    fn supports_lifecycle_control(&self) -> bool {
        false
    }

    fn is_running(&self, _node: &Node) -> Result<bool, DriverError> {
        Err(self.unsupported("is-running"))
    }

    fn exec(&self, _node: &Node, _command: &[&str]) -> Result<ExecResult, DriverError> {
        Err(self.unsupported("exec"))
    }

    fn start(&self, _node: &Node) -> Result<(), DriverError> {
        Err(self.unsupported("start"))
    }

    fn stop(&self, _node: &Node) -> Result<(), DriverError> {
        Err(self.unsupported("stop"))
    }

    fn kill(&self, _node: &Node) -> Result<(), DriverError> {
        Err(self.unsupported("kill"))
    }

    fn copy_file_to_node(
        &self,
        _node: &Node,
        _local: &Path,
        _remote: &str,
    ) -> Result<(), DriverError> {
        Err(self.unsupported("copying files to node"))
    }

    fn copy_file_from_node(
        &self,
        _node: &Node,
        _remote: &str,
        _local: &Path,
    ) -> Result<(), DriverError> {
        Err(self.unsupported("copying files from node"))
    }

    fn unsupported(&self, op: &'static str) -> DriverError {
        DriverError::Unsupported {
            op,
            backend: self.label().to_string(),
        }
    }
}

/// Set up a driver for the backend named by provider's `type` property.
pub fn connect(
    props: &Properties,
    conf: &ConfigFile,
) -> Result<Arc<dyn ResourceDriver>, DriverError> {
    match props.get("type") {
        Some(lxd::BACKEND_LABEL) => {
            let driver = lxd::driver(props, conf.setup_steps().clone())?;
            Ok(Arc::new(driver))
        }
        Some(other) => Err(DriverError::Backend(format!(
            "unknown backend type \"{}\" of provider {}",
            other,
            props.name()
        ))),
        None => Err(DriverError::Backend(format!(
            "backend type of provider {} not set",
            props.name()
        ))),
    }
}
