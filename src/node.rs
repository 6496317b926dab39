// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::net;
use core::time;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{DriverError, ExecResult, ResourceDriver};
use crate::readiness;

/// Lifecycle status of a node as last observed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Running,
    Stopped,
    Destroyed,
}

/// What a backend hands back after allocating a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedResource {
    /// Backend specific identifier, used for all later calls.
    pub id: String,
    pub public_addr: Option<net::IpAddr>,
    pub private_addr: Option<net::IpAddr>,
}

/// Handle to one provisioned remote resource.
pub struct Node {
    name: String,
    provider: String,
    resource: CreatedResource,
    ports: Vec<u16>,
    ports_timeout: time::Duration,
    status: Mutex<NodeStatus>,
    driver: Arc<dyn ResourceDriver>,
}

impl Node {
    pub(crate) fn new(
        name: &str,
        provider: &str,
        resource: CreatedResource,
        ports: Vec<u16>,
        ports_timeout: time::Duration,
        driver: Arc<dyn ResourceDriver>,
    ) -> Self {
        Node {
            name: name.to_string(),
            provider: provider.to_string(),
            resource,
            ports,
            ports_timeout,
            status: Mutex::new(NodeStatus::Running),
            driver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the provider which created the node.
    pub fn provider_name(&self) -> &str {
        &self.provider
    }

    pub fn resource_id(&self) -> &str {
        &self.resource.id
    }

    pub fn public_addr(&self) -> Option<net::IpAddr> {
        self.resource.public_addr
    }

    pub fn private_addr(&self) -> Option<net::IpAddr> {
        self.resource.private_addr
    }

    /// Address used for reaching the node, public one preferred.
    pub fn addr(&self) -> Option<net::IpAddr> {
        self.resource.public_addr.or(self.resource.private_addr)
    }

    /// Ports which must be reachable before the node is considered started.
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: NodeStatus) {
        *self.status.lock() = status;
    }

    /// Wait for the node's declared ports using the configured timeout.
    pub(crate) fn wait_for_start_ports(&self) -> Result<(), DriverError> {
        self.driver
            .wait_for_ports(self, &self.ports, self.ports_timeout)
    }

    pub fn wait_for_ports(&self, ports: &[u16], timeout: time::Duration) -> Result<(), DriverError> {
        self.driver.wait_for_ports(self, ports, timeout)
    }

    pub fn is_port_open(&self, port: u16) -> bool {
        match self.addr() {
            Some(addr) => readiness::is_port_open(net::SocketAddr::new(addr, port)),
            None => false,
        }
    }

    pub fn supports_exec(&self) -> bool {
        self.driver.supports_exec()
    }

    pub fn supports_file_copy(&self) -> bool {
        self.driver.supports_file_copy()
    }

    /// Whether start, stop and kill are available.
    pub fn supports_lifecycle_control(&self) -> bool {
        self.driver.supports_lifecycle_control()
    }

    pub fn is_running(&self) -> Result<bool, DriverError> {
        self.driver.is_running(self)
    }

    pub fn exec(&self, command: &[&str]) -> Result<ExecResult, DriverError> {
        self.driver.exec(self, command)
    }

    pub fn start(&self) -> Result<(), DriverError> {
        self.driver.start(self)?;
        self.set_status(NodeStatus::Running);
        Ok(())
    }

    pub fn stop(&self) -> Result<(), DriverError> {
        self.driver.stop(self)?;
        self.set_status(NodeStatus::Stopped);
        Ok(())
    }

    /// Stop the node without waiting for a clean shutdown.
    pub fn kill(&self) -> Result<(), DriverError> {
        self.driver.kill(self)?;
        self.set_status(NodeStatus::Stopped);
        Ok(())
    }

    pub fn copy_file_to_node(&self, local: &Path, remote: &str) -> Result<(), DriverError> {
        self.driver.copy_file_to_node(self, local, remote)
    }

    pub fn copy_file_from_node(&self, remote: &str, local: &Path) -> Result<(), DriverError> {
        self.driver.copy_file_from_node(self, remote, local)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("resource", &self.resource)
            .field("ports", &self.ports)
            .field("status", &self.status())
            .finish()
    }
}
