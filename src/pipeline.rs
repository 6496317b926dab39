// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::time;
use std::sync::Arc;

use thiserror;

use crate::config::{ConfigError, Properties};
use crate::driver::{DriverError, ResourceDriver};
use crate::node::{Node, NodeStatus};
use crate::registry::NodeRegistry;

/// Node property listing ports which must be reachable after start.
pub const WAIT_FOR_PORTS: &str = "wait-for-ports";
pub const WAIT_FOR_PORTS_TIMEOUT: &str = "wait-for-ports.timeout";

const DEFAULT_PORTS_TIMEOUT: time::Duration = time::Duration::from_secs(60);

/// Failure of a single step of node provisioning.
#[derive(thiserror::Error, Debug)]
pub enum ProvisionError {
    #[error("node \"{node}\" already exists in provider {provider}")]
    DuplicateName { node: String, provider: String },
    #[error("cannot create node \"{node}\", provider {provider} is closed")]
    ProviderClosed { node: String, provider: String },
    #[error("cannot configure node \"{node}\": {reason}")]
    Config { node: String, reason: ConfigError },
    #[error("cannot create node \"{node}\": {reason}")]
    Creation { node: String, reason: DriverError },
    #[error("startup hook failed for node \"{node}\": {reason}")]
    BootHook { node: String, reason: DriverError },
    #[error("node \"{node}\" did not become ready: {reason}")]
    ReadinessTimeout { node: String, reason: DriverError },
    #[error("creation of node \"{node}\" was abandoned by the executor")]
    Abandoned { node: String },
}

impl ProvisionError {
    /// Name of the node the failure refers to.
    pub fn node(&self) -> &str {
        match self {
            ProvisionError::DuplicateName { node, .. }
            | ProvisionError::ProviderClosed { node, .. }
            | ProvisionError::Config { node, .. }
            | ProvisionError::Creation { node, .. }
            | ProvisionError::BootHook { node, .. }
            | ProvisionError::ReadinessTimeout { node, .. }
            | ProvisionError::Abandoned { node } => node,
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("cannot destroy node \"{node}\": {reason}")]
pub struct DestroyError {
    pub node: String,
    pub reason: DriverError,
}

/// Failed node creation, along with failures of cleanup attempted on the way
/// out. Cleanup failures never replace the original cause.
#[derive(thiserror::Error, Debug)]
#[error("{cause}")]
pub struct CreateError {
    cause: ProvisionError,
    suppressed: Vec<DestroyError>,
}

impl CreateError {
    pub fn cause(&self) -> &ProvisionError {
        &self.cause
    }

    pub fn suppressed(&self) -> &[DestroyError] {
        &self.suppressed
    }

    pub fn node(&self) -> &str {
        self.cause.node()
    }

    pub(crate) fn suppress(&mut self, err: DestroyError) {
        self.suppressed.push(err);
    }
}

impl From<ProvisionError> for CreateError {
    fn from(cause: ProvisionError) -> Self {
        CreateError {
            cause,
            suppressed: vec![],
        }
    }
}

/// Drives a single node from nothing to started and registered, or undoes
/// whatever it managed to do.
pub struct Pipeline<'a> {
    pub provider: &'a str,
    pub driver: &'a Arc<dyn ResourceDriver>,
    pub registry: &'a NodeRegistry,
    /// Do not destroy resources of nodes which failed to start.
    pub leave_running: bool,
}

impl<'a> Pipeline<'a> {
    pub fn run(&self, name: &str, props: &Properties) -> Result<Arc<Node>, CreateError> {
        if self.registry.reserve(name).is_err() {
            return Err(ProvisionError::DuplicateName {
                node: name.to_string(),
                provider: self.provider.to_string(),
            }
            .into());
        }

        let res = self.provision(name, props);
        if res.is_err() {
            self.registry.release(name);
        }
        res
    }

    fn provision(&self, name: &str, props: &Properties) -> Result<Arc<Node>, CreateError> {
        let config_err = |reason| ProvisionError::Config {
            node: name.to_string(),
            reason,
        };
        let ports = props.get_ports(WAIT_FOR_PORTS).map_err(config_err)?;
        let ports_timeout = props
            .get_duration(WAIT_FOR_PORTS_TIMEOUT, DEFAULT_PORTS_TIMEOUT)
            .map_err(config_err)?;

        log::debug!(
            "creating {} node '{}' in provider {}",
            self.driver.label(),
            name,
            self.provider
        );
        let resource = self
            .driver
            .create(name, props)
            .map_err(|reason| ProvisionError::Creation {
                node: name.to_string(),
                reason,
            })?;

        let node = Arc::new(Node::new(
            name,
            self.provider,
            resource,
            ports,
            ports_timeout,
            self.driver.clone(),
        ));
        log::debug!(
            "node '{}' can be reached now on address {:?}",
            name,
            node.addr()
        );

        if let Err(cause) = self.start(&node, props) {
            return Err(self.rollback(&node, cause));
        }

        self.registry.commit(name, node.clone());
        log::debug!("node '{}' is successfully started", name);
        Ok(node)
    }

    fn start(&self, node: &Node, props: &Properties) -> Result<(), ProvisionError> {
        match self.driver.run_startup_hook(node, props) {
            Ok(()) => {}
            Err(err) if err.is_unsupported() => {
                log::debug!("skipping startup hook of node '{}': {}", node.name(), err)
            }
            Err(reason) => {
                return Err(ProvisionError::BootHook {
                    node: node.name().to_string(),
                    reason,
                })
            }
        }

        node.wait_for_start_ports()
            .map_err(|reason| ProvisionError::ReadinessTimeout {
                node: node.name().to_string(),
                reason,
            })
    }

    fn rollback(&self, node: &Node, cause: ProvisionError) -> CreateError {
        let mut err = CreateError::from(cause);

        if self.leave_running {
            log::warn!(
                "node '{}' ({}) failed to start and is configured to be kept running, it will not be destroyed",
                node.name(),
                node.resource_id()
            );
            return err;
        }

        log::info!("destroying node '{}' which failed to start", node.name());
        match self.driver.destroy(node.resource_id()) {
            Ok(()) => node.set_status(NodeStatus::Destroyed),
            Err(reason) => {
                log::error!("cannot destroy node '{}': {}", node.name(), reason);
                err.suppress(DestroyError {
                    node: node.name().to_string(),
                    reason,
                })
            }
        }
        err
    }
}
