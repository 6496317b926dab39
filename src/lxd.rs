// SPDX-FileCopyrightText: 2024 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use core::net;
use core::time;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Instant;

use bytesize::ByteSize;
use log::debug;
use parking_lot::Mutex;
use rand::random;
use thiserror;

use crate::config::{ConfigError, Properties};
use crate::driver::{DriverError, ExecResult, ResourceDriver};
use crate::node::{CreatedResource, Node};

/// Backend label, also the `type` of LXD providers.
pub const BACKEND_LABEL: &str = "lxd";

const DEFAULT_PROJECT: &str = "spread-adhoc";

/// Wraps LXD backend errors.
#[derive(thiserror::Error, Debug)]
pub enum LxdError {
    #[error("cannot execute operation: {0}")]
    Executor(String),
    #[error("invalid node configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot allocate system: {0}")]
    Allocate(String),
    #[error("cannot deallocate system: {0}")]
    Deallocate(String),
    #[error("cannot provision node: {0}")]
    Provision(String),
    #[error("cannot list nodes: {0}")]
    ListNodes(String),
    #[error("cannot obtain address of {0}")]
    AddressTimeout(String),
    #[error("{0}")]
    NotFound(String),
}

impl PartialEq for LxdError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl From<LxdError> for DriverError {
    fn from(err: LxdError) -> Self {
        DriverError::Backend(err.to_string())
    }
}

/// Carries details of a node to allocate.
#[derive(Debug, PartialEq)]
struct LxdNodeDetails {
    image: String,
    name: String,
    cpu: u64,
    memory: u64,
    root_size: u64,
    secure_boot: bool,
    vm: bool,
}

fn default_mem() -> ByteSize {
    ByteSize::gib(2)
}

fn default_root_size() -> ByteSize {
    ByteSize::gib(10)
}

impl LxdNodeDetails {
    /// Collect launch parameters from node properties.
    fn from_properties(instance: &str, props: &Properties) -> Result<Self, LxdError> {
        let image = props
            .get("image")
            .ok_or_else(|| LxdError::NotFound(format!("image of node {} not set", props.name())))?;

        Ok(LxdNodeDetails {
            image: image.to_string(),
            name: instance.to_string(),
            cpu: props.get_u64("cpu", 2)?,
            memory: props.get_size("memory", default_mem())?.as_u64(),
            root_size: props.get_size("root-size", default_root_size())?.as_u64(),
            secure_boot: props.get_bool("secure-boot", false)?,
            vm: props.get_bool("vm", true)?,
        })
    }
}

pub struct LxcCommand(Command);

/// Scope for lxc commands.
enum LxcCommandScope<'a> {
    /// Default project.
    Default,
    /// Specific project.
    Project(&'a str),
}

/// Builds lxc command line.
struct LxcCommandBuilder<'a> {
    scope: LxcCommandScope<'a>,
    args: Vec<&'a str>,
}

impl<'a> LxcCommandBuilder<'a> {
    fn new() -> Self {
        Self {
            scope: LxcCommandScope::Default,
            args: Vec::new(),
        }
    }

    fn with_scope(mut self, scope: LxcCommandScope<'a>) -> Self {
        self.scope = scope;
        self
    }

    fn args(mut self, args: &'a [&str]) -> Self {
        self.args = args.to_vec();
        self
    }

    fn build(self) -> LxcCommand {
        let mut cmd = Command::new("lxc");
        if let LxcCommandScope::Project(prj) = &self.scope {
            cmd.arg("--project");
            cmd.arg(&prj);
        }

        cmd.args(self.args);
        LxcCommand(cmd)
    }
}

/// Wraps lxc command runner errors.
#[derive(thiserror::Error, Debug)]
pub enum LxcRunnerError {
    #[error("cannot start lxc: {0}")]
    Start(io::Error),
    #[error("lxc command exited with status {exit_code}, stderr:\n{stderr}")]
    Execution { stderr: String, exit_code: i32 },
}

/// Trait representing a way to run lxc command. Shared by all concurrently
/// provisioned nodes.
pub trait LxcRunner: Send + Sync {
    fn run(&self, cmd: LxcCommand) -> Result<Vec<u8>, LxcRunnerError>;
}

/// Wrapper for runing lxc commands.
pub struct LxcCommandRunner;

impl LxcRunner for LxcCommandRunner {
    /// Runs a command returning its output (stdout).
    fn run(&self, lxccmd: LxcCommand) -> Result<Vec<u8>, LxcRunnerError> {
        let LxcCommand(mut cmd) = lxccmd;

        log::trace!(
            "running lxc with: {:?}",
            cmd.get_args()
                .by_ref()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
        );

        let res = match cmd.output() {
            Ok(output) => output,
            Err(err) => {
                return Err(LxcRunnerError::Start(err));
            }
        };

        if !res.status.success() {
            return Err(LxcRunnerError::Execution {
                stderr: String::from_utf8_lossy(&res.stderr).trim().to_string(),
                exit_code: res.status.code().unwrap_or(255),
            });
        }
        return Ok(res.stdout);
    }
}

mod lxc {
    pub mod types {
        use std::collections::HashMap;

        #[derive(serde::Deserialize, Debug, Clone, PartialEq)]
        pub struct NetworkAddress {
            pub family: String,
            pub address: String,
        }

        #[derive(serde::Deserialize, Debug, Clone, PartialEq)]
        pub struct NetworkState {
            pub addresses: Vec<NetworkAddress>,
        }

        #[derive(serde::Deserialize, Debug, Clone, PartialEq)]
        pub struct InstanceState {
            pub network: Option<HashMap<String, NetworkState>>,
        }

        #[derive(serde::Deserialize, Debug, Clone, PartialEq)]
        pub struct Instance {
            pub name: String,
            pub state: InstanceState,
            pub status: String,
        }

        #[derive(serde::Deserialize, Debug)]
        pub struct Project {
            pub name: String,
        }
    }
}

fn lxdfy_name(name: &str) -> String {
    String::from_iter(name.chars().map(|c| match c {
        '.' | ':' | '_' | '/' => '-',
        _ => c,
    }))
}

/// First IPv4 address of a running instance, loopback excluded.
fn instance_ipv4(instance: &lxc::types::Instance) -> Option<net::Ipv4Addr> {
    let network = instance.state.network.as_ref()?;
    for (ifname, ifstate) in network.iter() {
        if ifname == "lo" {
            continue;
        }

        for ifaceaddr in ifstate.addresses.iter() {
            if ifaceaddr.family != "inet" {
                continue;
            }

            debug!("found address {}", ifaceaddr.address);

            match ifaceaddr.address.parse::<net::Ipv4Addr>() {
                Ok(parsed) => return Some(parsed),
                Err(_) => debug!("cannot parse address"),
            }
        }
    }
    None
}

/// LXD backend which uses 'lxc' command.
pub struct LxdDriver<R>
where
    R: LxcRunner,
{
    runner: R,
    project: String,
    /// Launch instances as ephemeral, such instances are gone once stopped.
    ephemeral: bool,
    /// Named lists of setup steps, referenced by nodes.
    setup: HashMap<String, Vec<String>>,
    project_ready: Mutex<bool>,
    address_poll: time::Duration,
}

/// Returns a driver for the LXD provider described by properties.
pub fn driver(
    props: &Properties,
    setup: HashMap<String, Vec<String>>,
) -> Result<LxdDriver<LxcCommandRunner>, LxdError> {
    let props = props.clone().with_backend(BACKEND_LABEL);
    let project = props.get("project").unwrap_or(DEFAULT_PROJECT);
    let ephemeral = props.get_bool("ephemeral", true)?;
    log::debug!("using LXD project {}", project);

    Ok(LxdDriver::new(LxcCommandRunner, project, ephemeral, setup))
}

impl<R> LxdDriver<R>
where
    R: LxcRunner,
{
    fn new(r: R, project: &str, ephemeral: bool, setup: HashMap<String, Vec<String>>) -> Self {
        Self {
            runner: r,
            project: project.to_string(),
            ephemeral,
            setup,
            project_ready: Mutex::new(false),
            address_poll: time::Duration::from_millis(500),
        }
    }

    fn in_project(&self) -> LxcCommandBuilder<'_> {
        LxcCommandBuilder::new().with_scope(LxcCommandScope::Project(&self.project))
    }

    fn add_project(&self, project: &str) -> Result<(), LxdError> {
        self.runner
            .run(
                LxcCommandBuilder::new()
                    .args(&[
                        "project",
                        "create",
                        project,
                        "-c",
                        "features.images=false",
                        "-c",
                        "features.profiles=false",
                    ])
                    .build(),
            )
            .map(|_| ())
            .map_err(|e| LxdError::Executor(format!("cannot add project: {}", e)))
    }

    /// Ensure the driver's project exists, done once per driver.
    fn ensure_project(&self) -> Result<(), LxdError> {
        let mut ready = self.project_ready.lock();
        if *ready {
            return Ok(());
        }

        let output = self
            .runner
            .run(
                LxcCommandBuilder::new()
                    .args(&["project", "list", "--format=json"])
                    .build(),
            )
            .map_err(|e| LxdError::Executor(e.to_string()))?;
        let found = serde_json::from_slice::<Vec<lxc::types::Project>>(&output)
            .map_err(|e| LxdError::Executor(format!("cannot parse project JSON: {}", e)))?
            .iter()
            .any(|p| p.name == self.project);

        debug!("project found {}", found);

        if !found {
            self.add_project(&self.project)?;
        }
        *ready = true;
        Ok(())
    }

    fn list(&self, name: Option<&str>) -> Result<Vec<lxc::types::Instance>, LxdError> {
        let mut args = vec!["list", "--format=json"];
        if let Some(name) = name {
            args.push(name);
        }
        let output = self
            .runner
            .run(self.in_project().args(&args).build())
            .map_err(|e| LxdError::ListNodes(e.to_string()))?;
        serde_json::from_slice::<Vec<lxc::types::Instance>>(&output).map_err(|e| {
            LxdError::ListNodes(format!(
                "cannot parse instance list JSON '{}': {}",
                String::from_utf8_lossy(&output),
                e
            ))
        })
    }

    fn list_nodes(&self) -> Result<Vec<lxc::types::Instance>, LxdError> {
        self.list(None)
    }

    fn list_node_by_name(&self, name: &str) -> Result<lxc::types::Instance, LxdError> {
        // lxc list takes a filter, not an exact name
        self.list(Some(name))?
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| LxdError::NotFound(format!("node {} not found", name)))
    }

    fn deallocate_by_name(&self, name: &str) -> Result<(), LxdError> {
        log::debug!("deallocate by name '{}'", name);

        self.runner
            .run(self.in_project().args(&["delete", "--force", name]).build())
            .map_err(|e| LxdError::Deallocate(e.to_string()))
            .map(|_| ())
    }

    fn wait_for_address(
        &self,
        name: &str,
        timeout: time::Duration,
    ) -> Result<net::Ipv4Addr, LxdError> {
        let now = Instant::now();

        loop {
            log::debug!("waiting for address");

            thread::sleep(self.address_poll);

            let instance = self.list_node_by_name(name)?;
            if instance.status != "Running" {
                log::debug!("not yet running, in state {}", instance.status);
            } else if let Some(addr) = instance_ipv4(&instance) {
                return Ok(addr);
            }

            if now.elapsed() > timeout {
                return Err(LxdError::AddressTimeout(name.to_string()));
            }
        }
    }

    fn launch(&self, node: &LxdNodeDetails) -> Result<(), LxdError> {
        let memory_arg = format!("limits.memory={}", node.memory);
        let cpu_arg = format!("limits.cpu={}", node.cpu);
        let secure_boot_arg = format!("security.secureboot={}", node.secure_boot);
        let root_size_arg = format!("root,size={}", node.root_size);
        let mut args = vec!["launch"];
        if self.ephemeral {
            args.push("--ephemeral");
        }
        if node.vm {
            args.extend(["--vm", "--config", secure_boot_arg.as_str()]);
        }
        args.extend([
            "--config",
            memory_arg.as_str(),
            "--config",
            cpu_arg.as_str(),
            "--device",
            root_size_arg.as_str(),
            node.image.as_str(),
            node.name.as_str(),
        ]);

        self.runner
            .run(self.in_project().args(&args).build())
            .map_err(|e| LxdError::Allocate(e.to_string()))
            .map(|_| ())
    }

    fn provision(&self, name: &str, steps: &[String]) -> Result<(), LxdError> {
        log::debug!("provision {}", name);

        for step in steps {
            log::debug!("provisioning step:\n{}", step);
            self.runner
                .run(
                    self.in_project()
                        .args(&["exec", name, "--", "/bin/bash", "-c", step])
                        .build(),
                )
                .map_err(|e| LxdError::Provision(e.to_string()))?;
        }
        Ok(())
    }

    /// Setup steps for a node, including remote user access when requested.
    fn setup_steps(&self, props: &Properties) -> Result<Vec<String>, LxdError> {
        let mut steps = match props.get("setup-steps") {
            Some(setup_steps) => match self.setup.get(setup_steps) {
                Some(steps) => steps.clone(),
                None => {
                    return Err(LxdError::NotFound(format!(
                        "setup steps \"{}\" not found in configuration",
                        setup_steps
                    )))
                }
            },
            None => {
                log::warn!("no setup steps declared for node {}", props.name());
                vec![]
            }
        };

        if let (Some(user), Some(password)) = (props.get("user"), props.get("password")) {
            steps.push(format!("echo {}:{} | chpasswd", user, password));
        }
        Ok(steps)
    }

    /// Deallocate a node with given address.
    pub fn deallocate_by_addr(&self, addr: &str) -> Result<(), LxdError> {
        log::debug!("deallocate by address '{}'", addr);

        let nodes = self
            .list_nodes()
            .map_err(|e| LxdError::Deallocate(e.to_string()))?;

        let name = nodes
            .iter()
            .filter(|instance| instance.status == "Running")
            .find(|instance| {
                instance
                    .state
                    .network
                    .as_ref()
                    .map(|network| {
                        network
                            .values()
                            .any(|iface| iface.addresses.iter().any(|a| a.address == addr))
                    })
                    .unwrap_or(false)
            })
            .map(|instance| instance.name.clone());

        match name {
            Some(name) => self.deallocate_by_name(&name),
            None => Err(LxdError::NotFound(addr.to_string())),
        }
    }

    /// Deallocate all nodes in the project.
    pub fn deallocate_all(&self) -> Result<(), LxdError> {
        let nodes = self
            .list_nodes()
            .map_err(|e| LxdError::Deallocate(e.to_string()))?;
        log::debug!("deallocate {} nodes: {:?}", nodes.len(), nodes);

        for node in nodes {
            self.deallocate_by_name(&node.name)?;
        }

        Ok(())
    }

    fn exec_in(&self, name: &str, command: &[&str]) -> Result<ExecResult, DriverError> {
        let mut args = vec!["exec", name, "--"];
        args.extend_from_slice(command);
        match self.runner.run(self.in_project().args(&args).build()) {
            Ok(stdout) => Ok(ExecResult {
                stdout,
                stderr: vec![],
                exit_code: 0,
            }),
            Err(LxcRunnerError::Execution { stderr, exit_code }) => Ok(ExecResult {
                stdout: vec![],
                stderr: stderr.into_bytes(),
                exit_code,
            }),
            Err(err) => Err(DriverError::Backend(err.to_string())),
        }
    }

    fn lxc(&self, args: &[&str]) -> Result<(), DriverError> {
        self.runner
            .run(self.in_project().args(args).build())
            .map(|_| ())
            .map_err(|e| DriverError::Backend(e.to_string()))
    }
}

impl<R> ResourceDriver for LxdDriver<R>
where
    R: LxcRunner,
{
    fn label(&self) -> &str {
        BACKEND_LABEL
    }

    fn create(&self, name: &str, props: &Properties) -> Result<CreatedResource, DriverError> {
        let instance = format!("{}-{}", lxdfy_name(name), random::<u32>());
        let details = LxdNodeDetails::from_properties(&instance, props)?;
        let timeout = props
            .get_duration("address.timeout", time::Duration::from_secs(60))
            .map_err(LxdError::from)?;

        self.ensure_project()?;
        self.launch(&details)?;

        match self.wait_for_address(&instance, timeout) {
            Ok(addr) => Ok(CreatedResource {
                id: instance,
                public_addr: None,
                private_addr: Some(net::IpAddr::V4(addr)),
            }),
            Err(err) => {
                // launched but unusable, do not leak it
                match self.deallocate_by_name(&instance) {
                    Ok(()) => Err(LxdError::Allocate(err.to_string()).into()),
                    Err(derr) => {
                        log::error!("cannot clean up instance {}: {}", instance, derr);
                        Err(LxdError::Allocate(format!(
                            "{}, instance {} left behind: {}",
                            err, instance, derr
                        ))
                        .into())
                    }
                }
            }
        }
    }

    fn destroy(&self, id: &str) -> Result<(), DriverError> {
        Ok(self.deallocate_by_name(id)?)
    }

    fn run_startup_hook(&self, node: &Node, props: &Properties) -> Result<(), DriverError> {
        let steps = self.setup_steps(props)?;
        Ok(self.provision(node.resource_id(), &steps)?)
    }

    fn supports_exec(&self) -> bool {
        true
    }

    fn supports_file_copy(&self) -> bool {
        true
    }

    fn supports_lifecycle_control(&self) -> bool {
        // ephemeral instances are deleted once stopped
        !self.ephemeral
    }

    fn is_running(&self, node: &Node) -> Result<bool, DriverError> {
        let instance = self.list_node_by_name(node.resource_id())?;
        Ok(instance.status == "Running")
    }

    fn exec(&self, node: &Node, command: &[&str]) -> Result<ExecResult, DriverError> {
        self.exec_in(node.resource_id(), command)
    }

    fn start(&self, node: &Node) -> Result<(), DriverError> {
        self.lxc(&["start", node.resource_id()])
    }

    fn stop(&self, node: &Node) -> Result<(), DriverError> {
        if self.ephemeral {
            return Err(self.unsupported("stopping ephemeral instances"));
        }
        self.lxc(&["stop", node.resource_id()])
    }

    fn kill(&self, node: &Node) -> Result<(), DriverError> {
        if self.ephemeral {
            return Err(self.unsupported("stopping ephemeral instances"));
        }
        self.lxc(&["stop", "--force", node.resource_id()])
    }

    fn copy_file_to_node(&self, node: &Node, local: &Path, remote: &str) -> Result<(), DriverError> {
        let local = local.to_string_lossy();
        let target = format!("{}/{}", node.resource_id(), remote.trim_start_matches('/'));
        self.lxc(&["file", "push", &*local, target.as_str()])
    }

    fn copy_file_from_node(&self, node: &Node, remote: &str, local: &Path) -> Result<(), DriverError> {
        let local = local.to_string_lossy();
        let source = format!("{}/{}", node.resource_id(), remote.trim_start_matches('/'));
        self.lxc(&["file", "pull", source.as_str(), &*local])
    }
}
