// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror;

use crate::batch::{self, BatchError};
use crate::config::{ConfigError, ConfigFile, Overrides, Properties};
use crate::driver::{self, DriverError, ResourceDriver};
use crate::executor::{self, Executor, NodeFuture};
use crate::node::{Node, NodeStatus};
use crate::pipeline::{CreateError, DestroyError, Pipeline, ProvisionError};
use crate::registry::NodeRegistry;

/// Provider property, keep nodes running instead of destroying them.
pub const LEAVE_NODES_RUNNING: &str = "leave-nodes-running";
/// Provider property, size of the worker pool for parallel creation.
pub const WORKERS: &str = "workers";

const DEFAULT_WORKERS: u64 = 8;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("cannot configure provider: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot connect to backend: {0}")]
    Driver(#[from] DriverError),
    #[error("cannot set up worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Open,
    Closing,
    Closed,
}

struct Lifecycle {
    state: ProviderState,
    /// Node creations currently running.
    in_flight: usize,
}

struct Shared {
    props: Properties,
    conf: ConfigFile,
    driver: Arc<dyn ResourceDriver>,
    registry: NodeRegistry,
    leave_running: bool,
    pool: rayon::ThreadPool,
    lifecycle: Mutex<Lifecycle>,
    settled: Condvar,
}

/// Marks a node creation in progress, a closing provider waits for all of
/// them to finish.
struct InFlight<'a>(&'a Shared);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut lc = self.0.lifecycle.lock();
        lc.in_flight -= 1;
        if lc.in_flight == 0 {
            self.0.settled.notify_all();
        }
    }
}

impl Shared {
    fn name(&self) -> &str {
        self.props.name()
    }

    fn enter(&self, node: &str) -> Result<InFlight<'_>, ProvisionError> {
        let mut lc = self.lifecycle.lock();
        if lc.state != ProviderState::Open {
            return Err(ProvisionError::ProviderClosed {
                node: node.to_string(),
                provider: self.name().to_string(),
            });
        }
        lc.in_flight += 1;
        Ok(InFlight(self))
    }

    fn create_node(&self, name: &str, overrides: &Overrides) -> Result<Arc<Node>, CreateError> {
        let _in_flight = self.enter(name)?;

        let props = self
            .conf
            .node_properties(name)
            .with_overrides(overrides)
            .with_backend(self.driver.label());

        Pipeline {
            provider: self.name(),
            driver: &self.driver,
            registry: &self.registry,
            leave_running: self.leave_running,
        }
        .run(name, &props)
    }

    fn destroy_node(&self, name: &str) -> Result<(), DestroyError> {
        // detach first, so that the name is freed even if the backend fails
        let node = match self.registry.remove(name) {
            Some(node) => node,
            None => {
                log::debug!("node '{}' is not registered, nothing to destroy", name);
                return Ok(());
            }
        };
        self.destroy_detached(&node)
    }

    /// Destroy this very node, a different node registered under the same
    /// name is left alone.
    fn destroy_owned(&self, node: &Arc<Node>) -> Result<(), DestroyError> {
        if !self.registry.remove_node(node) {
            log::debug!(
                "node '{}' ({}) is no longer registered, nothing to destroy",
                node.name(),
                node.resource_id()
            );
            return Ok(());
        }
        self.destroy_detached(node)
    }

    fn destroy_detached(&self, node: &Node) -> Result<(), DestroyError> {
        let name = node.name();
        log::info!("destroying {} node '{}'", self.driver.label(), name);
        if self.leave_running {
            log::info!(
                "the {} node '{}' ({}) was configured to be kept running, the node is not destroyed",
                self.driver.label(),
                name,
                node.resource_id()
            );
            return Ok(());
        }

        self.driver
            .destroy(node.resource_id())
            .map_err(|reason| DestroyError {
                node: name.to_string(),
                reason,
            })?;
        node.set_status(NodeStatus::Destroyed);
        log::info!("destroyed {} node '{}'", self.driver.label(), name);
        Ok(())
    }

    fn close(&self) {
        {
            let mut lc = self.lifecycle.lock();
            match lc.state {
                ProviderState::Closed => return,
                ProviderState::Closing => {
                    // someone else is closing, wait for them
                    while lc.state != ProviderState::Closed {
                        self.settled.wait(&mut lc);
                    }
                    return;
                }
                ProviderState::Open => lc.state = ProviderState::Closing,
            }

            log::info!(
                "destroying {} cloud provider '{}'",
                self.driver.label(),
                self.name()
            );
            while lc.in_flight > 0 {
                log::debug!("waiting for {} node creations to settle", lc.in_flight);
                self.settled.wait(&mut lc);
            }
        }

        for node in self.registry.all_nodes() {
            if let Err(err) = self.destroy_node(node.name()) {
                log::error!("failed to destroy node '{}': {}", node.name(), err);
            }
        }
        self.driver.close();

        let mut lc = self.lifecycle.lock();
        lc.state = ProviderState::Closed;
        self.settled.notify_all();
        log::info!(
            "destroyed {} cloud provider '{}'",
            self.driver.label(),
            self.name()
        );
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.close();
    }
}

/// Owner of a backend connection and all nodes created through it.
///
/// Handles are cheap to clone and share the same registry. The provider is
/// closed with [`Provider::close`], or once the last handle is dropped.
#[derive(Clone)]
pub struct Provider {
    shared: Arc<Shared>,
}

impl Provider {
    /// Set up a provider described in the configuration file.
    pub fn from_config(
        name: &str,
        conf: &ConfigFile,
        overrides: &Overrides,
    ) -> Result<Provider, ProviderError> {
        let props = conf.provider_properties(name)?.with_overrides(overrides);
        let driver = driver::connect(&props, conf)?;
        Provider::with_driver(props, conf.clone(), driver)
    }

    /// Set up a provider using an already connected driver.
    pub fn with_driver(
        props: Properties,
        conf: ConfigFile,
        driver: Arc<dyn ResourceDriver>,
    ) -> Result<Provider, ProviderError> {
        let leave_running = props.get_bool(LEAVE_NODES_RUNNING, false)?;
        let workers = props.get_u64(WORKERS, DEFAULT_WORKERS)?.max(1);
        let pool = executor::pool(workers as usize)?;

        log::info!(
            "started {} cloud provider '{}'",
            driver.label(),
            props.name()
        );

        Ok(Provider {
            shared: Arc::new(Shared {
                props,
                conf,
                driver,
                registry: NodeRegistry::new(),
                leave_running,
                pool,
                lifecycle: Mutex::new(Lifecycle {
                    state: ProviderState::Open,
                    in_flight: 0,
                }),
                settled: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Label of the backend.
    pub fn backend(&self) -> &str {
        self.shared.driver.label()
    }

    pub fn properties(&self) -> &Properties {
        &self.shared.props
    }

    pub fn state(&self) -> ProviderState {
        self.shared.lifecycle.lock().state
    }

    pub fn leaves_nodes_running(&self) -> bool {
        self.shared.leave_running
    }

    /// Create a node and wait until it is started.
    pub fn create_node(&self, name: &str, overrides: &Overrides) -> Result<Arc<Node>, CreateError> {
        self.shared.create_node(name, overrides)
    }

    /// Create nodes in parallel on the provider's worker pool. Either all
    /// nodes are created, or none is left behind.
    pub fn create_nodes<S>(&self, names: &[S]) -> Result<Vec<Arc<Node>>, BatchError>
    where
        S: AsRef<str>,
    {
        self.create_nodes_with(names, &self.shared.pool)
    }

    /// Same as [`Provider::create_nodes`], running on a given executor.
    pub fn create_nodes_with<S>(
        &self,
        names: &[S],
        executor: &dyn Executor,
    ) -> Result<Vec<Arc<Node>>, BatchError>
    where
        S: AsRef<str>,
    {
        let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
        batch::create_all(self, &names, executor)
    }

    /// Start creating a node on the provider's worker pool.
    pub fn create_node_async(&self, name: &str, overrides: &Overrides) -> NodeFuture {
        self.create_node_async_with(name, overrides, &self.shared.pool)
    }

    pub fn create_node_async_with(
        &self,
        name: &str,
        overrides: &Overrides,
        executor: &dyn Executor,
    ) -> NodeFuture {
        let (tx, fut) = NodeFuture::new(name);
        self.submit(name, overrides, executor, move |res| {
            let _ = tx.send(res);
        });
        fut
    }

    /// Run node creation as a job on the executor, passing the result to
    /// done.
    pub(crate) fn submit<F>(&self, name: &str, overrides: &Overrides, executor: &dyn Executor, done: F)
    where
        F: FnOnce(Result<Arc<Node>, CreateError>) + Send + 'static,
    {
        let provider = self.clone();
        let name = name.to_string();
        let overrides = overrides.clone();
        executor.execute(Box::new(move || {
            done(provider.create_node(&name, &overrides));
        }));
    }

    pub fn get_node(&self, name: &str) -> Option<Arc<Node>> {
        self.shared.registry.get(name)
    }

    /// Snapshot of all registered nodes.
    pub fn get_nodes(&self) -> Vec<Arc<Node>> {
        self.shared.registry.all_nodes()
    }

    /// Destroy a node and drop it from the registry. The node is unregistered
    /// even if the backend fails to destroy it.
    pub fn destroy_node(&self, name: &str) -> Result<(), DestroyError> {
        self.shared.destroy_node(name)
    }

    /// Destroy a node held by the caller, provided it is still the one
    /// registered under its name.
    pub(crate) fn destroy_owned(&self, node: &Arc<Node>) -> Result<(), DestroyError> {
        self.shared.destroy_owned(node)
    }

    /// Unregister a node without destroying it, the caller becomes
    /// responsible for its cleanup.
    pub fn detach_node(&self, name: &str) -> Option<Arc<Node>> {
        let node = self.shared.registry.remove(name);
        if let Some(node) = &node {
            log::info!(
                "node '{}' ({}) detached from provider '{}'",
                name,
                node.resource_id(),
                self.name()
            );
        }
        node
    }

    /// Destroy all remaining nodes and release the backend. Calling it again
    /// is a no-op.
    pub fn close(&self) {
        self.shared.close()
    }
}

#[cfg(test)]
mod tests {
    use core::time;
    use std::thread;

    use super::*;
    use crate::testing::{resource_id, Call, FakeDriver};

    fn provider(drv: &Arc<FakeDriver>) -> Provider {
        provider_with(drv, &[])
    }

    fn provider_with(drv: &Arc<FakeDriver>, props: &[(&str, &str)]) -> Provider {
        let mut p = Properties::new("test");
        p.set(WORKERS, "4");
        for (k, v) in props {
            p.set(k, v);
        }
        Provider::with_driver(p, ConfigFile::default(), drv.clone()).expect("cannot set up provider")
    }

    #[test]
    fn test_create_and_lookup() {
        let drv = Arc::new(FakeDriver::new());
        let p = provider(&drv);

        let node = p.create_node("foo", &Overrides::new()).expect("unexpected error");
        assert_eq!(node.provider_name(), "test");
        assert_eq!(p.get_node("foo").map(|n| n.resource_id().to_string()), Some("foo-id".to_string()));
        assert!(p.get_node("bar").is_none());
        assert_eq!(p.get_nodes().len(), 1);
    }

    #[test]
    fn test_duplicate_name_no_backend_calls() {
        let drv = Arc::new(FakeDriver::new());
        let p = provider(&drv);

        p.create_node("foo", &Overrides::new()).expect("unexpected error");
        let before = drv.calls().len();

        let err = p.create_node("foo", &Overrides::new()).expect_err("expected an error");
        assert!(matches!(err.cause(), ProvisionError::DuplicateName { .. }));
        assert_eq!(
            err.to_string(),
            "node \"foo\" already exists in provider test"
        );
        assert_eq!(drv.calls().len(), before);
        assert_eq!(p.get_nodes().len(), 1);
    }

    #[test]
    fn test_overrides_reach_driver_properties() {
        struct PropsDriver(Mutex<Option<Properties>>);

        impl ResourceDriver for PropsDriver {
            fn label(&self) -> &str {
                "props"
            }

            fn create(
                &self,
                name: &str,
                props: &Properties,
            ) -> Result<crate::node::CreatedResource, DriverError> {
                *self.0.lock() = Some(props.clone());
                Ok(crate::node::CreatedResource {
                    id: name.to_string(),
                    public_addr: None,
                    private_addr: None,
                })
            }

            fn destroy(&self, _id: &str) -> Result<(), DriverError> {
                Ok(())
            }
        }

        let conf = ConfigFile::load(
            "nodes:\n  foo:\n    image: base\n    props.image: special\n    memory: 1GiB\n".as_bytes(),
        )
        .expect("cannot load");
        let drv = Arc::new(PropsDriver(Mutex::new(None)));
        let p = Provider::with_driver(Properties::new("test"), conf, drv.clone()).unwrap();

        let overrides = Overrides::from([("memory".to_string(), "2GiB".to_string())]);
        p.create_node("foo", &overrides).expect("unexpected error");

        let seen = drv.0.lock().clone().expect("create not called");
        assert_eq!(seen.get("image"), Some("special"));
        assert_eq!(seen.get("memory"), Some("2GiB"));
    }

    #[test]
    fn test_destroy_node() {
        let drv = Arc::new(FakeDriver::new());
        let p = provider(&drv);

        let node = p.create_node("foo", &Overrides::new()).unwrap();
        p.destroy_node("foo").expect("unexpected error");
        assert_eq!(node.status(), NodeStatus::Destroyed);
        assert!(p.get_node("foo").is_none());
        // absent node is a no-op
        p.destroy_node("foo").expect("unexpected error");
        assert_eq!(drv.count(&Call::Destroy(resource_id("foo"))), 1);

        // name can be reused
        p.create_node("foo", &Overrides::new()).expect("unexpected error");
    }

    #[test]
    fn test_destroy_failure_still_unregisters() {
        let drv = Arc::new(FakeDriver::new().failing_destroy("foo"));
        let p = provider(&drv);

        p.create_node("foo", &Overrides::new()).unwrap();
        let err = p.destroy_node("foo").expect_err("expected an error");
        assert_eq!(err.node, "foo");
        assert!(p.get_node("foo").is_none());
    }

    #[test]
    fn test_leave_running() {
        let drv = Arc::new(FakeDriver::new());
        let p = provider_with(&drv, &[(LEAVE_NODES_RUNNING, "true")]);
        assert!(p.leaves_nodes_running());

        let node = p.create_node("foo", &Overrides::new()).unwrap();
        p.destroy_node("foo").expect("unexpected error");
        assert!(drv.destroyed().is_empty());
        assert_eq!(node.status(), NodeStatus::Running);
        assert!(p.get_node("foo").is_none());

        p.create_node("bar", &Overrides::new()).unwrap();
        p.close();
        assert!(drv.destroyed().is_empty());
        assert!(p.get_nodes().is_empty());
    }

    #[test]
    fn test_detach_node() {
        let drv = Arc::new(FakeDriver::new());
        let p = provider(&drv);

        p.create_node("foo", &Overrides::new()).unwrap();
        let node = p.detach_node("foo").expect("expected a node");
        assert_eq!(node.name(), "foo");
        assert!(p.detach_node("foo").is_none());

        p.close();
        assert!(drv.destroyed().is_empty());
        assert_eq!(node.status(), NodeStatus::Running);
    }

    #[test]
    fn test_close_twice() {
        let drv = Arc::new(FakeDriver::new().failing_destroy("b"));
        let p = provider(&drv);
        p.create_nodes(&["a", "b", "c"]).expect("unexpected error");

        p.close();
        assert_eq!(p.state(), ProviderState::Closed);
        assert!(p.get_nodes().is_empty());
        // failure of b does not stop the loop
        assert_eq!(
            drv.destroyed(),
            vec![resource_id("a"), resource_id("b"), resource_id("c")]
        );
        assert!(drv.is_closed());
        let calls = drv.calls();

        p.close();
        assert_eq!(p.state(), ProviderState::Closed);
        assert_eq!(drv.calls(), calls);
        assert_eq!(drv.count(&Call::Close), 1);
    }

    #[test]
    fn test_create_after_close() {
        let drv = Arc::new(FakeDriver::new());
        let p = provider(&drv);
        p.close();

        let err = p.create_node("foo", &Overrides::new()).expect_err("expected an error");
        assert!(matches!(err.cause(), ProvisionError::ProviderClosed { .. }));
        assert_eq!(
            err.to_string(),
            "cannot create node \"foo\", provider test is closed"
        );
        assert_eq!(drv.calls(), vec![Call::Close]);

        let err = p.create_node_async("bar", &Overrides::new()).join().expect_err("expected an error");
        assert!(matches!(err.cause(), ProvisionError::ProviderClosed { .. }));
    }

    #[test]
    fn test_drop_closes() {
        let drv = Arc::new(FakeDriver::new());
        {
            let p = provider(&drv);
            p.create_node("foo", &Overrides::new()).unwrap();
            let _other = p.clone();
        }
        assert_eq!(drv.destroyed(), vec![resource_id("foo")]);
        assert!(drv.is_closed());
    }

    #[test]
    fn test_async_create() {
        let drv = Arc::new(FakeDriver::new());
        let p = provider(&drv);

        let fut = p.create_node_async("foo", &Overrides::new());
        assert_eq!(fut.name(), "foo");
        let node = fut.join().expect("unexpected error");
        assert_eq!(node.name(), "foo");
        assert!(p.get_node("foo").is_some());

        let fut = p.create_node_async_with("bar", &Overrides::new(), &executor::ThreadPerJob);
        fut.join().expect("unexpected error");
        assert_eq!(p.get_nodes().len(), 2);
    }

    #[test]
    fn test_close_waits_for_in_flight() {
        let drv = Arc::new(FakeDriver::new().with_create_delay(time::Duration::from_millis(300)));
        let p = provider(&drv);

        let fut = p.create_node_async("slow", &Overrides::new());
        // let the creation start
        while drv.calls().is_empty() {
            thread::sleep(time::Duration::from_millis(5));
        }
        p.close();

        // creation finished before teardown and got cleaned up by it
        let node = fut.join().expect("unexpected error");
        assert_eq!(node.status(), NodeStatus::Destroyed);
        assert!(p.get_nodes().is_empty());
        assert_eq!(drv.destroyed(), vec![resource_id("slow")]);
        assert_eq!(drv.calls().last(), Some(&Call::Close));
    }

    #[test]
    fn test_concurrent_distinct_names_overlap() {
        let drv = Arc::new(FakeDriver::new().with_create_delay(time::Duration::from_millis(200)));
        let p = provider(&drv);

        let futs: Vec<NodeFuture> = ["a", "b", "c"]
            .iter()
            .map(|n| p.create_node_async(n, &Overrides::new()))
            .collect();
        for fut in futs {
            fut.join().expect("unexpected error");
        }
        assert!(drv.max_in_flight() >= 2);
        assert_eq!(p.get_nodes().len(), 3);
    }
}
