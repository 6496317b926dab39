// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

//! Instrumented driver used by unit tests.

use core::net;
use core::time;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::config::Properties;
use crate::driver::{DriverError, ResourceDriver};
use crate::node::{CreatedResource, Node};

/// Calls seen by the fake driver, carrying node names or resource IDs.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create(String),
    Hook(String),
    WaitPorts(String),
    Destroy(String),
    Close,
}

#[derive(Default)]
pub struct FakeDriver {
    calls: Mutex<Vec<Call>>,
    fail_create: HashSet<String>,
    fail_hook: HashSet<String>,
    fail_ports: HashSet<String>,
    fail_destroy: HashSet<String>,
    no_hook: bool,
    create_delay: time::Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed: AtomicBool,
    unique_ids: bool,
    created: AtomicUsize,
    hook_gate: Option<(String, Mutex<mpsc::Sender<()>>, Mutex<mpsc::Receiver<()>>)>,
}

/// Holds the startup hook of one node until released.
pub struct HookGate {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl HookGate {
    /// Block until the gated hook has started.
    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(time::Duration::from_secs(10))
            .expect("gated hook not entered");
    }

    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

/// Resource ID the fake driver assigns to a node.
pub fn resource_id(name: &str) -> String {
    format!("{}-id", name)
}

impl FakeDriver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn failing_create(mut self, name: &str) -> Self {
        self.fail_create.insert(name.to_string());
        self
    }

    pub fn failing_hook(mut self, name: &str) -> Self {
        self.fail_hook.insert(name.to_string());
        self
    }

    pub fn failing_ports(mut self, name: &str) -> Self {
        self.fail_ports.insert(name.to_string());
        self
    }

    pub fn failing_destroy(mut self, name: &str) -> Self {
        self.fail_destroy.insert(resource_id(name));
        self
    }

    pub fn without_hook(mut self) -> Self {
        self.no_hook = true;
        self
    }

    pub fn with_create_delay(mut self, delay: time::Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Assign `<name>-<n>` resource IDs, n counting all creations.
    pub fn with_unique_ids(mut self) -> Self {
        self.unique_ids = true;
        self
    }

    /// Make the startup hook of the node wait for the returned gate.
    pub fn gating_hook(mut self, name: &str) -> (Self, HookGate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.hook_gate = Some((
            name.to_string(),
            Mutex::new(entered_tx),
            Mutex::new(release_rx),
        ));
        (
            self,
            HookGate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn destroyed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Destroy(id) => Some(id.clone()),
                _ => None,
            })
            .collect();
        ids.sort();
        ids
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl ResourceDriver for FakeDriver {
    fn label(&self) -> &str {
        "fake"
    }

    fn create(&self, name: &str, _props: &Properties) -> Result<CreatedResource, DriverError> {
        self.record(Call::Create(name.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            thread::sleep(self.create_delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_create.contains(name) {
            return Err(DriverError::Backend(format!("quota exceeded for {}", name)));
        }
        let seq = self.created.fetch_add(1, Ordering::SeqCst);
        let id = if self.unique_ids {
            format!("{}-{}", name, seq)
        } else {
            resource_id(name)
        };
        Ok(CreatedResource {
            id,
            public_addr: Some(net::IpAddr::V4(net::Ipv4Addr::LOCALHOST)),
            private_addr: None,
        })
    }

    fn destroy(&self, id: &str) -> Result<(), DriverError> {
        self.record(Call::Destroy(id.to_string()));
        if self.fail_destroy.contains(id) {
            return Err(DriverError::Backend(format!("cannot delete {}", id)));
        }
        Ok(())
    }

    fn run_startup_hook(&self, node: &Node, _props: &Properties) -> Result<(), DriverError> {
        if self.no_hook {
            return Err(self.unsupported("startup hook"));
        }
        self.record(Call::Hook(node.name().to_string()));
        if let Some((gated, entered, release)) = &self.hook_gate {
            if gated == node.name() {
                let _ = entered.lock().send(());
                let _ = release.lock().recv();
            }
        }
        if self.fail_hook.contains(node.name()) {
            return Err(DriverError::Backend("setup step exited with 1".to_string()));
        }
        Ok(())
    }

    fn wait_for_ports(
        &self,
        node: &Node,
        ports: &[u16],
        timeout: time::Duration,
    ) -> Result<(), DriverError> {
        self.record(Call::WaitPorts(node.name().to_string()));
        if self.fail_ports.contains(node.name()) {
            return Err(DriverError::PortsTimeout {
                addr: net::IpAddr::V4(net::Ipv4Addr::LOCALHOST),
                ports: ports.to_vec(),
                timeout,
            });
        }
        Ok(())
    }

    fn close(&self) {
        self.record(Call::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A live node backed by the fake driver.
pub fn node(name: &str, driver: Arc<FakeDriver>) -> Arc<Node> {
    Arc::new(Node::new(
        name,
        "test",
        CreatedResource {
            id: resource_id(name),
            public_addr: None,
            private_addr: None,
        },
        vec![],
        time::Duration::from_secs(1),
        driver,
    ))
}
