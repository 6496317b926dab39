// SPDX-FileCopyrightText: 2025 Maciej Borzecki <maciek.borzecki@gmail.com>
//
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror;

use crate::node::Node;

#[derive(thiserror::Error, Debug, PartialEq)]
#[error("node \"{0}\" already exists")]
pub struct AlreadyExists(pub String);

enum Slot {
    /// Name taken by a node which is still being provisioned.
    Reserved,
    Live(Arc<Node>),
}

/// Live nodes of a provider, keyed by node name. Each operation locks only
/// the shard holding the name.
#[derive(Default)]
pub struct NodeRegistry {
    slots: DashMap<String, Slot>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Take the name for a node about to be provisioned.
    pub fn reserve(&self, name: &str) -> Result<(), AlreadyExists> {
        match self.slots.entry(name.to_string()) {
            Entry::Occupied(_) => Err(AlreadyExists(name.to_string())),
            Entry::Vacant(v) => {
                v.insert(Slot::Reserved);
                Ok(())
            }
        }
    }

    /// Store a provisioned node under a previously reserved name.
    pub fn commit(&self, name: &str, node: Arc<Node>) {
        if let Some(mut slot) = self.slots.get_mut(name) {
            *slot = Slot::Live(node);
            return;
        }
        log::warn!("committing node '{}' without a reservation", name);
        self.slots.insert(name.to_string(), Slot::Live(node));
    }

    /// Drop a reservation which never got committed.
    pub fn release(&self, name: &str) {
        self.slots
            .remove_if(name, |_, slot| matches!(slot, Slot::Reserved));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Node>> {
        self.slots.get(name).and_then(|slot| match slot.value() {
            Slot::Live(node) => Some(node.clone()),
            Slot::Reserved => None,
        })
    }

    /// Detach a live node. Removing an absent name is a no-op.
    pub fn remove(&self, name: &str) -> Option<Arc<Node>> {
        self.slots
            .remove_if(name, |_, slot| matches!(slot, Slot::Live(_)))
            .and_then(|(_, slot)| match slot {
                Slot::Live(node) => Some(node),
                Slot::Reserved => None,
            })
    }

    /// Detach the given node, only if it is the one registered under its
    /// name. Returns true if the node was removed.
    pub fn remove_node(&self, node: &Arc<Node>) -> bool {
        self.slots
            .remove_if(node.name(), |_, slot| match slot {
                Slot::Live(live) => Arc::ptr_eq(live, node),
                Slot::Reserved => false,
            })
            .is_some()
    }

    /// Point in time copy of live nodes, sorted by name.
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self
            .slots
            .iter()
            .filter_map(|slot| match slot.value() {
                Slot::Live(node) => Some(node.clone()),
                Slot::Reserved => None,
            })
            .collect();
        nodes.sort_by(|a, b| a.name().cmp(b.name()));
        nodes
    }

    /// Returns true if the name is taken, either by a live node or a
    /// reservation.
    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
