// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node table: slot allocation, state tracking and attribute storage.

use super::cache::NodeIdCache;
use super::RegistryError;
use nocan::can::{NodeId, MAX_NODE_COUNT};
use nocan::node::{NodeState, Udid8};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

/// A registered bus node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub udid: Udid8,
    pub state: NodeState,
    pub firmware_version: u8,
    pub last_seen: SystemTime,
    pub attributes: HashMap<String, String>,
}

impl Node {
    fn new(id: NodeId, udid: Udid8, firmware_version: u8) -> Self {
        Self {
            id,
            udid,
            state: NodeState::Unknown,
            firmware_version,
            last_seen: SystemTime::now(),
            attributes: HashMap::new(),
        }
    }

    /// `last_seen` in nanoseconds since the epoch, as used on the wire.
    #[must_use]
    pub fn last_seen_ns(&self) -> u64 {
        self.last_seen
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    /// Replace `$(KEY)` occurrences with the node's attribute values.
    ///
    /// Unknown keys expand to the empty string; an unterminated `$(`
    /// sequence is passed through verbatim.
    #[must_use]
    pub fn expand_attributes(&self, s: &str) -> String {
        let mut result = String::with_capacity(s.len());
        let mut rest = s;
        loop {
            match rest.find("$(") {
                None => {
                    result.push_str(rest);
                    return result;
                }
                Some(start) => {
                    result.push_str(&rest[..start]);
                    rest = &rest[start..];
                    match rest.find(')') {
                        None => {
                            result.push_str(rest);
                            return result;
                        }
                        Some(end) => {
                            let key = &rest[2..end];
                            if let Some(value) = self.attributes.get(key) {
                                result.push_str(value);
                            }
                            rest = &rest[end + 1..];
                        }
                    }
                }
            }
        }
    }
}

struct Slots {
    nodes: [Option<Node>; MAX_NODE_COUNT],
    udids: HashMap<Udid8, NodeId>,
}

/// All registered nodes: a 128-slot table plus a udid index, one lock.
pub struct NodeRegistry {
    slots: RwLock<Slots>,
}

impl NodeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                nodes: std::array::from_fn(|_| None),
                udids: HashMap::new(),
            }),
        }
    }

    /// Register a node, assigning it an id.
    ///
    /// A known udid keeps its id and flips back to `Connecting`. New udids
    /// prefer their cached id, then the lowest slot absent from the cache,
    /// then any free slot (overwriting the stale cache binding).
    pub fn register(
        &self,
        udid: Udid8,
        firmware_version: u8,
        cache: &NodeIdCache,
    ) -> Result<Node, RegistryError> {
        if udid.is_null() {
            return Err(RegistryError::NullUdid);
        }

        let mut slots = self.slots.write();

        if let Some(&id) = slots.udids.get(&udid) {
            let node = slots.nodes[usize::from(id)]
                .as_mut()
                .expect("udid index points at an occupied slot");
            node.state = NodeState::Connecting;
            node.firmware_version = firmware_version;
            node.last_seen = SystemTime::now();
            return Ok(node.clone());
        }

        let id = self.pick_slot(&slots, udid, cache)?;
        let mut node = Node::new(id, udid, firmware_version);
        node.attributes.insert("ID".to_string(), id.to_string());
        slots.udids.insert(udid, id);
        slots.nodes[usize::from(id)] = Some(node.clone());
        cache.set_entry(udid, id);
        Ok(node)
    }

    fn pick_slot(
        &self,
        slots: &Slots,
        udid: Udid8,
        cache: &NodeIdCache,
    ) -> Result<NodeId, RegistryError> {
        if let Some(cached) = cache.lookup(&udid) {
            if cached != 0 && slots.nodes[usize::from(cached)].is_none() {
                return Ok(cached);
            }
        }
        // Prefer slots no other udid has a claim on.
        for id in 1..MAX_NODE_COUNT {
            if slots.nodes[id].is_none() && !cache.contains_id(id as NodeId) {
                return Ok(id as NodeId);
            }
        }
        for id in 1..MAX_NODE_COUNT {
            if slots.nodes[id].is_none() {
                return Ok(id as NodeId);
            }
        }
        Err(RegistryError::NodeTableFull)
    }

    /// Remove a node; true when the slot held that udid.
    pub fn unregister(&self, id: NodeId) -> bool {
        let mut slots = self.slots.write();
        match slots.nodes[usize::from(id)].take() {
            Some(node) => {
                slots.udids.remove(&node.udid);
                true
            }
            None => false,
        }
    }

    /// Drop every node (bus power-off).
    pub fn clear(&self) {
        let mut slots = self.slots.write();
        slots.udids.clear();
        for slot in slots.nodes.iter_mut() {
            *slot = None;
        }
    }

    #[must_use]
    pub fn find(&self, id: NodeId) -> Option<Node> {
        self.slots.read().nodes[usize::from(id) % MAX_NODE_COUNT].clone()
    }

    #[must_use]
    pub fn lookup_udid(&self, udid: &Udid8) -> Option<NodeId> {
        self.slots.read().udids.get(udid).copied()
    }

    pub fn set_state(&self, id: NodeId, state: NodeState) {
        if let Some(node) = self.slots.write().nodes[usize::from(id)].as_mut() {
            node.state = state;
        }
    }

    /// Refresh the node's liveness timestamp.
    pub fn touch(&self, id: NodeId) {
        if let Some(node) = self.slots.write().nodes[usize::from(id)].as_mut() {
            node.last_seen = SystemTime::now();
        }
    }

    pub fn set_attribute(&self, id: NodeId, key: &str, value: &str) {
        if let Some(node) = self.slots.write().nodes[usize::from(id)].as_mut() {
            node.attributes.insert(key.to_string(), value.to_string());
        }
    }

    /// Snapshot of every registered node, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Node> {
        self.slots
            .read()
            .nodes
            .iter()
            .filter_map(|slot| slot.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .nodes
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
