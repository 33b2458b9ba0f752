// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel table: name/id bijection and last published value.

use super::RegistryError;
use nocan::can::{ChannelId, MAX_MESSAGE_SIZE, UNDEFINED_CHANNEL};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::SystemTime;

/// A named publish/subscribe channel.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub value: Vec<u8>,
    pub updated_at: SystemTime,
}

struct Tables {
    by_id: HashMap<ChannelId, Channel>,
    by_name: HashMap<String, ChannelId>,
    top_id: ChannelId,
}

/// All live channels under one lock; `by_id` and `by_name` stay bijective.
pub struct ChannelRegistry {
    tables: RwLock<Tables>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
                top_id: 0,
            }),
        }
    }

    /// Create a channel, or return the existing one with that name.
    pub fn register(&self, name: &str) -> Result<Channel, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyChannelName);
        }
        if name.len() > MAX_MESSAGE_SIZE {
            return Err(RegistryError::ChannelNameTooLong(name.len()));
        }

        let mut tables = self.tables.write();
        if let Some(&id) = tables.by_name.get(name) {
            return Ok(tables.by_id[&id].clone());
        }

        // Rotating allocator: skip ids still in use, never hand out 0xFFFF.
        loop {
            let candidate = tables.top_id;
            if candidate == UNDEFINED_CHANNEL {
                tables.top_id = 0;
                continue;
            }
            tables.top_id = tables.top_id.wrapping_add(1);
            if tables.by_id.contains_key(&candidate) {
                continue;
            }
            let channel = Channel {
                id: candidate,
                name: name.to_string(),
                value: Vec::new(),
                updated_at: SystemTime::now(),
            };
            tables.by_id.insert(candidate, channel.clone());
            tables.by_name.insert(name.to_string(), candidate);
            return Ok(channel);
        }
    }

    /// Remove a channel by id; true when it existed.
    pub fn unregister(&self, id: ChannelId) -> bool {
        let mut tables = self.tables.write();
        match tables.by_id.remove(&id) {
            Some(channel) => {
                tables.by_name.remove(&channel.name);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn find(&self, id: ChannelId) -> Option<Channel> {
        self.tables.read().by_id.get(&id).cloned()
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Channel> {
        let tables = self.tables.read();
        tables
            .by_name
            .get(name)
            .and_then(|id| tables.by_id.get(id).cloned())
    }

    /// Store a channel's value; false when the value is oversize or the
    /// channel does not exist.
    pub fn set_content(&self, id: ChannelId, content: &[u8]) -> bool {
        if content.len() > MAX_MESSAGE_SIZE {
            return false;
        }
        let mut tables = self.tables.write();
        match tables.by_id.get_mut(&id) {
            Some(channel) => {
                channel.value = content.to_vec();
                channel.updated_at = SystemTime::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of all channels sorted by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Channel> {
        let tables = self.tables.read();
        let mut channels: Vec<Channel> = tables.by_id.values().cloned().collect();
        channels.sort_by_key(|c| c.id);
        channels
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().by_id.is_empty()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_sequential_ids() {
        let registry = ChannelRegistry::new();
        assert_eq!(registry.register("a").expect("register").id, 0);
        assert_eq!(registry.register("b").expect("register").id, 1);
        assert_eq!(registry.register("c").expect("register").id, 2);
    }

    #[test]
    fn test_register_existing_name_returns_same_channel() {
        let registry = ChannelRegistry::new();
        let first = registry.register("sensors/temp").expect("register");
        let second = registry.register("sensors/temp").expect("register");
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let registry = ChannelRegistry::new();
        assert!(matches!(
            registry.register(""),
            Err(RegistryError::EmptyChannelName)
        ));
        let long = "x".repeat(65);
        assert!(matches!(
            registry.register(&long),
            Err(RegistryError::ChannelNameTooLong(65))
        ));
    }

    #[test]
    fn test_allocator_skips_used_ids() {
        let registry = ChannelRegistry::new();
        registry.register("a").expect("register");
        registry.register("b").expect("register");
        registry.unregister(0);

        // top_id is past both; the freed id 0 is not immediately reused.
        let c = registry.register("c").expect("register");
        assert_eq!(c.id, 2);
    }

    #[test]
    fn test_bijection_invariant() {
        let registry = ChannelRegistry::new();
        for name in ["a", "b/c", "d/e/f"] {
            registry.register(name).expect("register");
        }
        for channel in registry.snapshot() {
            assert_eq!(
                registry.find(channel.id).expect("by id").name,
                channel.name
            );
            assert_eq!(
                registry.lookup(&channel.name).expect("by name").id,
                channel.id
            );
        }
    }

    #[test]
    fn test_unregister() {
        let registry = ChannelRegistry::new();
        let channel = registry.register("gone").expect("register");
        assert!(registry.unregister(channel.id));
        assert!(registry.find(channel.id).is_none());
        assert!(registry.lookup("gone").is_none());
        assert!(!registry.unregister(channel.id));
    }

    #[test]
    fn test_set_content() {
        let registry = ChannelRegistry::new();
        let channel = registry.register("data").expect("register");

        assert!(registry.set_content(channel.id, b"hello"));
        assert_eq!(registry.find(channel.id).expect("channel").value, b"hello");

        assert!(!registry.set_content(channel.id, &[0u8; 65]));
        assert!(!registry.set_content(9999, b"x"));
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = ChannelRegistry::new();
        for name in ["one", "two", "three", "four"] {
            registry.register(name).expect("register");
        }
        let ids: Vec<ChannelId> = registry.snapshot().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
