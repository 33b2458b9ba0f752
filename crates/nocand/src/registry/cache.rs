// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent udid-to-node-id cache.
//!
//! Nodes keep their id across daemon restarts through a JSON file of
//! `{udid, node_id}` entries sorted by id. Mutations mark the cache dirty
//! and arm a single debounced save one minute later, so bursts of
//! registrations coalesce into one write.

use nocan::can::NodeId;
use nocan::node::Udid8;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay between the first mutation and the write that persists it.
pub const SAVE_DEBOUNCE: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    udid: String,
    node_id: NodeId,
}

#[derive(Default)]
struct CacheState {
    forward: HashMap<Udid8, NodeId>,
    reverse: HashSet<NodeId>,
    dirty: bool,
    save_armed: bool,
}

struct Inner {
    path: Option<PathBuf>,
    state: Mutex<CacheState>,
}

/// Shared handle to the node id cache.
#[derive(Clone)]
pub struct NodeIdCache {
    inner: Arc<Inner>,
}

impl NodeIdCache {
    /// A cache persisted at `path`.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner {
                path: Some(path),
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// An in-memory cache that never touches the filesystem.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Inner {
                path: None,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Load entries from disk. Entries colliding on an already-loaded id
    /// are dropped with a warning; a missing file is not an error.
    pub fn load(&self) -> std::io::Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Could not open cache file {}: {}", path.display(), e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let entries: Vec<CacheEntry> = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut state = self.inner.state.lock();
        let mut loaded = 0usize;
        for (index, entry) in entries.iter().enumerate() {
            let udid: Udid8 = match entry.udid.parse() {
                Ok(udid) => udid,
                Err(e) => {
                    warn!(
                        "Could not decode cache entry {} in {}: {}",
                        index,
                        path.display(),
                        e
                    );
                    continue;
                }
            };
            if state.reverse.contains(&entry.node_id) {
                warn!(
                    "Dropping cache entry {} ({}): node id {} is already bound",
                    index, entry.udid, entry.node_id
                );
                continue;
            }
            state.forward.insert(udid, entry.node_id);
            state.reverse.insert(entry.node_id);
            loaded += 1;
        }

        info!(
            "Loaded node cache file {} with {} entries",
            path.display(),
            loaded
        );
        Ok(())
    }

    /// Record a udid-to-id binding; false when it was already current.
    ///
    /// The first mutation after a save arms the debounced writer.
    pub fn set_entry(&self, udid: Udid8, id: NodeId) -> bool {
        let arm = {
            let mut state = self.inner.state.lock();
            if state.forward.get(&udid) == Some(&id) {
                return false;
            }
            state.forward.insert(udid, id);
            state.reverse.insert(id);
            state.dirty = true;
            let arm = !state.save_armed && self.inner.path.is_some();
            if arm {
                state.save_armed = true;
            }
            arm
        };

        if arm {
            // Outside a runtime (unit tests, shutdown paths) the save is
            // left to an explicit `save` call.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cache = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(SAVE_DEBOUNCE).await;
                    cache.inner.state.lock().save_armed = false;
                    if let Err(e) = cache.save() {
                        warn!("Could not write node cache: {}", e);
                    }
                });
            } else {
                self.inner.state.lock().save_armed = false;
            }
        }
        true
    }

    #[must_use]
    pub fn lookup(&self, udid: &Udid8) -> Option<NodeId> {
        self.inner.state.lock().forward.get(udid).copied()
    }

    /// Whether any cached udid claims this id.
    #[must_use]
    pub fn contains_id(&self, id: NodeId) -> bool {
        self.inner.state.lock().reverse.contains(&id)
    }

    /// Write the cache out now, if it is dirty and persistence is enabled.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };

        let entries = {
            let mut state = self.inner.state.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            let mut entries: Vec<CacheEntry> = state
                .forward
                .iter()
                .map(|(udid, &node_id)| CacheEntry {
                    udid: udid.to_string(),
                    node_id,
                })
                .collect();
            entries.sort_by_key(|entry| entry.node_id);
            entries
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)?;

        info!(
            "Saved node cache file {} with {} entries",
            path.display(),
            entries.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udid(tag: u8) -> Udid8 {
        Udid8([tag, 0, 0, 0, 0, 0, 0, 1])
    }

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("nocand-cache-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn test_set_entry_and_lookup() {
        let cache = NodeIdCache::disabled();
        assert!(cache.set_entry(udid(1), 5));
        assert_eq!(cache.lookup(&udid(1)), Some(5));
        assert!(cache.contains_id(5));
        assert!(!cache.contains_id(6));

        // Re-recording the same binding is a no-op.
        assert!(!cache.set_entry(udid(1), 5));
        // A new id for the same udid is a change.
        assert!(cache.set_entry(udid(1), 6));
        assert_eq!(cache.lookup(&udid(1)), Some(6));
    }

    #[test]
    fn test_save_and_load_sorted() {
        let path = temp_path("roundtrip");
        let cache = NodeIdCache::new(path.clone());
        cache.set_entry(udid(3), 30);
        cache.set_entry(udid(1), 10);
        cache.set_entry(udid(2), 20);
        cache.save().expect("save");

        let content = std::fs::read_to_string(&path).expect("read");
        let entries: Vec<CacheEntry> = serde_json::from_str(&content).expect("parse");
        let ids: Vec<NodeId> = entries.iter().map(|e| e.node_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);

        let reloaded = NodeIdCache::new(path.clone());
        reloaded.load().expect("load");
        assert_eq!(reloaded.lookup(&udid(1)), Some(10));
        assert_eq!(reloaded.lookup(&udid(3)), Some(30));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_skips_when_clean() {
        let path = temp_path("clean");
        let cache = NodeIdCache::new(path.clone());
        cache.save().expect("save");
        assert!(!path.exists());
    }

    #[test]
    fn test_load_drops_id_collisions() {
        let path = temp_path("collide");
        std::fs::write(
            &path,
            r#"[
                {"udid":"01:00:00:00:00:00:00:01","node_id":4},
                {"udid":"02:00:00:00:00:00:00:01","node_id":4},
                {"udid":"03:00:00:00:00:00:00:01","node_id":5}
            ]"#,
        )
        .expect("write");

        let cache = NodeIdCache::new(path.clone());
        cache.load().expect("load");
        assert_eq!(cache.lookup(&udid(1)), Some(4));
        // The later entry lost the collision.
        assert_eq!(cache.lookup(&udid(2)), None);
        assert_eq!(cache.lookup(&udid(3)), Some(5));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_missing_file_is_fine() {
        let cache = NodeIdCache::new(temp_path("missing"));
        assert!(cache.load().is_ok());
    }

    #[test]
    fn test_disabled_cache_never_writes() {
        let cache = NodeIdCache::disabled();
        cache.set_entry(udid(1), 1);
        assert!(cache.save().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_save_coalesces() {
        let path = temp_path("debounce");
        let cache = NodeIdCache::new(path.clone());

        cache.set_entry(udid(1), 1);
        cache.set_entry(udid(2), 2);
        cache.set_entry(udid(3), 3);
        assert!(!path.exists());

        tokio::time::sleep(SAVE_DEBOUNCE + Duration::from_secs(1)).await;
        // Let the armed save task run.
        tokio::task::yield_now().await;

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !path.exists() && std::time::Instant::now() < deadline {
            tokio::task::yield_now().await;
        }
        assert!(path.exists(), "debounced save never ran");

        let entries: Vec<CacheEntry> =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(entries.len(), 3);

        std::fs::remove_file(&path).ok();
    }
}
