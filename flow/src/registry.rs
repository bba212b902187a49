// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

use crate::key::FlowKey;
use ahash::RandomState;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Opaque per-session correlation state.
///
/// A string map by convention: the publishing parser decides the keys, the
/// consuming parser reads the ones it knows (`call_id`, `codec`) and ignores
/// the rest. Reading a missing key yields the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState(HashMap<String, String>);

impl SessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map_or("", String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SessionState {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Concurrent 5-tuple to session-state mapping shared by the parsers of one
/// task.
///
/// `count` is exact: the atomic length is only adjusted after the underlying
/// map confirms that an insert created a new entry or that a remove actually
/// removed one.
#[derive(Debug)]
pub struct FlowRegistry {
    map: DashMap<FlowKey, SessionState, RandomState>,
    len: AtomicUsize,
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(RandomState::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Look up the session state for a flow. Returns a copy so no shard lock
    /// outlives the call.
    #[must_use]
    pub fn get(&self, key: &FlowKey) -> Option<SessionState> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Insert or overwrite; last writer wins.
    pub fn set(&self, key: FlowKey, value: SessionState) {
        if self.map.insert(key, value).is_none() {
            self.len.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove a flow. Returns true when the key was present.
    pub fn delete(&self, key: &FlowKey) -> bool {
        if self.map.remove(key).is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Visit every entry until the visitor returns false.
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(&FlowKey, &SessionState) -> bool,
    {
        for entry in self.map.iter() {
            if !visit(entry.key(), entry.value()) {
                break;
            }
        }
    }

    /// Exact number of live entries, O(1).
    #[must_use]
    pub fn count(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Remove every entry. Deletes key-by-key so the counter stays exact
    /// under concurrent writers.
    pub fn clear(&self) {
        let keys: Vec<FlowKey> = self.map.iter().map(|entry| *entry.key()).collect();
        for key in keys {
            self.delete(&key);
        }
    }
}
