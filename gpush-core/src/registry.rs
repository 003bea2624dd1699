//! The Change registry: every Change record known to this repository,
//! keyed by local sequence number and indexed by review identifier.
//!
//! The registry is the single place Changes are created, so the
//! monotonic counters live here and the (id, branch) uniqueness
//! invariant is checked here. Mutations set the dirty flag; the state
//! store clears it on save.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::types::{Change, FIRST_CHANGE_KEY};

#[derive(Debug)]
pub struct ChangeRegistry {
    changes: BTreeMap<u64, Change>,
    by_id: HashMap<String, Vec<u64>>,
    pub next_key: u64,
    pub next_group: u64,
    /// Unix timestamp of the last completed garbage collection.
    pub last_gc: i64,
    dirty: bool,
}

impl Default for ChangeRegistry {
    fn default() -> Self {
        ChangeRegistry {
            changes: BTreeMap::new(),
            by_id: HashMap::new(),
            next_key: FIRST_CHANGE_KEY,
            next_group: 1,
            last_gc: 0,
            dirty: false,
        }
    }
}

impl ChangeRegistry {
    pub fn new() -> Self {
        ChangeRegistry::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterates all records in key order, garbage included.
    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.values()
    }

    pub fn get(&self, key: u64) -> Option<&Change> {
        self.changes.get(&key)
    }

    /// Mutable access marks the registry dirty; use `get` when only
    /// reading.
    pub fn get_mut(&mut self, key: u64) -> Option<&mut Change> {
        self.dirty = true;
        self.changes.get_mut(&key)
    }

    /// Keys of every record sharing a review identifier, garbage
    /// excluded.
    pub fn keys_for_id(&self, id: &str) -> Vec<u64> {
        self.by_id
            .get(id)
            .map(|keys| {
                keys.iter()
                    .copied()
                    .filter(|k| !self.changes[k].garbage)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The record for an (id, branch) pair, hidden ones included.
    pub fn find(&self, id: &str, src: &str) -> Option<&Change> {
        self.keys_for_id(id)
            .into_iter()
            .map(|k| &self.changes[&k])
            .find(|ch| ch.src == src)
    }

    /// The single active (non-hidden) record for an (id, branch) pair.
    ///
    /// # Errors
    ///
    /// `Error::State` when more than one active record exists — that is
    /// the uniqueness invariant broken, and proceeding would push the
    /// same review twice.
    pub fn active_for(&self, id: &str, src: &str) -> Result<Option<&Change>> {
        let mut found: Option<&Change> = None;
        for key in self.keys_for_id(id) {
            let ch = &self.changes[&key];
            if ch.src == src && ch.is_active() {
                if found.is_some() {
                    return Err(Error::State(format!(
                        "multiple active changes for {} on branch {}",
                        id, src
                    )));
                }
                found = Some(ch);
            }
        }
        Ok(found)
    }

    /// Creates a fresh Change for (id, src) with the next sequence key.
    pub fn create(&mut self, id: &str, src: &str) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.insert(Change::new(key, id, src));
        key
    }

    /// Inserts a fully formed record (used by the ledger loader and by
    /// copy/placeholder creation). Replaces nothing: duplicate keys are
    /// a caller bug surfaced by `load`'s validation.
    pub fn insert(&mut self, change: Change) {
        self.by_id
            .entry(change.id.clone())
            .or_default()
            .push(change.key);
        self.changes.insert(change.key, change);
        self.dirty = true;
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.changes.contains_key(&key)
    }

    /// Marks a record as logically deleted. The record stays in the maps
    /// (lookups skip garbage) so aux-ref cleanup can still see it.
    pub fn mark_garbage(&mut self, key: u64) {
        if let Some(ch) = self.changes.get_mut(&key) {
            ch.garbage = true;
            self.dirty = true;
        }
    }

    /// Binds an ordered run of Changes into one series, assigning the
    /// next group id to each. Returns the group id.
    pub fn bind_group(&mut self, keys: &[u64]) -> u64 {
        let grp = self.next_group;
        self.next_group += 1;
        for key in keys {
            if let Some(ch) = self.changes.get_mut(key) {
                ch.grp = Some(grp);
            }
        }
        self.dirty = true;
        grp
    }
}
