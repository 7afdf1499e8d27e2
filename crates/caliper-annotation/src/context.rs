//! Per-environment active-path storage.
//!
//! Each environment (in the core, always environment 0) owns a mapping
//! from attribute id to the currently active entry for that attribute.
//! Attributes declared `GLOBAL` instead write into one process-wide slot,
//! visible as a fallback from every environment's `get`.

use hashbrown::HashMap;
use std::sync::RwLock;

/// The payload of one active `(attribute, value)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// An inline 64-bit value, used by `STORE_AS_VALUE` attributes.
    Immediate(u64),
    /// The leaf node id of the active path for this attribute.
    NodeRef(u32),
}

impl Entry {
    fn as_payload(self) -> u64 {
        match self {
            Entry::Immediate(v) => v,
            Entry::NodeRef(id) => id as u64,
        }
    }
}

type EnvMap = HashMap<u32, Entry>;

/// Owns every environment's active-path table plus the shared global slot.
pub struct Context {
    environments: RwLock<Vec<RwLock<EnvMap>>>,
    globals: RwLock<EnvMap>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Context {
    /// Creates a `Context` with `initial_environments` pre-allocated
    /// (environment 0 always exists).
    pub fn new(initial_environments: usize) -> Self {
        let count = initial_environments.max(1);
        let environments = (0..count).map(|_| RwLock::new(HashMap::new())).collect();
        Context {
            environments: RwLock::new(environments),
            globals: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a new environment whose entries start as a copy of
    /// `source`'s. Returns the new environment's id.
    pub fn clone_environment(&self, source: u32) -> u32 {
        let cloned = {
            let environments = self.environments.read().expect("context lock poisoned");
            environments[source as usize]
                .read()
                .expect("context lock poisoned")
                .clone()
        };
        let mut environments = self.environments.write().expect("context lock poisoned");
        let new_id = environments.len() as u32;
        environments.push(RwLock::new(cloned));
        new_id
    }

    /// Writes (or overwrites) the entry for `key` in `env`. When `global`
    /// is set, the write lands in the process-wide slot instead, visible
    /// from every environment.
    pub fn set(&self, env: u32, key: u32, value: u64, global: bool) {
        let entry = Entry::Immediate(value);
        self.set_entry(env, key, entry, global);
    }

    /// As `set`, but for entries that are node references rather than
    /// immediate values (the common non-`STORE_AS_VALUE` path).
    pub fn set_node_ref(&self, env: u32, key: u32, node_id: u32, global: bool) {
        self.set_entry(env, key, Entry::NodeRef(node_id), global);
    }

    fn set_entry(&self, env: u32, key: u32, entry: Entry, global: bool) {
        if global {
            self.globals
                .write()
                .expect("context lock poisoned")
                .insert(key, entry);
            return;
        }
        let environments = self.environments.read().expect("context lock poisoned");
        environments[env as usize]
            .write()
            .expect("context lock poisoned")
            .insert(key, entry);
    }

    /// Removes the entry for `key`, from both the per-environment table
    /// and the global slot — `end` does not know which one a prior `set`
    /// used, so it clears both to guarantee the attribute reads as absent
    /// afterward.
    pub fn unset(&self, env: u32, key: u32) {
        {
            let environments = self.environments.read().expect("context lock poisoned");
            environments[env as usize]
                .write()
                .expect("context lock poisoned")
                .remove(&key);
        }
        self.globals.write().expect("context lock poisoned").remove(&key);
    }

    /// Returns the raw payload for `key` in `env`, falling back to the
    /// global slot when `env` has no entry of its own.
    pub fn get(&self, env: u32, key: u32) -> Option<u64> {
        self.get_entry(env, key).map(Entry::as_payload)
    }

    /// As `get`, but preserving whether the entry is an immediate value or
    /// a node reference.
    pub fn get_entry(&self, env: u32, key: u32) -> Option<Entry> {
        {
            let environments = self.environments.read().expect("context lock poisoned");
            if let Some(entry) = environments[env as usize]
                .read()
                .expect("context lock poisoned")
                .get(&key)
            {
                return Some(*entry);
            }
        }
        self.globals
            .read()
            .expect("context lock poisoned")
            .get(&key)
            .copied()
    }

    /// Number of distinct attribute ids currently active in `env` (its own
    /// entries plus any global entries it does not shadow).
    pub fn context_size(&self, env: u32) -> usize {
        self.merged_snapshot(env).len()
    }

    /// Serializes `env`'s active entries as `(key, payload)` pairs, in
    /// id-ascending order, into `buf`. Returns the number of pairs
    /// written, truncating to `buf.len() / 2` pair slots.
    pub fn get_context(&self, env: u32, buf: &mut [u64]) -> usize {
        let merged = self.merged_snapshot(env);
        let capacity = buf.len() / 2;
        let written = merged.len().min(capacity);
        for (i, (key, entry)) in merged.into_iter().take(written).enumerate() {
            buf[2 * i] = key as u64;
            buf[2 * i + 1] = entry.as_payload();
        }
        written
    }

    fn merged_snapshot(&self, env: u32) -> Vec<(u32, Entry)> {
        let mut merged: HashMap<u32, Entry> = {
            self.globals
                .read()
                .expect("context lock poisoned")
                .clone()
        };
        {
            let environments = self.environments.read().expect("context lock poisoned");
            for (&key, &entry) in environments[env as usize]
                .read()
                .expect("context lock poisoned")
                .iter()
            {
                merged.insert(key, entry);
            }
        }
        let mut pairs: Vec<(u32, Entry)> = merged.into_iter().collect();
        pairs.sort_unstable_by_key(|(key, _)| *key);
        pairs
    }
}
