//! Engine construction parameters.
//!
//! File loading and CLI-flag parsing are a front-end concern and live
//! outside this crate; `EngineConfig` is the in-memory shape a front end
//! deserializes into before handing it to [`crate::engine::Engine::with_config`].

use serde::{Deserialize, Serialize};

/// Default slab size handed to the [`crate::pool::MemoryPool`] (2 MiB, the
/// pool's own minimum slab size).
pub const DEFAULT_SLAB_SIZE: usize = 2 * 1024 * 1024;

/// Default initial capacity of the dense node vector.
pub const DEFAULT_NODE_CAPACITY: usize = 1024;

/// Default number of environments reserved up front (environment 0 plus a
/// handful of threads before the vector needs to grow).
pub const DEFAULT_ENVIRONMENT_CAPACITY: usize = 16;

/// Tunables for an [`Engine`](crate::engine::Engine) instance.
///
/// `Default` reproduces sensible out-of-the-box values; callers embedding
/// the runtime in a larger service generally only need to
/// override `initial_slab_size` to pre-size for an expected context-tree
/// depth.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the first (and each subsequent default-sized) memory pool
    /// slab, in bytes. Must be at least 2 MiB per the pool's contract.
    pub initial_slab_size: usize,
    /// Initial capacity reserved in the dense node vector.
    pub node_capacity: usize,
    /// Initial capacity reserved for the environment table.
    pub environment_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_slab_size: DEFAULT_SLAB_SIZE,
            node_capacity: DEFAULT_NODE_CAPACITY,
            environment_capacity: DEFAULT_ENVIRONMENT_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Clamps `initial_slab_size` up to the pool's minimum.
    pub fn normalized(mut self) -> Self {
        if self.initial_slab_size < DEFAULT_SLAB_SIZE {
            self.initial_slab_size = DEFAULT_SLAB_SIZE;
        }
        self
    }
}
