//! Bump allocator backing the node tree's value-byte storage.
//!
//! Hands out raw byte ranges that stay valid and never move for the
//! lifetime of the pool. There is no per-allocation free; the pool frees
//! everything at once when dropped. Not internally thread-safe — the
//! engine serializes access by only calling [`MemoryPool::allocate`] while
//! holding the node tree's write lock (see [`crate::sigsafe_lock`]).

use std::alloc::{self, Layout};
use std::ptr::NonNull;

const DEFAULT_ALIGN: usize = 8;

struct Slab {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
    cap: usize,
}

impl Slab {
    fn new(cap: usize) -> Self {
        let layout = Layout::from_size_align(cap, DEFAULT_ALIGN).expect("slab size overflow");
        // SAFETY: `layout` has nonzero size (callers never request a zero-size
        // slab) and an alignment that is a compile-time power of two.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Slab {
            ptr,
            layout,
            len: 0,
            cap,
        }
    }

    fn remaining(&self) -> usize {
        self.cap - self.len
    }

    /// Bumps the cursor forward, aligning it to `align` first, and returns a
    /// pointer into the slab. `None` if the request does not fit.
    fn try_allocate(&mut self, size: usize, align: usize) -> Option<*mut u8> {
        let base = self.ptr.as_ptr() as usize;
        let cursor = base + self.len;
        let aligned = (cursor + align - 1) & !(align - 1);
        let padding = aligned - cursor;
        if padding.checked_add(size)? > self.remaining() {
            return None;
        }
        self.len += padding + size;
        Some(aligned as *mut u8)
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: `self.ptr`/`self.layout` are exactly what `alloc::alloc`
        // returned in `Slab::new`; nothing else frees or reallocates them.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A pool of large slabs handed out as a bump allocator.
///
/// Allocations never move and remain valid until the pool itself is
/// dropped. Out-of-memory is fatal: an allocator request that the global
/// allocator cannot satisfy aborts the process rather than returning an
/// error, since the runtime has no graceful degradation path for a
/// starved annotation pool.
pub struct MemoryPool {
    slabs: Vec<Slab>,
    default_slab_size: usize,
}

// SAFETY: a slab's `NonNull<u8>` is never read or written except through
// `try_allocate`/`Drop`, both called only while the pool's owner holds
// exclusive access (the engine's node-tree write lock gates every
// `MemoryPool::allocate*` call). No slab pointer is ever exposed for
// unsynchronized access by more than one thread at a time.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    /// Creates a pool whose slabs default to `default_slab_size` bytes,
    /// clamped up to a 2 MiB minimum.
    pub fn new(default_slab_size: usize) -> Self {
        let default_slab_size = default_slab_size.max(crate::config::DEFAULT_SLAB_SIZE);
        MemoryPool {
            slabs: vec![Slab::new(default_slab_size)],
            default_slab_size,
        }
    }

    /// Allocates `size` bytes aligned to 8.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        self.allocate_aligned(size, DEFAULT_ALIGN)
    }

    /// Allocates `size` bytes aligned to `align`, which must be a power of
    /// two. Never returns null; a request that overflows every slab grows
    /// the pool with a new slab sized `max(default_slab_size, size + align)`.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> *mut u8 {
        debug_assert!(align.is_power_of_two());
        if let Some(ptr) = self
            .slabs
            .last_mut()
            .and_then(|slab| slab.try_allocate(size, align))
        {
            return ptr;
        }
        let slab_size = self.default_slab_size.max(size + align);
        tracing::debug!(
            slab_size,
            slab_count = self.slabs.len() + 1,
            "node pool growing a new slab"
        );
        self.slabs.push(Slab::new(slab_size));
        self.slabs
            .last_mut()
            .expect("just pushed")
            .try_allocate(size, align)
            .expect("freshly allocated slab must fit the request")
    }

    /// Number of slabs currently owned by the pool. Exposed for tests and
    /// diagnostics only.
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }
}
