//! A reader/writer lock that tolerates reentrant read acquisition from an
//! asynchronous signal handler running on a thread that already holds the
//! lock for reading.
//!
//! This is the lock protecting the node tree. It is built entirely from
//! atomics: no `Mutex`, no syscalls, nothing a signal handler cannot
//! safely call. Writers are preferred over readers so that a writer
//! waiting behind a stream of readers is not starved.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

thread_local! {
    /// Depth of read locks held by *this* thread. A signal handler that
    /// interrupts a thread already inside `rlock` sees a depth > 0 and
    /// returns immediately instead of spinning.
    static READ_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Signal-safe reader/writer lock over externally-owned data.
///
/// `SigsafeRWLock` itself holds no payload — it only sequences access to
/// whatever the caller protects with it. In this crate a single lock
/// instance guards the engine's node vector and tree links.
#[derive(Debug, Default)]
pub struct SigsafeRWLock {
    readers: AtomicUsize,
    writer_active: AtomicBool,
    writer_waiting: AtomicBool,
}

impl SigsafeRWLock {
    pub fn new() -> Self {
        SigsafeRWLock {
            readers: AtomicUsize::new(0),
            writer_active: AtomicBool::new(false),
            writer_waiting: AtomicBool::new(false),
        }
    }

    /// Acquires the lock for reading.
    ///
    /// Safe to call from a signal handler: if the interrupted thread does
    /// not already hold the lock, this behaves like a normal (spinning)
    /// reader acquire; if it does, this detects the reentry via the
    /// per-thread depth counter and returns without blocking. Deliberately
    /// does not log: a signal handler may call this, and a logging call is
    /// not something this path can assume is safe to make.
    pub fn rlock(&self) {
        let depth = READ_DEPTH.with(|d| d.get());
        if depth > 0 {
            READ_DEPTH.with(|d| d.set(depth + 1));
            return;
        }
        loop {
            while self.writer_active.load(Ordering::Acquire)
                || self.writer_waiting.load(Ordering::Acquire)
            {
                std::hint::spin_loop();
            }
            self.readers.fetch_add(1, Ordering::AcqRel);
            if self.writer_active.load(Ordering::Acquire) {
                // A writer won the race after we checked; back off and retry.
                self.readers.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            break;
        }
        READ_DEPTH.with(|d| d.set(1));
    }

    /// Releases one level of read ownership acquired via `rlock`.
    pub fn runlock(&self) {
        let depth = READ_DEPTH.with(|d| d.get());
        debug_assert!(depth > 0, "runlock called without a matching rlock");
        if depth > 1 {
            READ_DEPTH.with(|d| d.set(depth - 1));
            return;
        }
        READ_DEPTH.with(|d| d.set(0));
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Acquires the lock for writing. Blocks (spins) until no reader and no
    /// other writer holds the lock.
    ///
    /// Never call this from a signal handler, and never hold it across any
    /// code that could itself raise a signal serviced by a handler that
    /// re-enters the engine — both would deadlock the interrupted thread
    /// against itself.
    pub fn wlock(&self) {
        self.writer_waiting.store(true, Ordering::Release);
        if self.writer_active.load(Ordering::Acquire) {
            tracing::debug!("writer waiting on node tree lock: another writer is active");
        }
        while self
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::hint::spin_loop();
        }
        self.writer_waiting.store(false, Ordering::Release);
        let waiting_readers = self.readers.load(Ordering::Acquire);
        if waiting_readers != 0 {
            tracing::debug!(waiting_readers, "writer waiting on node tree lock: readers still active");
        }
        while self.readers.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
    }

    /// Releases the write lock.
    pub fn wunlock(&self) {
        self.writer_active.store(false, Ordering::Release);
    }

    /// RAII read guard: `rlock`s on construction, `runlock`s on drop.
    pub fn read(&self) -> ReadGuard<'_> {
        self.rlock();
        ReadGuard { lock: self }
    }

    /// RAII write guard: `wlock`s on construction, `wunlock`s on drop.
    pub fn write(&self) -> WriteGuard<'_> {
        self.wlock();
        WriteGuard { lock: self }
    }
}

/// Dropping this releases the read lock taken by [`SigsafeRWLock::read`].
pub struct ReadGuard<'a> {
    lock: &'a SigsafeRWLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.runlock();
    }
}

/// Dropping this releases the write lock taken by [`SigsafeRWLock::write`].
pub struct WriteGuard<'a> {
    lock: &'a SigsafeRWLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.wunlock();
    }
}
