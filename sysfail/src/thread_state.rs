//! The thread-state table.
//!
//! A concurrent `tid -> ThreadState` map. Each entry owns a one-byte toggle
//! the kernel dereferences directly on every syscall from that thread, so
//! entries are heap-allocated once (behind an `Arc`) and never moved;
//! inserting a new tid or growing the backing `HashMap` must not relocate
//! an existing entry's toggle byte.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::{Condvar, Mutex};

use parking_lot::RwLock;

use crate::kabi::SYSCALL_DISPATCH_FILTER_ALLOW;

/// The single byte the kernel reads on every syscall from the owning
/// thread. Plain (non-atomic) storage is correct here: this
/// byte is read/written only by the thread it belongs to, or by a signal
/// handler running synchronously on that same thread.
pub struct Toggle(std::cell::UnsafeCell<u8>);

// SAFETY: access is confined to the owning OS thread (and signal handlers
// that run on it); this crate never reads/writes another thread's toggle.
unsafe impl Sync for Toggle {}
unsafe impl Send for Toggle {}

impl Toggle {
    fn new(value: u8) -> Self {
        Self(std::cell::UnsafeCell::new(value))
    }

    pub fn set(&self, value: u8) {
        unsafe { *self.0.get() = value };
    }

    pub fn get(&self) -> u8 {
        unsafe { *self.0.get() }
    }

    /// Address the kernel's `PR_SET_SYSCALL_USER_DISPATCH` selector
    /// argument must point at.
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.get()
    }
}

/// A binary (0/1) semaphore used to rendezvous an initiator thread with a
/// signal handler running on another thread.
pub struct RendezvousSemaphore {
    state: Mutex<bool>,
    cv: Condvar,
}

impl RendezvousSemaphore {
    /// Starts available, like a binary semaphore initialized to 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(true),
            cv: Condvar::new(),
        }
    }

    /// Decrement, blocking while the count is 0.
    pub fn acquire(&self) {
        let mut available = self.state.lock().unwrap();
        while !*available {
            available = self.cv.wait(available).unwrap();
        }
        *available = false;
    }

    /// Increment (saturating at 1) and wake one waiter.
    pub fn release(&self) {
        let mut available = self.state.lock().unwrap();
        if !*available {
            *available = true;
            self.cv.notify_one();
        }
    }
}

impl Default for RendezvousSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread state for an actively-injected thread.
pub struct ThreadState {
    pub toggle: Toggle,
    pub sig_coord: RendezvousSemaphore,
}

impl ThreadState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            toggle: Toggle::new(SYSCALL_DISPATCH_FILTER_ALLOW),
            sig_coord: RendezvousSemaphore::new(),
        })
    }
}

/// The concurrent `tid -> ThreadState` table.
#[derive(Default)]
pub struct ThreadTable {
    inner: RwLock<HashMap<libc::pid_t, Arc<ThreadState>>>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a fresh entry for `tid` if one is not already present.
    /// Returns the new entry on success, `None` if `tid` was already
    /// tracked (the caller's idempotency check).
    pub fn insert_if_absent(&self, tid: libc::pid_t) -> Option<Arc<ThreadState>> {
        let mut table = self.inner.write();
        if table.contains_key(&tid) {
            return None;
        }
        let st = ThreadState::new();
        table.insert(tid, st.clone());
        Some(st)
    }

    /// Look up the entry for `tid`, if any.
    pub fn get(&self, tid: libc::pid_t) -> Option<Arc<ThreadState>> {
        self.inner.read().get(&tid).cloned()
    }

    /// Remove and return the entry for `tid`, if any.
    pub fn remove(&self, tid: libc::pid_t) -> Option<Arc<ThreadState>> {
        self.inner.write().remove(&tid)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// A consistent snapshot of currently-tracked tids, sufficient for
    /// iterating during shutdown.
    pub fn snapshot_tids(&self) -> Vec<libc::pid_t> {
        self.inner.read().keys().copied().collect()
    }
}
