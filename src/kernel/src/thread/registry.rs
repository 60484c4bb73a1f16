//! Registry of every live thread, keyed by id.
//!
//! Threads enter the registry when created and leave it when the reaper
//! terminates them. The registry is never touched from interrupt context, so
//! a plain [`spin::Mutex`] is enough.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_common::{KernelError, Result, ThreadId};
use kestrel_hal::Arch;
use log::{info, warn};
use spin::Mutex;

use super::Thread;

/// Table of live threads plus the id allocator.
pub struct ThreadRegistry<A: Arch> {
    threads: Mutex<BTreeMap<ThreadId, Arc<Thread<A>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl<A: Arch> ThreadRegistry<A> {
    /// Create an empty registry that admits at most `capacity` threads.
    pub fn new(capacity: usize) -> Self {
        Self {
            threads: Mutex::new(BTreeMap::new()),
            // Id 0 means "no thread" to the mutex owner field.
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Hand out the next unused thread id.
    pub(crate) fn allocate_id(&self) -> ThreadId {
        ThreadId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether another thread would currently fit.
    pub fn has_room(&self) -> bool {
        self.threads.lock().len() < self.capacity
    }

    /// Add a thread, failing once the limit is reached.
    pub(crate) fn insert(&self, thread: Arc<Thread<A>>) -> Result<()> {
        let mut threads = self.threads.lock();
        if threads.len() >= self.capacity {
            warn!("thread limit of {} reached, refusing {}", self.capacity, thread.name());
            return Err(KernelError::OutOfThreads);
        }
        threads.insert(thread.id(), thread);
        Ok(())
    }

    /// Look a thread up by id.
    pub fn get(&self, id: ThreadId) -> Option<Arc<Thread<A>>> {
        self.threads.lock().get(&id).cloned()
    }

    /// Drop the registry's reference to a thread.
    pub(crate) fn remove(&self, id: ThreadId) -> Option<Arc<Thread<A>>> {
        self.threads.lock().remove(&id)
    }

    /// Number of registered threads, idle threads included.
    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    /// Whether no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Maximum number of threads.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of all registered threads in id order.
    pub fn snapshot(&self) -> Vec<Arc<Thread<A>>> {
        self.threads.lock().values().cloned().collect()
    }

    /// Log one line per thread.
    pub fn dump(&self) {
        for thread in self.snapshot() {
            info!(
                "{:>4} {:<34} cpu{} {:?} {:?}",
                thread.id(),
                thread.name(),
                thread.cpu(),
                thread.state(),
                thread.flags()
            );
        }
    }
}
