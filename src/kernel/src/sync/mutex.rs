//! Sleeping mutex.
//!
//! Contended lockers block on a binary semaphore instead of spinning. The
//! mutex remembers its owner so that unlocking from another thread, and
//! ownership assertions, can be checked.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

use kestrel_common::ThreadId;
use kestrel_hal::Arch;

use super::Semaphore;
use crate::Kernel;

const NO_OWNER: u64 = 0;

/// A mutex whose waiters sleep.
///
/// Must not be taken from interrupt context. An idle thread may only take
/// it when it is free.
pub struct Mutex<T, A: Arch> {
    sem: Semaphore<A>,
    owner: AtomicU64,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `sem`.
unsafe impl<T: Send, A: Arch> Send for Mutex<T, A> {}
unsafe impl<T: Send, A: Arch> Sync for Mutex<T, A> {}

impl<T, A: Arch> Mutex<T, A> {
    /// Create an unlocked mutex protecting `data`.
    pub const fn new(data: T) -> Self {
        Self {
            sem: Semaphore::new(1),
            owner: AtomicU64::new(NO_OWNER),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, sleeping while another thread holds it.
    pub fn lock<'a>(&'a self, kernel: &'a Kernel<A>) -> MutexGuard<'a, T, A> {
        let me = kernel.current_thread().id();
        assert_ne!(self.owner(), Some(me), "thread {} relocked a mutex it holds", me);
        self.sem.wait(kernel);
        self.owner.store(me.as_u64(), Ordering::Release);
        MutexGuard { mutex: self, kernel }
    }

    /// Acquire the lock only if it is free.
    pub fn try_lock<'a>(&'a self, kernel: &'a Kernel<A>) -> Option<MutexGuard<'a, T, A>> {
        if !self.sem.try_wait(kernel) {
            return None;
        }
        let me = kernel.current_thread().id();
        self.owner.store(me.as_u64(), Ordering::Release);
        Some(MutexGuard { mutex: self, kernel })
    }

    /// Thread holding the lock, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            raw => Some(ThreadId::new(raw)),
        }
    }

    /// Panics unless the calling thread holds the lock.
    pub fn assert_locked(&self, kernel: &Kernel<A>) {
        let me = kernel.current_thread().id();
        assert_eq!(self.owner(), Some(me), "mutex not held by thread {}", me);
    }

    /// Panics if the calling thread holds the lock.
    pub fn assert_unlocked(&self, kernel: &Kernel<A>) {
        let me = kernel.current_thread().id();
        assert_ne!(self.owner(), Some(me), "mutex unexpectedly held by thread {}", me);
    }

    fn unlock(&self, kernel: &Kernel<A>) {
        let me = kernel.current_thread().id();
        if self
            .owner
            .compare_exchange(me.as_u64(), NO_OWNER, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            panic!("thread {} released a mutex owned by {:?}", me, self.owner());
        }
        self.sem.signal(kernel);
    }
}

/// RAII guard that releases the mutex when dropped.
pub struct MutexGuard<'a, T, A: Arch> {
    mutex: &'a Mutex<T, A>,
    kernel: &'a Kernel<A>,
}

impl<T, A: Arch> Deref for MutexGuard<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, A: Arch> DerefMut for MutexGuard<'_, T, A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, A: Arch> Drop for MutexGuard<'_, T, A> {
    fn drop(&mut self) {
        self.mutex.unlock(self.kernel);
    }
}
