//! Busy-wait mutual exclusion.
//!
//! [`RawSpinlock`] is a single word that is either 0 (free) or 1 (held). It
//! keeps no owner, so releasing a lock that is not held cannot be told apart
//! from a release by the wrong party; both are reported as a panic.
//!
//! The unpreemptible variant masks interrupts on the local core before taking
//! the word and hands back the previous interrupt state. It is the only lock
//! that may guard data interrupt handlers also touch.
//!
//! Every acquisition that is given the processor spins through
//! [`Processor::relax`]; bare [`RawSpinlock::lock`] falls back to the
//! generic spin hint.
//!
//! [`Spinlock<T>`] wraps data behind a raw lock and hands out RAII guards.

use core::{
    cell::UnsafeCell,
    fmt,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use kestrel_hal::{InterruptControl, InterruptState, Processor};

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;

/// A bare spinlock word.
pub struct RawSpinlock {
    word: AtomicUsize,
}

impl RawSpinlock {
    /// Create a new unlocked spinlock.
    pub const fn new() -> Self {
        Self {
            word: AtomicUsize::new(UNLOCKED),
        }
    }

    /// Spin until the word moves from 0 to 1 for the caller.
    pub fn lock(&self) {
        self.lock_relaxing(hint::spin_loop);
    }

    /// As [`lock`](Self::lock), pausing with `cpu`'s relax hint while held.
    pub fn lock_on<P>(&self, cpu: &P)
    where
        P: Processor + ?Sized,
    {
        self.lock_relaxing(|| cpu.relax());
    }

    fn lock_relaxing(&self, relax: impl Fn()) {
        loop {
            self.wait_unlocked(&relax);
            if self.word.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
                break;
            }
        }
    }

    fn wait_unlocked(&self, relax: &impl Fn()) {
        while self.word.load(Ordering::Relaxed) != UNLOCKED {
            relax();
        }
    }

    /// Attempt to take the lock without spinning.
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the lock.
    ///
    /// # Panics
    ///
    /// Panics if the lock was not held.
    pub fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == UNLOCKED {
            panic!("spinlock {:p} was not locked", self);
        }
    }

    /// Mask local interrupts, then spin for the lock.
    ///
    /// Interrupts are only masked around the acquisition attempt itself; while
    /// the word is observed held they keep their previous state so the core
    /// can still service them.
    pub fn lock_unpreemptible<I>(&self, irq: &I) -> InterruptState
    where
        I: InterruptControl + Processor + ?Sized,
    {
        let state = irq.save_and_disable();
        loop {
            self.wait_unlocked(&|| irq.relax());
            if self.word.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
                return state;
            }
            // Lost the race; let pending interrupts in before retrying.
            irq.restore_interrupts(state);
            irq.disable_interrupts();
        }
    }

    /// Release the lock and restore the interrupt state saved by
    /// [`lock_unpreemptible`](Self::lock_unpreemptible).
    pub fn unlock_unpreemptible<I>(&self, irq: &I, state: InterruptState)
    where
        I: InterruptControl + ?Sized,
    {
        self.unlock();
        irq.restore_interrupts(state);
    }

    /// Returns whether the word is currently held by anyone.
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawSpinlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinlock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Data guarded by a [`RawSpinlock`].
pub struct Spinlock<T: ?Sized> {
    raw: RawSpinlock,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`.
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a new unlocked spinlock protecting the given data.
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinlock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock and return the data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquire the lock, leaving interrupts as they are.
    ///
    /// Never use this for data an interrupt handler on the same core may
    /// touch; use [`lock_irqsave`](Self::lock_irqsave).
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        self.raw.lock();
        SpinlockGuard { lock: self }
    }

    /// Acquire the lock, spinning with `cpu`'s relax hint.
    ///
    /// For callers that already run with interrupts masked.
    pub fn lock_on<P>(&self, cpu: &P) -> SpinlockGuard<'_, T>
    where
        P: Processor + ?Sized,
    {
        self.raw.lock_on(cpu);
        SpinlockGuard { lock: self }
    }

    /// Attempt to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire the lock with local interrupts masked until the guard drops.
    pub fn lock_irqsave<'a, I>(&'a self, irq: &'a I) -> SpinlockIrqGuard<'a, T, I>
    where
        I: InterruptControl + Processor + ?Sized,
    {
        let state = self.raw.lock_unpreemptible(irq);
        SpinlockIrqGuard {
            lock: self,
            irq,
            state,
        }
    }

    /// Returns whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Mutable access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Spinlock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Spinlock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spinlock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard returned by [`Spinlock::lock`].
pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

/// RAII guard returned by [`Spinlock::lock_irqsave`].
pub struct SpinlockIrqGuard<'a, T: ?Sized, I: InterruptControl + ?Sized> {
    lock: &'a Spinlock<T>,
    irq: &'a I,
    state: InterruptState,
}

impl<'a, T: ?Sized, I: InterruptControl + ?Sized> SpinlockIrqGuard<'a, T, I> {
    /// Release the lock but keep interrupts masked, returning the state the
    /// caller must eventually restore.
    ///
    /// Blocking paths use this to drop a queue lock and enter the scheduler
    /// without an interrupt slipping in between.
    pub fn unlock_keep_masked(self) -> InterruptState {
        let state = self.state;
        self.lock.raw.unlock();
        core::mem::forget(self);
        state
    }
}

impl<T: ?Sized, I: InterruptControl + ?Sized> Deref for SpinlockIrqGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized, I: InterruptControl + ?Sized> DerefMut for SpinlockIrqGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: We hold the lock, so we have exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized, I: InterruptControl + ?Sized> Drop for SpinlockIrqGuard<'_, T, I> {
    fn drop(&mut self) {
        self.lock.raw.unlock_unpreemptible(self.irq, self.state);
    }
}
