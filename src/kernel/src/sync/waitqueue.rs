//! FIFO queue of blocked threads.
//!
//! A thread joins the queue and becomes `Blocked` in one step under the
//! queue's lock; a signaller removes it and makes it `Runnable` in one step
//! under the same lock. Sleeping releases the lock only after the thread is
//! linked, with interrupts still masked, so a wakeup can never slip in
//! between checking a condition and going to sleep.

use alloc::{collections::VecDeque, sync::Arc};

use kestrel_common::ThreadId;
use kestrel_hal::Arch;

use super::{Spinlock, SpinlockIrqGuard};
use crate::thread::{Linkage, Thread};
use crate::Kernel;

/// Threads parked on a queue, in arrival order.
pub(crate) type WaitList<A> = VecDeque<Arc<Thread<A>>>;

/// A queue threads sleep on until signalled.
pub struct WaitQueue<A: Arch> {
    waiters: Spinlock<WaitList<A>>,
}

impl<A: Arch> WaitQueue<A> {
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            waiters: Spinlock::new(VecDeque::new()),
        }
    }

    /// Block the calling thread until it is signalled.
    ///
    /// # Panics
    ///
    /// Panics in interrupt context or on the idle thread.
    pub fn wait(&self, kernel: &Kernel<A>) {
        let waiters = self.waiters.lock_irqsave(kernel.arch());
        self.sleep(kernel, waiters);
    }

    /// Block the calling thread while `condition` holds.
    ///
    /// The condition is evaluated under the queue lock, so a signaller that
    /// changes it before signalling cannot be missed. It is checked again
    /// after every wakeup; returns immediately if it is already false.
    pub fn wait_while<F>(&self, kernel: &Kernel<A>, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        loop {
            let waiters = self.waiters.lock_irqsave(kernel.arch());
            if !condition() {
                return;
            }
            self.sleep(kernel, waiters);
        }
    }

    fn sleep(&self, kernel: &Kernel<A>, mut waiters: SpinlockIrqGuard<'_, WaitList<A>, A>) {
        let me = kernel.block_current(Linkage::WaitQueue);
        waiters.push_back(me);
        let state = waiters.unlock_keep_masked();
        kernel.schedule_irqs_off();
        kernel.arch().restore_interrupts(state);
    }

    /// Wake the oldest waiter. Returns whether there was one.
    pub fn signal(&self, kernel: &Kernel<A>) -> bool {
        let mut waiters = self.waiters.lock_irqsave(kernel.arch());
        match waiters.pop_front() {
            Some(thread) => {
                thread.unlink(Linkage::WaitQueue);
                kernel.wake(thread);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter. Returns how many were woken.
    pub fn signal_all(&self, kernel: &Kernel<A>) -> usize {
        let mut waiters = self.waiters.lock_irqsave(kernel.arch());
        let woken = waiters.len();
        while let Some(thread) = waiters.pop_front() {
            thread.unlink(Linkage::WaitQueue);
            kernel.wake(thread);
        }
        woken
    }

    /// Number of blocked threads.
    pub fn len(&self, kernel: &Kernel<A>) -> usize {
        self.waiters.lock_irqsave(kernel.arch()).len()
    }

    /// Whether nobody is waiting.
    pub fn is_empty(&self, kernel: &Kernel<A>) -> bool {
        self.len(kernel) == 0
    }

    /// Whether `id` is among the waiters.
    pub fn contains(&self, kernel: &Kernel<A>, id: ThreadId) -> bool {
        self.waiters
            .lock_irqsave(kernel.arch())
            .iter()
            .any(|t| t.id() == id)
    }
}

impl<A: Arch> Default for WaitQueue<A> {
    fn default() -> Self {
        Self::new()
    }
}
