//! Counting semaphore for blocking threads.
//!
//! A unit posted while nobody waits is latched in the count and consumed by
//! the next wait. A unit posted while threads wait goes straight to the
//! oldest of them, so the count never rises while the waiter list is
//! non-empty.

use alloc::collections::VecDeque;

use kestrel_hal::Arch;

use super::waitqueue::WaitList;
use super::Spinlock;
use crate::thread::Linkage;
use crate::Kernel;

struct SemaphoreState<A: Arch> {
    count: usize,
    waiters: WaitList<A>,
}

/// A counting semaphore.
///
/// ```ignore
/// let ready = Semaphore::new(0);
/// // producer
/// ready.signal(&kernel);
/// // consumer
/// ready.wait(&kernel);
/// ```
pub struct Semaphore<A: Arch> {
    state: Spinlock<SemaphoreState<A>>,
}

impl<A: Arch> Semaphore<A> {
    /// Create a semaphore holding `count` units.
    pub const fn new(count: usize) -> Self {
        Self {
            state: Spinlock::new(SemaphoreState {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Number of latched units.
    pub fn available(&self, kernel: &Kernel<A>) -> usize {
        self.state.lock_irqsave(kernel.arch()).count
    }

    /// Number of threads blocked on the semaphore.
    pub fn waiter_count(&self, kernel: &Kernel<A>) -> usize {
        self.state.lock_irqsave(kernel.arch()).waiters.len()
    }

    /// Take a unit if one is latched.
    pub fn try_wait(&self, kernel: &Kernel<A>) -> bool {
        let mut state = self.state.lock_irqsave(kernel.arch());
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Take a unit, blocking until one is posted.
    pub fn wait(&self, kernel: &Kernel<A>) {
        let mut state = self.state.lock_irqsave(kernel.arch());
        if state.count > 0 {
            state.count -= 1;
            return;
        }
        let me = kernel.block_current(Linkage::WaitQueue);
        state.waiters.push_back(me);
        let saved = state.unlock_keep_masked();
        // The signaller hands the unit over directly.
        kernel.schedule_irqs_off();
        kernel.arch().restore_interrupts(saved);
    }

    /// Take one unit, blocking if needed, then discard any further latched
    /// units. Returns how many were discarded.
    pub fn wait_and_drain(&self, kernel: &Kernel<A>) -> usize {
        self.wait(kernel);
        let mut state = self.state.lock_irqsave(kernel.arch());
        core::mem::take(&mut state.count)
    }

    /// Post a unit, waking the oldest waiter if there is one.
    ///
    /// Safe to call from interrupt context.
    pub fn signal(&self, kernel: &Kernel<A>) {
        let mut state = self.state.lock_irqsave(kernel.arch());
        match state.waiters.pop_front() {
            Some(thread) => {
                thread.unlink(Linkage::WaitQueue);
                kernel.wake(thread);
            }
            None => state.count += 1,
        }
    }
}
