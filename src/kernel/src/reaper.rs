//! Deferred destruction of exited threads.
//!
//! An exiting thread is still running on its own stack, so it cannot free
//! itself. It is queued here instead, and a dedicated kernel thread frees it
//! once no core is executing on that stack any more.
//!
//! Destruction runs under a sleeping lock, so a direct [`Reaper::reap_one`]
//! caller and the reaper thread never tear down threads at the same time.

use alloc::{collections::VecDeque, sync::Arc};

use kestrel_common::{KernelError, Result, ThreadId, ThreadState};
use kestrel_hal::{Arch, CpuId};
use log::{debug, trace};

use crate::sync::{Mutex, Semaphore, Spinlock};
use crate::thread::{Linkage, Thread, ThreadBuilder};
use crate::Kernel;

/// Queue of zombies awaiting destruction.
pub struct Reaper<A: Arch> {
    queue: Spinlock<VecDeque<Arc<Thread<A>>>>,
    pending: Semaphore<A>,
    /// Threads destroyed so far.
    reaped: Mutex<usize, A>,
}

impl<A: Arch> Reaper<A> {
    pub(crate) const fn new() -> Self {
        Self {
            queue: Spinlock::new(VecDeque::new()),
            pending: Semaphore::new(0),
            reaped: Mutex::new(0),
        }
    }

    /// Number of zombies waiting to be destroyed.
    pub fn pending(&self, kernel: &Kernel<A>) -> usize {
        self.queue.lock_irqsave(kernel.arch()).len()
    }

    /// Number of threads destroyed so far.
    ///
    /// Sleeps while a thread is being destroyed.
    pub fn reaped(&self, kernel: &Kernel<A>) -> usize {
        *self.reaped.lock(kernel)
    }

    pub(crate) fn enqueue(&self, kernel: &Kernel<A>, thread: Arc<Thread<A>>) {
        assert_eq!(
            thread.state(),
            ThreadState::Zombie,
            "thread {} handed to the reaper while alive",
            thread.id()
        );
        trace!("reaper: queued {}", thread.id());
        {
            let mut queue = self.queue.lock_irqsave(kernel.arch());
            thread.link(Linkage::Reaper);
            queue.push_back(thread);
        }
        self.pending.signal(kernel);
    }

    /// Destroy the oldest queued zombie, if any. Returns its id.
    ///
    /// Spins until the zombie's final context switch has completed.
    pub fn reap_one(&self, kernel: &Kernel<A>) -> Option<ThreadId> {
        let mut reaped = self.reaped.lock(kernel);
        let thread = self.queue.lock_irqsave(kernel.arch()).pop_front()?;
        thread.unlink(Linkage::Reaper);
        while thread.is_active() {
            kernel.arch().relax();
        }

        let id = thread.id();
        thread.transition(ThreadState::Terminated);
        let freed = kernel.handles().free_owned_by(kernel, id);
        kernel.threads().remove(id);
        debug!("reaped thread {} {} ({} handles freed)", id, thread.name(), freed);
        drop(thread);
        *reaped += 1;
        Some(id)
    }

    /// Body of the reaper thread.
    pub fn run(&self, kernel: &Kernel<A>) -> ! {
        loop {
            let more = self.pending.wait_and_drain(kernel);
            trace!("reaper: woke with {} more queued", more);
            while self.reap_one(kernel).is_some() {}
        }
    }
}

impl<A: Arch> Kernel<A> {
    /// Create and start the reaper thread on `cpu`.
    pub fn start_reaper(self: &Arc<Self>, cpu: CpuId) -> Result<Arc<Thread<A>>> {
        let thread = ThreadBuilder::new("reaper").cpu(cpu).spawn(self, |k| {
            k.reaper().run(k);
        })?;
        self.resume(&thread);
        Ok(thread)
    }

    /// Hand an exited process thread to the reaper.
    ///
    /// Kernel threads are queued automatically when they exit; threads that
    /// belong to a process stay zombies until their owner releases them here.
    pub fn reaper_enqueue(&self, thread: &Arc<Thread<A>>) -> Result<()> {
        if thread.state() != ThreadState::Zombie
            || thread.is_kernel()
            || thread.linkage() != Linkage::None
        {
            return Err(KernelError::NotZombie);
        }
        self.reaper().enqueue(self, Arc::clone(thread));
        Ok(())
    }
}
