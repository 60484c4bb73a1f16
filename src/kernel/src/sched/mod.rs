//! Per-core round-robin scheduler.
//!
//! Each core owns a run queue and an idle thread. Threads are pinned to the
//! core they were created for. A core that wakes a thread belonging to
//! another core pushes it into that core's inbox and sends it a reschedule
//! IPI; the target drains its inbox into the run queue on its next pass
//! through the scheduler.
//!
//! Lock order: wait queue (or semaphore, sleep list) before run queue.

mod irq;
mod percpu;

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use kestrel_common::{KernelError, Result, ThreadState};
use kestrel_hal::{Arch, CpuId, Ipi};
use log::{info, trace};

use crate::thread::{Linkage, Thread, ThreadFlags};
use crate::{Kernel, KernelConfig};

pub use percpu::PerCpu;

/// Global scheduler state: the activation flag plus every core's block.
pub struct Scheduler<A: Arch> {
    active: AtomicBool,
    cpus: Box<[PerCpu<A>]>,
}

impl<A: Arch> Scheduler<A> {
    pub(crate) fn new(config: &KernelConfig) -> Self {
        let cpus: Vec<PerCpu<A>> = (0..config.cpu_count)
            .map(|id| PerCpu::new(id, config.max_threads, config.timeslice_ticks))
            .collect();
        Self {
            active: AtomicBool::new(false),
            cpus: cpus.into_boxed_slice(),
        }
    }

    /// Whether the scheduler is accepting reschedule requests.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Block of core `id`.
    pub fn cpu(&self, id: CpuId) -> Option<&PerCpu<A>> {
        self.cpus.get(id)
    }

    /// All core blocks.
    pub fn cpus(&self) -> &[PerCpu<A>] {
        &self.cpus
    }
}

impl<A: Arch> Kernel<A> {
    /// Block of the executing core.
    ///
    /// # Panics
    ///
    /// Panics if the architecture reports a core the kernel was not
    /// configured for.
    pub fn this_cpu(&self) -> &PerCpu<A> {
        let id = self.arch().cpu_id();
        match self.scheduler().cpu(id) {
            Some(cpu) => cpu,
            None => panic!("running on cpu{} but only {} configured", id, self.config().cpu_count),
        }
    }

    /// Thread running on the executing core.
    pub fn current_thread(&self) -> Arc<Thread<A>> {
        let state = self.arch().save_and_disable();
        let cpu = self.this_cpu();
        let current = cpu.current(self.arch());
        self.arch().restore_interrupts(state);
        match current {
            Some(thread) => thread,
            None => panic!("cpu{} has no current thread", cpu.id()),
        }
    }

    /// Adopt the flow executing on `cpu` as that core's idle thread.
    ///
    /// Called once per core from its boot path, before
    /// [`activate_scheduler`](Self::activate_scheduler).
    pub fn bootstrap_cpu(&self, cpu: CpuId) -> Result<Arc<Thread<A>>> {
        let percpu = self.scheduler().cpu(cpu).ok_or(KernelError::BadCpu)?;
        if percpu.is_online() || cpu != self.arch().cpu_id() {
            return Err(KernelError::BadCpu);
        }

        let idle = Arc::new(Thread::new(
            self.threads().allocate_id(),
            "idle",
            cpu,
            None,
            ThreadFlags::KERNEL | ThreadFlags::IDLE | ThreadFlags::ACTIVE,
            ThreadState::Runnable,
            self.arch().bootstrap_context(cpu),
        ));
        self.threads().insert(Arc::clone(&idle))?;
        idle.transition(ThreadState::Running);
        percpu.install_idle(Arc::clone(&idle));
        *percpu.current.lock_irqsave(self.arch()) = Some(Arc::clone(&idle));
        percpu.set_online();
        info!("cpu{} online, idle thread {}", cpu, idle.id());
        Ok(idle)
    }

    /// Start honouring reschedule requests and cross-core wakeups.
    pub fn activate_scheduler(&self) {
        self.scheduler().active.store(true, Ordering::Release);
        info!("scheduler active on {} cpus", self.config().cpu_count);
    }

    /// Stop honouring reschedule requests. Used on the panic path.
    pub fn deactivate_scheduler(&self) {
        self.scheduler().active.store(false, Ordering::Release);
    }

    /// Whether the scheduler is active.
    pub fn is_scheduler_active(&self) -> bool {
        self.scheduler().is_active()
    }

    /// Give up the core if anything else is runnable.
    ///
    /// Does nothing while the scheduler is inactive.
    pub fn schedule(&self) {
        if !self.is_scheduler_active() {
            return;
        }
        let state = self.arch().save_and_disable();
        self.schedule_irqs_off();
        self.arch().restore_interrupts(state);
    }

    /// Dispatch `thread` immediately, ahead of anything queued before it.
    ///
    /// # Panics
    ///
    /// Panics if `thread` belongs to another core or is not runnable.
    pub fn switch_to(&self, thread: &Arc<Thread<A>>) {
        let state = self.arch().save_and_disable();
        let cpu = self.this_cpu();
        assert_eq!(thread.cpu(), cpu.id(), "thread {} is pinned to another cpu", thread.id());
        let current = self.current_thread();
        if !Arc::ptr_eq(&current, thread) {
            drop(current);
            self.dispatch(cpu, Some(thread));
        }
        self.arch().restore_interrupts(state);
    }

    /// Ask every other online core to reschedule.
    pub fn broadcast_schedule(&self) {
        if self.is_scheduler_active() {
            self.send_to_others(Ipi::Reschedule);
        }
    }

    pub(crate) fn send_to_others(&self, ipi: Ipi) {
        let me = self.arch().cpu_id();
        for cpu in self.scheduler().cpus() {
            if cpu.id() != me && cpu.is_online() {
                self.arch().send_ipi(cpu.id(), ipi);
            }
        }
    }

    /// Scheduler core. Interrupts must be masked; ignores the active flag.
    pub(crate) fn schedule_irqs_off(&self) {
        let cpu = self.this_cpu();
        self.dispatch(cpu, None);
    }

    /// Pick the next thread (`forced`, else the run-queue head, else idle) and
    /// switch to it.
    fn dispatch(&self, cpu: &PerCpu<A>, forced: Option<&Arc<Thread<A>>>) {
        let switch = {
            let mut run_queue = cpu.run_queue.lock_on(self.arch());
            while let Some(thread) = cpu.inbox.pop() {
                run_queue.push_back(thread);
            }

            let current = cpu.current.lock_on(self.arch()).clone();
            let current = match current {
                Some(thread) => thread,
                None => panic!("cpu{} entered the scheduler without a thread", cpu.id()),
            };
            current.clear_flags(ThreadFlags::RESCHEDULE);
            cpu.reset_slice(self.config().timeslice_ticks);

            if current.state() == ThreadState::Running && !current.is_idle() {
                current.transition(ThreadState::Runnable);
                current.link(Linkage::RunQueue);
                run_queue.push_back(Arc::clone(&current));
            }

            let next = match forced {
                Some(thread) => {
                    take_queued(&mut run_queue, thread);
                    Arc::clone(thread)
                }
                None => match run_queue.pop_front() {
                    Some(thread) => {
                        thread.unlink(Linkage::RunQueue);
                        thread
                    }
                    None => match cpu.idle() {
                        Some(idle) => Arc::clone(idle),
                        None => panic!("cpu{} has no idle thread", cpu.id()),
                    },
                },
            };

            if Arc::ptr_eq(&next, &current) {
                if next.state() != ThreadState::Running {
                    next.transition(ThreadState::Running);
                }
                None
            } else {
                if current.is_idle() {
                    current.transition(ThreadState::Runnable);
                }
                next.transition(ThreadState::Running);
                next.set_flags(ThreadFlags::ACTIVE);

                let from: *const A::Context = current.context();
                let to: *const A::Context = next.context();
                trace!("cpu{}: {} -> {}", cpu.id(), current.id(), next.id());
                *cpu.current.lock_on(self.arch()) = Some(next);
                let mut switched_from = cpu.switched_from.lock_on(self.arch());
                assert!(switched_from.is_none(), "cpu{}: previous switch never finished", cpu.id());
                *switched_from = Some(current);
                cpu.count_switch();
                Some((from, to))
            }
        };

        if let Some((from, to)) = switch {
            // Safety: `switched_from` keeps `from` alive and `current` keeps
            // `to` alive until the incoming thread runs `finish_switch`.
            unsafe { self.arch().switch(&*from, &*to) };
            self.finish_switch();
        }
    }

    /// Second half of a switch, run by the incoming thread: release the
    /// outgoing thread's stack.
    pub(crate) fn finish_switch(&self) {
        let cpu = self.this_cpu();
        let previous = cpu.switched_from.lock_on(self.arch()).take();
        if let Some(previous) = previous {
            previous.clear_flags(ThreadFlags::ACTIVE);
        }
    }

    /// Queue a runnable thread on its core.
    pub(crate) fn make_runnable(&self, thread: Arc<Thread<A>>) {
        let state = self.arch().save_and_disable();
        let here = self.this_cpu();
        let target = thread.cpu();
        thread.link(Linkage::RunQueue);

        if target == here.id() {
            here.run_queue.lock_on(self.arch()).push_back(thread);
        } else {
            let cpu = match self.scheduler().cpu(target) {
                Some(cpu) => cpu,
                None => panic!("thread {} pinned to missing cpu{}", thread.id(), target),
            };
            if cpu.inbox.push(thread).is_err() {
                panic!("cpu{} inbox overflowed", target);
            }
            if self.is_scheduler_active() && cpu.is_online() {
                self.arch().send_ipi(target, Ipi::Reschedule);
            }
        }

        // Idle must not wait out a slice before picking up work.
        if let Some(current) = here.current(self.arch()) {
            if current.is_idle() {
                current.set_flags(ThreadFlags::RESCHEDULE);
            }
        }
        self.arch().restore_interrupts(state);
    }

    /// Move a blocked thread back to its run queue. The caller has already
    /// taken it off whatever queue it slept on.
    pub(crate) fn wake(&self, thread: Arc<Thread<A>>) {
        thread.transition(ThreadState::Runnable);
        self.make_runnable(thread);
    }

    /// Mark the calling thread blocked on `queue` and return it so the caller
    /// can store it. Interrupts must be masked and the queue lock held.
    ///
    /// # Panics
    ///
    /// Panics in interrupt context or on the idle thread.
    pub(crate) fn block_current(&self, queue: Linkage) -> Arc<Thread<A>> {
        let cpu = self.this_cpu();
        assert!(!cpu.in_interrupt(), "cpu{}: blocking in interrupt context", cpu.id());
        let me = match cpu.current(self.arch()) {
            Some(thread) => thread,
            None => panic!("cpu{} has no current thread", cpu.id()),
        };
        assert!(!me.is_idle(), "cpu{}: idle thread tried to block", cpu.id());
        me.transition(ThreadState::Blocked);
        me.link(queue);
        me
    }

    /// Loop run by a core's idle thread once the core is up.
    pub fn idle_loop(&self) -> ! {
        loop {
            let state = self.arch().save_and_disable();
            let cpu = self.this_cpu();
            let rescheduled = cpu
                .current(self.arch())
                .map(|idle| idle.take_flags(ThreadFlags::RESCHEDULE))
                .unwrap_or(false);
            if self.is_scheduler_active() && (rescheduled || cpu.has_work(self.arch())) {
                self.schedule_irqs_off();
                self.arch().restore_interrupts(state);
            } else {
                self.arch().restore_interrupts(state);
                self.arch().halt();
            }
        }
    }
}

fn take_queued<A: Arch>(run_queue: &mut VecDeque<Arc<Thread<A>>>, thread: &Arc<Thread<A>>) {
    match run_queue.iter().position(|t| Arc::ptr_eq(t, thread)) {
        Some(at) => {
            run_queue.remove(at);
            thread.unlink(Linkage::RunQueue);
        }
        None => panic!("thread {} is not runnable on this cpu", thread.id()),
    }
}
