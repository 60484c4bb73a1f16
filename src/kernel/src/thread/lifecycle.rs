//! Creating, resuming, sleeping, exiting and joining threads.

use alloc::{boxed::Box, string::String, sync::Arc};

use kestrel_common::{ExitCode, KernelError, Result, ThreadState};
use kestrel_hal::{Arch, CpuId, ThreadEntry};
use log::{debug, trace};

use super::{Linkage, Thread, ThreadFlags};
use crate::Kernel;

/// Configures and creates a thread.
///
/// A new thread starts in [`ThreadState::Init`]; it does not run until it is
/// handed to [`Kernel::resume`].
///
/// ```ignore
/// let worker = ThreadBuilder::new("flusher")
///     .cpu(1)
///     .spawn(&kernel, |k| flush_forever(k))?;
/// kernel.resume(&worker);
/// ```
#[derive(Debug, Clone)]
pub struct ThreadBuilder {
    name: String,
    cpu: Option<CpuId>,
    process: Option<u64>,
}

impl ThreadBuilder {
    /// Start describing a thread called `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            cpu: None,
            process: None,
        }
    }

    /// Pin the thread to `cpu` instead of the calling core.
    pub fn cpu(mut self, cpu: CpuId) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Attach the thread to a process. Threads without one are kernel
    /// threads and are reaped automatically when they exit.
    pub fn process(mut self, process: u64) -> Self {
        self.process = Some(process);
        self
    }

    /// Create the thread.
    ///
    /// `body` runs with interrupts enabled; returning from it exits the thread
    /// with code 0.
    pub fn spawn<A, F>(self, kernel: &Arc<Kernel<A>>, body: F) -> Result<Arc<Thread<A>>>
    where
        A: Arch,
        F: FnOnce(&Arc<Kernel<A>>) + Send + 'static,
    {
        let cpu = self.cpu.unwrap_or_else(|| kernel.arch().cpu_id());
        if kernel.cpu(cpu).is_none() {
            return Err(KernelError::BadCpu);
        }
        if !kernel.threads().has_room() {
            return Err(KernelError::OutOfThreads);
        }

        let runner = Arc::clone(kernel);
        let entry: ThreadEntry = Box::new(move || runner.thread_start(body));
        let context = kernel
            .arch()
            .new_context(cpu, entry)
            .map_err(|_| KernelError::OutOfMemory)?;

        let flags = if self.process.is_none() {
            ThreadFlags::KERNEL
        } else {
            ThreadFlags::empty()
        };
        let thread = Arc::new(Thread::new(
            kernel.threads().allocate_id(),
            &self.name,
            cpu,
            self.process,
            flags,
            ThreadState::Init,
            context,
        ));
        kernel.threads().insert(Arc::clone(&thread))?;
        debug!("created thread {} {} on cpu{}", thread.id(), thread.name(), cpu);
        Ok(thread)
    }
}

impl<A: Arch> Kernel<A> {
    /// First code every spawned thread runs after its initial switch-in.
    fn thread_start<F>(self: Arc<Self>, body: F) -> !
    where
        F: FnOnce(&Arc<Kernel<A>>),
    {
        self.finish_switch();
        self.arch().enable_interrupts();
        body(&self);
        self.exit_current(ExitCode::new(0))
    }

    /// Make a freshly created thread eligible to run on its core.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not in [`ThreadState::Init`].
    pub fn resume(&self, thread: &Arc<Thread<A>>) {
        thread.transition(ThreadState::Runnable);
        trace!("resume {} on cpu{}", thread.id(), thread.cpu());
        self.make_runnable(Arc::clone(thread));
    }

    /// Terminate the calling thread.
    ///
    /// Joiners and handle waiters are signalled. Kernel threads are handed to
    /// the reaper; threads of a process stay zombies until
    /// [`reaper_enqueue`](Self::reaper_enqueue) releases them.
    pub fn exit_current(&self, code: ExitCode) -> ! {
        let _masked = self.arch().save_and_disable();
        let cpu = self.this_cpu();
        assert!(!cpu.in_interrupt(), "thread exit from interrupt context");
        let thread = self.current_thread();
        assert!(!thread.is_idle(), "idle thread on cpu{} tried to exit", cpu.id());

        thread.set_exit_code(code);
        thread.transition(ThreadState::Zombie);
        debug!("thread {} {} exited with {:#x}", thread.id(), thread.name(), code.as_u32());

        thread.exited().signal_all(self);
        self.handles().signal_thread_exit(self, thread.id(), code);
        if thread.is_kernel() {
            self.reaper().enqueue(self, thread);
        } else {
            drop(thread);
        }

        self.schedule_irqs_off();
        panic!("zombie thread rescheduled on cpu{}", self.arch().cpu_id());
    }

    /// Block until `thread` has exited and return its exit code.
    ///
    /// # Panics
    ///
    /// Panics if a thread tries to join itself.
    pub fn join(&self, thread: &Arc<Thread<A>>) -> ExitCode {
        let me = self.current_thread();
        assert!(!Arc::ptr_eq(&me, thread), "thread {} joined itself", me.id());
        drop(me);

        thread
            .exited()
            .wait_while(self, || !thread.state().is_dead());
        match thread.exit_code() {
            Some(code) => code,
            None => panic!("thread {} woke from join while still alive", thread.id()),
        }
    }

    /// Put the calling thread to sleep for at least `ticks` timer ticks.
    ///
    /// Zero ticks just yields the core.
    pub fn sleep_ticks(&self, ticks: u64) {
        if ticks == 0 {
            self.schedule();
            return;
        }

        let state = self.arch().save_and_disable();
        let cpu = self.this_cpu();
        {
            let mut sleepers = cpu.sleepers().lock_on(self.arch());
            let me = self.block_current(Linkage::SleepQueue);
            let deadline = self.arch().current_ticks().saturating_add(ticks);
            me.set_deadline(deadline);
            let at = sleepers.partition_point(|t| t.deadline() <= deadline);
            sleepers.insert(at, me);
        }
        self.schedule_irqs_off();
        self.arch().restore_interrupts(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::KernelConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::vec::Vec;

    #[test]
    fn test_spawn_starts_in_init() {
        let kernel = testutil::boot(KernelConfig::default());
        let thread = ThreadBuilder::new("worker")
            .spawn(&kernel, |_| {})
            .expect("spawn");
        assert_eq!(thread.state(), ThreadState::Init);
        assert_eq!(thread.name(), "[worker]");
        assert!(thread.is_kernel());
        assert_eq!(thread.cpu(), 0);
        assert!(kernel.threads().get(thread.id()).is_some());
    }

    #[test]
    fn test_spawn_rejects_unknown_cpu() {
        let kernel = testutil::boot(KernelConfig::default());
        let result = ThreadBuilder::new("lost").cpu(3).spawn(&kernel, |_| {});
        assert_eq!(result.err(), Some(KernelError::BadCpu));
    }

    #[test]
    fn test_spawn_respects_thread_limit() {
        // cpu0's idle thread takes one of the two slots.
        let kernel = testutil::boot(KernelConfig::default().with_max_threads(2));
        let _first = ThreadBuilder::new("a").spawn(&kernel, |_| {}).expect("first");
        let second = ThreadBuilder::new("b").spawn(&kernel, |_| {});
        assert_eq!(second.err(), Some(KernelError::OutOfThreads));
    }

    #[test]
    fn test_resume_runs_thread_to_exit() {
        let kernel = testutil::boot(KernelConfig::default());
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);
        let thread = testutil::spawn(&kernel, "once", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(kernel.this_cpu().run_queue_len(kernel.arch()), 1);

        kernel.schedule();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(thread.state().is_dead());
        assert_eq!(thread.exit_code(), Some(ExitCode::new(0)));
    }

    #[test]
    #[should_panic(expected = "illegal transition Runnable -> Runnable")]
    fn test_resume_twice_panics() {
        let kernel = testutil::boot(KernelConfig::default());
        let thread = testutil::spawn(&kernel, "twice", |_| {});
        kernel.resume(&thread);
    }

    #[test]
    fn test_user_thread_stays_zombie_until_released() {
        let kernel = testutil::boot(KernelConfig::default());
        let thread = ThreadBuilder::new("user")
            .process(42)
            .spawn(&kernel, |k| k.exit_current(ExitCode::from_parts(ExitCode::TERM_SIGNAL, 9)))
            .expect("spawn");
        kernel.resume(&thread);
        kernel.schedule();

        assert_eq!(thread.state(), ThreadState::Zombie);
        assert_eq!(thread.linkage(), Linkage::None);
        assert_eq!(kernel.reaper().pending(&kernel), 0);
        let code = thread.exit_code().expect("dead");
        assert_eq!(code.reason(), ExitCode::TERM_SIGNAL);
        assert_eq!(code.value(), 9);
    }

    #[test]
    fn test_join_collects_exit_code() {
        let kernel = testutil::boot(KernelConfig::default());
        let child = ThreadBuilder::new("child")
            .spawn(&kernel, |k| k.exit_current(ExitCode::new(17)))
            .expect("spawn child");
        let collected = Arc::new(AtomicUsize::new(0));
        let out = Arc::clone(&collected);
        let target = Arc::clone(&child);
        let _parent = testutil::spawn(&kernel, "parent", move |k| {
            // The child only starts once the parent has blocked in join.
            k.resume(&target);
            let code = k.join(&target);
            out.store(code.as_u32() as usize, Ordering::SeqCst);
        });

        kernel.schedule();
        assert_eq!(collected.load(Ordering::SeqCst), 17);
    }

    #[test]
    fn test_sleep_wakes_after_deadline() {
        let kernel = testutil::boot(KernelConfig::default());
        let order = Arc::new(spin::Mutex::new(Vec::new()));
        let log = Arc::clone(&order);
        let _sleeper = testutil::spawn(&kernel, "sleeper", move |k| {
            log.lock().push("sleep");
            k.sleep_ticks(5);
            log.lock().push("woke");
        });

        kernel.schedule();
        assert_eq!(*order.lock(), ["sleep"]);
        assert_eq!(kernel.this_cpu().sleeper_count(kernel.arch()), 1);

        kernel.arch().advance_ticks(4);
        kernel.timer_tick();
        assert_eq!(kernel.this_cpu().run_queue_len(kernel.arch()), 0);

        kernel.arch().advance_ticks(1);
        kernel.timer_tick();
        assert_eq!(kernel.this_cpu().run_queue_len(kernel.arch()), 1);
        kernel.schedule();
        assert_eq!(*order.lock(), ["sleep", "woke"]);
    }

    #[test]
    fn test_kernel_thread_is_reaped() {
        let kernel = testutil::boot(KernelConfig::default());
        let contexts_before = kernel.arch().live_contexts();
        let thread = testutil::spawn(&kernel, "short", |_| {});
        let id = thread.id();
        drop(thread);
        kernel.schedule();

        assert_eq!(kernel.reaper().pending(&kernel), 1);
        assert_eq!(kernel.reaper().reap_one(&kernel), Some(id));
        assert!(kernel.threads().get(id).is_none());
        assert_eq!(kernel.arch().live_contexts(), contexts_before);
    }
}
