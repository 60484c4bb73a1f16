//! Threads and their state machine.
//!
//! ```text
//!   Init --resume--> Runnable <--preempt/yield-- Running --exit--> Zombie --reap--> Terminated
//!                       ^  \_________dispatch________^  |
//!                       |                               |
//!                       +-----------wake---- Blocked <--+ wait
//! ```
//!
//! Every state change goes through [`Thread::transition`], which rejects
//! moves the machine does not allow. Queue membership is tracked separately
//! in a [`Linkage`] so a thread can never sit on two queues at once.

mod lifecycle;
mod registry;

use alloc::string::String;
use core::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
};

use bitflags::bitflags;
use kestrel_common::{ExitCode, ThreadId, ThreadState};
use kestrel_hal::{Arch, CpuId};

use crate::sync::WaitQueue;

pub use lifecycle::ThreadBuilder;
pub use registry::ThreadRegistry;

/// Longest thread name kept, in bytes.
pub const THREAD_MAX_NAME_LEN: usize = 32;

bitflags! {
    /// Scheduler bookkeeping bits of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Current on a core, or its stack is still in use by a switch.
        const ACTIVE     = 1 << 0;
        /// A reschedule was requested while the thread was running.
        const RESCHEDULE = 1 << 1;
        /// Kernel thread without an owning process.
        const KERNEL     = 1 << 2;
        /// The per-core idle thread.
        const IDLE       = 1 << 3;
    }
}

/// The one queue a thread may currently be a member of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Linkage {
    /// On no queue (running, freshly created, or an unreleased zombie).
    None = 0,
    /// A core's run queue or its cross-core inbox.
    RunQueue = 1,
    /// A wait queue or semaphore.
    WaitQueue = 2,
    /// A core's timed sleep list.
    SleepQueue = 3,
    /// The reaper's queue.
    Reaper = 4,
}

impl Linkage {
    fn from_u8(raw: u8) -> Linkage {
        match raw {
            1 => Linkage::RunQueue,
            2 => Linkage::WaitQueue,
            3 => Linkage::SleepQueue,
            4 => Linkage::Reaper,
            _ => Linkage::None,
        }
    }
}

/// The schedulable unit.
pub struct Thread<A: Arch> {
    id: ThreadId,
    name: String,
    cpu: CpuId,
    process: Option<u64>,
    state: AtomicU8,
    linkage: AtomicU8,
    flags: AtomicU32,
    exit_code: AtomicU32,
    deadline: AtomicU64,
    /// Threads joining this one.
    exited: WaitQueue<A>,
    context: A::Context,
}

impl<A: Arch> Thread<A> {
    pub(crate) fn new(
        id: ThreadId,
        name: &str,
        cpu: CpuId,
        process: Option<u64>,
        flags: ThreadFlags,
        state: ThreadState,
        context: A::Context,
    ) -> Self {
        Self {
            id,
            name: thread_name(name, flags.contains(ThreadFlags::KERNEL)),
            cpu,
            process,
            state: AtomicU8::new(state as u8),
            linkage: AtomicU8::new(Linkage::None as u8),
            flags: AtomicU32::new(flags.bits()),
            exit_code: AtomicU32::new(0),
            deadline: AtomicU64::new(0),
            exited: WaitQueue::new(),
            context,
        }
    }

    /// Unique id of the thread.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Name of the thread; kernel threads are shown as `[name]`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Core the thread is pinned to.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// Owning process, if this is not a kernel thread.
    pub fn process(&self) -> Option<u64> {
        self.process
    }

    /// Current scheduling state.
    pub fn state(&self) -> ThreadState {
        let raw = self.state.load(Ordering::Acquire);
        ThreadState::from_u8(raw).unwrap_or_else(|| panic!("thread {}: corrupt state {}", self.id, raw))
    }

    /// Queue the thread is currently linked on.
    pub fn linkage(&self) -> Linkage {
        Linkage::from_u8(self.linkage.load(Ordering::Acquire))
    }

    /// Scheduler flags.
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Whether this is a core's idle thread.
    pub fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    /// Whether this is a kernel thread.
    pub fn is_kernel(&self) -> bool {
        self.flags().contains(ThreadFlags::KERNEL)
    }

    /// Whether a core is still executing on this thread's stack.
    pub fn is_active(&self) -> bool {
        self.flags().contains(ThreadFlags::ACTIVE)
    }

    /// Exit code, once the thread has exited.
    pub fn exit_code(&self) -> Option<ExitCode> {
        if self.state().is_dead() {
            Some(ExitCode::new(self.exit_code.load(Ordering::Acquire)))
        } else {
            None
        }
    }

    /// Moves the thread to `next`.
    ///
    /// # Panics
    ///
    /// Panics if the state machine does not allow the move.
    pub(crate) fn transition(&self, next: ThreadState) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ThreadState::from_u8(current)
                .unwrap_or_else(|| panic!("thread {}: corrupt state {}", self.id, current));
            if !from.can_become(next) {
                panic!("thread {}: illegal transition {:?} -> {:?}", self.id, from, next);
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Marks the thread as a member of `queue`.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already linked somewhere.
    pub(crate) fn link(&self, queue: Linkage) {
        if let Err(actual) = self.linkage.compare_exchange(
            Linkage::None as u8,
            queue as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "thread {} enqueued on {:?} while already linked on {:?}",
                self.id,
                queue,
                Linkage::from_u8(actual)
            );
        }
    }

    /// Clears membership of `queue`.
    ///
    /// # Panics
    ///
    /// Panics if the thread was not linked on `queue`.
    pub(crate) fn unlink(&self, queue: Linkage) {
        if let Err(actual) = self.linkage.compare_exchange(
            queue as u8,
            Linkage::None as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "thread {} removed from {:?} but linked on {:?}",
                self.id,
                queue,
                Linkage::from_u8(actual)
            );
        }
    }

    pub(crate) fn set_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags` and returns whether any of them were set.
    pub(crate) fn take_flags(&self, flags: ThreadFlags) -> bool {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel) & flags.bits() != 0
    }

    pub(crate) fn set_exit_code(&self, code: ExitCode) {
        self.exit_code.store(code.as_u32(), Ordering::Release);
    }

    pub(crate) fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }

    pub(crate) fn set_deadline(&self, tick: u64) {
        self.deadline.store(tick, Ordering::Release);
    }

    pub(crate) fn exited(&self) -> &WaitQueue<A> {
        &self.exited
    }

    pub(crate) fn context(&self) -> &A::Context {
        &self.context
    }
}

impl<A: Arch> fmt::Debug for Thread<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cpu", &self.cpu)
            .field("state", &self.state())
            .field("linkage", &self.linkage())
            .field("flags", &self.flags())
            .finish()
    }
}

fn thread_name(name: &str, kernel: bool) -> String {
    let mut out = String::new();
    if kernel {
        out.push('[');
    }
    for ch in name.chars() {
        if out.len() + ch.len_utf8() > THREAD_MAX_NAME_LEN {
            break;
        }
        out.push(ch);
    }
    if kernel {
        out.push(']');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{HostedArch, HostedContext};
    use kestrel_hal::ContextSwitch;

    fn detached_thread(flags: ThreadFlags) -> Thread<HostedArch> {
        let arch = HostedArch::new();
        let context: HostedContext = arch.bootstrap_context(0);
        Thread::new(ThreadId::new(7), "worker", 0, None, flags, ThreadState::Init, context)
    }

    #[test]
    fn test_kernel_threads_are_bracketed() {
        let thread = detached_thread(ThreadFlags::KERNEL);
        assert_eq!(thread.name(), "[worker]");
        assert_eq!(thread_name("a-very-long-name-that-will-not-fit-at-all", false).len(), 32);
    }

    #[test]
    fn test_state_walk() {
        let thread = detached_thread(ThreadFlags::empty());
        thread.transition(ThreadState::Runnable);
        thread.transition(ThreadState::Running);
        thread.transition(ThreadState::Blocked);
        thread.transition(ThreadState::Runnable);
        thread.transition(ThreadState::Running);
        assert_eq!(thread.exit_code(), None);
        thread.set_exit_code(ExitCode::new(3));
        thread.transition(ThreadState::Zombie);
        assert_eq!(thread.exit_code(), Some(ExitCode::new(3)));
        thread.transition(ThreadState::Terminated);
        assert_eq!(thread.state(), ThreadState::Terminated);
    }

    #[test]
    #[should_panic(expected = "illegal transition Init -> Running")]
    fn test_dispatch_requires_runnable() {
        let thread = detached_thread(ThreadFlags::empty());
        thread.transition(ThreadState::Running);
    }

    #[test]
    #[should_panic(expected = "while already linked on RunQueue")]
    fn test_double_enqueue_panics() {
        let thread = detached_thread(ThreadFlags::empty());
        thread.link(Linkage::RunQueue);
        thread.link(Linkage::WaitQueue);
    }

    #[test]
    fn test_link_unlink() {
        let thread = detached_thread(ThreadFlags::empty());
        thread.link(Linkage::Reaper);
        assert_eq!(thread.linkage(), Linkage::Reaper);
        thread.unlink(Linkage::Reaper);
        assert_eq!(thread.linkage(), Linkage::None);
    }

    #[test]
    fn test_take_flags() {
        let thread = detached_thread(ThreadFlags::KERNEL);
        thread.set_flags(ThreadFlags::RESCHEDULE);
        assert!(thread.take_flags(ThreadFlags::RESCHEDULE));
        assert!(!thread.take_flags(ThreadFlags::RESCHEDULE));
        assert!(thread.is_kernel());
    }
}
