//! Kernel handles and event waiting.
//!
//! A handle names a kernel object (an open file or a thread) and carries a
//! fixed table of waiter slots. A thread waiting for events on a handle owns
//! one slot, armed with the events it cares about, and sleeps on that slot's
//! semaphore. Signalling an event moves every matching armed slot to
//! signalled, records the event and a result word, and posts the slot's
//! semaphore exactly once.
//!
//! ```text
//!   Free --register--> Armed --signal--> Signalled --consume--> Free
//!                        ^                   |
//!                        +----re-arm---------+   (event did not match)
//! ```

mod table;

use alloc::sync::Arc;
use core::fmt;

use kestrel_common::{ExitCode, HandleEvents, HandleIndex, HandleKind, KernelError, Result, ThreadId};
use kestrel_hal::Arch;
use log::{trace, warn};

use crate::config::HANDLE_MAX_WAITERS;
use crate::sync::{Semaphore, Spinlock};
use crate::thread::Thread;
use crate::Kernel;

pub use table::HandleTable;

/// An open file as seen by the handle layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfsFile {
    /// Inode number.
    pub inode: u64,
    /// Current byte offset.
    pub offset: u64,
    /// Open flags.
    pub flags: u32,
}

/// Object a handle refers to.
pub enum HandleObject<A: Arch> {
    /// An open file.
    File(VfsFile),
    /// A thread; waiting for [`HandleEvents::EXIT`] on it joins the thread.
    Thread(Arc<Thread<A>>),
}

impl<A: Arch> HandleObject<A> {
    /// Type tag of the object.
    pub fn kind(&self) -> HandleKind {
        match self {
            HandleObject::File(_) => HandleKind::File,
            HandleObject::Thread(_) => HandleKind::Thread,
        }
    }
}

impl<A: Arch> Clone for HandleObject<A> {
    fn clone(&self) -> Self {
        match self {
            HandleObject::File(file) => HandleObject::File(*file),
            HandleObject::Thread(thread) => HandleObject::Thread(Arc::clone(thread)),
        }
    }
}

impl<A: Arch> fmt::Debug for HandleObject<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleObject::File(file) => f.debug_tuple("File").field(file).finish(),
            HandleObject::Thread(thread) => f.debug_tuple("Thread").field(&thread.id()).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaiterSlot {
    Free,
    Armed {
        thread: ThreadId,
        mask: HandleEvents,
    },
    Signalled {
        thread: ThreadId,
        mask: HandleEvents,
        events: HandleEvents,
        result: u32,
    },
}

impl WaiterSlot {
    fn owner(&self) -> Option<ThreadId> {
        match *self {
            WaiterSlot::Free => None,
            WaiterSlot::Armed { thread, .. } | WaiterSlot::Signalled { thread, .. } => Some(thread),
        }
    }
}

struct HandleState<A: Arch> {
    object: HandleObject<A>,
    torn_down: bool,
    slots: [WaiterSlot; HANDLE_MAX_WAITERS],
}

impl<A: Arch> HandleState<A> {
    fn slot_of(&self, thread: ThreadId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.owner() == Some(thread))
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| *slot == WaiterSlot::Free)
    }
}

/// A kernel object reference with a fixed-size waiter table.
pub struct Handle<A: Arch> {
    index: HandleIndex,
    kind: HandleKind,
    owner: Option<ThreadId>,
    /// Id of the referenced thread, for thread handles.
    thread: Option<ThreadId>,
    state: Spinlock<HandleState<A>>,
    wakeups: [Semaphore<A>; HANDLE_MAX_WAITERS],
}

impl<A: Arch> Handle<A> {
    pub(crate) fn new(index: HandleIndex, object: HandleObject<A>, owner: Option<ThreadId>) -> Self {
        let thread = match &object {
            HandleObject::Thread(t) => Some(t.id()),
            HandleObject::File(_) => None,
        };
        Self {
            index,
            kind: object.kind(),
            owner,
            thread,
            state: Spinlock::new(HandleState {
                object,
                torn_down: false,
                slots: [WaiterSlot::Free; HANDLE_MAX_WAITERS],
            }),
            wakeups: core::array::from_fn(|_| Semaphore::new(0)),
        }
    }

    /// Slot of this handle in the table.
    pub fn index(&self) -> HandleIndex {
        self.index
    }

    /// Type of the referenced object.
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Thread that owns the handle, if any.
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// Copy of the referenced object.
    pub fn object(&self, kernel: &Kernel<A>) -> HandleObject<A> {
        self.state.lock_irqsave(kernel.arch()).object.clone()
    }

    /// Run `f` on the open file behind the handle.
    pub fn with_file<R>(&self, kernel: &Kernel<A>, f: impl FnOnce(&mut VfsFile) -> R) -> Result<R> {
        let mut state = self.state.lock_irqsave(kernel.arch());
        match &mut state.object {
            HandleObject::File(file) => Ok(f(file)),
            HandleObject::Thread(_) => Err(KernelError::BadType),
        }
    }

    /// Whether the handle has been freed from its table.
    pub fn is_torn_down(&self, kernel: &Kernel<A>) -> bool {
        self.state.lock_irqsave(kernel.arch()).torn_down
    }

    /// Number of occupied waiter slots.
    pub fn waiter_count(&self, kernel: &Kernel<A>) -> usize {
        self.state
            .lock_irqsave(kernel.arch())
            .slots
            .iter()
            .filter(|slot| **slot != WaiterSlot::Free)
            .count()
    }

    /// Claim a waiter slot for `thread`, armed for `mask`.
    ///
    /// A thread that already owns a slot gets the same one back, re-armed.
    pub fn register(&self, kernel: &Kernel<A>, thread: ThreadId, mask: HandleEvents) -> Result<usize> {
        let mut state = self.state.lock_irqsave(kernel.arch());
        self.arm(kernel, &mut state, thread, mask)
    }

    fn arm(
        &self,
        kernel: &Kernel<A>,
        state: &mut HandleState<A>,
        thread: ThreadId,
        mask: HandleEvents,
    ) -> Result<usize> {
        if state.torn_down {
            return Err(KernelError::BadHandle);
        }
        let slot = match state.slot_of(thread) {
            Some(slot) => {
                if let WaiterSlot::Signalled { .. } = state.slots[slot] {
                    // Drop the stale event together with its wakeup.
                    self.wakeups[slot].try_wait(kernel);
                }
                slot
            }
            None => match state.free_slot() {
                Some(slot) => slot,
                None => {
                    warn!("handle {}: all {} waiter slots busy", self.index, HANDLE_MAX_WAITERS);
                    return Err(KernelError::OutOfWaiters);
                }
            },
        };
        state.slots[slot] = WaiterSlot::Armed { thread, mask };
        Ok(slot)
    }

    /// Block the calling thread until an event in `mask` is signalled.
    ///
    /// Returns the signalled events and the result word that came with them.
    /// An empty mask accepts any event. Waiting for [`HandleEvents::EXIT`] on
    /// a thread that has already exited returns at once with its exit code.
    pub fn wait(&self, kernel: &Kernel<A>, mask: HandleEvents) -> Result<(HandleEvents, u32)> {
        let me = kernel.current_thread().id();
        let slot = {
            let mut state = self.state.lock_irqsave(kernel.arch());
            if state.torn_down {
                return Err(KernelError::BadHandle);
            }

            if let HandleObject::Thread(target) = &state.object {
                if mask.matches(HandleEvents::EXIT) {
                    if let Some(code) = target.exit_code() {
                        self.release_slot(kernel, &mut state, me);
                        return Ok((HandleEvents::EXIT, code.as_u32()));
                    }
                }
            }

            if let Some(slot) = state.slot_of(me) {
                if let WaiterSlot::Signalled { events, result, .. } = state.slots[slot] {
                    if mask.matches(events) {
                        state.slots[slot] = WaiterSlot::Free;
                        self.wakeups[slot].try_wait(kernel);
                        return Ok((events, result));
                    }
                }
            }
            self.arm(kernel, &mut state, me, mask)?
        };

        trace!("thread {} waits on handle {} slot {}", me, self.index, slot);
        self.wakeups[slot].wait(kernel);

        let mut state = self.state.lock_irqsave(kernel.arch());
        match state.slots[slot] {
            WaiterSlot::Signalled { thread, events, result, .. } if thread == me => {
                state.slots[slot] = WaiterSlot::Free;
                Ok((events, result))
            }
            other => panic!("handle {}: woke on slot {} in state {:?}", self.index, slot, other),
        }
    }

    /// Signal `events` with `result` to every waiter armed for them.
    ///
    /// Each armed slot is woken at most once; further events before the
    /// waiter runs are merged into the recorded set. Returns how many waiters
    /// were woken. Safe to call from interrupt context.
    pub fn signal(&self, kernel: &Kernel<A>, events: HandleEvents, result: u32) -> usize {
        let mut state = self.state.lock_irqsave(kernel.arch());
        let mut woken = 0;
        for (slot, waiter) in state.slots.iter_mut().enumerate() {
            match *waiter {
                WaiterSlot::Armed { thread, mask } if mask.matches(events) => {
                    *waiter = WaiterSlot::Signalled {
                        thread,
                        mask,
                        events,
                        result,
                    };
                    self.wakeups[slot].signal(kernel);
                    woken += 1;
                }
                WaiterSlot::Signalled {
                    thread,
                    mask,
                    events: seen,
                    ..
                } if mask.matches(events) => {
                    *waiter = WaiterSlot::Signalled {
                        thread,
                        mask,
                        events: seen | events,
                        result,
                    };
                }
                _ => {}
            }
        }
        trace!("handle {}: {:?} woke {}", self.index, events, woken);
        woken
    }

    /// Mark the handle freed and fail every armed waiter with
    /// [`HandleEvents::ERROR`].
    pub(crate) fn tear_down(&self, kernel: &Kernel<A>) {
        let mut state = self.state.lock_irqsave(kernel.arch());
        state.torn_down = true;
        for (slot, waiter) in state.slots.iter_mut().enumerate() {
            if let WaiterSlot::Armed { thread, mask } = *waiter {
                *waiter = WaiterSlot::Signalled {
                    thread,
                    mask,
                    events: HandleEvents::ERROR,
                    result: KernelError::BadHandle.code(),
                };
                self.wakeups[slot].signal(kernel);
            }
        }
    }

    pub(crate) fn signal_exit(&self, kernel: &Kernel<A>, code: ExitCode) -> usize {
        self.signal(kernel, HandleEvents::EXIT, code.as_u32())
    }

    fn release_slot(&self, kernel: &Kernel<A>, state: &mut HandleState<A>, thread: ThreadId) {
        if let Some(slot) = state.slot_of(thread) {
            if let WaiterSlot::Signalled { .. } = state.slots[slot] {
                self.wakeups[slot].try_wait(kernel);
            }
            state.slots[slot] = WaiterSlot::Free;
        }
    }

    /// Whether the handle refers to thread `id`.
    pub fn refers_to(&self, id: ThreadId) -> bool {
        self.thread == Some(id)
    }
}

impl<A: Arch> fmt::Debug for Handle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<A: Arch> Kernel<A> {
    /// Wait on the handle at `index` for events in `mask`.
    pub fn handle_wait(&self, index: HandleIndex, mask: HandleEvents) -> Result<(HandleEvents, u32)> {
        let handle = self.handles().lookup(self, index, None)?;
        handle.wait(self, mask)
    }

    /// Signal `events` on the handle at `index`. Returns the number of
    /// waiters woken.
    pub fn handle_signal(&self, index: HandleIndex, events: HandleEvents, result: u32) -> Result<usize> {
        let handle = self.handles().lookup(self, index, None)?;
        Ok(handle.signal(self, events, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, HostedArch};
    use crate::thread::ThreadBuilder;
    use crate::KernelConfig;
    use kestrel_common::ThreadState;
    use kestrel_hal::InterruptControl;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::vec::Vec;

    fn file_handle() -> Handle<HostedArch> {
        let file = VfsFile {
            inode: 3,
            offset: 0,
            flags: 0,
        };
        Handle::new(HandleIndex::new(0), HandleObject::File(file), None)
    }

    #[test]
    fn test_register_until_full() {
        let kernel = testutil::boot(KernelConfig::default());
        let handle = file_handle();
        for id in 1..=HANDLE_MAX_WAITERS as u64 {
            handle
                .register(&kernel, ThreadId::new(id), HandleEvents::READ)
                .expect("slot");
        }
        assert_eq!(handle.waiter_count(&kernel), HANDLE_MAX_WAITERS);
        assert_eq!(
            handle.register(&kernel, ThreadId::new(99), HandleEvents::READ),
            Err(KernelError::OutOfWaiters)
        );
        // A thread that already holds a slot is re-armed in place.
        assert_eq!(handle.register(&kernel, ThreadId::new(1), HandleEvents::WRITE), Ok(0));
    }

    #[test]
    fn test_signal_wakes_armed_slot_once() {
        let kernel = testutil::boot(KernelConfig::default());
        let handle = file_handle();
        let slot = handle
            .register(&kernel, ThreadId::new(5), HandleEvents::READ)
            .expect("slot");

        assert_eq!(handle.signal(&kernel, HandleEvents::WRITE, 0), 0);
        assert_eq!(handle.signal(&kernel, HandleEvents::READ, 10), 1);
        assert_eq!(handle.signal(&kernel, HandleEvents::READ, 11), 0);
        assert_eq!(handle.wakeups[slot].available(&kernel), 1);
        assert_eq!(
            handle.state.lock_irqsave(kernel.arch()).slots[slot],
            WaiterSlot::Signalled {
                thread: ThreadId::new(5),
                mask: HandleEvents::READ,
                events: HandleEvents::READ,
                result: 11,
            }
        );
    }

    #[test]
    fn test_wait_blocks_until_signal() {
        let kernel = testutil::boot(KernelConfig::default());
        let handle = Arc::new(file_handle());
        let got = Arc::new(spin::Mutex::new(None));
        let (h, g) = (Arc::clone(&handle), Arc::clone(&got));
        let waiter = testutil::spawn(&kernel, "reader", move |k| {
            *g.lock() = Some(h.wait(k, HandleEvents::READ | HandleEvents::ERROR));
        });

        kernel.schedule();
        assert_eq!(waiter.state(), ThreadState::Blocked);
        assert_eq!(handle.waiter_count(&kernel), 1);

        assert_eq!(handle.signal(&kernel, HandleEvents::READ, 128), 1);
        kernel.schedule();
        assert_eq!(*got.lock(), Some(Ok((HandleEvents::READ, 128))));
        assert_eq!(handle.waiter_count(&kernel), 0);
    }

    #[test]
    fn test_signal_before_wait_consumed_on_fast_path() {
        let kernel = testutil::boot(KernelConfig::default());
        let handle = Arc::new(file_handle());
        let results = Arc::new(spin::Mutex::new(Vec::new()));
        let (h, r) = (Arc::clone(&handle), Arc::clone(&results));
        let _t = testutil::spawn(&kernel, "poller", move |k| {
            let me = k.current_thread().id();
            h.register(k, me, HandleEvents::WRITE).expect("slot");
            // The event lands before this thread gets around to waiting.
            h.signal(k, HandleEvents::WRITE, 1);
            r.lock().push(h.wait(k, HandleEvents::WRITE));
        });
        kernel.schedule();
        assert_eq!(*results.lock(), [Ok((HandleEvents::WRITE, 1))]);
        assert_eq!(handle.waiter_count(&kernel), 0);
        assert!(handle.wakeups.iter().all(|s| s.available(&kernel) == 0));
    }

    #[test]
    fn test_wait_on_exited_thread_returns_code() {
        let kernel = testutil::boot(KernelConfig::default());
        let child = ThreadBuilder::new("child")
            .process(1)
            .spawn(&kernel, |k| k.exit_current(ExitCode::new(4)))
            .expect("spawn");
        let (index, _) = kernel
            .handles()
            .alloc(&kernel, HandleObject::Thread(Arc::clone(&child)), None, HandleIndex::new(0))
            .expect("handle");

        let code = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&code);
        let target = Arc::clone(&child);
        let _parent = testutil::spawn(&kernel, "parent", move |k| {
            k.resume(&target);
            // Blocks: the child has not run yet.
            let (events, value) = k.handle_wait(index, HandleEvents::EXIT).expect("wait");
            assert_eq!(events, HandleEvents::EXIT);
            c.store(value, Ordering::SeqCst);
            // Second wait hits the exited-thread fast path.
            let again = k.handle_wait(index, HandleEvents::EXIT).expect("wait again");
            assert_eq!(again, (HandleEvents::EXIT, 4));
        });
        kernel.schedule();
        assert_eq!(code.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_free_fails_waiters() {
        let kernel = testutil::boot(KernelConfig::default());
        let file = VfsFile {
            inode: 9,
            offset: 0,
            flags: 0,
        };
        let (index, _) = kernel
            .handles()
            .alloc(&kernel, HandleObject::File(file), None, HandleIndex::new(0))
            .expect("handle");
        let got = Arc::new(spin::Mutex::new(None));
        let g = Arc::clone(&got);
        let _t = testutil::spawn(&kernel, "stuck", move |k| {
            *g.lock() = Some(k.handle_wait(index, HandleEvents::READ));
        });
        kernel.schedule();

        kernel.handles().free(&kernel, index).expect("free");
        kernel.schedule();
        assert_eq!(
            *got.lock(),
            Some(Ok((HandleEvents::ERROR, KernelError::BadHandle.code())))
        );
        assert_eq!(kernel.handle_wait(index, HandleEvents::READ), Err(KernelError::BadHandle));
    }

    fn alloc_file(kernel: &Arc<Kernel<HostedArch>>, inode: u64) -> HandleIndex {
        let file = VfsFile {
            inode,
            offset: 0,
            flags: 0,
        };
        let (index, _) = kernel
            .handles()
            .alloc(kernel, HandleObject::File(file), None, HandleIndex::new(0))
            .expect("handle");
        index
    }

    #[test]
    fn test_blocked_waiters_fill_the_table() {
        let kernel = testutil::boot(KernelConfig::default());
        let index = alloc_file(&kernel, 11);
        let results = Arc::new(spin::Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for n in 0..=HANDLE_MAX_WAITERS {
            let r = Arc::clone(&results);
            waiters.push(testutil::spawn(&kernel, "waiter", move |k| {
                let got = k.handle_wait(index, HandleEvents::READ);
                r.lock().push((n, got));
            }));
        }
        kernel.schedule();

        // Only the last one found no free slot; the rest are asleep.
        assert_eq!(
            *results.lock(),
            [(HANDLE_MAX_WAITERS, Err(KernelError::OutOfWaiters))]
        );
        let blocked = waiters
            .iter()
            .filter(|t| t.state() == ThreadState::Blocked)
            .count();
        assert_eq!(blocked, HANDLE_MAX_WAITERS);
        let handle = kernel.handles().lookup(&kernel, index, None).expect("lookup");
        assert_eq!(handle.waiter_count(&kernel), HANDLE_MAX_WAITERS);
    }

    #[test]
    fn test_one_signal_wakes_every_waiter_once() {
        let kernel = testutil::boot(KernelConfig::default());
        let index = alloc_file(&kernel, 12);
        let results = Arc::new(spin::Mutex::new(Vec::new()));
        for n in 0..HANDLE_MAX_WAITERS {
            let r = Arc::clone(&results);
            testutil::spawn(&kernel, "waiter", move |k| {
                let got = k.handle_wait(index, HandleEvents::READ | HandleEvents::WRITE);
                r.lock().push((n, got));
            });
        }
        kernel.schedule();
        assert!(results.lock().is_empty());

        assert_eq!(
            kernel.handle_signal(index, HandleEvents::WRITE, 42),
            Ok(HANDLE_MAX_WAITERS)
        );
        // A second event before anyone ran wakes nobody new.
        assert_eq!(kernel.handle_signal(index, HandleEvents::READ, 43), Ok(0));
        kernel.schedule();

        let mut results = results.lock().clone();
        results.sort_by_key(|(n, _)| *n);
        let expected: Vec<_> = (0..HANDLE_MAX_WAITERS)
            .map(|n| (n, Ok((HandleEvents::WRITE | HandleEvents::READ, 43))))
            .collect();
        assert_eq!(results, expected);

        let handle = kernel.handles().lookup(&kernel, index, None).expect("lookup");
        assert_eq!(handle.waiter_count(&kernel), 0);
        assert!(handle.wakeups.iter().all(|s| s.available(&kernel) == 0));
        assert_eq!(kernel.handle_signal(index, HandleEvents::WRITE, 44), Ok(0));
    }

    #[test]
    fn test_signal_from_interrupt_context() {
        let kernel = testutil::boot(KernelConfig::default());
        let index = alloc_file(&kernel, 13);
        let got = Arc::new(spin::Mutex::new(None));
        let g = Arc::clone(&got);
        let _t = testutil::spawn(&kernel, "reader", move |k| {
            *g.lock() = Some(k.handle_wait(index, HandleEvents::READ));
        });
        kernel.schedule();

        kernel.irq_enter();
        assert_eq!(kernel.handle_signal(index, HandleEvents::READ, 1), Ok(1));
        kernel.irq_exit();
        assert!(kernel.arch().interrupts_enabled());
        // irq_exit switched to the reader, since idle was asked to reschedule.
        assert_eq!(*got.lock(), Some(Ok((HandleEvents::READ, 1))));
    }

    #[test]
    fn test_with_file_updates_offset() {
        let kernel = testutil::boot(KernelConfig::default());
        let handle = file_handle();
        handle.with_file(&kernel, |f| f.offset += 512).expect("file");
        match handle.object(&kernel) {
            HandleObject::File(file) => assert_eq!(file.offset, 512),
            other => panic!("unexpected object {:?}", other),
        }
    }
}
