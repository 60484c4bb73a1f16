//! Per-core scheduler state.

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use kestrel_hal::{Arch, CpuId, Processor};
use spin::Once;

use crate::sync::Spinlock;
use crate::thread::Thread;

/// State owned by one core.
///
/// Every field except `inbox` is only written by the owning core, with
/// interrupts masked. Other cores hand threads over through `inbox`. The
/// public readers mask interrupts themselves, since a reschedule or wakeup
/// interrupt on the reading core takes the same locks.
pub struct PerCpu<A: Arch> {
    id: CpuId,
    online: AtomicBool,
    idle: Once<Arc<Thread<A>>>,
    pub(crate) current: Spinlock<Option<Arc<Thread<A>>>>,
    /// Thread switched away from, released by the next thread to run.
    pub(crate) switched_from: Spinlock<Option<Arc<Thread<A>>>>,
    pub(crate) run_queue: Spinlock<VecDeque<Arc<Thread<A>>>>,
    pub(crate) inbox: ArrayQueue<Arc<Thread<A>>>,
    /// Timed sleepers, ordered by deadline.
    sleepers: Spinlock<Vec<Arc<Thread<A>>>>,
    nested_irq: AtomicUsize,
    slice_left: AtomicU32,
    switches: AtomicU64,
    md: <A as Processor>::CpuData,
}

impl<A: Arch> PerCpu<A> {
    pub(crate) fn new(id: CpuId, inbox_capacity: usize, timeslice: u32) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            idle: Once::new(),
            current: Spinlock::new(None),
            switched_from: Spinlock::new(None),
            run_queue: Spinlock::new(VecDeque::new()),
            inbox: ArrayQueue::new(inbox_capacity),
            sleepers: Spinlock::new(Vec::new()),
            nested_irq: AtomicUsize::new(0),
            slice_left: AtomicU32::new(timeslice),
            switches: AtomicU64::new(0),
            md: Default::default(),
        }
    }

    /// Index of this core.
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Whether the core has been bootstrapped.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn set_online(&self) {
        self.online.store(true, Ordering::Release);
    }

    /// The core's idle thread, once bootstrapped.
    pub fn idle(&self) -> Option<&Arc<Thread<A>>> {
        self.idle.get()
    }

    pub(crate) fn install_idle(&self, thread: Arc<Thread<A>>) -> &Arc<Thread<A>> {
        self.idle.call_once(|| thread)
    }

    /// Thread currently running on this core.
    pub fn current(&self, irq: &A) -> Option<Arc<Thread<A>>> {
        self.current.lock_irqsave(irq).clone()
    }

    /// Thread currently running on this core, unless its slot is locked.
    ///
    /// For the panic path, which may have interrupted the scheduler while it
    /// held the slot.
    pub fn try_current(&self) -> Option<Arc<Thread<A>>> {
        self.current.try_lock().and_then(|current| current.clone())
    }

    /// Number of threads waiting in the run queue.
    pub fn run_queue_len(&self, irq: &A) -> usize {
        self.run_queue.lock_irqsave(irq).len()
    }

    /// Number of threads handed over by other cores and not yet drained.
    pub fn inbox_len(&self) -> usize {
        self.inbox.len()
    }

    /// Whether there is anything to run besides idle.
    pub fn has_work(&self, irq: &A) -> bool {
        !self.inbox.is_empty() || !self.run_queue.lock_irqsave(irq).is_empty()
    }

    pub(crate) fn sleepers(&self) -> &Spinlock<Vec<Arc<Thread<A>>>> {
        &self.sleepers
    }

    /// Number of threads in a timed sleep.
    pub fn sleeper_count(&self, irq: &A) -> usize {
        self.sleepers.lock_irqsave(irq).len()
    }

    /// Interrupt nesting depth.
    pub fn nested_irq(&self) -> usize {
        self.nested_irq.load(Ordering::Acquire)
    }

    /// Whether the core is executing an interrupt handler.
    pub fn in_interrupt(&self) -> bool {
        self.nested_irq() > 0
    }

    pub(crate) fn enter_irq(&self) -> usize {
        self.nested_irq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn exit_irq(&self) -> usize {
        let previous = self.nested_irq.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "cpu{}: interrupt exit without matching entry", self.id);
        previous - 1
    }

    /// Charge one tick to the running thread; true once the slice is used up.
    pub(crate) fn charge_tick(&self) -> bool {
        let left = self.slice_left.load(Ordering::Relaxed);
        if left <= 1 {
            self.slice_left.store(0, Ordering::Relaxed);
            true
        } else {
            self.slice_left.store(left - 1, Ordering::Relaxed);
            false
        }
    }

    pub(crate) fn reset_slice(&self, ticks: u32) {
        self.slice_left.store(ticks, Ordering::Relaxed);
    }

    pub(crate) fn count_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of context switches performed on this core.
    pub fn context_switches(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Machine-dependent per-core block.
    pub fn md(&self) -> &<A as Processor>::CpuData {
        &self.md
    }
}
