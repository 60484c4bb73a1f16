//! Fatal error path.
//!
//! The first core to panic claims the panic slot, stops the scheduler and
//! parks every other core with a `Panic` IPI before printing its message.
//! A fault raised while that core is already panicking halts immediately,
//! and a core that panics while another one holds the slot just parks.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use kestrel_hal::{Arch, CpuId, Ipi};
use log::error;

use crate::Kernel;

const NOBODY: usize = usize::MAX;

/// Tagged "who is panicking" word.
pub struct PanicState {
    cpu: AtomicUsize,
}

impl PanicState {
    pub(crate) const fn new() -> Self {
        Self {
            cpu: AtomicUsize::new(NOBODY),
        }
    }
}

/// How a core entered the panic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicEntry {
    /// This core owns the panic.
    First,
    /// This core faulted while already panicking.
    Recursive,
    /// Another core is already panicking.
    Concurrent(CpuId),
}

impl<A: Arch> Kernel<A> {
    /// Core currently handling a panic, if any.
    pub fn panicking_cpu(&self) -> Option<CpuId> {
        match self.panic_state().cpu.load(Ordering::Acquire) {
            NOBODY => None,
            cpu => Some(cpu),
        }
    }

    /// Claim the panic slot for the executing core.
    ///
    /// Interrupts stay masked from here on. The first claimant also
    /// deactivates the scheduler and stops the other cores.
    pub fn begin_panic(&self) -> PanicEntry {
        self.arch().disable_interrupts();
        let me = self.arch().cpu_id();
        match self
            .panic_state()
            .cpu
            .compare_exchange(NOBODY, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.deactivate_scheduler();
                self.send_to_others(Ipi::Panic);
                PanicEntry::First
            }
            Err(owner) if owner == me => PanicEntry::Recursive,
            Err(owner) => PanicEntry::Concurrent(owner),
        }
    }

    /// Report a fatal error and stop the machine. Intended to be called from
    /// the `#[panic_handler]`.
    pub fn panic(&self, message: fmt::Arguments<'_>) -> ! {
        match self.begin_panic() {
            PanicEntry::First => {
                error!("KERNEL PANIC on cpu{}: {}", self.arch().cpu_id(), message);
                if let Some(thread) = self.this_cpu().try_current() {
                    error!("current thread: {:?}", thread);
                }
            }
            // The logger may be the thing that faulted.
            PanicEntry::Recursive => {}
            PanicEntry::Concurrent(owner) => {
                error!("cpu{} panicked while cpu{} panicking", self.arch().cpu_id(), owner);
            }
        }
        loop {
            self.arch().halt();
        }
    }
}
