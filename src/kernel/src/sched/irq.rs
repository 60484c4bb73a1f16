//! Interrupt entry and exit hooks, the timer tick and IPI handling.
//!
//! Architecture interrupt stubs bracket every handler with
//! [`Kernel::irq_enter`] and [`Kernel::irq_exit`]. Reschedule requests raised
//! inside a handler are only acted on when the outermost handler exits.

use kestrel_common::ThreadState;
use kestrel_hal::{Arch, Ipi};
use log::error;

use crate::thread::{Linkage, ThreadFlags};
use crate::Kernel;

impl<A: Arch> Kernel<A> {
    /// Record entry into an interrupt handler on this core.
    pub fn irq_enter(&self) {
        self.this_cpu().enter_irq();
    }

    /// Record exit from an interrupt handler and, at the outermost level,
    /// honour a pending reschedule request.
    pub fn irq_exit(&self) {
        let state = self.arch().save_and_disable();
        let cpu = self.this_cpu();
        if cpu.exit_irq() == 0 && self.is_scheduler_active() {
            let requested = cpu
                .current(self.arch())
                .map(|t| t.flags().contains(ThreadFlags::RESCHEDULE))
                .unwrap_or(false);
            if requested {
                self.schedule_irqs_off();
            }
        }
        self.arch().restore_interrupts(state);
    }

    /// Periodic timer work: wake expired sleepers and charge the running
    /// thread's time slice.
    pub fn timer_tick(&self) {
        let state = self.arch().save_and_disable();
        let cpu = self.this_cpu();
        let now = self.arch().current_ticks();
        {
            let mut sleepers = cpu.sleepers().lock_on(self.arch());
            let due = sleepers.partition_point(|t| t.deadline() <= now);
            for thread in sleepers.drain(..due) {
                thread.unlink(Linkage::SleepQueue);
                self.wake(thread);
            }
        }

        if cpu.charge_tick() && cpu.has_work(self.arch()) {
            if let Some(current) = cpu.current(self.arch()) {
                if current.state() == ThreadState::Running {
                    current.set_flags(ThreadFlags::RESCHEDULE);
                }
            }
        }
        self.arch().restore_interrupts(state);
    }

    /// Handle an inter-processor interrupt delivered to this core.
    pub fn handle_ipi(&self, ipi: Ipi) {
        match ipi {
            Ipi::Reschedule => {
                if let Some(current) = self.this_cpu().current(self.arch()) {
                    current.set_flags(ThreadFlags::RESCHEDULE);
                }
            }
            Ipi::Panic => {
                self.arch().disable_interrupts();
                error!("cpu{} stopped by panic on another cpu", self.arch().cpu_id());
                loop {
                    self.arch().halt();
                }
            }
        }
    }
}
