//! x86_64 architecture support.
//!
//! Cores are addressed through their x2APIC: the APIC id doubles as the
//! kernel's cpu id, and IPIs are fixed-vector writes to the ICR. The tick
//! counter is advanced by the bootstrap core's timer interrupt.
//!
//! The embedding binary owns the IDT. Its handlers forward here through
//! [`on_timer_interrupt`] and [`on_ipi`].

pub mod context;
pub mod serial;

use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_hal::{
    ContextError, ContextSwitch, CpuId, InterruptControl, Ipi, Processor, ThreadEntry, Timer,
};
use x86_64::instructions::interrupts;
use x86_64::registers::model_specific::Msr;

use crate::Kernel;

pub use context::X86Context;
pub use serial::{init_logging, Com1};

/// Vector of the reschedule IPI.
pub const RESCHEDULE_VECTOR: u8 = 0xF0;
/// Vector of the panic IPI.
pub const PANIC_VECTOR: u8 = 0xF1;
/// Spurious interrupt vector programmed into the local APIC.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

const IA32_APIC_BASE: u32 = 0x1B;
const X2APIC_ID: u32 = 0x802;
const X2APIC_EOI: u32 = 0x80B;
const X2APIC_SVR: u32 = 0x80F;
const X2APIC_ICR: u32 = 0x830;

const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
const APIC_X2_ENABLE: u64 = 1 << 10;
const SVR_APIC_ENABLE: u64 = 1 << 8;

/// Per-core block kept by the x86_64 port.
#[derive(Debug, Default)]
pub struct CpuData {
    timer_irqs: AtomicU64,
}

impl CpuData {
    /// Timer interrupts taken on this core.
    pub fn timer_irqs(&self) -> u64 {
        self.timer_irqs.load(Ordering::Relaxed)
    }
}

/// The x86_64 port.
pub struct X86_64 {
    ticks: AtomicU64,
}

impl X86_64 {
    /// Create the port. One per machine.
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Switch the executing core's local APIC into x2APIC mode.
    ///
    /// # Safety
    ///
    /// Must run once per core, before the core calls into the kernel, on
    /// hardware that supports x2APIC.
    pub unsafe fn enable_local_apic(&self) {
        let mut base = Msr::new(IA32_APIC_BASE);
        base.write(base.read() | APIC_GLOBAL_ENABLE | APIC_X2_ENABLE);
        Msr::new(X2APIC_SVR).write(SVR_APIC_ENABLE | u64::from(SPURIOUS_VECTOR));
    }

    fn end_of_interrupt(&self) {
        // SAFETY: x2APIC is enabled on every core by `enable_local_apic`;
        // writing zero to EOI acknowledges the in-service interrupt.
        unsafe { Msr::new(X2APIC_EOI).write(0) };
    }
}

impl Default for X86_64 {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for X86_64 {
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn disable_interrupts(&self) {
        interrupts::disable();
    }
}

impl Processor for X86_64 {
    type CpuData = CpuData;

    fn cpu_id(&self) -> CpuId {
        // SAFETY: the x2APIC id register is read-only and always present
        // once x2APIC mode is on.
        unsafe { Msr::new(X2APIC_ID).read() as CpuId }
    }

    fn relax(&self) {
        core::hint::spin_loop();
    }

    fn halt(&self) {
        x86_64::instructions::hlt();
    }

    fn send_ipi(&self, target: CpuId, ipi: Ipi) {
        let vector = match ipi {
            Ipi::Reschedule => RESCHEDULE_VECTOR,
            Ipi::Panic => PANIC_VECTOR,
        };
        // Fixed delivery, physical destination, no shorthand.
        let icr = ((target as u64) << 32) | u64::from(vector);
        // SAFETY: a single ICR write sends the IPI in x2APIC mode.
        unsafe { Msr::new(X2APIC_ICR).write(icr) };
    }
}

impl Timer for X86_64 {
    fn current_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl ContextSwitch for X86_64 {
    type Context = X86Context;

    fn new_context(&self, _cpu: CpuId, entry: ThreadEntry) -> Result<X86Context, ContextError> {
        X86Context::new(entry)
    }

    fn bootstrap_context(&self, _cpu: CpuId) -> X86Context {
        X86Context::bootstrap()
    }

    unsafe fn switch(&self, from: &X86Context, to: &X86Context) {
        from.switch(to);
    }
}

/// Timer interrupt body.
pub fn on_timer_interrupt(kernel: &Kernel<X86_64>) {
    kernel.irq_enter();
    let cpu = kernel.this_cpu();
    cpu.md().timer_irqs.fetch_add(1, Ordering::Relaxed);
    if cpu.id() == 0 {
        kernel.arch().ticks.fetch_add(1, Ordering::AcqRel);
    }
    kernel.timer_tick();
    kernel.arch().end_of_interrupt();
    kernel.irq_exit();
}

/// IPI body for `vector`. Unknown vectors are acknowledged and ignored.
pub fn on_ipi(kernel: &Kernel<X86_64>, vector: u8) {
    kernel.irq_enter();
    kernel.arch().end_of_interrupt();
    match vector {
        RESCHEDULE_VECTOR => kernel.handle_ipi(Ipi::Reschedule),
        PANIC_VECTOR => kernel.handle_ipi(Ipi::Panic),
        _ => {}
    }
    kernel.irq_exit();
}
