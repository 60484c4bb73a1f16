//! Kestrel Hardware Abstraction Layer (HAL) traits.
//!
//! This crate defines the traits the concurrency core consumes from the
//! architecture layer: interrupt masking, per-core identity and IPIs, a tick
//! source, and context switching. A port implements all of them and gets
//! [`Arch`] for free.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;

/// Index of a physical core.
pub type CpuId = usize;

/// Code a freshly created context runs the first time it is switched to.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Trait for a serial port or similar character-based communication channel.
pub trait Serial {
    /// Writes a single byte to the serial port.
    fn write_byte(&mut self, byte: u8);
    /// Reads a single byte from the serial port, if available.
    fn read_byte(&mut self) -> Option<u8>;
}

/// Interrupt-enable state captured before masking interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "the saved state must be handed back to `restore_interrupts`"]
pub struct InterruptState {
    enabled: bool,
}

impl InterruptState {
    /// Creates a state record.
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether interrupts were accepted when the state was captured.
    pub const fn was_enabled(self) -> bool {
        self.enabled
    }
}

/// Trait for controlling the local core's interrupt-accept flag.
pub trait InterruptControl {
    /// Returns whether the local core currently accepts interrupts.
    fn interrupts_enabled(&self) -> bool;
    /// Allows the local core to accept interrupts.
    fn enable_interrupts(&self);
    /// Masks interrupts on the local core.
    fn disable_interrupts(&self);

    /// Masks interrupts and returns the state to restore later.
    fn save_and_disable(&self) -> InterruptState {
        let state = InterruptState::new(self.interrupts_enabled());
        self.disable_interrupts();
        state
    }

    /// Restores a state obtained from [`save_and_disable`](Self::save_and_disable).
    fn restore_interrupts(&self, state: InterruptState) {
        if state.was_enabled() {
            self.enable_interrupts();
        } else {
            self.disable_interrupts();
        }
    }
}

/// Inter-processor interrupt kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipi {
    /// Re-evaluate the local run queue.
    Reschedule,
    /// Stop the core; another core is panicking.
    Panic,
}

/// Trait for per-core identity and signalling.
pub trait Processor {
    /// Machine-dependent per-core block, opaque to the core logic.
    type CpuData: Default + Send + Sync;

    /// Returns the id of the executing core.
    fn cpu_id(&self) -> CpuId;
    /// Busy-wait hint issued on every failed lock attempt.
    fn relax(&self);
    /// Halts the core until the next interrupt arrives.
    fn halt(&self);
    /// Sends an inter-processor interrupt to `target`.
    fn send_ipi(&self, target: CpuId, ipi: Ipi);
}

/// Trait for a system timer.
pub trait Timer {
    /// Returns the number of ticks since the system started.
    fn current_ticks(&self) -> u64;
}

/// Error returned when a context cannot be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    /// No memory for the stack or context block.
    OutOfMemory,
}

/// Trait for creating and switching machine contexts.
pub trait ContextSwitch {
    /// Saved register state plus the stack it runs on.
    type Context: Send + Sync;

    /// Creates a context that runs `entry` on `cpu` when first switched to.
    fn new_context(&self, cpu: CpuId, entry: ThreadEntry) -> Result<Self::Context, ContextError>;

    /// Adopts the flow currently executing on `cpu` (boot or idle code) as a
    /// context that can be switched away from and back to.
    fn bootstrap_context(&self, cpu: CpuId) -> Self::Context;

    /// Saves the running state into `from` and resumes `to`. Returns when
    /// something switches back to `from`.
    ///
    /// # Safety
    ///
    /// `from` must describe the flow executing this call, `to` must not be
    /// running on any core, and both must stay alive until the switch back.
    unsafe fn switch(&self, from: &Self::Context, to: &Self::Context);
}

/// Everything the concurrency core needs from an architecture port.
pub trait Arch: InterruptControl + Processor + Timer + ContextSwitch + Send + Sync + 'static {}

impl<T> Arch for T where T: InterruptControl + Processor + Timer + ContextSwitch + Send + Sync + 'static {}
