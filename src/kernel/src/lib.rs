//! Kestrel Kernel
//!
//! The SMP concurrency core of the Kestrel kernel: spinlocks, wait queues,
//! the thread state machine, per-core round-robin scheduling, the handle
//! event layer and the reaper.
//!
//! # Architecture
//!
//! Everything hangs off a [`Kernel`] value generic over an [`Arch`] port:
//! - `sync`: spinlocks, wait queues, semaphores and the sleepable mutex
//! - `thread`: thread records, the registry and the lifecycle entry points
//! - `sched`: per-core state, dispatch, interrupt and IPI hooks
//! - `handle`: the handle table and its waiter slots
//! - `reaper`: deferred destruction of exited threads
//! - `arch`: the bare-metal x86_64 port
//!
//! # Safety
//!
//! This is a `#![no_std]` kernel. All unsafe code is documented with safety
//! invariants explaining why the usage is correct.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;
pub mod config;
pub mod handle;
pub mod logger;
pub mod panic;
pub mod reaper;
pub mod sched;
pub mod sync;
pub mod thread;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::KernelConfig;

use kestrel_common::Result;
use kestrel_hal::{Arch, CpuId};
use log::info;

use handle::HandleTable;
use panic::PanicState;
use reaper::Reaper;
use sched::{PerCpu, Scheduler};
use thread::ThreadRegistry;

/// One kernel instance: the architecture port plus every piece of shared
/// concurrency state.
///
/// Bare-metal ports keep a single instance in a static; tests build as many
/// isolated instances as they like.
pub struct Kernel<A: Arch> {
    arch: A,
    config: KernelConfig,
    scheduler: Scheduler<A>,
    threads: ThreadRegistry<A>,
    handles: HandleTable<A>,
    reaper: Reaper<A>,
    panic: PanicState,
}

impl<A: Arch> Kernel<A> {
    /// Build a kernel for `arch`. No core is online until it calls
    /// [`bootstrap_cpu`](Self::bootstrap_cpu).
    pub fn new(arch: A, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "kestrel: {} cpus, {} threads, {} handles",
            config.cpu_count, config.max_threads, config.max_handles
        );
        Ok(Self {
            scheduler: Scheduler::new(&config),
            threads: ThreadRegistry::new(config.max_threads),
            handles: HandleTable::new(config.max_handles),
            reaper: Reaper::new(),
            panic: PanicState::new(),
            arch,
            config,
        })
    }

    /// The architecture port.
    pub fn arch(&self) -> &A {
        &self.arch
    }

    /// Configuration the kernel was built with.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Scheduler state.
    pub fn scheduler(&self) -> &Scheduler<A> {
        &self.scheduler
    }

    /// Every live thread.
    pub fn threads(&self) -> &ThreadRegistry<A> {
        &self.threads
    }

    /// The handle table.
    pub fn handles(&self) -> &HandleTable<A> {
        &self.handles
    }

    /// The zombie queue.
    pub fn reaper(&self) -> &Reaper<A> {
        &self.reaper
    }

    /// Block of core `id`.
    pub fn cpu(&self, id: CpuId) -> Option<&PerCpu<A>> {
        self.scheduler.cpu(id)
    }

    pub(crate) fn panic_state(&self) -> &PanicState {
        &self.panic
    }
}
