//! Kernel tunables.

use kestrel_common::{KernelError, Result};
use log::LevelFilter;

/// Maximum number of threads that can wait on a single handle at once.
///
/// The waiter table is a fixed array; registering past this bound fails with
/// [`KernelError::OutOfWaiters`].
pub const HANDLE_MAX_WAITERS: usize = 10;

/// Default size of the kernel handle table.
pub const DEFAULT_MAX_HANDLES: usize = 500;

/// Default thread limit, idle threads included.
pub const DEFAULT_MAX_THREADS: usize = 256;

/// Default time slice, in timer ticks.
pub const DEFAULT_TIMESLICE_TICKS: u32 = 10;

/// Boot-time configuration of a [`Kernel`](crate::Kernel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of physical cores the kernel manages.
    pub cpu_count: usize,
    /// Upper bound on live threads.
    pub max_threads: usize,
    /// Number of slots in the handle table.
    pub max_handles: usize,
    /// Ticks a thread may run before the timer requests a reschedule.
    pub timeslice_ticks: u32,
    /// Level handed to the logger on installation.
    pub log_level: LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            max_threads: DEFAULT_MAX_THREADS,
            max_handles: DEFAULT_MAX_HANDLES,
            timeslice_ticks: DEFAULT_TIMESLICE_TICKS,
            log_level: LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    /// Set the number of cores.
    pub fn with_cpus(mut self, cpu_count: usize) -> Self {
        self.cpu_count = cpu_count;
        self
    }

    /// Set the thread limit.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Set the handle table size.
    pub fn with_max_handles(mut self, max_handles: usize) -> Self {
        self.max_handles = max_handles;
        self
    }

    /// Set the time slice length.
    pub fn with_timeslice(mut self, ticks: u32) -> Self {
        self.timeslice_ticks = ticks;
        self
    }

    /// Set the log level.
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Reject configurations the kernel cannot run with.
    ///
    /// Every core needs an idle thread, so the thread limit must leave room
    /// for at least one more.
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count == 0
            || self.max_threads <= self.cpu_count
            || self.max_handles == 0
            || self.max_handles > u32::MAX as usize
            || self.timeslice_ticks == 0
        {
            return Err(KernelError::InvalidConfig);
        }
        Ok(())
    }
}
