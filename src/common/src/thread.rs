//! Thread identity and scheduling state as seen from outside the kernel.

use core::fmt;

/// A unique identifier for a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadId(u64);

impl ThreadId {
    /// Wraps a raw id.
    pub const fn new(raw: u64) -> Self {
        ThreadId(raw)
    }

    /// Returns the raw id.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exit status retained by a zombie thread for whoever waits on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExitCode(u32);

impl ExitCode {
    /// Thread called exit itself.
    pub const TERM_SYSCALL: u32 = 0;
    /// Thread was terminated by a signal or fault.
    pub const TERM_SIGNAL: u32 = 1;

    /// Wraps a raw exit status.
    pub const fn new(raw: u32) -> Self {
        ExitCode(raw)
    }

    /// Builds an exit status from a termination reason and a 24-bit value.
    pub const fn from_parts(reason: u32, value: u32) -> Self {
        ExitCode((reason << 24) | (value & 0x00ff_ffff))
    }

    /// Termination reason, one of the `TERM_*` constants.
    pub const fn reason(self) -> u32 {
        self.0 >> 24
    }

    /// Low 24 bits: the value passed to exit or the signal number.
    pub const fn value(self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    /// Returns the raw status word.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Scheduling state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ThreadState {
    /// Allocated, never resumed.
    Init = 0,
    /// Waiting for a core in a run queue.
    Runnable = 1,
    /// Executing on a core.
    Running = 2,
    /// Parked on a wait queue, handle slot or sleep list.
    Blocked = 3,
    /// Exited; exit code retained until reaped.
    Zombie = 4,
    /// Reaped; no longer schedulable.
    Terminated = 5,
}

impl ThreadState {
    /// Decodes the representation stored in an atomic.
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ThreadState::Init),
            1 => Some(ThreadState::Runnable),
            2 => Some(ThreadState::Running),
            3 => Some(ThreadState::Blocked),
            4 => Some(ThreadState::Zombie),
            5 => Some(ThreadState::Terminated),
            _ => None,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `Running -> Runnable` is preemption or a voluntary yield.
    pub const fn can_become(self, next: ThreadState) -> bool {
        matches!(
            (self, next),
            (ThreadState::Init, ThreadState::Runnable)
                | (ThreadState::Runnable, ThreadState::Running)
                | (ThreadState::Running, ThreadState::Runnable)
                | (ThreadState::Running, ThreadState::Blocked)
                | (ThreadState::Blocked, ThreadState::Runnable)
                | (ThreadState::Running, ThreadState::Zombie)
                | (ThreadState::Zombie, ThreadState::Terminated)
        )
    }

    /// True once the thread has exited.
    pub const fn is_dead(self) -> bool {
        matches!(self, ThreadState::Zombie | ThreadState::Terminated)
    }
}
