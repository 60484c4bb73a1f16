//! System-wide error types for Kestrel.

use core::fmt;

/// Errors reported to callers of the concurrency core.
///
/// Only recoverable conditions appear here. Broken invariants (double
/// unlock, double enqueue, illegal state transitions) panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KernelError {
    /// A handle's waiter table is full
    OutOfWaiters,
    /// The thread limit has been reached
    OutOfThreads,
    /// The handle table is full
    OutOfHandles,
    /// Stack or context allocation failed
    OutOfMemory,
    /// Index does not name a live handle
    BadHandle,
    /// Handle exists but holds a different kind of object
    BadType,
    /// CPU id out of range or core not online
    BadCpu,
    /// Kernel configuration rejected
    InvalidConfig,
    /// Operation needs a terminated thread
    NotZombie,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfWaiters => write!(f, "out of handle waiter slots"),
            KernelError::OutOfThreads => write!(f, "out of threads"),
            KernelError::OutOfHandles => write!(f, "out of handles"),
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::BadHandle => write!(f, "bad handle"),
            KernelError::BadType => write!(f, "handle has wrong type"),
            KernelError::BadCpu => write!(f, "bad cpu"),
            KernelError::InvalidConfig => write!(f, "invalid kernel configuration"),
            KernelError::NotZombie => write!(f, "thread has not exited"),
        }
    }
}

impl KernelError {
    /// Stable numeric code, as delivered in handle result words and
    /// syscall returns.
    pub const fn code(self) -> u32 {
        match self {
            KernelError::OutOfWaiters => 1,
            KernelError::OutOfThreads => 2,
            KernelError::OutOfHandles => 3,
            KernelError::OutOfMemory => 4,
            KernelError::BadHandle => 5,
            KernelError::BadType => 6,
            KernelError::BadCpu => 7,
            KernelError::InvalidConfig => 8,
            KernelError::NotZombie => 9,
        }
    }
}

/// Result alias used across the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(KernelError::OutOfWaiters.to_string(), "out of handle waiter slots");
        assert_eq!(KernelError::BadHandle.to_string(), "bad handle");
    }

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            KernelError::OutOfWaiters,
            KernelError::OutOfThreads,
            KernelError::OutOfHandles,
            KernelError::OutOfMemory,
            KernelError::BadHandle,
            KernelError::BadType,
            KernelError::BadCpu,
            KernelError::InvalidConfig,
            KernelError::NotZombie,
        ];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(a.code(), 0);
            assert!(all[i + 1..].iter().all(|b| b.code() != a.code()));
        }
    }
}
