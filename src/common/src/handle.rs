//! Handle identifiers and event masks.

use bitflags::bitflags;
use core::fmt;

/// Slot number of a handle in the kernel handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HandleIndex(u32);

impl HandleIndex {
    /// Wraps a raw table index.
    pub const fn new(raw: u32) -> Self {
        HandleIndex(raw)
    }

    /// Returns the table slot.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of kernel object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HandleKind {
    /// An open file from the VFS layer.
    File,
    /// A thread, waitable for its exit.
    Thread,
}

bitflags! {
    /// Events a handle waiter can be woken for.
    ///
    /// An empty mask waits for any event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HandleEvents: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const ERROR = 1 << 2;
        const EXIT  = 1 << 3; // thread handles: the thread terminated
    }
}

impl HandleEvents {
    /// Whether a waiter armed with `self` cares about `event`.
    pub fn matches(self, event: HandleEvents) -> bool {
        self.is_empty() || self.intersects(event)
    }
}
