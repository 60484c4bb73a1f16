//! Types shared between the Kestrel kernel and the layers that call into it.

#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod handle;
pub mod thread;

pub use error::{KernelError, Result};
pub use handle::{HandleEvents, HandleIndex, HandleKind};
pub use thread::{ExitCode, ThreadId, ThreadState};
