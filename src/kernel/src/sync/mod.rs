//! Synchronization primitives.
//!
//! # Primitives
//!
//! - [`RawSpinlock`] / [`Spinlock<T>`]: busy-wait locks, optionally masking
//!   local interrupts while held
//! - [`WaitQueue`]: FIFO of blocked threads with signal / broadcast
//! - [`Semaphore`]: counting semaphore with latched units
//! - [`Mutex<T, A>`]: sleeping mutex with owner tracking
//!
//! Only spinlocks may be used from interrupt context, and only through
//! [`Spinlock::lock_irqsave`] when the data is shared with a handler. The
//! other primitives block and must be used from a non-idle thread.

mod mutex;
mod semaphore;
mod spinlock;
mod waitqueue;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard, SpinlockIrqGuard};
pub use waitqueue::WaitQueue;
