//! Kernel stacks and the context switch.
//!
//! A context is a heap block holding the saved stack pointer, the owned
//! stack and, until the first switch into it, the entry closure. The switch
//! saves the System V callee-saved registers on the outgoing stack and pops
//! them off the incoming one.

use alloc::{boxed::Box, vec::Vec};
use core::arch::global_asm;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use kestrel_hal::{ContextError, ThreadEntry};

/// Size of every kernel thread stack.
pub const STACK_SIZE: usize = 64 * 1024;

struct Block {
    rsp: UnsafeCell<u64>,
    entry: AtomicPtr<ThreadEntry>,
    stack: Box<[u8]>,
}

/// Saved state of one kernel thread.
pub struct X86Context {
    block: Box<Block>,
}

// SAFETY: `rsp` is only written by the core switching away from this
// context and only read by the core switching into it; the scheduler never
// lets both happen at once.
unsafe impl Send for X86Context {}
// SAFETY: as above.
unsafe impl Sync for X86Context {}

impl X86Context {
    pub(super) fn new(entry: ThreadEntry) -> Result<Self, ContextError> {
        let mut stack = Vec::new();
        stack
            .try_reserve_exact(STACK_SIZE)
            .map_err(|_| ContextError::OutOfMemory)?;
        stack.resize(STACK_SIZE, 0u8);
        let mut block = Box::new(Block {
            rsp: UnsafeCell::new(0),
            entry: AtomicPtr::new(Box::into_raw(Box::new(entry))),
            stack: stack.into_boxed_slice(),
        });

        // Initial frame, top down: return address, rbp, rbx, r12, r13, r14,
        // r15. r12 carries the block so the trampoline can find the entry.
        let top = (block.stack.as_mut_ptr() as u64 + STACK_SIZE as u64) & !0xf;
        let frame = [
            0,
            0,
            0,
            &*block as *const Block as u64,
            0,
            0,
            kestrel_thread_start as usize as u64,
        ];
        let rsp = top - (frame.len() as u64) * 8;
        // SAFETY: the frame lies inside the freshly allocated stack, which is
        // 16-byte aligned at `top` and far larger than seven words.
        unsafe {
            ptr::copy_nonoverlapping(frame.as_ptr(), rsp as *mut u64, frame.len());
        }
        *block.rsp.get_mut() = rsp;
        Ok(Self { block })
    }

    pub(super) fn bootstrap() -> Self {
        Self {
            block: Box::new(Block {
                rsp: UnsafeCell::new(0),
                entry: AtomicPtr::new(ptr::null_mut()),
                stack: Box::default(),
            }),
        }
    }

    /// Save the running state into `self` and resume `to`.
    ///
    /// # Safety
    ///
    /// See [`ContextSwitch::switch`](kestrel_hal::ContextSwitch::switch).
    pub(super) unsafe fn switch(&self, to: &X86Context) {
        kestrel_switch_context(self.block.rsp.get(), *to.block.rsp.get());
    }
}

impl Drop for X86Context {
    fn drop(&mut self) {
        let entry = self.block.entry.swap(ptr::null_mut(), Ordering::AcqRel);
        if !entry.is_null() {
            // SAFETY: never started, so the trampoline did not take it.
            drop(unsafe { Box::from_raw(entry) });
        }
    }
}

extern "C" fn thread_entry(block: *const Block) -> ! {
    // SAFETY: r12 was loaded with the block address by `X86Context::new`,
    // and the block outlives the thread running on its stack.
    let entry = unsafe { (*block).entry.swap(ptr::null_mut(), Ordering::AcqRel) };
    if !entry.is_null() {
        // SAFETY: produced by `Box::into_raw` and swapped out exactly once.
        let entry = unsafe { Box::from_raw(entry) };
        entry();
    }
    panic!("kernel thread entry returned");
}

extern "C" {
    fn kestrel_thread_start() -> !;
    fn kestrel_switch_context(save_rsp: *mut u64, load_rsp: u64);
}

global_asm!(
    ".global kestrel_thread_start",
    "kestrel_thread_start:",
    "    mov rdi, r12",
    "    call {entry}",
    "    ud2",
    "",
    ".global kestrel_switch_context",
    "kestrel_switch_context:",
    "    push rbp",
    "    push rbx",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov [rdi], rsp",
    "    mov rsp, rsi",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    entry = sym thread_entry,
);
