//! Host-side test infrastructure.
//!
//! [`HostedArch`] implements the HAL on top of std so the scheduler and the
//! blocking primitives can be exercised by ordinary `cargo test`.
//!
//! Every kernel thread gets its own host thread. A context switch hands a
//! baton from the outgoing thread to the incoming one and parks the outgoing
//! host thread until it gets the baton back, so exactly one host thread runs
//! per emulated core at any time and interleavings are deterministic.
//!
//! Interrupts never fire on their own; the interrupt-enable flag and the
//! core id are host thread-locals, and tests drive the timer, IRQ hooks and
//! IPIs by hand.
//!
//! A panic on a kernel thread poisons every baton so the test's own thread
//! fails with the same message instead of hanging.

use std::{
    any::Any,
    cell::Cell,
    format,
    panic::{self, AssertUnwindSafe},
    string::{String, ToString},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, PoisonError, Weak,
    },
    thread,
    vec::Vec,
};

use kestrel_hal::{
    ContextError, ContextSwitch, CpuId, InterruptControl, Ipi, Processor, Serial, ThreadEntry,
    Timer,
};

use crate::thread::{Thread, ThreadBuilder};
use crate::{Kernel, KernelConfig};

std::thread_local! {
    static CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
    static IRQ_ENABLED: Cell<bool> = const { Cell::new(true) };
}

#[derive(Default)]
struct BatonState {
    turn: bool,
    retired: bool,
    poisoned: Option<String>,
}

/// Permission for one host thread to run.
#[derive(Default)]
struct Baton {
    state: Mutex<BatonState>,
    changed: Condvar,
}

impl Baton {
    fn holding(turn: bool) -> Arc<Self> {
        let baton = Arc::new(Baton::default());
        baton.lock().turn = turn;
        baton
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatonState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grant(&self) {
        self.lock().turn = true;
        self.changed.notify_all();
    }

    fn release(&self) {
        self.lock().turn = false;
    }

    fn retire(&self) {
        self.lock().retired = true;
        self.changed.notify_all();
    }

    fn poison(&self, message: &str) {
        let mut state = self.lock();
        if state.poisoned.is_none() {
            state.poisoned = Some(message.to_string());
        }
        drop(state);
        self.changed.notify_all();
    }

    /// Park until granted. Returns false if the owning context was dropped.
    fn wait_turn(&self) -> bool {
        let mut state = self.lock();
        loop {
            if let Some(message) = state.poisoned.clone() {
                drop(state);
                panic!("kernel thread panicked: {}", message);
            }
            if state.turn {
                return true;
            }
            if state.retired {
                return false;
            }
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Default)]
struct Shared {
    batons: Mutex<Vec<Weak<Baton>>>,
    live_contexts: AtomicUsize,
    relax_calls: AtomicUsize,
    ipis: Mutex<Vec<(CpuId, Ipi)>>,
    ticks: AtomicU64,
}

impl Shared {
    fn track(&self, baton: &Arc<Baton>) {
        let mut batons = self.batons.lock().unwrap_or_else(PoisonError::into_inner);
        batons.retain(|b| b.strong_count() > 0);
        batons.push(Arc::downgrade(baton));
    }

    fn poison_all(&self, message: &str) {
        let batons = self.batons.lock().unwrap_or_else(PoisonError::into_inner);
        for baton in batons.iter().filter_map(Weak::upgrade) {
            baton.poison(message);
        }
    }
}

/// Execution context of a hosted kernel thread.
pub struct HostedContext {
    baton: Arc<Baton>,
    shared: Arc<Shared>,
    spawned: bool,
}

impl Drop for HostedContext {
    fn drop(&mut self) {
        self.baton.retire();
        if self.spawned {
            self.shared.live_contexts.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// The HAL, emulated on host threads.
#[derive(Clone, Default)]
pub struct HostedArch {
    shared: Arc<Shared>,
}

impl HostedArch {
    /// Create an emulated machine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the calling host thread execute as core `cpu`.
    pub fn bind_cpu(&self, cpu: CpuId) {
        CPU.with(|c| c.set(Some(cpu)));
    }

    /// Advance the tick counter.
    pub fn advance_ticks(&self, ticks: u64) {
        self.shared.ticks.fetch_add(ticks, Ordering::SeqCst);
    }

    /// Drain the log of IPIs sent so far.
    pub fn take_ipis(&self) -> Vec<(CpuId, Ipi)> {
        let mut ipis = self.shared.ipis.lock().unwrap_or_else(PoisonError::into_inner);
        core::mem::take(&mut *ipis)
    }

    /// Number of times any core paused in `relax`.
    pub fn relax_calls(&self) -> usize {
        self.shared.relax_calls.load(Ordering::SeqCst)
    }

    /// Number of contexts created by `new_context` and not yet dropped.
    pub fn live_contexts(&self) -> usize {
        self.shared.live_contexts.load(Ordering::SeqCst)
    }
}

impl InterruptControl for HostedArch {
    fn interrupts_enabled(&self) -> bool {
        IRQ_ENABLED.with(Cell::get)
    }

    fn enable_interrupts(&self) {
        IRQ_ENABLED.with(|f| f.set(true));
    }

    fn disable_interrupts(&self) {
        IRQ_ENABLED.with(|f| f.set(false));
    }
}

impl Processor for HostedArch {
    type CpuData = ();

    fn cpu_id(&self) -> CpuId {
        match CPU.with(Cell::get) {
            Some(cpu) => cpu,
            None => panic!("host thread is not bound to an emulated cpu"),
        }
    }

    fn relax(&self) {
        self.shared.relax_calls.fetch_add(1, Ordering::SeqCst);
        thread::yield_now();
    }

    fn halt(&self) {
        thread::yield_now();
    }

    fn send_ipi(&self, target: CpuId, ipi: Ipi) {
        self.shared
            .ipis
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target, ipi));
    }
}

impl Timer for HostedArch {
    fn current_ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::SeqCst)
    }
}

impl ContextSwitch for HostedArch {
    type Context = HostedContext;

    fn new_context(&self, cpu: CpuId, entry: ThreadEntry) -> Result<HostedContext, ContextError> {
        let baton = Baton::holding(false);
        self.shared.track(&baton);
        let parked = Arc::clone(&baton);
        let shared = Arc::clone(&self.shared);

        thread::Builder::new()
            .name(format!("kthread-cpu{}", cpu))
            .spawn(move || {
                CPU.with(|c| c.set(Some(cpu)));
                if !parked.wait_turn() {
                    return;
                }
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                    shared.poison_all(&panic_message(payload.as_ref()));
                }
            })
            .map_err(|_| ContextError::OutOfMemory)?;

        self.shared.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(HostedContext {
            baton,
            shared: Arc::clone(&self.shared),
            spawned: true,
        })
    }

    fn bootstrap_context(&self, cpu: CpuId) -> HostedContext {
        self.bind_cpu(cpu);
        let baton = Baton::holding(true);
        self.shared.track(&baton);
        HostedContext {
            baton,
            shared: Arc::clone(&self.shared),
            spawned: false,
        }
    }

    unsafe fn switch(&self, from: &HostedContext, to: &HostedContext) {
        from.baton.release();
        to.baton.grant();
        if !from.baton.wait_turn() {
            // A reaped zombie: this host thread never runs kernel code again.
            loop {
                thread::park();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}

/// Serial port that records everything written to it.
#[derive(Clone, Default)]
pub struct CaptureSerial {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSerial {
    /// Everything written so far.
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Serial for CaptureSerial {
    fn write_byte(&mut self, byte: u8) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(byte);
    }

    fn read_byte(&mut self) -> Option<u8> {
        None
    }
}

/// Build a kernel on a fresh emulated machine, bring up cpu0 on the calling
/// host thread and activate the scheduler.
pub fn boot(config: KernelConfig) -> Arc<Kernel<HostedArch>> {
    let arch = HostedArch::new();
    arch.bind_cpu(0);
    let kernel = Arc::new(Kernel::new(arch, config).expect("valid test config"));
    kernel.bootstrap_cpu(0).expect("bootstrap cpu0");
    kernel.activate_scheduler();
    kernel
}

/// Create and resume a kernel thread on the calling core.
pub fn spawn<F>(kernel: &Arc<Kernel<HostedArch>>, name: &str, body: F) -> Arc<Thread<HostedArch>>
where
    F: FnOnce(&Arc<Kernel<HostedArch>>) + Send + 'static,
{
    let thread = ThreadBuilder::new(name)
        .spawn(kernel, body)
        .expect("spawn test thread");
    kernel.resume(&thread);
    thread
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag_is_per_host_thread() {
        let arch = HostedArch::new();
        arch.disable_interrupts();
        let other = arch.clone();
        let enabled = thread::spawn(move || other.interrupts_enabled())
            .join()
            .expect("host thread");
        assert!(enabled);
        assert!(!arch.interrupts_enabled());
        arch.enable_interrupts();
    }

    #[test]
    fn test_capture_serial() {
        let mut serial = CaptureSerial::default();
        let reader = serial.clone();
        for byte in b"ok" {
            serial.write_byte(*byte);
        }
        assert_eq!(reader.contents(), "ok");
        assert_eq!(serial.read_byte(), None);
    }

    #[test]
    #[should_panic(expected = "kernel thread panicked: boom")]
    fn test_kernel_thread_panic_reaches_test_thread() {
        let kernel = boot(KernelConfig::default());
        let _t = spawn(&kernel, "boom", |_| panic!("boom"));
        kernel.schedule();
    }
}
