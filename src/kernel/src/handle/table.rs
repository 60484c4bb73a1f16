//! Fixed-size table of handles.

use alloc::{sync::Arc, vec::Vec};

use kestrel_common::{ExitCode, HandleIndex, HandleKind, KernelError, Result, ThreadId};
use kestrel_hal::Arch;
use log::{debug, warn};

use super::{Handle, HandleObject};
use crate::sync::Spinlock;
use crate::Kernel;

/// Arena of handles addressed by index.
///
/// Freeing an index only drops the table's reference; threads still waiting
/// on the handle keep it alive until they have been woken.
///
/// The slot array is reached from thread exit and from interrupt context
/// through [`Kernel::handle_signal`], so it is only ever locked with local
/// interrupts masked.
pub struct HandleTable<A: Arch> {
    capacity: usize,
    slots: Spinlock<Vec<Option<Arc<Handle<A>>>>>,
}

impl<A: Arch> HandleTable<A> {
    /// Create a table with `capacity` empty slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Spinlock::new((0..capacity).map(|_| None).collect()),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live handles.
    pub fn len(&self, kernel: &Kernel<A>) -> usize {
        self.slots
            .lock_irqsave(kernel.arch())
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Whether no handle is live.
    pub fn is_empty(&self, kernel: &Kernel<A>) -> bool {
        self.len(kernel) == 0
    }

    /// Place `object` in the lowest free slot at or above `index_from`.
    pub fn alloc(
        &self,
        kernel: &Kernel<A>,
        object: HandleObject<A>,
        owner: Option<ThreadId>,
        index_from: HandleIndex,
    ) -> Result<(HandleIndex, Arc<Handle<A>>)> {
        let mut slots = self.slots.lock_irqsave(kernel.arch());
        let start = index_from.as_usize();
        let Some(free) = slots.iter().skip(start).position(Option::is_none) else {
            warn!("handle table full ({} slots)", slots.len());
            return Err(KernelError::OutOfHandles);
        };
        let at = start + free;
        let index = HandleIndex::new(at as u32);
        let handle = Arc::new(Handle::new(index, object, owner));
        slots[at] = Some(Arc::clone(&handle));
        debug!("handle {} allocated ({:?})", index, handle.kind());
        Ok((index, handle))
    }

    /// Fetch the handle at `index`, optionally insisting on its kind.
    pub fn lookup(
        &self,
        kernel: &Kernel<A>,
        index: HandleIndex,
        kind: Option<HandleKind>,
    ) -> Result<Arc<Handle<A>>> {
        let handle = self
            .slots
            .lock_irqsave(kernel.arch())
            .get(index.as_usize())
            .and_then(|slot| slot.clone())
            .ok_or(KernelError::BadHandle)?;
        match kind {
            Some(kind) if kind != handle.kind() => Err(KernelError::BadType),
            _ => Ok(handle),
        }
    }

    /// Release the slot at `index` and fail the handle's pending waiters.
    pub fn free(&self, kernel: &Kernel<A>, index: HandleIndex) -> Result<()> {
        let handle = self
            .slots
            .lock_irqsave(kernel.arch())
            .get_mut(index.as_usize())
            .and_then(Option::take)
            .ok_or(KernelError::BadHandle)?;
        handle.tear_down(kernel);
        debug!("handle {} freed", index);
        Ok(())
    }

    /// Duplicate the handle at `index` into a new slot owned by `owner`.
    ///
    /// The copy refers to the same object but has its own waiter table.
    pub fn clone_handle(
        &self,
        kernel: &Kernel<A>,
        index: HandleIndex,
        owner: Option<ThreadId>,
    ) -> Result<HandleIndex> {
        let original = self.lookup(kernel, index, None)?;
        let (copy, _) = self.alloc(kernel, original.object(kernel), owner, HandleIndex::new(0))?;
        Ok(copy)
    }

    /// Indices of every handle owned by `owner`.
    pub fn owned_by(&self, kernel: &Kernel<A>, owner: ThreadId) -> Vec<HandleIndex> {
        self.slots
            .lock_irqsave(kernel.arch())
            .iter()
            .flatten()
            .filter(|handle| handle.owner() == Some(owner))
            .map(|handle| handle.index())
            .collect()
    }

    /// Free every handle owned by `owner`. Returns how many were freed.
    pub fn free_owned_by(&self, kernel: &Kernel<A>, owner: ThreadId) -> usize {
        self.owned_by(kernel, owner)
            .into_iter()
            .filter(|index| self.free(kernel, *index).is_ok())
            .count()
    }

    /// Signal [`HandleEvents::EXIT`](kestrel_common::HandleEvents::EXIT) on
    /// every handle that refers to thread `id`.
    pub(crate) fn signal_thread_exit(
        &self,
        kernel: &Kernel<A>,
        id: ThreadId,
        code: ExitCode,
    ) -> usize {
        let handles: Vec<Arc<Handle<A>>> = self
            .slots
            .lock_irqsave(kernel.arch())
            .iter()
            .flatten()
            .filter(|handle| handle.refers_to(id))
            .cloned()
            .collect();
        handles
            .iter()
            .map(|handle| handle.signal_exit(kernel, code))
            .sum()
    }
}
