use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_epoch::{Atomic, Shared};

use crate::batch::CombiningQueue;

/// What kind of size-changing operation published a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    None,
    Push,
    Pop,
}

/// A deferred single-slot mutation that any thread may complete.
///
/// `old` is the exact slot word (pointer and deletion tag) captured when the
/// mutation was prepared; completion CASes the slot from that word to `new`.
/// A failed CAS there is not an error, it means another thread already
/// completed the write. `pending` transitions true -> false at most once; the
/// transition is racy but idempotent.
///
/// Comparing against the captured word, not the value behind it, is what
/// keeps interned or otherwise aliased values from confusing the protocol.
pub(crate) struct WriteDesc<T> {
    pub(crate) idx: usize,
    old: *const T,
    old_tag: usize,
    pub(crate) new: *const T,
    pub(crate) pending: AtomicBool,
}

// SAFETY: the raw pointers are either null or point at heap nodes kept alive
//         by the epoch collector; `&WriteDesc` only ever hands them out as
//         `Shared`s that are dereferenced under a guard.
unsafe impl<T: Send + Sync> Send for WriteDesc<T> {}
unsafe impl<T: Send + Sync> Sync for WriteDesc<T> {}

impl<T> WriteDesc<T> {
    /// A write prepared on the direct push path, with the slot word it must
    /// supersede.
    pub(crate) fn direct(idx: usize, old: Shared<'_, T>, new: *const T) -> Self {
        WriteDesc {
            idx,
            old: old.as_raw(),
            old_tag: old.tag(),
            new,
            pending: AtomicBool::new(true),
        }
    }

    /// A write destined for the combining queue. The combiner picks the
    /// target index and reads the slot word fresh at drain time, so no old
    /// word is captured here.
    pub(crate) fn queued(idx: usize, new: *const T) -> Self {
        WriteDesc {
            idx,
            old: std::ptr::null(),
            old_tag: 0,
            new,
            pending: AtomicBool::new(true),
        }
    }

    pub(crate) fn old_shared<'g>(&self) -> Shared<'g, T> {
        Shared::from(self.old).with_tag(self.old_tag)
    }

    pub(crate) fn new_shared<'g>(&self) -> Shared<'g, T> {
        Shared::from(self.new)
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn finish(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

/// An immutable snapshot of the vector's size plus any in-flight work.
///
/// Exactly one descriptor is current at any instant; replacing it by CAS is
/// the linearization point of every size-changing operation. Old descriptors
/// stay readable by helpers until the epoch collector reclaims them.
pub(crate) struct Descriptor<T> {
    pub(crate) size: usize,
    pub(crate) write_op: Option<WriteDesc<T>>,
    pub(crate) op: OpKind,
    /// Authoritative size at the start of a combining phase.
    pub(crate) offset: usize,
    /// Non-null while a combining phase must finish before `size` counts.
    /// Written once at construction; `Atomic` is only used as a typed,
    /// shareable nullable pointer cell here.
    pub(crate) queue: Atomic<CombiningQueue<T>>,
}

impl<T> Descriptor<T> {
    /// A descriptor with no in-flight work.
    pub(crate) fn clean(size: usize) -> Self {
        Descriptor {
            size,
            write_op: None,
            op: OpKind::None,
            offset: 0,
            queue: Atomic::null(),
        }
    }

    pub(crate) fn pushing(size: usize, write_op: WriteDesc<T>) -> Self {
        Descriptor {
            size,
            write_op: Some(write_op),
            op: OpKind::Push,
            offset: 0,
            queue: Atomic::null(),
        }
    }

    pub(crate) fn popped(size: usize) -> Self {
        Descriptor {
            size,
            write_op: None,
            op: OpKind::Pop,
            offset: 0,
            queue: Atomic::null(),
        }
    }

    /// A descriptor that pins a combining phase: `size` is not authoritative
    /// until `combine` replaces this descriptor.
    pub(crate) fn combining(
        size: usize,
        op: OpKind,
        offset: usize,
        queue: Shared<'_, CombiningQueue<T>>,
    ) -> Self {
        let cell = Atomic::null();
        cell.store(queue, Ordering::Relaxed);
        Descriptor {
            size,
            write_op: None,
            op,
            offset,
            queue: cell,
        }
    }
}
