use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use thread_local::ThreadLocal;

use crate::batch::{self, CombiningQueue, FINISHED, QSIZE};
use crate::buckets::{bucket_of, BucketDirectory, Node, DELETED};
use crate::descriptor::{Descriptor, OpKind, WriteDesc};
use crate::errors::{AccessError, WriteError, WriteFailure};
use crate::thread_info::ThreadCache;

// https://www.stroustrup.com/lock-free-vector.pdf plus the combining-funnel
// extension from Walulya et al.
//
// Every size change goes through one CAS on `desc`: a push publishes the new
// size together with a deferred slot write that any thread may complete, a
// pop publishes the shrunk size and then tombstones the abandoned slot. Under
// contention, pushes park their requests in a bounded combining queue
// instead, and a single drain pass (run cooperatively by however many threads
// show up) applies the whole batch with one descriptor swap.

/// A lock-free growable vector.
///
/// All operations are safe to call from any number of threads with no locks
/// anywhere: coordination happens through CAS on the descriptor, the funnel
/// slot, and the individual element slots. CAS losses are retried internally;
/// some thread always makes progress (lock-freedom, not wait-freedom).
///
/// Element reads clone out of shared storage, so the read-side operations
/// require `T: Clone`.
pub struct LockFreeVector<T> {
    // Elements live behind `Node`, whose alignment floor keeps a pointer
    // bit free for the deletion tag even when `T` itself has alignment 1.
    desc: Atomic<Descriptor<Node<T>>>,
    buckets: BucketDirectory<Node<T>>,
    /// The current combining funnel, if contention created one.
    batch: Atomic<CombiningQueue<Node<T>>>,
    threads: ThreadLocal<ThreadCache>,
}

/// The result of trying to park a push request in the funnel.
enum AddOutcome<'g, T> {
    /// Parked; the combiner will apply it. Carries the queue's address for
    /// the per-thread ownership hint.
    Enqueued(usize),
    /// The funnel is closed; it must be drained before anything else lands.
    QueueClosed(Shared<'g, CombiningQueue<T>>),
    /// Lost a cell or the install race; retry from the top.
    Raced,
}

impl<T: Send + Sync> LockFreeVector<T> {
    pub fn new() -> Self {
        let vec = LockFreeVector {
            desc: Atomic::new(Descriptor::clean(0)),
            buckets: BucketDirectory::new(),
            batch: Atomic::null(),
            threads: ThreadLocal::new(),
        };
        // The first bucket always exists, matching the index math's base case.
        vec.buckets.ensure(0, &epoch::pin());
        vec
    }

    pub fn with_capacity(cap: usize) -> Self {
        let vec = Self::new();
        vec.reserve(cap);
        vec
    }

    /// Pre-allocate buckets so that direct writes below `new_size` never
    /// allocate.
    pub fn reserve(&self, new_size: usize) {
        self.buckets.reserve(new_size, &epoch::pin());
    }

    /// Current logical size. A push whose deferred write has not landed yet
    /// is not counted; a pop is visible immediately after its descriptor
    /// swap.
    pub fn size(&self) -> usize {
        let guard = epoch::pin();
        loop {
            let curr = self.desc.load(Ordering::Acquire, &guard);
            // SAFETY: the current descriptor is protected by our guard.
            let d = unsafe { curr.deref() };
            if !d.queue.load(Ordering::Acquire, &guard).is_null() {
                // A combine phase owns the size; help it finish first.
                self.combine(curr, false, &guard);
                continue;
            }
            let mut size = d.size;
            if let Some(w) = &d.write_op {
                if w.is_pending() {
                    size -= 1;
                }
            }
            self.cache().set_size(size);
            return size;
        }
    }

    pub fn len(&self) -> usize {
        self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Append `value`. Always eventually succeeds.
    pub fn push_back(&self, value: T) {
        let cache = self.cache();
        let guard = epoch::pin();
        // Allocated once, installed exactly once, no matter how many retries
        // the descriptor CAS takes.
        let node = Owned::new(Node(value)).into_shared(&guard);
        let mut route_to_batch = false;
        loop {
            let curr = self.desc.load(Ordering::Acquire, &guard);
            // SAFETY: protected by our guard.
            let d = unsafe { curr.deref() };
            self.complete_write(d, &guard);
            if !d.queue.load(Ordering::Acquire, &guard).is_null() {
                self.combine(curr, false, &guard);
                continue;
            }

            let idx = d.size;
            self.buckets.ensure(bucket_of(idx), &guard);

            let q = self.batch.load(Ordering::Acquire, &guard);
            if route_to_batch || cache.owns(q.as_raw() as usize) {
                match self.add_to_batch(idx, node, &guard) {
                    AddOutcome::Enqueued(addr) => {
                        // The combiner linearizes this push at its descriptor
                        // swap; remember the queue so this thread's later
                        // operations cannot overtake it.
                        cache.set_owned(addr);
                        return;
                    }
                    AddOutcome::QueueClosed(qs) => {
                        self.attach_and_combine(curr, d, qs, &guard);
                        cache.clear_owned();
                        route_to_batch = false;
                        continue;
                    }
                    AddOutcome::Raced => continue,
                }
            }

            let slot = self
                .buckets
                .slot(idx, &guard)
                .expect("bucket was ensured above");
            let old = slot.load(Ordering::Acquire, &guard);
            let newd = Owned::new(Descriptor::pushing(
                idx + 1,
                WriteDesc::direct(idx, old, node.as_raw()),
            ));
            match self
                .desc
                .compare_exchange(curr, newd, Ordering::AcqRel, Ordering::Acquire, &guard)
            {
                Ok(installed) => {
                    // SAFETY: `curr` was just unlinked by the winning CAS.
                    unsafe { guard.defer_destroy(curr) };
                    // SAFETY: protected by our guard.
                    self.complete_write(unsafe { installed.deref() }, &guard);
                    cache.set_size(idx + 1);
                    return;
                }
                // Contention on the descriptor: route the next attempt
                // through the combining funnel.
                Err(_lost) => route_to_batch = true,
            }
        }
    }

    /// Remove and return the last element.
    pub fn pop_back(&self) -> Result<T, AccessError>
    where
        T: Clone,
    {
        let cache = self.cache();
        let guard = epoch::pin();
        loop {
            let curr = self.desc.load(Ordering::Acquire, &guard);
            // SAFETY: protected by our guard.
            let d = unsafe { curr.deref() };
            self.complete_write(d, &guard);
            if !d.queue.load(Ordering::Acquire, &guard).is_null() {
                self.combine(curr, false, &guard);
                continue;
            }

            let q = self.batch.load(Ordering::Acquire, &guard);
            // SAFETY: `q` is protected by our guard while linked.
            let live_queue = !q.is_null() && !unsafe { q.deref() }.is_done();
            if d.size == 0 && !live_queue {
                return Err(AccessError::Empty);
            }

            // Read the victim before linearizing, as the base algorithm does.
            let victim = if d.size > 0 {
                match self.buckets.slot(d.size - 1, &guard) {
                    Some(slot) => {
                        let node = slot.load(Ordering::Acquire, &guard);
                        if node.is_null() {
                            None
                        } else {
                            // SAFETY: protected by our guard.
                            Some((node, unsafe { node.deref() }.0.clone()))
                        }
                    }
                    None => None,
                }
            } else {
                None
            };

            if live_queue {
                // Parked pushes must land before the predecessor size is
                // known: pin the phase to a descriptor, close the funnel, and
                // drain it ourselves.
                let newd = Owned::new(Descriptor::combining(d.size, OpKind::Pop, d.size, q));
                if let Ok(installed) = self.desc.compare_exchange(
                    curr,
                    newd,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    &guard,
                ) {
                    // SAFETY: just unlinked by the winning CAS.
                    unsafe { guard.defer_destroy(curr) };
                    return match self.combine(installed, true, &guard) {
                        // SAFETY: protected by our guard.
                        Some(node) => Ok(unsafe { node.deref() }.0.clone()),
                        None => Err(AccessError::Empty),
                    };
                }
                continue;
            }

            let (node, value) = match victim {
                Some(v) => v,
                // Transient: the slot below `size` has a deferred write that
                // has not landed yet. Re-read and help.
                None => continue,
            };
            let newd = Owned::new(Descriptor::popped(d.size - 1));
            if self
                .desc
                .compare_exchange(curr, newd, Ordering::AcqRel, Ordering::Acquire, &guard)
                .is_ok()
            {
                // SAFETY: just unlinked by the winning CAS.
                unsafe { guard.defer_destroy(curr) };
                self.mark_node(d.size - 1, node, &guard);
                cache.set_size(d.size - 1);
                return Ok(value);
            }
        }
    }

    /// Read the last element without removing it.
    pub fn peek(&self) -> Result<T, AccessError>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        loop {
            let curr = self.desc.load(Ordering::Acquire, &guard);
            // SAFETY: protected by our guard.
            let d = unsafe { curr.deref() };
            self.complete_write(d, &guard);
            if !d.queue.load(Ordering::Acquire, &guard).is_null() {
                self.combine(curr, false, &guard);
                continue;
            }
            if d.size == 0 {
                return Err(AccessError::Empty);
            }
            if let Some(slot) = self.buckets.slot(d.size - 1, &guard) {
                let node = slot.load(Ordering::Acquire, &guard);
                if !node.is_null() {
                    // SAFETY: protected by our guard.
                    return Ok(unsafe { node.deref() }.0.clone());
                }
            }
            // The top slot's write has not landed yet; help and re-read.
        }
    }

    /// Read the element at `idx`.
    ///
    /// A populated slot past the current size (the `reserve` + `write_at`
    /// pattern) is readable; a slot whose deferred write has not landed yet
    /// is out of bounds until it does, and a tombstoned slot stays out of
    /// bounds even though it is physically allocated.
    pub fn read_at(&self, idx: usize) -> Result<T, AccessError>
    where
        T: Clone,
    {
        let cache = self.cache();
        let guard = epoch::pin();
        let slot = self
            .buckets
            .slot(idx, &guard)
            .ok_or(AccessError::OutOfBounds)?;
        let node = slot.load(Ordering::Acquire, &guard);
        if node.is_null() || node.tag() & DELETED != 0 {
            return Err(AccessError::OutOfBounds);
        }
        if idx >= cache.cached_size() {
            // Freshen the per-thread hint; the slot state already decided.
            self.in_bounds(idx, cache, &guard);
        }
        // SAFETY: protected by the guard; a replacement retires this node
        //         only after the guard drops.
        Ok(unsafe { node.deref() }.0.clone())
    }

    /// Replace the element at `idx`, detecting concurrent mutation.
    ///
    /// The slot is re-read and CASed; if another thread replaced it in
    /// between, the value is handed back with `WriteFailure::Contended` and
    /// the caller chooses whether to retry.
    pub fn write_at(&self, idx: usize, value: T) -> Result<(), WriteError<T>> {
        let guard = epoch::pin();
        let slot = match self.buckets.slot(idx, &guard) {
            Some(slot) => slot,
            None => return Err(WriteError::new(WriteFailure::OutOfBounds, value)),
        };
        let old = slot.load(Ordering::Acquire, &guard);
        if old.tag() & DELETED != 0 {
            return Err(WriteError::new(WriteFailure::OutOfBounds, value));
        }
        match slot.compare_exchange(
            old,
            Owned::new(Node(value)),
            Ordering::AcqRel,
            Ordering::Acquire,
            &guard,
        ) {
            Ok(_) => {
                retire_node(old, &guard);
                Ok(())
            }
            Err(lost) => Err(WriteError::new(
                WriteFailure::Contended,
                lost.new.into_box().0,
            )),
        }
    }

    fn cache(&self) -> &ThreadCache {
        self.threads.get_or_default()
    }

    /// Refresh the per-thread size hint from the current descriptor and
    /// answer whether `idx` is below the authoritative size.
    fn in_bounds(&self, idx: usize, cache: &ThreadCache, guard: &Guard) -> bool {
        if idx < cache.cached_size() {
            return true;
        }
        // SAFETY: protected by the guard.
        let d = unsafe { self.desc.load(Ordering::Acquire, guard).deref() };
        let mut size = d.size;
        if let Some(w) = &d.write_op {
            if w.is_pending() {
                size -= 1;
            }
        }
        cache.set_size(size);
        idx < size
    }

    /// Complete `d`'s deferred write if it is still pending. Callable by any
    /// thread, any number of times; the slot CAS makes it idempotent.
    pub(crate) fn complete_write(&self, d: &Descriptor<Node<T>>, guard: &Guard) {
        let w = match &d.write_op {
            Some(w) if w.is_pending() => w,
            _ => return,
        };
        if let Some(slot) = self.buckets.slot(w.idx, guard) {
            let old = w.old_shared();
            let new = w.new_shared();
            match slot.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => retire_node(old, guard),
                Err(_) if old.tag() & DELETED == 0 => {
                    // A combined pop may tombstone the captured node between
                    // our read and the install; the marked word is still the
                    // same superseded value, so one more attempt with it.
                    let marked = old.with_tag(old.tag() | DELETED);
                    if slot
                        .compare_exchange(marked, new, Ordering::AcqRel, Ordering::Acquire, guard)
                        .is_ok()
                    {
                        retire_node(marked, guard);
                    }
                }
                // Another thread already completed this write.
                Err(_) => {}
            }
        }
        w.finish();
    }

    /// Tombstone the slot at `idx`, but only if it still holds the node the
    /// pop read: if a newer push has already reused the index, the mark must
    /// not land on the live replacement.
    fn mark_node(&self, idx: usize, node: Shared<'_, Node<T>>, guard: &Guard) {
        if let Some(slot) = self.buckets.slot(idx, guard) {
            let _ = slot.compare_exchange(
                node.with_tag(node.tag() & !DELETED),
                node.with_tag(node.tag() | DELETED),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            );
        }
    }

    /// Try to park a push request for index hint `idx` carrying `node`.
    fn add_to_batch<'g>(
        &self,
        idx: usize,
        node: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> AddOutcome<'g, Node<T>> {
        let q = self.batch.load(Ordering::Acquire, guard);
        if q.is_null() {
            let newq = Owned::new(CombiningQueue::with_first(WriteDesc::queued(
                idx,
                node.as_raw(),
            )));
            match self.batch.compare_exchange(
                Shared::null(),
                newq,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(installed) => {
                    log::trace!("opened combining queue");
                    return AddOutcome::Enqueued(installed.as_raw() as usize);
                }
                Err(lost) => {
                    // Our queue never became visible; reclaim the request so
                    // its Drop does not free the value node we still need.
                    let mut unpublished = lost.new.into_box();
                    unpublished.extract_unpublished_first();
                    drop(unpublished);
                }
            }
        }

        let q = self.batch.load(Ordering::Acquire, guard);
        if q.is_null() {
            return AddOutcome::Raced;
        }
        // SAFETY: protected by our guard while linked.
        let queue = unsafe { q.deref() };
        if queue.is_closed() {
            return AddOutcome::QueueClosed(q);
        }
        let ticket = queue.take_ticket();
        if ticket >= QSIZE {
            queue.close();
            return AddOutcome::QueueClosed(q);
        }
        let wd = Owned::new(WriteDesc::queued(idx, node.as_raw()));
        match queue.cell(ticket).compare_exchange(
            Shared::null(),
            wd,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => AddOutcome::Enqueued(q.as_raw() as usize),
            Err(lost) => {
                // A combiner claimed the cell first; the request (but not the
                // value node) goes straight back to the allocator.
                drop(lost.new);
                AddOutcome::Raced
            }
        }
    }

    /// Volunteer to drain a closed funnel found from a clean descriptor: pin
    /// the phase with a size-neutral combining descriptor and run the drain.
    fn attach_and_combine<'g>(
        &self,
        curr: Shared<'g, Descriptor<Node<T>>>,
        d: &Descriptor<Node<T>>,
        qs: Shared<'g, CombiningQueue<Node<T>>>,
        guard: &'g Guard,
    ) {
        // SAFETY: protected by our guard.
        if unsafe { qs.deref() }.is_done() {
            // Already accounted by a finished phase; never re-attach.
            return;
        }
        let newd = Owned::new(Descriptor::combining(d.size, OpKind::None, d.size, qs));
        if let Ok(installed) =
            self.desc
                .compare_exchange(curr, newd, Ordering::AcqRel, Ordering::Acquire, guard)
        {
            // SAFETY: just unlinked by the winning CAS.
            unsafe { guard.defer_destroy(curr) };
            self.combine(installed, false, guard);
        }
    }

    /// Drain the combining phase pinned by `trigger`: apply every parked
    /// request, publish the combined size with one descriptor swap, and
    /// retire the funnel. Safe for any number of helpers to run concurrently;
    /// every step is claimed by CAS.
    ///
    /// Returns the popped node when `popper` is set and the phase ended with
    /// at least one element (the triggering pop's result).
    fn combine<'g>(
        &self,
        trigger: Shared<'g, Descriptor<Node<T>>>,
        popper: bool,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Node<T>>> {
        // SAFETY: `trigger` is protected by the caller's guard.
        let d = unsafe { trigger.deref() };
        let qs = d.queue.load(Ordering::Acquire, guard);
        if qs.is_null() {
            return None; // not a combining descriptor
        }
        // SAFETY: the queue outlives the descriptor that carries it.
        let q = unsafe { qs.deref() };
        q.close();

        if !q.is_done() {
            loop {
                let observed = q.head();
                let (index, count) = batch::unpack_head(observed);
                if index as usize >= QSIZE {
                    break;
                }
                let target = d.offset + count as usize;
                self.buckets.ensure(bucket_of(target), guard);
                let slot = self
                    .buckets
                    .slot(target, guard)
                    .expect("bucket was ensured above");
                let old = slot.load(Ordering::Acquire, guard);

                let cell = q.cell(index as usize);
                let item = cell.load(Ordering::Acquire, guard);
                if item.is_null() {
                    if item.tag() == FINISHED {
                        // Retired by another helper: skip, no element.
                        q.advance(observed, index + 1, count);
                        continue;
                    }
                    // Never filled: claim it so a straggling enqueuer fails
                    // its insert and falls back to the direct path.
                    if cell
                        .compare_exchange(
                            item,
                            Shared::null().with_tag(FINISHED),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_ok()
                    {
                        q.advance(observed, index + 1, count);
                    }
                    continue;
                }

                // SAFETY: live cells hold queue-owned write descriptors.
                let w = unsafe { item.deref() };
                if !w.is_pending() {
                    // Applied by another helper; it still counts.
                    q.advance(observed, index + 1, count + 1);
                    continue;
                }
                if q.head() == observed {
                    if old.as_raw() != w.new {
                        if slot
                            .compare_exchange(
                                old,
                                w.new_shared(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                                guard,
                            )
                            .is_ok()
                        {
                            retire_node(old, guard);
                        }
                    }
                    w.finish();
                }
                q.advance(observed, index + 1, count + 1);
            }
            q.freeze();
            log::trace!("combining queue drained");
        }

        let (_, count) = batch::unpack_head(q.head());
        let total = d.offset + count as usize;
        let new_size = match d.op {
            OpKind::Pop => total.saturating_sub(1),
            _ => total,
        };

        // A pop-kind phase must nail down its victim before the new size is
        // published: once the swap below lands, a fresh push can reuse index
        // total - 1, and reading the slot afterwards would hand the popper
        // that push's node instead of the phase's last element. Every helper
        // claims before it finalizes, so the first finalize is always
        // preceded by a claim made inside the phase.
        let mut victim = Shared::null();
        if d.op == OpKind::Pop && total > 0 {
            let node = match self.buckets.slot(total - 1, guard) {
                Some(slot) => slot.load(Ordering::Acquire, guard),
                None => Shared::null(),
            };
            victim = q.claim_popped(node.with_tag(0), guard);
            if !victim.is_null() {
                self.mark_node(total - 1, victim, guard);
            }
        }

        let fresh = Owned::new(Descriptor::clean(new_size));
        if self
            .desc
            .compare_exchange(trigger, fresh, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_ok()
        {
            // SAFETY: just unlinked by the winning CAS.
            unsafe { guard.defer_destroy(trigger) };
            batch::release(qs, guard); // the descriptor link is gone
        }
        if self
            .batch
            .compare_exchange(
                qs,
                Shared::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
        {
            batch::release(qs, guard); // the funnel slot link is gone
        }
        self.cache().set_size(new_size);

        if popper && !victim.is_null() {
            Some(victim)
        } else {
            // Either a helper, or the phase combined away to nothing.
            None
        }
    }
}

impl<T: Send + Sync> Default for LockFreeVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeVector<T> {
    fn drop(&mut self) {
        // SAFETY: &mut self means quiescence; the unprotected guard is fine.
        let guard = unsafe { epoch::unprotected() };
        let d = self.desc.load(Ordering::Relaxed, guard);
        if !d.is_null() {
            // SAFETY: the only link to the current descriptor.
            drop(unsafe { d.into_owned() });
        }
        let q = self.batch.load(Ordering::Relaxed, guard);
        if !q.is_null() {
            // A funnel that never combined still owns its unapplied values;
            // its Drop frees them.
            // SAFETY: the only remaining link to the queue.
            drop(unsafe { q.into_owned() });
        }
        // Bucket and node storage is freed by BucketDirectory's Drop.
    }
}

fn retire_node<T>(node: Shared<'_, T>, guard: &Guard) {
    if !node.is_null() {
        // SAFETY: the node was just unlinked from its slot by a winning CAS;
        //         readers still holding it are protected by their guards.
        unsafe { guard.defer_destroy(node.with_tag(0)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_test_logger() {
        use simplelog::{Config, LevelFilter, SimpleLogger};
        let _ = SimpleLogger::init(LevelFilter::Debug, Config::default());
    }

    #[test]
    fn empty_pop_and_peek_report_empty() {
        let v = LockFreeVector::<i32>::new();
        assert_eq!(v.pop_back(), Err(AccessError::Empty));
        assert_eq!(v.peek(), Err(AccessError::Empty));
        v.push_back(1);
        assert_eq!(v.pop_back(), Ok(1));
        assert_eq!(v.pop_back(), Err(AccessError::Empty));
    }

    #[test]
    fn push_read_duality() {
        let v = LockFreeVector::new();
        for i in 0..100u64 {
            v.push_back(i * 3);
        }
        assert_eq!(v.size(), 100);
        for i in 0..100u64 {
            assert_eq!(v.read_at(i as usize), Ok(i * 3));
        }
        assert_eq!(v.read_at(100), Err(AccessError::OutOfBounds));
    }

    #[test]
    fn pop_is_lifo() {
        let v = LockFreeVector::new();
        for i in 0..50 {
            v.push_back(i);
        }
        for i in (0..50).rev() {
            assert_eq!(v.pop_back(), Ok(i));
        }
        assert!(v.is_empty());
    }

    #[test]
    fn peek_does_not_remove() {
        let v = LockFreeVector::new();
        v.push_back("a");
        v.push_back("b");
        assert_eq!(v.peek(), Ok("b"));
        assert_eq!(v.peek(), Ok("b"));
        assert_eq!(v.size(), 2);
        assert_eq!(v.pop_back(), Ok("b"));
        assert_eq!(v.peek(), Ok("a"));
    }

    #[test]
    fn reserve_allows_far_writes_without_pushes() {
        let v = LockFreeVector::new();
        v.reserve(1000);
        assert!(v.write_at(999, 4242).is_ok());
        assert_eq!(v.read_at(999), Ok(4242));
        // Size is still zero: reserve allocates, it does not grow.
        assert_eq!(v.size(), 0);
    }

    #[test]
    fn with_capacity_matches_reserve() {
        let v = LockFreeVector::with_capacity(100);
        assert!(v.write_at(99, 7).is_ok());
        assert_eq!(v.read_at(99), Ok(7));
        assert_eq!(v.size(), 0);
    }

    #[test]
    fn deleted_slot_is_out_of_bounds() {
        let v = LockFreeVector::new();
        v.push_back(5);
        assert_eq!(v.pop_back(), Ok(5));
        // Index 0 is still physically allocated, but tombstoned.
        assert_eq!(v.read_at(0), Err(AccessError::OutOfBounds));
    }

    #[test]
    fn deleted_slot_is_out_of_bounds_for_align_one_elements() {
        // u8 leaves no unused pointer bits of its own, so the tombstone tag
        // must survive via the slot node's alignment floor.
        let v = LockFreeVector::new();
        v.push_back(5u8);
        assert_eq!(v.pop_back(), Ok(5));
        assert_eq!(v.read_at(0), Err(AccessError::OutOfBounds));
        // And the slot comes back to life when the index is reused.
        v.push_back(6);
        assert_eq!(v.read_at(0), Ok(6));

        let v = LockFreeVector::new();
        v.push_back(true);
        assert_eq!(v.pop_back(), Ok(true));
        assert_eq!(v.read_at(0), Err(AccessError::OutOfBounds));
    }

    #[test]
    fn write_at_rejects_unallocated_and_deleted() {
        let v = LockFreeVector::new();
        let err = v.write_at(5000, 1).unwrap_err();
        assert_eq!(err.kind, WriteFailure::OutOfBounds);
        assert_eq!(err.value, 1);

        v.push_back(2);
        v.pop_back().unwrap();
        let err = v.write_at(0, 3).unwrap_err();
        assert_eq!(err.kind, WriteFailure::OutOfBounds);
    }

    #[test]
    fn write_at_replaces_in_place() {
        let v = LockFreeVector::new();
        v.push_back(1);
        v.push_back(2);
        assert!(v.write_at(0, 10).is_ok());
        assert_eq!(v.read_at(0), Ok(10));
        assert_eq!(v.read_at(1), Ok(2));
        assert_eq!(v.size(), 2);
    }

    #[test]
    fn completing_a_pending_write_is_idempotent() {
        // Two threads race to complete the same deferred write; the slot must
        // end up holding the new value exactly once and the loser must not
        // observe an error.
        let v = LockFreeVector::new();
        v.reserve(1);
        let guard = epoch::pin();
        let node = Owned::new(Node(42)).into_shared(&guard);
        let slot = v.buckets.slot(0, &guard).unwrap();
        let old = slot.load(Ordering::Acquire, &guard);
        let d = Descriptor::pushing(1, WriteDesc::direct(0, old, node.as_raw()));

        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let guard = epoch::pin();
                    v.complete_write(&d, &guard);
                });
            }
        });

        assert_eq!(v.read_at(0), Ok(42));
    }

    #[test]
    fn combined_pop_returns_the_batch_tail() {
        // Stage a pop-kind combining phase by hand: two settled elements,
        // one parked push, then a drain triggered by the pop. The popper
        // must get the batch's last element (claimed before the size is
        // published), and the popped slot must end up tombstoned.
        let v = LockFreeVector::new();
        v.push_back(1);
        v.push_back(2);

        let guard = epoch::pin();
        let node = Owned::new(Node(3)).into_shared(&guard);
        let q = Owned::new(CombiningQueue::with_first(WriteDesc::queued(
            2,
            node.as_raw(),
        )))
        .into_shared(&guard);
        v.batch.store(q, Ordering::Release);

        let curr = v.desc.load(Ordering::Acquire, &guard);
        let d = unsafe { curr.deref() };
        let newd = Owned::new(Descriptor::combining(d.size, OpKind::Pop, d.size, q));
        let installed = match v
            .desc
            .compare_exchange(curr, newd, Ordering::AcqRel, Ordering::Acquire, &guard)
        {
            Ok(s) => s,
            Err(_) => unreachable!("no concurrent writers in this test"),
        };
        unsafe { guard.defer_destroy(curr) };

        let popped = v.combine(installed, true, &guard).unwrap();
        assert_eq!(unsafe { popped.deref() }.0, 3);
        assert_eq!(v.size(), 2);
        assert_eq!(v.read_at(2), Err(AccessError::OutOfBounds));
        assert_eq!(v.pop_back(), Ok(2));
    }

    #[test]
    fn concurrent_pushes_conserve_all_values() {
        init_test_logger();
        const T: usize = 8;
        const R: usize = 500;

        let v = LockFreeVector::new();
        std::thread::scope(|s| {
            for t in 0..T {
                let v = &v;
                s.spawn(move || {
                    for i in 0..R {
                        v.push_back((t * R + i) as u64);
                    }
                });
            }
        });

        // Pushes parked in an open funnel surface once pops drain it; the
        // multiset of drained values must match exactly what was pushed.
        let mut drained = Vec::new();
        loop {
            match v.pop_back() {
                Ok(x) => drained.push(x),
                Err(_) => break,
            }
        }
        assert_eq!(drained.len(), T * R);
        drained.sort_unstable();
        let expected: Vec<u64> = (0..(T * R) as u64).collect();
        assert_eq!(drained, expected);
        assert_eq!(v.size(), 0);
    }

    #[test]
    fn concurrent_push_pop_conserves_the_multiset() {
        init_test_logger();
        const PUSHERS: usize = 4;
        const POPPERS: usize = 4;
        const R: usize = 400;

        let v = LockFreeVector::new();
        let popped = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for t in 0..PUSHERS {
                let v = &v;
                s.spawn(move || {
                    for i in 0..R {
                        v.push_back((t * R + i) as u64);
                    }
                });
            }
            for _ in 0..POPPERS {
                let v = &v;
                let popped = &popped;
                s.spawn(move || {
                    let mut got = Vec::new();
                    while got.len() < R {
                        match v.pop_back() {
                            Ok(x) => got.push(x),
                            Err(_) => std::thread::yield_now(),
                        }
                    }
                    popped.lock().unwrap().extend(got);
                });
            }
        });

        let mut all = popped.into_inner().unwrap();
        assert_eq!(all.len(), PUSHERS * R);
        assert_eq!(v.size(), 0);
        all.sort_unstable();
        let expected: Vec<u64> = (0..(PUSHERS * R) as u64).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn concurrent_readers_see_only_committed_values() {
        const R: usize = 2000;
        let v = LockFreeVector::new();
        std::thread::scope(|s| {
            let writer = &v;
            s.spawn(move || {
                for i in 0..R {
                    writer.push_back(i as u64);
                }
            });
            for _ in 0..3 {
                let reader = &v;
                s.spawn(move || {
                    for _ in 0..R {
                        let size = reader.size();
                        if size == 0 {
                            continue;
                        }
                        let idx = size / 2;
                        // A read may transiently miss, but a value it does
                        // return must be the one pushed at that index.
                        if let Ok(val) = reader.read_at(idx) {
                            assert_eq!(val, idx as u64);
                        }
                    }
                });
            }
        });
        assert_eq!(v.size(), R);
    }

    #[test]
    fn growth_crosses_many_buckets() {
        let v = LockFreeVector::new();
        for i in 0..5000u32 {
            v.push_back(i);
        }
        assert_eq!(v.size(), 5000);
        for i in (0..5000).step_by(617) {
            assert_eq!(v.read_at(i as usize), Ok(i));
        }
        assert_eq!(v.pop_back(), Ok(4999));
    }
}
