use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Owned};

// https://www.stroustrup.com/lock-free-vector.pdf
//
// Storage is a directory of geometrically growing buckets: bucket k holds
// FBS << k slots, so the directory never moves existing elements and a
// 32-entry directory covers far more than a 32-bit size. Mapping a logical
// index to (bucket, slot) is pure bit math on i + FBS: the highest set bit
// picks the bucket, the remaining bits are the offset inside it.

/// First bucket size. Any power of two works.
pub(crate) const FBS: usize = 8;
const FBS_LOG: u32 = FBS.trailing_zeros();
/// Number of directory entries.
pub(crate) const DIR_SIZE: usize = 32;

/// Pointer tag marking a slot as logically deleted by a `pop_back`.
pub(crate) const DELETED: usize = 1;

/// Heap cell behind every slot pointer.
///
/// The alignment floor guarantees a free low pointer bit for the deletion
/// tag no matter what `T`'s own alignment is: tags on an `Atomic<V>` are
/// truncated to the bits `align_of::<V>()` leaves unused, so storing `T`
/// directly would silently drop the mark for alignment-1 element types
/// like `u8`.
#[repr(align(2))]
pub(crate) struct Node<T>(pub(crate) T);

#[inline]
fn highest_bit(n: usize) -> u32 {
    usize::BITS - 1 - n.leading_zeros()
}

/// Bucket holding logical index `i`.
#[inline]
pub(crate) fn bucket_of(i: usize) -> usize {
    (highest_bit(i + FBS) - FBS_LOG) as usize
}

/// Offset of logical index `i` inside its bucket: `pos` with its highest set
/// bit cleared (that bit already selected the bucket).
#[inline]
pub(crate) fn slot_of(i: usize) -> usize {
    let pos = i + FBS;
    pos ^ (1 << highest_bit(pos))
}

/// One lazily-allocated storage segment. Slots start null ("never written")
/// and hold tagged pointers to heap value nodes afterwards.
pub(crate) struct Bucket<T> {
    slots: Box<[Atomic<T>]>,
}

impl<T> Bucket<T> {
    fn new(capacity: usize) -> Self {
        Bucket {
            slots: (0..capacity).map(|_| Atomic::null()).collect(),
        }
    }

    #[inline]
    pub(crate) fn slot(&self, offset: usize) -> &Atomic<T> {
        &self.slots[offset]
    }
}

/// The fixed directory of buckets. Entries are write-once: the first
/// successful CAS installs a bucket, racing losers just drop their allocation.
pub(crate) struct BucketDirectory<T> {
    entries: [Atomic<Bucket<T>>; DIR_SIZE],
}

impl<T> BucketDirectory<T> {
    pub(crate) fn new() -> Self {
        BucketDirectory {
            entries: std::array::from_fn(|_| Atomic::null()),
        }
    }

    /// Allocate bucket `k` if absent. Losing the install race has no effect
    /// beyond a wasted allocation.
    pub(crate) fn ensure(&self, k: usize, guard: &Guard) {
        let entry = &self.entries[k];
        if !entry.load(Ordering::Acquire, guard).is_null() {
            return;
        }
        let bucket = Owned::new(Bucket::new(FBS << k));
        match entry.compare_exchange(
            crossbeam_epoch::Shared::null(),
            bucket,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(_) => log::trace!("allocated bucket {k} ({} slots)", FBS << k),
            Err(_lost) => {} // another thread got there first; `_lost.new` is dropped
        }
    }

    /// The slot cell for logical index `i`, or `None` if its bucket was never
    /// allocated. Buckets are never unlinked while the vector is alive, so the
    /// reference is good for the guard's lifetime.
    pub(crate) fn slot<'g>(&self, i: usize, guard: &'g Guard) -> Option<&'g Atomic<T>> {
        let bucket = self.entries[bucket_of(i)].load(Ordering::Acquire, guard);
        if bucket.is_null() {
            return None;
        }
        // SAFETY: non-null entries point at live buckets for the vector's lifetime.
        Some(unsafe { bucket.deref() }.slot(slot_of(i)))
    }

    /// Pre-allocate every bucket needed to address indices below `new_size`.
    pub(crate) fn reserve(&self, new_size: usize, guard: &Guard) {
        if new_size == 0 {
            return;
        }
        for k in 0..=bucket_of(new_size - 1) {
            self.ensure(k, guard);
        }
    }
}

impl<T> Drop for BucketDirectory<T> {
    fn drop(&mut self) {
        // SAFETY: &mut self means no concurrent accessors; the unprotected
        //         guard is fine here.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for entry in &self.entries {
            let bucket = entry.load(Ordering::Relaxed, guard);
            if bucket.is_null() {
                continue;
            }
            // SAFETY: each bucket and each value node is linked in exactly one
            //         place, so this frees everything exactly once.
            let bucket = unsafe { bucket.into_owned() };
            for slot in bucket.slots.iter() {
                let node = slot.load(Ordering::Relaxed, guard);
                if !node.is_null() {
                    // Strip the deletion tag before reconstructing the box.
                    drop(unsafe { Box::from_raw(node.as_raw() as *mut T) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_mapping() {
        // FBS = 8: indices 0..8 live in bucket 0, 8..24 in bucket 1, ...
        assert_eq!((bucket_of(0), slot_of(0)), (0, 0));
        assert_eq!((bucket_of(7), slot_of(7)), (0, 7));
        assert_eq!((bucket_of(8), slot_of(8)), (1, 0));
        assert_eq!((bucket_of(23), slot_of(23)), (1, 15));
        assert_eq!((bucket_of(24), slot_of(24)), (2, 0));
        assert_eq!((bucket_of(55), slot_of(55)), (2, 31));
        assert_eq!((bucket_of(56), slot_of(56)), (3, 0));
    }

    #[test]
    fn mapping_is_a_bijection_over_a_prefix() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..10_000 {
            assert!(seen.insert((bucket_of(i), slot_of(i))));
            assert!(slot_of(i) < FBS << bucket_of(i));
        }
    }

    #[test]
    fn reserve_allocates_every_needed_bucket() {
        let dir = BucketDirectory::<u32>::new();
        let guard = crossbeam_epoch::pin();
        dir.reserve(1000, &guard);
        for i in [0, 7, 8, 500, 999] {
            assert!(dir.slot(i, &guard).is_some());
        }
        // 8 + 16 + ... + 512 = 1016 slots, so buckets 0..=6 suffice and
        // bucket 7 (first index 1016) is untouched.
        assert!(dir.slot(1016, &guard).is_none());
    }

    #[test]
    fn node_slots_keep_the_deletion_tag() {
        // u8 alone has no unused pointer bits; the wrapper must provide one.
        assert!(std::mem::align_of::<Node<u8>>() >= 2);
        let dir = BucketDirectory::<Node<u8>>::new();
        let guard = crossbeam_epoch::pin();
        dir.ensure(0, &guard);
        let slot = dir.slot(0, &guard).unwrap();
        slot.store(Owned::new(Node(9u8)), Ordering::Release);
        let node = slot.load(Ordering::Acquire, &guard);
        assert_eq!(node.with_tag(DELETED).tag(), DELETED);
    }

    #[test]
    fn ensure_is_idempotent() {
        let dir = BucketDirectory::<u32>::new();
        let guard = crossbeam_epoch::pin();
        dir.ensure(3, &guard);
        dir.ensure(3, &guard);
        assert!(dir.slot(56, &guard).is_some());
    }
}
