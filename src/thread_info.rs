use std::cell::Cell;

/// Per-thread hints: the last size this thread observed and the combining
/// queue it last enqueued into.
///
/// Held in a `thread_local::ThreadLocal` on the vector, i.e. keyed by thread
/// identifier per vector instance rather than process-global TLS, so two
/// vectors never share hints and the state dies with the vector.
///
/// `owned_queue` is a bare address used only for identity comparison — it is
/// never dereferenced, so it may dangle harmlessly after the queue retires.
#[derive(Default)]
pub(crate) struct ThreadCache {
    size: Cell<usize>,
    owned_queue: Cell<usize>,
}

impl ThreadCache {
    pub(crate) fn cached_size(&self) -> usize {
        self.size.get()
    }

    pub(crate) fn set_size(&self, size: usize) {
        self.size.set(size);
    }

    /// Does this thread have requests in the queue at `addr`?
    pub(crate) fn owns(&self, addr: usize) -> bool {
        addr != 0 && self.owned_queue.get() == addr
    }

    pub(crate) fn set_owned(&self, addr: usize) {
        self.owned_queue.set(addr);
    }

    pub(crate) fn clear_owned(&self) {
        self.owned_queue.set(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_tracking() {
        let cache = ThreadCache::default();
        assert!(!cache.owns(0));
        assert!(!cache.owns(0x1000));
        cache.set_owned(0x1000);
        assert!(cache.owns(0x1000));
        assert!(!cache.owns(0x2000));
        cache.clear_owned();
        assert!(!cache.owns(0x1000));
    }
}
