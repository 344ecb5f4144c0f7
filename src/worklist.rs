//! Per-worker round buffers of live context handles
//!
//! Two of these exist per loop (current and next round); the driver swaps
//! their roles at every round boundary. Each worker only ever mutates its
//! own shard, so the mutexes are uncontended; they exist to make the
//! cross-shard size and drain queries at round boundaries safe.

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::locking::CtxtHandle;

pub(crate) struct PerThreadVec {
    shards: Box<[CachePadded<Mutex<Vec<CtxtHandle>>>]>,
}

impl PerThreadVec {
    pub(crate) fn new(threads: usize) -> Self {
        Self {
            shards: (0..threads)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
        }
    }

    pub(crate) fn push(&self, tid: usize, h: CtxtHandle) {
        self.shards[tid].lock().push(h);
    }

    /// Move a worker's shard out for processing, leaving it empty.
    pub(crate) fn take(&self, tid: usize) -> Vec<CtxtHandle> {
        std::mem::take(&mut *self.shards[tid].lock())
    }

    /// Restore a shard after a read-only pass over it.
    pub(crate) fn put_back(&self, tid: usize, v: Vec<CtxtHandle>) {
        let mut shard = self.shards[tid].lock();
        debug_assert!(shard.is_empty());
        *shard = v;
    }

    /// Total live handles across every shard.
    pub(crate) fn size_all(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub(crate) fn clear_all(&self) {
        for shard in self.shards.iter() {
            shard.lock().clear();
        }
    }

    /// Snapshot every handle, shard by shard (round-boundary use only).
    pub(crate) fn handles_all(&self) -> Vec<CtxtHandle> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.lock().iter().copied());
        }
        out
    }
}
