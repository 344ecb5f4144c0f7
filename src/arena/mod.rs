//! Slab arena for speculation records, one shard per worker
//!
//! Modeled on a mimalloc-style sharded slab: every worker allocates
//! contexts from its own shard, so the hot paths are uncontended. A
//! context freed by a worker other than its home worker (which happens
//! when an aborted record migrates between round buffers) is pushed onto
//! the home shard's remote list and reclaimed by the home worker later.
//!
//! The arena's one unusual rule is *round-boundary recycling*: freeing a
//! slot only queues it, and queued slots become allocatable again when the
//! round driver calls [CtxtArena::recycle] between rounds. Lock words can
//! hold handles to contexts that commit (and free) mid-phase, and peers
//! resolve conflicts by reading through those handles; deferring reuse to
//! the barrier means such a read can be stale but never torn. This also
//! keeps handles unambiguous within a phase, which is what lets the lock
//! words skip a generation counter.
//!
//! Slab storage is published with an atomic pointer per slab so readers
//! can chase a handle into a shard that is growing concurrently. Storage
//! is only returned to the OS when the arena is dropped.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::context::Ctxt;
use crate::locking::CtxtHandle;
use crate::loom_testing::*;

/// Absolute maximum number of workers.
///
/// Fixed rather than dynamic because lock words devote six bits to the
/// home-shard index, and because per-worker state is handed out as
/// references into a preallocated table.
pub(crate) const MAX_THREADS: usize = 64;

/// Number of context slots per slab
#[cfg(not(loom))]
const SLAB_CAP: usize = 1 << 12;
#[cfg(loom)]
const SLAB_CAP: usize = 8;
/// Maximum number of slabs per shard
#[cfg(not(loom))]
const MAX_SLABS: usize = 1 << 12;
#[cfg(loom)]
const MAX_SLABS: usize = 4;

struct CtxtSlot<'env, T>(UnsafeCell<MaybeUninit<Ctxt<'env, T>>>);

struct ShardCore {
    /// Slots handed out at least once; slots at or past this index are raw
    next_fresh: usize,
    /// Recycled slots, ready for reuse
    free: Vec<u32>,
    /// Slots freed since the last round boundary; not yet reusable
    pending: Vec<u32>,
}

struct Shard<'env, T> {
    /// Published slab storage; entry `i` covers slots `[i * SLAB_CAP, (i + 1) * SLAB_CAP)`
    slabs: Box<[AtomicPtr<CtxtSlot<'env, T>>]>,
    core: Mutex<ShardCore>,
    /// Frees arriving from other workers, drained by the home worker
    remote_free: Mutex<Vec<u32>>,
}

// safety: slot contents are only created/dropped by the home worker while
// no phase is running (or under the alloc path's exclusive claim on a
// fresh/free slot); cross-thread reads go through handles that are valid
// for the whole phase per the recycle rule above
unsafe impl<'env, T: Send + Sync> Send for Shard<'env, T> {}
unsafe impl<'env, T: Send + Sync> Sync for Shard<'env, T> {}

impl<'env, T> Shard<'env, T> {
    fn new() -> Self {
        let slabs = (0..MAX_SLABS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Self {
            slabs,
            core: Mutex::new(ShardCore {
                next_fresh: 0,
                free: Vec::new(),
                pending: Vec::new(),
            }),
            remote_free: Mutex::new(Vec::new()),
        }
    }

    /// Resolve a slot index to its slab storage, growing if necessary.
    /// Only the home worker calls this with `grow == true`.
    fn slot_ptr(&self, slot: usize, grow: bool) -> *mut CtxtSlot<'env, T> {
        let (slab_idx, offset) = (slot / SLAB_CAP, slot % SLAB_CAP);
        let mut slab = self.slabs[slab_idx].load(Ordering::Acquire);
        if slab.is_null() {
            assert!(grow, "handle resolved into an unpublished slab");
            let fresh: Box<[CtxtSlot<'env, T>]> = (0..SLAB_CAP)
                .map(|_| CtxtSlot(UnsafeCell::new(MaybeUninit::uninit())))
                .collect();
            slab = Box::into_raw(fresh) as *mut CtxtSlot<'env, T>;
            self.slabs[slab_idx].store(slab, Ordering::Release);
        }
        // safety: slabs hold SLAB_CAP slots and offset < SLAB_CAP
        unsafe { slab.add(offset) }
    }
}

/// Arena root: one slab shard per worker
pub(crate) struct CtxtArena<'env, T> {
    shards: Box<[Shard<'env, T>]>,
}

impl<'env, T: Send + Sync> CtxtArena<'env, T> {
    pub(crate) fn new(threads: usize) -> Self {
        assert!(
            threads > 0 && threads <= MAX_THREADS,
            "worker count {} outside 1..={}",
            threads,
            MAX_THREADS
        );
        Self {
            shards: (0..threads).map(|_| Shard::new()).collect(),
        }
    }

    /// Allocate and initialize a context in worker `tid`'s shard.
    pub(crate) fn alloc(&self, tid: usize, elem: T) -> (CtxtHandle, &Ctxt<'env, T>) {
        let shard = &self.shards[tid];
        let slot = {
            let mut core = shard.core.lock();
            match core.free.pop() {
                Some(s) => s as usize,
                None => {
                    let s = core.next_fresh;
                    assert!(
                        s < SLAB_CAP * MAX_SLABS,
                        "context arena shard {} exhausted ({} slots)",
                        tid,
                        SLAB_CAP * MAX_SLABS
                    );
                    core.next_fresh = s + 1;
                    s
                }
            }
        };
        let p = shard.slot_ptr(slot, true);
        // safety: the slot was just claimed off the free list or the fresh
        // bump and is not reachable from any handle until we hand it out
        let ctxt = unsafe { (*(*p).0.get()).write(Ctxt::new(elem)) };
        (CtxtHandle { tid, slot }, ctxt)
    }

    /// Resolve a handle to its context.
    ///
    /// The handle must come from a live allocation of this arena (a round
    /// buffer entry or a lock word observed during the current phase).
    pub(crate) fn ctxt(&self, h: CtxtHandle) -> &Ctxt<'env, T> {
        let p = self.shards[h.tid].slot_ptr(h.slot, false);
        // safety: handles are only minted by alloc after initialization,
        // and the slot cannot be recycled before the next round boundary
        unsafe { (*(*p).0.get()).assume_init_ref() }
    }

    /// Return a context's slot, from worker `tid`.
    ///
    /// The payload is dropped, and the slot made reusable, at the next
    /// [recycle](Self::recycle) on its home shard.
    pub(crate) fn free(&self, tid: usize, h: CtxtHandle) {
        if h.tid == tid {
            self.shards[tid].core.lock().pending.push(h.slot as u32);
        } else {
            self.shards[h.tid].remote_free.lock().push(h.slot as u32);
        }
    }

    /// Drop every context freed since the last boundary and make the slots
    /// allocatable. Call only between rounds, when no handle from the
    /// previous phase can still be dereferenced.
    pub(crate) fn recycle(&self, tid: usize) {
        let shard = &self.shards[tid];
        let remote = std::mem::take(&mut *shard.remote_free.lock());
        let mut core = shard.core.lock();
        let pending = std::mem::take(&mut core.pending);
        for slot in pending.into_iter().chain(remote) {
            let p = shard.slot_ptr(slot as usize, false);
            // safety: freed slots hold initialized contexts until dropped
            // here, and nothing can reach them once the round has ended
            unsafe { (*(*p).0.get()).assume_init_drop() };
            core.free.push(slot);
        }
    }
}

impl<'env, T> Drop for CtxtArena<'env, T> {
    fn drop(&mut self) {
        for shard in self.shards.iter() {
            // drop contexts that were freed but never recycled; contexts
            // still live after a panicking loop stay leaked
            let remote = std::mem::take(&mut *shard.remote_free.lock());
            let mut core = shard.core.lock();
            let pending = std::mem::take(&mut core.pending);
            for slot in pending.into_iter().chain(remote) {
                let p = shard.slot_ptr(slot as usize, false);
                unsafe { (*(*p).0.get()).assume_init_drop() };
            }
            for slab in shard.slabs.iter() {
                let p = slab.load(Ordering::Acquire);
                if !p.is_null() {
                    // safety: published slabs were leaked from boxed slices
                    // of exactly SLAB_CAP slots
                    unsafe {
                        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(p, SLAB_CAP)));
                    }
                }
            }
        }
    }
}
