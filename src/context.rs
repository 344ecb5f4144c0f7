//! Per-iteration speculation records and the accessor handed to user code
//!
//! A [Ctxt] exists for every item admitted to the current round. It owns
//! the item, the "still allowed to commit" source flag, the list of lock
//! words the iteration holds, and the undo log the operator filled in.
//! Committing destroys the record; aborting rewinds it so the same record
//! can be retried next round.
//!
//! The lists are interior-mutable but single-writer: only the worker
//! currently executing a context appends to or drains them. Peers reach a
//! foreign context exclusively through [Ctxt::elem], [Ctxt::is_src] and
//! [Ctxt::disable_src], all of which are safe cross-thread.

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::sync::atomic::Ordering;

use crate::arena::CtxtArena;
use crate::locking::{Conflict, CtxtHandle, OrderedLock};
use crate::loom_testing::*;
use crate::Comparator;

type UndoOp<'env> = Box<dyn FnOnce() + Send + 'env>;

/// Speculation record for one in-flight item
pub(crate) struct Ctxt<'env, T> {
    elem: T,
    /// True while this iteration may still commit in the current round
    source: AtomicBool,
    /// Lock words this iteration owns, in acquisition order
    locks: UnsafeCell<Vec<&'env OrderedLock>>,
    /// Reversible mutations recorded by the operator, in program order
    undo: UnsafeCell<Vec<UndoOp<'env>>>,
}

// safety: the lists are only touched by the worker executing the context
// (phase discipline enforced by the round driver); everything else is
// atomic or immutable
unsafe impl<'env, T: Send + Sync> Send for Ctxt<'env, T> {}
unsafe impl<'env, T: Send + Sync> Sync for Ctxt<'env, T> {}

impl<'env, T: Debug> Debug for Ctxt<'env, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctxt")
            .field("elem", &self.elem)
            .field("source", &self.source.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<'env, T> Ctxt<'env, T> {
    pub(crate) fn new(elem: T) -> Self {
        Self {
            elem,
            source: AtomicBool::new(true),
            locks: UnsafeCell::new(Vec::new()),
            undo: UnsafeCell::new(Vec::new()),
        }
    }

    pub(crate) fn elem(&self) -> &T {
        &self.elem
    }

    pub(crate) fn is_src(&self) -> bool {
        self.source.load(Ordering::Relaxed)
    }

    /// Knock this iteration out of the current round.
    ///
    /// Called by the owning worker when it loses a fight, or by the
    /// winning peer after a steal. Visibility to the commit gate is
    /// guaranteed by the phase barrier, not by this store's ordering.
    pub(crate) fn disable_src(&self) {
        self.source.store(false, Ordering::Relaxed);
    }

    /// Record a lock word this iteration now owns.
    pub(crate) fn note_acquired(&self, lock: &'env OrderedLock) {
        // safety: executing worker only
        unsafe { (*self.locks.get()).push(lock) };
    }

    /// Append a reversible-mutation entry to the undo log.
    pub(crate) fn push_undo(&self, op: UndoOp<'env>) {
        // safety: executing worker only
        unsafe { (*self.undo.get()).push(op) };
    }

    /// Accept the iteration: discard the undo log and release every lock.
    pub(crate) fn commit_iteration(&self, me: CtxtHandle) {
        // safety: executing worker only
        unsafe {
            (*self.undo.get()).clear();
            for lock in (*self.locks.get()).drain(..) {
                lock.release_for(me);
            }
        }
    }

    /// Rewind the iteration: run the undo log backwards while the locks
    /// are still held, then release the locks.
    pub(crate) fn cancel_iteration(&self, me: CtxtHandle) {
        // safety: executing worker only
        unsafe {
            let undo = &mut *self.undo.get();
            while let Some(op) = undo.pop() {
                op();
            }
            for lock in (*self.locks.get()).drain(..) {
                lock.release_for(me);
            }
        }
    }

    /// Make the record eligible again for the next round.
    pub(crate) fn reset(&self) {
        debug_assert!(unsafe { (*self.locks.get()).is_empty() });
        self.source.store(true, Ordering::Relaxed);
    }
}

/// Per-worker accessor passed to the neighborhood and operator functions
///
/// Carries the worker's current-context slot (set and cleared by the round
/// driver around each iteration), the push buffer for new items, and the
/// entry point into the current context's undo log.
pub struct UserCtxt<'run, 'env, T, C: ?Sized> {
    arena: &'run CtxtArena<'env, T>,
    cmp: &'run C,
    cur: Option<(CtxtHandle, &'run Ctxt<'env, T>)>,
    pub(crate) push_buf: Vec<T>,
    allow_push: bool,
}

impl<'run, 'env, T, C> UserCtxt<'run, 'env, T, C>
where
    T: Send + Sync,
    C: Comparator<T> + ?Sized,
{
    pub(crate) fn new(arena: &'run CtxtArena<'env, T>, cmp: &'run C, allow_push: bool) -> Self {
        Self {
            arena,
            cmp,
            cur: None,
            push_buf: Vec::new(),
            allow_push,
        }
    }

    /// Acquire a shared object's lock word for the current iteration.
    ///
    /// Returns [Conflict] when the object is owned by an iteration that
    /// orders earlier; propagate it with `?`. The round driver catches it,
    /// disables the iteration and retries it in a later round.
    pub fn acquire(&mut self, lock: &'env OrderedLock) -> Result<(), Conflict> {
        let (h, c) = self
            .cur
            .expect("acquire called outside of an active iteration");
        lock.acquire_for(h, c, self.arena, self.cmp)
    }

    /// Queue a new item for execution.
    ///
    /// Only delivered if the current iteration commits; aborted
    /// iterations drop their pushes. Panics when the loop was configured
    /// with `needs_push == false`.
    pub fn push(&mut self, item: T) {
        assert!(
            self.allow_push,
            "operator pushed an item but the loop was configured without pushes"
        );
        self.push_buf.push(item);
    }

    /// Record how to reverse a mutation the operator is about to make.
    ///
    /// Entries run in reverse order if the iteration aborts, while its
    /// locks are still held; they are dropped unexecuted on commit.
    pub fn record_undo<F>(&mut self, op: F)
    where
        F: FnOnce() + Send + 'env,
    {
        let (_, c) = self
            .cur
            .expect("record_undo called outside of an active iteration");
        c.push_undo(Box::new(op));
    }

    pub(crate) fn begin(&mut self, h: CtxtHandle, c: &'run Ctxt<'env, T>) {
        self.cur = Some((h, c));
        self.push_buf.clear();
    }

    pub(crate) fn end(&mut self) {
        self.cur = None;
    }
}
