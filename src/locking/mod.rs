//! One-word ownership locks with priority-based conflict resolution
//!
//! Every shared object that participates in conflict detection embeds an
//! [OrderedLock], a single `AtomicU64` ownership word, bit packed as follows:
//! - `bits[63]` = held (i.e. some iteration currently owns this object)
//! - `bits[40:45]` = worker index of the owning context's home shard
//! - `bits[0:39]` = slot of the owning context within that shard
//!
//! A word of 0 means the object is unowned. The packed value is a *handle*
//! to the owning [Ctxt](crate::context::Ctxt) rather than a raw pointer, so
//! a reader resolves it through the context arena.
//!
//! Conflicts between two iterations racing for the same word are resolved
//! by the loop's comparator: the context whose element orders *earlier*
//! wins, unconditionally. If the incumbent loses, the acquirer steals the
//! word with a CAS and flags the incumbent so it cannot commit this round.
//! If the acquirer loses (ties included), it flags itself and returns
//! [Conflict], which the round driver catches and turns into a retry next
//! round. Because the globally least element wins every fight it enters,
//! at least one iteration always survives to commit.
//!
//! NOTE: handles read out of a lock word are only dereferenced while a
//! parallel phase is running, and the arena never recycles a freed slot
//! until the following round boundary. A stale handle can therefore point
//! at a context that has already released the word, but never at torn or
//! reused memory; the follow-up CAS (which requires the observed word to
//! still be in place) discards any decision made against a stale owner.

use thiserror::Error;

use crate::arena::{CtxtArena, MAX_THREADS};
use crate::context::Ctxt;
use crate::loom_testing::*;
use crate::Comparator;

use std::sync::atomic::Ordering;

const _: () = assert!(MAX_THREADS <= 64);

/// Indicates that the word holds a live context handle
const LOCK_HELD_BIT: u64 = 1 << 63;
const LOCK_TID_SHIFT: u32 = 40;
const LOCK_SLOT_MASK: u64 = (1 << LOCK_TID_SHIFT) - 1;

/// Extract the held bit
pub(crate) const fn lock_word_held(x: u64) -> bool {
    x & LOCK_HELD_BIT != 0
}
/// Extract the owner's worker index
pub(crate) const fn lock_word_tid(x: u64) -> usize {
    ((x >> LOCK_TID_SHIFT) & 0x3F) as usize
}
/// Extract the owner's slot index
pub(crate) const fn lock_word_slot(x: u64) -> usize {
    (x & LOCK_SLOT_MASK) as usize
}

/// Handle to an in-flight context: home worker index plus slot
///
/// Compact enough to live in a lock word, and copied freely between the
/// round buffers. Never reused while a parallel phase is running.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct CtxtHandle {
    pub(crate) tid: usize,
    pub(crate) slot: usize,
}

impl CtxtHandle {
    pub(crate) const fn encode(self) -> u64 {
        LOCK_HELD_BIT | ((self.tid as u64) << LOCK_TID_SHIFT) | (self.slot as u64)
    }

    pub(crate) const fn decode(word: u64) -> Self {
        Self {
            tid: lock_word_tid(word),
            slot: lock_word_slot(word),
        }
    }
}

/// Signalled when an iteration loses the object it needs to a peer that
/// orders earlier. Caught by the round driver; never escapes the loop.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("speculative conflict: lost a lock to an earlier iteration")]
pub struct Conflict;

/// Per-object ownership word
///
/// Embed one of these in every shared object the operator may touch; the
/// neighborhood function acquires it through
/// [UserCtxt::acquire](crate::UserCtxt::acquire). All traffic on the word
/// is CAS; nothing ever blocks on it.
#[derive(Debug)]
pub struct OrderedLock {
    owner: AtomicU64,
}

impl Default for OrderedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderedLock {
    pub fn new() -> Self {
        Self {
            owner: AtomicU64::new(0),
        }
    }

    /// Whether any iteration currently owns this object.
    ///
    /// Only a snapshot; meaningful to callers that know no loop is running.
    pub fn is_held(&self) -> bool {
        lock_word_held(self.owner.load(Ordering::Relaxed))
    }

    /// Acquire this word on behalf of context `me`.
    ///
    /// Fast paths: unowned (install) and already-owned-by-me (no-op).
    /// Otherwise the comparator decides: if `me`'s element orders before
    /// the incumbent's, the word is stolen and the incumbent is disabled;
    /// if not (equivalence included), `me` is disabled and [Conflict] is
    /// returned.
    pub(crate) fn acquire_for<'env, T, C>(
        &'env self,
        me_h: CtxtHandle,
        me: &Ctxt<'env, T>,
        arena: &CtxtArena<'env, T>,
        cmp: &C,
    ) -> Result<(), Conflict>
    where
        T: Send + Sync,
        C: Comparator<T> + ?Sized,
    {
        let me_word = me_h.encode();
        let mut cur = self.owner.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                match self.owner.compare_exchange_weak(
                    0,
                    me_word,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        me.note_acquired(self);
                        return Ok(());
                    }
                    Err(x) => {
                        cur = x;
                        spin_hint();
                        continue;
                    }
                }
            }

            if cur == me_word {
                // idempotent re-acquire from the apply phase
                return Ok(());
            }

            let other_h = CtxtHandle::decode(cur);
            let other = arena.ctxt(other_h);
            if cmp.before(me.elem(), other.elem()) {
                // incumbent loses; steal the word, then flag it
                match self.owner.compare_exchange_weak(
                    cur,
                    me_word,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        other.disable_src();
                        me.note_acquired(self);
                        tracing::event!(
                            name: "locking::steal",
                            tracing::Level::TRACE,
                            winner.tid = me_h.tid,
                            winner.slot = me_h.slot,
                            loser.tid = other_h.tid,
                            loser.slot = other_h.slot,
                        );
                        return Ok(());
                    }
                    Err(x) => {
                        // owner changed under us; re-resolve against the new one
                        cur = x;
                        spin_hint();
                        continue;
                    }
                }
            } else {
                me.disable_src();
                tracing::event!(
                    name: "locking::conflict",
                    tracing::Level::TRACE,
                    loser.tid = me_h.tid,
                    loser.slot = me_h.slot,
                    holder.tid = other_h.tid,
                    holder.slot = other_h.slot,
                );
                return Err(Conflict);
            }
        }
    }

    /// Release this word if `me` still owns it.
    ///
    /// A failed CAS means the word was stolen; the thief owns the object
    /// now and nothing needs to happen here.
    pub(crate) fn release_for(&self, me_h: CtxtHandle) {
        let _ = self.owner.compare_exchange(
            me_h.encode(),
            0,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Whether `me` currently owns this word.
    #[cfg(test)]
    pub(crate) fn held_by(&self, me_h: CtxtHandle) -> bool {
        self.owner.load(Ordering::Relaxed) == me_h.encode()
    }
}
