//! Ordered speculative parallel loop executor
//!
//! `ordex` runs a priority-ordered workset in parallel while preserving a
//! serializable commit order defined by a caller-supplied comparator. Work
//! is admitted from a priority reservoir into bounded execution windows;
//! each admitted item is speculatively evaluated in two phases (lock the
//! neighborhood, then apply the operator), conflicts between speculating
//! peers are settled in favor of the item that orders earlier, and losers
//! retry in a later round. A commit-ratio regulator grows and shrinks the
//! window to keep speculation productive.
//!
//! The caller supplies:
//! - a range of initial items,
//! - a [Comparator] giving the strict order ("before"),
//! - a neighborhood function that [acquires](UserCtxt::acquire) the
//!   [OrderedLock] of everything the operator will touch,
//! - an operator that mutates state behind those locks and may
//!   [push](UserCtxt::push) follow-on items.
//!
//! ```
//! use ordex::{for_each_ordered_2p_win, LoopConfig, OrderedLock};
//! use parking_lot::Mutex;
//!
//! let lock = OrderedLock::new();
//! let log = Mutex::new(Vec::new());
//! for_each_ordered_2p_win(
//!     vec![5u32, 1, 4, 2, 3],
//!     |a: &u32, b: &u32| a < b,
//!     |_elem, uh| uh.acquire(&lock),
//!     |elem, _uh| {
//!         log.lock().push(*elem);
//!         Ok(())
//!     },
//!     LoopConfig::new("doc").active_threads(2),
//! );
//! assert_eq!(*log.lock(), [1, 2, 3, 4, 5]);
//! ```

mod arena;
mod context;
mod executor;
mod locking;
mod loom_testing;
mod stats;
mod window;
mod worklist;

pub use context::UserCtxt;
pub use executor::{
    for_each_ordered_2p_win, for_each_ordered_2p_win_sl, LoopConfig, DEFAULT_COMMIT_RATIO,
};
pub use locking::{Conflict, OrderedLock};
pub use stats::ExecStats;

/// Strict weak order over the loop's items: `before(a, b)` means `a` must
/// commit no later than `b`. Items with `!before(a, b) && !before(b, a)`
/// are treated as equivalent; break ties externally if the operator cannot
/// tolerate them.
pub trait Comparator<T>: Send + Sync {
    fn before(&self, a: &T, b: &T) -> bool;
}

impl<T, F> Comparator<T> for F
where
    F: Fn(&T, &T) -> bool + Send + Sync,
{
    fn before(&self, a: &T, b: &T) -> bool {
        self(a, b)
    }
}
