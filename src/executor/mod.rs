//! The round driver: admit a window, expand, apply, adapt
//!
//! Workers run the loop SPMD-style inside a [std::thread::scope]: every
//! phase is a parallel pass over per-worker shards, separated by barriers,
//! with worker 0 doing the serial glue (round bookkeeping, the adaptive
//! window law, polling the window into staging buckets) between phases.
//!
//! Per round:
//! 1. recycle freed context slots; worker 0 swaps the round buffers,
//!    computes the commit ratio of the previous round and the next target
//!    window size, and decides whether to spill
//! 2. if spilling, every worker drains its shard of the current buffer
//!    back into the window
//! 3. worker 0 polls the window for enough least elements to fill the
//!    target and deals them, one configured chunk at a time, into the
//!    per-worker staging buckets; samples the window minimum for push
//!    routing; detects termination
//! 4. every worker wraps its staged items in fresh contexts and runs the
//!    neighborhood function over its whole shard, turning [Conflict] into
//!    a disabled source
//! 5. (serial-loop variant only) worker 0 sweeps the surviving sources
//! 6. every worker runs the operator over its shard: survivors commit
//!    (deliver pushes, release locks, free the record), losers rewind and
//!    carry over to the next round
//!
//! The commit-ratio regulator doubles the window while the ratio meets the
//! target and shrinks it proportionally below that, floored at one chunk
//! per worker. When the operator pushes faster than commits drain, the
//! spill valve dumps the accumulated carryover back into the window to cap
//! memory.

use std::sync::Barrier;
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::arena::{CtxtArena, MAX_THREADS};
use crate::context::UserCtxt;
use crate::locking::Conflict;
use crate::stats::{ExecStats, PerThreadCounter};
use crate::window::WindowWl;
use crate::worklist::PerThreadVec;
use crate::Comparator;

/// Bounds the round count of a fixed workset's first window
const INIT_MAX_ROUNDS: usize = 500;
/// First-window headroom, in multiples of the minimum window
const THREAD_MULT_FACTOR: usize = 16;
/// Carryover beyond this multiple of the window triggers a spill
const WIN_OVER_SIZE_FACTOR: usize = 8;
/// Default set point for the commit-ratio regulator
pub const DEFAULT_COMMIT_RATIO: f64 = 0.80;
const DEFAULT_CHUNK_SIZE: usize = 16;

/// Loop-wide configuration, fixed at entry
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Loop name, attached to log events and the stats report
    pub name: &'static str,
    /// Worker count; capped by the substrate at [MAX_THREADS] workers
    pub active_threads: usize,
    /// Granularity of the per-phase deal: polled items reach workers in
    /// blocks of this size, and the minimum window is one chunk per worker
    pub chunk_size: usize,
    /// Whether the operator may push new items (selects the window flavor)
    pub needs_push: bool,
    /// Target commit-to-attempt ratio steering the window size
    pub target_commit_ratio: f64,
}

impl LoopConfig {
    pub fn new(name: &'static str) -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_THREADS);
        Self {
            name,
            active_threads: threads,
            chunk_size: DEFAULT_CHUNK_SIZE,
            needs_push: false,
            target_commit_ratio: DEFAULT_COMMIT_RATIO,
        }
    }

    pub fn active_threads(mut self, n: usize) -> Self {
        self.active_threads = n;
        self
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.chunk_size = n;
        self
    }

    pub fn needs_push(mut self, yes: bool) -> Self {
        self.needs_push = yes;
        self
    }

    pub fn target_commit_ratio(mut self, ratio: f64) -> Self {
        self.target_commit_ratio = ratio;
        self
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::new("for_each_ordered_2p_win")
    }
}

/// Abstraction over the two neighborhood-function shapes: the plain one
/// and the one that also sees the round's admitted elements.
trait Neighborhood<'env, T, C: ?Sized>: Sync {
    const WANTS_VIEW: bool;

    fn expand<'run>(
        &self,
        elem: &T,
        uh: &mut UserCtxt<'run, 'env, T, C>,
        view: &[T],
    ) -> Result<(), Conflict>;
}

struct PlainNh<F>(F);

impl<'env, T, C, F> Neighborhood<'env, T, C> for PlainNh<F>
where
    C: ?Sized,
    F: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>) -> Result<(), Conflict> + Sync,
{
    const WANTS_VIEW: bool = false;

    fn expand<'run>(
        &self,
        elem: &T,
        uh: &mut UserCtxt<'run, 'env, T, C>,
        _view: &[T],
    ) -> Result<(), Conflict> {
        (self.0)(elem, uh)
    }
}

struct ViewNh<F>(F);

impl<'env, T, C, F> Neighborhood<'env, T, C> for ViewNh<F>
where
    C: ?Sized,
    F: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>, &[T]) -> Result<(), Conflict> + Sync,
{
    const WANTS_VIEW: bool = true;

    fn expand<'run>(
        &self,
        elem: &T,
        uh: &mut UserCtxt<'run, 'env, T, C>,
        view: &[T],
    ) -> Result<(), Conflict> {
        (self.0)(elem, uh, view)
    }
}

/// Next target window size: a proportional regulator on the commit ratio
/// with a doubling fast path, floored at one chunk per worker.
fn window_law(
    window_size: usize,
    curr_commits: usize,
    prev_window: usize,
    init_size: usize,
    cfg: &LoopConfig,
) -> usize {
    let min_win = cfg.chunk_size * cfg.active_threads;
    let mut next = if prev_window == 0 {
        debug_assert_eq!(curr_commits, 0);
        // initial settings
        if cfg.needs_push {
            usize::max(init_size, THREAD_MULT_FACTOR * min_win)
        } else {
            usize::min(init_size / INIT_MAX_ROUNDS, THREAD_MULT_FACTOR * min_win)
        }
    } else {
        let ratio = curr_commits as f64 / prev_window as f64;
        if ratio >= cfg.target_commit_ratio {
            window_size.saturating_mul(2)
        } else {
            (window_size as f64 * ratio / cfg.target_commit_ratio) as usize
        }
    };
    if next < min_win {
        next = min_win;
    }
    next
}

/// Serial state mutated by worker 0 between barriers
struct RoundPlan<T> {
    /// Which of the two round buffers is current
    cur: usize,
    window_size: usize,
    spill: bool,
    /// Window minimum sampled after the poll; gates push routing in apply
    min_elem: Option<T>,
    done: bool,
    rounds: usize,
    spills: usize,
    prev_committed: usize,
    prev_total: usize,
    window_sizes: Vec<usize>,
}

struct Engine<'env, T, C> {
    cfg: LoopConfig,
    threads: usize,
    cmp: C,
    arena: CtxtArena<'env, T>,
    window: WindowWl<T>,
    wls: [PerThreadVec; 2],
    committed: PerThreadCounter,
    total: PerThreadCounter,
    barrier: Barrier,
    plan: Mutex<RoundPlan<T>>,
    /// Items polled this round, dealt out per worker
    staging: Box<[Mutex<Vec<T>>]>,
    /// Elements admitted to the round, for the view-taking variant
    view: RwLock<Vec<T>>,
}

impl<'env, T, C> Engine<'env, T, C>
where
    T: Clone + Send + Sync + 'env,
    C: Comparator<T>,
{
    /// Worker 0, between rounds: swap buffers, measure the previous round,
    /// run the window law, decide on a spill.
    fn prepare_round(&self) {
        let mut plan = self.plan.lock();
        plan.rounds += 1;

        let committed_now = self.committed.reduce();
        let total_now = self.total.reduce();
        let curr_commits = committed_now - plan.prev_committed;
        let prev_window = total_now - plan.prev_total;
        plan.prev_committed = committed_now;
        plan.prev_total = total_now;

        // the buffer that collected carryover and in-window pushes becomes
        // current; the drained one becomes next
        plan.cur ^= 1;
        let carryover = self.wls[plan.cur].size_all();
        debug_assert_eq!(self.wls[plan.cur ^ 1].size_all(), 0);
        self.wls[plan.cur ^ 1].clear_all();

        plan.window_size = window_law(
            plan.window_size,
            curr_commits,
            prev_window,
            self.window.init_size(),
            &self.cfg,
        );
        let window_size = plan.window_size;
        plan.window_sizes.push(window_size);

        plan.spill = self.cfg.needs_push
            && ((self.window.is_empty() && carryover > plan.window_size)
                || carryover > WIN_OVER_SIZE_FACTOR * plan.window_size);
        if plan.spill {
            plan.spills += 1;
        }

        tracing::event!(
            name: "executor::round",
            tracing::Level::DEBUG,
            loop_name = self.cfg.name,
            round = plan.rounds,
            prev_attempts = prev_window,
            prev_commits = curr_commits,
            window_size = plan.window_size,
            carryover,
            spill = plan.spill,
        );
    }

    /// Every worker: dump this shard's carryover back into the window.
    fn spill_local(&self, tid: usize, cur: usize) {
        let handles = self.wls[cur].take(tid);
        for h in handles {
            let c = self.arena.ctxt(h);
            self.window.push(tid, c.elem().clone(), &self.cmp);
            self.arena.free(tid, h);
        }
    }

    /// Worker 0, after any spill: pull enough least elements to fill the
    /// window, deal them chunk by chunk into the staging buckets, sample
    /// the minimum, and detect termination.
    fn poll_and_stage(&self, wants_view: bool) {
        let mut plan = self.plan.lock();
        let carryover = self.wls[plan.cur].size_all();
        let want = plan.window_size.saturating_sub(carryover);
        let polled = self.window.poll(want, &self.cmp);
        plan.done = carryover == 0 && polled.is_empty();

        plan.min_elem = if self.cfg.needs_push {
            self.window.min_elem(&self.cmp)
        } else {
            None
        };

        if wants_view && !plan.done {
            let mut view = self.view.write();
            view.clear();
            for h in self.wls[plan.cur].handles_all() {
                view.push(self.arena.ctxt(h).elem().clone());
            }
            view.extend(polled.iter().cloned());
        }

        // deal in blocks of one chunk, cycling through the workers
        let chunk = self.cfg.chunk_size;
        for (i, item) in polled.into_iter().enumerate() {
            self.staging[(i / chunk) % self.threads].lock().push(item);
        }
    }
}

fn worker_loop<'env, T, C, NH, OF, SL>(
    eng: &Engine<'env, T, C>,
    tid: usize,
    nh: &NH,
    op: &OF,
    serial: Option<&SL>,
) where
    T: Clone + Send + Sync + 'env,
    C: Comparator<T>,
    NH: Neighborhood<'env, T, C>,
    OF: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>) -> Result<(), Conflict> + Sync,
    SL: Fn(&T) + Sync,
{
    let mut uhand = UserCtxt::new(&eng.arena, &eng.cmp, eng.cfg.needs_push);
    let mut local_committed = 0usize;
    let mut local_total = 0usize;

    loop {
        // round boundary: the previous apply phase is finished everywhere,
        // so slots freed during it can be made reusable
        eng.barrier.wait();
        eng.arena.recycle(tid);
        if tid == 0 {
            eng.prepare_round();
        }
        eng.barrier.wait();

        let (cur, spill) = {
            let plan = eng.plan.lock();
            (plan.cur, plan.spill)
        };
        if spill {
            eng.spill_local(tid, cur);
        }
        eng.barrier.wait();

        if tid == 0 {
            eng.poll_and_stage(NH::WANTS_VIEW);
        }
        eng.barrier.wait();

        let (done, min_elem) = {
            let plan = eng.plan.lock();
            (plan.done, plan.min_elem.clone())
        };
        if done {
            break;
        }

        // wrap this worker's staged items in fresh contexts
        let staged = std::mem::take(&mut *eng.staging[tid].lock());
        for item in staged {
            let (h, _) = eng.arena.alloc(tid, item);
            eng.wls[cur].push(tid, h);
        }

        // expand: lock everything each iteration will touch
        {
            let view = eng.view.read();
            let handles = eng.wls[cur].take(tid);
            for &h in &handles {
                let c = eng.arena.ctxt(h);
                uhand.begin(h, c);
                let outcome = nh.expand(c.elem(), &mut uhand, &view[..]);
                uhand.end();
                if outcome.is_err() {
                    c.disable_src();
                }
                local_total += 1;
            }
            eng.wls[cur].put_back(tid, handles);
        }
        eng.total.publish(tid, local_total);
        eng.barrier.wait();

        // serial-loop variant: one worker sweeps the surviving sources
        if serial.is_some() {
            if tid == 0 {
                let serial = serial.unwrap();
                for h in eng.wls[cur].handles_all() {
                    let c = eng.arena.ctxt(h);
                    if c.is_src() {
                        serial(c.elem());
                    }
                }
            }
            eng.barrier.wait();
        }

        // apply: survivors commit, losers rewind and carry over
        let next = cur ^ 1;
        let handles = eng.wls[cur].take(tid);
        for h in handles {
            let c = eng.arena.ctxt(h);
            let mut commit = false;
            if c.is_src() {
                uhand.begin(h, c);
                let outcome = op(c.elem(), &mut uhand);
                if outcome.is_err() {
                    c.disable_src();
                }
                // the operator may still have lost a lock mid-flight
                commit = c.is_src();
                if commit {
                    local_committed += 1;
                    for item in std::mem::take(&mut uhand.push_buf) {
                        let in_window = match &min_elem {
                            Some(m) => !eng.cmp.before(m, &item),
                            None => true,
                        };
                        if in_window {
                            // ordered before everything still queued, so it
                            // may run as early as the next round
                            let (nh2, _) = eng.arena.alloc(tid, item);
                            eng.wls[next].push(tid, nh2);
                        } else {
                            eng.window.push(tid, item, &eng.cmp);
                        }
                    }
                }
                uhand.end();
            }
            if commit {
                c.commit_iteration(h);
                eng.arena.free(tid, h);
            } else {
                c.cancel_iteration(h);
                c.reset();
                eng.wls[next].push(tid, h);
            }
        }
        eng.committed.publish(tid, local_committed);
    }
}

fn run_loop<'env, T, C, NH, OF, SL>(
    items: Vec<T>,
    cmp: C,
    nh: NH,
    op: OF,
    serial: Option<SL>,
    cfg: LoopConfig,
) -> ExecStats
where
    T: Clone + Send + Sync + 'env,
    C: Comparator<T>,
    NH: Neighborhood<'env, T, C>,
    OF: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>) -> Result<(), Conflict> + Sync,
    SL: Fn(&T) + Sync,
{
    assert!(
        cfg.active_threads >= 1 && cfg.active_threads <= MAX_THREADS,
        "active_threads {} outside 1..={}",
        cfg.active_threads,
        MAX_THREADS
    );
    assert!(cfg.chunk_size >= 1, "chunk_size must be at least 1");
    assert!(
        cfg.target_commit_ratio > 0.0 && cfg.target_commit_ratio <= 1.0,
        "target_commit_ratio must be in (0, 1]"
    );

    let threads = cfg.active_threads;
    let window = WindowWl::init_fill(items, threads, cfg.needs_push, &cmp);
    let init_size = window.init_size();

    let eng = Engine {
        threads,
        cmp,
        arena: CtxtArena::new(threads),
        window,
        wls: [PerThreadVec::new(threads), PerThreadVec::new(threads)],
        committed: PerThreadCounter::new(threads),
        total: PerThreadCounter::new(threads),
        barrier: Barrier::new(threads),
        plan: Mutex::new(RoundPlan {
            cur: 0,
            window_size: 0,
            spill: false,
            min_elem: None,
            done: false,
            rounds: 0,
            spills: 0,
            prev_committed: 0,
            prev_total: 0,
            window_sizes: Vec::new(),
        }),
        staging: (0..threads).map(|_| Mutex::new(Vec::new())).collect(),
        view: RwLock::new(Vec::new()),
        cfg,
    };

    thread::scope(|s| {
        let eng = &eng;
        let (nh, op) = (&nh, &op);
        let serial = serial.as_ref();
        for tid in 1..threads {
            s.spawn(move || worker_loop(eng, tid, nh, op, serial));
        }
        worker_loop(eng, 0, nh, op, serial);
    });

    let plan = eng.plan.into_inner();
    let stats = ExecStats {
        name: eng.cfg.name,
        rounds: plan.rounds,
        committed: eng.committed.reduce(),
        total: eng.total.reduce(),
        spills: plan.spills,
        init_size,
        window_sizes: plan.window_sizes,
    };
    stats.report();
    stats
}

/// Run a priority-ordered workset in parallel, preserving the serializable
/// commit order defined by `cmp`.
///
/// `nh_func` runs first for every admitted item and must
/// [acquire](UserCtxt::acquire) everything the operator will touch;
/// `op_func` then mutates state and may [push](UserCtxt::push) new items
/// when the loop is configured with `needs_push`. Either function aborts
/// the iteration by propagating [Conflict]; aborted iterations retry in a
/// later round, after every item that orders before them.
///
/// Objects named by acquired locks must outlive this call. User functions
/// must not panic: workers synchronize on barriers, and an unwound worker
/// leaves its peers waiting.
pub fn for_each_ordered_2p_win<'env, T, C, NF, OF>(
    range: impl IntoIterator<Item = T>,
    cmp: C,
    nh_func: NF,
    op_func: OF,
    config: LoopConfig,
) -> ExecStats
where
    T: Clone + Send + Sync + 'env,
    C: Comparator<T>,
    NF: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>) -> Result<(), Conflict> + Sync,
    OF: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>) -> Result<(), Conflict> + Sync,
{
    run_loop(
        range.into_iter().collect(),
        cmp,
        PlainNh(nh_func),
        op_func,
        None::<fn(&T)>,
        config,
    )
}

/// Variant for algorithms whose local view cannot be established in
/// parallel safely: the neighborhood function additionally receives every
/// element admitted to the round, and `serial_loop` runs serially over the
/// surviving sources between the two phases.
pub fn for_each_ordered_2p_win_sl<'env, T, C, NF, OF, SL>(
    range: impl IntoIterator<Item = T>,
    cmp: C,
    nh_func: NF,
    op_func: OF,
    serial_loop: SL,
    config: LoopConfig,
) -> ExecStats
where
    T: Clone + Send + Sync + 'env,
    C: Comparator<T>,
    NF: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>, &[T]) -> Result<(), Conflict> + Sync,
    OF: for<'run> Fn(&T, &mut UserCtxt<'run, 'env, T, C>) -> Result<(), Conflict> + Sync,
    SL: Fn(&T) + Sync,
{
    run_loop(
        range.into_iter().collect(),
        cmp,
        ViewNh(nh_func),
        op_func,
        Some(serial_loop),
        config,
    )
}

#[cfg(all(test, not(loom)))]
mod tests;
