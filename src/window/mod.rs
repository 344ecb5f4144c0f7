//! Priority-ordered reservoirs of items not yet admitted to a round
//!
//! Both variants present the same surface: bulk load, minimum query, and a
//! batched poll that surrenders the least elements. They differ in what
//! happens after the initial fill:
//!
//! - [SortedRangeWindow]: a block sorted once at fill time with a cursor
//!   walking it. No insertion; picked when the operator never pushes.
//! - [HeapWindow]: per-worker min-heaps, so pushes from the apply phase
//!   land on the pushing worker's shard without contention. The minimum
//!   query and the batched poll do a k-way scan across shards.
//!
//! Ordering comes from the loop's comparator, not `Ord`, so the heaps are
//! hand-rolled sift-up/sift-down over plain vectors (bulk loads heapify in
//! place rather than pushing one by one).
//!
//! Polls are serialized (only the round driver calls them, between
//! phases); pushes can arrive concurrently from every worker.

use std::cmp::Ordering as CmpOrdering;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::Comparator;

/// Comparator to total-order adapter, for sorting the range variant
fn cmp_ord<T, C: Comparator<T> + ?Sized>(cmp: &C, a: &T, b: &T) -> CmpOrdering {
    if cmp.before(a, b) {
        CmpOrdering::Less
    } else if cmp.before(b, a) {
        CmpOrdering::Greater
    } else {
        CmpOrdering::Equal
    }
}

fn sift_up<T, C: Comparator<T> + ?Sized>(v: &mut [T], mut i: usize, cmp: &C) {
    while i > 0 {
        let parent = (i - 1) / 2;
        if cmp.before(&v[i], &v[parent]) {
            v.swap(i, parent);
            i = parent;
        } else {
            break;
        }
    }
}

fn sift_down<T, C: Comparator<T> + ?Sized>(v: &mut [T], mut i: usize, cmp: &C) {
    let len = v.len();
    loop {
        let (l, r) = (2 * i + 1, 2 * i + 2);
        let mut least = i;
        if l < len && cmp.before(&v[l], &v[least]) {
            least = l;
        }
        if r < len && cmp.before(&v[r], &v[least]) {
            least = r;
        }
        if least == i {
            break;
        }
        v.swap(i, least);
        i = least;
    }
}

fn heapify<T, C: Comparator<T> + ?Sized>(v: &mut [T], cmp: &C) {
    for i in (0..v.len() / 2).rev() {
        sift_down(v, i, cmp);
    }
}

fn heap_push<T, C: Comparator<T> + ?Sized>(v: &mut Vec<T>, item: T, cmp: &C) {
    v.push(item);
    let last = v.len() - 1;
    sift_up(v, last, cmp);
}

fn heap_pop<T, C: Comparator<T> + ?Sized>(v: &mut Vec<T>, cmp: &C) -> Option<T> {
    if v.is_empty() {
        return None;
    }
    let last = v.len() - 1;
    v.swap(0, last);
    let out = v.pop();
    sift_down(v, 0, cmp);
    out
}

struct SortedInner<T> {
    /// Sorted ascending under the loop comparator
    items: Vec<T>,
    /// Everything before the cursor has been polled out already
    cursor: usize,
}

/// Window over a fixed initial range: sort once, then walk
pub(crate) struct SortedRangeWindow<T> {
    inner: Mutex<SortedInner<T>>,
    init_size: usize,
}

impl<T: Clone> SortedRangeWindow<T> {
    fn fill<C: Comparator<T> + ?Sized>(items: Vec<T>, cmp: &C) -> Self {
        let mut items = items;
        items.sort_unstable_by(|a, b| cmp_ord(cmp, a, b));
        let init_size = items.len();
        Self {
            inner: Mutex::new(SortedInner { items, cursor: 0 }),
            init_size,
        }
    }

    fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.cursor == inner.items.len()
    }

    fn min_elem(&self) -> Option<T> {
        let inner = self.inner.lock();
        inner.items.get(inner.cursor).cloned()
    }

    fn poll(&self, want: usize) -> Vec<T> {
        let mut inner = self.inner.lock();
        let end = usize::min(inner.cursor + want, inner.items.len());
        let out = inner.items[inner.cursor..end].to_vec();
        inner.cursor = end;
        out
    }
}

/// Window with insertion: per-worker min-heaps
pub(crate) struct HeapWindow<T> {
    shards: Box<[CachePadded<Mutex<Vec<T>>>]>,
    init_size: usize,
}

impl<T: Clone> HeapWindow<T> {
    fn fill<C: Comparator<T> + ?Sized>(items: Vec<T>, threads: usize, cmp: &C) -> Self {
        let init_size = items.len();
        let mut split: Vec<Vec<T>> = (0..threads).map(|_| Vec::new()).collect();
        for (i, item) in items.into_iter().enumerate() {
            split[i % threads].push(item);
        }
        let shards = split
            .into_iter()
            .map(|mut v| {
                heapify(&mut v, cmp);
                CachePadded::new(Mutex::new(v))
            })
            .collect();
        Self { shards, init_size }
    }

    fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    fn push<C: Comparator<T> + ?Sized>(&self, tid: usize, item: T, cmp: &C) {
        heap_push(&mut self.shards[tid].lock(), item, cmp);
    }

    fn min_elem<C: Comparator<T> + ?Sized>(&self, cmp: &C) -> Option<T> {
        let mut best: Option<T> = None;
        for shard in self.shards.iter() {
            let shard = shard.lock();
            if let Some(top) = shard.first() {
                let better = match &best {
                    Some(b) => cmp.before(top, b),
                    None => true,
                };
                if better {
                    best = Some(top.clone());
                }
            }
        }
        best
    }

    /// Pop up to `want` least elements, scanning shard tops k-way.
    fn poll<C: Comparator<T> + ?Sized>(&self, want: usize, cmp: &C) -> Vec<T> {
        let mut guards: Vec<_> = self.shards.iter().map(|s| s.lock()).collect();
        let remaining: usize = guards.iter().map(|g| g.len()).sum();
        let mut out = Vec::with_capacity(usize::min(want, remaining));
        while out.len() < want {
            let mut best: Option<usize> = None;
            for (i, g) in guards.iter().enumerate() {
                if let Some(top) = g.first() {
                    let better = match best {
                        Some(b) => cmp.before(top, &guards[b][0]),
                        None => true,
                    };
                    if better {
                        best = Some(i);
                    }
                }
            }
            match best {
                Some(i) => {
                    let item = heap_pop(&mut guards[i], cmp).unwrap();
                    out.push(item);
                }
                None => break,
            }
        }
        out
    }
}

/// The window flavor is fixed at loop construction from whether the
/// operator may push.
pub(crate) enum WindowWl<T> {
    Sorted(SortedRangeWindow<T>),
    Heap(HeapWindow<T>),
}

impl<T: Clone> WindowWl<T> {
    /// Bulk-load the initial range. Must happen before any poll.
    pub(crate) fn init_fill<C: Comparator<T> + ?Sized>(
        items: Vec<T>,
        threads: usize,
        needs_push: bool,
        cmp: &C,
    ) -> Self {
        tracing::event!(
            name: "window::init_fill",
            tracing::Level::DEBUG,
            items = items.len(),
            needs_push,
        );
        if needs_push {
            Self::Heap(HeapWindow::fill(items, threads, cmp))
        } else {
            Self::Sorted(SortedRangeWindow::fill(items, cmp))
        }
    }

    /// Size of the initial fill, before any polling.
    pub(crate) fn init_size(&self) -> usize {
        match self {
            Self::Sorted(w) => w.init_size,
            Self::Heap(w) => w.init_size,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Self::Sorted(w) => w.is_empty(),
            Self::Heap(w) => w.is_empty(),
        }
    }

    /// The least element not yet admitted, if any.
    pub(crate) fn min_elem<C: Comparator<T> + ?Sized>(&self, cmp: &C) -> Option<T> {
        match self {
            Self::Sorted(w) => w.min_elem(),
            Self::Heap(w) => w.min_elem(cmp),
        }
    }

    /// Insert an item produced after the initial fill (heap variant only).
    pub(crate) fn push<C: Comparator<T> + ?Sized>(&self, tid: usize, item: T, cmp: &C) {
        match self {
            Self::Sorted(_) => unreachable!("push into a sorted-range window"),
            Self::Heap(w) => w.push(tid, item, cmp),
        }
    }

    /// Remove and return up to `want` least elements.
    pub(crate) fn poll<C: Comparator<T> + ?Sized>(&self, want: usize, cmp: &C) -> Vec<T> {
        if want == 0 {
            return Vec::new();
        }
        match self {
            Self::Sorted(w) => w.poll(want),
            Self::Heap(w) => w.poll(want, cmp),
        }
    }
}
