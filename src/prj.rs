//! Parallel radix join: cooperative histogram-based partitioning across
//! worker threads, then task-queue-driven sub-joins.
//!
//! ```text
//!  workers          phase                      shared state
//! ┌─────────┐   1. local histograms        hist[t][cluster]
//! │ t0 … tn │   2. prefix sums + barrier ──►read-only spine
//! │         │   3. scatter (disjoint)      tmpR / tmpS
//! │         │      barrier
//! │ t0 only │   4. publish tasks           part_queue (or join_queue)
//! │         │      barrier
//! │ t0 … tn │   5. pass-2 repartition      backR / backS, join_queue
//! │         │      barrier
//! │ t0 … tn │   6. drain join_queue        per-thread matches
//! └─────────┘      barrier, t0 stops timers
//! ```
//!
//! Writers never share a slot: scatter targets are disjoint by prefix-sum
//! construction, and every barrier crossing publishes the writes of the
//! phase before it.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;
use std::thread;

use tracing::debug;

use crate::clock;
use crate::radix::{
    chained_sub_join, radix_cluster, SubJoin, FANOUT_PASS1, NUM_PASSES, NUM_RADIX_BITS,
    PADDING_TUPLES, RELATION_PADDING, SMALL_PADDING_TUPLES,
};
use crate::rel::{slice_bounds, Relation, Tuple};
use crate::{log_join, Discard, JoinConfig, JoinOutcome, JoinStats, OutputSink, OutputTuple, ThreadResult};

const JOIN_NAME: &str = "parallel_radix_hj";

const PASS1_BITS: u32 = NUM_RADIX_BITS / NUM_PASSES;
const PASS2_BITS: u32 = NUM_RADIX_BITS - PASS1_BITS;

/// Cluster-size threshold above which a task would count as skewed.
const fn threshold1(nthreads: usize) -> usize {
    let larger_fanout = if PASS2_BITS > PASS1_BITS {
        1usize << PASS2_BITS
    } else {
        1usize << PASS1_BITS
    };
    larger_fanout * nthreads * 64
}

/// Wrapper to send raw pointers across thread boundaries.
///
/// Safety: callers must ensure threads access disjoint memory regions or
/// separate their accesses with barrier crossings.
#[derive(Copy, Clone)]
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline]
    fn get(self) -> *mut T {
        self.0
    }
}

/// Raw view of a tuple range inside a driver-owned buffer.
#[derive(Copy, Clone)]
struct Span {
    ptr: SendPtr<Tuple>,
    len: usize,
}

impl Span {
    fn of(slice: &mut [Tuple]) -> Self {
        Self {
            ptr: SendPtr(slice.as_mut_ptr()),
            len: slice.len(),
        }
    }

    /// Sub-range of this span.
    fn slice(self, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= self.len);
        Self {
            ptr: SendPtr(unsafe { self.ptr.get().add(offset) }),
            len,
        }
    }

    /// Extends the view past its length.
    ///
    /// Safety: the backing buffer must actually hold `extra` more tuples,
    /// and the extension must stay disjoint from other writers.
    unsafe fn widen(self, extra: usize) -> Self {
        Self {
            ptr: self.ptr,
            len: self.len + extra,
        }
    }

    /// Safety: no exclusive reference to the range may be live.
    unsafe fn as_slice<'a>(self) -> &'a [Tuple] {
        std::slice::from_raw_parts(self.ptr.get(), self.len)
    }

    /// Safety: the caller must have exclusive access to the range.
    unsafe fn as_mut_slice<'a>(self) -> &'a mut [Tuple] {
        std::slice::from_raw_parts_mut(self.ptr.get(), self.len)
    }

    /// Single-element store, bounds-checked in debug builds.
    #[inline]
    unsafe fn write(self, i: usize, t: Tuple) {
        debug_assert!(i < self.len);
        *self.ptr.get().add(i) = t;
    }
}

/// One queued unit of work: a cluster-local pair of relation views plus
/// the matching scratch views in the opposite buffers.
#[derive(Copy, Clone)]
struct JoinTask {
    rel_r: Span,
    tmp_r: Span,
    rel_s: Span,
    tmp_s: Span,
}

/// Fixed-capacity list of published join tasks.
///
/// The driver's barriers already separate every publication phase from
/// the consumption phase that drains it, so the list does not need a
/// ring or per-slot publication: a producer reserves the next slot with
/// `reserved` and writes the task in place, the barrier crossing makes
/// all written slots visible, and consumers claim slots through `taken`.
/// A claim hands out each slot index exactly once, so no task is joined
/// twice and no consumer can observe a torn task.
///
/// Capacity equals the maximum task count for the configured radix
/// fanout; reserving past it is a protocol violation, not a runtime
/// condition.
struct TaskList {
    slots: Box<[UnsafeCell<MaybeUninit<JoinTask>>]>,
    /// Producer cursor. Slots below it are reserved, and written by the
    /// end of the publication phase.
    reserved: AtomicUsize,
    /// Consumer cursor. Slots below it are claimed.
    taken: AtomicUsize,
}

unsafe impl Send for TaskList {}
unsafe impl Sync for TaskList {}

impl TaskList {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            slots,
            reserved: AtomicUsize::new(0),
            taken: AtomicUsize::new(0),
        }
    }

    /// Reserves the next slot and writes the task into it. The write is
    /// published to consumers by the next barrier crossing.
    fn publish(&self, task: JoinTask) {
        let slot = self.reserved.fetch_add(1, Ordering::Relaxed);
        assert!(
            slot < self.slots.len(),
            "task list sized to the maximum fanout task count"
        );
        // The fetch_add handed this index to exactly one producer, so
        // the slot is exclusively ours until a consumer claims it.
        unsafe {
            (*self.slots[slot].get()).write(task);
        }
    }

    /// Claims the next published task, or `None` once the list is
    /// drained. Must not race `publish` on the same list; the drivers
    /// keep the two phases on opposite sides of a barrier.
    fn take(&self) -> Option<JoinTask> {
        let published = self.reserved.load(Ordering::Relaxed);
        let slot = self.taken.fetch_add(1, Ordering::Relaxed);
        if slot < published {
            Some(unsafe { (*self.slots[slot].get()).assume_init_read() })
        } else {
            None
        }
    }

    /// Published-but-unclaimed task count. `taken` can overshoot once
    /// the list drains, hence the saturation.
    fn len(&self) -> usize {
        let published = self.reserved.load(Ordering::Relaxed);
        published.saturating_sub(self.taken.load(Ordering::Relaxed))
    }
}

/// Run-wide shared state. Read-only to the workers; the buffers behind
/// the spans are written only through phase-disjoint raw stores.
#[repr(align(64))]
struct SharedCtx<'a> {
    rel_r: &'a [Tuple],
    rel_s: &'a [Tuple],
    tmp_r: Span,
    tmp_s: Span,
    back_r: Span,
    back_s: Span,
    hist_r: SendPtr<usize>,
    hist_s: SendPtr<usize>,
    nthreads: usize,
    materialize: bool,
    join_fn: SubJoin,
    barrier: Barrier,
    part_queue: TaskList,
    join_queue: TaskList,
}

#[derive(Clone, Copy, Default)]
struct Timing {
    start_usec: u64,
    end_usec: u64,
    total_cycles: u64,
    partition_cycles: u64,
    pass1_cycles: u64,
    pass2_cycles: u64,
    #[cfg(feature = "hw-counters")]
    hw: clock::HwReport,
}

struct WorkerOut {
    matches: u64,
    parts_processed: u32,
    tuples: Vec<OutputTuple>,
    timing: Option<Timing>,
}

struct PartArgs<'a> {
    /// This thread's input slice.
    rel: &'a [Tuple],
    /// The whole padded destination buffer.
    tmp: Span,
    /// Histogram spine base, `nthreads` rows of `fanout` entries.
    hist: SendPtr<usize>,
    total_tuples: usize,
    shift: u32,
    bits: u32,
    padding: usize,
}

/// Histogram-based cooperative partitioning. Every worker calls this for
/// the same relation and meets at the internal barrier; afterwards
/// `output[j]` holds the start of cluster j for this thread's writes and
/// `output[fanout]` the padded total length.
fn parallel_radix_partition(
    args: &PartArgs,
    tid: usize,
    nthreads: usize,
    barrier: &Barrier,
    output: &mut [usize],
) {
    let fanout = 1usize << args.bits;
    let shift = args.shift;
    let mask = ((fanout - 1) as u64) << shift;
    debug_assert_eq!(output.len(), fanout + 1);

    if tid == 0 {
        debug!(
            shift,
            bits = args.bits,
            fanout,
            mask,
            "radix partitioning"
        );
    }

    // Local histogram over the assigned slice, then an in-place running
    // sum. The row belongs to this thread until the barrier.
    {
        let my_hist =
            unsafe { std::slice::from_raw_parts_mut(args.hist.get().add(tid * fanout), fanout) };
        for t in args.rel {
            my_hist[((t.key & mask) >> shift) as usize] += 1;
        }
        let mut sum = 0usize;
        for h in my_hist.iter_mut() {
            sum += *h;
            *h = sum;
        }
    }

    // Every local histogram is complete past this point.
    barrier.wait();

    let hist_at = |i: usize, j: usize| unsafe { *args.hist.get().add(i * fanout + j) };

    // Start of each cluster for this thread's writes: full totals of the
    // earlier threads, prior-cluster totals of this thread onward.
    for o in output[..fanout].iter_mut() {
        *o = 0;
    }
    for i in 0..tid {
        for (j, o) in output[..fanout].iter_mut().enumerate() {
            *o += hist_at(i, j);
        }
    }
    for i in tid..nthreads {
        for (j, o) in output[1..fanout].iter_mut().enumerate() {
            *o += hist_at(i, j);
        }
    }

    let mut dst = vec![0usize; fanout];
    for (j, o) in output[..fanout].iter_mut().enumerate() {
        *o += j * args.padding;
        dst[j] = *o;
    }
    output[fanout] = args.total_tuples + fanout * args.padding;

    // Scatter. Slots are disjoint across threads by construction of the
    // prefix sums, so raw element stores need no further ordering until
    // the next barrier.
    for t in args.rel {
        let idx = ((t.key & mask) >> shift) as usize;
        unsafe { args.tmp.write(dst[idx], *t) };
        dst[idx] += 1;
    }
}

/// Pass-2 repartitioning of one pass-1 task; publishes each non-empty
/// cluster pair as a join task.
fn serial_radix_partition(task: &JoinTask, join_queue: &TaskList) {
    let fanout = 1usize << PASS2_BITS;

    let mut counts_r = vec![0usize; fanout];
    let mut counts_s = vec![0usize; fanout];

    // The task owns its spans until the join tasks it publishes are
    // consumed; the scratch views are the scatter targets.
    unsafe {
        radix_cluster(
            task.tmp_r.as_mut_slice(),
            task.rel_r.as_slice(),
            &mut counts_r,
            PASS1_BITS,
            PASS2_BITS,
            SMALL_PADDING_TUPLES,
        );
        radix_cluster(
            task.tmp_s.as_mut_slice(),
            task.rel_s.as_slice(),
            &mut counts_s,
            PASS1_BITS,
            PASS2_BITS,
            SMALL_PADDING_TUPLES,
        );
    }

    // The pass-1 views become the back buffers of the join tasks; their
    // cluster regions carry the same padding slack as the scatter target.
    let (back_r, back_s) = unsafe {
        (
            task.rel_r.widen(PADDING_TUPLES),
            task.rel_s.widen(PADDING_TUPLES),
        )
    };

    let (mut off_r, mut off_s) = (0usize, 0usize);
    for i in 0..fanout {
        if counts_r[i] > 0 && counts_s[i] > 0 {
            let pad = i * SMALL_PADDING_TUPLES;
            join_queue.publish(JoinTask {
                rel_r: task.tmp_r.slice(off_r + pad, counts_r[i]),
                tmp_r: back_r.slice(off_r + pad, counts_r[i]),
                rel_s: task.tmp_s.slice(off_s + pad, counts_s[i]),
                tmp_s: back_s.slice(off_s + pad, counts_s[i]),
            });
        }
        off_r += counts_r[i];
        off_s += counts_s[i];
    }
}

fn prj_worker(ctx: &SharedCtx, tid: usize) -> WorkerOut {
    let nthreads = ctx.nthreads;
    let mut timing = Timing::default();
    let mut timer_total = 0u64;
    let mut timer_part = 0u64;
    let mut pass1 = 0u64;
    let mut pass2 = 0u64;

    if tid == 0 {
        debug!(
            num_passes = NUM_PASSES,
            radix_bits = NUM_RADIX_BITS,
            fanout = FANOUT_PASS1,
            thresh1 = threshold1(nthreads),
            "parallel radix join starting"
        );
        #[cfg(feature = "hw-counters")]
        clock::mark("partition");
    }

    let (r_lo, r_hi) = slice_bounds(ctx.rel_r.len(), nthreads, tid);
    let (s_lo, s_hi) = slice_bounds(ctx.rel_s.len(), nthreads, tid);
    let my_r = &ctx.rel_r[r_lo..r_hi];
    let my_s = &ctx.rel_s[s_lo..s_hi];

    let mut output_r = vec![0usize; FANOUT_PASS1 + 1];
    let mut output_s = vec![0usize; FANOUT_PASS1 + 1];

    // Start line: thread 0 checkpoints the clocks once everyone exists.
    ctx.barrier.wait();
    if tid == 0 {
        timing.start_usec = clock::system_micros();
        clock::start_timer(&mut timer_total);
        timer_part = timer_total;
        pass1 = timer_total;
    }

    // Pass 1: both relations, all threads.
    parallel_radix_partition(
        &PartArgs {
            rel: my_r,
            tmp: ctx.tmp_r,
            hist: ctx.hist_r,
            total_tuples: ctx.rel_r.len(),
            shift: 0,
            bits: PASS1_BITS,
            padding: PADDING_TUPLES,
        },
        tid,
        nthreads,
        &ctx.barrier,
        &mut output_r,
    );
    parallel_radix_partition(
        &PartArgs {
            rel: my_s,
            tmp: ctx.tmp_s,
            hist: ctx.hist_s,
            total_tuples: ctx.rel_s.len(),
            shift: 0,
            bits: PASS1_BITS,
            padding: PADDING_TUPLES,
        },
        tid,
        nthreads,
        &ctx.barrier,
        &mut output_s,
    );

    // Every scatter is complete past this barrier.
    ctx.barrier.wait();

    // Thread 0 owns a copy of the global cluster boundaries and publishes
    // the pass-2 tasks; with one configured pass the cluster pairs go to
    // the join queue directly.
    if tid == 0 {
        for i in 0..FANOUT_PASS1 {
            let ntup_r = output_r[i + 1] - output_r[i] - PADDING_TUPLES;
            let ntup_s = output_s[i + 1] - output_s[i] - PADDING_TUPLES;
            if ntup_r == 0 || ntup_s == 0 {
                continue;
            }

            if NUM_PASSES == 1 {
                ctx.join_queue.publish(JoinTask {
                    rel_r: ctx.tmp_r.slice(output_r[i], ntup_r),
                    tmp_r: ctx.back_r.slice(output_r[i], ntup_r),
                    rel_s: ctx.tmp_s.slice(output_s[i], ntup_s),
                    tmp_s: ctx.back_s.slice(output_s[i], ntup_s),
                });
            } else {
                ctx.part_queue.publish(JoinTask {
                    rel_r: ctx.tmp_r.slice(output_r[i], ntup_r),
                    tmp_r: ctx.back_r.slice(output_r[i], ntup_r + PADDING_TUPLES),
                    rel_s: ctx.tmp_s.slice(output_s[i], ntup_s),
                    tmp_s: ctx.back_s.slice(output_s[i], ntup_s + PADDING_TUPLES),
                });
            }
        }
        debug!(
            partition_tasks = ctx.part_queue.len(),
            join_tasks = ctx.join_queue.len(),
            "pass-1 tasks published"
        );
        clock::stop_timer(&mut pass1);
        clock::start_timer(&mut pass2);
    }

    // Published tasks are visible to every consumer past this barrier.
    ctx.barrier.wait();

    if NUM_PASSES == 2 {
        while let Some(task) = ctx.part_queue.take() {
            serial_radix_partition(&task, &ctx.join_queue);
        }
    }

    // All join tasks exist past this barrier.
    ctx.barrier.wait();

    if tid == 0 {
        clock::stop_timer(&mut pass2);
        clock::stop_timer(&mut timer_part);
        debug!(join_tasks = ctx.join_queue.len(), "partitioning complete");
        #[cfg(feature = "hw-counters")]
        {
            timing.hw.phase1 = clock::snapshot(0);
            clock::mark("join");
        }
    }
    #[cfg(feature = "hw-counters")]
    ctx.barrier.wait();

    // Drain the join queue; idle threads steal the next task.
    let mut matches = 0u64;
    let mut parts_processed = 0u32;
    let mut out_list: Vec<OutputTuple> = Vec::new();
    let mut discard = Discard;

    while let Some(task) = ctx.join_queue.take() {
        let (r, s) = unsafe { (task.rel_r.as_slice(), task.rel_s.as_slice()) };
        let sink: &mut dyn OutputSink = if ctx.materialize {
            &mut out_list
        } else {
            &mut discard
        };
        matches += (ctx.join_fn)(r, s, sink);
        parts_processed += 1;
    }

    // Finish line, for reliable end timing.
    ctx.barrier.wait();
    if tid == 0 {
        clock::stop_timer(&mut timer_total);
        timing.end_usec = clock::system_micros();
        timing.total_cycles = timer_total;
        timing.partition_cycles = timer_part;
        timing.pass1_cycles = pass1;
        timing.pass2_cycles = pass2;
        #[cfg(feature = "hw-counters")]
        {
            timing.hw.phase2 = clock::snapshot(0);
            timing.hw.total = clock::snapshot(1);
        }
    }

    WorkerOut {
        matches,
        parts_processed,
        tuples: out_list,
        timing: (tid == 0).then_some(timing),
    }
}

/// Parallel radix join with the chained-array leaf.
pub fn join(rel_r: &Relation, rel_s: &Relation, config: &JoinConfig) -> JoinOutcome {
    join_with(rel_r, rel_s, config, chained_sub_join)
}

/// Parallel radix join with a caller-supplied sub-join.
pub fn join_with(
    rel_r: &Relation,
    rel_s: &Relation,
    config: &JoinConfig,
    join_fn: SubJoin,
) -> JoinOutcome {
    let nthreads = config.nthreads.max(1);

    // Scratch pairs for the two partitioning passes. They stay untouched
    // on this thread until every worker has joined.
    let mut tmp_r = Relation::scratch(rel_r.len(), RELATION_PADDING);
    let mut tmp_s = Relation::scratch(rel_s.len(), RELATION_PADDING);
    let mut back_r = Relation::scratch(rel_r.len(), RELATION_PADDING);
    let mut back_s = Relation::scratch(rel_s.len(), RELATION_PADDING);

    let mut hist_r = vec![0usize; nthreads * FANOUT_PASS1];
    let mut hist_s = vec![0usize; nthreads * FANOUT_PASS1];

    let ctx = SharedCtx {
        rel_r: rel_r.tuples(),
        rel_s: rel_s.tuples(),
        tmp_r: Span::of(tmp_r.padded_mut()),
        tmp_s: Span::of(tmp_s.padded_mut()),
        back_r: Span::of(back_r.padded_mut()),
        back_s: Span::of(back_s.padded_mut()),
        hist_r: SendPtr(hist_r.as_mut_ptr()),
        hist_s: SendPtr(hist_s.as_mut_ptr()),
        nthreads,
        materialize: config.materialize,
        join_fn,
        barrier: Barrier::new(nthreads),
        part_queue: TaskList::with_capacity(FANOUT_PASS1),
        join_queue: TaskList::with_capacity(1 << NUM_RADIX_BITS),
    };

    let outs: Vec<WorkerOut> = thread::scope(|s| {
        let handles: Vec<_> = (0..nthreads)
            .map(|tid| {
                let ctx = &ctx;
                s.spawn(move || prj_worker(ctx, tid))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let total_matches: u64 = outs.iter().map(|o| o.matches).sum();
    let timing = outs[0].timing.unwrap_or_default();
    debug!(
        pass1_cycles = timing.pass1_cycles,
        pass2_cycles = timing.pass2_cycles,
        "pass timings"
    );

    let stats = JoinStats {
        matches: total_matches,
        input_tuples_r: rel_r.len() as u64,
        input_tuples_s: rel_s.len() as u64,
        phase1_cycles: timing.partition_cycles,
        phase2_cycles: timing.total_cycles - timing.partition_cycles,
        total_cycles: timing.total_cycles,
        total_usec: timing.end_usec - timing.start_usec,
        ..Default::default()
    };
    #[cfg(feature = "hw-counters")]
    let stats = JoinStats {
        hw: Some(timing.hw),
        ..stats
    };

    log_join(JOIN_NAME, config, &stats);

    let per_thread = outs
        .into_iter()
        .enumerate()
        .map(|(thread_id, o)| ThreadResult {
            thread_id,
            matches: o.matches,
            parts_processed: o.parts_processed,
            tuples: o.tuples,
        })
        .collect();

    JoinOutcome {
        total_matches,
        nthreads,
        stats,
        per_thread,
    }
}
