//! Radix partitioning and the single-threaded radix joins.
//!
//! Holds the serial clustering passes (with and without inter-cluster
//! padding), the chained-array sub-join used as the leaf of every radix
//! variant, and two single-threaded drivers: a self-contained compact
//! join and a framework entry point that plugs in a caller-supplied
//! sub-join.

use std::mem::size_of;

use tracing::debug;

use crate::clock;
use crate::rel::{Relation, Tuple, CACHE_LINE_SIZE};
use crate::{log_join, Discard, JoinConfig, JoinOutcome, JoinStats, OutputSink, ThreadResult};

/// Radix bits consumed by the shared (framework/parallel) partitioning
/// pipeline.
pub const NUM_RADIX_BITS: u32 = 14;

/// Partitioning passes of the shared pipeline. Only 1 or 2 are defined.
pub const NUM_PASSES: u32 = 2;

const _: () = assert!(NUM_PASSES == 1 || NUM_PASSES == 2);

pub const FANOUT_PASS1: usize = 1 << (NUM_RADIX_BITS / NUM_PASSES);
pub const FANOUT_PASS2: usize = 1 << (NUM_RADIX_BITS - NUM_RADIX_BITS / NUM_PASSES);

/// Slack between adjacent clusters so scatter targets do not share L1
/// cache sets.
pub(crate) const SMALL_PADDING_TUPLES: usize = 3 * CACHE_LINE_SIZE / size_of::<Tuple>();

/// Pass-1 inter-cluster slack: room for a full pass-2 fanout of small
/// paddings within each pass-1 cluster.
pub(crate) const PADDING_TUPLES: usize = SMALL_PADDING_TUPLES * (FANOUT_PASS2 + 1);

/// Total scratch-buffer slack, in tuples.
pub(crate) const RELATION_PADDING: usize = PADDING_TUPLES * FANOUT_PASS1;

/// Radix parameters of the compact single-threaded join.
const ST_RADIX_BITS: u32 = 8;
const ST_NUM_PASSES: u32 = 1;

/// A pluggable sub-join: consumes one cluster-local pair of relations,
/// returns the match count, and appends to the sink when materializing.
pub type SubJoin = fn(&[Tuple], &[Tuple], &mut dyn OutputSink) -> u64;

#[inline]
fn radix_bits_of(key: u64, mask: u64, shift: u32) -> usize {
    ((key & mask) >> shift) as usize
}

/// Scatters `input` into `out` grouped by the `bits` key bits starting at
/// `shift`, clusters back to back with no padding. `out` must hold at
/// least `input.len()` tuples.
pub(crate) fn radix_cluster_nopadding(out: &mut [Tuple], input: &[Tuple], shift: u32, bits: u32) {
    let fanout = 1usize << bits;
    let mask = ((fanout - 1) as u64) << shift;

    let mut counts = vec![0usize; fanout];
    for t in input {
        counts[radix_bits_of(t.key, mask, shift)] += 1;
    }

    // Running cluster write positions from the counts.
    let mut dst = vec![0usize; fanout];
    let mut offset = 0;
    for i in 0..fanout {
        dst[i] = offset;
        offset += counts[i];
    }

    for t in input {
        let idx = radix_bits_of(t.key, mask, shift);
        out[dst[idx]] = *t;
        dst[idx] += 1;
    }
}

/// Padded variant: cluster i starts `i × padding` slots later, and
/// per-cluster cardinalities are returned through `counts`
/// (len = fanout). `out` must hold `input.len() + fanout × padding`.
pub(crate) fn radix_cluster(
    out: &mut [Tuple],
    input: &[Tuple],
    counts: &mut [usize],
    shift: u32,
    bits: u32,
    padding: usize,
) {
    let fanout = 1usize << bits;
    let mask = ((fanout - 1) as u64) << shift;
    debug_assert_eq!(counts.len(), fanout);

    for t in input {
        counts[radix_bits_of(t.key, mask, shift)] += 1;
    }

    let mut dst = vec![0usize; fanout];
    let mut offset = 0;
    for i in 0..fanout {
        dst[i] = offset + i * padding;
        offset += counts[i];
    }

    for t in input {
        let idx = radix_bits_of(t.key, mask, shift);
        out[dst[idx]] = *t;
        dst[idx] += 1;
    }
}

/// Chained-array equi-join over two cluster-local relations.
///
/// Builds a dense hash index over `r`: `bucket[idx]` holds the 1-based
/// position of the chain head, `next[i]` the 1-based follower of tuple i,
/// 0 terminating either. The hash consumes the key bits just above the
/// `radix_bits` already common within the cluster. Duplicate keys on
/// either side multiply the match count.
pub(crate) fn chained_join<S: OutputSink + ?Sized>(
    r: &[Tuple],
    s: &[Tuple],
    radix_bits: u32,
    out: &mut S,
) -> u64 {
    let n = r.len().next_power_of_two();
    let mask = ((n - 1) as u64) << radix_bits;

    let mut bucket = vec![0u32; n];
    let mut next = vec![0u32; r.len()];

    for (i, t) in r.iter().enumerate() {
        let idx = radix_bits_of(t.key, mask, radix_bits);
        next[i] = bucket[idx];
        // Chain positions start from 1; 0 is the end-of-chain marker.
        bucket[idx] = i as u32 + 1;
    }

    let mut matches = 0u64;
    for st in s {
        let idx = radix_bits_of(st.key, mask, radix_bits);
        let mut hit = bucket[idx];
        while hit != 0 {
            let rt = &r[hit as usize - 1];
            if rt.key == st.key {
                matches += 1;
                out.push(st.key, rt.payload, st.payload);
            }
            hit = next[hit as usize - 1];
        }
    }

    matches
}

/// The default leaf for the pluggable drivers, bound to the shared radix
/// parameters.
pub fn chained_sub_join(r: &[Tuple], s: &[Tuple], out: &mut dyn OutputSink) -> u64 {
    chained_join(r, s, NUM_RADIX_BITS, out)
}

fn chained_sub_join_st(r: &[Tuple], s: &[Tuple], out: &mut dyn OutputSink) -> u64 {
    chained_join(r, s, ST_RADIX_BITS, out)
}

/// Compact single-threaded radix join: 8 radix bits, one clustering pass,
/// chained-array leaf.
pub fn join(rel_r: &Relation, rel_s: &Relation, config: &JoinConfig) -> JoinOutcome {
    radix_join_st(
        rel_r,
        rel_s,
        config,
        ST_RADIX_BITS,
        ST_NUM_PASSES,
        "radix_hj_st",
        chained_sub_join_st,
    )
}

/// Framework entry: the same single-threaded driver at the shared radix
/// parameters, with a caller-supplied sub-join.
pub fn join_with(
    rel_r: &Relation,
    rel_s: &Relation,
    config: &JoinConfig,
    join_fn: SubJoin,
) -> JoinOutcome {
    radix_join_st(
        rel_r,
        rel_s,
        config,
        NUM_RADIX_BITS,
        NUM_PASSES,
        "radix_hj_plug",
        join_fn,
    )
}

/// Shared single-threaded driver: partition both relations, enumerate
/// cluster pairs, run the sub-join on each non-empty pair.
fn radix_join_st(
    rel_r: &Relation,
    rel_s: &Relation,
    config: &JoinConfig,
    radix_bits: u32,
    num_passes: u32,
    name: &str,
    join_fn: SubJoin,
) -> JoinOutcome {
    assert!(
        num_passes == 1 || num_passes == 2,
        "only 1- and 2-pass radix partitioning is defined"
    );
    let fanout_total = 1usize << radix_bits;

    let start = clock::system_micros();
    let mut timer_part = 0u64;
    clock::start_timer(&mut timer_part);
    let mut timer_total = timer_part;

    #[cfg(feature = "hw-counters")]
    let mut hw = clock::HwReport::default();
    #[cfg(feature = "hw-counters")]
    clock::mark("partition");

    // Partitioning. Pass 2 is a full stable re-scatter by the high bits,
    // which leaves the tuples grouped by all `radix_bits` low-order bits
    // in ascending cluster order. Inputs stay untouched; each pass writes
    // a driver-owned scratch buffer.
    let (part_r, part_s) = {
        let mut out_r = Relation::scratch(rel_r.len(), 0);
        let mut out_s = Relation::scratch(rel_s.len(), 0);
        if num_passes == 1 {
            radix_cluster_nopadding(out_r.padded_mut(), rel_r.tuples(), 0, radix_bits);
            radix_cluster_nopadding(out_s.padded_mut(), rel_s.tuples(), 0, radix_bits);
            (out_r, out_s)
        } else {
            let bits1 = radix_bits / num_passes;
            let bits2 = radix_bits - bits1;
            radix_cluster_nopadding(out_r.padded_mut(), rel_r.tuples(), 0, bits1);
            radix_cluster_nopadding(out_s.padded_mut(), rel_s.tuples(), 0, bits1);

            let mut back_r = Relation::scratch(rel_r.len(), 0);
            let mut back_s = Relation::scratch(rel_s.len(), 0);
            radix_cluster_nopadding(back_r.padded_mut(), out_r.tuples(), bits1, bits2);
            radix_cluster_nopadding(back_s.padded_mut(), out_s.tuples(), bits1, bits2);
            (back_r, back_s)
        }
    };

    #[cfg(feature = "hw-counters")]
    {
        hw.phase1 = clock::snapshot(0);
        clock::mark("join");
    }

    clock::stop_timer(&mut timer_part);

    // Per-cluster cardinalities over the fully partitioned relations.
    let mask = (fanout_total - 1) as u64;
    let mut count_r = vec![0u64; fanout_total];
    let mut count_s = vec![0u64; fanout_total];
    for t in part_r.tuples() {
        count_r[(t.key & mask) as usize] += 1;
    }
    for t in part_s.tuples() {
        count_s[(t.key & mask) as usize] += 1;
    }

    let mut out_list: Vec<crate::OutputTuple> = Vec::new();
    let mut discard = Discard;
    let sink: &mut dyn OutputSink = if config.materialize {
        &mut out_list
    } else {
        &mut discard
    };

    let mut matches = 0u64;
    let mut parts_processed = 0u32;
    let (mut r_off, mut s_off) = (0usize, 0usize);
    for i in 0..fanout_total {
        let (nr, ns) = (count_r[i] as usize, count_s[i] as usize);
        if nr > 0 && ns > 0 {
            matches += join_fn(
                &part_r.tuples()[r_off..r_off + nr],
                &part_s.tuples()[s_off..s_off + ns],
                sink,
            );
            parts_processed += 1;
        }
        r_off += nr;
        s_off += ns;
    }

    clock::stop_timer(&mut timer_total);
    let end = clock::system_micros();

    #[cfg(feature = "hw-counters")]
    {
        hw.phase2 = clock::snapshot(0);
        hw.total = clock::snapshot(1);
    }

    debug!(
        join = name,
        radix_bits,
        num_passes,
        parts_processed,
        "single-threaded radix join done"
    );

    let stats = JoinStats {
        matches,
        input_tuples_r: rel_r.len() as u64,
        input_tuples_s: rel_s.len() as u64,
        phase1_cycles: timer_part,
        phase2_cycles: timer_total - timer_part,
        total_cycles: timer_total,
        total_usec: end - start,
        ..Default::default()
    };
    #[cfg(feature = "hw-counters")]
    let stats = JoinStats {
        hw: Some(hw),
        ..stats
    };

    log_join(name, config, &stats);

    JoinOutcome {
        total_matches: matches,
        nthreads: 1,
        stats,
        per_thread: vec![ThreadResult {
            thread_id: 0,
            matches,
            parts_processed,
            tuples: out_list,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{naive_count, naive_pairs, seeded_relation};
    use crate::OutputTuple;

    #[test]
    fn nopadding_conserves_and_groups() {
        let input: Vec<Tuple> = (0..257u64).map(|i| Tuple::new(i * 7 + 3, i)).collect();
        let mut out = vec![Tuple::default(); input.len()];
        radix_cluster_nopadding(&mut out, &input, 0, 4);

        assert_eq!(out.len(), input.len());
        // Cluster ids must be non-decreasing across the output.
        let ids: Vec<u64> = out.iter().map(|t| t.key & 0xF).collect();
        assert!(ids.windows(2).all(|w| w[0] <= w[1]));

        let mut a: Vec<Tuple> = input.clone();
        let mut b = out.clone();
        a.sort_by_key(|t| (t.key, t.payload));
        b.sort_by_key(|t| (t.key, t.payload));
        assert_eq!(a, b);
    }

    #[test]
    fn zero_bit_pass_is_identity() {
        let input: Vec<Tuple> = (0..64u64).rev().map(|i| Tuple::new(i, i)).collect();
        let mut out = vec![Tuple::default(); input.len()];
        radix_cluster_nopadding(&mut out, &input, 0, 0);
        // A single cluster keeps the scatter stable, so the "permutation"
        // is the identity.
        assert_eq!(out, input);
    }

    #[test]
    fn padded_clustering_places_with_gaps() {
        let input: Vec<Tuple> = (0..40u64).map(|i| Tuple::new(i % 4, i)).collect();
        let padding = 3;
        let fanout = 4;
        let mut out = vec![Tuple::default(); input.len() + fanout * padding];
        let mut counts = vec![0usize; fanout];
        radix_cluster(&mut out, &input, &mut counts, 0, 2, padding);

        assert_eq!(counts.iter().sum::<usize>(), input.len());
        let mut offset = 0;
        for (i, &n) in counts.iter().enumerate() {
            let lo = offset + i * padding;
            for t in &out[lo..lo + n] {
                assert_eq!((t.key & 0x3) as usize, i);
            }
            offset += n;
        }
    }

    #[test]
    fn chained_join_counts_duplicates() {
        let r: Vec<Tuple> = vec![Tuple::new(7, 1), Tuple::new(7, 2), Tuple::new(9, 3)];
        let s: Vec<Tuple> = vec![Tuple::new(7, 10), Tuple::new(7, 20), Tuple::new(8, 30)];
        let mut discard = Discard;
        assert_eq!(chained_join(&r, &s, 0, &mut discard), 4);
    }

    #[test]
    fn chained_join_empty_build() {
        let s = vec![Tuple::new(1, 1)];
        let mut discard = Discard;
        assert_eq!(chained_join(&[], &s, 8, &mut discard), 0);
    }

    #[test]
    fn chained_join_distinguishes_high_bits() {
        // All keys share the full 8-bit cluster field; only the bits
        // above it separate them inside the sub-join.
        let r: Vec<Tuple> = (0..16u64).map(|i| Tuple::new(0xFF | (i << 8), i)).collect();
        let s = r.clone();
        let mut discard = Discard;
        assert_eq!(chained_join(&r, &s, 8, &mut discard), 16);
    }

    #[test]
    fn chained_join_materializes_pairs() {
        let r = vec![Tuple::new(2, 100)];
        let s = vec![Tuple::new(2, 200), Tuple::new(2, 201)];
        let mut out: Vec<OutputTuple> = Vec::new();
        assert_eq!(chained_join(&r, &s, 0, &mut out), 2);
        let mut got: Vec<(u64, u64, u64)> =
            out.iter().map(|o| (o.key, o.payload_r, o.payload_s)).collect();
        got.sort_unstable();
        assert_eq!(got, vec![(2, 100, 200), (2, 100, 201)]);
    }

    #[test]
    fn small_literal_join() {
        let r: Relation = [(1, 0xA), (2, 0xB), (3, 0xC)].into_iter().collect();
        let s: Relation = [(2, 0x1), (2, 0x2), (4, 0x3)].into_iter().collect();
        let outcome = join(&r, &s, &JoinConfig::default());
        assert_eq!(outcome.total_matches, 2);
    }

    #[test]
    fn empty_build_relation() {
        let r = Relation::new(Vec::new());
        let s: Relation = [(1, 1)].into_iter().collect();
        let outcome = join(&r, &s, &JoinConfig::default());
        assert_eq!(outcome.total_matches, 0);
        assert_eq!(outcome.stats.input_tuples_r, 0);
    }

    #[test]
    fn identity_keys_full_fanout() {
        // One match per key across the full 2^8 fanout.
        let n = 1u64 << 20;
        let r: Relation = (0..n).map(|k| (k, k)).collect();
        let s: Relation = (0..n).map(|k| (k, k)).collect();
        let outcome = join(&r, &s, &JoinConfig::default());
        assert_eq!(outcome.total_matches, n);
    }

    #[test]
    fn two_pass_matches_one_pass() {
        let r = seeded_relation(20_000, 1 << 12, 11);
        let s = seeded_relation(30_000, 1 << 12, 12);
        let config = JoinConfig::default();
        let one = radix_join_st(&r, &s, &config, 8, 1, "radix_1p", chained_sub_join_st);
        let two = radix_join_st(&r, &s, &config, 8, 2, "radix_2p", chained_sub_join_st);
        assert_eq!(one.total_matches, two.total_matches);
        assert_eq!(one.total_matches, naive_count(&r, &s));
    }

    #[test]
    fn framework_accepts_custom_sub_join() {
        fn nested_loop(r: &[Tuple], s: &[Tuple], _out: &mut dyn OutputSink) -> u64 {
            let mut m = 0;
            for a in r {
                for b in s {
                    if a.key == b.key {
                        m += 1;
                    }
                }
            }
            m
        }

        let r = seeded_relation(5_000, 1 << 10, 21);
        let s = seeded_relation(5_000, 1 << 10, 22);
        let config = JoinConfig::default();
        let plugged = join_with(&r, &s, &config, nested_loop);
        let default = join_with(&r, &s, &config, chained_sub_join);
        assert_eq!(plugged.total_matches, default.total_matches);
        assert_eq!(plugged.total_matches, naive_count(&r, &s));
    }

    #[test]
    fn materialized_output_matches_reference() {
        let r = seeded_relation(2_000, 1 << 8, 31);
        let s = seeded_relation(3_000, 1 << 8, 32);
        let config = JoinConfig {
            materialize: true,
            ..Default::default()
        };
        let outcome = join(&r, &s, &config);

        let mut got: Vec<(u64, u64, u64)> = outcome.per_thread[0]
            .tuples
            .iter()
            .map(|o| (o.key, o.payload_r, o.payload_s))
            .collect();
        got.sort_unstable();
        let expected = naive_pairs(&r, &s);
        assert_eq!(got.len() as u64, outcome.total_matches);
        assert_eq!(got, expected);
    }

    #[test]
    fn single_cluster_skew() {
        // Every key identical: one cluster holds the whole relation.
        let r: Relation = (0..2_000u64).map(|i| (42, i)).collect();
        let s: Relation = (0..1_000u64).map(|i| (42, i)).collect();
        let outcome = join(&r, &s, &JoinConfig::default());
        assert_eq!(outcome.total_matches, 2_000 * 1_000);
        assert_eq!(outcome.per_thread[0].parts_processed, 1);
    }

    #[test]
    fn max_width_payloads() {
        let r: Relation = [(u64::MAX, u64::MAX)].into_iter().collect();
        let s: Relation = [(u64::MAX, u64::MAX - 1)].into_iter().collect();
        let config = JoinConfig {
            materialize: true,
            ..Default::default()
        };
        let outcome = join(&r, &s, &config);
        assert_eq!(outcome.total_matches, 1);
        let out = &outcome.per_thread[0].tuples[0];
        assert_eq!(out.key, u64::MAX);
        assert_eq!(out.payload_r, u64::MAX);
        assert_eq!(out.payload_s, u64::MAX - 1);
    }
}
