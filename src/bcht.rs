//! Bucket-chained hash join: single-threaded build and probe over a
//! cache-line-sized bucket table with overflow chaining.
//!
//! The build side is hashed by masking the low-order key bits, two tuples
//! per primary bucket. Collisions past that spill into an overflow pool
//! indexed by 1-based bucket number, so a primary bucket plus its chain
//! stay reachable through a single integer. Counts only, no output
//! materialization.

use crate::clock;
use crate::rel::{Key, Relation, Tuple, CACHE_LINE_SIZE};
use crate::{log_join, JoinConfig, JoinOutcome, JoinStats};

const JOIN_NAME: &str = "bucket_chain_hj";

/// Tuples per bucket before chaining kicks in.
pub const BUCKET_SIZE: usize = 2;

#[inline]
fn hash(key: Key, mask: u64, skip: u32) -> u64 {
    (key & mask) >> skip
}

/// One hash bucket, exactly one cache line.
#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct Bucket {
    /// Reserved for concurrent builds; never taken on the
    /// single-threaded path but kept so the bucket layout holds.
    #[allow(dead_code)]
    latch: u32,
    count: u32,
    tuples: [Tuple; BUCKET_SIZE],
    /// 1-based index into the overflow pool, 0 terminates the chain.
    next: u32,
}

impl Bucket {
    const EMPTY: Bucket = Bucket {
        latch: 0,
        count: 0,
        tuples: [Tuple::new(0, 0); BUCKET_SIZE],
        next: 0,
    };
}

const _: () = assert!(std::mem::size_of::<Bucket>() == CACHE_LINE_SIZE);

struct HashTable {
    buckets: Vec<Bucket>,
    /// Overflow bucket pool; `next` fields index into it 1-based.
    overflow: Vec<Bucket>,
    hash_mask: u64,
    skip_bits: u32,
}

impl HashTable {
    /// Rounds the requested bucket count up to a power of two (at least
    /// one bucket, so empty build sides stay probeable).
    fn with_buckets(nbuckets: usize) -> Self {
        let num_buckets = nbuckets.next_power_of_two();
        let skip_bits = 0;
        Self {
            buckets: vec![Bucket::EMPTY; num_buckets],
            overflow: Vec::new(),
            hash_mask: ((num_buckets - 1) as u64) << skip_bits,
            skip_bits,
        }
    }

    fn build(&mut self, rel: &[Tuple]) {
        for &t in rel {
            let idx = hash(t.key, self.hash_mask, self.skip_bits) as usize;
            let (count, nxt) = {
                let b = &self.buckets[idx];
                (b.count as usize, b.next)
            };

            if count == BUCKET_SIZE {
                if nxt == 0 || self.overflow[nxt as usize - 1].count as usize == BUCKET_SIZE {
                    // Splice a fresh overflow bucket right behind the
                    // primary so it stays the hot insertion target.
                    let mut b = Bucket::EMPTY;
                    b.count = 1;
                    b.tuples[0] = t;
                    b.next = nxt;
                    self.overflow.push(b);
                    self.buckets[idx].next = self.overflow.len() as u32;
                } else {
                    let b = &mut self.overflow[nxt as usize - 1];
                    b.tuples[b.count as usize] = t;
                    b.count += 1;
                }
            } else {
                let b = &mut self.buckets[idx];
                b.tuples[count] = t;
                b.count += 1;
            }
        }
    }

    /// Counts ordered matching pairs for the probe relation. Duplicate
    /// keys on either side multiply the count.
    fn probe(&self, rel: &[Tuple]) -> u64 {
        let mut matches = 0u64;

        for s in rel {
            let idx = hash(s.key, self.hash_mask, self.skip_bits) as usize;
            let mut b = &self.buckets[idx];

            loop {
                for t in &b.tuples[..b.count as usize] {
                    if t.key == s.key {
                        matches += 1;
                    }
                }
                if b.next == 0 {
                    break;
                }
                b = &self.overflow[b.next as usize - 1];
            }
        }

        matches
    }
}

/// Single-threaded bucket-chained hash join. Forces one worker no matter
/// what the configuration requests.
pub fn join(rel_r: &Relation, rel_s: &Relation, config: &JoinConfig) -> JoinOutcome {
    let mut ht = HashTable::with_buckets(rel_r.len() / BUCKET_SIZE);

    let start = clock::system_micros();
    let mut timer_total = 0u64;
    clock::start_timer(&mut timer_total);
    let mut timer_build = timer_total;

    #[cfg(feature = "hw-counters")]
    let mut hw = clock::HwReport::default();
    #[cfg(feature = "hw-counters")]
    clock::mark("build");

    ht.build(rel_r.tuples());

    #[cfg(feature = "hw-counters")]
    {
        hw.phase1 = clock::snapshot(0);
    }

    clock::stop_timer(&mut timer_build);

    #[cfg(feature = "hw-counters")]
    clock::mark("probe");

    let matches = ht.probe(rel_s.tuples());

    #[cfg(feature = "hw-counters")]
    {
        hw.phase2 = clock::snapshot(0);
        hw.total = clock::snapshot(1);
    }

    let end = clock::system_micros();
    clock::stop_timer(&mut timer_total);

    let stats = JoinStats {
        matches,
        input_tuples_r: rel_r.len() as u64,
        input_tuples_s: rel_s.len() as u64,
        phase1_cycles: timer_build,
        phase2_cycles: timer_total - timer_build,
        total_cycles: timer_total,
        total_usec: end - start,
        ..Default::default()
    };
    #[cfg(feature = "hw-counters")]
    let stats = JoinStats {
        hw: Some(hw),
        ..stats
    };

    log_join(JOIN_NAME, config, &stats);

    JoinOutcome {
        total_matches: matches,
        nthreads: 1,
        stats,
        per_thread: Vec::new(),
    }
}
