//! Cache-conscious equi-join operators for multicore CPUs.
//!
//! Four operator variants share one contract, `join(R, S, config)`:
//! a bucket-chained hash join ([`bcht`]), a single-threaded radix join
//! and its pluggable framework ([`radix`]), a parallel radix join
//! ([`prj`]), and an index nested-loop example over an ordered multimap
//! ([`inl`]). Every variant returns a [`JoinOutcome`] with the match
//! count, per-phase timings, and optionally materialized output.

pub mod bcht;
pub mod clock;
pub mod inl;
pub mod prj;
pub mod radix;
pub mod rel;

pub use rel::{Key, Payload, Relation, Tuple};

use tracing::info;

/// Operator configuration. Single-threaded variants ignore `nthreads`
/// and report one worker in the outcome.
#[derive(Clone, Debug)]
pub struct JoinConfig {
    /// Requested worker count, at least 1.
    pub nthreads: usize,
    /// Emit matched `(key, payload_r, payload_s)` records instead of
    /// counting alone.
    pub materialize: bool,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            nthreads: 1,
            materialize: false,
        }
    }
}

/// One materialized match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputTuple {
    pub key: Key,
    pub payload_r: Payload,
    pub payload_s: Payload,
}

/// Where a sub-join delivers matched records.
///
/// The discard sink turns the materialization path into a no-op, so the
/// counting and materializing joins share one implementation.
pub trait OutputSink {
    fn push(&mut self, key: Key, payload_r: Payload, payload_s: Payload);
}

/// Sink that drops every record.
pub struct Discard;

impl OutputSink for Discard {
    #[inline]
    fn push(&mut self, _key: Key, _payload_r: Payload, _payload_s: Payload) {}
}

impl OutputSink for Vec<OutputTuple> {
    #[inline]
    fn push(&mut self, key: Key, payload_r: Payload, payload_s: Payload) {
        self.push(OutputTuple {
            key,
            payload_r,
            payload_s,
        });
    }
}

/// Per-run statistics of one completed join.
#[derive(Clone, Debug, Default)]
pub struct JoinStats {
    pub matches: u64,
    pub input_tuples_r: u64,
    pub input_tuples_s: u64,
    /// Build or partition phase, in cycles.
    pub phase1_cycles: u64,
    /// Probe or join phase, in cycles.
    pub phase2_cycles: u64,
    pub total_cycles: u64,
    /// Wall-clock duration in microseconds.
    pub total_usec: u64,
    #[cfg(feature = "hw-counters")]
    pub hw: Option<clock::HwReport>,
}

/// What one worker contributed.
#[derive(Debug, Default)]
pub struct ThreadResult {
    pub thread_id: usize,
    pub matches: u64,
    /// Cluster pairs this worker joined.
    pub parts_processed: u32,
    /// Materialized records; empty unless requested.
    pub tuples: Vec<OutputTuple>,
}

/// Result of one join run.
#[derive(Debug, Default)]
pub struct JoinOutcome {
    pub total_matches: u64,
    pub nthreads: usize,
    pub stats: JoinStats,
    pub per_thread: Vec<ThreadResult>,
}

/// One summary event per completed join.
pub(crate) fn log_join(name: &str, config: &JoinConfig, stats: &JoinStats) {
    info!(
        join = name,
        nthreads = config.nthreads,
        materialize = config.materialize,
        tuples_r = stats.input_tuples_r,
        tuples_s = stats.input_tuples_s,
        matches = stats.matches,
        phase1_cycles = stats.phase1_cycles,
        phase2_cycles = stats.phase2_cycles,
        total_cycles = stats.total_cycles,
        total_usec = stats.total_usec,
        "join complete"
    );
}


#[cfg(test)]
mod tests {
    use super::testutil::{naive_count, seeded_relation};
    use super::*;

    fn all_variants(r: &Relation, s: &Relation, config: &JoinConfig) -> Vec<(&'static str, u64)> {
        vec![
            ("bcht", bcht::join(r, s, config).total_matches),
            ("radix", radix::join(r, s, config).total_matches),
            (
                "radix_with",
                radix::join_with(r, s, config, radix::chained_sub_join).total_matches,
            ),
            ("prj", prj::join(r, s, config).total_matches),
            ("inl", inl::join(r, s, config).total_matches),
        ]
    }

    #[test]
    fn variants_agree_on_literal_input() {
        let r: Relation = [(1, 0xA), (2, 0xB), (3, 0xC)].into_iter().collect();
        let s: Relation = [(2, 0x1), (2, 0x2), (4, 0x3)].into_iter().collect();
        let config = JoinConfig {
            nthreads: 2,
            materialize: false,
        };
        for (name, matches) in all_variants(&r, &s, &config) {
            assert_eq!(matches, 2, "{name}");
        }
    }

    #[test]
    fn variants_agree_on_uniform_workload() {
        let r = seeded_relation(100_000, 1 << 17, 1001);
        let s = seeded_relation(200_000, 1 << 17, 1002);
        let expected = naive_count(&r, &s);
        assert!(expected > 0);

        let config = JoinConfig {
            nthreads: 4,
            materialize: false,
        };
        for (name, matches) in all_variants(&r, &s, &config) {
            assert_eq!(matches, expected, "{name}");
        }
    }

    #[test]
    fn empty_inputs_yield_well_formed_outcomes() {
        let empty = Relation::new(Vec::new());
        let s: Relation = [(1, 0x1)].into_iter().collect();
        let config = JoinConfig::default();

        for (name, matches) in all_variants(&empty, &s, &config) {
            assert_eq!(matches, 0, "{name}");
        }

        let outcome = prj::join(&empty, &s, &config);
        assert_eq!(outcome.stats.input_tuples_r, 0);
        assert_eq!(outcome.stats.input_tuples_s, 1);
        assert_eq!(outcome.nthreads, 1);
    }

    #[test]
    fn matches_grow_by_multiplicity_product() {
        let mut base: Vec<(Key, Payload)> = (0..5_000u64).map(|i| (i % 997, i)).collect();
        let r_base: Relation = base.iter().copied().collect();
        let s_base: Relation = base.iter().copied().collect();
        let before = naive_count(&r_base, &s_base);

        // A key outside the existing space, twice in R and thrice in S.
        let fresh = 1u64 << 40;
        let r: Relation = base
            .iter()
            .copied()
            .chain([(fresh, 1), (fresh, 2)])
            .collect();
        base.extend([(fresh, 3), (fresh, 4), (fresh, 5)]);
        let s: Relation = base.into_iter().collect();

        let config = JoinConfig::default();
        assert_eq!(radix::join(&r, &s, &config).total_matches, before + 6);
        assert_eq!(bcht::join(&r, &s, &config).total_matches, before + 6);
    }

    #[test]
    fn single_threaded_variants_report_one_worker() {
        let r: Relation = [(1, 1)].into_iter().collect();
        let s: Relation = [(1, 2)].into_iter().collect();
        let config = JoinConfig {
            nthreads: 8,
            materialize: false,
        };
        assert_eq!(bcht::join(&r, &s, &config).nthreads, 1);
        assert_eq!(radix::join(&r, &s, &config).nthreads, 1);
        assert_eq!(prj::join(&r, &s, &config).nthreads, 8);
    }

    #[test]
    fn stats_carry_phase_timings() {
        let r = seeded_relation(10_000, 1 << 10, 7);
        let s = seeded_relation(10_000, 1 << 10, 8);
        let outcome = radix::join(&r, &s, &JoinConfig::default());
        let stats = &outcome.stats;
        assert_eq!(stats.input_tuples_r, 10_000);
        assert_eq!(stats.input_tuples_s, 10_000);
        assert!(stats.total_cycles >= stats.phase1_cycles);
        assert_eq!(
            stats.total_cycles,
            stats.phase1_cycles + stats.phase2_cycles
        );
    }
}
