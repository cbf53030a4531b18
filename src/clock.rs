//! Timing collaborators: monotonic micros, nestable cycle-timer pairs,
//! and the optional hardware-counter capability.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic wall-clock microseconds against a process-local epoch.
pub fn system_micros() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Raw cycle counter. TSC where available, monotonic nanoseconds elsewhere.
#[inline]
pub fn cycles() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Arms a timer slot. Pair with [`stop_timer`] on the same slot; pairs
/// nest across slots.
#[inline]
pub fn start_timer(slot: &mut u64) {
    *slot = cycles();
}

/// Replaces the armed slot with the elapsed cycle delta.
#[inline]
pub fn stop_timer(slot: &mut u64) {
    *slot = cycles() - *slot;
}

#[cfg(feature = "hw-counters")]
pub use counters::*;

#[cfg(feature = "hw-counters")]
mod counters {
    use std::sync::OnceLock;

    /// One hardware-counter snapshot.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct HwCounters {
        pub cycles: u64,
        pub instructions: u64,
        pub l2_misses: u64,
        pub l3_misses: u64,
    }

    /// Per-join counter report: one snapshot per phase plus the total.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct HwReport {
        pub phase1: HwCounters,
        pub phase2: HwCounters,
        pub total: HwCounters,
    }

    /// Host-installed collector. `mark` resets the running window under a
    /// label; `snapshot(0)` reads the window, `snapshot(1)` the run total.
    pub trait CounterSource: Send + Sync {
        fn mark(&self, label: &str);
        fn snapshot(&self, slot: u32) -> HwCounters;
    }

    static SOURCE: OnceLock<Box<dyn CounterSource>> = OnceLock::new();

    /// Installs the process-wide counter source. First caller wins.
    pub fn install_counter_source(source: Box<dyn CounterSource>) {
        let _ = SOURCE.set(source);
    }

    pub(crate) fn mark(label: &str) {
        if let Some(s) = SOURCE.get() {
            s.mark(label);
        }
    }

    pub(crate) fn snapshot(slot: u32) -> HwCounters {
        SOURCE
            .get()
            .map(|s| s.snapshot(slot))
            .unwrap_or_default()
    }
}
