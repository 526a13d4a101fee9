//! Tunable timings for the coherence controller.
//!
//! The original implementation hard-codes these as magic numbers scattered
//! through `controller.py`. Pulling them into one struct keeps the behavior
//! identical for default callers while letting tests shrink the windows so
//! the suite doesn't spend real wall-clock seconds settling and polling.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Timings {
    /// Grace period after a miss/miss-mv is first considered, letting
    /// in-flight peer advertisements land before we snapshot `peers`.
    pub settle_delay: Duration,
    /// How long a `StoreInfo` can go un-refreshed before we re-advertise our
    /// own presence in response (spec §4.2 discovery rule).
    pub responsiveness_window: Duration,
    /// How long a peer can go un-refreshed before the periodic sweep evicts it.
    pub staleness_window: Duration,
    /// Period of the background presence-advertisement task.
    pub advertise_interval: Duration,
    /// Base poll interval for `resolve`'s retry loop (overridable per call).
    pub resolve_base_interval: Duration,
    /// Backoff step added per retry in `resolve`'s loop.
    pub resolve_backoff_step: Duration,
    /// Jitter sleep applied before answering a wildcard miss, expressed as
    /// the unit (25ms) and an exclusive-upper-bound multiplier range handed
    /// to `rand::Rng::gen_range`; `(1, 76)` yields multipliers in `1..=75`,
    /// matching the original's `random.randint(1, 75)`.
    pub jitter_unit: Duration,
    pub jitter_multiplier_range: (u32, u32),
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            settle_delay: Duration::from_millis(450),
            responsiveness_window: Duration::from_secs(4),
            staleness_window: Duration::from_secs(7),
            advertise_interval: Duration::from_millis(3500),
            resolve_base_interval: Duration::from_millis(15),
            resolve_backoff_step: Duration::from_millis(15),
            jitter_unit: Duration::from_millis(25),
            jitter_multiplier_range: (1, 76),
        }
    }
}

impl Timings {
    /// Windows scaled down for fast, deterministic tests. Keeps the same
    /// *ratios* between settle/responsiveness/staleness/advertise so the
    /// state machine exercises the same transitions, just sooner.
    #[cfg(any(test, feature = "test-timings"))]
    pub fn fast() -> Self {
        Timings {
            settle_delay: Duration::from_millis(20),
            responsiveness_window: Duration::from_millis(80),
            staleness_window: Duration::from_millis(140),
            advertise_interval: Duration::from_millis(50),
            resolve_base_interval: Duration::from_millis(2),
            resolve_backoff_step: Duration::from_millis(1),
            jitter_unit: Duration::from_millis(1),
            jitter_multiplier_range: (1, 5),
        }
    }
}
