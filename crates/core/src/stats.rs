//! Stats collection and worker throttling
//!
//! A 1 Hz ticker samples a 60-element ring buffer of per-second completion
//! counts into a rate and an "impulse" (§4.9), while a pure `Throttler`
//! function turns load/swap readings into a dynamic worker cap the
//! scheduler uses to gate dispatch from the ready queue (never to tear down
//! a running worker, per §9).

use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{debug, instrument};

const RING_SIZE: usize = 60;

/// The terminal (or skipped) outcome a finished port is recorded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Success,
    Failed,
    Ignored,
    Skipped,
    Meta,
}

/// A point-in-time view of the build's progress (§3 Stats snapshot).
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub active_workers: usize,
    pub max_workers: usize,
    pub dyn_max_workers: usize,
    pub adjusted_load: f64,
    pub swap_percent: f64,
    pub rate_per_hour: f64,
    pub impulse_per_sec: f64,
    pub elapsed: Duration,
    pub queued: u64,
    pub built: u64,
    pub failed: u64,
    pub ignored: u64,
    pub skipped: u64,
    pub meta: u64,
    pub remaining: i64,
}

struct Inner {
    ring: [u32; RING_SIZE],
    bucket_ptr: usize,
    bucket_start: Instant,
    start_time: Instant,
    built: u64,
    failed: u64,
    ignored: u64,
    skipped: u64,
    meta: u64,
    queued: u64,
    snapshot: StatsSnapshot,
}

/// Collector state behind a single mutex guarding plain data, never held
/// across an await point (§5 shared-resource policy).
pub struct StatsCollector {
    inner: Mutex<Inner>,
}

impl StatsCollector {
    pub fn new(queued: u64, max_workers: usize) -> Self {
        let now = Instant::now();
        StatsCollector {
            inner: Mutex::new(Inner {
                ring: [0; RING_SIZE],
                bucket_ptr: 0,
                bucket_start: now,
                start_time: now,
                built: 0,
                failed: 0,
                ignored: 0,
                skipped: 0,
                meta: 0,
                queued,
                snapshot: StatsSnapshot {
                    queued,
                    max_workers,
                    dyn_max_workers: max_workers,
                    remaining: queued as i64,
                    ..Default::default()
                },
            }),
        }
    }

    /// Advances the ring buffer so its current bucket corresponds to `now`,
    /// zeroing every bucket skipped over a multi-second gap so stale data
    /// cannot leak into the 60-second window.
    fn advance_buckets(inner: &mut Inner, now: Instant) {
        let elapsed_secs = now.saturating_duration_since(inner.bucket_start).as_secs();
        if elapsed_secs == 0 {
            return;
        }
        let steps = elapsed_secs.min(RING_SIZE as u64) as usize;
        for _ in 0..steps {
            inner.bucket_ptr = (inner.bucket_ptr + 1) % RING_SIZE;
            inner.ring[inner.bucket_ptr] = 0;
        }
        inner.bucket_start = now;
    }

    /// Records one port's completion. `Skipped` updates the running total
    /// but does not advance the current bucket — skipped ports are not work
    /// (§4.9, §8 invariant 8).
    #[instrument(skip(self))]
    pub fn record(&self, status: RecordStatus) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        Self::advance_buckets(&mut inner, now);

        match status {
            RecordStatus::Success => {
                inner.built += 1;
                inner.ring[inner.bucket_ptr] += 1;
            }
            RecordStatus::Failed => {
                inner.failed += 1;
                inner.ring[inner.bucket_ptr] += 1;
            }
            RecordStatus::Ignored => {
                inner.ignored += 1;
                inner.ring[inner.bucket_ptr] += 1;
            }
            RecordStatus::Meta => {
                inner.meta += 1;
                inner.ring[inner.bucket_ptr] += 1;
            }
            RecordStatus::Skipped => {
                inner.skipped += 1;
            }
        }
    }

    /// Advances buckets to now, recomputes rate/impulse/remaining, and
    /// returns the new snapshot. Called once per second by the ticker task.
    pub fn tick(&self) -> StatsSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        Self::advance_buckets(&mut inner, now);

        let rate = inner.ring.iter().sum::<u32>() as f64 * 60.0;
        let prev_bucket = (inner.bucket_ptr + RING_SIZE - 1) % RING_SIZE;
        let impulse = inner.ring[prev_bucket] as f64;

        let remaining = inner.queued as i64 - (inner.built + inner.failed + inner.ignored) as i64;

        let snapshot = StatsSnapshot {
            active_workers: inner.snapshot.active_workers,
            max_workers: inner.snapshot.max_workers,
            dyn_max_workers: inner.snapshot.dyn_max_workers,
            adjusted_load: inner.snapshot.adjusted_load,
            swap_percent: inner.snapshot.swap_percent,
            rate_per_hour: rate,
            impulse_per_sec: impulse,
            elapsed: now.saturating_duration_since(inner.start_time),
            queued: inner.queued,
            built: inner.built,
            failed: inner.failed,
            ignored: inner.ignored,
            skipped: inner.skipped,
            meta: inner.meta,
            remaining,
        };
        inner.snapshot = snapshot.clone();
        snapshot
    }

    pub fn set_workers(&self, active: usize, dyn_max: usize, load: f64, swap: f64) {
        let mut inner = self.inner.lock().expect("stats mutex poisoned");
        inner.snapshot.active_workers = active;
        inner.snapshot.dyn_max_workers = dyn_max;
        inner.snapshot.adjusted_load = load;
        inner.snapshot.swap_percent = swap;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.lock().expect("stats mutex poisoned").snapshot.clone()
    }
}

/// Pure function of (max workers, load, swap percent, cpu count) producing
/// `dyn_max` (§4.9). Never tears down a running worker — the scheduler uses
/// this only to gate dispatch from the ready queue (§9).
pub struct Throttler {
    pub disabled: bool,
}

impl Throttler {
    pub fn new(disabled: bool) -> Self {
        Throttler { disabled }
    }

    /// Reads current load average and swap usage via `sysinfo` and computes
    /// `dyn_max` for `max_workers` workers.
    pub fn sample(&self, sys: &System, max_workers: usize) -> usize {
        let cpus = num_cpus::get().max(1);
        let load = System::load_average().one;
        let total_swap = sys.total_swap();
        let swap_percent = if total_swap == 0 {
            0.0
        } else {
            (sys.used_swap() as f64 / total_swap as f64) * 100.0
        };
        self.calculate(max_workers, load, swap_percent, cpus)
    }

    /// The throttling formula itself (§4.9), isolated from `sysinfo` I/O so
    /// it can be unit-tested deterministically.
    pub fn calculate(&self, max_workers: usize, load: f64, swap_percent: f64, cpu_count: usize) -> usize {
        if self.disabled {
            return max_workers;
        }
        if load == 0.0 && swap_percent == 0.0 {
            return max_workers;
        }

        let n = max_workers as f64;
        let c = cpu_count.max(1) as f64;

        let load_cap = if load < 1.5 * c {
            n
        } else if load >= 5.0 * c {
            n / 4.0
        } else {
            interpolate(load, 1.5 * c, 5.0 * c, n, n / 4.0)
        };

        let swap_cap = if swap_percent < 10.0 {
            n
        } else if swap_percent >= 40.0 {
            n / 4.0
        } else {
            interpolate(swap_percent, 10.0, 40.0, n, n / 4.0)
        };

        (load_cap.min(swap_cap).floor() as usize).max(1)
    }
}

/// Linear interpolation of `value` within `[lo, hi]`, mapping to `[from, to]`.
fn interpolate(value: f64, lo: f64, hi: f64, from: f64, to: f64) -> f64 {
    if hi <= lo {
        return to;
    }
    let t = ((value - lo) / (hi - lo)).clamp(0.0, 1.0);
    from + (to - from) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_does_not_advance_ring_but_updates_total() {
        let collector = StatsCollector::new(10, 4);
        collector.record(RecordStatus::Skipped);
        let snap = collector.tick();
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.rate_per_hour, 0.0);
    }

    #[test]
    fn success_advances_ring() {
        let collector = StatsCollector::new(10, 4);
        collector.record(RecordStatus::Success);
        let snap = collector.tick();
        assert_eq!(snap.built, 1);
        assert_eq!(snap.rate_per_hour, 60.0);
    }

    #[test]
    fn remaining_is_queued_minus_built_and_failed() {
        let collector = StatsCollector::new(10, 4);
        collector.record(RecordStatus::Success);
        collector.record(RecordStatus::Failed);
        let snap = collector.tick();
        assert_eq!(snap.remaining, 8);
    }

    #[test]
    fn remaining_also_subtracts_ignored() {
        let collector = StatsCollector::new(10, 4);
        collector.record(RecordStatus::Success);
        collector.record(RecordStatus::Failed);
        collector.record(RecordStatus::Ignored);
        let snap = collector.tick();
        assert_eq!(snap.remaining, 7);
    }

    #[test]
    fn throttler_disabled_returns_max_unconditionally() {
        let t = Throttler::new(true);
        assert_eq!(t.calculate(8, 999.0, 99.0, 4), 8);
    }

    #[test]
    fn throttler_zero_metrics_assumed_unavailable() {
        let t = Throttler::new(false);
        assert_eq!(t.calculate(8, 0.0, 0.0, 4), 8);
    }

    #[test]
    fn throttler_is_bounded_in_one_to_n() {
        let t = Throttler::new(false);
        let result = t.calculate(8, 100.0, 100.0, 4);
        assert!((1..=8).contains(&result));
    }

    #[test]
    fn throttler_low_load_keeps_full_cap() {
        let t = Throttler::new(false);
        assert_eq!(t.calculate(8, 1.0 * 4.0, 0.0, 4), 8);
    }

    #[test]
    fn throttler_high_load_drops_to_quarter() {
        let t = Throttler::new(false);
        assert_eq!(t.calculate(8, 5.0 * 4.0, 0.0, 4), 2);
    }

    #[test]
    fn throttler_monotone_nonincreasing_in_load() {
        let t = Throttler::new(false);
        let low = t.calculate(8, 2.0 * 4.0, 0.0, 4);
        let high = t.calculate(8, 4.0 * 4.0, 0.0, 4);
        assert!(high <= low);
    }
}
