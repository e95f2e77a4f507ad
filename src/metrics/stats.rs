use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Capacity of each latency ring.
const RING_SIZE: usize = 1024;

/// Fixed-size ring of duration samples (milliseconds). Oldest samples are
/// overwritten once the ring fills.
pub struct LatencyRing {
    inner: Mutex<RingInner>,
}

struct RingInner {
    samples: Vec<f64>,
    next: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RingSnapshot {
    pub count: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub avg_ms: f64,
}

impl Default for LatencyRing {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RingInner {
                samples: Vec::with_capacity(RING_SIZE),
                next: 0,
            }),
        }
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    // index = ceil(q * N) - 1, clamped into range
    let idx = ((q * sorted.len() as f64).ceil() as usize).max(1) - 1;
    sorted[idx.min(sorted.len() - 1)]
}

impl LatencyRing {
    pub fn record(&self, millis: f64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.samples.len() < RING_SIZE {
            inner.samples.push(millis);
        } else {
            let next = inner.next;
            inner.samples[next] = millis;
        }
        inner.next = (inner.next + 1) % RING_SIZE;
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut sorted = inner.samples.clone();
        drop(inner);
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = sorted.len();
        let avg = if count == 0 {
            0.0
        } else {
            sorted.iter().sum::<f64>() / count as f64
        };
        RingSnapshot {
            count,
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
            avg_ms: avg,
        }
    }
}

/// Process-wide counters and latency windows backing the `/stats` snapshot.
/// Counters are monotonic; derived rates are computed at snapshot time.
pub struct RuntimeStats {
    started_at: Instant,

    pub convert: LatencyRing,
    pub job_run: LatencyRing,
    pub deepcrawl: LatencyRing,

    pub requests_total: AtomicU64,
    pub conversions_total: AtomicU64,
    pub conversion_failures: AtomicU64,
    pub rate_limited: AtomicU64,
    pub jobs_created: AtomicU64,
    pub jobs_executed: AtomicU64,
    pub job_retry_attempts: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub requests_total: u64,
    pub requests_per_minute: f64,
    pub conversions_total: u64,
    pub conversion_failures: u64,
    pub conversion_success_rate: f64,
    pub jobs_created: u64,
    pub jobs_executed: u64,
    pub job_retry_attempts: u64,
    pub job_retry_rate: f64,
    pub rate_limited: u64,
    pub backlog: u64,
    pub convert: RingSnapshot,
    pub job_run: RingSnapshot,
    pub deepcrawl: RingSnapshot,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            convert: LatencyRing::default(),
            job_run: LatencyRing::default(),
            deepcrawl: LatencyRing::default(),
            requests_total: AtomicU64::new(0),
            conversions_total: AtomicU64::new(0),
            conversion_failures: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            jobs_created: AtomicU64::new(0),
            jobs_executed: AtomicU64::new(0),
            job_retry_attempts: AtomicU64::new(0),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Build the derived snapshot. `browser_queued` comes from the render
    /// gate; job backlog is created minus executed.
    pub fn snapshot(&self, browser_queued: usize) -> StatsSnapshot {
        let uptime = self.started_at.elapsed();
        let requests = self.requests_total.load(Ordering::Relaxed);
        let conversions = self.conversions_total.load(Ordering::Relaxed);
        let failures = self.conversion_failures.load(Ordering::Relaxed);
        let created = self.jobs_created.load(Ordering::Relaxed);
        let executed = self.jobs_executed.load(Ordering::Relaxed);
        let retries = self.job_retry_attempts.load(Ordering::Relaxed);

        let minutes = (uptime.as_secs_f64() / 60.0).max(1.0 / 60.0);
        let successes = conversions.saturating_sub(failures);
        let attempted = successes + failures;

        StatsSnapshot {
            uptime_secs: uptime.as_secs(),
            requests_total: requests,
            requests_per_minute: requests as f64 / minutes,
            conversions_total: conversions,
            conversion_failures: failures,
            conversion_success_rate: if attempted == 0 {
                1.0
            } else {
                successes as f64 / attempted as f64
            },
            jobs_created: created,
            jobs_executed: executed,
            job_retry_attempts: retries,
            job_retry_rate: if executed == 0 {
                0.0
            } else {
                retries as f64 / executed as f64
            },
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            backlog: browser_queued as u64 + created.saturating_sub(executed),
            convert: self.convert.snapshot(),
            job_run: self.job_run.snapshot(),
            deepcrawl: self.deepcrawl.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_definition() {
        // Property: over N samples, p50 = sorted[ceil(0.5N)-1],
        // p95 = sorted[ceil(0.95N)-1].
        let ring = LatencyRing::default();
        for v in 1..=100 {
            ring.record(v as f64);
        }
        let snap = ring.snapshot();
        assert_eq!(snap.count, 100);
        assert_eq!(snap.p50_ms, 50.0);
        assert_eq!(snap.p95_ms, 95.0);
        assert_eq!(snap.p99_ms, 99.0);

        let ring = LatencyRing::default();
        for v in [5.0, 1.0, 3.0] {
            ring.record(v);
        }
        let snap = ring.snapshot();
        // sorted = [1,3,5]; ceil(1.5)-1 = 1 → 3.0; ceil(2.85)-1 = 2 → 5.0
        assert_eq!(snap.p50_ms, 3.0);
        assert_eq!(snap.p95_ms, 5.0);
    }

    #[test]
    fn test_ring_overwrites_beyond_capacity() {
        let ring = LatencyRing::default();
        for v in 0..1500 {
            ring.record(v as f64);
        }
        let snap = ring.snapshot();
        assert_eq!(snap.count, 1024);
        // Oldest 476 samples were overwritten; min retained is 476.
        assert!(snap.p50_ms >= 476.0);
    }

    #[test]
    fn test_empty_ring_snapshot() {
        let snap = LatencyRing::default().snapshot();
        assert_eq!(snap.count, 0);
        assert_eq!(snap.p50_ms, 0.0);
        assert_eq!(snap.avg_ms, 0.0);
    }

    #[test]
    fn test_snapshot_derivations() {
        let stats = RuntimeStats::new();
        RuntimeStats::add(&stats.requests_total, 10);
        RuntimeStats::add(&stats.conversions_total, 8);
        RuntimeStats::add(&stats.conversion_failures, 2);
        RuntimeStats::add(&stats.jobs_created, 5);
        RuntimeStats::add(&stats.jobs_executed, 3);
        RuntimeStats::add(&stats.job_retry_attempts, 6);

        let snap = stats.snapshot(4);
        assert_eq!(snap.requests_total, 10);
        assert!((snap.conversion_success_rate - 0.75).abs() < 1e-9);
        assert!((snap.job_retry_rate - 2.0).abs() < 1e-9);
        // backlog = browser queued + (created - executed)
        assert_eq!(snap.backlog, 4 + 2);
        assert!(snap.requests_per_minute > 0.0);
    }
}
