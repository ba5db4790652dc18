//! Rolling per-binding counters
//!
//! In-flight and totals are plain atomics. The latency EWMA has a single
//! writer per binding (the `release` caller); readers may observe a
//! slightly stale value.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Smoothing factor for the latency average
const EWMA_ALPHA: f64 = 0.3;

/// Live counters for one binding
#[derive(Debug, Default)]
pub struct BindingMetrics {
    in_flight: AtomicU32,
    total: AtomicU64,
    failures: AtomicU64,
    /// f64 bit pattern; 0 means no sample yet
    latency_ewma: AtomicU64,
}

impl BindingMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests currently pinned to this binding
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Note a selection
    pub fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Note a release; saturates at zero
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Note a failed request
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a latency sample into the EWMA
    pub fn record_latency(&self, latency: Duration) {
        let sample = latency.as_secs_f64() * 1000.0;
        let current = self.latency_ewma.load(Ordering::Relaxed);
        let next = if current == 0 {
            sample
        } else {
            let previous = f64::from_bits(current);
            EWMA_ALPHA.mul_add(sample, (1.0 - EWMA_ALPHA) * previous)
        };
        self.latency_ewma.store(next.to_bits(), Ordering::Relaxed);
    }

    /// Smoothed latency in milliseconds, if any sample has landed
    pub fn avg_latency_ms(&self) -> Option<f64> {
        match self.latency_ewma.load(Ordering::Relaxed) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    /// Fraction of requests that completed successfully
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = 1.0 - self.failures.load(Ordering::Relaxed) as f64 / total as f64;
        Some(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_balances() {
        let m = BindingMetrics::new();
        m.acquire();
        m.acquire();
        assert_eq!(m.in_flight(), 2);
        m.release();
        m.release();
        assert_eq!(m.in_flight(), 0);
        // Extra release saturates instead of wrapping
        m.release();
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn first_sample_seeds_the_ewma() {
        let m = BindingMetrics::new();
        assert_eq!(m.avg_latency_ms(), None);
        m.record_latency(Duration::from_millis(100));
        assert!((m.avg_latency_ms().unwrap() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn ewma_moves_toward_new_samples() {
        let m = BindingMetrics::new();
        m.record_latency(Duration::from_millis(100));
        m.record_latency(Duration::from_millis(200));
        // 0.3 * 200 + 0.7 * 100 = 130
        assert!((m.avg_latency_ms().unwrap() - 130.0).abs() < 0.01);
    }

    #[test]
    fn success_rate_reflects_failures() {
        let m = BindingMetrics::new();
        for _ in 0..4 {
            m.acquire();
            m.release();
        }
        m.record_failure();
        assert!((m.success_rate().unwrap() - 0.75).abs() < f64::EPSILON);
    }
}
