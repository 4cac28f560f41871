//! Running commit counter with a per-connection rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Commits counted since the current connection was established.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    /// Commits since the connection was established
    pub count: u64,
    /// Time since the connection was established
    pub elapsed: Duration,
}

impl ThroughputSample {
    /// Orders committed per second.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.count as f64 / secs } else { 0.0 }
    }
}

/// Lock-free commit counter shared by every in-flight delivery.
///
/// Timestamps are stored as microseconds since `epoch` so that the
/// connection start can be swapped atomically.
#[derive(Debug)]
pub struct ThroughputMeter {
    epoch: Instant,
    interval: u64,
    connected_at_us: AtomicU64,
    since_connect: AtomicU64,
    total: AtomicU64,
}

impl ThroughputMeter {
    /// A meter that yields a sample every `interval` commits (never when 0).
    #[must_use]
    pub fn new(interval: u64) -> Self {
        Self {
            epoch: Instant::now(),
            interval,
            connected_at_us: AtomicU64::new(0),
            since_connect: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn now_us(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    /// Restarts the per-connection count.
    pub fn reset(&self) {
        self.connected_at_us.store(self.now_us(), Ordering::SeqCst);
        self.since_connect.store(0, Ordering::SeqCst);
    }

    /// Counts one commit; returns a sample on every `interval`-th commit.
    pub fn record_commit(&self) -> Option<ThroughputSample> {
        self.total.fetch_add(1, Ordering::Relaxed);
        let count = self.since_connect.fetch_add(1, Ordering::SeqCst) + 1;
        (self.interval > 0 && count % self.interval == 0).then(|| self.sample_with(count))
    }

    /// Current per-connection sample.
    #[must_use]
    pub fn sample(&self) -> ThroughputSample {
        self.sample_with(self.since_connect.load(Ordering::SeqCst))
    }

    fn sample_with(&self, count: u64) -> ThroughputSample {
        let since = self.connected_at_us.load(Ordering::SeqCst);
        ThroughputSample {
            count,
            elapsed: Duration::from_micros(self.now_us().saturating_sub(since)),
        }
    }

    /// Commits counted over the meter's lifetime.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Time since the meter was created.
    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.epoch.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_every_interval() {
        let meter = ThroughputMeter::new(3);
        meter.reset();

        let samples: Vec<_> = (0..7).filter_map(|_| meter.record_commit()).collect();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].count, 3);
        assert_eq!(samples[1].count, 6);
        assert_eq!(meter.total(), 7);
    }

    #[test]
    fn reset_restarts_connection_count_but_not_total() {
        let meter = ThroughputMeter::new(1000);
        meter.record_commit();
        meter.record_commit();
        meter.reset();
        meter.record_commit();

        assert_eq!(meter.sample().count, 1);
        assert_eq!(meter.total(), 3);
    }

    #[test]
    fn zero_interval_never_samples() {
        let meter = ThroughputMeter::new(0);
        assert!((0..10).all(|_| meter.record_commit().is_none()));
    }

    #[test]
    fn rate_is_count_over_elapsed() {
        let sample = ThroughputSample {
            count: 500,
            elapsed: Duration::from_millis(250),
        };
        assert!((sample.per_second() - 2000.0).abs() < f64::EPSILON);

        let instant = ThroughputSample {
            count: 5,
            elapsed: Duration::ZERO,
        };
        assert!(instant.per_second().abs() < f64::EPSILON);
    }
}
