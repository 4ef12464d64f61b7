//! Outcome counters for znode calls.
//!
//! Only the transport outcome of a call is counted: a call that reaches the
//! ensemble and comes back with `NoNode` is a success here. Connection loss,
//! timeouts and session expiry count as failures. Used for diagnostics; no
//! operation consults it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Failure streak at which calls are reported as failing.
pub const DEFAULT_FAILURE_STREAK: u32 = 3;

/// How znode calls have been going lately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    /// The last call reached the ensemble.
    Healthy,
    /// The last call failed, the streak is still short.
    Degraded,
    /// The failure streak reached the threshold.
    Unhealthy,
    /// No call finished yet.
    #[default]
    Unknown,
}

/// Snapshot of [`CallHealth`].
#[derive(Debug, Clone, Default)]
pub struct HealthStats {
    /// Derived status.
    pub status: HealthStatus,
    /// Calls that reached the ensemble.
    pub success_count: u64,
    /// Calls lost in transport.
    pub failure_count: u64,
    /// Current failure streak.
    pub consecutive_failures: u32,
    /// Mean round trip of successful calls.
    pub avg_latency_ms: u64,
    /// Slowest successful call.
    pub max_latency_ms: u64,
}

/// Call counters shared by every session of a manager.
#[derive(Debug)]
pub struct CallHealth {
    failure_streak: u32,
    consecutive_failures: AtomicU32,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    total_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
}

impl CallHealth {
    /// Counters reporting `Unhealthy` after [`DEFAULT_FAILURE_STREAK`] failed
    /// calls in a row.
    pub fn new() -> Self {
        Self::with_failure_streak(DEFAULT_FAILURE_STREAK)
    }

    /// Counters with a custom failure streak (at least 1).
    pub fn with_failure_streak(failure_streak: u32) -> Self {
        Self {
            failure_streak: failure_streak.max(1),
            consecutive_failures: AtomicU32::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            max_latency_ms: AtomicU64::new(0),
        }
    }

    /// Counts a call that reached the ensemble.
    pub fn record_success(&self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Counts a call lost in transport.
    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Status derived from the current streak.
    pub fn status(&self) -> HealthStatus {
        let streak = self.consecutive_failures.load(Ordering::Relaxed);
        if streak >= self.failure_streak {
            HealthStatus::Unhealthy
        } else if streak > 0 {
            HealthStatus::Degraded
        } else if self.success_count() > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        }
    }

    /// Calls that reached the ensemble.
    pub fn success_count(&self) -> u64 {
        self.success_count.load(Ordering::Relaxed)
    }

    /// Calls lost in transport.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Current counters.
    pub fn stats(&self) -> HealthStats {
        let successes = self.success_count();
        let avg_latency_ms = match successes {
            0 => 0,
            n => self.total_latency_ms.load(Ordering::Relaxed) / n,
        };
        HealthStats {
            status: self.status(),
            success_count: successes,
            failure_count: self.failure_count(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            avg_latency_ms,
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for CallHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_unknown() {
        let health = CallHealth::new();
        assert_eq!(health.status(), HealthStatus::Unknown);
        assert_eq!(health.stats().avg_latency_ms, 0);
    }

    #[test]
    fn test_failure_streak() {
        let health = CallHealth::new();
        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Degraded);
        health.record_failure();
        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Unhealthy);
        assert_eq!(health.stats().consecutive_failures, 3);
        assert_eq!(health.failure_count(), 3);
    }

    #[test]
    fn test_success_ends_streak() {
        let health = CallHealth::with_failure_streak(1);
        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Unhealthy);
        health.record_success(Duration::from_millis(4));
        assert_eq!(health.status(), HealthStatus::Healthy);
        assert_eq!(health.stats().consecutive_failures, 0);
        assert_eq!(health.failure_count(), 1);
    }

    #[test]
    fn test_latency() {
        let health = CallHealth::new();
        health.record_success(Duration::from_millis(10));
        health.record_success(Duration::from_millis(30));
        let stats = health.stats();
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.avg_latency_ms, 20);
        assert_eq!(stats.max_latency_ms, 30);
    }
}
