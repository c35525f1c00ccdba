//! Per-call latency and coarse error-class bookkeeping (design spec §4.2).
//!
//! Deliberately lighter than a percentile-tracking histogram: a running
//! count + total duration per error class, guarded by `parking_lot::Mutex`.
//! This is not a metrics-export subsystem — no Prometheus text format, no
//! label cardinality concerns, just enough to answer "is the cloud API
//! healthy" from logs or an ad-hoc dump.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Coarse classification of a Cloud Adapter call outcome (design spec
/// §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Ok,
    Throttled,
    NotFound,
    Conflict,
    ServerError,
    Network,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Throttled => "throttled",
            Self::NotFound => "not-found",
            Self::Conflict => "conflict",
            Self::ServerError => "server-error",
            Self::Network => "network",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    count: u64,
    total: Duration,
}

/// Per-call latency/error-class counters for a single `CloudAdapter`.
#[derive(Default)]
pub struct AdapterMetrics {
    by_class: Mutex<HashMap<ErrorClass, Tally>>,
}

impl AdapterMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, class: ErrorClass, elapsed: Duration) {
        let mut by_class = self.by_class.lock();
        let tally = by_class.entry(class).or_default();
        tally.count += 1;
        tally.total += elapsed;
    }

    /// Point-in-time dump for diagnostics/logging.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Snapshot> {
        self.by_class
            .lock()
            .iter()
            .map(|(class, tally)| Snapshot {
                class: *class,
                count: tally.count,
                total: tally.total,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub class: ErrorClass,
    pub count: u64,
    pub total: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_class() {
        let metrics = AdapterMetrics::new();
        metrics.record(ErrorClass::Ok, Duration::from_millis(10));
        metrics.record(ErrorClass::Ok, Duration::from_millis(20));
        metrics.record(ErrorClass::Throttled, Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        let ok = snapshot.iter().find(|s| s.class == ErrorClass::Ok).unwrap();
        assert_eq!(ok.count, 2);
        assert_eq!(ok.total, Duration::from_millis(30));

        let throttled = snapshot
            .iter()
            .find(|s| s.class == ErrorClass::Throttled)
            .unwrap();
        assert_eq!(throttled.count, 1);
    }
}
