//! Pool gauges reported through `collect_metrics`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Gauges a channel pool can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PoolMetric {
    /// Streams that could still be opened on tracked connections
    AvailableConcurrency,
    /// Channels currently handed out
    LeasedConcurrency,
    /// Acquires waiting for a free channel
    PendingConcurrencyAcquires,
    /// Configured upper bound on concurrent channels
    MaxConcurrency,
}

impl fmt::Display for PoolMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolMetric::AvailableConcurrency => "AvailableConcurrency",
            PoolMetric::LeasedConcurrency => "LeasedConcurrency",
            PoolMetric::PendingConcurrencyAcquires => "PendingConcurrencyAcquires",
            PoolMetric::MaxConcurrency => "MaxConcurrency",
        };
        f.write_str(name)
    }
}

/// Sink for pool gauges
pub trait MetricCollector: Send {
    fn report(&mut self, metric: PoolMetric, value: u64);
}

/// Point-in-time copy of the reported gauges
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    values: BTreeMap<PoolMetric, u64>,
}

impl MetricSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, metric: PoolMetric) -> Option<u64> {
        self.values.get(&metric).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PoolMetric, u64)> + '_ {
        self.values.iter().map(|(metric, value)| (*metric, *value))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl MetricCollector for MetricSnapshot {
    fn report(&mut self, metric: PoolMetric, value: u64) {
        self.values.insert(metric, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_keeps_latest_value() {
        let mut snapshot = MetricSnapshot::new();
        assert!(snapshot.is_empty());

        snapshot.report(PoolMetric::AvailableConcurrency, 10);
        snapshot.report(PoolMetric::AvailableConcurrency, 7);
        snapshot.report(PoolMetric::MaxConcurrency, 50);

        assert_eq!(snapshot.get(PoolMetric::AvailableConcurrency), Some(7));
        assert_eq!(snapshot.get(PoolMetric::LeasedConcurrency), None);
        assert_eq!(snapshot.iter().count(), 2);
    }

    #[test]
    fn test_snapshot_serializes_by_name() {
        let mut snapshot = MetricSnapshot::new();
        snapshot.report(PoolMetric::LeasedConcurrency, 3);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert_eq!(json, r#"{"values":{"LeasedConcurrency":3}}"#);
    }
}
