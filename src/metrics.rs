//! Per-operation timing counters

use dashmap::DashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Aggregated timings for one operation name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl OpStats {
    fn record(&mut self, elapsed: Duration) {
        if self.count == 0 || elapsed < self.min {
            self.min = elapsed;
        }
        if elapsed > self.max {
            self.max = elapsed;
        }
        self.count += 1;
        self.total += elapsed;
    }

    /// Mean duration, zero when nothing was recorded
    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }
}

impl fmt::Display for OpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "count={} avg={:.2}ms min={}ms max={}ms total={}ms",
            self.count,
            self.average().as_secs_f64() * 1_000.0,
            self.min.as_millis(),
            self.max.as_millis(),
            self.total.as_millis()
        )
    }
}

/// Timing registry shared by the persister, coordinator and auto-saver
#[derive(Debug, Default)]
pub struct Metrics {
    ops: DashMap<String, OpStats>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one execution of `op`
    pub fn record(&self, op: &str, elapsed: Duration) {
        if let Some(mut stats) = self.ops.get_mut(op) {
            stats.record(elapsed);
            return;
        }
        self.ops.entry(op.to_string()).or_default().record(elapsed);
    }

    /// Record the time since `started`
    pub fn record_since(&self, op: &str, started: Instant) {
        self.record(op, started.elapsed());
    }

    pub fn get(&self, op: &str) -> Option<OpStats> {
        self.ops.get(op).map(|s| *s.value())
    }

    /// All operations sorted by name
    pub fn snapshot(&self) -> Vec<(String, OpStats)> {
        let mut all: Vec<_> = self
            .ops
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn reset(&self) {
        self.ops.clear();
    }
}
