use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

/// Cumulative drop signals for one queue.
///
/// `overruns` counts how often a blocking queue was found full by its
/// producer. `evictions` counts buffers a leaky queue discarded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DropCounters {
    pub overruns: u64,
    pub evictions: u64,
}

/// Thread-safe per-queue counters, fed from queue callbacks on worker
/// threads and read by the periodic reporter.
#[derive(Debug, Default)]
pub struct QueueMonitor {
    counters: Mutex<BTreeMap<String, DropCounters>>,
}

impl QueueMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a queue show up in snapshots even before it ever drops.
    pub fn register(&self, name: &str) {
        self.with_counters(|map| {
            map.entry(name.to_string()).or_default();
        });
    }

    pub fn record_overrun(&self, name: &str) {
        self.with_counters(|map| {
            map.entry(name.to_string()).or_default().overruns += 1;
        });
    }

    pub fn record_evictions(&self, name: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.with_counters(|map| {
            map.entry(name.to_string()).or_default().evictions += count;
        });
    }

    pub fn snapshot(&self) -> BTreeMap<String, DropCounters> {
        self.with_counters(|map| map.clone())
    }

    fn with_counters<R>(&self, f: impl FnOnce(&mut BTreeMap<String, DropCounters>) -> R) -> R {
        let mut guard = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

/// Drops seen since the previous report. Only queues with a non-zero delta
/// are listed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DropReport {
    pub overruns: BTreeMap<String, u64>,
    pub evictions: BTreeMap<String, u64>,
}

impl DropReport {
    pub fn is_empty(&self) -> bool {
        self.overruns.is_empty() && self.evictions.is_empty()
    }
}

/// Turns cumulative snapshots into per-interval deltas.
#[derive(Debug, Default)]
pub struct DropReporter {
    baseline: BTreeMap<String, DropCounters>,
}

impl DropReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs `snapshot` against the last one seen and advances the baseline.
    pub fn report(&mut self, snapshot: &BTreeMap<String, DropCounters>) -> DropReport {
        let mut report = DropReport::default();
        for (name, now) in snapshot {
            let before = self.baseline.get(name).copied().unwrap_or_default();
            let overruns = now.overruns.saturating_sub(before.overruns);
            let evictions = now.evictions.saturating_sub(before.evictions);
            if overruns > 0 {
                log::info!("queue {} overran {} times in the last interval", name, overruns);
                report.overruns.insert(name.clone(), overruns);
            }
            if evictions > 0 {
                log::info!("queue {} evicted {} buffers in the last interval", name, evictions);
                report.evictions.insert(name.clone(), evictions);
            }
        }
        self.baseline = snapshot.clone();
        report
    }
}
