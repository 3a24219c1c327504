//! Monotonic counters exposed to external metric collectors.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time copy of a counter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub values: BTreeMap<String, u64>,
    pub time: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    /// Folds `other` into this snapshot, prefixing its keys.
    pub fn merge(&mut self, prefix: &str, other: MetricsSnapshot) {
        for (key, value) in other.values {
            self.values.insert(format!("{prefix}.{key}"), value);
        }
    }
}

/// A fixed set of named counters.
///
/// Names are declared up front; the set never grows at runtime so lookups
/// stay lock-free.
#[derive(Debug)]
pub struct Counters {
    counters: Vec<(&'static str, AtomicU64)>,
}

impl Counters {
    pub fn new(names: &[&'static str]) -> Self {
        Self {
            counters: names.iter().map(|n| (*n, AtomicU64::new(0))).collect(),
        }
    }

    fn counter(&self, name: &str) -> Option<&AtomicU64> {
        self.counters
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| c)
    }

    pub fn add(&self, name: &str, amount: u64) {
        match self.counter(name) {
            Some(counter) => {
                counter.fetch_add(amount, Ordering::Relaxed);
            }
            None => debug_assert!(false, "undeclared counter {name}"),
        }
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counter(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Reads every counter without resetting it.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.collect(|c| c.load(Ordering::Relaxed))
    }

    /// Reads every counter and resets it to zero.
    pub fn take(&self) -> MetricsSnapshot {
        self.collect(|c| c.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> MetricsSnapshot {
        MetricsSnapshot {
            values: self
                .counters
                .iter()
                .map(|(name, counter)| (name.to_string(), read(counter)))
                .collect(),
            time: Utc::now(),
        }
    }
}
