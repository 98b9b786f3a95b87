//! Per-group scaling counters.
//!
//! Cheap atomics bumped from the decision loop and read out as snapshots
//! for the tick summary log line.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Counters for one group. Fields are bumped directly with
/// `fetch_add(1, Ordering::Relaxed)` from the decision loop.
#[derive(Debug, Default)]
pub struct GroupCounters {
    pub scale_up_attempts: AtomicU64,
    pub scale_up_successes: AtomicU64,
    pub scale_down_attempts: AtomicU64,
    pub scale_down_successes: AtomicU64,
    pub throttle_events: AtomicU64,
    pub fatal_errors: AtomicU64,
}

/// Point-in-time copy of one group's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub scale_up_attempts: u64,
    pub scale_up_successes: u64,
    pub scale_down_attempts: u64,
    pub scale_down_successes: u64,
    pub throttle_events: u64,
    pub fatal_errors: u64,
}

/// Registry of counters across all groups.
#[derive(Debug, Default)]
pub struct CounterBoard {
    groups: RwLock<HashMap<String, Arc<GroupCounters>>>,
}

impl CounterBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for a group, created on first access.
    pub fn group(&self, name: &str) -> Arc<GroupCounters> {
        if let Some(counters) = self.groups.read().unwrap().get(name) {
            return counters.clone();
        }
        let mut groups = self.groups.write().unwrap();
        groups
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(GroupCounters::default()))
            .clone()
    }

    /// Sorted snapshot of every group's counters.
    pub fn snapshot(&self) -> Vec<(String, CounterSnapshot)> {
        let groups = self.groups.read().unwrap();
        let mut out: Vec<(String, CounterSnapshot)> = groups
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    CounterSnapshot {
                        scale_up_attempts: c.scale_up_attempts.load(Ordering::Relaxed),
                        scale_up_successes: c.scale_up_successes.load(Ordering::Relaxed),
                        scale_down_attempts: c.scale_down_attempts.load(Ordering::Relaxed),
                        scale_down_successes: c.scale_down_successes.load(Ordering::Relaxed),
                        throttle_events: c.throttle_events.load(Ordering::Relaxed),
                        fatal_errors: c.fatal_errors.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
