//! [`Watchdog`] – per-source staleness monitor.
//!
//! Every good reading from a hardware source counts as a heartbeat. The
//! aggregator records heartbeats by tick number and, once a source has been
//! silent for more than its allowance of ticks, lists it in the snapshot's
//! `stale_sources`.
//!
//! Counting ticks instead of wall-clock time keeps staleness independent of
//! scheduling jitter: `stale_after_ticks` missed ticks at the configured
//! interval is the same deadline as `stale_after_ticks × interval`.

use std::collections::BTreeMap;

/// Health state reported for a single source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Healthy,
    /// No good reading within the allowance.
    Stale,
}

struct ComponentEntry {
    last_heartbeat: u64,
    max_silent_ticks: u64,
}

/// Tracks heartbeats from registered sources.
///
/// # Example
///
/// ```
/// use evdash_kernel::watchdog::{ComponentHealth, Watchdog};
///
/// let mut wd = Watchdog::new();
/// wd.register("gnss", 0, 5);
/// wd.heartbeat("gnss", 3);
///
/// assert_eq!(wd.health("gnss", 8), ComponentHealth::Healthy);
/// assert_eq!(wd.health("gnss", 9), ComponentHealth::Stale);
/// ```
#[derive(Default)]
pub struct Watchdog {
    components: BTreeMap<String, ComponentEntry>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` at tick `now`; it starts healthy.  Re-registering
    /// resets the deadline.
    pub fn register(&mut self, id: &str, now: u64, max_silent_ticks: u64) {
        self.components.insert(
            id.to_string(),
            ComponentEntry {
                last_heartbeat: now,
                max_silent_ticks,
            },
        );
    }

    /// No-op for unregistered ids.
    pub fn heartbeat(&mut self, id: &str, now: u64) {
        if let Some(entry) = self.components.get_mut(id) {
            entry.last_heartbeat = entry.last_heartbeat.max(now);
        }
    }

    /// Unknown ids are reported as [`ComponentHealth::Stale`].
    pub fn health(&self, id: &str, now: u64) -> ComponentHealth {
        match self.components.get(id) {
            Some(entry) if !entry.is_stale(now) => ComponentHealth::Healthy,
            _ => ComponentHealth::Stale,
        }
    }

    /// Ids of every stale source, sorted.
    pub fn stale(&self, now: u64) -> Vec<String> {
        self.components
            .iter()
            .filter(|(_, entry)| entry.is_stale(now))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl ComponentEntry {
    fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) > self.max_silent_ticks
    }
}
