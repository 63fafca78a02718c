//! In-memory ring buffer of recent snapshots.
//!
//! The only persistence the system has: [`record`] follows the bus and keeps
//! the last `capacity` snapshots for the `/history` endpoint and for
//! post-mortem inspection.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use evdash_types::{EvError, VehicleSnapshot};
use tracing::{debug, info};

use crate::bus::SnapshotReceiver;

/// Default number of snapshots retained (five minutes at 1 Hz).
pub const DEFAULT_HISTORY_SIZE: usize = 300;

#[derive(Clone, Debug)]
pub struct SnapshotHistory {
    inner: Arc<RwLock<VecDeque<Arc<VehicleSnapshot>>>>,
    capacity: usize,
}

impl Default for SnapshotHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl SnapshotHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a snapshot, evicting the oldest once full.
    pub fn push(&self, snapshot: Arc<VehicleSnapshot>) {
        let mut buf = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(snapshot);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest-first copy of the buffered handles.
    pub fn entries(&self) -> Vec<Arc<VehicleSnapshot>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn latest_seq(&self) -> Option<u64> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .back()
            .map(|s| s.seq)
    }

    /// Serialize the buffer as a JSON array, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Serialization`] if a snapshot cannot be encoded.
    pub fn to_json(&self) -> Result<String, EvError> {
        let entries = self.entries();
        let refs: Vec<&VehicleSnapshot> = entries.iter().map(Arc::as_ref).collect();
        Ok(serde_json::to_string(&refs)?)
    }
}

/// Record every snapshot from `rx` into `history` until the bus closes.
pub async fn record(mut rx: SnapshotReceiver, history: SnapshotHistory) {
    info!(capacity = history.capacity(), "history recorder started");
    while let Some(snapshot) = rx.recv().await {
        debug!(seq = snapshot.seq, "snapshot recorded");
        history.push(snapshot);
    }
    info!(retained = history.len(), "history recorder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::snapshot_channel;

    fn snapshot(seq: u64) -> Arc<VehicleSnapshot> {
        Arc::new(VehicleSnapshot {
            seq,
            ..VehicleSnapshot::default()
        })
    }

    #[test]
    fn evicts_oldest_when_full() {
        let history = SnapshotHistory::new(3);
        for seq in 1..=5 {
            history.push(snapshot(seq));
        }
        let seqs: Vec<u64> = history.entries().iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(history.latest_seq(), Some(5));
    }

    #[test]
    fn empty_history_serializes_to_empty_array() {
        let history = SnapshotHistory::default();
        assert!(history.is_empty());
        assert_eq!(history.to_json().unwrap(), "[]");
    }

    #[test]
    fn json_is_an_array_of_snapshots() {
        let history = SnapshotHistory::new(10);
        history.push(snapshot(7));
        let value: serde_json::Value = serde_json::from_str(&history.to_json().unwrap()).unwrap();
        assert_eq!(value[0]["seq"], 7);
        assert!(value[0]["settings"].is_object());
    }

    #[tokio::test]
    async fn recorder_follows_the_bus() {
        let (publisher, bus) = snapshot_channel(VehicleSnapshot::default(), 8);
        let history = SnapshotHistory::new(10);
        let task = tokio::spawn(record(bus.subscribe(), history.clone()));

        for seq in 1..=3 {
            publisher
                .publish(VehicleSnapshot {
                    seq,
                    ..VehicleSnapshot::default()
                })
                .unwrap();
        }
        drop(publisher);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest_seq(), Some(3));
    }
}
