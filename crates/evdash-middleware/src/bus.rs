//! Single-writer, multi-reader snapshot bus.
//!
//! The aggregator owns the only [`SnapshotPublisher`]. Every other component
//! holds a cheap [`SnapshotBus`] clone and either reads the latest snapshot
//! or subscribes to the stream of new ones.
//!
//! Snapshots travel as `Arc<VehicleSnapshot>`: readers receive a reference
//! to a point-in-time value that is never mutated after publication.
//!
//! | Access | Semantics |
//! |---|---|
//! | [`SnapshotBus::latest`] | Most recent snapshot, always available. |
//! | [`SnapshotBus::subscribe`] | Every snapshot in order; a lagging reader skips forward. |

use std::sync::Arc;

use evdash_types::{EvError, VehicleSnapshot};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Default number of snapshots buffered for slow subscribers.
pub const DEFAULT_CAPACITY: usize = 16;

/// Create a bus seeded with `initial`.
pub fn snapshot_channel(
    initial: VehicleSnapshot,
    capacity: usize,
) -> (SnapshotPublisher, SnapshotBus) {
    let (latest_tx, latest_rx) = watch::channel(Arc::new(initial));
    let (stream_tx, _) = broadcast::channel(capacity.max(1));
    let bus = SnapshotBus {
        latest: latest_rx,
        stream: stream_tx.clone(),
    };
    let publisher = SnapshotPublisher {
        latest: latest_tx,
        stream: stream_tx,
    };
    (publisher, bus)
}

/// The write side.  Deliberately not `Clone`.
#[derive(Debug)]
pub struct SnapshotPublisher {
    latest: watch::Sender<Arc<VehicleSnapshot>>,
    stream: broadcast::Sender<Arc<VehicleSnapshot>>,
}

impl SnapshotPublisher {
    /// Publish a new snapshot and return the shared handle to it.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Channel`] if `snapshot.seq` does not advance past
    /// the currently published sequence number.
    pub fn publish(&self, snapshot: VehicleSnapshot) -> Result<Arc<VehicleSnapshot>, EvError> {
        let current = self.latest.borrow().seq;
        if snapshot.seq <= current {
            return Err(EvError::Channel(format!(
                "snapshot seq {} does not advance past {current}",
                snapshot.seq
            )));
        }

        let snapshot = Arc::new(snapshot);
        self.latest.send_replace(Arc::clone(&snapshot));
        // No subscribers is a normal condition.
        let receivers = self.stream.send(Arc::clone(&snapshot)).unwrap_or(0);
        debug!(seq = snapshot.seq, receivers, "snapshot published");
        Ok(snapshot)
    }

    pub fn latest(&self) -> Arc<VehicleSnapshot> {
        Arc::clone(&self.latest.borrow())
    }
}

/// The read side.  Clone it freely.
#[derive(Clone, Debug)]
pub struct SnapshotBus {
    latest: watch::Receiver<Arc<VehicleSnapshot>>,
    stream: broadcast::Sender<Arc<VehicleSnapshot>>,
}

impl SnapshotBus {
    /// The most recently published snapshot (or the seed value).
    pub fn latest(&self) -> Arc<VehicleSnapshot> {
        Arc::clone(&self.latest.borrow())
    }

    pub fn subscribe(&self) -> SnapshotReceiver {
        SnapshotReceiver {
            stream: self.stream.subscribe(),
            closed: self.latest.clone(),
        }
    }

    /// Number of live stream subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.stream.receiver_count()
    }
}

/// Ordered stream of published snapshots.
pub struct SnapshotReceiver {
    stream: broadcast::Receiver<Arc<VehicleSnapshot>>,
    closed: watch::Receiver<Arc<VehicleSnapshot>>,
}

impl SnapshotReceiver {
    /// Wait for the next snapshot.
    ///
    /// A receiver that fell behind skips the snapshots it missed and resumes
    /// with the oldest one still buffered, so sequence numbers only ever move
    /// forward.  Returns `None` once the publisher is dropped and every
    /// buffered snapshot has been delivered.
    pub async fn recv(&mut self) -> Option<Arc<VehicleSnapshot>> {
        loop {
            tokio::select! {
                biased;
                result = self.stream.recv() => match result {
                    Ok(snapshot) => return Some(snapshot),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "snapshot subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        // Publisher gone; deliver anything still buffered.
                        return match self.stream.try_recv() {
                            Ok(snapshot) => Some(snapshot),
                            Err(_) => None,
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn snapshot(seq: u64) -> VehicleSnapshot {
        VehicleSnapshot {
            seq,
            ..VehicleSnapshot::default()
        }
    }

    #[test]
    fn latest_starts_with_seed() {
        let (_publisher, bus) = snapshot_channel(snapshot(0), DEFAULT_CAPACITY);
        assert_eq!(bus.latest().seq, 0);
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let (publisher, bus) = snapshot_channel(snapshot(0), DEFAULT_CAPACITY);
        let mut rx = bus.subscribe();

        let sent = publisher.publish(snapshot(1))?;
        let received = rx.recv().await.ok_or("bus closed")?;
        assert!(Arc::ptr_eq(&sent, &received));
        assert_eq!(bus.latest().seq, 1);
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_share_the_same_value() -> Result<(), Box<dyn std::error::Error>> {
        let (publisher, bus) = snapshot_channel(snapshot(0), DEFAULT_CAPACITY);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.clone().subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        publisher.publish(snapshot(1))?;
        let a = rx1.recv().await.ok_or("closed")?;
        let b = rx2.recv().await.ok_or("closed")?;
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }

    #[test]
    fn non_advancing_seq_is_refused() {
        let (publisher, bus) = snapshot_channel(snapshot(0), DEFAULT_CAPACITY);
        publisher.publish(snapshot(3)).unwrap();
        assert!(matches!(
            publisher.publish(snapshot(3)),
            Err(EvError::Channel(_))
        ));
        assert!(publisher.publish(snapshot(2)).is_err());
        assert_eq!(bus.latest().seq, 3);
    }

    #[tokio::test]
    async fn lagging_subscriber_only_skips_forward() {
        let (publisher, bus) = snapshot_channel(snapshot(0), 4);
        let mut rx = bus.subscribe();
        for seq in 1..=20 {
            publisher.publish(snapshot(seq)).unwrap();
        }

        let mut last = 0;
        for _ in 0..4 {
            let s = rx.recv().await.unwrap();
            assert!(s.seq > last);
            last = s.seq;
        }
        assert_eq!(last, 20);
    }

    #[tokio::test]
    async fn dropping_publisher_closes_after_drain() {
        let (publisher, bus) = snapshot_channel(snapshot(0), DEFAULT_CAPACITY);
        let mut rx = bus.subscribe();
        publisher.publish(snapshot(1)).unwrap();
        drop(publisher);

        assert_eq!(rx.recv().await.map(|s| s.seq), Some(1));
        let end = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("recv must not hang after close");
        assert!(end.is_none());
    }
}
