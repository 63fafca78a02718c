//! `evdash-middleware` – snapshot distribution
//!
//! Moves immutable snapshots from the aggregator to every reader without any
//! reader holding a lock on the canonical state.
//!
//! # Modules
//!
//! - [`bus`] – single-writer [`SnapshotPublisher`] and multi-reader
//!   [`SnapshotBus`] built on Tokio watch/broadcast channels.
//! - [`history`] – [`SnapshotHistory`] ring buffer and its recorder task.

pub mod bus;
pub mod history;

pub use bus::{DEFAULT_CAPACITY, SnapshotBus, SnapshotPublisher, SnapshotReceiver, snapshot_channel};
pub use history::{DEFAULT_HISTORY_SIZE, SnapshotHistory, record};
