//! `evdash-client` – resilient consumer side of the telemetry stream.
//!
//! [`ConnectionManager`] keeps a WebSocket connection to the backend and
//! republishes its snapshots. When the server is unreachable it substitutes a
//! locally generated synthetic feed, so subscribers always receive one
//! snapshot per tick.

pub mod manager;

pub use manager::{
    ClientConfig, ConnectionManager, ConnectionState, FeedItem, FeedOrigin, SendOutcome,
};
