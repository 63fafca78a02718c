//! `evdash-cockpit` – the client-facing WebSocket server.
//!
//! Boots an HTTP + WebSocket listener (default port `8765`) that:
//!
//! 1. **Streams** every published [`VehicleSnapshot`] to every connected
//!    client as a `telemetry` frame. Each snapshot is serialized once and the
//!    frame is shared by all sessions.
//!
//! 2. **Accepts** command frames from clients, runs them through the
//!    [`CommandDispatcher`] and replies to the sender only.
//!
//! 3. **Answers** `GET /health` and `GET /history` for plain HTTP callers.
//!
//! Slow clients never stall the rest: each [`ClientSession`] keeps a small
//! bounded telemetry queue and drops its oldest snapshot when full.
//!
//! [`VehicleSnapshot`]: evdash_types::VehicleSnapshot
//! [`CommandDispatcher`]: evdash_kernel::CommandDispatcher

pub mod server;
pub mod session;

pub use server::{BoundServer, BroadcastServer, DEFAULT_PORT, ServerConfig};
pub use session::{ClientSession, SessionConfig, SessionState};
