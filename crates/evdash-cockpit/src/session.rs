//! [`ClientSession`] – per-connection state and outbound queue.
//!
//! Outbound frames are split into two bounded lanes:
//!
//! | Lane | Contents | When full |
//! |---|---|---|
//! | control | welcome, command responses, error frames | session is closed |
//! | telemetry | serialized snapshots | oldest snapshot is dropped |
//!
//! The writer always drains the control lane first, so a response is never
//! stuck behind telemetry. Telemetry enqueues with a sequence number at or
//! below the last one enqueued are ignored, so a client only ever skips
//! forward.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use evdash_types::{EvError, ServerMessage};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Snapshots buffered per client before the oldest is dropped.
    pub queue_capacity: usize,
    /// Responses buffered per client before the session is closed.
    pub control_capacity: usize,
    /// Commands accepted per second per client.
    pub command_rate_limit: NonZeroU32,
    /// Largest inbound text frame accepted.
    pub max_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            control_capacity: 64,
            command_rate_limit: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            max_message_bytes: 64 * 1024,
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    /// No new telemetry accepted. Replies to commands already in flight are
    /// still queued, and everything queued is written before the end.
    Draining,
    Closed,
}

#[derive(Default)]
struct Lanes {
    control: VecDeque<Utf8Bytes>,
    telemetry: VecDeque<Utf8Bytes>,
    last_seq: Option<u64>,
}

pub struct ClientSession {
    id: Uuid,
    peer: SocketAddr,
    config: SessionConfig,
    lanes: Mutex<Lanes>,
    notify: Notify,
    draining: AtomicBool,
    closed: AtomicBool,
    dropped: AtomicU64,
    limiter: DefaultDirectRateLimiter,
    cancel: CancellationToken,
}

impl ClientSession {
    /// Create a session whose tasks stop when `parent` is cancelled.
    ///
    /// `parent` is a hard stop. A graceful shutdown calls [`drain`] instead.
    ///
    /// [`drain`]: Self::drain
    pub fn new(peer: SocketAddr, config: SessionConfig, parent: &CancellationToken) -> Self {
        let limiter = RateLimiter::direct(Quota::per_second(config.command_rate_limit));
        Self {
            id: Uuid::new_v4(),
            peer,
            config,
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            limiter,
            cancel: parent.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.draining.load(Ordering::Acquire) {
            SessionState::Draining
        } else {
            SessionState::Streaming
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Snapshots dropped for this client so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Fires when the session closes or the server shuts down.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    fn lanes(&self) -> std::sync::MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a serialized snapshot.  Returns `false` if it was not queued.
    pub fn push_telemetry(&self, seq: u64, frame: Utf8Bytes) -> bool {
        if !self.is_open() {
            return false;
        }
        {
            let mut lanes = self.lanes();
            if lanes.last_seq.is_some_and(|last| seq <= last) {
                return false;
            }
            if lanes.telemetry.len() >= self.config.queue_capacity.max(1) {
                lanes.telemetry.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(session = %self.id, seq, total, "slow client: dropped oldest snapshot");
            }
            lanes.telemetry.push_back(frame);
            lanes.last_seq = Some(seq);
        }
        self.notify.notify_one();
        true
    }

    /// Queue a control frame.
    ///
    /// # Errors
    ///
    /// Returns [`EvError::Channel`] if the session is closed or the control
    /// lane is full; a full lane also closes the session. A draining session
    /// still takes control frames.
    pub fn push_control(&self, message: &ServerMessage) -> Result<(), EvError> {
        let json = message.to_json()?;
        self.push_control_text(json)
    }

    fn push_control_text(&self, json: String) -> Result<(), EvError> {
        if self.state() == SessionState::Closed {
            return Err(EvError::Channel(format!("session {} is closing", self.id)));
        }
        let overflow = {
            let mut lanes = self.lanes();
            if lanes.control.len() >= self.config.control_capacity.max(1) {
                true
            } else {
                lanes.control.push_back(Utf8Bytes::from(json));
                false
            }
        };
        if overflow {
            warn!(session = %self.id, peer = %self.peer, "control lane overflow; closing session");
            self.close();
            return Err(EvError::Channel(format!(
                "session {} control lane overflow",
                self.id
            )));
        }
        self.notify.notify_one();
        Ok(())
    }

    /// `true` if another command fits in this second's quota.
    pub fn allow_command(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for the next frame to write.
    ///
    /// Returns `None` once the session is closed, or once it is draining and
    /// both lanes are empty.
    pub async fn next_outbound(&self) -> Option<Utf8Bytes> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            {
                let mut lanes = self.lanes();
                if let Some(frame) = lanes.control.pop_front() {
                    return Some(frame);
                }
                if let Some(frame) = lanes.telemetry.pop_front() {
                    return Some(frame);
                }
            }
            if self.draining.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    /// Stop accepting frames but let the writer flush what is queued.
    pub fn drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            debug!(session = %self.id, "session draining");
            self.notify.notify_one();
        }
    }

    /// Close immediately and release the queues.  Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.draining.store(true, Ordering::Release);
        {
            let mut lanes = self.lanes();
            lanes.control.clear();
            lanes.telemetry.clear();
        }
        self.cancel.cancel();
        self.notify.notify_one();
        debug!(session = %self.id, peer = %self.peer, "session closed");
    }
}
